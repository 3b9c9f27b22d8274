use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{self, Write};

use camino::Utf8PathBuf;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::batch::BatchReport;
use crate::config::StudyConfig;
use crate::pipeline::PipelineReport;
use crate::runner::{StageResult, StageState, StageStatus};
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Serialize)]
pub struct StageResultView {
    pub stage: String,
    pub status: StageStatus,
    pub exit_code: Option<i32>,
    pub log: Option<Utf8PathBuf>,
    pub error: Option<String>,
}

impl From<&StageResult> for StageResultView {
    fn from(result: &StageResult) -> Self {
        Self {
            stage: result.stage.clone(),
            status: result.status,
            exit_code: result.exit_code,
            log: result.log_path.clone(),
            error: result.error.as_ref().map(|err| err.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PipelineView {
    pub unit: String,
    pub success: bool,
    pub stages: Vec<StageResultView>,
}

impl From<&PipelineReport> for PipelineView {
    fn from(report: &PipelineReport) -> Self {
        Self {
            unit: report.unit.clone(),
            success: report.is_success(),
            stages: report.results.iter().map(StageResultView::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchUnitView {
    pub unit: String,
    pub success: bool,
    pub stages: Vec<StageResultView>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchView {
    pub total: usize,
    pub failed: usize,
    pub units: Vec<BatchUnitView>,
}

impl From<&BatchReport> for BatchView {
    fn from(report: &BatchReport) -> Self {
        Self {
            total: report.total(),
            failed: report.failed(),
            units: report
                .entries
                .iter()
                .map(|entry| BatchUnitView {
                    unit: entry.label(),
                    success: !entry.is_failed(),
                    stages: entry
                        .report
                        .iter()
                        .flat_map(|report| report.results.iter())
                        .map(StageResultView::from)
                        .collect(),
                    error: entry.error.as_ref().map(|err| err.to_string()),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StageStateView {
    pub stage: String,
    pub state: &'static str,
    pub details: Vec<String>,
}

impl StageStateView {
    pub fn new(stage: &str, state: &StageState) -> Self {
        let (label, details) = match state {
            StageState::Complete => ("complete", Vec::new()),
            StageState::Pending(pending) => ("pending", pending.clone()),
            StageState::Blocked(missing) => ("blocked", missing.clone()),
        };
        Self {
            stage: stage.to_string(),
            state: label,
            details,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub study: ConfigView,
    pub unit: Option<String>,
    pub stages: Vec<StageStateView>,
}

#[derive(Debug, Serialize)]
pub struct ConfigView {
    pub root: Utf8PathBuf,
    pub config: Utf8PathBuf,
    pub heuristic: Utf8PathBuf,
    pub heuristic_found: bool,
    pub epi_ap_phase_enc_dir: String,
    pub orientation: String,
    pub slice_order: String,
    pub slice_direction: u8,
    pub b1_after: String,
    pub b1_acq: String,
    pub total_readout_time: Option<f64>,
    pub fieldmap_units: String,
    pub use_docker: bool,
    pub validator_image: String,
    pub mriqc_image: String,
    pub tool_timeouts: BTreeMap<String, u64>,
    pub extras: Map<String, Value>,
}

impl From<&StudyConfig> for ConfigView {
    fn from(config: &StudyConfig) -> Self {
        Self {
            root: config.root.clone(),
            config: config.config_path.clone(),
            heuristic: config.heuristic.clone(),
            heuristic_found: config.heuristic.as_std_path().is_file(),
            epi_ap_phase_enc_dir: config.epi_ap_phase_enc_dir.to_string(),
            orientation: config.orientation.to_string(),
            slice_order: config.slice_order.to_string(),
            slice_direction: config.slice_direction.get(),
            b1_after: config.b1_after.clone(),
            b1_acq: config.b1_acq.clone(),
            total_readout_time: config.total_readout_time,
            fieldmap_units: config.fieldmap_units.clone(),
            use_docker: config.use_docker,
            validator_image: config.validator_image.clone(),
            mriqc_image: config.mriqc_image.clone(),
            tool_timeouts: config.tool_timeouts.clone(),
            extras: config.extras.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InitView {
    pub settings: Utf8PathBuf,
    pub active_config: Option<String>,
    pub registered_at: Option<String>,
    pub study: ConfigView,
}

impl InitView {
    pub fn new(settings_path: Utf8PathBuf, settings: &Settings, config: &StudyConfig) -> Self {
        Self {
            settings: settings_path,
            active_config: settings.active_config.clone(),
            registered_at: settings.registered_at.clone(),
            study: ConfigView::from(config),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TemplatesView {
    pub root: Utf8PathBuf,
    pub files: Vec<String>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct HumanOutput;

impl HumanOutput {
    pub fn print_pipeline(view: &PipelineView) {
        println!("{CYAN}{}{RESET}", view.unit);
        for stage in &view.stages {
            Self::print_stage(stage);
        }
        if view.success {
            println!("{GREEN}all stages complete{RESET}");
        }
    }

    pub fn print_batch(view: &BatchView) {
        for unit in &view.units {
            println!("{CYAN}{}{RESET}", unit.unit);
            for stage in &unit.stages {
                Self::print_stage(stage);
            }
            if unit.stages.is_empty() {
                if let Some(error) = &unit.error {
                    println!("{RED}  rejected: {error}{RESET}");
                }
            }
        }
        let color = if view.failed == 0 { GREEN } else { YELLOW };
        println!(
            "{color}{} units, {} failed{RESET}",
            view.total, view.failed
        );
    }

    pub fn print_status(view: &StatusView) {
        print!("{}", Self::render_status(view));
    }

    /// The study configuration, then one line per stage when a unit was given.
    pub fn render_status(view: &StatusView) -> String {
        let study = &view.study;
        let mut out = String::new();
        let _ = writeln!(out, "{CYAN}study {}{RESET}", study.root);
        let _ = writeln!(out, "  config:           {}", study.config);
        let (mark, color) = if study.heuristic_found {
            ("ok", GREEN)
        } else {
            ("NOT FOUND", RED)
        };
        let _ = writeln!(out, "  heuristic:        {} {color}[{mark}]{RESET}", study.heuristic);
        let _ = writeln!(out, "  ap phase enc dir: {}", study.epi_ap_phase_enc_dir);
        let _ = writeln!(out, "  orientation:      {}", study.orientation);
        let _ = writeln!(
            out,
            "  slice timing:     {} along axis {}",
            study.slice_order, study.slice_direction
        );
        let _ = writeln!(out, "  b1:               acq-{} after {}", study.b1_acq, study.b1_after);
        if let Some(trt) = study.total_readout_time {
            let _ = writeln!(out, "  readout time:     {trt}");
        }
        let _ = writeln!(out, "  fieldmap units:   {}", study.fieldmap_units);
        let _ = writeln!(
            out,
            "  containers:       {} / {}{}",
            study.validator_image,
            study.mriqc_image,
            if study.use_docker { " (heudiconv in docker)" } else { "" }
        );
        for (stage, seconds) in &study.tool_timeouts {
            let _ = writeln!(out, "  timeout:          {stage} {seconds}s");
        }
        for (key, value) in &study.extras {
            let _ = writeln!(out, "  {key}: {value}");
        }

        if let Some(unit) = &view.unit {
            let _ = writeln!(out, "{CYAN}{unit}{RESET}");
            for stage in &view.stages {
                let color = match stage.state {
                    "complete" => GREEN,
                    "pending" => YELLOW,
                    _ => RED,
                };
                let _ = writeln!(out, "{color}  {:<12} {}{RESET}", stage.stage, stage.state);
                for detail in &stage.details {
                    let _ = writeln!(out, "      {detail}");
                }
            }
        }
        out
    }

    pub fn print_init(view: &InitView) {
        println!("{GREEN}registered {}{RESET}", view.study.config);
        println!("  study root:  {}", view.study.root);
        println!("  heuristic:   {}", view.study.heuristic);
        println!("  orientation: {}", view.study.orientation);
        println!("  settings:    {}", view.settings);
    }

    pub fn print_templates(view: &TemplatesView) {
        println!("{CYAN}top-level files in {}/rawdata{RESET}", view.root);
        for file in &view.files {
            println!("{GREEN}  {file}{RESET}");
        }
    }

    fn print_stage(stage: &StageResultView) {
        let (label, color) = match stage.status {
            StageStatus::Success => ("done", GREEN),
            StageStatus::Skipped => ("skipped", CYAN),
            StageStatus::Failed => ("FAILED", RED),
        };
        println!("{color}  {:<12} {label}{RESET}", stage.stage);
        if let Some(error) = &stage.error {
            println!("{color}      {error}{RESET}");
        }
        if stage.status == StageStatus::Failed {
            if let Some(log) = &stage.log {
                println!("{color}      log: {log}{RESET}");
            }
        }
    }
}
