use std::fs;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};
use tempfile::TempDir;

use kira_dcm2bids::config::{ConfigOverrides, StudyConfig, resolve_config};
use kira_dcm2bids::error::KiraError;
use kira_dcm2bids::pipeline::{Pipeline, PipelineOptions};
use kira_dcm2bids::runner::{StageRunner, StageStatus};
use kira_dcm2bids::stage::{
    Action, ActionOutcome, DEFAULT_ORDER, OPTIONAL_STAGES, Stage, StageContext, StageLog,
    StageOptions, StageRegistry,
};
use kira_dcm2bids::tools::{CommandRunner, ExternalCommand};
use kira_dcm2bids::unit::UnitOfWork;

struct NoTools;

impl CommandRunner for NoTools {
    fn run(&self, command: &ExternalCommand, _log: &StageLog) -> Result<Option<i32>, KiraError> {
        panic!("unexpected command: {}", command.display());
    }
}

type Calls = Arc<Mutex<Vec<&'static str>>>;

/// Completes by leaving a marker next to its log; `fail` makes it exit 1.
struct Recorder {
    name: &'static str,
    fail: bool,
    calls: Calls,
}

impl Recorder {
    fn marker(&self, ctx: &StageContext<'_>) -> Utf8PathBuf {
        ctx.unit.log_dir().join(format!("{}.done", self.name))
    }
}

impl Action for Recorder {
    fn requires(&self, _ctx: &StageContext<'_>) -> Result<Vec<Utf8PathBuf>, KiraError> {
        Ok(Vec::new())
    }

    fn pending(&self, ctx: &StageContext<'_>) -> Result<Vec<String>, KiraError> {
        let marker = self.marker(ctx);
        if marker.as_std_path().exists() {
            Ok(Vec::new())
        } else {
            Ok(vec![marker.to_string()])
        }
    }

    fn execute(&self, ctx: &StageContext<'_>, log: &StageLog) -> Result<ActionOutcome, KiraError> {
        self.calls.lock().unwrap().push(self.name);
        if self.fail {
            return Err(KiraError::ExternalTool {
                tool: self.name.to_string(),
                code: Some(1),
                log: log.path().to_path_buf(),
            });
        }
        fs::write(self.marker(ctx), "").unwrap();
        Ok(ActionOutcome { exit_code: Some(0) })
    }
}

fn registry(failing: &'static str, calls: &Calls) -> StageRegistry {
    let stages = DEFAULT_ORDER
        .iter()
        .chain(OPTIONAL_STAGES.iter())
        .copied()
        .map(|name| {
            Stage::new(
                name,
                "records its run",
                Recorder {
                    name,
                    fail: name == failing,
                    calls: Arc::clone(calls),
                },
            )
        })
        .collect();
    StageRegistry::new(stages)
}

fn config(temp: &TempDir, extra: Value) -> StudyConfig {
    let root = Utf8Path::from_path(temp.path()).unwrap();
    let mut raw = json!({
        "heuristic": "code/heuristic.py",
        "epi_ap_phase_enc_dir": "j-",
        "orientation": "LPI",
        "slice_order": "odd",
        "slice_direction": 3
    });
    if let (Some(raw), Some(extra)) = (raw.as_object_mut(), extra.as_object()) {
        raw.extend(extra.clone());
    }
    resolve_config(
        root,
        &root.join("code/config.json"),
        raw,
        &ConfigOverrides::default(),
    )
    .unwrap()
}

#[test]
fn first_failure_stops_the_unit() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(&temp, json!({}));
    let calls = Calls::default();
    let registry = registry("fixanat", &calls);
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    let options = StageOptions::default();
    let runner = StageRunner::new(&NoTools, &options);

    let pipeline = Pipeline::default_for(&registry, &config).unwrap();
    assert_eq!(pipeline.names(), DEFAULT_ORDER.to_vec());

    let report = pipeline.run(&runner, &unit, &config, PipelineOptions::default());
    assert_eq!(report.results.len(), 4);
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["dcm2src", "src2rawdata", "b1", "fixanat"]
    );
    assert!(!report.is_success());
    assert_matches!(report.error(), Some(KiraError::PipelineFailed { unit, failures, external: true }) => {
        assert_eq!(unit, "sub-S01_ses-MR1");
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("fixanat: "));
    });

    // a rerun skips what already finished
    calls.lock().unwrap().clear();
    let rerun = pipeline.run(&runner, &unit, &config, PipelineOptions::default());
    let statuses: Vec<StageStatus> = rerun.results.iter().map(|result| result.status).collect();
    assert_eq!(
        statuses,
        vec![
            StageStatus::Skipped,
            StageStatus::Skipped,
            StageStatus::Skipped,
            StageStatus::Failed
        ]
    );
    assert_eq!(*calls.lock().unwrap(), vec!["fixanat"]);
}

#[test]
fn keep_going_attempts_every_stage() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(&temp, json!({}));
    let calls = Calls::default();
    let registry = registry("fixanat", &calls);
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    let options = StageOptions::default();
    let runner = StageRunner::new(&NoTools, &options);

    let pipeline = Pipeline::default_for(&registry, &config).unwrap();
    let report = pipeline.run(
        &runner,
        &unit,
        &config,
        PipelineOptions {
            force: false,
            stop_on_failure: false,
        },
    );
    assert_eq!(report.results.len(), 9);
    assert_eq!(report.failures().count(), 1);
    assert_eq!(calls.lock().unwrap().len(), 9);
}

#[test]
fn forced_run_repeats_completed_stages() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(&temp, json!({}));
    let calls = Calls::default();
    let registry = registry("none", &calls);
    let unit = UnitOfWork::describe(&config.root, "S01", "MR1").unwrap();
    let options = StageOptions::default();
    let runner = StageRunner::new(&NoTools, &options);

    let pipeline = Pipeline::select(&registry, &config, &["fixepi", "fixfmap"]).unwrap();
    assert!(pipeline.run(&runner, &unit, &config, PipelineOptions::default()).is_success());
    let forced = PipelineOptions {
        force: true,
        ..PipelineOptions::default()
    };
    let report = pipeline.run(&runner, &unit, &config, forced);
    assert!(report.results.iter().all(|result| result.status == StageStatus::Success));
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["fixfmap", "fixepi", "fixfmap", "fixepi"]
    );
}

#[test]
fn selection_follows_canonical_order() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(&temp, json!({}));
    let calls = Calls::default();
    let registry = registry("none", &calls);

    let pipeline = Pipeline::select(&registry, &config, &["validate", "qc", "dcm2src"]).unwrap();
    assert_eq!(pipeline.names(), vec!["dcm2src", "validate", "qc"]);

    assert_matches!(
        Pipeline::select(&registry, &config, &["dcm2src", "nosuchstage"]),
        Err(KiraError::UnknownStage(name)) if name == "nosuchstage"
    );
}

#[test]
fn b1_runs_where_configured() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(&temp, json!({"b1_after": "fixepi"}));
    let calls = Calls::default();
    let registry = registry("none", &calls);

    let names = Pipeline::default_for(&registry, &config).unwrap().names().join(",");
    assert_eq!(
        names,
        "dcm2src,src2rawdata,fixanat,fixfmap,fixepi,b1,reorient,slicetime,validate"
    );
}

#[test]
fn stages_can_be_added_and_dropped() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(&temp, json!({}));
    let calls = Calls::default();
    let registry = registry("none", &calls);

    let pipeline = Pipeline::default_for(&registry, &config)
        .unwrap()
        .without("validate")
        .with(&registry, &config, "qc")
        .unwrap();
    let names = pipeline.names();
    assert!(!names.contains(&"validate"));
    assert_eq!(names.last(), Some(&"qc"));
    assert_eq!(names.len(), 9);
}

#[test]
fn builtin_registry_knows_every_stage() {
    let registry = StageRegistry::global();
    for name in DEFAULT_ORDER.iter().chain(OPTIONAL_STAGES.iter()) {
        assert_eq!(registry.get(name).unwrap().name(), *name);
    }
    assert_eq!(registry.stages().len(), 10);
}
