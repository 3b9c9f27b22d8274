use std::fmt;
use std::fs;
use std::io::Write;
use std::process::Stdio;
use std::sync::OnceLock;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{SecondsFormat, Utc};

use crate::config::StudyConfig;
use crate::error::KiraError;
use crate::stages;
use crate::tools::{CommandRunner, ExternalCommand};
use crate::unit::{ModalityFilter, UnitOfWork};

/// Canonical pipeline, with `b1` at its default position.
pub const DEFAULT_ORDER: [&str; 9] = [
    "dcm2src",
    "src2rawdata",
    "b1",
    "fixanat",
    "fixfmap",
    "fixepi",
    "reorient",
    "slicetime",
    "validate",
];

/// Registered stages that only run when asked for.
pub const OPTIONAL_STAGES: [&str; 1] = ["qc"];

pub fn is_stage_name(name: &str) -> bool {
    DEFAULT_ORDER.contains(&name) || OPTIONAL_STAGES.contains(&name)
}

/// Invocation flags that only some stages read.
#[derive(Debug, Clone)]
pub struct StageOptions {
    pub dicom_dir: Option<Utf8PathBuf>,
    pub use_docker: bool,
    pub notop: bool,
    pub modality: ModalityFilter,
    pub mem_gb: u32,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            dicom_dir: None,
            use_docker: false,
            notop: false,
            modality: ModalityFilter::All,
            mem_gb: 8,
        }
    }
}

/// Everything an action may look at while checking or running one unit.
pub struct StageContext<'a> {
    pub stage: &'a str,
    pub unit: &'a UnitOfWork,
    pub config: &'a StudyConfig,
    pub options: &'a StageOptions,
    pub tools: &'a dyn CommandRunner,
    pub force: bool,
}

impl StageContext<'_> {
    /// A command carrying this stage's configured timeout.
    pub fn command(&self, program: &str) -> ExternalCommand {
        ExternalCommand::new(program).timeout(self.config.timeout_for(self.stage))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    pub exit_code: Option<i32>,
}

/// What a stage does. External-process wrappers and in-process metadata fixers
/// implement the same three operations.
pub trait Action: Send + Sync {
    /// Inputs that must exist before the stage may run.
    fn requires(&self, ctx: &StageContext<'_>) -> Result<Vec<Utf8PathBuf>, KiraError>;

    /// Outputs still missing or out of date; empty means the stage is complete.
    fn pending(&self, ctx: &StageContext<'_>) -> Result<Vec<String>, KiraError>;

    fn execute(&self, ctx: &StageContext<'_>, log: &StageLog) -> Result<ActionOutcome, KiraError>;
}

pub struct Stage {
    name: &'static str,
    summary: &'static str,
    action: Box<dyn Action>,
}

impl Stage {
    pub fn new(name: &'static str, summary: &'static str, action: impl Action + 'static) -> Self {
        Self {
            name,
            summary,
            action: Box::new(action),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn summary(&self) -> &'static str {
        self.summary
    }

    pub fn action(&self) -> &dyn Action {
        self.action.as_ref()
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage").field("name", &self.name).finish()
    }
}

#[derive(Debug)]
pub struct StageRegistry {
    stages: Vec<Stage>,
}

impl StageRegistry {
    /// The built-in stages, constructed once per process.
    pub fn global() -> &'static StageRegistry {
        static REGISTRY: OnceLock<StageRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| StageRegistry::new(stages::builtin()))
    }

    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn get(&self, name: &str) -> Result<&Stage, KiraError> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .ok_or_else(|| KiraError::UnknownStage(name.to_string()))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }
}

/// The per-stage log file of one unit. Lines written here are mirrored to
/// `tracing`; child processes share the file for their stdout and stderr.
#[derive(Debug)]
pub struct StageLog {
    path: Utf8PathBuf,
    stage: String,
    file: fs::File,
}

impl StageLog {
    /// Creates or truncates the log at `path`.
    pub fn create(path: &Utf8Path, stage: &str) -> Result<Self, KiraError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| KiraError::Filesystem(format!("create {parent}: {err}")))?;
        }
        let file = fs::File::create(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("create {path}: {err}")))?;
        Ok(Self {
            path: path.to_path_buf(),
            stage: stage.to_string(),
            file,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn info(&self, message: impl fmt::Display) {
        let message = message.to_string();
        tracing::info!(stage = %self.stage, "{message}");
        self.write_line("INFO", &message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        let message = message.to_string();
        tracing::warn!(stage = %self.stage, "{message}");
        self.write_line("WARNING", &message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        let message = message.to_string();
        tracing::error!(stage = %self.stage, "{message}");
        self.write_line("ERROR", &message);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        let message = message.to_string();
        tracing::debug!(stage = %self.stage, "{message}");
        self.write_line("DEBUG", &message);
    }

    /// A handle for a child process to write into the log.
    pub fn stdio(&self) -> Result<Stdio, KiraError> {
        self.file
            .try_clone()
            .map(Stdio::from)
            .map_err(|err| KiraError::Filesystem(format!("{}: {err}", self.path)))
    }

    fn write_line(&self, level: &str, message: &str) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = format!("{timestamp} - {level} - {message}\n");
        // a lost log line must not fail the stage
        let _ = (&self.file).write_all(line.as_bytes());
    }
}
