use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("no study found: no code/config.json in {start} or any parent directory")]
    #[diagnostic(help(
        "run inside a study tree, pass --studydir, or register one with `kira-dcm2bids init --config <path>`"
    ))]
    StudyNotFound { start: Utf8PathBuf },

    #[error("not a study directory (missing code/config.json): {0}")]
    InvalidStudyDir(Utf8PathBuf),

    #[error("failed to read config file at {path}: {message}")]
    ConfigRead { path: Utf8PathBuf, message: String },

    #[error("failed to parse JSON config {path}: {message}")]
    ConfigParse { path: Utf8PathBuf, message: String },

    #[error("invalid config {path}: {}", .violations.join("; "))]
    ConfigValidation {
        path: Utf8PathBuf,
        violations: Vec<String>,
    },

    #[error("invalid {kind} identifier: {value:?}")]
    InvalidIdentifier { kind: &'static str, value: String },

    #[error("{stage} on {unit}: missing required input: {}", .missing.join(", "))]
    Precondition {
        stage: String,
        unit: String,
        missing: Vec<String>,
    },

    #[error("{stage} on {unit}: outputs incomplete after run: {}", .pending.join(", "))]
    Postcondition {
        stage: String,
        unit: String,
        pending: Vec<String>,
    },

    #[error("{tool} exited with {} (log: {log})", exit_label(.code))]
    ExternalTool {
        tool: String,
        code: Option<i32>,
        log: Utf8PathBuf,
    },

    #[error("{tool} timed out after {seconds}s (log: {log})")]
    ToolTimedOut {
        tool: String,
        seconds: u64,
        log: Utf8PathBuf,
    },

    #[error("required tool not found: {0}")]
    #[diagnostic(help("install it or make sure it is on PATH"))]
    MissingTool(String),

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("several images would be renamed to {target}: {}", join_paths(.sources))]
    #[diagnostic(help("rename or remove all but one of them, then run the stage again"))]
    RenameConflict {
        target: Utf8PathBuf,
        sources: Vec<Utf8PathBuf>,
    },

    #[error("sidecar {path}: {message}")]
    Sidecar { path: Utf8PathBuf, message: String },

    #[error("NIfTI header {path}: {message}")]
    Nifti { path: Utf8PathBuf, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("settings error: {0}")]
    Settings(String),

    #[error("pipeline failed for {unit}: {}", .failures.join("; "))]
    PipelineFailed {
        unit: String,
        failures: Vec<String>,
        external: bool,
    },

    #[error("{failed} of {total} units failed")]
    BatchFailed { failed: usize, total: usize },
}

impl KiraError {
    /// Process exit code: 2 for study, config and identifier problems, 3 when
    /// an external tool failed, 1 for everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            KiraError::StudyNotFound { .. }
            | KiraError::InvalidStudyDir(_)
            | KiraError::ConfigRead { .. }
            | KiraError::ConfigParse { .. }
            | KiraError::ConfigValidation { .. }
            | KiraError::InvalidIdentifier { .. }
            | KiraError::UnknownStage(_) => 2,
            KiraError::PipelineFailed { external: true, .. } => 3,
            other if other.is_external() => 3,
            _ => 1,
        }
    }

    /// True for failures reported by an external program rather than by this crate.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            KiraError::ExternalTool { .. }
                | KiraError::ToolTimedOut { .. }
                | KiraError::MissingTool(_)
        )
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

fn join_paths(paths: &[Utf8PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
