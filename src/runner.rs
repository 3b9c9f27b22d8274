use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::config::StudyConfig;
use crate::error::KiraError;
use crate::stage::{Stage, StageContext, StageLog, StageOptions};
use crate::tools::CommandRunner;
use crate::unit::UnitOfWork;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Success,
    Skipped,
    Failed,
}

#[derive(Debug)]
pub struct StageResult {
    pub stage: String,
    pub unit: String,
    pub status: StageStatus,
    pub exit_code: Option<i32>,
    /// Absent when the stage never got as far as running.
    pub log_path: Option<Utf8PathBuf>,
    pub error: Option<KiraError>,
}

impl StageResult {
    pub fn is_failed(&self) -> bool {
        self.status == StageStatus::Failed
    }

    /// One line naming the stage, the error and where to look.
    pub fn failure_summary(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        Some(match &self.log_path {
            Some(log) => format!("{}: {error} (log: {log})", self.stage),
            None => format!("{}: {error}", self.stage),
        })
    }
}

/// Read-only view of a stage for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageState {
    Complete,
    Pending(Vec<String>),
    Blocked(Vec<String>),
}

pub struct StageRunner<'a> {
    tools: &'a dyn CommandRunner,
    options: &'a StageOptions,
}

impl<'a> StageRunner<'a> {
    pub fn new(tools: &'a dyn CommandRunner, options: &'a StageOptions) -> Self {
        Self { tools, options }
    }

    pub fn run(
        &self,
        stage: &Stage,
        unit: &UnitOfWork,
        config: &StudyConfig,
        force: bool,
    ) -> StageResult {
        let ctx = self.context(stage, unit, config, force);
        let result = |status: StageStatus,
                      exit_code: Option<i32>,
                      log_path: Option<Utf8PathBuf>,
                      error: Option<KiraError>| StageResult {
            stage: stage.name().to_string(),
            unit: unit.to_string(),
            status,
            exit_code,
            log_path,
            error,
        };

        let missing = match missing_inputs(&ctx, stage) {
            Ok(missing) => missing,
            Err(err) => return result(StageStatus::Failed, None, None, Some(err)),
        };
        if !missing.is_empty() {
            tracing::warn!("{} on {unit}: missing {}", stage.name(), missing.join(", "));
            let err = KiraError::Precondition {
                stage: stage.name().to_string(),
                unit: unit.to_string(),
                missing,
            };
            return result(StageStatus::Failed, None, None, Some(err));
        }

        if !force {
            match stage.action().pending(&ctx) {
                Ok(pending) if pending.is_empty() => {
                    tracing::info!("{} on {unit}: already complete, skipping", stage.name());
                    return result(StageStatus::Skipped, None, None, None);
                }
                Ok(pending) => {
                    tracing::debug!("{} on {unit}: pending {}", stage.name(), pending.join(", "))
                }
                Err(err) => return result(StageStatus::Failed, None, None, Some(err)),
            }
        }

        let log_path = unit.stage_log(stage.name());
        let log = match StageLog::create(&log_path, stage.name()) {
            Ok(log) => log,
            Err(err) => return result(StageStatus::Failed, None, None, Some(err)),
        };
        log.info(format_args!(
            "{} started for {unit} (force: {force})",
            stage.name()
        ));

        let outcome = match stage.action().execute(&ctx, &log) {
            Ok(outcome) => outcome,
            Err(err) => {
                log.error(&err);
                let exit_code = match &err {
                    KiraError::ExternalTool { code, .. } => *code,
                    _ => None,
                };
                return result(StageStatus::Failed, exit_code, Some(log_path), Some(err));
            }
        };

        match stage.action().pending(&ctx) {
            Ok(pending) if pending.is_empty() => {
                log.info(format_args!("{} finished for {unit}", stage.name()));
                result(StageStatus::Success, outcome.exit_code, Some(log_path), None)
            }
            Ok(pending) => {
                let err = KiraError::Postcondition {
                    stage: stage.name().to_string(),
                    unit: unit.to_string(),
                    pending,
                };
                log.error(&err);
                result(StageStatus::Failed, outcome.exit_code, Some(log_path), Some(err))
            }
            Err(err) => {
                log.error(&err);
                result(StageStatus::Failed, outcome.exit_code, Some(log_path), Some(err))
            }
        }
    }

    /// Precondition and completion checks only; nothing is written.
    pub fn inspect(
        &self,
        stage: &Stage,
        unit: &UnitOfWork,
        config: &StudyConfig,
    ) -> Result<StageState, KiraError> {
        let ctx = self.context(stage, unit, config, false);
        let missing = match missing_inputs(&ctx, stage) {
            Ok(missing) => missing,
            Err(KiraError::Precondition { missing, .. }) => missing,
            Err(err) => return Err(err),
        };
        if !missing.is_empty() {
            return Ok(StageState::Blocked(missing));
        }
        let pending = stage.action().pending(&ctx)?;
        if pending.is_empty() {
            Ok(StageState::Complete)
        } else {
            Ok(StageState::Pending(pending))
        }
    }

    fn context<'c>(
        &'c self,
        stage: &'c Stage,
        unit: &'c UnitOfWork,
        config: &'c StudyConfig,
        force: bool,
    ) -> StageContext<'c> {
        StageContext {
            stage: stage.name(),
            unit,
            config,
            options: self.options,
            tools: self.tools,
            force,
        }
    }
}

fn missing_inputs(ctx: &StageContext<'_>, stage: &Stage) -> Result<Vec<String>, KiraError> {
    Ok(stage
        .action()
        .requires(ctx)?
        .iter()
        .filter(|path| !exists(path))
        .map(|path| path.to_string())
        .collect())
}

fn exists(path: &Utf8Path) -> bool {
    path.as_std_path().exists()
}
