use std::fs;

use camino::Utf8PathBuf;

use super::docker_run;
use crate::error::KiraError;
use crate::stage::{Action, ActionOutcome, StageContext, StageLog};
use crate::tools::run_checked;

/// What the validator prints for a dataset without errors.
pub const PASS_MARKER: &str = "This dataset appears to be BIDS compatible";

/// Runs the BIDS validator container over `rawdata/`.
pub struct Validate;

impl Action for Validate {
    fn requires(&self, ctx: &StageContext<'_>) -> Result<Vec<Utf8PathBuf>, KiraError> {
        Ok(vec![ctx.unit.rawdata_root()])
    }

    fn pending(&self, ctx: &StageContext<'_>) -> Result<Vec<String>, KiraError> {
        let log = ctx.unit.stage_log(ctx.stage);
        let passed = fs::read_to_string(log.as_std_path())
            .map(|content| content.contains(PASS_MARKER))
            .unwrap_or(false);
        if passed {
            Ok(Vec::new())
        } else {
            Ok(vec![format!("{log} does not report a BIDS compatible dataset")])
        }
    }

    fn execute(&self, ctx: &StageContext<'_>, log: &StageLog) -> Result<ActionOutcome, KiraError> {
        let volumes = [format!("{}:/data:ro", ctx.unit.rawdata_root())];
        let command = docker_run(ctx, &volumes, &ctx.config.validator_image)?.arg("/data");
        let code = run_checked(ctx.tools, &command, log)?;
        Ok(ActionOutcome {
            exit_code: Some(code),
        })
    }
}
