use std::fs;

use camino::Utf8PathBuf;

use super::docker_run;
use crate::error::KiraError;
use crate::fs_util;
use crate::stage::{Action, ActionOutcome, StageContext, StageLog};
use crate::tools::run_checked;

/// MRIQC participant-level reports under `derivatives/mriqc`.
pub struct Qc;

impl Action for Qc {
    fn requires(&self, ctx: &StageContext<'_>) -> Result<Vec<Utf8PathBuf>, KiraError> {
        Ok(vec![ctx.unit.rawdata_dir()])
    }

    fn pending(&self, ctx: &StageContext<'_>) -> Result<Vec<String>, KiraError> {
        let out = ctx.unit.mriqc_dir();
        let prefix = format!("{}_", ctx.unit.prefix());
        let has_reports = fs_util::list_files(&out)?.iter().any(|path| {
            path.file_name()
                .map(|name| name.starts_with(&prefix) && name.ends_with(".html"))
                .unwrap_or(false)
        });
        if has_reports {
            Ok(Vec::new())
        } else {
            Ok(vec![format!("no {prefix}*.html report in {out}")])
        }
    }

    fn execute(&self, ctx: &StageContext<'_>, log: &StageLog) -> Result<ActionOutcome, KiraError> {
        let out = ctx.unit.mriqc_dir();
        fs::create_dir_all(out.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("create {out}: {err}")))?;
        let volumes = [
            format!("{}:/data:ro", ctx.unit.rawdata_root()),
            format!("{out}:/out"),
        ];
        let command = docker_run(ctx, &volumes, &ctx.config.mriqc_image)?
            .args(["/data", "/out", "participant", "--participant_label"])
            .arg(ctx.unit.subject().as_str())
            .arg("--session-id")
            .arg(ctx.unit.session().as_str())
            .arg("--verbose-reports")
            .arg("--mem_gb")
            .arg(ctx.options.mem_gb.to_string());
        let code = run_checked(ctx.tools, &command, log)?;
        Ok(ActionOutcome {
            exit_code: Some(code),
        })
    }
}
