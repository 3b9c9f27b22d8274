use std::fs;

use camino::Utf8PathBuf;

use super::{docker_run, precondition};
use crate::error::KiraError;
use crate::fs_util;
use crate::scans;
use crate::sidecar::sidecar_path;
use crate::stage::{Action, ActionOutcome, StageContext, StageLog};
use crate::tools::{ExternalCommand, run_checked};
use crate::unit::Modality;

pub(crate) const HEUDICONV_IMAGE: &str = "nipy/heudiconv:latest";

/// Sorts sourcedata into BIDS rawdata with heudiconv and the study heuristic.
pub struct Src2Rawdata;

impl Action for Src2Rawdata {
    fn requires(&self, ctx: &StageContext<'_>) -> Result<Vec<Utf8PathBuf>, KiraError> {
        Ok(vec![ctx.unit.sourcedata_dir(), ctx.config.heuristic.clone()])
    }

    fn pending(&self, ctx: &StageContext<'_>) -> Result<Vec<String>, KiraError> {
        let rawdata = ctx.unit.rawdata_dir();
        let converted =
            fs_util::find_first(&rawdata, |path| path.as_str().ends_with(".nii.gz")).is_some();
        if converted {
            Ok(Vec::new())
        } else {
            Ok(vec![format!("no NIfTI images in {rawdata}")])
        }
    }

    fn execute(&self, ctx: &StageContext<'_>, log: &StageLog) -> Result<ActionOutcome, KiraError> {
        let rawdata = ctx.unit.rawdata_dir();
        if ctx.force && fs_util::remove_dir_if_exists(&rawdata)? {
            log.info(format_args!("removed existing {rawdata}"));
        }
        check_heuristic(ctx, log)?;

        let command = if ctx.options.use_docker || ctx.config.use_docker {
            docker_command(ctx)?
        } else {
            local_command(ctx)
        };
        let code = run_checked(ctx.tools, &command, log)?;

        clean_heudiconv_cache(ctx, log)?;
        remove_adc_maps(ctx, log)?;
        Ok(ActionOutcome {
            exit_code: Some(code),
        })
    }
}

fn check_heuristic(ctx: &StageContext<'_>, log: &StageLog) -> Result<(), KiraError> {
    let heuristic = &ctx.config.heuristic;
    let content = fs::read_to_string(heuristic.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("read {heuristic}: {err}")))?;
    if !content.contains("{session}") {
        log.warn(format_args!(
            "heuristic {heuristic} has no {{session}} in its templates, outputs may land outside ses-{}",
            ctx.unit.session()
        ));
    }
    Ok(())
}

fn heudiconv_args(
    command: ExternalCommand,
    ctx: &StageContext<'_>,
    base: &str,
    heuristic: &str,
) -> ExternalCommand {
    let mut command = command
        .arg("-d")
        .arg(format!(
            "{base}/sourcedata/sub-{{subject}}/ses-{{session}}/*/*.dcm"
        ))
        .arg("-f")
        .arg(heuristic)
        .arg("-o")
        .arg(format!("{base}/rawdata"))
        .arg("-s")
        .arg(ctx.unit.subject().as_str())
        .arg("-ss")
        .arg(ctx.unit.session().as_str())
        .args(["-c", "dcm2niix", "-b"]);
    if ctx.options.notop {
        command = command.arg("notop");
    }
    command.arg("--overwrite")
}

fn local_command(ctx: &StageContext<'_>) -> ExternalCommand {
    heudiconv_args(
        ctx.command("heudiconv"),
        ctx,
        ctx.unit.root().as_str(),
        ctx.config.heuristic.as_str(),
    )
}

fn docker_command(ctx: &StageContext<'_>) -> Result<ExternalCommand, KiraError> {
    let heuristic = &ctx.config.heuristic;
    let (Some(dir), Some(name)) = (heuristic.parent(), heuristic.file_name()) else {
        return Err(precondition(ctx, format!("heuristic file {heuristic}")));
    };
    let volumes = [
        format!("{}:/base", ctx.unit.root()),
        format!("{dir}:/heuristic:ro"),
    ];
    let command = docker_run(ctx, &volumes, HEUDICONV_IMAGE)?;
    Ok(heudiconv_args(
        command,
        ctx,
        "/base",
        &format!("/heuristic/{name}"),
    ))
}

/// heudiconv keeps per-subject bookkeeping under `rawdata/.heudiconv`.
fn clean_heudiconv_cache(ctx: &StageContext<'_>, log: &StageLog) -> Result<(), KiraError> {
    let cache = ctx.unit.rawdata_root().join(".heudiconv");
    let subject = ctx.unit.subject().as_str();
    for entry in fs_util::list_dir(&cache)? {
        let matches = entry
            .file_name()
            .map(|name| name.starts_with(subject))
            .unwrap_or(false);
        if !matches {
            continue;
        }
        if entry.as_std_path().is_dir() {
            fs_util::remove_dir_if_exists(&entry)?;
        } else {
            fs_util::remove_file_if_exists(&entry)?;
        }
        log.debug(format_args!("removed {entry}"));
    }
    Ok(())
}

fn remove_adc_maps(ctx: &StageContext<'_>, log: &StageLog) -> Result<(), KiraError> {
    for image in fs_util::list_images(&ctx.unit.modality_dir(Modality::Dwi))? {
        let is_adc = fs_util::split_image_name(&image)
            .map(|(stem, _)| stem.ends_with("_ADC"))
            .unwrap_or(false);
        if !is_adc {
            continue;
        }
        fs_util::remove_file_if_exists(&image)?;
        fs_util::remove_file_if_exists(&sidecar_path(&image))?;
        scans::record_removal(ctx.unit, &image)?;
        log.info(format_args!("removed derived ADC map {image}"));
    }
    Ok(())
}
