//! The built-in stages. External-tool wrappers live here; the in-process
//! metadata fixers come from [`crate::fixers`].

use std::fs;

use camino::Utf8Path;

use crate::error::KiraError;
use crate::fixers::{FixAnat, FixB1, FixEpi, FixFmap, FixerAction};
use crate::stage::{Stage, StageContext};
use crate::tools::ExternalCommand;

pub mod dcm2src;
pub mod qc;
pub mod reorient;
pub mod slicetime;
pub mod src2rawdata;
pub mod validate;

pub fn builtin() -> Vec<Stage> {
    vec![
        Stage::new(
            "dcm2src",
            "organize DICOM input into sourcedata",
            dcm2src::Dcm2Src,
        ),
        Stage::new(
            "src2rawdata",
            "convert sourcedata to BIDS rawdata with heudiconv",
            src2rawdata::Src2Rawdata,
        ),
        Stage::new(
            "b1",
            "convert or move B1 maps into fmap as TB1map",
            FixerAction(FixB1),
        ),
        Stage::new(
            "fixanat",
            "fix anatomical names and MP2RAGE metadata",
            FixerAction(FixAnat),
        ),
        Stage::new(
            "fixfmap",
            "fix fieldmap names, Units and IntendedFor",
            FixerAction(FixFmap),
        ),
        Stage::new(
            "fixepi",
            "set phase encoding direction and readout time",
            FixerAction(FixEpi),
        ),
        Stage::new(
            "reorient",
            "reorient images with fslswapdim",
            reorient::Reorient,
        ),
        Stage::new(
            "slicetime",
            "slice-timing correction with slicetimer",
            slicetime::SliceTime,
        ),
        Stage::new(
            "validate",
            "run the BIDS validator",
            validate::Validate,
        ),
        Stage::new("qc", "run MRIQC participant reports", qc::Qc),
    ]
}

/// `docker run --rm --user <uid>:<gid>` with the given `-v` mounts.
pub(crate) fn docker_run(
    ctx: &StageContext<'_>,
    volumes: &[String],
    image: &str,
) -> Result<ExternalCommand, KiraError> {
    let mut command = ctx.command("docker").args(["run", "--rm"]);
    if let Some(user) = docker_user(ctx.unit.root())? {
        command = command.arg("--user").arg(user);
    }
    for volume in volumes {
        command = command.arg("--volume").arg(volume.as_str());
    }
    Ok(command.arg(image))
}

/// Containers run as the owner of the study so their outputs stay writable.
#[cfg(unix)]
pub(crate) fn docker_user(root: &Utf8Path) -> Result<Option<String>, KiraError> {
    use std::os::unix::fs::MetadataExt;

    let meta = fs::metadata(root.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("{root}: {err}")))?;
    Ok(Some(format!("{}:{}", meta.uid(), meta.gid())))
}

#[cfg(not(unix))]
pub(crate) fn docker_user(_root: &Utf8Path) -> Result<Option<String>, KiraError> {
    Ok(None)
}

pub(crate) fn precondition(ctx: &StageContext<'_>, missing: impl Into<String>) -> KiraError {
    KiraError::Precondition {
        stage: ctx.stage.to_string(),
        unit: ctx.unit.to_string(),
        missing: vec![missing.into()],
    }
}
