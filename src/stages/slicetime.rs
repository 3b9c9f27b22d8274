use std::fs;

use camino::Utf8PathBuf;

use crate::config::SliceOrder;
use crate::error::KiraError;
use crate::fixers::suffix;
use crate::fs_util;
use crate::nifti::NiftiHeader;
use crate::sidecar::{self, Sidecar, SidecarPatch};
use crate::stage::{Action, ActionOutcome, StageContext, StageLog};
use crate::tools::run_checked;
use crate::unit::Modality;

/// Slice-timing correction of BOLD runs, recording `SliceTiming` in the sidecar.
pub struct SliceTime;

struct BoldRun {
    image: Utf8PathBuf,
    sidecar: Utf8PathBuf,
    repetition_time: f64,
    corrected: bool,
}

impl SliceTime {
    /// BOLD runs whose sidecar carries a `RepetitionTime`.
    fn runs(&self, ctx: &StageContext<'_>) -> Result<Vec<BoldRun>, KiraError> {
        let mut runs = Vec::new();
        for image in fs_util::list_images(&ctx.unit.modality_dir(Modality::Func))? {
            let Some((stem, _)) = fs_util::split_image_name(&image) else {
                continue;
            };
            if suffix(stem) != "bold" {
                continue;
            }
            let sidecar_path = sidecar::sidecar_path(&image);
            if !sidecar_path.as_std_path().exists() {
                continue;
            }
            let sidecar = Sidecar::load(&sidecar_path)?;
            let Some(repetition_time) = sidecar.get_f64("RepetitionTime") else {
                tracing::debug!("{sidecar_path} has no RepetitionTime, skipping");
                continue;
            };
            runs.push(BoldRun {
                corrected: sidecar.get("SliceTiming").is_some(),
                image,
                sidecar: sidecar_path,
                repetition_time,
            });
        }
        Ok(runs)
    }
}

impl Action for SliceTime {
    fn requires(&self, ctx: &StageContext<'_>) -> Result<Vec<Utf8PathBuf>, KiraError> {
        Ok(vec![ctx.unit.modality_dir(Modality::Func)])
    }

    fn pending(&self, ctx: &StageContext<'_>) -> Result<Vec<String>, KiraError> {
        Ok(self
            .runs(ctx)?
            .into_iter()
            .filter(|run| !run.corrected)
            .map(|run| format!("{}: no SliceTiming", run.sidecar))
            .collect())
    }

    fn execute(&self, ctx: &StageContext<'_>, log: &StageLog) -> Result<ActionOutcome, KiraError> {
        let order = ctx.config.slice_order;
        let direction = ctx.config.slice_direction;
        let mut exit_code = None;
        for run in self.runs(ctx)? {
            if run.corrected && !ctx.force {
                continue;
            }
            let Some((stem, ext)) = fs_util::split_image_name(&run.image) else {
                continue;
            };
            let slices = NiftiHeader::read(&run.image)?.slice_count(direction);
            let timing = slice_timing(order, slices, run.repetition_time);

            let output = ctx.unit.log_dir().join(format!("{stem}_slicetime"));
            let mut command = ctx
                .command("slicetimer")
                .env("FSLOUTPUTTYPE", if ext == ".nii" { "NIFTI" } else { "NIFTI_GZ" })
                .arg("-i")
                .arg(run.image.as_str())
                .arg("-o")
                .arg(output.as_str())
                .arg("-r")
                .arg(run.repetition_time.to_string())
                .arg("-d")
                .arg(direction.to_string());
            command = match order {
                SliceOrder::Up => command,
                SliceOrder::Down => command.arg("--down"),
                SliceOrder::Odd => command.arg("--odd"),
                SliceOrder::Even => {
                    let custom = ctx.unit.log_dir().join(format!("{stem}_slicetimes.txt"));
                    let fractions: Vec<String> = timing
                        .iter()
                        .map(|time| format!("{:.6}", time / run.repetition_time))
                        .collect();
                    fs::write(custom.as_std_path(), fractions.join("\n") + "\n")
                        .map_err(|err| KiraError::Filesystem(format!("write {custom}: {err}")))?;
                    command.arg("--tcustom").arg(custom.as_str())
                }
            };
            exit_code = Some(run_checked(ctx.tools, &command, log)?);

            let produced = Utf8PathBuf::from(format!("{output}{ext}"));
            if !produced.as_std_path().exists() {
                return Err(KiraError::Filesystem(format!(
                    "slicetimer reported success but wrote no {produced}"
                )));
            }
            fs_util::rename(&produced, &run.image)?;
            let patch = SidecarPatch::new().set("SliceTiming", timing);
            sidecar::merge_into(&run.sidecar, &patch, false)?;
            log.info(format_args!(
                "corrected {} ({slices} slices, order {order})",
                run.image
            ));
        }
        Ok(ActionOutcome { exit_code })
    }
}

/// Acquisition time of each slice, in seconds from the start of the volume.
pub fn slice_timing(order: SliceOrder, slices: usize, repetition_time: f64) -> Vec<f64> {
    let sequence: Vec<usize> = match order {
        SliceOrder::Up => (0..slices).collect(),
        SliceOrder::Down => (0..slices).rev().collect(),
        SliceOrder::Odd => (0..slices).step_by(2).chain((1..slices).step_by(2)).collect(),
        SliceOrder::Even => (1..slices).step_by(2).chain((0..slices).step_by(2)).collect(),
    };
    let step = repetition_time / slices as f64;
    let mut timing = vec![0.0; slices];
    for (position, slice) in sequence.into_iter().enumerate() {
        timing[slice] = ((position as f64 * step) * 1e6).round() / 1e6;
    }
    timing
}
