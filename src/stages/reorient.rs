use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Orientation;
use crate::error::KiraError;
use crate::fs_util;
use crate::nifti::NiftiHeader;
use crate::stage::{Action, ActionOutcome, StageContext, StageLog};
use crate::tools::{ExternalCommand, run_checked};

/// Brings every image of the selected modalities to the study orientation.
pub struct Reorient;

struct Misoriented {
    image: Utf8PathBuf,
    current: Orientation,
}

impl Reorient {
    fn misoriented(&self, ctx: &StageContext<'_>) -> Result<Vec<Misoriented>, KiraError> {
        let target = ctx.config.orientation;
        // fslswapdim refuses handedness changes, so the left-right mirror also counts as done
        let accepted = [target, target.flip_first()];
        let mut out = Vec::new();
        for modality in ctx.options.modality.modalities() {
            for image in fs_util::list_images(&ctx.unit.modality_dir(modality))? {
                let current = orientation_of(&image)?;
                if !accepted.contains(&current) {
                    out.push(Misoriented { image, current });
                }
            }
        }
        Ok(out)
    }
}

impl Action for Reorient {
    fn requires(&self, ctx: &StageContext<'_>) -> Result<Vec<Utf8PathBuf>, KiraError> {
        Ok(vec![ctx.unit.rawdata_dir()])
    }

    fn pending(&self, ctx: &StageContext<'_>) -> Result<Vec<String>, KiraError> {
        let target = ctx.config.orientation;
        Ok(self
            .misoriented(ctx)?
            .into_iter()
            .map(|item| format!("{}: {} (want {target})", item.image, item.current))
            .collect())
    }

    fn execute(&self, ctx: &StageContext<'_>, log: &StageLog) -> Result<ActionOutcome, KiraError> {
        let target = ctx.config.orientation;
        let mut exit_code = None;
        for item in self.misoriented(ctx)? {
            let Some((stem, ext)) = fs_util::split_image_name(&item.image) else {
                continue;
            };
            let output = ctx.unit.log_dir().join(format!("{stem}_reorient"));
            let swap = |orientation: Orientation| -> ExternalCommand {
                ctx.command("fslswapdim")
                    .env("FSLOUTPUTTYPE", output_type(ext))
                    .arg(item.image.as_str())
                    .args(orientation.swap_args())
                    .arg(output.as_str())
            };
            let code = match ctx.tools.run(&swap(target), log)? {
                Some(0) => 0,
                code => {
                    log.warn(format_args!(
                        "fslswapdim exited with {code:?} for {}, retrying with the first axis flipped",
                        item.image
                    ));
                    run_checked(ctx.tools, &swap(target.flip_first()), log)?
                }
            };
            exit_code = Some(code);

            let produced = Utf8PathBuf::from(format!("{output}{ext}"));
            if !produced.as_std_path().exists() {
                return Err(KiraError::Filesystem(format!(
                    "fslswapdim reported success but wrote no {produced}"
                )));
            }
            fs_util::rename(&produced, &item.image)?;
            log.info(format_args!(
                "reoriented {} from {} to {target}",
                item.image, item.current
            ));
        }
        Ok(ActionOutcome { exit_code })
    }
}

fn orientation_of(image: &Utf8Path) -> Result<Orientation, KiraError> {
    NiftiHeader::read(image)?
        .orientation()
        .map_err(|message| KiraError::Nifti {
            path: image.to_path_buf(),
            message,
        })
}

fn output_type(ext: &str) -> &'static str {
    if ext == ".nii" { "NIFTI" } else { "NIFTI_GZ" }
}
