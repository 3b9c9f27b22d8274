use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use super::{Fixer, Merge, Rename, entity, plan_rename, suffix};
use crate::error::KiraError;
use crate::fs_util;
use crate::scans;
use crate::sidecar::{Sidecar, SidecarPatch, sidecar_path};
use crate::stage::{StageContext, StageLog};
use crate::tools::run_checked;
use crate::unit::Modality;

const BLOCK: &str = "b1";

/// dcm2niix releases that mangle Philips B1 series names (`_r100`, `_r20`).
const BROKEN_DCM2NIIX: &str = "v1.0.202505";

/// Puts B1 calibration maps into `fmap/` under their BIDS `TB1map` name.
///
/// Series in sourcedata whose directory mentions `b1map` are converted with
/// dcm2niix, one run per series. Without such series, B1 maps that heudiconv
/// already wrote elsewhere in rawdata are moved instead.
pub struct FixB1;

/// One B1 series in sourcedata and the `fmap/` stem it converts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct B1Series {
    pub dicom_dir: Utf8PathBuf,
    pub stem: String,
}

impl Fixer for FixB1 {
    fn outstanding(&self, ctx: &StageContext<'_>) -> Result<Vec<String>, KiraError> {
        let fmap = ctx.unit.modality_dir(Modality::Fmap);
        let mut outstanding = Vec::new();
        for series in source_series(ctx)? {
            if converted(&fmap, &series.stem)?.is_empty() {
                outstanding.push(format!("convert {} -> {fmap}/{}", series.dicom_dir, series.stem));
            }
        }
        Ok(outstanding)
    }

    fn prepare(&self, ctx: &StageContext<'_>, log: &StageLog) -> Result<(), KiraError> {
        let series = source_series(ctx)?;
        if series.is_empty() {
            log.info("no B1 series in sourcedata, looking for B1 maps in rawdata");
            return Ok(());
        }
        log.info(format_args!("found {} B1 series in sourcedata", series.len()));
        check_dcm2niix(ctx, log);
        for one in &series {
            convert(ctx, one, log)?;
        }
        Ok(())
    }

    fn renames(&self, ctx: &StageContext<'_>) -> Result<Vec<Rename>, KiraError> {
        if !source_series(ctx)?.is_empty() {
            return Ok(Vec::new());
        }
        let mut dirs: Vec<(Utf8PathBuf, bool)> = vec![(ctx.unit.rawdata_dir(), false)];
        for modality in Modality::ALL {
            dirs.push((ctx.unit.modality_dir(modality), modality == Modality::Fmap));
        }

        let mut by_target: BTreeMap<String, Vec<(Utf8PathBuf, bool)>> = BTreeMap::new();
        for (dir, in_fmap) in dirs {
            for image in fs_util::list_images(&dir)? {
                let Some((stem, _)) = fs_util::split_image_name(&image) else {
                    continue;
                };
                if !is_b1_map(stem, in_fmap) {
                    continue;
                }
                let target = target_stem(&ctx.unit.prefix(), stem, &ctx.config.b1_acq);
                let has_run = entity(stem, "run").is_some();
                by_target.entry(target).or_default().push((image, has_run));
            }
        }

        let fmap = ctx.unit.modality_dir(Modality::Fmap);
        let mut renames = Vec::new();
        for (target, images) in by_target {
            let numbered = images.len() > 1 && images.iter().all(|(_, has_run)| !has_run);
            for (index, (image, _)) in images.iter().enumerate() {
                let Some((_, ext)) = fs_util::split_image_name(image) else {
                    continue;
                };
                let stem = if numbered {
                    number_run(&target, index + 1)
                } else {
                    target.clone()
                };
                if let Some(rename) = plan_rename(ctx, image, &fmap, &stem, ext) {
                    renames.push(rename);
                }
            }
        }
        Ok(renames)
    }

    fn merges(&self, ctx: &StageContext<'_>) -> Result<Vec<Merge>, KiraError> {
        let mut base = SidecarPatch::new();
        if let Some(Value::Object(fields)) = ctx.config.extra(BLOCK) {
            base.extend(fields);
        }
        let mut merges = Vec::new();
        for image in fs_util::list_images(&ctx.unit.modality_dir(Modality::Fmap))? {
            let Some((stem, _)) = fs_util::split_image_name(&image) else {
                continue;
            };
            // dcm2niix may append `_e1`, `_ph` after the suffix
            if stem.split('_').any(|part| part == "TB1map") {
                merges.push(Merge {
                    sidecar: sidecar_path(&image),
                    patch: base.clone(),
                    create: true,
                });
            }
        }
        Ok(merges)
    }
}

/// B1 series directories in sourcedata, numbered as runs in name order.
pub fn source_series(ctx: &StageContext<'_>) -> Result<Vec<B1Series>, KiraError> {
    let prefix = ctx.unit.prefix();
    let series = fs_util::list_dir(&ctx.unit.sourcedata_dir())?
        .into_iter()
        .filter(|path| path.as_std_path().is_dir())
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| name.to_lowercase().contains("b1map"))
        })
        .enumerate()
        .map(|(index, dicom_dir)| B1Series {
            dicom_dir,
            stem: format!("{prefix}_acq-{}_run-{}_TB1map", ctx.config.b1_acq, index + 1),
        })
        .collect();
    Ok(series)
}

/// Images in `fmap` that dcm2niix wrote for `stem` (it may append echo or
/// part suffixes).
fn converted(fmap: &Utf8Path, stem: &str) -> Result<Vec<Utf8PathBuf>, KiraError> {
    Ok(fs_util::list_images(fmap)?
        .into_iter()
        .filter(|image| {
            fs_util::split_image_name(image).is_some_and(|(name, _)| name.starts_with(stem))
        })
        .collect())
}

fn convert(ctx: &StageContext<'_>, series: &B1Series, log: &StageLog) -> Result<(), KiraError> {
    let fmap = ctx.unit.modality_dir(Modality::Fmap);
    let existing = converted(&fmap, &series.stem)?;
    if !existing.is_empty() {
        if !ctx.force {
            log.info(format_args!(
                "{} already converted ({} file(s)), use --force to convert again",
                series.stem,
                existing.len()
            ));
            return Ok(());
        }
        for image in &existing {
            scans::record_removal(ctx.unit, image)?;
            fs_util::remove_file_if_exists(image)?;
            fs_util::remove_file_if_exists(&sidecar_path(image))?;
        }
        log.info(format_args!("removed {} earlier output(s) of {}", existing.len(), series.stem));
    }

    fs::create_dir_all(fmap.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("create {fmap}: {err}")))?;
    log.info(format_args!("converting {} -> {}", series.dicom_dir, series.stem));
    let command = ctx
        .command("dcm2niix")
        .args(["-b", "y", "-z", "y", "-p", "n", "-f"])
        .arg(series.stem.as_str())
        .arg("-o")
        .arg(fmap.as_str())
        .arg(series.dicom_dir.as_str());
    run_checked(ctx.tools, &command, log)?;

    let created = converted(&fmap, &series.stem)?;
    if created.is_empty() {
        log.warn(format_args!(
            "dcm2niix wrote no {}* images for {}; check {fmap} for unexpected names",
            series.stem, series.dicom_dir
        ));
        return Ok(());
    }
    for image in &created {
        let acq_time = Sidecar::load(&sidecar_path(image))
            .ok()
            .and_then(|sidecar| acquisition_time(&sidecar))
            .unwrap_or_else(|| "n/a".to_string());
        scans::record_addition(ctx.unit, image, &acq_time)?;
        log.debug(format_args!("added {image} to scans.tsv"));
    }
    log.info(format_args!("created {} B1 image(s) for {}", created.len(), series.stem));
    Ok(())
}

/// Logs a warning when the installed dcm2niix is a release known to break
/// B1 conversion. The check itself never fails the stage.
fn check_dcm2niix(ctx: &StageContext<'_>, log: &StageLog) {
    let command = ctx.command("dcm2niix").arg("-h");
    if let Err(err) = run_checked(ctx.tools, &command, log) {
        log.debug(format_args!("could not check the dcm2niix version: {err}"));
        return;
    }
    let output = fs::read_to_string(log.path().as_std_path()).unwrap_or_default();
    if output.contains(BROKEN_DCM2NIIX) {
        log.warn(format_args!(
            "dcm2niix {BROKEN_DCM2NIIX}* is known to misname Philips B1 maps; \
             v1.0.20220720 converts them correctly. Check fmap after conversion"
        ));
    }
}

/// BIDS `acq_time` from a dcm2niix sidecar.
fn acquisition_time(sidecar: &Sidecar) -> Option<String> {
    let text = |key: &str| sidecar.get(key).and_then(Value::as_str);
    if let Some(datetime) = text("AcquisitionDateTime") {
        return Some(datetime.to_string());
    }
    let time = text("AcquisitionTime").map(clock_time)?;
    match text("AcquisitionDate") {
        Some(date) if date.len() == 8 && date.bytes().all(|b| b.is_ascii_digit()) => Some(
            format!("{}-{}-{}T{time}", &date[..4], &date[4..6], &date[6..]),
        ),
        Some(date) => Some(format!("{date}T{time}")),
        None => Some(format!("T{time}")),
    }
}

/// `102753.77` -> `10:27:53.77`; values with colons pass through.
fn clock_time(value: &str) -> String {
    if value.contains(':') || value.len() < 6 || !value.is_ascii() {
        return value.to_string();
    }
    format!("{}:{}:{}", &value[..2], &value[2..4], &value[4..])
}

fn is_b1_map(stem: &str, in_fmap: bool) -> bool {
    let lower = stem.to_lowercase();
    if lower.contains("b1-combined") {
        return true;
    }
    !in_fmap && (lower.contains("b1map") || suffix(stem) == "TB1map")
}

fn target_stem(prefix: &str, stem: &str, default_acq: &str) -> String {
    let acq = entity(stem, "acq").unwrap_or(default_acq);
    match entity(stem, "run") {
        Some(run) => format!("{prefix}_acq-{acq}_run-{run}_TB1map"),
        None => format!("{prefix}_acq-{acq}_TB1map"),
    }
}

/// `<prefix>_acq-x_TB1map` -> `<prefix>_acq-x_run-<run>_TB1map`.
fn number_run(target: &str, run: usize) -> String {
    let base = target.strip_suffix("_TB1map").unwrap_or(target);
    format!("{base}_run-{run}_TB1map")
}
