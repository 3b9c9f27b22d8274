use std::sync::LazyLock;

use regex::Regex;

use super::{Fixer, Merge, Rename, plan_rename, suffix};
use crate::error::KiraError;
use crate::fs_util;
use crate::sidecar::SidecarPatch;
use crate::stage::StageContext;
use crate::unit::{Modality, UnitOfWork};

static B0_COMBINED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<prefix>sub-[A-Za-z0-9]+_ses-[A-Za-z0-9]+)_run-(?P<run>\d+)_b0-combined(?P<idx>[12])$")
        .unwrap()
});

static GRE_EPI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<prefix>sub-[A-Za-z0-9]+_ses-[A-Za-z0-9]+)_acq-gre_dir-AP_run-(?P<run>\d+)_epi(?P<idx>[12])$")
        .unwrap()
});

/// Fieldmap fixes: scanner names to BIDS fieldmap names, `Units` and `IntendedFor`.
pub struct FixFmap;

impl Fixer for FixFmap {
    fn renames(&self, ctx: &StageContext<'_>) -> Result<Vec<Rename>, KiraError> {
        let dir = ctx.unit.modality_dir(Modality::Fmap);
        let prefix = ctx.unit.prefix();
        let mut renames = Vec::new();
        for image in fs_util::list_images(&dir)? {
            let Some((stem, ext)) = fs_util::split_image_name(&image) else {
                continue;
            };
            let Some(new_stem) = fieldmap_stem(stem, &prefix) else {
                continue;
            };
            if let Some(rename) = plan_rename(ctx, &image, &dir, &new_stem, ext) {
                renames.push(rename);
            }
        }
        Ok(renames)
    }

    fn merges(&self, ctx: &StageContext<'_>) -> Result<Vec<Merge>, KiraError> {
        let intended_for = intended_for(ctx.unit)?;
        let mut merges = Vec::new();
        for json in fs_util::list_json(&ctx.unit.modality_dir(Modality::Fmap))? {
            let Some(stem) = fs_util::stem(&json) else {
                continue;
            };
            let mut patch = SidecarPatch::new();
            let kind = suffix(stem);
            if kind == "fieldmap" {
                patch.insert("Units", ctx.config.fieldmap_units.as_str());
            }
            if matches!(kind, "fieldmap" | "epi" | "phasediff") && !intended_for.is_empty() {
                patch.insert("IntendedFor", intended_for.clone());
            }
            if !patch.is_empty() {
                merges.push(Merge {
                    sidecar: json,
                    patch,
                    create: false,
                });
            }
        }
        Ok(merges)
    }
}

fn fieldmap_stem(stem: &str, prefix: &str) -> Option<String> {
    if let Some(caps) = B0_COMBINED.captures(stem) {
        if &caps["prefix"] != prefix {
            return None;
        }
        let kind = if &caps["idx"] == "1" { "magnitude" } else { "fieldmap" };
        return Some(format!("{prefix}_acq-b0_run-{}_{kind}", &caps["run"]));
    }
    if let Some(caps) = GRE_EPI.captures(stem) {
        if &caps["prefix"] != prefix {
            return None;
        }
        let kind = if &caps["idx"] == "1" { "fieldmap" } else { "magnitude" };
        return Some(format!("{prefix}_acq-gre_run-{}_{kind}", &caps["run"]));
    }
    None
}

/// The session's BOLD runs, relative to the subject directory, sorted.
pub fn intended_for(unit: &UnitOfWork) -> Result<Vec<String>, KiraError> {
    let task_prefix = format!("{}_task-", unit.prefix());
    let mut paths: Vec<String> = fs_util::list_images(&unit.modality_dir(Modality::Func))?
        .iter()
        .filter_map(|image| image.file_name())
        .filter(|name| name.starts_with(&task_prefix) && name.ends_with("_bold.nii.gz"))
        .map(|name| format!("ses-{}/func/{name}", unit.session()))
        .collect();
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_scanner_fieldmap_names() {
        let prefix = "sub-S01_ses-MR1";
        assert_eq!(
            fieldmap_stem("sub-S01_ses-MR1_run-1_b0-combined1", prefix).as_deref(),
            Some("sub-S01_ses-MR1_acq-b0_run-1_magnitude")
        );
        assert_eq!(
            fieldmap_stem("sub-S01_ses-MR1_run-1_b0-combined2", prefix).as_deref(),
            Some("sub-S01_ses-MR1_acq-b0_run-1_fieldmap")
        );
        assert_eq!(
            fieldmap_stem("sub-S01_ses-MR1_acq-gre_dir-AP_run-2_epi1", prefix).as_deref(),
            Some("sub-S01_ses-MR1_acq-gre_run-2_fieldmap")
        );
        assert_eq!(
            fieldmap_stem("sub-S02_ses-MR1_run-1_b0-combined1", prefix),
            None
        );
    }
}
