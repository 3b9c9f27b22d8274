use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::{Fixer, Merge, Rename, entity, plan_rename, suffix};
use crate::error::KiraError;
use crate::fs_util;
use crate::sidecar::{SidecarPatch, sidecar_path};
use crate::stage::{StageContext, StageLog};
use crate::unit::Modality;

const BLOCK: &str = "mp2rage";

// dcm2niix appends `_e<N>` / `_inv<N>` / `_ph` after the BIDS suffix
static INDEX_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<head>.+?)_(?P<suffix>[A-Za-z0-9]+)(?:_(?P<kind>e|inv)(?P<n>\d+))?(?P<ph>_ph)?$")
        .unwrap()
});

/// Anatomical fixes: entity-style echo/inversion names and MP2RAGE metadata.
pub struct FixAnat;

impl Fixer for FixAnat {
    fn renames(&self, ctx: &StageContext<'_>) -> Result<Vec<Rename>, KiraError> {
        let dir = ctx.unit.modality_dir(Modality::Anat);
        let mut renames = Vec::new();
        for image in fs_util::list_images(&dir)? {
            let Some((stem, ext)) = fs_util::split_image_name(&image) else {
                continue;
            };
            let Some(new_stem) = entity_stem(stem) else {
                continue;
            };
            if let Some(rename) = plan_rename(ctx, &image, &dir, &new_stem, ext) {
                renames.push(rename);
            }
        }
        Ok(renames)
    }

    fn merges(&self, ctx: &StageContext<'_>) -> Result<Vec<Merge>, KiraError> {
        let Some(value) = ctx.config.extra(BLOCK) else {
            return Ok(Vec::new());
        };
        let block = Mp2rageBlock::parse(value).map_err(|violations| {
            KiraError::ConfigValidation {
                path: ctx.config.config_path.clone(),
                violations,
            }
        })?;

        let mut merges = Vec::new();
        for image in fs_util::list_images(&ctx.unit.modality_dir(Modality::Anat))? {
            let Some((stem, _)) = fs_util::split_image_name(&image) else {
                continue;
            };
            if let Some(patch) = block.patch_for(stem) {
                merges.push(Merge {
                    sidecar: sidecar_path(&image),
                    patch,
                    create: true,
                });
            }
        }
        Ok(merges)
    }

    fn prepare(&self, ctx: &StageContext<'_>, log: &StageLog) -> Result<(), KiraError> {
        if ctx.config.extra(BLOCK).is_none() {
            log.warn(format_args!(
                "no {BLOCK} metadata in config or code/{BLOCK}.json, MP2RAGE sidecars left unchanged"
            ));
        }
        Ok(())
    }
}

/// `x_T2star_e2` -> `x_echo-2_T2star`, `x_MP2RAGE_inv1_ph` -> `x_inv-1_part-phase_MP2RAGE`.
fn entity_stem(stem: &str) -> Option<String> {
    let caps = INDEX_SUFFIX.captures(stem)?;
    let head = caps.name("head")?.as_str();
    let bids_suffix = caps.name("suffix")?.as_str();
    let index = match (caps.name("kind"), caps.name("n")) {
        (Some(kind), Some(n)) => {
            let key = if kind.as_str() == "e" { "echo" } else { "inv" };
            Some(format!("_{key}-{}", n.as_str()))
        }
        _ => None,
    };
    let has_part = head.contains("_part-");
    let phase = caps.name("ph").is_some() && !has_part;
    if index.is_none() && !phase {
        return None;
    }
    let index = index.unwrap_or_default();
    let part = if phase { "_part-phase" } else { "" };
    let renamed = match head.find("_part-") {
        Some(at) => format!("{}{index}{}_{bids_suffix}", &head[..at], &head[at..]),
        None => format!("{head}{index}{part}_{bids_suffix}"),
    };
    Some(renamed)
}

struct Mp2rageBlock {
    common: Map<String, Value>,
    inversion_time: Vec<Value>,
    flip_angle: Vec<Value>,
}

impl Mp2rageBlock {
    fn parse(value: &Value) -> Result<Self, Vec<String>> {
        let Some(object) = value.as_object() else {
            return Err(vec![format!("`{BLOCK}`: expected an object")]);
        };
        let mut violations = Vec::new();
        for key in ["RepetitionTimeExcitation", "RepetitionTimePreparation"] {
            match object.get(key) {
                None => violations.push(format!("`{BLOCK}.{key}`: missing")),
                Some(value) if !value.is_number() => {
                    violations.push(format!("`{BLOCK}.{key}`: expected a number"))
                }
                Some(_) => {}
            }
        }
        match object.get("NumberShots") {
            None => violations.push(format!("`{BLOCK}.NumberShots`: missing")),
            Some(value) if !(value.is_number() || value.is_array()) => {
                violations.push(format!("`{BLOCK}.NumberShots`: expected a number or list"))
            }
            Some(_) => {}
        }
        let inversion_time = pair(object, "InversionTime", &mut violations);
        let flip_angle = pair(object, "FlipAngle", &mut violations);
        if !violations.is_empty() {
            return Err(violations);
        }
        let common = object
            .iter()
            .filter(|(key, _)| key.as_str() != "InversionTime" && key.as_str() != "FlipAngle")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(Self {
            common,
            inversion_time,
            flip_angle,
        })
    }

    fn patch_for(&self, stem: &str) -> Option<SidecarPatch> {
        let mut patch = SidecarPatch::new();
        match suffix(stem) {
            "MP2RAGE" => {
                patch.extend(&self.common);
                let inversion = entity(stem, "inv")
                    .and_then(|value| value.parse::<usize>().ok())
                    .filter(|index| (1..=2).contains(index));
                if let Some(index) = inversion {
                    patch.insert("InversionTime", self.inversion_time[index - 1].clone());
                    patch.insert("FlipAngle", self.flip_angle[index - 1].clone());
                }
                if entity(stem, "part") == Some("phase") {
                    patch.insert("Units", "rad");
                }
            }
            "T1w" | "UNIT1" => {
                let is_mp2rage = entity(stem, "acq")
                    .map(|acq| acq.to_lowercase().contains("mp2rage"))
                    .unwrap_or(false);
                if !is_mp2rage {
                    return None;
                }
                patch.extend(&self.common);
            }
            _ => return None,
        }
        Some(patch)
    }
}

fn pair(object: &Map<String, Value>, key: &str, violations: &mut Vec<String>) -> Vec<Value> {
    match object.get(key).and_then(Value::as_array) {
        Some(values) if values.len() == 2 && values.iter().all(Value::is_number) => values.clone(),
        Some(_) => {
            violations.push(format!("`{BLOCK}.{key}`: expected two numbers"));
            Vec::new()
        }
        None => {
            violations.push(format!("`{BLOCK}.{key}`: missing or not a list"));
            Vec::new()
        }
    }
}
