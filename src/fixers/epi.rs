use super::{Fixer, Merge, entity, suffix};
use crate::config::PhaseEncodingDirection;
use crate::error::KiraError;
use crate::fs_util;
use crate::sidecar::{Sidecar, SidecarPatch};
use crate::stage::StageContext;
use crate::unit::Modality;

/// Water-fat chemical shift in ppm.
const WATER_FAT_SHIFT_PPM: f64 = 3.4;

/// EPI fixes: `PhaseEncodingDirection` and `TotalReadoutTime` on EPI fieldmaps
/// and BOLD runs.
pub struct FixEpi;

impl Fixer for FixEpi {
    fn merges(&self, ctx: &StageContext<'_>) -> Result<Vec<Merge>, KiraError> {
        let ap = ctx.config.epi_ap_phase_enc_dir;
        let mut targets = Vec::new();
        for json in fs_util::list_json(&ctx.unit.modality_dir(Modality::Fmap))? {
            let Some(stem) = fs_util::stem(&json) else {
                continue;
            };
            if suffix(stem) != "epi" {
                continue;
            }
            if let Some(direction) = direction_for(entity(stem, "dir"), ap, false) {
                targets.push((json.clone(), direction));
            }
        }
        for json in fs_util::list_json(&ctx.unit.modality_dir(Modality::Func))? {
            let Some(stem) = fs_util::stem(&json) else {
                continue;
            };
            if suffix(stem) != "bold" {
                continue;
            }
            if let Some(direction) = direction_for(entity(stem, "dir"), ap, true) {
                targets.push((json.clone(), direction));
            }
        }

        let mut merges = Vec::new();
        for (json, direction) in targets {
            let sidecar = Sidecar::load(&json)?;
            let mut patch = SidecarPatch::new().set("PhaseEncodingDirection", direction.to_string());
            if let Some(seconds) = ctx.config.total_readout_time.or_else(|| derived_readout(&sidecar)) {
                patch.insert("TotalReadoutTime", seconds);
            }
            merges.push(Merge {
                sidecar: json,
                patch,
                create: false,
            });
        }
        Ok(merges)
    }
}

/// AP keeps the configured token, PA gets the opposite polarity. Runs
/// without a `dir` entity count as AP only when `default_ap` is set.
fn direction_for(
    dir: Option<&str>,
    ap: PhaseEncodingDirection,
    default_ap: bool,
) -> Option<PhaseEncodingDirection> {
    match dir {
        Some("AP") => Some(ap),
        Some("PA") => Some(ap.opposite()),
        None if default_ap => Some(ap),
        _ => None,
    }
}

/// Readout time from Philips fields, for sidecars that carry none yet.
fn derived_readout(sidecar: &Sidecar) -> Option<f64> {
    if sidecar.get("TotalReadoutTime").is_some() {
        return None;
    }
    let water_fat_shift = sidecar.get_f64("WaterFatShift")?;
    let frequency = sidecar.get_f64("ImagingFrequency")?;
    let epi_factor = sidecar.get_f64("EchoTrainLength")?;
    total_readout_time(water_fat_shift, frequency, epi_factor)
}

pub fn total_readout_time(water_fat_shift: f64, frequency_mhz: f64, epi_factor: f64) -> Option<f64> {
    if frequency_mhz <= 0.0 || epi_factor <= 0.0 {
        return None;
    }
    let echo_spacing = water_fat_shift / (frequency_mhz * WATER_FAT_SHIFT_PPM * (epi_factor + 1.0));
    let seconds = echo_spacing * epi_factor;
    Some((seconds * 1e6).round() / 1e6)
}
