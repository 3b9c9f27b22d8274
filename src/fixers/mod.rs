//! Metadata fixers. Each fixer describes a plan of image renames followed by
//! sidecar merges; [`FixerAction`] turns that plan into a stage. A fixer may
//! do extra work first (B1 conversion) through [`Fixer::prepare`].

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::KiraError;
use crate::fs_util;
use crate::scans;
use crate::sidecar::{self, SidecarPatch};
use crate::stage::{Action, ActionOutcome, StageContext, StageLog};

pub mod anat;
pub mod b1;
pub mod epi;
pub mod fmap;

pub use anat::FixAnat;
pub use b1::FixB1;
pub use epi::FixEpi;
pub use fmap::FixFmap;

/// Move an image (and its sidecar and scans row) to a new name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub from: Utf8PathBuf,
    pub to: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
    pub sidecar: Utf8PathBuf,
    pub patch: SidecarPatch,
    pub create: bool,
}

pub trait Fixer: Send + Sync {
    fn renames(&self, _ctx: &StageContext<'_>) -> Result<Vec<Rename>, KiraError> {
        Ok(Vec::new())
    }

    /// Merges for the tree as it is now; called again after renames are applied.
    fn merges(&self, ctx: &StageContext<'_>) -> Result<Vec<Merge>, KiraError>;

    /// Work done by [`Fixer::prepare`] that is still outstanding.
    fn outstanding(&self, _ctx: &StageContext<'_>) -> Result<Vec<String>, KiraError> {
        Ok(Vec::new())
    }

    fn prepare(&self, _ctx: &StageContext<'_>, _log: &StageLog) -> Result<(), KiraError> {
        Ok(())
    }
}

pub struct FixerAction<F>(pub F);

impl<F: Fixer> Action for FixerAction<F> {
    fn requires(&self, ctx: &StageContext<'_>) -> Result<Vec<Utf8PathBuf>, KiraError> {
        Ok(vec![ctx.unit.rawdata_dir()])
    }

    fn pending(&self, ctx: &StageContext<'_>) -> Result<Vec<String>, KiraError> {
        let mut pending = self.0.outstanding(ctx)?;
        let renames = self.0.renames(ctx)?;
        check_distinct_targets(&renames)?;
        pending.extend(
            renames
                .into_iter()
                .map(|rename| format!("rename {} -> {}", rename.from, rename.to)),
        );
        for merge in self.0.merges(ctx)? {
            let keys = sidecar::pending_changes(&merge.sidecar, &merge.patch, merge.create)?;
            if !keys.is_empty() {
                pending.push(format!("{}: {}", merge.sidecar, keys.join(", ")));
            }
        }
        Ok(pending)
    }

    fn execute(&self, ctx: &StageContext<'_>, log: &StageLog) -> Result<ActionOutcome, KiraError> {
        self.0.prepare(ctx, log)?;
        let renames = self.0.renames(ctx)?;
        check_distinct_targets(&renames)?;
        for rename in &renames {
            apply_rename(ctx, rename, log)?;
        }
        let mut written = 0;
        for merge in self.0.merges(ctx)? {
            if sidecar::merge_into(&merge.sidecar, &merge.patch, merge.create)? {
                log.info(format_args!("updated {}", merge.sidecar));
                written += 1;
            }
        }
        log.info(format_args!(
            "{} file(s) renamed, {written} sidecar(s) updated",
            renames.len()
        ));
        Ok(ActionOutcome::default())
    }
}

/// A rename from `from` to the image named `stem` + `ext` in `dir`, or `None`
/// when nothing would move or an existing target is protected (no `force`).
pub fn plan_rename(
    ctx: &StageContext<'_>,
    from: &Utf8Path,
    dir: &Utf8Path,
    stem: &str,
    ext: &str,
) -> Option<Rename> {
    let to = dir.join(format!("{stem}{ext}"));
    if to == from {
        return None;
    }
    if to.as_std_path().exists() && !ctx.force {
        tracing::warn!("{to} already exists, leaving {from} in place (use --force to overwrite)");
        return None;
    }
    Some(Rename {
        from: from.to_path_buf(),
        to,
    })
}

/// Two renames onto one target would overwrite the first moved image.
fn check_distinct_targets(renames: &[Rename]) -> Result<(), KiraError> {
    let mut sources: BTreeMap<&Utf8Path, Vec<&Utf8Path>> = BTreeMap::new();
    for rename in renames {
        sources
            .entry(rename.to.as_path())
            .or_default()
            .push(rename.from.as_path());
    }
    match sources.into_iter().find(|(_, from)| from.len() > 1) {
        Some((target, from)) => Err(KiraError::RenameConflict {
            target: target.to_path_buf(),
            sources: from.into_iter().map(Utf8Path::to_path_buf).collect(),
        }),
        None => Ok(()),
    }
}

fn apply_rename(ctx: &StageContext<'_>, rename: &Rename, log: &StageLog) -> Result<(), KiraError> {
    let from_json = sidecar::sidecar_path(&rename.from);
    let to_json = sidecar::sidecar_path(&rename.to);
    fs_util::remove_file_if_exists(&rename.to)?;
    fs_util::rename(&rename.from, &rename.to)?;
    if from_json.as_std_path().exists() {
        fs_util::remove_file_if_exists(&to_json)?;
        fs_util::rename(&from_json, &to_json)?;
    }
    scans::record_rename(ctx.unit, &rename.from, &rename.to)?;
    log.info(format_args!("renamed {} -> {}", rename.from, rename.to));
    Ok(())
}

/// Value of a BIDS entity (`run` in `..._run-2_...`).
pub fn entity<'a>(stem: &'a str, key: &str) -> Option<&'a str> {
    stem.split('_')
        .find_map(|part| part.strip_prefix(key).and_then(|rest| rest.strip_prefix('-')))
}

/// Trailing BIDS suffix (`bold` in `..._task-rest_bold`).
pub fn suffix(stem: &str) -> &str {
    stem.rsplit('_').next().unwrap_or(stem)
}
