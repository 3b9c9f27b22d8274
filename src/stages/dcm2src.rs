use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use super::precondition;
use crate::error::KiraError;
use crate::fs_util;
use crate::stage::{Action, ActionOutcome, StageContext, StageLog};
use crate::tools::run_checked;
use crate::unit::UnitOfWork;

/// How deep below an extracted archive the DICOM series may sit.
const ARCHIVE_SEARCH_DEPTH: usize = 3;

/// Renames the session's DICOM files into `sourcedata/<series>/` with dcm2niix.
pub struct Dcm2Src;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DicomInput {
    Archive(Utf8PathBuf),
    Directory(Utf8PathBuf),
}

impl Action for Dcm2Src {
    fn requires(&self, ctx: &StageContext<'_>) -> Result<Vec<Utf8PathBuf>, KiraError> {
        match &ctx.options.dicom_dir {
            Some(input) => Ok(vec![input.clone()]),
            // nothing to read, but a finished sourcedata needs no input
            None if has_dicoms(&ctx.unit.sourcedata_dir()) && !ctx.force => Ok(Vec::new()),
            None => Err(precondition(ctx, "--dicom-dir (no DICOM input given)")),
        }
    }

    fn pending(&self, ctx: &StageContext<'_>) -> Result<Vec<String>, KiraError> {
        let sourcedata = ctx.unit.sourcedata_dir();
        if has_dicoms(&sourcedata) {
            Ok(Vec::new())
        } else {
            Ok(vec![format!("no DICOM files in {sourcedata}")])
        }
    }

    fn execute(&self, ctx: &StageContext<'_>, log: &StageLog) -> Result<ActionOutcome, KiraError> {
        let input = ctx
            .options
            .dicom_dir
            .as_ref()
            .ok_or_else(|| precondition(ctx, "--dicom-dir (no DICOM input given)"))?;
        let sourcedata = ctx.unit.sourcedata_dir();
        if ctx.force && fs_util::remove_dir_if_exists(&sourcedata)? {
            log.info(format_args!("removed existing {sourcedata}"));
        }
        fs::create_dir_all(sourcedata.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("create {sourcedata}: {err}")))?;

        // keeps an extracted archive alive until dcm2niix is done with it
        let mut _extracted: Option<TempDir> = None;
        let dicom_root = match resolve_input(input, ctx.unit)? {
            DicomInput::Archive(archive) => {
                let temp = tempfile::Builder::new()
                    .prefix("kira-dcm2bids-")
                    .tempdir()
                    .map_err(|err| KiraError::Filesystem(err.to_string()))?;
                let dir = fs_util::to_utf8(temp.path().to_path_buf())?;
                log.info(format_args!("extracting {archive}"));
                fs_util::extract_zip(&archive, &dir)?;
                let root = fs_util::first_dir_with_files(&dir, ARCHIVE_SEARCH_DEPTH)
                    .unwrap_or_else(|| dir.clone());
                _extracted = Some(temp);
                root
            }
            DicomInput::Directory(dir) => dir,
        };
        log.info(format_args!("DICOM input: {dicom_root}"));

        let command = ctx
            .command("dcm2niix")
            .args(["-v", "0", "-b", "o", "-r", "y", "-w", "0", "-o"])
            .arg(sourcedata.as_str())
            .args(["-f", "%s_%d/%d_%5r.dcm"])
            .arg(dicom_root.as_str());
        let code = run_checked(ctx.tools, &command, log)?;
        Ok(ActionOutcome {
            exit_code: Some(code),
        })
    }
}

fn has_dicoms(dir: &Utf8Path) -> bool {
    fs_util::find_first(dir, |path| fs_util::has_extension(path, "dcm")).is_some()
}

/// A zip file, a directory holding the unit's zip, or a plain DICOM directory.
pub fn resolve_input(input: &Utf8Path, unit: &UnitOfWork) -> Result<DicomInput, KiraError> {
    if input.as_std_path().is_file() {
        if fs_util::has_extension(input, "zip") {
            return Ok(DicomInput::Archive(input.to_path_buf()));
        }
        return Err(KiraError::Filesystem(format!(
            "{input} is neither a directory nor a zip archive"
        )));
    }
    let names: Vec<String> = fs_util::list_files(input)?
        .iter()
        .filter(|path| fs_util::has_extension(path, "zip"))
        .filter_map(|path| path.file_name().map(str::to_string))
        .collect();
    match match_archive(&names, unit.subject().as_str(), unit.session().as_str()) {
        Some(name) => Ok(DicomInput::Archive(input.join(name))),
        None => Ok(DicomInput::Directory(input.to_path_buf())),
    }
}

/// Picks the archive for one unit: exact names first, then case-insensitive,
/// then any zip mentioning both ids.
pub fn match_archive(names: &[String], subject: &str, session: &str) -> Option<String> {
    let candidates = [
        format!("{subject}_ses-{session}.zip"),
        format!("{subject}_ses_{session}.zip"),
        format!("{subject}_{session}.zip"),
        format!("{subject}-ses-{session}.zip"),
        format!("sub-{subject}_ses-{session}.zip"),
        format!("sub-{subject}_ses_{session}.zip"),
    ];
    if let Some(name) = names.iter().find(|name| candidates.contains(name)) {
        return Some(name.clone());
    }
    if let Some(name) = names.iter().find(|name| {
        candidates
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(name))
    }) {
        return Some(name.clone());
    }
    let subject = subject.to_lowercase();
    let session = session.to_lowercase();
    names
        .iter()
        .find(|name| {
            let lower = name.to_lowercase();
            lower.ends_with(".zip") && lower.contains(&subject) && lower.contains(&session)
        })
        .cloned()
}
