use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use zip::ZipArchive;

use crate::error::KiraError;

pub const IMAGE_EXTENSIONS: [&str; 2] = [".nii.gz", ".nii"];

pub fn extract_zip(zip_path: &Utf8Path, target_dir: &Utf8Path) -> Result<(), KiraError> {
    let file = fs::File::open(zip_path.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("open zip {zip_path}: {err}")))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| KiraError::Filesystem(format!("{zip_path}: {err}")))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.as_std_path().join(path),
            None => {
                return Err(KiraError::Filesystem(format!(
                    "{zip_path}: zip entry path traversal detected"
                )));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// Writes `content` next to `path` and renames it into place. An existing
/// file keeps its permission bits; a new one gets the umask default.
pub fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
    let parent = path
        .parent()
        .ok_or_else(|| KiraError::Filesystem(format!("invalid destination path {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let existing = fs::metadata(path.as_std_path())
        .ok()
        .map(|meta| meta.permissions());

    let mut builder = tempfile::Builder::new();
    builder.prefix(".kira-dcm2bids");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(0o666));
    }
    let mut temp = builder
        .tempfile_in(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| KiraError::Filesystem(format!("write {path}: {err}")))?;
    if let Some(permissions) = existing {
        temp.as_file()
            .set_permissions(permissions)
            .map_err(|err| KiraError::Filesystem(format!("permissions {path}: {err}")))?;
    }
    temp.persist(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("replace {path}: {err}")))?;
    Ok(())
}

pub fn rename(from: &Utf8Path, to: &Utf8Path) -> Result<(), KiraError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    fs::rename(from.as_std_path(), to.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("rename {from} -> {to}: {err}")))
}

pub fn remove_file_if_exists(path: &Utf8Path) -> Result<bool, KiraError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(KiraError::Filesystem(format!("remove {path}: {err}"))),
    }
}

pub fn remove_dir_if_exists(path: &Utf8Path) -> Result<bool, KiraError> {
    match fs::remove_dir_all(path.as_std_path()) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(KiraError::Filesystem(format!("remove {path}: {err}"))),
    }
}

/// Sorted entries of `dir`; a missing directory has no entries.
pub fn list_dir(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, KiraError> {
    let entries = match fs::read_dir(dir.as_std_path()) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(KiraError::Filesystem(format!("read {dir}: {err}"))),
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        if let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

pub fn list_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, KiraError> {
    Ok(list_dir(dir)?
        .into_iter()
        .filter(|path| path.as_std_path().is_file())
        .collect())
}

/// NIfTI images directly inside `dir`, sorted.
pub fn list_images(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, KiraError> {
    Ok(list_files(dir)?
        .into_iter()
        .filter(|path| split_image_name(path).is_some())
        .collect())
}

/// Sidecar documents directly inside `dir`, sorted.
pub fn list_json(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, KiraError> {
    Ok(list_files(dir)?
        .into_iter()
        .filter(|path| path.extension() == Some("json"))
        .collect())
}

/// Splits `sub-01_T1w.nii.gz` into (`sub-01_T1w`, `.nii.gz`).
pub fn split_image_name(path: &Utf8Path) -> Option<(&str, &'static str)> {
    let name = path.file_name()?;
    IMAGE_EXTENSIONS.iter().find_map(|ext| {
        name.strip_suffix(ext)
            .filter(|stem| !stem.is_empty())
            .map(|stem| (stem, *ext))
    })
}

/// File stem with `.nii.gz`, `.nii` or `.json` removed.
pub fn stem(path: &Utf8Path) -> Option<&str> {
    if let Some((stem, _)) = split_image_name(path) {
        return Some(stem);
    }
    path.file_name()?.strip_suffix(".json")
}

pub fn find_first<F>(root: &Utf8Path, predicate: F) -> Option<Utf8PathBuf>
where
    F: Fn(&Utf8Path) -> bool,
{
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(path.as_std_path()).ok()?;
        for entry in entries.flatten() {
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if path.as_std_path().is_dir() {
                stack.push(path);
            } else if predicate(&path) {
                return Some(path);
            }
        }
    }
    None
}

pub fn find_files<F>(root: &Utf8Path, predicate: F) -> Vec<Utf8PathBuf>
where
    F: Fn(&Utf8Path) -> bool,
{
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        if let Ok(entries) = fs::read_dir(path.as_std_path()) {
            for entry in entries.flatten() {
                let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                    continue;
                };
                if path.as_std_path().is_dir() {
                    stack.push(path);
                } else if predicate(&path) {
                    out.push(path);
                }
            }
        }
    }
    out.sort();
    out
}

pub fn has_extension(path: &Utf8Path, ext: &str) -> bool {
    path.extension()
        .map(|value| value.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

/// Shallowest directory under `root` (at most `max_depth` levels down) that holds files.
pub fn first_dir_with_files(root: &Utf8Path, max_depth: usize) -> Option<Utf8PathBuf> {
    let mut level = vec![root.to_path_buf()];
    for _ in 0..=max_depth {
        let mut next = Vec::new();
        for dir in level {
            let entries = list_dir(&dir).ok()?;
            let (dirs, files): (Vec<_>, Vec<_>) = entries
                .into_iter()
                .filter(|path| !is_hidden(path))
                .partition(|path| path.as_std_path().is_dir());
            if !files.is_empty() {
                return Some(dir);
            }
            next.extend(dirs);
        }
        level = next;
    }
    None
}

fn is_hidden(path: &Utf8Path) -> bool {
    path.file_name()
        .map(|name| name.starts_with('.') || name == "__MACOSX")
        .unwrap_or(false)
}

pub fn to_utf8(path: std::path::PathBuf) -> Result<Utf8PathBuf, KiraError> {
    Utf8PathBuf::from_path_buf(path)
        .map_err(|path| KiraError::Filesystem(format!("non UTF-8 path: {}", path.display())))
}
