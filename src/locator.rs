use camino::{Utf8Path, Utf8PathBuf};

use crate::error::KiraError;
use crate::settings::SettingsStore;

pub const MARKER_DIR: &str = "code";
pub const MARKER_FILE: &str = "config.json";

pub fn marker_path(root: &Utf8Path) -> Utf8PathBuf {
    root.join(MARKER_DIR).join(MARKER_FILE)
}

pub fn has_marker(dir: &Utf8Path) -> bool {
    marker_path(dir).as_std_path().is_file()
}

/// Finds the study root: an explicit root wins and must carry the marker,
/// otherwise `start` and its ancestors are searched up to the filesystem root.
pub fn locate(explicit: Option<&Utf8Path>, start: &Utf8Path) -> Result<Utf8PathBuf, KiraError> {
    if let Some(root) = explicit {
        return check_explicit(root, start);
    }
    search_ancestors(start).ok_or_else(|| KiraError::StudyNotFound {
        start: start.to_path_buf(),
    })
}

/// Like [`locate`], falling back to the study registered with `init`.
pub fn resolve_root(
    explicit: Option<&Utf8Path>,
    start: &Utf8Path,
    settings: Option<&SettingsStore>,
) -> Result<Utf8PathBuf, KiraError> {
    if let Some(root) = explicit {
        return check_explicit(root, start);
    }
    if let Some(root) = search_ancestors(start) {
        return Ok(root);
    }
    if let Some(store) = settings {
        match store.active_root() {
            Ok(Some(root)) => {
                tracing::debug!("using registered study {root}");
                return Ok(root);
            }
            Ok(None) => {}
            Err(err) => tracing::warn!("ignoring unreadable settings: {err}"),
        }
    }
    Err(KiraError::StudyNotFound {
        start: start.to_path_buf(),
    })
}

fn check_explicit(root: &Utf8Path, start: &Utf8Path) -> Result<Utf8PathBuf, KiraError> {
    let root = if root.is_absolute() {
        root.to_path_buf()
    } else {
        start.join(root)
    };
    if has_marker(&root) {
        Ok(root)
    } else {
        Err(KiraError::InvalidStudyDir(root))
    }
}

fn search_ancestors(start: &Utf8Path) -> Option<Utf8PathBuf> {
    start
        .ancestors()
        .find(|dir| has_marker(dir))
        .map(Utf8Path::to_path_buf)
}
