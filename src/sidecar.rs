//! Targeted merges into the JSON sidecars that sit next to each image.
//!
//! A sidecar is never rewritten wholesale: a [`SidecarPatch`] names the keys to
//! add or overwrite, every other key (and the key order) is left alone, and the
//! file is only touched when the merge changes something.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Map, Value};

use crate::error::KiraError;
use crate::fs_util;

pub type Document = Map<String, Value>;

/// `anat/x_T1w.nii.gz` -> `anat/x_T1w.json`.
pub fn sidecar_path(image: &Utf8Path) -> Utf8PathBuf {
    match fs_util::split_image_name(image) {
        Some((stem, _)) => image.with_file_name(format!("{stem}.json")),
        None => image.with_extension("json"),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidecarPatch(Map<String, Value>);

impl SidecarPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn extend(&mut self, fields: &Map<String, Value>) {
        for (key, value) in fields {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Keys whose value in `doc` differs from the patch.
    pub fn changes(&self, doc: &Document) -> Vec<String> {
        self.0
            .iter()
            .filter(|(key, value)| doc.get(key.as_str()) != Some(*value))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn apply(&self, doc: &mut Document) -> bool {
        let mut changed = false;
        for (key, value) in &self.0 {
            if doc.get(key) != Some(value) {
                doc.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }
}

#[derive(Debug, Clone)]
pub struct Sidecar {
    path: Utf8PathBuf,
    doc: Document,
    exists: bool,
}

impl Sidecar {
    pub fn load(path: &Utf8Path) -> Result<Self, KiraError> {
        let content = fs::read_to_string(path.as_std_path()).map_err(|err| KiraError::Sidecar {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let value: Value = serde_json::from_str(&content).map_err(|err| KiraError::Sidecar {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        match value {
            Value::Object(doc) => Ok(Self {
                path: path.to_path_buf(),
                doc,
                exists: true,
            }),
            _ => Err(KiraError::Sidecar {
                path: path.to_path_buf(),
                message: "top-level value must be a JSON object".to_string(),
            }),
        }
    }

    pub fn load_or_empty(path: &Utf8Path) -> Result<Self, KiraError> {
        if path.as_std_path().exists() {
            return Self::load(path);
        }
        Ok(Self {
            path: path.to_path_buf(),
            doc: Document::new(),
            exists: false,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.doc.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.doc.get(key).and_then(Value::as_f64)
    }

    pub fn merge(&mut self, patch: &SidecarPatch) -> bool {
        patch.apply(&mut self.doc)
    }

    /// Replaces the file atomically, keeping the previous permission bits.
    pub fn save(&mut self) -> Result<(), KiraError> {
        let mut content =
            serde_json::to_vec_pretty(&self.doc).map_err(|err| KiraError::Sidecar {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        content.push(b'\n');
        fs_util::write_atomic(&self.path, &content)?;
        self.exists = true;
        Ok(())
    }
}

/// Merges `patch` into the sidecar at `path`. A missing sidecar is created only
/// when `create` is set. Returns whether the file was written.
pub fn merge_into(path: &Utf8Path, patch: &SidecarPatch, create: bool) -> Result<bool, KiraError> {
    let mut sidecar = if create {
        Sidecar::load_or_empty(path)?
    } else {
        Sidecar::load(path)?
    };
    let changed = sidecar.merge(patch);
    if !changed && sidecar.exists() {
        return Ok(false);
    }
    sidecar.save()?;
    tracing::debug!("updated sidecar {path}");
    Ok(true)
}

/// What [`merge_into`] would change, without writing anything.
pub fn pending_changes(
    path: &Utf8Path,
    patch: &SidecarPatch,
    create: bool,
) -> Result<Vec<String>, KiraError> {
    if !path.as_std_path().exists() {
        if !create {
            return Err(KiraError::Sidecar {
                path: path.to_path_buf(),
                message: "sidecar does not exist".to_string(),
            });
        }
        let mut keys = patch.changes(&Document::new());
        if keys.is_empty() {
            keys.push("(new sidecar)".to_string());
        }
        return Ok(keys);
    }
    Ok(patch.changes(Sidecar::load(path)?.document()))
}
