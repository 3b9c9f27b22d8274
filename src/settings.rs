use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;
use crate::fs_util;
use crate::locator;

/// Per-user record of the study registered with `init`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub active_config: Option<String>,
    #[serde(default)]
    pub registered_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: Utf8PathBuf,
}

impl SettingsStore {
    pub fn new() -> Result<Self, KiraError> {
        let path = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.config_dir()
                        .join("kira-dcm2bids")
                        .join("settings.json"),
                )
                .ok()
            })
            .ok_or_else(|| {
                KiraError::Settings("unable to resolve user config directory".to_string())
            })?;
        Ok(Self { path })
    }

    pub fn at(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn load(&self) -> Result<Settings, KiraError> {
        if !self.path.as_std_path().exists() {
            return Ok(Settings::default());
        }
        let content = fs::read_to_string(self.path.as_std_path())
            .map_err(|err| KiraError::Settings(format!("read {}: {err}", self.path)))?;
        serde_json::from_str(&content)
            .map_err(|err| KiraError::Settings(format!("parse {}: {err}", self.path)))
    }

    pub fn save(&self, settings: &Settings) -> Result<(), KiraError> {
        let mut content = serde_json::to_vec_pretty(settings)
            .map_err(|err| KiraError::Settings(err.to_string()))?;
        content.push(b'\n');
        fs_util::write_atomic(&self.path, &content)
    }

    /// Records `config` (a study's `code/config.json`) as the active study.
    pub fn register(&self, config: &Utf8Path) -> Result<Settings, KiraError> {
        let absolute = fs::canonicalize(config.as_std_path())
            .map_err(|err| KiraError::Settings(format!("{config}: {err}")))?;
        let absolute = Utf8PathBuf::from_path_buf(absolute).map_err(|path| {
            KiraError::Settings(format!("non UTF-8 path: {}", path.display()))
        })?;
        let root = study_root_of(&absolute)
            .ok_or_else(|| KiraError::InvalidStudyDir(absolute.clone()))?;
        if !locator::has_marker(&root) {
            return Err(KiraError::InvalidStudyDir(root));
        }
        let settings = Settings {
            active_config: Some(absolute.to_string()),
            registered_at: Some(Utc::now().to_rfc3339()),
        };
        self.save(&settings)?;
        tracing::info!("registered study {root}");
        Ok(settings)
    }

    /// Root of the registered study, if one is registered and still present.
    pub fn active_root(&self) -> Result<Option<Utf8PathBuf>, KiraError> {
        let settings = self.load()?;
        let Some(config) = settings.active_config else {
            return Ok(None);
        };
        Ok(study_root_of(Utf8Path::new(&config)).filter(|root| locator::has_marker(root)))
    }
}

fn study_root_of(config: &Utf8Path) -> Option<Utf8PathBuf> {
    if config.file_name() != Some(locator::MARKER_FILE) {
        return None;
    }
    let code_dir = config.parent()?;
    if code_dir.file_name() != Some(locator::MARKER_DIR) {
        return None;
    }
    code_dir.parent().map(Utf8Path::to_path_buf)
}
