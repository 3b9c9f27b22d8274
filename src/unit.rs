use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Anat,
    Func,
    Fmap,
    Dwi,
}

impl Modality {
    pub const ALL: [Modality; 4] = [
        Modality::Anat,
        Modality::Func,
        Modality::Fmap,
        Modality::Dwi,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Modality::Anat => "anat",
            Modality::Func => "func",
            Modality::Fmap => "fmap",
            Modality::Dwi => "dwi",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Which modality directories a stage walks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModalityFilter {
    #[default]
    All,
    Anat,
    Func,
    Fmap,
    Dwi,
}

impl ModalityFilter {
    pub fn modalities(&self) -> Vec<Modality> {
        match self {
            ModalityFilter::All => Modality::ALL.to_vec(),
            ModalityFilter::Anat => vec![Modality::Anat],
            ModalityFilter::Func => vec![Modality::Func],
            ModalityFilter::Fmap => vec![Modality::Fmap],
            ModalityFilter::Dwi => vec![Modality::Dwi],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubjectId {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        normalize_label(value, "sub-", "subject").map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        normalize_label(value, "ses-", "session").map(Self)
    }
}

fn normalize_label(value: &str, prefix: &str, kind: &'static str) -> Result<String, KiraError> {
    let trimmed = value.trim();
    let label = trimmed.strip_prefix(prefix).unwrap_or(trimmed);
    let is_valid = !label.is_empty() && label.chars().all(|ch| ch.is_ascii_alphanumeric());
    if !is_valid {
        return Err(KiraError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        });
    }
    Ok(label.to_string())
}

/// One (subject, session) pair inside a study, with every path derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOfWork {
    root: Utf8PathBuf,
    subject: SubjectId,
    session: SessionId,
}

impl UnitOfWork {
    pub fn describe(root: &Utf8Path, subject: &str, session: &str) -> Result<Self, KiraError> {
        Ok(Self {
            root: root.to_path_buf(),
            subject: subject.parse()?,
            session: session.parse()?,
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn subject(&self) -> &SubjectId {
        &self.subject
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// `sub-<id>_ses-<id>`, the filename prefix of every file in the session.
    pub fn prefix(&self) -> String {
        format!("sub-{}_ses-{}", self.subject, self.session)
    }

    pub fn sourcedata_dir(&self) -> Utf8PathBuf {
        self.root
            .join("sourcedata")
            .join(format!("sub-{}", self.subject))
            .join(format!("ses-{}", self.session))
    }

    pub fn rawdata_root(&self) -> Utf8PathBuf {
        self.root.join("rawdata")
    }

    pub fn rawdata_subject_dir(&self) -> Utf8PathBuf {
        self.rawdata_root().join(format!("sub-{}", self.subject))
    }

    pub fn rawdata_dir(&self) -> Utf8PathBuf {
        self.rawdata_subject_dir().join(format!("ses-{}", self.session))
    }

    pub fn modality_dir(&self, modality: Modality) -> Utf8PathBuf {
        self.rawdata_dir().join(modality.dir_name())
    }

    pub fn scans_tsv(&self) -> Utf8PathBuf {
        self.rawdata_dir().join(format!("{}_scans.tsv", self.prefix()))
    }

    pub fn log_dir(&self) -> Utf8PathBuf {
        self.root
            .join("derivatives")
            .join("logs")
            .join(format!("sub-{}", self.subject))
            .join(format!("ses-{}", self.session))
    }

    pub fn stage_log(&self, stage: &str) -> Utf8PathBuf {
        self.log_dir().join(format!("{stage}.log"))
    }

    pub fn mriqc_dir(&self) -> Utf8PathBuf {
        self.root.join("derivatives").join("mriqc")
    }
}

impl fmt::Display for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix())
    }
}
