use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use csv::{QuoteStyle, ReaderBuilder, StringRecord, WriterBuilder};

use crate::error::KiraError;
use crate::fs_util;
use crate::unit::UnitOfWork;

const MISSING: &str = "n/a";

/// The per-session `<prefix>_scans.tsv`: a header row plus one row per image,
/// keyed by the image path relative to the session directory.
#[derive(Debug, Clone)]
pub struct ScansTable {
    path: Utf8PathBuf,
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl ScansTable {
    /// An empty table with the `filename` and `acq_time` columns.
    pub fn new(path: &Utf8Path) -> Self {
        Self {
            path: path.to_path_buf(),
            header: vec!["filename".to_string(), "acq_time".to_string()],
            rows: Vec::new(),
        }
    }

    pub fn load(path: &Utf8Path) -> Result<Option<Self>, KiraError> {
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("read {path}: {err}")))?;
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .has_headers(false)
            .from_reader(content.as_slice());

        let mut records = Vec::new();
        for record in reader.records() {
            let record =
                record.map_err(|err| KiraError::Filesystem(format!("parse {path}: {err}")))?;
            if record.iter().all(|field| field.trim().is_empty()) {
                continue;
            }
            records.push(to_row(&record));
        }

        let mut records = records.into_iter();
        let mut table = Self::new(path);
        if let Some(header) = records.next() {
            table.header = header;
        }
        let width = table.header.len();
        table.rows = records
            .map(|mut row| {
                row.resize(width.max(row.len()), MISSING.to_string());
                row
            })
            .collect();
        Ok(Some(table))
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.rows
            .iter()
            .any(|row| row.first().map(String::as_str) == Some(filename))
    }

    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        let mut changed = false;
        for row in &mut self.rows {
            if let Some(name) = row.first_mut().filter(|name| name.as_str() == from) {
                *name = to.to_string();
                changed = true;
            }
        }
        changed
    }

    pub fn remove(&mut self, filename: &str) -> bool {
        let before = self.rows.len();
        self.rows.retain(|row| row.first().map(String::as_str) != Some(filename));
        self.rows.len() != before
    }

    /// Appends a row for `filename`; every column but `acq_time` reads `n/a`.
    pub fn add(&mut self, filename: &str, acq_time: &str) -> bool {
        if self.contains(filename) {
            return false;
        }
        let row = self
            .header
            .iter()
            .enumerate()
            .map(|(index, column)| match (index, column.as_str()) {
                (0, _) => filename.to_string(),
                (_, "acq_time") => acq_time.to_string(),
                _ => MISSING.to_string(),
            })
            .collect();
        self.rows.push(row);
        true
    }

    pub fn save(&self) -> Result<(), KiraError> {
        let mut writer = WriterBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .quote_style(QuoteStyle::Necessary)
            .from_writer(Vec::new());
        for row in std::iter::once(&self.header).chain(&self.rows) {
            writer
                .write_record(row)
                .map_err(|err| KiraError::Filesystem(format!("write {}: {err}", self.path)))?;
        }
        let content = writer
            .into_inner()
            .map_err(|err| KiraError::Filesystem(format!("write {}: {err}", self.path)))?;
        fs_util::write_atomic(&self.path, &content)
    }
}

fn to_row(record: &StringRecord) -> Vec<String> {
    record.iter().map(str::to_string).collect()
}

fn relative_name(unit: &UnitOfWork, image: &Utf8Path) -> Option<String> {
    image
        .strip_prefix(unit.rawdata_dir())
        .ok()
        .map(|path| path.as_str().replace('\\', "/"))
}

/// Follows an image rename inside the unit's scans table, if the table lists it.
pub fn record_rename(unit: &UnitOfWork, from: &Utf8Path, to: &Utf8Path) -> Result<(), KiraError> {
    let (Some(from), Some(to)) = (relative_name(unit, from), relative_name(unit, to)) else {
        return Ok(());
    };
    let Some(mut table) = ScansTable::load(&unit.scans_tsv())? else {
        return Ok(());
    };
    if table.rename(&from, &to) {
        table.save()?;
    }
    Ok(())
}

pub fn record_removal(unit: &UnitOfWork, image: &Utf8Path) -> Result<(), KiraError> {
    let Some(name) = relative_name(unit, image) else {
        return Ok(());
    };
    let Some(mut table) = ScansTable::load(&unit.scans_tsv())? else {
        return Ok(());
    };
    if table.remove(&name) {
        table.save()?;
    }
    Ok(())
}

/// Lists a new image in the unit's scans table, creating the table if needed.
pub fn record_addition(
    unit: &UnitOfWork,
    image: &Utf8Path,
    acq_time: &str,
) -> Result<(), KiraError> {
    let Some(name) = relative_name(unit, image) else {
        return Ok(());
    };
    let path = unit.scans_tsv();
    let mut table = match ScansTable::load(&path)? {
        Some(table) => table,
        None => ScansTable::new(&path),
    };
    if table.add(&name, acq_time) {
        table.save()?;
    }
    Ok(())
}
