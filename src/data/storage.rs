//! Scan data storage writers.
//!
//! Two outputs per scan:
//!
//! - **Incremental file** ([`ScanFileWriter`]): one CSV row per orchestrator
//!   tick, flushed after every row. A process crash mid-scan leaves a
//!   complete header plus every fully-flushed row and no partial row.
//! - **Finalized dataset** ([`write_finalized_dataset`]): the whole
//!   in-memory record store, written once at teardown, with a derived
//!   micrometre position column appended.
//!
//! Unavailable values serialize as empty fields, matching the nullable
//! columns of the record type.

use crate::error::{AppResult, FtsError};
use crate::scan::sample::{ScanRecord, SensorKind, SensorReading};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

fn storage_err(e: impl std::fmt::Display) -> FtsError {
    FtsError::Storage(e.to_string())
}

fn format_opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Header columns for the given sensor kind.
fn header(kind: SensorKind, position_label: &str) -> Vec<String> {
    let mut columns = vec!["timestamp".to_string(), position_label.to_string()];
    match kind {
        SensorKind::Quadrature => {
            columns.extend(["x", "y", "r", "theta"].map(String::from));
        }
        SensorKind::Frequency => {
            columns.extend(["frequency_ghz", "photocurrent_na"].map(String::from));
        }
    }
    columns
}

/// Serialize one record into the column layout of `kind`.
fn row(record: &ScanRecord, kind: SensorKind) -> Vec<String> {
    let mut fields = vec![format_opt(record.timestamp), format_opt(record.position)];
    match kind {
        SensorKind::Quadrature => {
            let quad = match record.sensor {
                Some(SensorReading::Quadrature(q)) => Some(q),
                _ => None,
            };
            fields.push(format_opt(quad.map(|q| q.x)));
            fields.push(format_opt(quad.map(|q| q.y)));
            fields.push(format_opt(quad.map(|q| q.r)));
            fields.push(format_opt(quad.map(|q| q.theta)));
        }
        SensorKind::Frequency => {
            let freq = match record.sensor {
                Some(SensorReading::Frequency(f)) => Some(f),
                _ => None,
            };
            fields.push(format_opt(freq.map(|f| f.frequency_ghz)));
            fields.push(format_opt(freq.map(|f| f.photocurrent_na)));
        }
    }
    fields
}

/// Row-at-a-time CSV writer for the incremental scan file.
pub struct ScanFileWriter {
    writer: csv::Writer<File>,
    kind: SensorKind,
    path: PathBuf,
}

impl ScanFileWriter {
    /// Create the output file (and its parent directory) and write the
    /// header row for the given sensor kind.
    pub fn create(path: &Path, kind: SensorKind, position_label: &str) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(storage_err)?;
            }
        }

        let file = File::create(path).map_err(storage_err)?;
        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(header(kind, position_label))
            .map_err(storage_err)?;
        writer.flush().map_err(storage_err)?;

        info!(path = %path.display(), "scan file opened");
        Ok(Self {
            writer,
            kind,
            path: path.to_path_buf(),
        })
    }

    /// Append one record and flush it to the OS immediately.
    pub fn append(&mut self, record: &ScanRecord) -> AppResult<()> {
        self.writer
            .write_record(row(record, self.kind))
            .map_err(storage_err)?;
        self.writer.flush().map_err(storage_err)
    }

    /// Where this writer is writing.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and close the file.
    pub fn finish(mut self) -> AppResult<()> {
        self.writer.flush().map_err(storage_err)
    }
}

/// Path of the finalized dataset belonging to an incremental file.
pub fn finalized_path(incremental: &Path) -> PathBuf {
    let stem = incremental
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "scan".to_string());
    incremental.with_file_name(format!("{stem}_final.csv"))
}

/// Write the complete in-memory record store as the finalized dataset.
///
/// Independent of the incremental file's schema: a derived `position_um`
/// column is appended after the sensor fields.
pub fn write_finalized_dataset(
    path: &Path,
    kind: SensorKind,
    records: &[ScanRecord],
) -> AppResult<()> {
    let file = File::create(path).map_err(storage_err)?;
    let mut writer = csv::Writer::from_writer(file);

    let mut columns = header(kind, "position_mm");
    columns.push("position_um".to_string());
    writer.write_record(columns).map_err(storage_err)?;

    for record in records {
        let mut fields = row(record, kind);
        fields.push(format_opt(record.position.map(|p| p * 1000.0)));
        writer.write_record(fields).map_err(storage_err)?;
    }

    writer.flush().map_err(storage_err)?;
    info!(path = %path.display(), rows = records.len(), "finalized dataset written");
    Ok(())
}
