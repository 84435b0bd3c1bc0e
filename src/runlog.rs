//! Append-only record of every evaluation in a session.

use crate::coefficients::CoefficientVector;
use crate::error::{CalibrationError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Outcome class of one evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Recoverable failure scored with the penalty
    Penalized,
    /// Fatal failure that ended the session
    Aborted,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Penalized => "penalized",
            Status::Aborted => "aborted",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ErrorRecord {
    pub evaluation: usize,
    pub timestamp: DateTime<Utc>,
    pub coefficients: CoefficientVector,
    pub error: f64,
    pub status: Status,
    pub reason: Option<String>,
}

/// Single writer over the run log file. Each record is written through a
/// fresh append handle and flushed, so a crash loses at most the record
/// being written and a log moved away mid-session surfaces as an error.
///
/// Evaluation numbers continue from the last row of an existing log.
pub struct RunLogger {
    path: PathBuf,
    columns: Vec<String>,
    offset: usize,
    written: usize,
}

impl RunLogger {
    /// Open `path` for appending. A new or empty file gets a header row; an
    /// existing log must have been written for the same coefficients.
    pub fn open(path: &Path, columns: Vec<String>) -> Result<Self> {
        let header = csv::StringRecord::from(header_for(&columns));
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| log_error(path, e))?;
        }
        let file = append_handle(path)?;
        let empty = file.metadata().map_err(|e| log_error(path, e))?.len() == 0;

        let offset = if empty {
            let mut w = writer(file);
            w.write_record(&header).map_err(|e| log_error(path, e))?;
            w.flush().map_err(|e| log_error(path, e))?;
            0
        } else {
            last_evaluation(path, &header)?
        };

        Ok(Self {
            path: path.to_path_buf(),
            columns,
            offset,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended through this logger.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn append(&mut self, record: &ErrorRecord) -> Result<()> {
        let mut row = Vec::with_capacity(self.columns.len() + 5);
        row.push((self.offset + record.evaluation).to_string());
        row.push(record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true));
        for name in &self.columns {
            row.push(
                record
                    .coefficients
                    .get(name)
                    .map(|v| format!("{:e}", v))
                    .unwrap_or_default(),
            );
        }
        row.push(format!("{:e}", record.error));
        row.push(record.status.as_str().to_string());
        row.push(record.reason.clone().unwrap_or_default());

        let mut w = writer(append_handle(&self.path)?);
        w.write_record(&row).map_err(|e| log_error(&self.path, e))?;
        w.flush().map_err(|e| log_error(&self.path, e))?;
        self.written += 1;
        Ok(())
    }
}

fn header_for(columns: &[String]) -> Vec<String> {
    let mut header = vec!["evaluation".to_string(), "timestamp".to_string()];
    header.extend(columns.iter().cloned());
    header.extend(["error", "status", "reason"].map(String::from));
    header
}

fn append_handle(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| log_error(path, e))
}

fn writer(file: File) -> csv::Writer<File> {
    csv::WriterBuilder::new().has_headers(false).from_writer(file)
}

fn log_error(path: &Path, e: impl std::fmt::Display) -> CalibrationError {
    CalibrationError::Logging(format!("{}: {}", path.display(), e))
}

/// Check the header of an existing log and return its last evaluation number.
fn last_evaluation(path: &Path, expected: &csv::StringRecord) -> Result<usize> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| log_error(path, e))?;
    let existing = reader.headers().map_err(|e| log_error(path, e))?;
    if existing != expected {
        return Err(CalibrationError::Logging(format!(
            "{}: existing header '{}' does not match '{}'",
            path.display(),
            existing.iter().collect::<Vec<_>>().join(","),
            expected.iter().collect::<Vec<_>>().join(",")
        )));
    }

    let mut last = 0;
    for (line, row) in reader.records().enumerate() {
        let row = row.map_err(|e| log_error(path, e))?;
        last = row
            .get(0)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or_else(|| {
                log_error(path, format!("row {}: evaluation number missing", line + 2))
            })?;
    }
    Ok(last)
}
