//! Append-only CSV status history with retention pruning and a size cap.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime, TimeDelta, Timelike};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Size;

use super::types::{format_time, parse_time, JobStatus, StatusLogEntry, TimeKind};

/// Header row of the history file.
pub const CSV_HEADER: [&str; 5] = ["job", "status", "timeReceived", "timeStarted", "timeCompleted"];

/// Fraction of the file dropped when the size cap is exceeded.
const TRIM_DIVISOR: u64 = 10;

/// Status history errors.
#[derive(Debug, Error)]
pub enum StatusLogError {
    #[error("Status log I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Status log CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// CSV-backed history of job status transitions.
///
/// All file access goes through one lock so rows from concurrent job tasks
/// never interleave. Rows recorded during this session are also kept in
/// memory for [`StatusLog::current`].
#[derive(Debug)]
pub struct StatusLog {
    path: PathBuf,
    max_size: u64,
    file_lock: Mutex<()>,
    session: RwLock<Vec<StatusLogEntry>>,
}

impl StatusLog {
    /// Creates a log writing to `path`, trimmed once it grows past `max_size`
    /// bytes. A `max_size` of zero disables the cap.
    pub fn new(path: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            path: path.into(),
            max_size,
            file_lock: Mutex::new(()),
            session: RwLock::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one transition stamped with the current local time.
    pub fn record(
        &self,
        job: &str,
        status: JobStatus,
        kind: TimeKind,
    ) -> Result<StatusLogEntry, StatusLogError> {
        let entry = StatusLogEntry::new(job, status, kind, now());
        self.append(&entry)?;
        Ok(entry)
    }

    /// Appends a prepared entry.
    pub fn append(&self, entry: &StatusLogEntry) -> Result<(), StatusLogError> {
        {
            let _guard = self.file_lock.lock();
            self.enforce_size_cap()?;

            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| self.io_error(e))?;
            let is_empty = file.metadata().map(|m| m.len() == 0).unwrap_or(true);

            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            if is_empty {
                writer.write_record(CSV_HEADER)?;
            }
            writer.write_record(to_record(entry))?;
            writer.flush().map_err(|e| self.io_error(e))?;
        }

        debug!(job = %entry.job, status = %entry.status, "Status recorded");
        self.session.write().push(entry.clone());
        Ok(())
    }

    /// Rows recorded by this process, in recording order.
    pub fn current(&self) -> Vec<StatusLogEntry> {
        self.session.read().clone()
    }

    /// Rows of the current session for one job.
    pub fn current_for(&self, job: &str) -> Vec<StatusLogEntry> {
        self.session
            .read()
            .iter()
            .filter(|e| e.job == job)
            .cloned()
            .collect()
    }

    /// Parses the whole history file. A missing file is an empty history.
    ///
    /// Rows that cannot be parsed are skipped with a warning.
    pub fn read_history(&self) -> Result<Vec<StatusLogEntry>, StatusLogError> {
        let _guard = self.file_lock.lock();
        self.read_unlocked()
    }

    /// Rewrites the history keeping only rows whose populated timestamps all
    /// fall within the last `retention_days`. Returns the number of rows removed.
    pub fn prune_history(&self, retention_days: u32) -> Result<usize, StatusLogError> {
        let cutoff = now() - TimeDelta::days(i64::from(retention_days));
        self.prune_before(cutoff)
    }

    /// Removes rows holding any timestamp older than `cutoff`.
    pub fn prune_before(&self, cutoff: NaiveDateTime) -> Result<usize, StatusLogError> {
        let _guard = self.file_lock.lock();
        if !self.path.exists() {
            return Ok(0);
        }

        let entries = self.read_unlocked()?;
        let total = entries.len();
        let kept: Vec<_> = entries.into_iter().filter(|e| e.is_within(cutoff)).collect();
        let removed = total - kept.len();

        if removed > 0 {
            self.rewrite_unlocked(&kept)?;
            info!(
                removed,
                kept = kept.len(),
                cutoff = %cutoff,
                "Pruned status history"
            );
        }
        Ok(removed)
    }

    fn read_unlocked(&self) -> Result<Vec<StatusLogEntry>, StatusLogError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let mut entries = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record?;
            match from_record(&record) {
                Some(entry) => entries.push(entry),
                None => warn!(
                    path = %self.path.display(),
                    row = index + 2,
                    "Skipping malformed status history row"
                ),
            }
        }
        Ok(entries)
    }

    fn rewrite_unlocked(&self, entries: &[StatusLogEntry]) -> Result<(), StatusLogError> {
        let tmp = self.path.with_extension("csv.tmp");
        {
            let file = File::create(&tmp).map_err(|e| self.io_error(e))?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            writer.write_record(CSV_HEADER)?;
            for entry in entries {
                writer.write_record(to_record(entry))?;
            }
            writer.flush().map_err(|e| self.io_error(e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }

    /// Drops roughly the oldest tenth of the file (by bytes) once it exceeds
    /// the cap. The header row is preserved and the cut lands on a row boundary.
    fn enforce_size_cap(&self) -> Result<(), StatusLogError> {
        if self.max_size == 0 {
            return Ok(());
        }
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if len <= self.max_size {
            return Ok(());
        }

        let bytes = fs::read(&self.path).map_err(|e| self.io_error(e))?;
        let header_end = bytes
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(bytes.len());
        let target = (len / TRIM_DIVISOR) as usize;
        let cut_from = target.max(header_end);
        let cut = bytes[cut_from..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| cut_from + i + 1)
            .unwrap_or(bytes.len());

        let tmp = self.path.with_extension("csv.tmp");
        {
            let mut out = File::create(&tmp).map_err(|e| self.io_error(e))?;
            out.write_all(&bytes[..header_end])
                .and_then(|_| out.write_all(&bytes[cut..]))
                .map_err(|e| self.io_error(e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;

        info!(
            cap = %Size(self.max_size),
            previous = %Size(len),
            dropped_bytes = cut - header_end,
            "Status history exceeded size cap, dropped oldest rows"
        );
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> StatusLogError {
        StatusLogError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    // Second precision, matching what the CSV can hold.
    now.with_nanosecond(0).unwrap_or(now)
}

fn to_record(entry: &StatusLogEntry) -> [String; 5] {
    [
        entry.job.clone(),
        entry.status.as_str().to_string(),
        format_time(entry.time_received),
        format_time(entry.time_started),
        format_time(entry.time_completed),
    ]
}

fn from_record(record: &csv::StringRecord) -> Option<StatusLogEntry> {
    if record.len() < CSV_HEADER.len() {
        return None;
    }
    Some(StatusLogEntry {
        job: record.get(0)?.to_string(),
        status: record.get(1)?.parse().ok()?,
        time_received: parse_time(record.get(2)?).ok()?,
        time_started: parse_time(record.get(3)?).ok()?,
        time_completed: parse_time(record.get(4)?).ok()?,
    })
}
