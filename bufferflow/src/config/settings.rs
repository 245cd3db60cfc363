//! Settings structs for all configuration sections.
//!
//! Each struct represents one `[section]` of the INI config file.
//! These are pure data types with no parsing or serialization logic.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete engine configuration loaded from config.ini.
///
/// Loaded once at startup and shared as an immutable `Arc<ConfigFile>`
/// for the whole run.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    /// Buffer directory roots
    pub buffers: BufferSettings,
    /// Worker executable settings
    pub worker: WorkerSettings,
    /// Admission and wait-loop timing
    pub scheduler: SchedulerSettings,
    /// Job file naming
    pub jobs: JobFileSettings,
    /// CSV status history
    pub status_log: StatusLogSettings,
    /// Diagnostic logging
    pub logging: LoggingSettings,
}

/// Buffer directories. Each holds one subdirectory per job.
#[derive(Debug, Clone)]
pub struct BufferSettings {
    /// Newly arrived jobs
    pub input_dir: PathBuf,
    /// Jobs handed to a worker
    pub processing_dir: PathBuf,
    /// Archive of complete processing directories
    pub repository_dir: PathBuf,
    /// Transfer files of passed jobs, grouped by serial number
    pub finished_dir: PathBuf,
    /// Transfer files of failed or timed-out jobs, grouped by serial number
    pub error_dir: PathBuf,
}

impl BufferSettings {
    /// Returns all buffer roots with a short label, in pipeline order.
    pub fn all(&self) -> [(&'static str, &Path); 5] {
        [
            ("input", self.input_dir.as_path()),
            ("processing", self.processing_dir.as_path()),
            ("repository", self.repository_dir.as_path()),
            ("finished", self.finished_dir.as_path()),
            ("error", self.error_dir.as_path()),
        ]
    }
}

/// External worker ("modeler") settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Root directory containing one `{name}/{name}.{ext}` per modeler
    pub modeler_root_dir: PathBuf,
    /// Executable extension without the dot. Empty means no extension.
    pub executable_extension: String,
    /// CPU core hint passed on the worker command line
    pub cpu_cores: usize,
    /// First TCP port handed out to workers
    pub start_port: u16,
}

/// Admission and timing settings.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Maximum number of jobs executing at once
    pub execution_limit: usize,
    /// Retry cadence for jobs waiting on an admission slot
    pub scan_interval_ms: u64,
    /// Hard wall-clock cap per job, counted from worker launch
    pub max_job_seconds: u64,
    /// Pause before moving a job out of the input buffer
    pub settle_delay_ms: u64,
    /// Upper bound on how long any wait loop sleeps between checks
    pub poll_granularity_ms: u64,
    /// Presence of this file pauses the engine
    pub pause_file: Option<PathBuf>,
}

impl SchedulerSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn max_job_duration(&self) -> Duration {
        Duration::from_secs(self.max_job_seconds)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn poll_granularity(&self) -> Duration {
        Duration::from_millis(self.poll_granularity_ms.max(1))
    }
}

/// Names of files inside a job directory.
#[derive(Debug, Clone)]
pub struct JobFileSettings {
    /// Result file written by the worker into the processing directory
    pub results_file: String,
}

/// Status history settings.
#[derive(Debug, Clone)]
pub struct StatusLogSettings {
    /// CSV file path
    pub file: PathBuf,
    /// Rows older than this many days are pruned
    pub retention_days: u32,
    /// Size cap in bytes; the oldest ~10% is dropped once exceeded
    pub max_size: u64,
}

/// Diagnostic logging settings.
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    /// Log file path
    pub file: PathBuf,
}
