//! Default values and constants for all configuration settings.
//!
//! Contains all `DEFAULT_*` constants and the `ConfigFile::default()`
//! implementation.

use std::path::PathBuf;

use super::file::config_directory;
use super::settings::*;

/// Default number of concurrently executing jobs.
pub const DEFAULT_EXECUTION_LIMIT: usize = 2;

/// Default first worker port.
pub const DEFAULT_START_PORT: u16 = 50_000;

/// Default pending-queue retry cadence (ScanWaitTime).
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 5_000;

/// Default per-job wall-clock cap (one hour).
pub const DEFAULT_MAX_JOB_SECONDS: u64 = 3_600;

/// Largest accepted per-job wall-clock cap (thirty days).
pub const MAX_JOB_SECONDS_LIMIT: u64 = 30 * 24 * 3_600;

/// Default settling delay before an input job is moved.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 1_000;

/// Default wake-up granularity for every wait loop.
pub const DEFAULT_POLL_GRANULARITY_MS: u64 = 250;

/// Default worker result file name.
pub const DEFAULT_RESULTS_FILE: &str = "Results.xml";

/// Default worker executable extension.
pub const DEFAULT_EXECUTABLE_EXTENSION: &str = "exe";

/// Default status history retention.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Default status history size cap (10 MB).
pub const DEFAULT_STATUS_LOG_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// Fallback CPU count when detection fails.
pub const FALLBACK_CPU_COUNT: usize = 4;

/// Get the number of available CPU cores.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_CPU_COUNT)
}

fn buffer_root() -> PathBuf {
    config_directory().join("buffers")
}

impl Default for BufferSettings {
    fn default() -> Self {
        let root = buffer_root();
        Self {
            input_dir: root.join("input"),
            processing_dir: root.join("processing"),
            repository_dir: root.join("repository"),
            finished_dir: root.join("finished"),
            error_dir: root.join("error"),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            modeler_root_dir: config_directory().join("modelers"),
            executable_extension: DEFAULT_EXECUTABLE_EXTENSION.to_string(),
            cpu_cores: num_cpus(),
            start_port: DEFAULT_START_PORT,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            execution_limit: DEFAULT_EXECUTION_LIMIT,
            scan_interval_ms: DEFAULT_SCAN_INTERVAL_MS,
            max_job_seconds: DEFAULT_MAX_JOB_SECONDS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            poll_granularity_ms: DEFAULT_POLL_GRANULARITY_MS,
            pause_file: None,
        }
    }
}

impl Default for JobFileSettings {
    fn default() -> Self {
        Self {
            results_file: DEFAULT_RESULTS_FILE.to_string(),
        }
    }
}

impl Default for StatusLogSettings {
    fn default() -> Self {
        Self {
            file: config_directory().join("status_history.csv"),
            retention_days: DEFAULT_RETENTION_DAYS,
            max_size: DEFAULT_STATUS_LOG_MAX_SIZE,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            file: config_directory().join("logs").join("bufferflow.log"),
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            buffers: BufferSettings::default(),
            worker: WorkerSettings::default(),
            scheduler: SchedulerSettings::default(),
            jobs: JobFileSettings::default(),
            status_log: StatusLogSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}
