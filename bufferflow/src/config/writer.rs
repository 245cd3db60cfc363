//! INI serialization logic for converting `ConfigFile` → INI string.
//!
//! Produces the commented representation written by `bufferflow config init`.

use std::path::Path;

use super::settings::ConfigFile;
use super::size::format_size;

/// Convert a `ConfigFile` to a commented INI string for saving.
pub(super) fn to_config_string(config: &ConfigFile) -> String {
    let pause_file = config
        .scheduler
        .pause_file
        .as_deref()
        .map(path_to_string)
        .unwrap_or_default();

    format!(
        r#"[buffers]
; One subdirectory per job, named {{serial}}_{{timestamp}}
input_dir = {}
processing_dir = {}
repository_dir = {}
finished_dir = {}
error_dir = {}

[worker]
; Worker executables live at <modeler_root_dir>/<name>/<name>.<executable_extension>
modeler_root_dir = {}
executable_extension = {}
; CPU core hint passed on the worker command line
cpu_cores = {}
; First TCP port; each job gets the next free port
start_port = {}

[scheduler]
; Maximum number of jobs executing at once
execution_limit = {}
; Retry cadence for jobs waiting on a free slot (milliseconds)
scan_interval_ms = {}
; Hard wall-clock cap per job, counted from worker launch (seconds)
max_job_seconds = {}
; Delay before moving an input job into the processing buffer (milliseconds)
settle_delay_ms = {}
; Longest sleep of any wait loop between shutdown/pause checks (milliseconds)
poll_granularity_ms = {}
; While this file exists the engine is paused (leave empty to disable)
pause_file = {}

[jobs]
; Result file the worker writes into the processing directory
results_file = {}

[status_log]
file = {}
; Rows older than this many days are pruned
retention_days = {}
; Supports: KB, MB, GB suffixes
max_size = {}

[logging]
file = {}
"#,
        path_to_string(&config.buffers.input_dir),
        path_to_string(&config.buffers.processing_dir),
        path_to_string(&config.buffers.repository_dir),
        path_to_string(&config.buffers.finished_dir),
        path_to_string(&config.buffers.error_dir),
        path_to_string(&config.worker.modeler_root_dir),
        config.worker.executable_extension,
        config.worker.cpu_cores,
        config.worker.start_port,
        config.scheduler.execution_limit,
        config.scheduler.scan_interval_ms,
        config.scheduler.max_job_seconds,
        config.scheduler.settle_delay_ms,
        config.scheduler.poll_granularity_ms,
        pause_file,
        config.jobs.results_file,
        path_to_string(&config.status_log.file),
        config.status_log.retention_days,
        format_size(config.status_log.max_size),
        path_to_string(&config.logging.file),
    )
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
