//! INI parsing logic for converting `Ini` → `ConfigFile`.
//!
//! This module contains the `parse_ini()` function and its helpers.
//! It is the single place where INI key names are mapped to struct fields.

use ini::{Ini, Properties};
use std::path::PathBuf;
use std::str::FromStr;

use super::file::ConfigFileError;
use super::settings::ConfigFile;
use super::size::parse_size;

/// Parse an `Ini` object into a `ConfigFile`.
///
/// Starts from `ConfigFile::default()` and overlays any values found in the INI.
pub(super) fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigFileError> {
    let mut config = ConfigFile::default();

    // [buffers] section
    if let Some(section) = ini.section(Some("buffers")) {
        if let Some(p) = path_value(section, "input_dir") {
            config.buffers.input_dir = p;
        }
        if let Some(p) = path_value(section, "processing_dir") {
            config.buffers.processing_dir = p;
        }
        if let Some(p) = path_value(section, "repository_dir") {
            config.buffers.repository_dir = p;
        }
        if let Some(p) = path_value(section, "finished_dir") {
            config.buffers.finished_dir = p;
        }
        if let Some(p) = path_value(section, "error_dir") {
            config.buffers.error_dir = p;
        }
    }

    // [worker] section
    if let Some(section) = ini.section(Some("worker")) {
        if let Some(p) = path_value(section, "modeler_root_dir") {
            config.worker.modeler_root_dir = p;
        }
        if let Some(v) = section.get("executable_extension") {
            config.worker.executable_extension = v.trim().trim_start_matches('.').to_string();
        }
        if let Some(v) = section.get("cpu_cores") {
            config.worker.cpu_cores =
                parse_number("worker", "cpu_cores", v, "must be a positive integer")?;
        }
        if let Some(v) = section.get("start_port") {
            config.worker.start_port = parse_number(
                "worker",
                "start_port",
                v,
                "must be a TCP port between 1 and 65535",
            )?;
        }
    }

    // [scheduler] section
    if let Some(section) = ini.section(Some("scheduler")) {
        if let Some(v) = section.get("execution_limit") {
            config.scheduler.execution_limit = parse_number(
                "scheduler",
                "execution_limit",
                v,
                "must be a positive integer",
            )?;
        }
        if let Some(v) = section.get("scan_interval_ms") {
            config.scheduler.scan_interval_ms = parse_number(
                "scheduler",
                "scan_interval_ms",
                v,
                "must be a positive integer (milliseconds)",
            )?;
        }
        if let Some(v) = section.get("max_job_seconds") {
            config.scheduler.max_job_seconds = parse_number(
                "scheduler",
                "max_job_seconds",
                v,
                "must be a positive integer (seconds)",
            )?;
        }
        if let Some(v) = section.get("settle_delay_ms") {
            config.scheduler.settle_delay_ms = parse_number(
                "scheduler",
                "settle_delay_ms",
                v,
                "must be a non-negative integer (milliseconds)",
            )?;
        }
        if let Some(v) = section.get("poll_granularity_ms") {
            config.scheduler.poll_granularity_ms = parse_number(
                "scheduler",
                "poll_granularity_ms",
                v,
                "must be a positive integer (milliseconds)",
            )?;
        }
        if let Some(p) = path_value(section, "pause_file") {
            config.scheduler.pause_file = Some(p);
        }
    }

    // [jobs] section
    if let Some(section) = ini.section(Some("jobs")) {
        if let Some(v) = section.get("results_file") {
            let v = v.trim();
            if !v.is_empty() {
                config.jobs.results_file = v.to_string();
            }
        }
    }

    // [status_log] section
    if let Some(section) = ini.section(Some("status_log")) {
        if let Some(p) = path_value(section, "file") {
            config.status_log.file = p;
        }
        if let Some(v) = section.get("retention_days") {
            config.status_log.retention_days = parse_number(
                "status_log",
                "retention_days",
                v,
                "must be a non-negative integer (days)",
            )?;
        }
        if let Some(v) = section.get("max_size") {
            config.status_log.max_size =
                parse_size(v).map_err(|_| ConfigFileError::InvalidValue {
                    section: "status_log".to_string(),
                    key: "max_size".to_string(),
                    value: v.to_string(),
                    reason: "expected format like '10MB', '512KB', or '1GB'".to_string(),
                })?;
        }
    }

    // [logging] section
    if let Some(section) = ini.section(Some("logging")) {
        if let Some(p) = path_value(section, "file") {
            config.logging.file = p;
        }
    }

    Ok(config)
}

/// Parses a numeric value, mapping failures to `InvalidValue`.
fn parse_number<T: FromStr>(
    section: &str,
    key: &str,
    value: &str,
    reason: &str,
) -> Result<T, ConfigFileError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigFileError::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        })
}

/// Returns a non-empty path value with `~` expanded.
fn path_value(section: &Properties, key: &str) -> Option<PathBuf> {
    let v = section.get(key)?.trim();
    if v.is_empty() {
        None
    } else {
        Some(expand_tilde(v))
    }
}

/// Expand a leading `~` to the user's home directory.
pub(super) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<ConfigFile, ConfigFileError> {
        let ini = Ini::load_from_str(content).unwrap();
        parse_ini(&ini)
    }

    #[test]
    fn test_empty_ini_yields_defaults() {
        let config = parse("").unwrap();
        let default = ConfigFile::default();
        assert_eq!(
            config.scheduler.execution_limit,
            default.scheduler.execution_limit
        );
        assert_eq!(config.worker.start_port, default.worker.start_port);
        assert_eq!(config.jobs.results_file, default.jobs.results_file);
    }

    #[test]
    fn test_parses_all_sections() {
        let config = parse(
            r#"
[buffers]
input_dir = /data/in
processing_dir = /data/proc
repository_dir = /data/repo
finished_dir = /data/done
error_dir = /data/err

[worker]
modeler_root_dir = /opt/modelers
executable_extension = .bin
cpu_cores = 6
start_port = 41000

[scheduler]
execution_limit = 3
scan_interval_ms = 1500
max_job_seconds = 120
settle_delay_ms = 0
poll_granularity_ms = 50
pause_file = /data/PAUSE

[jobs]
results_file = Outcome.xml

[status_log]
file = /var/log/history.csv
retention_days = 7
max_size = 2MB

[logging]
file = /var/log/bufferflow.log
"#,
        )
        .unwrap();

        assert_eq!(config.buffers.input_dir, PathBuf::from("/data/in"));
        assert_eq!(config.buffers.processing_dir, PathBuf::from("/data/proc"));
        assert_eq!(config.buffers.repository_dir, PathBuf::from("/data/repo"));
        assert_eq!(config.buffers.finished_dir, PathBuf::from("/data/done"));
        assert_eq!(config.buffers.error_dir, PathBuf::from("/data/err"));
        assert_eq!(config.worker.modeler_root_dir, PathBuf::from("/opt/modelers"));
        assert_eq!(config.worker.executable_extension, "bin");
        assert_eq!(config.worker.cpu_cores, 6);
        assert_eq!(config.worker.start_port, 41000);
        assert_eq!(config.scheduler.execution_limit, 3);
        assert_eq!(config.scheduler.scan_interval_ms, 1500);
        assert_eq!(config.scheduler.max_job_seconds, 120);
        assert_eq!(config.scheduler.settle_delay_ms, 0);
        assert_eq!(config.scheduler.poll_granularity_ms, 50);
        assert_eq!(
            config.scheduler.pause_file,
            Some(PathBuf::from("/data/PAUSE"))
        );
        assert_eq!(config.jobs.results_file, "Outcome.xml");
        assert_eq!(config.status_log.file, PathBuf::from("/var/log/history.csv"));
        assert_eq!(config.status_log.retention_days, 7);
        assert_eq!(config.status_log.max_size, 2 * 1024 * 1024);
        assert_eq!(config.logging.file, PathBuf::from("/var/log/bufferflow.log"));
    }

    #[test]
    fn test_invalid_number_reports_key() {
        let err = parse("[scheduler]\nexecution_limit = many\n").unwrap_err();
        match err {
            ConfigFileError::InvalidValue {
                section,
                key,
                value,
                ..
            } => {
                assert_eq!(section, "scheduler");
                assert_eq!(key, "execution_limit");
                assert_eq!(value, "many");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_port_out_of_range_rejected() {
        assert!(parse("[worker]\nstart_port = 70000\n").is_err());
    }

    #[test]
    fn test_invalid_size_rejected() {
        assert!(parse("[status_log]\nmax_size = lots\n").is_err());
    }

    #[test]
    fn test_blank_path_keeps_default() {
        let config = parse("[buffers]\ninput_dir =\n").unwrap();
        assert_eq!(
            config.buffers.input_dir,
            ConfigFile::default().buffers.input_dir
        );
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/jobs"), home.join("jobs"));
            assert_eq!(expand_tilde("~"), home);
        }
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }
}
