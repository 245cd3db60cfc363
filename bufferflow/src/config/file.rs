//! Configuration file handling for ~/.bufferflow/config.ini.
//!
//! A missing file is not an error: every key has a default in
//! [`super::defaults`]. Values are checked by [`ConfigFile::validate`] after
//! parsing.

use ini::Ini;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::defaults::MAX_JOB_SECONDS_LIMIT;
use super::settings::ConfigFile;

/// Errors raised while loading, validating or saving the config file.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Cannot parse config file: {0}")]
    Parse(#[from] ini::Error),

    #[error("Cannot write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A key is present but its value is unusable
    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigFile {
    /// Reads `~/.bufferflow/config.ini`, or the defaults if it does not exist.
    pub fn load() -> Result<Self, ConfigFileError> {
        let path = config_file_path();
        if !path.exists() {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        Self::load_from(&path)
    }

    /// Reads and validates `path`, which must exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        if !path.exists() {
            return Err(ConfigFileError::NotFound(path.to_path_buf()));
        }
        let config = super::parser::parse_ini(&Ini::load_from_file(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the commented INI form to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigFileError> {
        let write_error = |source| ConfigFileError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        std::fs::write(path, self.to_config_string()).map_err(write_error)
    }

    /// Render the configuration as a commented INI document.
    pub fn to_config_string(&self) -> String {
        super::writer::to_config_string(self)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigFileError> {
        let invalid = |section: &str, key: &str, value: String, reason: &str| {
            Err(ConfigFileError::InvalidValue {
                section: section.to_string(),
                key: key.to_string(),
                value,
                reason: reason.to_string(),
            })
        };

        if self.scheduler.execution_limit == 0 {
            return invalid("scheduler", "execution_limit", "0".into(), "must be at least 1");
        }
        let scheduler = &self.scheduler;
        if scheduler.max_job_seconds == 0 || scheduler.max_job_seconds > MAX_JOB_SECONDS_LIMIT {
            return invalid(
                "scheduler",
                "max_job_seconds",
                scheduler.max_job_seconds.to_string(),
                &format!("must be between 1 and {}", MAX_JOB_SECONDS_LIMIT),
            );
        }
        if scheduler.scan_interval_ms == 0 {
            return invalid("scheduler", "scan_interval_ms", "0".into(), "must be at least 1");
        }
        if scheduler.poll_granularity_ms == 0 {
            return invalid("scheduler", "poll_granularity_ms", "0".into(), "must be at least 1");
        }
        if self.worker.start_port == 0 {
            return invalid("worker", "start_port", "0".into(), "must be at least 1");
        }
        if self.worker.cpu_cores == 0 {
            return invalid("worker", "cpu_cores", "0".into(), "must be at least 1");
        }
        Ok(())
    }
}

/// `~/.bufferflow`, or `./.bufferflow` when no home directory is known.
pub fn config_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bufferflow")
}

/// Default location of the config file.
pub fn config_file_path() -> PathBuf {
    config_directory().join("config.ini")
}
