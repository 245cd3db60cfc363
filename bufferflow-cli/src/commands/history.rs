//! Status history maintenance commands.

use std::path::Path;

use bufferflow::config::ConfigFile;
use bufferflow::status::StatusLog;
use clap::Subcommand;

use crate::error::CliError;
use crate::runner::load_config;

/// History subcommands.
#[derive(Debug, Subcommand)]
pub enum HistoryAction {
    /// Remove rows older than the retention window
    Prune {
        /// Retention window in days (default: status_log.retention_days)
        #[arg(long)]
        days: Option<u32>,
    },
}

/// Run a history subcommand.
pub fn run(config_path: Option<&Path>, action: HistoryAction) -> Result<(), CliError> {
    let config = load_config(config_path)?;

    match action {
        HistoryAction::Prune { days } => {
            let days = days.unwrap_or(config.status_log.retention_days);
            let removed = prune(&config, days)?;
            println!(
                "Removed {} row(s) older than {} day(s) from {}",
                removed,
                days,
                config.status_log.file.display()
            );
            Ok(())
        }
    }
}

/// Prune the configured history file, returning the number of rows removed.
pub fn prune(config: &ConfigFile, days: u32) -> Result<usize, CliError> {
    let log = StatusLog::new(config.status_log.file.clone(), config.status_log.max_size);
    Ok(log.prune_history(days)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prune_removes_old_rows() {
        let temp = TempDir::new().unwrap();
        let mut config = ConfigFile::default();
        config.status_log.file = temp.path().join("history.csv");
        std::fs::write(
            &config.status_log.file,
            "job,status,timeReceived,timeStarted,timeCompleted\n\
             OLD_20000101,JOB_STARTED,2000-01-01 08:00:00,,\n\
             OLD_20000101,COMPLETE,,,2000-01-01 09:00:00\n",
        )
        .unwrap();

        let removed = prune(&config, 30).unwrap();
        assert_eq!(removed, 2);

        let log = StatusLog::new(config.status_log.file.clone(), config.status_log.max_size);
        assert!(log.read_history().unwrap().is_empty());
    }

    #[test]
    fn test_prune_missing_file_is_noop() {
        let temp = TempDir::new().unwrap();
        let mut config = ConfigFile::default();
        config.status_log.file = temp.path().join("absent.csv");

        assert_eq!(prune(&config, 30).unwrap(), 0);
        assert!(!config.status_log.file.exists());
    }
}
