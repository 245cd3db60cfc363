//! Status command - print the job status history.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use bufferflow::engine::Engine;
use bufferflow::status::{StatusLogEntry, TIMESTAMP_FORMAT};
use chrono::NaiveDateTime;

use crate::error::CliError;
use crate::runner::load_config;

/// Run the status command.
///
/// Applies the retention window before reading, like the running engine does.
pub fn run(config_path: Option<&Path>, job: Option<&str>) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let history_path = config.status_log.file.clone();
    let engine = Engine::new(Arc::new(config));

    let mut entries = engine.get_historical_status()?;
    if let Some(job) = job {
        entries.retain(|entry| entry.job == job);
    }

    if entries.is_empty() {
        match job {
            Some(job) => println!("No history for job {}", job),
            None => println!("No history in {}", history_path.display()),
        }
        return Ok(());
    }

    print!("{}", format_table(&entries));
    Ok(())
}

/// Render history rows as an aligned table.
pub fn format_table(entries: &[StatusLogEntry]) -> String {
    let job_width = entries
        .iter()
        .map(|e| e.job.len())
        .chain(std::iter::once("JOB".len()))
        .max()
        .unwrap_or(0);
    let status_width = entries
        .iter()
        .map(|e| e.status.as_str().len())
        .chain(std::iter::once("STATUS".len()))
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<jw$}  {:<sw$}  {:<19}  {:<19}  {}",
        "JOB",
        "STATUS",
        "RECEIVED",
        "STARTED",
        "COMPLETED",
        jw = job_width,
        sw = status_width
    );
    for entry in entries {
        let _ = writeln!(
            out,
            "{:<jw$}  {:<sw$}  {:<19}  {:<19}  {}",
            entry.job,
            entry.status.as_str(),
            cell(entry.time_received),
            cell(entry.time_started),
            cell(entry.time_completed),
            jw = job_width,
            sw = status_width
        );
    }
    out
}

fn cell(time: Option<NaiveDateTime>) -> String {
    time.map(|t| t.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bufferflow::status::{JobStatus, TimeKind};
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_format_table_aligns_columns() {
        let entries = vec![
            StatusLogEntry::new("A1_20240301", JobStatus::JobStarted, TimeKind::Received, at(9, 0)),
            StatusLogEntry::new("A1_20240301", JobStatus::Complete, TimeKind::Completed, at(9, 30)),
        ];

        let table = format_table(&entries);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("JOB"));
        assert!(lines[1].contains("2024-03-01 09:00:00"));
        assert!(lines[2].ends_with("2024-03-01 09:30:00"));
        let status_column = lines[0].find("STATUS").unwrap();
        assert_eq!(lines[1].find("JOB_STARTED"), Some(status_column));
        assert_eq!(lines[2].find("COMPLETE"), Some(status_column));
    }

    #[test]
    fn test_format_table_marks_empty_times() {
        let entries = vec![StatusLogEntry::new(
            "B2_20240301",
            JobStatus::Executing,
            TimeKind::Started,
            at(10, 5),
        )];

        let table = format_table(&entries);
        let row = table.lines().nth(1).unwrap();
        assert!(row.contains("EXECUTING"));
        assert!(row.contains("2024-03-01 10:05:00"));
        assert!(row.trim_end().ends_with('-'));
    }
}
