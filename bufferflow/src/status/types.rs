//! Status enumeration and history row type.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use thiserror::Error;

/// Timestamp layout used in the CSV history.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Pipeline status of a job.
///
/// Declaration order is the normal pipeline order. `JobTimeout` may replace
/// everything between `Executing` and `CopyingToArchive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobStatus {
    JobStarted,
    MonitoringInput,
    CopyingToProcessing,
    Executing,
    MonitoringProcessing,
    MonitoringTcpip,
    JobTimeout,
    CopyingToArchive,
    Complete,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        Self::JobStarted,
        Self::MonitoringInput,
        Self::CopyingToProcessing,
        Self::Executing,
        Self::MonitoringProcessing,
        Self::MonitoringTcpip,
        Self::JobTimeout,
        Self::CopyingToArchive,
        Self::Complete,
    ];

    /// Name written to the CSV `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobStarted => "JOB_STARTED",
            Self::MonitoringInput => "MONITORING_INPUT",
            Self::CopyingToProcessing => "COPYING_TO_PROCESSING",
            Self::Executing => "EXECUTING",
            Self::MonitoringProcessing => "MONITORING_PROCESSING",
            Self::MonitoringTcpip => "MONITORING_TCPIP",
            Self::JobTimeout => "JOB_TIMEOUT",
            Self::CopyingToArchive => "COPYING_TO_ARCHIVE",
            Self::Complete => "COMPLETE",
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown job status '{0}'")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// Which timestamp column a transition fills in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKind {
    Received,
    Started,
    Completed,
}

/// One row of the status history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLogEntry {
    pub job: String,
    pub status: JobStatus,
    pub time_received: Option<NaiveDateTime>,
    pub time_started: Option<NaiveDateTime>,
    pub time_completed: Option<NaiveDateTime>,
}

impl StatusLogEntry {
    /// Builds an entry with only the `kind` column populated.
    pub fn new(
        job: impl Into<String>,
        status: JobStatus,
        kind: TimeKind,
        at: NaiveDateTime,
    ) -> Self {
        let mut entry = Self {
            job: job.into(),
            status,
            time_received: None,
            time_started: None,
            time_completed: None,
        };
        match kind {
            TimeKind::Received => entry.time_received = Some(at),
            TimeKind::Started => entry.time_started = Some(at),
            TimeKind::Completed => entry.time_completed = Some(at),
        }
        entry
    }

    /// All populated timestamps of the row.
    pub fn timestamps(&self) -> impl Iterator<Item = NaiveDateTime> {
        [self.time_received, self.time_started, self.time_completed]
            .into_iter()
            .flatten()
    }

    /// True if every populated timestamp is at or after `cutoff`.
    pub fn is_within(&self, cutoff: NaiveDateTime) -> bool {
        self.timestamps().all(|t| t >= cutoff)
    }

    /// The populated timestamp, if any. Used for display.
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        self.timestamps().next()
    }
}

pub(super) fn format_time(t: Option<NaiveDateTime>) -> String {
    t.map(|t| t.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_default()
}

pub(super) fn parse_time(s: &str) -> Result<Option<NaiveDateTime>, chrono::ParseError> {
    let s = s.trim();
    if s.is_empty() {
        Ok(None)
    } else {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_status_names_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert_eq!("complete".parse::<JobStatus>(), Ok(JobStatus::Complete));
        assert!("DONE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_entry_populates_only_one_column() {
        let entry = StatusLogEntry::new("job", JobStatus::Executing, TimeKind::Started, at(3));
        assert_eq!(entry.time_received, None);
        assert_eq!(entry.time_started, Some(at(3)));
        assert_eq!(entry.time_completed, None);
        assert_eq!(entry.timestamp(), Some(at(3)));
    }

    #[test]
    fn test_is_within_ignores_unset_columns() {
        let entry = StatusLogEntry::new("job", JobStatus::Complete, TimeKind::Completed, at(5));
        assert!(entry.is_within(at(5)));
        assert!(!entry.is_within(at(6)));

        let mut blank = entry.clone();
        blank.time_completed = None;
        assert!(blank.is_within(at(23)));
    }

    #[test]
    fn test_time_format() {
        assert_eq!(format_time(Some(at(9))), "2024-03-01 09:00:00");
        assert_eq!(format_time(None), "");
        assert_eq!(parse_time("2024-03-01 09:00:00").unwrap(), Some(at(9)));
        assert_eq!(parse_time("  ").unwrap(), None);
        assert!(parse_time("yesterday").is_err());
    }
}
