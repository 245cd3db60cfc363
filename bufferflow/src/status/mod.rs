//! Job status history.
//!
//! Every pipeline transition is appended as one row to a CSV file with the
//! columns `job,status,timeReceived,timeStarted,timeCompleted`. Only the
//! timestamp column relevant to the transition is filled in; the other two
//! are left blank.

mod log;
mod types;

pub use log::{StatusLog, StatusLogError, CSV_HEADER};
pub use types::{JobStatus, ParseStatusError, StatusLogEntry, TimeKind, TIMESTAMP_FORMAT};
