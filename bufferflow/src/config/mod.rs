//! Engine configuration.
//!
//! The configuration is read once from an INI file and handed to the engine
//! as an immutable record. Sections map one-to-one onto the settings structs:
//!
//! - `[buffers]` → [`BufferSettings`]
//! - `[worker]` → [`WorkerSettings`]
//! - `[scheduler]` → [`SchedulerSettings`]
//! - `[jobs]` → [`JobFileSettings`]
//! - `[status_log]` → [`StatusLogSettings`]
//! - `[logging]` → [`LoggingSettings`]

mod defaults;
mod file;
mod parser;
mod settings;
mod size;
mod writer;

pub use defaults::*;
pub use file::{config_directory, config_file_path, ConfigFileError};
pub use settings::{
    BufferSettings, ConfigFile, JobFileSettings, LoggingSettings, SchedulerSettings,
    StatusLogSettings, WorkerSettings,
};
pub use size::{format_size, parse_size, Size, SizeParseError};
