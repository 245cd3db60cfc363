//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and appropriate exit codes.

use std::fmt;
use std::path::PathBuf;
use std::process;

use bufferflow::config::ConfigFileError;
use bufferflow::engine::EngineError;
use bufferflow::status::StatusLogError;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Configuration could not be loaded or saved
    Config(ConfigFileError),
    /// Refused to overwrite an existing config file
    ConfigExists(PathBuf),
    /// Failed to build the async runtime
    Runtime(std::io::Error),
    /// Failed to install the Ctrl-C handler
    SignalHandler(String),
    /// Engine failed to start
    Engine(EngineError),
    /// Status history could not be read or pruned
    History(StatusLogError),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::ConfigExists(_) => {
                eprintln!();
                eprintln!("Use 'bufferflow config init --force' to replace it.");
            }
            CliError::Config(ConfigFileError::NotFound(path)) => {
                eprintln!();
                eprintln!("Create it with:");
                eprintln!("  bufferflow config init --config {}", path.display());
            }
            CliError::Engine(EngineError::BufferDirectory { .. }) => {
                eprintln!();
                eprintln!("Check the [buffers] section of your configuration:");
                eprintln!("  bufferflow config show");
            }
            _ => {}
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Config(e) => write!(f, "Configuration error: {}", e),
            CliError::ConfigExists(path) => {
                write!(f, "Configuration file already exists: {}", path.display())
            }
            CliError::Runtime(e) => write!(f, "Failed to start async runtime: {}", e),
            CliError::SignalHandler(msg) => write!(f, "Failed to set signal handler: {}", msg),
            CliError::Engine(e) => write!(f, "Engine error: {}", e),
            CliError::History(e) => write!(f, "Status history error: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Config(e) => Some(e),
            CliError::Runtime(e) => Some(e),
            CliError::Engine(e) => Some(e),
            CliError::History(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigFileError> for CliError {
    fn from(e: ConfigFileError) -> Self {
        CliError::Config(e)
    }
}

impl From<EngineError> for CliError {
    fn from(e: EngineError) -> Self {
        CliError::Engine(e)
    }
}

impl From<StatusLogError> for CliError {
    fn from(e: StatusLogError) -> Self {
        CliError::History(e)
    }
}
