//! Bufferflow - job orchestration over buffer directories
//!
//! This library watches an input buffer for job directories, admits a bounded
//! number of them at a time, and drives each through a fixed pipeline: wait
//! for its input files, hand it to the processing buffer, launch an external
//! worker, poll the worker's TCP status port, and archive the results. Every
//! transition is appended to a CSV status history.
//!
//! # High-Level API
//!
//! ```ignore
//! use std::sync::Arc;
//! use bufferflow::config::ConfigFile;
//! use bufferflow::engine::Engine;
//!
//! let config = Arc::new(ConfigFile::load()?);
//! let engine = Engine::new(config);
//! engine.start_monitoring()?;
//!
//! // Later, e.g. on Ctrl-C
//! engine.stop_monitoring().await;
//! ```

pub mod admission;
pub mod config;
pub mod control;
pub mod discovery;
pub mod engine;
pub mod fileops;
pub mod job;
pub mod logging;
pub mod metadata;
pub mod poller;
pub mod status;
pub mod supervisor;
pub mod watcher;

/// Version of the bufferflow library and CLI.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
