//! CLI command implementations.
//!
//! # Command Modules
//!
//! - [`config`] - Configuration management (path, show, init)
//! - [`history`] - Status history maintenance (prune)
//! - [`run`] - Main command (monitor the buffers until Ctrl-C)
//! - [`status`] - Print the status history table

pub mod config;
pub mod history;
pub mod run;
pub mod status;
