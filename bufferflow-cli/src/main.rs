//! bufferflow CLI - Command-line interface
//!
//! This binary runs the bufferflow job engine and offers small maintenance
//! commands for its configuration and status history.

mod commands;
mod error;
mod runner;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::config::ConfigCommands;
use commands::history::HistoryAction;
use commands::run::RunArgs;

#[derive(Debug, Parser)]
#[command(name = "bufferflow")]
#[command(version, about = "Run external modeler jobs from a buffer directory", long_about = None)]
struct Cli {
    /// Config file to use instead of ~/.bufferflow/config.ini
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Monitor the buffers and run jobs until Ctrl-C
    Run {
        /// Enable debug-level logging
        #[arg(long)]
        debug: bool,
    },

    /// Print the job status history
    Status {
        /// Only show rows for this job
        #[arg(long)]
        job: Option<String>,
    },

    /// Status history maintenance
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    let result = match cli.command {
        Commands::Run { debug } => commands::run::run(RunArgs {
            config: cli.config.clone(),
            debug,
        }),
        Commands::Status { job } => commands::status::run(config, job.as_deref()),
        Commands::History { action } => commands::history::run(config, action),
        Commands::Config { command } => commands::config::run(config, command),
    };

    if let Err(e) = result {
        e.exit();
    }
}
