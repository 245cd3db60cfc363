//! Run command - monitor the buffer directories until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bufferflow::engine::Engine;
use tracing::info;

use crate::error::CliError;
use crate::runner::CliRunner;

/// Interval between engine statistics log lines.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Arguments for the run command.
#[derive(Debug, Default)]
pub struct RunArgs {
    pub config: Option<PathBuf>,
    pub debug: bool,
}

/// Run the run command.
pub fn run(args: RunArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(args.config.as_deref(), args.debug)?;
    runner.log_startup("run");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    let config = Arc::new(runner.config().clone());
    let engine = Engine::new(Arc::clone(&config));

    // Ctrl-C maps onto the engine's shutdown signal; stop_monitoring below
    // then kills the workers and drains the job tasks.
    let control = engine.control().clone();
    ctrlc::set_handler(move || {
        control.shutdown();
    })
    .map_err(|e| CliError::SignalHandler(e.to_string()))?;

    runtime.block_on(async {
        engine.start_monitoring()?;

        println!("Monitoring {}", config.buffers.input_dir.display());
        println!(
            "  Execution limit: {}  First port: {}",
            config.scheduler.execution_limit, config.worker.start_port
        );
        if let Some(pause_file) = &config.scheduler.pause_file {
            println!("  Pause file: {}", pause_file.display());
        }
        println!("Press Ctrl-C to stop.");

        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = engine.control().cancelled() => break,
                _ = ticker.tick() => {
                    info!(stats = %engine.stats(), paused = engine.is_paused(), "Engine status");
                }
            }
        }

        println!();
        println!("Shutting down...");
        engine.stop_monitoring().await;
        Ok::<(), CliError>(())
    })?;

    println!("{}", engine.stats());
    Ok(())
}
