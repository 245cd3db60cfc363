//! Process-wide pause and shutdown signalling.
//!
//! Every wait loop in the engine takes an [`EngineControl`] and goes through
//! [`EngineControl::sleep`], [`EngineControl::wait_while_paused`] or
//! [`EngineControl::cancelled`], so a shutdown wakes all of them at once and a
//! pause holds them at their next checkpoint without tearing down state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Returned by a wait that was interrupted by shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("shutdown requested")]
pub struct Shutdown;

/// Cloneable handle to the shared pause/shutdown state.
#[derive(Clone, Debug)]
pub struct EngineControl {
    shutdown: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for EngineControl {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            shutdown: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    /// Requests shutdown. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutdown requested");
        }
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.shutdown.cancelled().await
    }

    /// Returns the underlying token for `select!` arms and child tokens.
    pub fn token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            info!("Engine paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            info!("Engine resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Blocks while paused. Returns `Err(Shutdown)` if shutdown arrives first.
    pub async fn wait_while_paused(&self) -> Result<(), Shutdown> {
        let mut rx = self.paused.subscribe();
        loop {
            if self.is_shutdown() {
                return Err(Shutdown);
            }
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(Shutdown),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sleeps for `duration` unless shutdown arrives first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Shutdown> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Shutdown),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Runs `fut` to completion unless shutdown arrives first.
    pub async fn run_until_shutdown<F: Future>(&self, fut: F) -> Result<F::Output, Shutdown> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Shutdown),
            out = fut => Ok(out),
        }
    }
}
