//! Waiting for a directory to reach a file count.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::EventKind;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::watch_directory;
use crate::control::{EngineControl, Shutdown};

/// File-count wait errors.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Cannot list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Interrupted by shutdown")]
    Shutdown(#[from] Shutdown),
}

/// Counts distinct files seen in a directory against a target.
///
/// [`FileCountTracker::record`] returns `true` exactly once: on the first
/// observation that reaches the target. Files seen afterwards are still
/// counted but never signal again.
#[derive(Debug)]
pub struct FileCountTracker {
    seen: HashSet<String>,
    needed: usize,
    signalled: bool,
}

impl FileCountTracker {
    pub fn new(needed: usize) -> Self {
        Self {
            seen: HashSet::new(),
            needed,
            signalled: false,
        }
    }

    /// Notes a file. Repeated names count once.
    pub fn record(&mut self, name: &str) -> bool {
        if !self.seen.contains(name) {
            self.seen.insert(name.to_string());
        }
        self.check()
    }

    /// Signals if the target is already met without recording anything,
    /// which covers a target of zero.
    pub fn check(&mut self) -> bool {
        if self.signalled || self.seen.len() < self.needed {
            return false;
        }
        self.signalled = true;
        true
    }

    pub fn found(&self) -> usize {
        self.seen.len()
    }

    pub fn needed(&self) -> usize {
        self.needed
    }

    pub fn is_complete(&self) -> bool {
        self.signalled
    }
}

/// Names of regular files in `dir`, excluding `exclude`.
pub fn list_data_files(dir: &Path, exclude: Option<&str>) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            if exclude != Some(name.as_str()) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

/// Waits until a directory holds at least `needed` data files.
///
/// The count is seeded from the directory contents when the wait starts,
/// then grows with create notifications and a rescan every poll
/// granularity.
#[derive(Debug)]
pub struct FileCountWatcher {
    dir: PathBuf,
    needed: usize,
    exclude: Option<String>,
    granularity: Duration,
}

impl FileCountWatcher {
    pub fn new(dir: impl Into<PathBuf>, needed: usize) -> Self {
        Self {
            dir: dir.into(),
            needed,
            exclude: None,
            granularity: Duration::from_millis(crate::config::DEFAULT_POLL_GRANULARITY_MS),
        }
    }

    /// Leaves `name` (the metadata file) out of the count.
    pub fn with_exclude(mut self, name: impl Into<String>) -> Self {
        self.exclude = Some(name.into());
        self
    }

    pub fn with_granularity(mut self, granularity: Duration) -> Self {
        self.granularity = granularity;
        self
    }

    /// Resolves with the final count once the target is reached.
    ///
    /// Holds at its next checkpoint while the engine is paused and returns
    /// `WatchError::Shutdown` on shutdown.
    pub async fn wait(self, control: &EngineControl) -> Result<usize, WatchError> {
        let (_watcher, mut events) = watch_directory(&self.dir);
        let mut tracker = FileCountTracker::new(self.needed);

        if self.rescan(&mut tracker)? || tracker.check() {
            debug!(dir = %self.dir.display(), found = tracker.found(), "File count already met");
            return Ok(tracker.found());
        }

        let mut rescan = tokio::time::interval(self.granularity);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        rescan.tick().await;

        loop {
            control.wait_while_paused().await?;

            tokio::select! {
                biased;

                _ = control.cancelled() => return Err(Shutdown.into()),

                Some(event) = events.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(dir = %self.dir.display(), error = %e, "Watch error");
                            continue;
                        }
                    };
                    if !matches!(event.kind, EventKind::Create(_)) {
                        continue;
                    }
                    for path in &event.paths {
                        if self.on_created(path, &mut tracker) {
                            return Ok(tracker.found());
                        }
                    }
                }

                _ = rescan.tick() => {
                    if self.rescan(&mut tracker)? {
                        return Ok(tracker.found());
                    }
                }
            }
        }
    }

    fn on_created(&self, path: &Path, tracker: &mut FileCountTracker) -> bool {
        if !path.is_file() {
            return false;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if self.exclude.as_deref() == Some(name) {
            return false;
        }
        let done = tracker.record(name);
        trace!(
            dir = %self.dir.display(),
            file = name,
            found = tracker.found(),
            needed = tracker.needed(),
            "File created"
        );
        if done {
            debug!(dir = %self.dir.display(), found = tracker.found(), "File count reached");
        }
        done
    }

    fn rescan(&self, tracker: &mut FileCountTracker) -> Result<bool, WatchError> {
        let names =
            list_data_files(&self.dir, self.exclude.as_deref()).map_err(|source| WatchError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let mut done = false;
        for name in &names {
            done |= tracker.record(name);
        }
        if done {
            debug!(dir = %self.dir.display(), found = tracker.found(), "File count reached");
        }
        Ok(done)
    }
}
