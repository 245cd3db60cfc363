//! Input buffer watcher: reports newly arrived job directories.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::EventKind;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::watch_directory;
use crate::control::EngineControl;

/// Long-running task that sends the name of every subdirectory created in
/// the input buffer root.
///
/// Names already handed to the engine by the startup sweep are passed in via
/// [`InputBufferWatcher::with_known`] so they are not reported twice. A
/// periodic rescan catches directories whose notification was missed, and
/// forgets names that have left the buffer so a re-dropped job is seen again.
#[derive(Debug)]
pub struct InputBufferWatcher {
    root: PathBuf,
    known: HashSet<String>,
    rescan_interval: Duration,
}

impl InputBufferWatcher {
    pub fn new(root: impl Into<PathBuf>, rescan_interval: Duration) -> Self {
        Self {
            root: root.into(),
            known: HashSet::new(),
            rescan_interval,
        }
    }

    pub fn with_known<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known.extend(names.into_iter().map(Into::into));
        self
    }

    /// Runs until shutdown or until the receiving side is dropped.
    pub async fn run(mut self, control: EngineControl, jobs: mpsc::UnboundedSender<String>) {
        let (_watcher, mut events) = watch_directory(&self.root);
        info!(root = %self.root.display(), "Input buffer watcher started");

        let mut rescan = tokio::time::interval(self.rescan_interval);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = control.cancelled() => break,

                Some(event) = events.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(root = %self.root.display(), error = %e, "Watch error");
                            continue;
                        }
                    };
                    if !matches!(event.kind, EventKind::Create(_)) {
                        continue;
                    }
                    for path in &event.paths {
                        if let Some(name) = self.job_name(path) {
                            if !self.report(name, &jobs) {
                                return;
                            }
                        }
                    }
                }

                _ = rescan.tick() => {
                    for name in self.rescan() {
                        if !self.report(name, &jobs) {
                            return;
                        }
                    }
                }
            }
        }

        info!("Input buffer watcher stopped");
    }

    /// Name of `path` if it is a direct subdirectory of the root.
    fn job_name(&self, path: &Path) -> Option<String> {
        if path.parent() != Some(self.root.as_path()) || !path.is_dir() {
            return None;
        }
        path.file_name()?.to_str().map(str::to_string)
    }

    /// Returns directories not seen before and drops names that are gone.
    fn rescan(&mut self) -> Vec<String> {
        let present = match list_job_dirs(&self.root) {
            Ok(present) => present,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Input buffer rescan failed");
                return Vec::new();
            }
        };
        self.known.retain(|name| present.contains(name));
        let mut fresh: Vec<String> = present
            .into_iter()
            .filter(|name| !self.known.contains(name))
            .collect();
        fresh.sort();
        fresh
    }

    fn report(&mut self, name: String, jobs: &mpsc::UnboundedSender<String>) -> bool {
        if !self.known.insert(name.clone()) {
            return true;
        }
        debug!(job = %name, "New job directory");
        jobs.send(name).is_ok()
    }
}

/// Names of the subdirectories of `root`.
pub(crate) fn list_job_dirs(root: &Path) -> std::io::Result<HashSet<String>> {
    let mut names = HashSet::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Ok(name) = entry.file_name().into_string() {
                names.insert(name);
            }
        }
    }
    Ok(names)
}
