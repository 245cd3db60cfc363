//! Directory watching on top of OS change notifications.
//!
//! - [`FileCountWatcher`] waits for a job directory to hold a target number
//!   of files.
//! - [`InputBufferWatcher`] reports job directories arriving in the input
//!   buffer.
//!
//! Both pair a `notify` watcher with a periodic rescan bounded by the poll
//! granularity, so a dropped notification delays progress by at most one
//! rescan and never stalls a job.

mod buffer;
mod count;

pub use buffer::InputBufferWatcher;
pub use count::{list_data_files, FileCountTracker, FileCountWatcher, WatchError};
pub(crate) use buffer::list_job_dirs;

use std::path::Path;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type EventReceiver = mpsc::UnboundedReceiver<notify::Result<Event>>;

/// Starts a non-recursive watch on `dir`, forwarding events to a channel.
///
/// Returns `None` when the platform watcher cannot be created; callers then
/// rely on their periodic rescan alone.
fn watch_directory(dir: &Path) -> (Option<RecommendedWatcher>, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let watcher = notify::recommended_watcher(move |event| {
        if tx.send(event).is_err() {
            debug!("Watch event dropped because receiver is closed");
        }
    })
    .and_then(|mut watcher| {
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    });

    match watcher {
        Ok(watcher) => (Some(watcher), rx),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "File notifications unavailable, polling only");
            (None, rx)
        }
    }
}
