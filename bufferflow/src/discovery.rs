//! Startup sweep of the buffer tree.
//!
//! Jobs left in the processing buffer by a previous run come first: they
//! are partially done work. Jobs waiting in the input buffer follow. Within
//! each buffer jobs are ordered by name, which for `{serial}_{timestamp}`
//! directories is arrival order per serial. After the sweep, new arrivals
//! are reported by [`crate::watcher::InputBufferWatcher`].

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::watcher::list_job_dirs;

/// Buffer a job was discovered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobOrigin {
    /// Not yet started. Runs the whole pipeline.
    Input,
    /// Interrupted mid-run. Resumes at worker launch.
    Processing,
}

impl fmt::Display for JobOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOrigin::Input => write!(f, "input"),
            JobOrigin::Processing => write!(f, "processing"),
        }
    }
}

/// A job directory found in a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredJob {
    pub name: String,
    pub origin: JobOrigin,
}

impl DiscoveredJob {
    pub fn new(name: impl Into<String>, origin: JobOrigin) -> Self {
        Self {
            name: name.into(),
            origin,
        }
    }

    /// Directory holding the job given the two buffer roots.
    pub fn directory(&self, input_dir: &Path, processing_dir: &Path) -> PathBuf {
        match self.origin {
            JobOrigin::Input => input_dir.join(&self.name),
            JobOrigin::Processing => processing_dir.join(&self.name),
        }
    }
}

/// Lists jobs already present, processing buffer first.
///
/// A name present in both buffers is taken from the processing buffer only.
pub fn initial_sweep(input_dir: &Path, processing_dir: &Path) -> io::Result<Vec<DiscoveredJob>> {
    let mut processing: Vec<String> = list_job_dirs(processing_dir)?.into_iter().collect();
    let mut input: Vec<String> = list_job_dirs(input_dir)?.into_iter().collect();
    processing.sort();
    input.sort();

    let mut jobs: Vec<DiscoveredJob> = processing
        .iter()
        .map(|name| DiscoveredJob::new(name.as_str(), JobOrigin::Processing))
        .collect();

    for name in input {
        if processing.binary_search(&name).is_ok() {
            warn!(job = %name, "Job present in both input and processing buffers, resuming from processing");
            continue;
        }
        jobs.push(DiscoveredJob::new(name, JobOrigin::Input));
    }

    info!(
        recovered = processing.len(),
        waiting = jobs.len() - processing.len(),
        "Initial buffer sweep complete"
    );
    Ok(jobs)
}
