//! Per-job state machine.
//!
//! One [`JobRunner`] drives one admitted job from `JOB_STARTED` to
//! `COMPLETE`:
//!
//! ```text
//! JOB_STARTED
//!   -> MONITORING_INPUT        wait for NumFilesConsumed files (input jobs only)
//!   -> COPYING_TO_PROCESSING   settle, then move input -> processing
//!   -> EXECUTING               launch the worker on a leased port
//!   -> MONITORING_PROCESSING   wait for consumed + produced files
//!      (MONITORING_TCPIP)      ...while polling the worker's status port
//!   -> COPYING_TO_ARCHIVE      transfer files -> finished|error/{serial},
//!                              processing dir -> repository/{name}
//!   -> COMPLETE
//! ```
//!
//! The wall-clock limit starts at worker launch. When it expires the worker
//! is killed, `JOB_TIMEOUT` is recorded and the job archives to the error
//! buffer. Any other failure aborts only this job: its worker is killed, its
//! directory stays where it is and its last recorded status stays visible.
//!
//! The admission permit and the port lease are owned by the runner and its
//! runtime state, so both are returned on every exit path.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionPermit, PortAllocator, PortLease};
use crate::config::{ConfigFile, MAX_JOB_SECONDS_LIMIT};
use crate::control::{EngineControl, Shutdown};
use crate::discovery::{DiscoveredJob, JobOrigin};
use crate::fileops::{FileOps, FileOpsError};
use crate::metadata::{self, JobDescriptor, JobManifest, MetadataError, Verdict};
use crate::poller::{
    PollCadence, PollerError, StatusPoller, WorkerReply, DEFAULT_IO_TIMEOUT, DEFAULT_RETRY_WAIT,
};
use crate::status::{JobStatus, StatusLog, StatusLogError, TimeKind};
use crate::supervisor::{ProcessSupervisor, SupervisorError, WorkerCommand};
use crate::watcher::{FileCountWatcher, WatchError};

/// Per-job failures. None of these stop the engine.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    FileOps(#[from] FileOpsError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Poller(#[from] PollerError),

    #[error(transparent)]
    StatusLog(#[from] StatusLogError),

    #[error("No free TCP port for the worker")]
    NoPortAvailable,

    #[error("Job task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Interrupted by shutdown")]
    Shutdown(#[from] Shutdown),
}

impl JobError {
    /// True if the job stopped because the engine is shutting down.
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            JobError::Shutdown(_)
                | JobError::Metadata(MetadataError::Shutdown(_))
                | JobError::Watch(WatchError::Shutdown(_))
                | JobError::Poller(PollerError::Shutdown(_))
        )
    }
}

/// How a job left the pipeline.
#[derive(Debug)]
pub enum JobOutcome {
    /// Reached `COMPLETE`; the verdict chose finished or error.
    Completed(Verdict),
    /// Hit the wall-clock limit and archived to the error buffer.
    TimedOut,
    /// Aborted. The directory is left in place.
    Failed(JobError),
    /// Stopped by engine shutdown.
    Shutdown,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Completed(Verdict::Pass) => write!(f, "passed"),
            JobOutcome::Completed(Verdict::Fail) => write!(f, "failed verdict"),
            JobOutcome::TimedOut => write!(f, "timed out"),
            JobOutcome::Failed(e) => write!(f, "aborted: {e}"),
            JobOutcome::Shutdown => write!(f, "shut down"),
        }
    }
}

// =============================================================================
// Shared state
// =============================================================================

/// Registry view of one queued or running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub name: String,
    pub origin: JobOrigin,
    /// `None` while waiting for admission
    pub status: Option<JobStatus>,
    pub port: Option<u16>,
    /// Worker process id once launched
    pub pid: Option<u32>,
}

impl JobSnapshot {
    pub fn pending(job: &DiscoveredJob) -> Self {
        Self {
            name: job.name.clone(),
            origin: job.origin,
            status: None,
            port: None,
            pid: None,
        }
    }
}

/// Jobs known to the engine, keyed by name.
pub type JobRegistry = DashMap<String, JobSnapshot>;

/// Worker status polling parameters.
#[derive(Debug, Clone, Copy)]
pub struct PollerOptions {
    pub cadence: PollCadence,
    pub retry_wait: Duration,
    pub io_timeout: Duration,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            cadence: PollCadence::STANDARD,
            retry_wait: DEFAULT_RETRY_WAIT,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

/// Everything a job needs from the engine.
#[derive(Debug)]
pub struct JobContext {
    pub config: Arc<ConfigFile>,
    pub control: EngineControl,
    pub status_log: Arc<StatusLog>,
    pub fileops: Arc<FileOps>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub ports: PortAllocator,
    pub registry: Arc<JobRegistry>,
    pub poller: PollerOptions,
}

impl JobContext {
    fn granularity(&self) -> Duration {
        self.config.scheduler.poll_granularity()
    }

    fn status_poller(&self, port: u16) -> StatusPoller {
        StatusPoller::new(port)
            .with_cadence(self.poller.cadence)
            .with_retry_wait(self.poller.retry_wait)
            .with_io_timeout(self.poller.io_timeout)
    }

    fn processing_dir(&self, job: &str) -> PathBuf {
        self.config.buffers.processing_dir.join(job)
    }
}

/// Mutable state of one job, dropped when the job leaves the pipeline.
#[derive(Debug)]
pub struct JobRuntimeState {
    pub status: JobStatus,
    pub descriptor: Option<JobDescriptor>,
    pub manifest: Option<JobManifest>,
    pub port: Option<PortLease>,
    pub launched_at: Option<Instant>,
}

impl JobRuntimeState {
    fn new() -> Self {
        Self {
            status: JobStatus::JobStarted,
            descriptor: None,
            manifest: None,
            port: None,
            launched_at: None,
        }
    }
}

enum RunResult {
    Finished,
    TimedOut,
}

// =============================================================================
// Runner
// =============================================================================

/// Drives one admitted job through the pipeline.
pub struct JobRunner {
    ctx: Arc<JobContext>,
    job: DiscoveredJob,
    _permit: AdmissionPermit,
}

impl JobRunner {
    pub fn new(ctx: Arc<JobContext>, job: DiscoveredJob, permit: AdmissionPermit) -> Self {
        Self {
            ctx,
            job,
            _permit: permit,
        }
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    /// Runs the job to a terminal outcome. Consumes the runner, so the
    /// admission slot is freed when this returns.
    pub async fn run(self) -> JobOutcome {
        let mut state = JobRuntimeState::new();
        let result = self.drive(&mut state).await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_shutdown() => {
                info!(job = %self.job.name, status = %state.status, "Job stopped by shutdown");
                self.ctx.supervisor.kill(&self.job.name);
                JobOutcome::Shutdown
            }
            Err(e) => {
                error!(job = %self.job.name, status = %state.status, error = %e, "Job aborted");
                self.ctx.supervisor.kill(&self.job.name);
                JobOutcome::Failed(e)
            }
        };

        if let Some(started) = state.launched_at {
            debug!(job = %self.job.name, elapsed_secs = started.elapsed().as_secs(), "Job runtime");
        }
        outcome
    }

    async fn drive(&self, state: &mut JobRuntimeState) -> Result<JobOutcome, JobError> {
        let ctx = &self.ctx;
        let name = self.job.name.as_str();
        let results_file = ctx.config.jobs.results_file.as_str();

        self.transition(state, JobStatus::JobStarted, TimeKind::Received).await?;
        info!(job = %name, origin = %self.job.origin, "Job started");

        // Identity and requirements
        let source_dir = self.job.directory(
            &ctx.config.buffers.input_dir,
            &ctx.config.buffers.processing_dir,
        );
        let metadata_file = metadata::find_metadata_file(
            &source_dir,
            results_file,
            &ctx.control,
            ctx.granularity(),
        )
        .await?;
        let descriptor = JobDescriptor::new(name, source_dir.clone(), metadata_file);
        metadata::wait_until_ready(&descriptor.metadata_path(), &ctx.control, ctx.granularity())
            .await?;
        let manifest = JobManifest::read(&descriptor.metadata_path())?;
        info!(
            job = %name,
            serial = %descriptor.serial,
            modeler = %manifest.modeler_name,
            consumed = manifest.files_consumed,
            produced = manifest.files_produced,
            transfers = manifest.transfer_files.len(),
            "Job metadata read"
        );
        let metadata_file = descriptor.metadata_file.clone();
        state.descriptor = Some(descriptor);
        state.manifest = Some(manifest.clone());

        // Input assembly and hand-off
        if self.job.origin == JobOrigin::Input {
            self.transition(state, JobStatus::MonitoringInput, TimeKind::Started).await?;
            FileCountWatcher::new(&source_dir, manifest.files_consumed)
                .with_exclude(metadata_file.as_str())
                .with_granularity(ctx.granularity())
                .wait(&ctx.control)
                .await?;

            ctx.control.sleep(ctx.config.scheduler.settle_delay()).await?;
            self.transition(state, JobStatus::CopyingToProcessing, TimeKind::Started).await?;
            let dst = ctx.processing_dir(name);
            let fileops = Arc::clone(&ctx.fileops);
            let src = source_dir.clone();
            let dst_for_move = dst.clone();
            let copied = tokio::task::spawn_blocking(move || {
                fileops.move_directory_contents(&src, &dst_for_move, true, true)
            })
            .await??;
            info!(job = %name, files = copied, dst = %dst.display(), "Moved job to processing buffer");
        }

        // Execution
        let processing_dir = ctx.processing_dir(name);
        self.transition(state, JobStatus::Executing, TimeKind::Started).await?;
        let lease = ctx.ports.lease().ok_or(JobError::NoPortAvailable)?;
        let port = lease.port();
        state.port = Some(lease);

        let command = WorkerCommand::new(
            &ctx.config.worker,
            name,
            &manifest.modeler_name,
            &processing_dir,
            port,
        );
        let worker = ctx.supervisor.launch(&command)?;
        if let Some(mut entry) = ctx.registry.get_mut(name) {
            entry.port = Some(port);
            entry.pid = worker.pid;
        }
        let launched_at = Instant::now();
        state.launched_at = Some(launched_at);
        let limit = ctx.config.scheduler.max_job_duration();
        let deadline = launched_at
            .checked_add(limit)
            .unwrap_or_else(|| launched_at + Duration::from_secs(MAX_JOB_SECONDS_LIMIT));

        // Output assembly
        self.transition(state, JobStatus::MonitoringProcessing, TimeKind::Started).await?;
        let run = self
            .monitor_processing(&processing_dir, &metadata_file, &manifest, port, deadline)
            .await?;

        // Archival
        let verdict = match run {
            RunResult::TimedOut => {
                warn!(
                    job = %name,
                    limit_secs = ctx.config.scheduler.max_job_seconds,
                    "Job exceeded wall-clock limit, killing worker"
                );
                ctx.supervisor.kill(name);
                self.transition(state, JobStatus::JobTimeout, TimeKind::Completed).await?;
                Verdict::Fail
            }
            RunResult::Finished => {
                ctx.supervisor.reap(name);
                let results_path = processing_dir.join(results_file);
                tokio::task::spawn_blocking(move || metadata::read_verdict(&results_path)).await??
            }
        };

        self.transition(state, JobStatus::CopyingToArchive, TimeKind::Started).await?;
        let serial = state
            .descriptor
            .as_ref()
            .map(|d| d.serial.clone())
            .unwrap_or_else(|| name.to_string());
        self.archive(&processing_dir, &serial, &manifest.transfer_files, verdict).await?;

        self.transition(state, JobStatus::Complete, TimeKind::Completed).await?;
        let outcome = match run {
            RunResult::TimedOut => JobOutcome::TimedOut,
            RunResult::Finished => JobOutcome::Completed(verdict),
        };
        info!(job = %name, outcome = %outcome, "Job complete");
        Ok(outcome)
    }

    /// Waits for the output files and the worker's completion report, both
    /// bounded by the wall-clock deadline.
    async fn monitor_processing(
        &self,
        processing_dir: &Path,
        metadata_file: &str,
        manifest: &JobManifest,
        port: u16,
        deadline: Instant,
    ) -> Result<RunResult, JobError> {
        let ctx = &self.ctx;
        let name = self.job.name.as_str();

        let files = async {
            FileCountWatcher::new(processing_dir, manifest.files_expected_after_run())
                .with_exclude(metadata_file)
                .with_granularity(ctx.granularity())
                .wait(&ctx.control)
                .await
                .map_err(JobError::from)
        };

        let mut tcpip_record: Option<JoinHandle<()>> = None;
        let poller = ctx.status_poller(port);
        let status = async {
            poller
                .run(&ctx.control, |reply: &WorkerReply| {
                    if tcpip_record.is_none() {
                        debug!(job = %name, reply = ?reply, "Worker answered status request");
                        tcpip_record =
                            Some(self.record_detached(JobStatus::MonitoringTcpip, TimeKind::Started));
                    }
                })
                .await
                .map_err(JobError::from)
        };

        let waits = async { tokio::try_join!(files, status) };
        let waited = tokio::time::timeout_at(deadline.into(), waits).await;
        // The sub-phase row must land before the next stage's row.
        if let Some(record) = tcpip_record {
            record.await?;
        }
        match waited {
            Ok(Ok((found, summary))) => {
                debug!(job = %name, files = found, replies = summary.replies, "Worker finished");
                Ok(RunResult::Finished)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(RunResult::TimedOut),
        }
    }

    /// Copies transfer files to `{finished|error}/{serial}` and moves the
    /// processing directory to the repository.
    async fn archive(
        &self,
        processing_dir: &Path,
        serial: &str,
        transfer_files: &[String],
        verdict: Verdict,
    ) -> Result<(), JobError> {
        let buffers = &self.ctx.config.buffers;
        let dest_root = if verdict.is_pass() {
            &buffers.finished_dir
        } else {
            &buffers.error_dir
        };
        let dest = dest_root.join(serial);
        let repository = buffers.repository_dir.join(&self.job.name);

        let fileops = Arc::clone(&self.ctx.fileops);
        let name = self.job.name.clone();
        let src = processing_dir.to_path_buf();
        let files = transfer_files.to_vec();

        tokio::task::spawn_blocking(move || -> Result<(), JobError> {
            std::fs::create_dir_all(&dest).map_err(|source| FileOpsError::Io {
                op: "create directory",
                path: dest.clone(),
                source,
            })?;
            for file in &files {
                if !is_plain_file_name(file) {
                    warn!(
                        job = %name,
                        file = %file,
                        "Transfer file name is not a plain file name, skipping"
                    );
                    continue;
                }
                let from = src.join(file);
                if !from.is_file() {
                    warn!(job = %name, file = %file, "Transfer file missing, skipping");
                    continue;
                }
                fileops.copy_file(&from, &dest.join(file))?;
            }
            fileops.move_directory_contents(&src, &repository, true, true)?;
            info!(
                job = %name,
                transfers = %dest.display(),
                repository = %repository.display(),
                "Job archived"
            );
            Ok(())
        })
        .await?
    }

    /// Records a stage transition once the engine is not paused.
    async fn transition(
        &self,
        state: &mut JobRuntimeState,
        status: JobStatus,
        kind: TimeKind,
    ) -> Result<(), JobError> {
        self.ctx.control.wait_while_paused().await?;
        let log = Arc::clone(&self.ctx.status_log);
        let job = self.job.name.clone();
        tokio::task::spawn_blocking(move || log.record(&job, status, kind)).await??;
        state.status = status;
        if let Some(mut entry) = self.ctx.registry.get_mut(&self.job.name) {
            entry.status = Some(status);
        }
        debug!(job = %self.job.name, status = %status, "Job status");
        Ok(())
    }

    /// Records a sub-phase status from a synchronous callback. The row is
    /// written on the blocking pool; failures are logged rather than
    /// aborting the job.
    fn record_detached(&self, status: JobStatus, kind: TimeKind) -> JoinHandle<()> {
        if let Some(mut entry) = self.ctx.registry.get_mut(&self.job.name) {
            entry.status = Some(status);
        }
        let log = Arc::clone(&self.ctx.status_log);
        let job = self.job.name.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = log.record(&job, status, kind) {
                warn!(job = %job, status = %status, error = %e, "Failed to record status");
            }
        })
    }
}

/// True for a single normal path component, so a transfer entry cannot
/// name anything outside the job's own directory.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner").field("job", &self.job).finish()
    }
}
