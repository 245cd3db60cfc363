//! The orchestration engine.
//!
//! [`Engine`] owns all shared state (admission counter, job registry, worker
//! registry, status log and the pause/shutdown control) and hands it to each
//! job explicitly through a [`JobContext`]. Three long-lived tasks run while
//! monitoring:
//!
//! - the scheduler, which keeps a FIFO of jobs waiting for a slot and admits
//!   them as slots free up or on every scan interval
//! - the input buffer watcher, which feeds new job names to the scheduler
//! - the pause file monitor, when a pause file is configured
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::new(Arc::new(ConfigFile::load()?));
//! engine.start_monitoring()?;
//! // ...
//! engine.stop_monitoring().await;
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, AdmissionPermit, PortAllocator};
use crate::config::{ConfigFile, ConfigFileError};
use crate::control::EngineControl;
use crate::discovery::{self, DiscoveredJob, JobOrigin};
use crate::fileops::FileOps;
use crate::job::{
    JobContext, JobError, JobOutcome, JobRegistry, JobRunner, JobSnapshot, PollerOptions,
};
use crate::status::{StatusLog, StatusLogEntry, StatusLogError};
use crate::supervisor::{ProcessSupervisor, SystemLauncher, WorkerLauncher};
use crate::watcher::InputBufferWatcher;

/// How long shutdown waits for running jobs to unwind.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Engine-level errors. Only startup can fail; running jobs never
/// surface errors here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigFileError),

    #[error("Cannot create {label} buffer {path}: {source}")]
    BufferDirectory {
        label: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Initial buffer sweep failed: {0}")]
    Discovery(#[source] io::Error),

    #[error(transparent)]
    StatusLog(#[from] StatusLogError),

    #[error("Monitoring is already running")]
    AlreadyRunning,

    #[error("Engine has been stopped")]
    Stopped,
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct EngineCounters {
    admitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    pending: AtomicUsize,
}

/// Snapshot of engine activity since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Jobs granted a slot
    pub admitted: u64,
    /// Jobs that reached `COMPLETE` without timing out
    pub completed: u64,
    /// Jobs aborted by an error
    pub failed: u64,
    /// Jobs that hit the wall-clock limit
    pub timed_out: u64,
    /// Jobs holding a slot right now
    pub executing: usize,
    /// Jobs waiting for a slot
    pub pending: usize,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "admitted={} completed={} failed={} timed_out={} executing={} pending={}",
            self.admitted, self.completed, self.failed, self.timed_out, self.executing, self.pending
        )
    }
}

// =============================================================================
// Engine
// =============================================================================

enum Lifecycle {
    Idle,
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

/// Buffer-directory job engine.
pub struct Engine {
    config: Arc<ConfigFile>,
    control: EngineControl,
    status_log: Arc<StatusLog>,
    supervisor: Arc<ProcessSupervisor>,
    registry: Arc<JobRegistry>,
    admission: AdmissionController,
    counters: Arc<EngineCounters>,
    poller: PollerOptions,
    lifecycle: Mutex<Lifecycle>,
}

impl Engine {
    /// Creates an engine that launches workers as OS processes.
    pub fn new(config: Arc<ConfigFile>) -> Self {
        Self::with_launcher(config, Arc::new(SystemLauncher))
    }

    /// Creates an engine with a custom worker launcher.
    pub fn with_launcher(config: Arc<ConfigFile>, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let status_log = Arc::new(StatusLog::new(
            config.status_log.file.clone(),
            config.status_log.max_size,
        ));
        let admission = AdmissionController::new(config.scheduler.execution_limit);
        Self {
            control: EngineControl::new(),
            status_log,
            supervisor: Arc::new(ProcessSupervisor::new(launcher)),
            registry: Arc::new(JobRegistry::new()),
            admission,
            counters: Arc::new(EngineCounters::default()),
            poller: PollerOptions::default(),
            lifecycle: Mutex::new(Lifecycle::Idle),
            config,
        }
    }

    /// Overrides worker status polling parameters.
    pub fn with_poller_options(mut self, options: PollerOptions) -> Self {
        self.poller = options;
        self
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn control(&self) -> &EngineControl {
        &self.control
    }

    pub fn status_log(&self) -> &Arc<StatusLog> {
        &self.status_log
    }

    /// Prunes the history, sweeps the buffers and starts the background
    /// tasks. Must be called from within a tokio runtime.
    pub fn start_monitoring(&self) -> Result<(), EngineError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running(_) => return Err(EngineError::AlreadyRunning),
            Lifecycle::Stopped => return Err(EngineError::Stopped),
        }

        self.config.validate()?;
        self.prepare_buffers()?;
        match self.status_log.prune_history(self.config.status_log.retention_days) {
            Ok(removed) => debug!(removed, "Startup history prune"),
            Err(e) => warn!(error = %e, "Failed to prune status history"),
        }

        let buffers = &self.config.buffers;
        let initial = discovery::initial_sweep(&buffers.input_dir, &buffers.processing_dir)
            .map_err(EngineError::Discovery)?;
        let known_input: Vec<String> = initial
            .iter()
            .filter(|job| job.origin == JobOrigin::Input)
            .map(|job| job.name.clone())
            .collect();

        let ctx = Arc::new(JobContext {
            config: Arc::clone(&self.config),
            control: self.control.clone(),
            status_log: Arc::clone(&self.status_log),
            fileops: Arc::new(FileOps::new()),
            supervisor: Arc::clone(&self.supervisor),
            ports: PortAllocator::new(self.config.worker.start_port),
            registry: Arc::clone(&self.registry),
            poller: self.poller,
        });

        let (arrivals_tx, arrivals_rx) = mpsc::unbounded_channel();
        let scan_interval = self.config.scheduler.scan_interval();
        let mut handles = Vec::with_capacity(3);

        let scheduler = Scheduler::new(ctx, self.admission.clone(), Arc::clone(&self.counters));
        handles.push(tokio::spawn(scheduler.run(initial, arrivals_rx)));

        let watcher =
            InputBufferWatcher::new(&buffers.input_dir, scan_interval).with_known(known_input);
        handles.push(tokio::spawn(watcher.run(self.control.clone(), arrivals_tx)));

        if let Some(path) = &self.config.scheduler.pause_file {
            let monitor = PauseFileMonitor {
                path: path.clone(),
                interval: self.config.scheduler.poll_granularity(),
            };
            handles.push(tokio::spawn(monitor.run(self.control.clone())));
        }

        *lifecycle = Lifecycle::Running(handles);
        info!(
            execution_limit = self.admission.limit(),
            start_port = self.config.worker.start_port,
            input = %buffers.input_dir.display(),
            "Monitoring started"
        );
        Ok(())
    }

    /// Signals shutdown, kills every tracked worker and waits for the
    /// background tasks to finish. The engine cannot be restarted.
    pub async fn stop_monitoring(&self) {
        let handles = match std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped) {
            Lifecycle::Running(handles) => handles,
            Lifecycle::Idle | Lifecycle::Stopped => Vec::new(),
        };

        self.control.shutdown();
        let killed = self.supervisor.kill_all();

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Engine task ended abnormally");
            }
        }
        self.registry.clear();
        info!(killed, stats = %self.stats(), "Monitoring stopped");
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    /// Transitions recorded since this process started.
    pub fn get_current_status(&self) -> Vec<StatusLogEntry> {
        self.status_log.current()
    }

    /// The full history after applying the retention window.
    pub fn get_historical_status(&self) -> Result<Vec<StatusLogEntry>, EngineError> {
        self.status_log
            .prune_history(self.config.status_log.retention_days)?;
        Ok(self.status_log.read_history()?)
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            executing: self.admission.executing(),
            pending: self.counters.pending.load(Ordering::Relaxed),
        }
    }

    /// Queued and running jobs, by name.
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self.registry.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    fn prepare_buffers(&self) -> Result<(), EngineError> {
        for (label, path) in self.config.buffers.all() {
            std::fs::create_dir_all(path).map_err(|source| EngineError::BufferDirectory {
                label,
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.control.shutdown();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("stats", &self.stats())
            .field("running", &self.is_running())
            .finish()
    }
}

// =============================================================================
// Scheduler
// =============================================================================

type JobExit = (String, Result<JobOutcome, JoinError>);

/// Admits queued jobs in FIFO order and collects finished ones.
struct Scheduler {
    ctx: Arc<JobContext>,
    admission: AdmissionController,
    counters: Arc<EngineCounters>,
    pending: VecDeque<DiscoveredJob>,
    running: JoinSet<JobExit>,
    /// Abort handles of the job tasks themselves, keyed by job name
    job_tasks: HashMap<String, AbortHandle>,
    grace: Duration,
}

impl Scheduler {
    fn new(
        ctx: Arc<JobContext>,
        admission: AdmissionController,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            ctx,
            admission,
            counters,
            pending: VecDeque::new(),
            running: JoinSet::new(),
            job_tasks: HashMap::new(),
            grace: SHUTDOWN_GRACE,
        }
    }

    async fn run(
        mut self,
        initial: Vec<DiscoveredJob>,
        mut arrivals: mpsc::UnboundedReceiver<String>,
    ) {
        for job in initial {
            self.enqueue(job);
        }
        self.admit_pending();

        let control = self.ctx.control.clone();
        let mut interval = tokio::time::interval(self.ctx.config.scheduler.scan_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = control.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }

                Some(joined) = self.running.join_next(), if !self.running.is_empty() => {
                    self.on_finished(joined);
                    self.admit_pending();
                }

                Some(name) = arrivals.recv() => {
                    self.enqueue(DiscoveredJob::new(name, JobOrigin::Input));
                    self.admit_pending();
                }

                _ = interval.tick() => {
                    self.admit_pending();
                }
            }
        }

        self.drain().await;
    }

    /// Queues a job unless one with the same name is already queued or running.
    fn enqueue(&mut self, job: DiscoveredJob) {
        match self.ctx.registry.entry(job.name.clone()) {
            Entry::Occupied(_) => {
                debug!(job = %job.name, "Job already known, ignoring duplicate");
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(JobSnapshot::pending(&job));
            }
        }
        debug!(job = %job.name, origin = %job.origin, "Job queued");
        self.pending.push_back(job);
        self.counters.pending.store(self.pending.len(), Ordering::Relaxed);
    }

    fn admit_pending(&mut self) {
        let control = &self.ctx.control;
        if control.is_paused() || control.is_shutdown() {
            return;
        }
        while !self.pending.is_empty() {
            let Some(permit) = self.admission.try_admit() else {
                debug!(pending = self.pending.len(), "No free slot, jobs stay queued");
                break;
            };
            let Some(job) = self.pending.pop_front() else {
                break;
            };
            self.launch(job, permit);
        }
        self.counters.pending.store(self.pending.len(), Ordering::Relaxed);
    }

    fn launch(&mut self, job: DiscoveredJob, permit: AdmissionPermit) {
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        info!(
            job = %job.name,
            origin = %job.origin,
            executing = self.admission.executing(),
            "Job admitted"
        );
        let name = job.name.clone();
        let runner = JobRunner::new(Arc::clone(&self.ctx), job, permit);
        self.track(name, tokio::spawn(runner.run()));
    }

    /// Watches a job task. The job runs in its own task so a panic still
    /// reports the job's name.
    fn track(&mut self, name: String, task: JoinHandle<JobOutcome>) {
        self.job_tasks.insert(name.clone(), task.abort_handle());
        self.running.spawn(async move { (name, task.await) });
    }

    fn on_finished(&mut self, joined: Result<JobExit, JoinError>) {
        let (name, result) = match joined {
            Ok(exit) => exit,
            Err(e) => {
                error!(error = %e, "Job tracking task failed");
                return;
            }
        };
        self.ctx.registry.remove(&name);
        self.job_tasks.remove(&name);

        let outcome = result.unwrap_or_else(|e| {
            error!(job = %name, error = %e, "Job task panicked");
            self.ctx.supervisor.kill(&name);
            JobOutcome::Failed(JobError::Task(e))
        });
        let counter = match outcome {
            JobOutcome::Completed(_) => &self.counters.completed,
            JobOutcome::TimedOut => &self.counters.timed_out,
            JobOutcome::Failed(_) => &self.counters.failed,
            JobOutcome::Shutdown => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    async fn drain(&mut self) {
        self.pending.clear();
        self.counters.pending.store(0, Ordering::Relaxed);
        if self.running.is_empty() {
            return;
        }

        info!(running = self.running.len(), "Waiting for jobs to stop");
        let drained = tokio::time::timeout(self.grace, async {
            while let Some(joined) = self.running.join_next().await {
                self.on_finished(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(running = self.running.len(), "Jobs did not stop in time, aborting");
            self.abort_jobs().await;
        }
    }

    /// Aborts every job task and its tracking task. Dropping an aborted
    /// runner releases its admission slot and port lease.
    async fn abort_jobs(&mut self) {
        for (name, task) in self.job_tasks.drain() {
            debug!(job = %name, "Aborting job task");
            task.abort();
        }
        self.running.shutdown().await;
        self.ctx.supervisor.kill_all();
    }
}

// =============================================================================
// Pause file
// =============================================================================

/// Pauses the engine while a flag file exists.
struct PauseFileMonitor {
    path: PathBuf,
    interval: Duration,
}

impl PauseFileMonitor {
    async fn run(self, control: EngineControl) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut present = false;

        loop {
            tokio::select! {
                biased;

                _ = control.cancelled() => break,

                _ = interval.tick() => {
                    let now_present = self.path.exists();
                    if now_present == present {
                        continue;
                    }
                    present = now_present;
                    if present {
                        info!(path = %self.path.display(), "Pause file present");
                        control.pause();
                    } else {
                        info!(path = %self.path.display(), "Pause file removed");
                        control.resume();
                    }
                }
            }
        }
    }
}
