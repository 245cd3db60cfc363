//! Worker process launch and tracking.
//!
//! The engine launches one external worker ("modeler") per job. Launching
//! goes through the [`WorkerLauncher`] trait so tests can substitute an
//! in-process worker; [`SystemLauncher`] is the real implementation. Every
//! launched worker is held in the [`ProcessSupervisor`] registry, keyed by
//! job name, until the job leaves the pipeline.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::WorkerSettings;

/// Worker launch errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Worker executable not found: {0}")]
    ExecutableNotFound(PathBuf),

    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Job {0} already has a worker")]
    AlreadyRunning(String),
}

/// Command line for one worker.
///
/// The program is `{modeler_root}/{modeler}/{modeler}.{ext}`; the arguments
/// are the processing directory, the TCP port and the CPU core hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub job: String,
    pub modeler: String,
    pub program: PathBuf,
    pub processing_dir: PathBuf,
    pub port: u16,
    pub cpu_cores: usize,
}

impl WorkerCommand {
    pub fn new(
        settings: &WorkerSettings,
        job: &str,
        modeler: &str,
        processing_dir: &Path,
        port: u16,
    ) -> Self {
        Self {
            job: job.to_string(),
            modeler: modeler.to_string(),
            program: executable_path(settings, modeler),
            processing_dir: processing_dir.to_path_buf(),
            port,
            cpu_cores: settings.cpu_cores,
        }
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            self.processing_dir.display().to_string(),
            self.port.to_string(),
            self.cpu_cores.to_string(),
        ]
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in self.args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Path of a modeler's executable.
pub fn executable_path(settings: &WorkerSettings, modeler: &str) -> PathBuf {
    let file = if settings.executable_extension.is_empty() {
        modeler.to_string()
    } else {
        format!("{modeler}.{}", settings.executable_extension)
    };
    settings.modeler_root_dir.join(modeler).join(file)
}

// =============================================================================
// Launcher seam
// =============================================================================

/// A running worker.
pub trait WorkerProcess: Send + fmt::Debug {
    /// OS process id, if the worker is an OS process.
    fn id(&self) -> Option<u32>;

    /// Requests termination. Does not wait for the process to exit.
    fn kill(&mut self) -> io::Result<()>;

    /// True once the worker has exited.
    fn has_exited(&mut self) -> bool;
}

/// Starts workers.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self, command: &WorkerCommand) -> Result<Box<dyn WorkerProcess>, SupervisorError>;
}

/// Launches workers as child processes.
///
/// Children are spawned with `kill_on_drop`, so a handle dropped on any
/// path also takes its process down.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl WorkerLauncher for SystemLauncher {
    fn launch(&self, command: &WorkerCommand) -> Result<Box<dyn WorkerProcess>, SupervisorError> {
        if !command.program.is_file() {
            return Err(SupervisorError::ExecutableNotFound(command.program.clone()));
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(command.args())
            .current_dir(&command.processing_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        Ok(Box::new(ChildWorker { child }))
    }
}

#[derive(Debug)]
struct ChildWorker {
    child: Child,
}

impl WorkerProcess for ChildWorker {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.child.start_kill()
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug)]
struct TrackedWorker {
    process: Box<dyn WorkerProcess>,
    modeler: String,
    port: u16,
    launched_at: Instant,
}

/// Snapshot of one tracked worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub job: String,
    pub modeler: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub running_for: Duration,
}

/// Registry of live workers, keyed by job name.
pub struct ProcessSupervisor {
    launcher: Arc<dyn WorkerLauncher>,
    workers: Mutex<HashMap<String, TrackedWorker>>,
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

impl ProcessSupervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            launcher,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Launches the worker for `command.job` and registers it.
    pub fn launch(&self, command: &WorkerCommand) -> Result<WorkerInfo, SupervisorError> {
        let mut workers = self.workers.lock();
        if workers.contains_key(&command.job) {
            return Err(SupervisorError::AlreadyRunning(command.job.clone()));
        }

        let process = self.launcher.launch(command)?;
        let tracked = TrackedWorker {
            process,
            modeler: command.modeler.clone(),
            port: command.port,
            launched_at: Instant::now(),
        };
        let info = snapshot(&command.job, &tracked);
        info!(
            job = %command.job,
            pid = ?info.pid,
            port = command.port,
            command = %command,
            "Worker launched"
        );
        workers.insert(command.job.clone(), tracked);
        Ok(info)
    }

    /// Force-terminates and unregisters the worker of `job`.
    /// Returns false if no worker was tracked.
    pub fn kill(&self, job: &str) -> bool {
        let Some(mut tracked) = self.workers.lock().remove(job) else {
            return false;
        };
        terminate(job, &mut tracked);
        true
    }

    /// Force-terminates every tracked worker and clears the registry.
    pub fn kill_all(&self) -> usize {
        let drained: Vec<(String, TrackedWorker)> = self.workers.lock().drain().collect();
        let count = drained.len();
        for (job, mut tracked) in drained {
            terminate(&job, &mut tracked);
        }
        if count > 0 {
            info!(count, "Killed all workers");
        }
        count
    }

    /// Unregisters the worker of a finished job, killing it if it is still
    /// running. Returns `Some(true)` if it had to be killed.
    pub fn reap(&self, job: &str) -> Option<bool> {
        let mut tracked = self.workers.lock().remove(job)?;
        if tracked.process.has_exited() {
            debug!(job = %job, "Worker exited");
            Some(false)
        } else {
            warn!(job = %job, "Worker still running after completion, killing");
            terminate(job, &mut tracked);
            Some(true)
        }
    }

    pub fn info(&self, job: &str) -> Option<WorkerInfo> {
        self.workers.lock().get(job).map(|t| snapshot(job, t))
    }

    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut all: Vec<WorkerInfo> = self
            .workers
            .lock()
            .iter()
            .map(|(job, t)| snapshot(job, t))
            .collect();
        all.sort_by(|a, b| a.job.cmp(&b.job));
        all
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn snapshot(job: &str, tracked: &TrackedWorker) -> WorkerInfo {
    WorkerInfo {
        job: job.to_string(),
        modeler: tracked.modeler.clone(),
        pid: tracked.process.id(),
        port: tracked.port,
        running_for: tracked.launched_at.elapsed(),
    }
}

fn terminate(job: &str, tracked: &mut TrackedWorker) {
    match tracked.process.kill() {
        Ok(()) => info!(job = %job, pid = ?tracked.process.id(), "Worker killed"),
        Err(e) => warn!(job = %job, error = %e, "Failed to kill worker"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct FakeProcess {
        killed: Arc<AtomicBool>,
        exited: bool,
    }

    impl WorkerProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(42)
        }

        fn kill(&mut self) -> io::Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn has_exited(&mut self) -> bool {
            self.exited
        }
    }

    struct FakeLauncher {
        killed: Arc<AtomicBool>,
        exited: bool,
    }

    impl WorkerLauncher for FakeLauncher {
        fn launch(&self, _: &WorkerCommand) -> Result<Box<dyn WorkerProcess>, SupervisorError> {
            Ok(Box::new(FakeProcess {
                killed: Arc::clone(&self.killed),
                exited: self.exited,
            }))
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            modeler_root_dir: PathBuf::from("/opt/modelers"),
            executable_extension: "exe".to_string(),
            cpu_cores: 8,
            start_port: 50_000,
        }
    }

    fn command(job: &str) -> WorkerCommand {
        WorkerCommand::new(&settings(), job, "ModelA", Path::new("/buf/proc/job"), 50_001)
    }

    fn supervisor(exited: bool) -> (ProcessSupervisor, Arc<AtomicBool>) {
        let killed = Arc::new(AtomicBool::new(false));
        let launcher = FakeLauncher {
            killed: Arc::clone(&killed),
            exited,
        };
        (ProcessSupervisor::new(Arc::new(launcher)), killed)
    }

    #[test]
    fn test_command_line() {
        let cmd = command("1_2");
        assert_eq!(cmd.program, PathBuf::from("/opt/modelers/ModelA/ModelA.exe"));
        assert_eq!(cmd.args(), vec!["/buf/proc/job", "50001", "8"]);
    }

    #[test]
    fn test_executable_without_extension() {
        let mut s = settings();
        s.executable_extension.clear();
        assert_eq!(executable_path(&s, "M"), PathBuf::from("/opt/modelers/M/M"));
    }

    #[test]
    fn test_launch_registers_worker() {
        let (sup, _) = supervisor(false);
        let info = sup.launch(&command("1_2")).unwrap();
        assert_eq!(info.pid, Some(42));
        assert_eq!(info.port, 50_001);
        assert_eq!(sup.len(), 1);
        assert_eq!(sup.info("1_2").map(|i| i.modeler), Some("ModelA".to_string()));
    }

    #[test]
    fn test_duplicate_launch_rejected() {
        let (sup, _) = supervisor(false);
        sup.launch(&command("1_2")).unwrap();
        assert!(matches!(
            sup.launch(&command("1_2")),
            Err(SupervisorError::AlreadyRunning(_))
        ));
    }

    #[test]
    fn test_kill_removes_and_terminates() {
        let (sup, killed) = supervisor(false);
        sup.launch(&command("1_2")).unwrap();
        assert!(sup.kill("1_2"));
        assert!(killed.load(Ordering::SeqCst));
        assert!(sup.is_empty());
        assert!(!sup.kill("1_2"));
    }

    #[test]
    fn test_kill_all_clears_registry() {
        let (sup, killed) = supervisor(false);
        sup.launch(&command("a_1")).unwrap();
        sup.launch(&command("b_1")).unwrap();
        assert_eq!(sup.kill_all(), 2);
        assert!(killed.load(Ordering::SeqCst));
        assert!(sup.is_empty());
    }

    #[test]
    fn test_reap_exited_worker_does_not_kill() {
        let (sup, killed) = supervisor(true);
        sup.launch(&command("1_2")).unwrap();
        assert_eq!(sup.reap("1_2"), Some(false));
        assert!(!killed.load(Ordering::SeqCst));
        assert_eq!(sup.reap("1_2"), None);
    }

    #[test]
    fn test_reap_running_worker_kills() {
        let (sup, killed) = supervisor(false);
        sup.launch(&command("1_2")).unwrap();
        assert_eq!(sup.reap("1_2"), Some(true));
        assert!(killed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_system_launcher_missing_executable() {
        let result = SystemLauncher.launch(&command("1_2"));
        assert!(matches!(result, Err(SupervisorError::ExecutableNotFound(_))));
    }
}
