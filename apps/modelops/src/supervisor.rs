//! # OS Process Manager
//!
//! Runs serving processes as real child processes, one per served stage.
//!
//! - Each process is started in its own process group, so signals reach any
//!   helper processes it forks.
//! - Termination sends SIGTERM to the group, polls for exit up to the
//!   configured timeout, and reports `ShutdownTimeout` if the process is
//!   still alive. `force_stop` sends SIGKILL.
//! - A handle is recorded as `<stage>.json` in the run directory, and the
//!   process output goes to `<stage>.log`. The record is the source of truth:
//!   every operation re-reads it first and adopts the process it names, so a
//!   manager stays correct after another process (the monitor daemon or a
//!   CLI verb) replaced or stopped a stage's server. A record is only
//!   removed by the manager that stopped the pid it names.
//! - Before a replacement starts, the manager waits (bounded) until the port
//!   accepts a fresh bind.
//!
//! All operations hold one lock, so start and stop are serialized per port
//! within a process. Across processes the controller's model lock does that.

use modelops_core::primitives::now_millis;
use modelops_core::{DeploymentHandle, OpsError, ProcessManager, ServeCommand, Stage, Version};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Poll period while waiting for exits and port release.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a fresh process must survive to count as started.
const STARTUP_GRACE: Duration = Duration::from_millis(150);

/// Wait after SIGKILL before giving up on the kernel.
const KILL_WAIT: Duration = Duration::from_secs(5);

fn io_err(context: &str, e: std::io::Error) -> OpsError {
    OpsError::IoError(format!("{}: {}", context, e))
}

// =============================================================================
// SUPERVISED PROCESS
// =============================================================================

struct Supervised {
    handle: DeploymentHandle,
    /// `None` for processes adopted from a run-directory record.
    child: Option<Child>,
}

impl Supervised {
    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => signals::pid_alive(self.handle.pid),
        }
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Process manager backed by operating-system processes.
pub struct OsProcessManager {
    run_dir: PathBuf,
    shutdown_timeout: Duration,
    processes: Mutex<BTreeMap<Stage, Supervised>>,
}

impl OsProcessManager {
    /// Create a manager rooted at `run_dir`, adopting live processes recorded
    /// there.
    pub fn new(run_dir: impl AsRef<Path>, shutdown_timeout: Duration) -> Result<Self, OpsError> {
        let run_dir = run_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&run_dir).map_err(|e| io_err("create run directory", e))?;

        let manager = Self {
            run_dir,
            shutdown_timeout,
            processes: Mutex::new(BTreeMap::new()),
        };
        {
            let mut processes = manager.lock();
            for stage in Stage::SERVED {
                manager.refresh(&mut processes, stage);
            }
        }
        Ok(manager)
    }

    /// Path of the log file a stage's process writes to.
    #[must_use]
    pub fn log_path(&self, stage: Stage) -> PathBuf {
        self.run_dir
            .join(format!("{}.log", stage.name().to_ascii_lowercase()))
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Stage, Supervised>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring the entry for `stage` in line with `<stage>.json`.
    fn refresh(&self, processes: &mut BTreeMap<Stage, Supervised>, stage: Stage) {
        let path = record_path(&self.run_dir, stage);
        let known = processes.get(&stage).map(|p| p.handle.pid);

        match read_record(&path) {
            Some(handle) if Some(handle.pid) == known => {}
            Some(handle) => {
                let mut adopted = Supervised {
                    handle,
                    child: None,
                };
                if adopted.is_alive() {
                    tracing::info!(
                        stage = %stage,
                        pid = adopted.handle.pid,
                        port = adopted.handle.port,
                        "adopted running serving process"
                    );
                    if let Some(stale) = processes.insert(stage, adopted) {
                        discard(stage, stale);
                    }
                } else {
                    remove_record(&path, adopted.handle.pid);
                    if let Some(stale) = processes.remove(&stage) {
                        discard(stage, stale);
                    }
                }
            }
            None => {
                let Some(entry) = processes.get_mut(&stage) else {
                    return;
                };
                if entry.is_alive() {
                    // Keep a live process findable by other managers.
                    if let Err(e) = write_record(&path, &entry.handle) {
                        tracing::warn!(stage = %stage, error = %e, "cannot restore process record");
                    }
                } else {
                    processes.remove(&stage);
                }
            }
        }
    }

    fn terminate(
        &self,
        processes: &mut BTreeMap<Stage, Supervised>,
        stage: Stage,
        forced: bool,
    ) -> Result<(), OpsError> {
        let Some(entry) = processes.get_mut(&stage) else {
            return Ok(());
        };

        if entry.is_alive() {
            let pid = entry.handle.pid;
            if forced {
                tracing::warn!(stage = %stage, pid, "sending SIGKILL");
                signals::kill_group(pid, &mut entry.child);
                if !entry.wait_for_exit(KILL_WAIT) {
                    return Err(OpsError::Process(format!(
                        "{} process {} survived SIGKILL",
                        stage, pid
                    )));
                }
            } else {
                tracing::info!(stage = %stage, pid, "sending SIGTERM");
                signals::terminate_group(pid, &mut entry.child);
                if !entry.wait_for_exit(self.shutdown_timeout) {
                    return Err(OpsError::ShutdownTimeout {
                        stage,
                        port: entry.handle.port,
                        pid,
                        waited_ms: self.shutdown_timeout.as_millis() as u64,
                    });
                }
            }
        }

        let pid = entry.handle.pid;
        processes.remove(&stage);
        remove_record(&record_path(&self.run_dir, stage), pid);
        tracing::info!(stage = %stage, pid, "serving process stopped");
        Ok(())
    }

    fn wait_for_port(&self, port: u16) -> Result<(), OpsError> {
        let deadline = Instant::now() + self.shutdown_timeout;
        loop {
            if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(OpsError::Process(format!(
                    "port {} still in use after {} ms",
                    port,
                    self.shutdown_timeout.as_millis()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn spawn(
        &self,
        stage: Stage,
        port: u16,
        command: &ServeCommand,
        version: Option<Version>,
    ) -> Result<Supervised, OpsError> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(stage))
            .map_err(|e| io_err("open process log", e))?;
        let log_err = log.try_clone().map_err(|e| io_err("open process log", e))?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);
        signals::own_process_group(&mut cmd);

        let child = cmd.spawn().map_err(|e| {
            OpsError::Process(format!("failed to start '{}': {}", command, e))
        })?;
        let mut supervised = Supervised {
            handle: DeploymentHandle {
                stage,
                port,
                pid: child.id(),
                version,
                started_at_ms: now_millis(),
            },
            child: Some(child),
        };

        std::thread::sleep(STARTUP_GRACE);
        if let Some(Ok(Some(status))) = supervised.child.as_mut().map(Child::try_wait) {
            return Err(OpsError::Process(format!(
                "'{}' exited during startup ({}); see {}",
                command,
                status,
                self.log_path(stage).display()
            )));
        }
        if !supervised.is_alive() {
            return Err(OpsError::Process(format!("'{}' is not running", command)));
        }
        Ok(supervised)
    }
}

impl ProcessManager for OsProcessManager {
    fn ensure_running(
        &self,
        stage: Stage,
        port: u16,
        command: &ServeCommand,
        version: Option<Version>,
    ) -> Result<DeploymentHandle, OpsError> {
        let mut processes = self.lock();
        for served in Stage::SERVED {
            self.refresh(&mut processes, served);
        }

        let occupants: Vec<Stage> = processes
            .values()
            .filter(|p| p.handle.stage == stage || p.handle.port == port)
            .map(|p| p.handle.stage)
            .collect();
        for occupant in occupants {
            self.terminate(&mut processes, occupant, false)?;
        }
        self.wait_for_port(port)?;

        let supervised = self.spawn(stage, port, command, version)?;
        let handle = supervised.handle.clone();
        write_record(&record_path(&self.run_dir, stage), &handle)?;
        processes.insert(stage, supervised);

        tracing::info!(
            stage = %stage,
            port,
            pid = handle.pid,
            command = %command,
            "serving process started"
        );
        Ok(handle)
    }

    fn stop(&self, stage: Stage) -> Result<(), OpsError> {
        let mut processes = self.lock();
        self.refresh(&mut processes, stage);
        self.terminate(&mut processes, stage, false)
    }

    fn force_stop(&self, stage: Stage) -> Result<(), OpsError> {
        let mut processes = self.lock();
        self.refresh(&mut processes, stage);
        self.terminate(&mut processes, stage, true)
    }

    fn handle(&self, stage: Stage) -> Option<DeploymentHandle> {
        let mut processes = self.lock();
        self.refresh(&mut processes, stage);
        let entry = processes.get_mut(&stage)?;
        if entry.is_alive() {
            Some(entry.handle.clone())
        } else {
            let pid = entry.handle.pid;
            processes.remove(&stage);
            remove_record(&record_path(&self.run_dir, stage), pid);
            None
        }
    }
}

// =============================================================================
// RUN-DIRECTORY RECORDS
// =============================================================================

fn record_path(run_dir: &Path, stage: Stage) -> PathBuf {
    run_dir.join(format!("{}.json", stage.name().to_ascii_lowercase()))
}

fn read_record(path: &Path) -> Option<DeploymentHandle> {
    let file = File::open(path).ok()?;
    match serde_json::from_reader(file) {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "ignoring unreadable process record"
            );
            None
        }
    }
}

/// Remove `path` unless it now names a process other than `pid`.
fn remove_record(path: &Path, pid: u32) {
    match read_record(path) {
        Some(current) if current.pid != pid => {
            tracing::debug!(
                path = %path.display(),
                pid = current.pid,
                "process record belongs to a newer process, keeping it"
            );
        }
        _ => {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Drop an entry superseded by its stage's record, killing the process if
/// it somehow outlived its replacement.
fn discard(stage: Stage, mut stale: Supervised) {
    if stale.is_alive() {
        let pid = stale.handle.pid;
        tracing::warn!(stage = %stage, pid, "stopping unrecorded serving process");
        signals::kill_group(pid, &mut stale.child);
        if !stale.wait_for_exit(KILL_WAIT) {
            tracing::error!(stage = %stage, pid, "unrecorded serving process survived SIGKILL");
        }
    }
}

fn write_record(path: &Path, handle: &DeploymentHandle) -> Result<(), OpsError> {
    let bytes = serde_json::to_vec_pretty(handle)
        .map_err(|e| OpsError::SerializationError(e.to_string()))?;
    std::fs::write(path, bytes).map_err(|e| io_err("write process record", e))
}

// =============================================================================
// SIGNALS
// =============================================================================

#[cfg(unix)]
mod signals {
    use std::os::unix::process::CommandExt;
    use std::process::{Child, Command};

    pub fn own_process_group(cmd: &mut Command) {
        cmd.process_group(0);
    }

    fn to_pid(pid: u32) -> Option<libc::pid_t> {
        libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
    }

    /// Signal the process group led by `pid`, falling back to the process.
    fn signal_group(pid: u32, signal: libc::c_int) {
        let Some(pid) = to_pid(pid) else {
            return;
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        let group = unsafe { libc::kill(-pid, signal) };
        if group != 0 {
            // SAFETY: as above.
            unsafe { libc::kill(pid, signal) };
        }
    }

    pub fn terminate_group(pid: u32, _child: &mut Option<Child>) {
        signal_group(pid, libc::SIGTERM);
    }

    pub fn kill_group(pid: u32, _child: &mut Option<Child>) {
        signal_group(pid, libc::SIGKILL);
    }

    /// Liveness of a process that may or may not be our child.
    pub fn pid_alive(pid: u32) -> bool {
        let Some(pid) = to_pid(pid) else {
            return false;
        };
        let mut status: libc::c_int = 0;
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        let reaped = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if reaped == pid {
            return false;
        }
        if reaped == 0 {
            return true;
        }
        // Not our child: probe with signal 0.
        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(not(unix))]
mod signals {
    use std::process::{Child, Command};

    pub fn own_process_group(_cmd: &mut Command) {}

    pub fn terminate_group(_pid: u32, child: &mut Option<Child>) {
        if let Some(child) = child.as_mut() {
            let _ = child.kill();
        }
    }

    pub fn kill_group(pid: u32, child: &mut Option<Child>) {
        terminate_group(pid, child);
    }

    /// Adopted processes cannot be probed here; treat them as gone.
    pub fn pid_alive(_pid: u32) -> bool {
        false
    }
}
