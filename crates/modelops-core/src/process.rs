//! # Process Manager
//!
//! Stage-bound serving processes, one per stage, each on a fixed port.
//!
//! ## Contract
//!
//! - `ensure_running(stage, port, command)` leaves exactly one process on
//!   `port` for `stage`. Any handle for the same stage or occupying the same
//!   port is terminated first: graceful signal, bounded wait. If the wait
//!   expires the call fails with `ShutdownTimeout` and nothing new is
//!   started; the caller may `force_stop` and retry.
//! - `stop(stage)` is idempotent.
//! - Start and stop for one port are serialized by the implementation.
//!
//! The OS-backed manager lives in the app crate. [`SimulatedProcessManager`]
//! is an in-memory implementation with configurable slow shutdown.

use crate::primitives::now_millis;
use crate::{DeploymentHandle, ModelName, OpsError, Stage, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

// =============================================================================
// SERVE COMMAND
// =============================================================================

/// Values substituted into a [`ServeCommand`] before launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeContext {
    pub model: ModelName,
    pub stage: Stage,
    pub port: u16,
    pub version: Option<Version>,
}

/// Program + arguments for a serving process.
///
/// Arguments and environment values may contain `{model}`, `{stage}`,
/// `{port}` and `{version}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl ServeCommand {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Split a whitespace-separated command line. `None` when blank.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self {
            program: program.to_string(),
            args: parts.map(str::to_string).collect(),
            env: BTreeMap::new(),
        })
    }

    /// Substitute placeholders.
    #[must_use]
    pub fn render(&self, ctx: &ServeContext) -> Self {
        let version = ctx.version.map(|v| v.to_string()).unwrap_or_default();
        let port = ctx.port.to_string();
        let fill = |s: &str| {
            s.replace("{model}", ctx.model.as_str())
                .replace("{stage}", &ctx.stage.name().to_ascii_lowercase())
                .replace("{port}", &port)
                .replace("{version}", &version)
        };
        Self {
            program: fill(&self.program),
            args: self.args.iter().map(|a| fill(a)).collect(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), fill(v)))
                .collect(),
        }
    }
}

impl std::fmt::Display for ServeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

// =============================================================================
// PROCESS MANAGER TRAIT
// =============================================================================

/// Supervisor of stage-bound serving processes.
pub trait ProcessManager: Send + Sync {
    /// Replace whatever serves `stage` (or holds `port`) with `command`.
    ///
    /// `version` is recorded on the handle.
    fn ensure_running(
        &self,
        stage: Stage,
        port: u16,
        command: &ServeCommand,
        version: Option<Version>,
    ) -> Result<DeploymentHandle, OpsError>;

    /// Graceful stop with bounded wait. No-op when nothing runs for `stage`.
    fn stop(&self, stage: Stage) -> Result<(), OpsError>;

    /// Forced termination; used after `ShutdownTimeout`.
    fn force_stop(&self, stage: Stage) -> Result<(), OpsError>;

    fn handle(&self, stage: Stage) -> Option<DeploymentHandle>;
}

// =============================================================================
// SIMULATED MANAGER
// =============================================================================

/// What happened to a simulated process, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Started {
        stage: Stage,
        port: u16,
        pid: u32,
        version: Option<Version>,
        command: String,
    },
    Stopped {
        stage: Stage,
        port: u16,
        pid: u32,
        forced: bool,
    },
    /// Graceful shutdown did not finish inside the bound.
    TimedOut { stage: Stage, pid: u32 },
}

#[derive(Debug, Default)]
struct SimState {
    next_pid: u32,
    handles: BTreeMap<Stage, DeploymentHandle>,
    /// Live pids bound to each port.
    ports: BTreeMap<u16, Vec<u32>>,
    events: Vec<ProcessEvent>,
    /// Processes that ignore the graceful signal.
    stubborn: bool,
    peak_per_port: usize,
}

impl SimState {
    fn terminate(&mut self, stage: Stage, forced: bool) -> Result<(), OpsError> {
        let Some(handle) = self.handles.get(&stage).cloned() else {
            return Ok(());
        };
        if !forced && self.stubborn {
            self.events.push(ProcessEvent::TimedOut {
                stage,
                pid: handle.pid,
            });
            return Err(OpsError::ShutdownTimeout {
                stage,
                port: handle.port,
                pid: handle.pid,
                waited_ms: 0,
            });
        }
        self.handles.remove(&stage);
        if let Some(pids) = self.ports.get_mut(&handle.port) {
            pids.retain(|p| *p != handle.pid);
        }
        self.events.push(ProcessEvent::Stopped {
            stage,
            port: handle.port,
            pid: handle.pid,
            forced,
        });
        Ok(())
    }
}

/// In-memory process manager.
///
/// Records every start/stop in order and tracks how many processes were ever
/// bound to one port at the same instant.
#[derive(Debug, Default)]
pub struct SimulatedProcessManager {
    state: Mutex<SimState>,
}

impl SimulatedProcessManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// When `true`, graceful stops time out until set back to `false`;
    /// `force_stop` always succeeds.
    pub fn set_slow_shutdown(&self, stubborn: bool) {
        self.lock().stubborn = stubborn;
    }

    #[must_use]
    pub fn events(&self) -> Vec<ProcessEvent> {
        self.lock().events.clone()
    }

    /// Highest number of simultaneously live processes seen on any one port.
    #[must_use]
    pub fn peak_processes_per_port(&self) -> usize {
        self.lock().peak_per_port
    }

    /// Live pids currently bound to `port`.
    #[must_use]
    pub fn live_on_port(&self, port: u16) -> Vec<u32> {
        self.lock().ports.get(&port).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProcessManager for SimulatedProcessManager {
    fn ensure_running(
        &self,
        stage: Stage,
        port: u16,
        command: &ServeCommand,
        version: Option<Version>,
    ) -> Result<DeploymentHandle, OpsError> {
        let mut state = self.lock();

        let occupants: Vec<Stage> = state
            .handles
            .values()
            .filter(|h| h.stage == stage || h.port == port)
            .map(|h| h.stage)
            .collect();
        for occupant in occupants {
            state.terminate(occupant, false)?;
        }

        state.next_pid = state.next_pid.saturating_add(1);
        let pid = 10_000 + state.next_pid;
        let handle = DeploymentHandle {
            stage,
            port,
            pid,
            version,
            started_at_ms: now_millis(),
        };

        let live = state.ports.entry(port).or_default();
        live.push(pid);
        let live_now = live.len();
        state.peak_per_port = state.peak_per_port.max(live_now);
        state.handles.insert(stage, handle.clone());
        state.events.push(ProcessEvent::Started {
            stage,
            port,
            pid,
            version,
            command: command.to_string(),
        });
        Ok(handle)
    }

    fn stop(&self, stage: Stage) -> Result<(), OpsError> {
        self.lock().terminate(stage, false)
    }

    fn force_stop(&self, stage: Stage) -> Result<(), OpsError> {
        self.lock().terminate(stage, true)
    }

    fn handle(&self, stage: Stage) -> Option<DeploymentHandle> {
        self.lock().handles.get(&stage).cloned()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd() -> ServeCommand {
        ServeCommand::new("serve").arg("--port").arg("{port}")
    }

    #[test]
    fn render_fills_placeholders() {
        let command =
            ServeCommand::parse("bin/serve --stage {stage} --port {port} --version {version}")
                .expect("command");
        let ctx = ServeContext {
            model: ModelName::new("claims").expect("name"),
            stage: Stage::Production,
            port: 8000,
            version: Some(Version(4)),
        };
        assert_eq!(
            command.render(&ctx).to_string(),
            "bin/serve --stage production --port 8000 --version 4"
        );
    }

    #[test]
    fn blank_command_line_is_none() {
        assert!(ServeCommand::parse("   ").is_none());
    }

    #[test]
    fn restart_replaces_previous_process_first() {
        let manager = SimulatedProcessManager::new();
        let first = manager
            .ensure_running(Stage::Production, 8000, &cmd(), Some(Version(1)))
            .expect("first");
        let second = manager
            .ensure_running(Stage::Production, 8000, &cmd(), Some(Version(2)))
            .expect("second");

        assert_ne!(first.pid, second.pid);
        assert_eq!(manager.live_on_port(8000), vec![second.pid]);
        assert_eq!(manager.peak_processes_per_port(), 1);

        let events = manager.events();
        assert!(matches!(events[1], ProcessEvent::Stopped { pid, .. } if pid == first.pid));
        assert!(matches!(events[2], ProcessEvent::Started { pid, .. } if pid == second.pid));
    }

    #[test]
    fn port_held_by_other_stage_is_released() {
        let manager = SimulatedProcessManager::new();
        manager
            .ensure_running(Stage::Staging, 9000, &cmd(), None)
            .expect("staging");
        manager
            .ensure_running(Stage::Production, 9000, &cmd(), None)
            .expect("production");

        assert!(manager.handle(Stage::Staging).is_none());
        assert_eq!(manager.live_on_port(9000).len(), 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let manager = SimulatedProcessManager::new();
        manager.stop(Stage::Staging).expect("absent");
        manager
            .ensure_running(Stage::Staging, 8001, &cmd(), None)
            .expect("start");
        manager.stop(Stage::Staging).expect("stop");
        manager.stop(Stage::Staging).expect("stop again");
        assert!(manager.handle(Stage::Staging).is_none());
    }

    #[test]
    fn slow_shutdown_times_out_until_forced() {
        let manager = SimulatedProcessManager::new();
        let handle = manager
            .ensure_running(Stage::Production, 8000, &cmd(), None)
            .expect("start");
        manager.set_slow_shutdown(true);

        let result = manager.ensure_running(Stage::Production, 8000, &cmd(), None);
        assert!(matches!(result, Err(OpsError::ShutdownTimeout { pid, .. }) if pid == handle.pid));
        assert_eq!(manager.handle(Stage::Production), Some(handle));

        manager.force_stop(Stage::Production).expect("force");
        assert!(manager.live_on_port(8000).is_empty());
    }
}
