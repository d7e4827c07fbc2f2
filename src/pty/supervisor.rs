//! Child process supervision.
//!
//! Spawns children on the slave side of a fresh PTY, tracks every live child
//! process-wide, and runs the TERM-then-KILL termination protocol against
//! each child's process group.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::control::WindowSize;
use crate::errors::SpawnError;

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(25);
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// What to run inside a session's PTY.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl SpawnSpec {
    pub fn new(argv: Vec<String>, env: BTreeMap<String, String>) -> Self {
        Self { argv, env }
    }
}

/// A child process owned by one session and listed in the registry.
pub struct SupervisedChild {
    pid: u32,
    pgid: i32,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    exit: Mutex<Option<ExitStatus>>,
}

impl SupervisedChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Non-blocking reap. Returns the exit status once the child is gone.
    pub fn try_reap(&self) -> Option<ExitStatus> {
        let mut exit = self.exit.lock();
        if exit.is_none() {
            match self.child.lock().try_wait() {
                Ok(Some(status)) => *exit = Some(status),
                Ok(None) => {}
                Err(e) => {
                    debug!(pid = self.pid, error = %e, "try_wait failed");
                }
            }
        }
        exit.clone()
    }

    pub fn is_running(&self) -> bool {
        self.try_reap().is_none()
    }

    /// Deliver `signal` to the child's whole process group.
    pub fn signal_group(&self, signal: Signal) -> nix::Result<()> {
        killpg(Pid::from_raw(self.pgid), signal)
    }

    async fn wait_for_exit(&self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_reap() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(REAP_POLL_INTERVAL).await;
        }
    }
}

/// Process-wide set of live children, consulted by the shutdown sweep.
#[derive(Default)]
pub struct ChildRegistry {
    children: Mutex<HashMap<u32, Arc<SupervisedChild>>>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, child: Arc<SupervisedChild>) {
        self.children.lock().insert(child.pid, child);
    }

    fn deregister(&self, pid: u32) {
        self.children.lock().remove(&pid);
    }

    pub fn snapshot(&self) -> Vec<Arc<SupervisedChild>> {
        self.children.lock().values().cloned().collect()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.children.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.children.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.lock().is_empty()
    }
}

/// Result of the PTY allocation + spawn step.
pub struct SpawnedPty {
    pub child: Arc<SupervisedChild>,
    pub master: Box<dyn MasterPty + Send>,
}

/// How a child left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Exited (on its own or after SIGTERM) and was reaped.
    Exited(u32),
    /// Needed SIGKILL.
    Killed,
    /// Still not reaped after SIGKILL; deregistered anyway.
    Unreaped,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    registry: Arc<ChildRegistry>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(ChildRegistry::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ChildRegistry> {
        &self.registry
    }

    /// Open a PTY of `size` and spawn `spec` attached to its slave side.
    ///
    /// The child becomes leader of its own session and process group. The
    /// slave handle is dropped before returning so the parent holds only
    /// the master.
    pub fn spawn(&self, spec: &SpawnSpec, size: WindowSize) -> Result<SpawnedPty, SpawnError> {
        let (program, args) = spec.argv.split_first().ok_or(SpawnError::EmptyCommand)?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(SpawnError::OpenPty)?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.env_clear();
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|source| SpawnError::Spawn {
                program: program.clone(),
                source,
            })?;
        drop(pair.slave);

        let pid = match child.process_id() {
            Some(pid) => pid,
            None => {
                let mut child = child;
                let _ = child.kill();
                return Err(SpawnError::MissingPid);
            }
        };
        let pgid = nix::unistd::getpgid(Some(Pid::from_raw(pid as i32)))
            .map(Pid::as_raw)
            .unwrap_or(pid as i32);

        let supervised = Arc::new(SupervisedChild {
            pid,
            pgid,
            child: Mutex::new(child),
            exit: Mutex::new(None),
        });
        self.registry.register(Arc::clone(&supervised));
        info!(pid, pgid, program = %program, "Spawned child");

        Ok(SpawnedPty {
            child: supervised,
            master: pair.master,
        })
    }

    /// TERM the process group, wait up to `grace`, KILL survivors, and
    /// deregister the child whatever happened. Never fails.
    pub async fn terminate(&self, child: &SupervisedChild, grace: Duration) -> Termination {
        if let Err(e) = child.signal_group(Signal::SIGTERM) {
            debug!(pid = child.pid, error = %e, "SIGTERM to process group failed");
        }

        let outcome = match child.wait_for_exit(grace).await {
            Some(status) => Termination::Exited(status.exit_code()),
            None => {
                if let Err(e) = child.signal_group(Signal::SIGKILL) {
                    warn!(pid = child.pid, error = %e, "SIGKILL to process group failed");
                }
                match child.wait_for_exit(KILL_REAP_TIMEOUT).await {
                    Some(_) => Termination::Killed,
                    None => Termination::Unreaped,
                }
            }
        };

        self.registry.deregister(child.pid);
        match &outcome {
            Termination::Exited(code) => info!(pid = child.pid, code, "Child exited"),
            Termination::Killed => info!(pid = child.pid, "Child killed"),
            Termination::Unreaped => {
                warn!(pid = child.pid, "Child did not exit after SIGKILL")
            }
        }
        outcome
    }

    /// Server-wide sweep: TERM every registered group, wait `grace` once for
    /// all of them, then KILL whatever is left.
    pub async fn shutdown_sweep(&self, grace: Duration) {
        let children = self.registry.snapshot();
        if children.is_empty() {
            return;
        }
        info!(count = children.len(), "Terminating remaining children");

        for child in &children {
            if let Err(e) = child.signal_group(Signal::SIGTERM) {
                debug!(pid = child.pid, error = %e, "SIGTERM during sweep failed");
            }
        }
        sleep(grace).await;

        for child in &children {
            if child.is_running() {
                if let Err(e) = child.signal_group(Signal::SIGKILL) {
                    debug!(pid = child.pid, error = %e, "SIGKILL during sweep failed");
                }
            }
        }
        for child in &children {
            if child.wait_for_exit(KILL_REAP_TIMEOUT).await.is_none() {
                warn!(pid = child.pid, "Child still running after sweep");
            }
            self.registry.deregister(child.pid);
        }
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// The user's shell, falling back through common locations.
pub fn resolve_default_shell() -> String {
    if let Ok(shell_env) = std::env::var("SHELL") {
        if !shell_env.is_empty() && Path::new(&shell_env).exists() {
            return shell_env;
        }
    }

    for candidate in ["/bin/bash", "/usr/bin/bash", "/bin/zsh", "/usr/bin/zsh", "/bin/sh"] {
        if Path::new(candidate).exists() {
            return candidate.to_string();
        }
    }

    "/bin/sh".to_string()
}

/// Whether `pid` still exists as a process (zombies included).
pub fn process_exists(pid: u32) -> bool {
    nix::sys::signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}
