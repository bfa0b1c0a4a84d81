use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Terminal status reported by a process handle
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStatus {
    /// Process exited on its own (or after a signal) with status information
    Exited(std::process::ExitStatus),
    /// Waiting on the process failed
    Failed(String),
}

impl ProcessStatus {
    pub fn code(&self) -> Option<i32> {
        match self {
            ProcessStatus::Exited(status) => status.code(),
            ProcessStatus::Failed(_) => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ProcessStatus::Exited(status) if status.success())
    }
}

/// Result of sending a termination signal
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal was delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Insufficient privileges to signal the process
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Per-process escalation state.
///
/// `Running -> TermRequested -> {Exited | ForceKilled}`; a forced kill goes
/// straight from `Running` to `ForceKilled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillState {
    Running,
    TermRequested,
    Exited,
    ForceKilled,
}

/// A process currently held in the active set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveProcess {
    pub id: ProcessId,
    pub command: String,
}

/// Trait representing a handle to a running process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if process has exited)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Get the command that started this process
    fn get_command(&self) -> &str;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ProcessStatus>;
}

/// Signal delivery for a single process id
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Ask the process to exit (SIGTERM on Unix)
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult;

    /// Force kill the process (SIGKILL on Unix), optionally with its descendants
    async fn force_kill(&self, pid: ProcessId, include_tree: bool) -> TerminationResult;

    /// Zero-effect existence probe (signal 0 on Unix)
    fn is_alive(&self, pid: ProcessId) -> bool;

    /// Best-effort synchronous termination, used where async is unavailable (Drop)
    fn terminate_now(&self, pid: ProcessId);
}

/// Observer side of a tracked process' exit.
///
/// Resolves at most once with the terminal status. A closed channel (the
/// observer task went away) counts as exited.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    pid: ProcessId,
    rx: watch::Receiver<Option<ProcessStatus>>,
}

impl ExitWatch {
    /// Create a connected sender/watch pair for `pid`
    pub fn channel(pid: ProcessId) -> (watch::Sender<Option<ProcessStatus>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { pid, rx })
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Terminal status if the process already finished
    pub fn status(&self) -> Option<ProcessStatus> {
        self.rx.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.rx.borrow().is_some() || self.rx.has_changed().is_err()
    }

    /// Wait until the process exits. Returns `None` if the observer went away
    /// without reporting.
    pub async fn wait(&mut self) -> Option<ProcessStatus> {
        // A closed sender still leaves the last value readable
        let _ = self.rx.wait_for(|status| status.is_some()).await;
        self.rx.borrow().clone()
    }
}

/// Implementation of ProcessHandle for boxed trait objects
#[async_trait]
impl ProcessHandle for Box<dyn ProcessHandle> {
    fn get_pid(&self) -> Option<ProcessId> {
        (**self).get_pid()
    }

    fn get_command(&self) -> &str {
        (**self).get_command()
    }

    async fn wait(&mut self) -> Result<ProcessStatus> {
        (**self).wait().await
    }
}
