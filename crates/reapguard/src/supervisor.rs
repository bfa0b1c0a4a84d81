//! Tracking and escalating termination of spawned processes.
//!
//! Every tracked process gets an exit observer task that owns its handle and
//! reports the terminal status exactly once, plus an optional deadline task
//! that force kills it if it is still tracked when the deadline fires.

use futures::future::join_all;
use parking_lot::Mutex;
use reapguard_core::{
    ActiveProcess, ExitWatch, GuardError, KillState, ProcessHandle, ProcessId, ProcessStatus,
    ProcessTermination, StatsRecorder, SupervisorConfig, TeardownError, TerminationResult,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

struct TrackedProcess {
    command: String,
    deadline: Option<AbortHandle>,
    exit: ExitWatch,
    /// Set while one caller is escalating; other callers back off
    killing: bool,
}

struct SupervisorInner {
    terminator: Arc<dyn ProcessTermination>,
    config: SupervisorConfig,
    active: Mutex<HashMap<ProcessId, TrackedProcess>>,
    stats: StatsRecorder,
}

/// Tracks spawned processes and owns their escalating termination.
///
/// Cloning is cheap and shares the active set and statistics.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

#[cfg(unix)]
impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    /// Supervisor using the platform signal implementation and default config
    #[cfg(unix)]
    pub fn new() -> Self {
        Self::with_config(SupervisorConfig::default())
    }

    /// Like [`ProcessSupervisor::with_config`], rejecting an invalid config
    #[cfg(unix)]
    pub fn try_with_config(config: SupervisorConfig) -> Result<Self, GuardError> {
        config.validate()?;
        Ok(Self::with_config(config))
    }

    #[cfg(unix)]
    pub fn with_config(config: SupervisorConfig) -> Self {
        Self::from_parts(
            crate::factory::PlatformTerminationFactory::create(),
            config,
            StatsRecorder::new(),
        )
    }

    /// Assemble a supervisor from an explicit signal implementation and stats sink
    pub fn from_parts(
        terminator: Arc<dyn ProcessTermination>,
        config: SupervisorConfig,
        stats: StatsRecorder,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                terminator,
                config,
                active: Mutex::new(HashMap::new()),
                stats,
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &StatsRecorder {
        &self.inner.stats
    }

    /// Start supervising `handle`.
    ///
    /// A process without a pid is rejected with a warning. A zero `timeout`
    /// disables the deadline. Must be called from within a Tokio runtime.
    /// The returned watch resolves when the process terminates.
    pub fn track_process<H>(
        &self,
        handle: H,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Option<ExitWatch>
    where
        H: ProcessHandle + 'static,
    {
        let command = command.into();
        let Some(pid) = handle.get_pid() else {
            warn!("{}", GuardError::MissingProcessId { command });
            return None;
        };

        let (tx, exit) = ExitWatch::channel(pid);
        {
            let mut active = self.inner.active.lock();
            if let Some(existing) = active.get(&pid) {
                warn!(pid, command = %command, "Process is already tracked");
                return Some(existing.exit.clone());
            }

            let deadline = (!timeout.is_zero()).then(|| self.spawn_deadline(pid, timeout));
            active.insert(
                pid,
                TrackedProcess {
                    command: command.clone(),
                    deadline,
                    exit: exit.clone(),
                    killing: false,
                },
            );
        }
        self.inner.stats.record_process_tracked();
        debug!(pid, command = %command, ?timeout, "Tracking process");

        let supervisor = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut handle = handle;
            let status = match handle.wait().await {
                Ok(status) => status,
                Err(e) => {
                    warn!(pid, "Waiting on process failed: {e:#}");
                    ProcessStatus::Failed(format!("{e:#}"))
                }
            };
            debug!(pid, ?status, "Process terminated");

            if let Some(inner) = supervisor.upgrade() {
                ProcessSupervisor { inner }.untrack(pid);
            }
            tx.send_replace(Some(status));
        });

        Some(exit)
    }

    /// Track a tokio child with the configured default deadline
    #[cfg(unix)]
    pub fn track_child(
        &self,
        child: tokio::process::Child,
        command: impl Into<String>,
    ) -> Option<ExitWatch> {
        let command = command.into();
        let timeout = self.inner.config.default_timeout();
        self.track_process(
            reapguard_unix::UnixProcessHandle::new(child, command.clone()),
            command,
            timeout,
        )
    }

    fn spawn_deadline(&self, pid: ProcessId, timeout: Duration) -> AbortHandle {
        let supervisor: Weak<SupervisorInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let Some(inner) = supervisor.upgrade() else {
                return;
            };
            let supervisor = ProcessSupervisor { inner };
            // Release our own deadline slot first so the kill does not abort this task
            if supervisor.claim_deadline(pid) {
                warn!(pid, ?timeout, "Process exceeded its deadline, force killing");
                supervisor.kill_process(pid, true).await;
            }
        })
        .abort_handle()
    }

    fn claim_deadline(&self, pid: ProcessId) -> bool {
        match self.inner.active.lock().get_mut(&pid) {
            Some(tracked) => {
                tracked.deadline = None;
                true
            }
            None => false,
        }
    }

    fn untrack(&self, pid: ProcessId) {
        if let Some(tracked) = self.inner.active.lock().remove(&pid) {
            if let Some(deadline) = tracked.deadline {
                deadline.abort();
            }
        }
    }

    pub fn is_tracked(&self, pid: ProcessId) -> bool {
        self.inner.active.lock().contains_key(&pid)
    }

    /// Processes not yet terminated, ordered by pid
    pub fn active_processes(&self) -> Vec<ActiveProcess> {
        let mut processes: Vec<ActiveProcess> = self
            .inner
            .active
            .lock()
            .iter()
            .map(|(pid, tracked)| ActiveProcess {
                id: *pid,
                command: tracked.command.clone(),
            })
            .collect();
        processes.sort_by_key(|process| process.id);
        processes
    }

    /// Terminate one tracked process.
    ///
    /// Non-forced kills send a graceful signal and force kill after the grace
    /// period; forced kills signal immediately. Only a forced kill counts
    /// towards `processes_killed`. Failures are recorded in the stats and the
    /// entry is removed regardless. Returns `None` when `pid` is not tracked
    /// or another caller is already terminating it.
    pub async fn kill_process(&self, pid: ProcessId, force: bool) -> Option<KillState> {
        let (command, exit) = {
            let mut active = self.inner.active.lock();
            let tracked = active.get_mut(&pid)?;
            if tracked.killing {
                debug!(pid, "Termination already in progress");
                return None;
            }
            tracked.killing = true;
            (tracked.command.clone(), tracked.exit.clone())
        };

        let state = match self.escalate(pid, force, exit).await {
            Ok(state) => {
                if state == KillState::ForceKilled {
                    self.inner.stats.record_process_killed();
                }
                info!(pid, command = %command, ?state, "Process terminated by supervisor");
                state
            }
            Err(reason) => {
                self.inner.stats.record_error(TeardownError::ProcessKill {
                    pid,
                    command,
                    reason,
                });
                KillState::Running
            }
        };

        self.untrack(pid);
        Some(state)
    }

    /// Terminate every tracked process concurrently, each independent of the others
    pub async fn kill_all(&self, force: bool) {
        let pids: Vec<ProcessId> = self.inner.active.lock().keys().copied().collect();
        if pids.is_empty() {
            return;
        }

        info!("Terminating {} tracked processes", pids.len());
        join_all(pids.into_iter().map(|pid| self.kill_process(pid, force))).await;
    }

    /// Drive the escalation state machine to `Exited` or `ForceKilled`
    async fn escalate(
        &self,
        pid: ProcessId,
        force: bool,
        mut exit: ExitWatch,
    ) -> Result<KillState, String> {
        if exit.has_exited() {
            return Ok(KillState::Exited);
        }

        let terminator = &self.inner.terminator;
        let include_tree = self.inner.config.kill_process_tree;
        let mut state = KillState::Running;

        loop {
            state = match state {
                KillState::Running if force => {
                    match terminator.force_kill(pid, include_tree).await {
                        TerminationResult::Success => KillState::ForceKilled,
                        TerminationResult::ProcessNotFound => KillState::Exited,
                        other => return Err(describe(other)),
                    }
                }
                KillState::Running => match terminator.terminate_gracefully(pid).await {
                    TerminationResult::Success => KillState::TermRequested,
                    TerminationResult::ProcessNotFound => KillState::Exited,
                    other => return Err(describe(other)),
                },
                KillState::TermRequested => {
                    let grace = self.inner.config.grace_period();
                    let exited = tokio::time::timeout(grace, exit.wait()).await.is_ok();
                    if exited || !terminator.is_alive(pid) {
                        KillState::Exited
                    } else {
                        warn!(pid, ?grace, "Process ignored graceful termination, force killing");
                        match terminator.force_kill(pid, include_tree).await {
                            TerminationResult::Success => KillState::ForceKilled,
                            TerminationResult::ProcessNotFound => KillState::Exited,
                            other => return Err(describe(other)),
                        }
                    }
                }
                KillState::Exited | KillState::ForceKilled => return Ok(state),
            };
        }
    }
}

fn describe(result: TerminationResult) -> String {
    match result {
        TerminationResult::AccessDenied => "permission denied".to_string(),
        TerminationResult::Failed(reason) => reason,
        other => format!("{other:?}"),
    }
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        let active = std::mem::take(self.active.get_mut());
        if active.is_empty() {
            return;
        }

        warn!(
            "Emergency cleanup: terminating {} processes during drop",
            active.len()
        );
        for (pid, tracked) in active {
            if let Some(deadline) = tracked.deadline {
                deadline.abort();
            }
            self.terminator.terminate_now(pid);
        }
    }
}
