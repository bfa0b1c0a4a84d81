use anyhow::Result;
use async_trait::async_trait;
use reapguard_core::{KillSignal, ProcessHandle, ProcessId, ProcessStatus, ProcessTermination, TerminationResult};

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use sysinfo::System;
    use tokio::process::Child;
    use tracing::{debug, info, warn};

    /// Unix-specific process handle implementation over a tokio child
    pub struct UnixProcessHandle {
        child: Child,
        pid: Option<ProcessId>,
        command: String,
    }

    impl UnixProcessHandle {
        pub fn new(child: Child, command: impl Into<String>) -> Self {
            Self {
                pid: child.id(),
                child,
                command: command.into(),
            }
        }
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
        fn get_pid(&self) -> Option<ProcessId> {
            self.pid
        }

        fn get_command(&self) -> &str {
            &self.command
        }

        async fn wait(&mut self) -> Result<ProcessStatus> {
            let status = self.child.wait().await?;
            Ok(ProcessStatus::Exited(status))
        }
    }

    pub fn to_signal(signal: KillSignal) -> Signal {
        match signal {
            KillSignal::Term => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
            KillSignal::Int => Signal::SIGINT,
            KillSignal::Hup => Signal::SIGHUP,
        }
    }

    /// Deliver `signal` to a single pid
    pub fn send_signal(pid: ProcessId, signal: KillSignal) -> TerminationResult {
        deliver(pid, to_signal(signal))
    }

    fn deliver(pid: ProcessId, signal: Signal) -> TerminationResult {
        let nix_pid = NixPid::from_raw(pid as i32);

        match signal::kill(nix_pid, signal) {
            Ok(()) => {
                debug!("Sent {} to process {}", signal, pid);
                TerminationResult::Success
            }
            Err(nix::errno::Errno::ESRCH) => {
                debug!("Process {} not found (already terminated)", pid);
                TerminationResult::ProcessNotFound
            }
            Err(nix::errno::Errno::EPERM) => {
                warn!("Permission denied sending {} to process {}", signal, pid);
                TerminationResult::AccessDenied
            }
            Err(e) => {
                warn!("Failed to send {} to process {}: {}", signal, pid, e);
                TerminationResult::Failed(format!("{signal} failed: {e}"))
            }
        }
    }

    /// Unix signal delivery with process tree discovery
    pub struct UnixProcessManager {
        system: std::sync::Mutex<System>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    impl UnixProcessManager {
        pub fn new() -> Self {
            debug!("Initializing Unix process manager");
            Self {
                system: std::sync::Mutex::new(System::new()),
            }
        }

        /// All descendants of `parent_pid`, deepest first
        pub fn find_descendants(&self, parent_pid: ProcessId) -> Vec<ProcessId> {
            let mut system = match self.system.lock() {
                Ok(system) => system,
                Err(poisoned) => poisoned.into_inner(),
            };
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::default(),
            );

            let mut descendants = Vec::new();
            Self::find_children_recursive(&system, parent_pid, &mut descendants);
            descendants
        }

        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().map(|ppid| ppid.as_u32()) == Some(parent_pid) {
                    let child_pid = pid.as_u32();
                    // Grandchildren first so the tree is torn down bottom-up
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
            deliver(pid, Signal::SIGTERM)
        }

        async fn force_kill(&self, pid: ProcessId, include_tree: bool) -> TerminationResult {
            if include_tree {
                let descendants = self.find_descendants(pid);
                if !descendants.is_empty() {
                    info!(
                        "Force killing {} descendants of process {}",
                        descendants.len(),
                        pid
                    );
                }
                for child_pid in descendants {
                    match deliver(child_pid, Signal::SIGKILL) {
                        TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                        result => {
                            warn!("Failed to kill descendant {}: {:?}", child_pid, result);
                        }
                    }
                }
            }

            deliver(pid, Signal::SIGKILL)
        }

        fn is_alive(&self, pid: ProcessId) -> bool {
            // Signal 0 performs the permission/existence check only
            signal::kill(NixPid::from_raw(pid as i32), None).is_ok()
        }

        fn terminate_now(&self, pid: ProcessId) {
            let nix_pid = NixPid::from_raw(pid as i32);

            if let Err(e) = signal::kill(nix_pid, Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to process {} during drop: {}", pid, e);

                if let Err(e) = signal::kill(nix_pid, Signal::SIGKILL) {
                    tracing::error!("Failed to send SIGKILL to process {} during drop: {}", pid, e);
                }
            }
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager, send_signal, to_signal};
