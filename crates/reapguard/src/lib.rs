//! Reapguard - deterministic teardown of everything a unit of work leaves behind
//!
//! A [`CleanupCoordinator`] collects custom cleanup callbacks, spawned
//! processes, timers, temporary directories and file handles, then releases
//! them in a fixed order on `cleanup()`. Processes are owned by a
//! [`ProcessSupervisor`], which escalates from a graceful signal to a forced
//! kill. The `exec` helpers run commands with timeouts and register what
//! they spawn with a supervisor.

mod coordinator;
#[cfg(unix)]
mod exec;
mod factory;
mod supervisor;

pub use coordinator::{CleanupCoordinator, CleanupOutcome};
#[cfg(unix)]
pub use exec::{
    ExecOutput, SpawnedProcess, exec_sync_safe, exec_with_retry, exec_with_timeout,
    is_command_available, spawn_safe,
};
pub use factory::PlatformTerminationFactory;
pub use supervisor::ProcessSupervisor;

#[cfg(unix)]
pub use reapguard_unix::UnixProcessHandle;

// Re-export core functionality
pub use reapguard_core::*;
