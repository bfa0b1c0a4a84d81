use crate::supervisor::ProcessSupervisor;
use futures::future::join_all;
use parking_lot::Mutex;
use reapguard_core::{
    ActiveProcess, Cancellable, CleanupEntry, ExitWatch, GuardError, ProcessHandle,
    ResourceRegistry, Stats, StatsRecorder, TeardownError, TimerHandle, TrackedHandle,
    render_report,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::{debug, info, warn};

/// What a call to `cleanup()` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Completed,
    /// Another teardown was running; this call did nothing
    AlreadyInProgress,
}

struct CoordinatorInner {
    is_cleaning_up: AtomicBool,
    registry: Mutex<ResourceRegistry>,
    supervisor: ProcessSupervisor,
    stats: StatsRecorder,
}

/// Tracks everything created during a unit of work and releases it in a
/// fixed order when `cleanup()` is called.
///
/// Teardown phases: custom cleanups (by priority), processes, timers then
/// intervals, temp directories, file handles. A failure in one resource is
/// recorded in the stats and never stops the others.
#[derive(Clone)]
pub struct CleanupCoordinator {
    inner: Arc<CoordinatorInner>,
}

#[cfg(unix)]
impl Default for CleanupCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resets the teardown flag however `cleanup()` exits
struct TeardownFlag<'a>(&'a AtomicBool);

impl Drop for TeardownFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CleanupCoordinator {
    #[cfg(unix)]
    pub fn new() -> Self {
        Self::with_supervisor(ProcessSupervisor::new())
    }

    #[cfg(unix)]
    pub fn with_config(config: reapguard_core::SupervisorConfig) -> Self {
        Self::with_supervisor(ProcessSupervisor::with_config(config))
    }

    /// Build around an existing supervisor; statistics are shared with it
    pub fn with_supervisor(supervisor: ProcessSupervisor) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                is_cleaning_up: AtomicBool::new(false),
                registry: Mutex::new(ResourceRegistry::new()),
                stats: supervisor.stats().clone(),
                supervisor,
            }),
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.inner.supervisor
    }

    pub fn is_cleaning_up(&self) -> bool {
        self.inner.is_cleaning_up.load(Ordering::SeqCst)
    }

    /// Register a teardown callback with priority 0
    pub fn register_cleanup<F, Fut>(&self, name: impl Into<String>, run: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_cleanup_with_priority(name, 0, run);
    }

    /// Register a teardown callback. Higher priorities run first.
    ///
    /// Rejected with a warning while a teardown is in progress: the callback
    /// is neither run nor queued.
    pub fn register_cleanup_with_priority<F, Fut>(
        &self,
        name: impl Into<String>,
        priority: i32,
        run: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self.is_cleaning_up() {
            warn!("{}", GuardError::RegistrationRejected { name });
            return;
        }

        debug!(name = %name, priority, "Registered cleanup");
        self.inner
            .registry
            .lock()
            .add_cleanup(CleanupEntry::new(name, priority, run));
    }

    /// See [`ProcessSupervisor::track_process`]
    pub fn track_process<H>(
        &self,
        handle: H,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Option<ExitWatch>
    where
        H: ProcessHandle + 'static,
    {
        self.inner.supervisor.track_process(handle, command, timeout)
    }

    #[cfg(unix)]
    pub fn track_child(
        &self,
        child: tokio::process::Child,
        command: impl Into<String>,
    ) -> Option<ExitWatch> {
        self.inner.supervisor.track_child(child, command)
    }

    /// Cancel `timer` at teardown. Returns the same handle.
    pub fn track_timer<T: TimerHandle>(&self, timer: T) -> T {
        self.inner.registry.lock().add_timer(timer.canceller());
        timer
    }

    /// Cancel `interval` at teardown. Returns the same handle.
    pub fn track_interval<T: TimerHandle>(&self, interval: T) -> T {
        self.inner.registry.lock().add_interval(interval.canceller());
        interval
    }

    /// Remove `path` recursively at teardown if it still exists
    pub fn track_temp_dir(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.inner.registry.lock().add_temp_dir(path.clone()) {
            debug!(path = %path.display(), "Temp directory already tracked");
        }
    }

    pub fn track_file_handle<H: TrackedHandle + 'static>(&self, handle: H) {
        self.inner.registry.lock().add_file_handle(Box::new(handle));
    }

    /// Release everything tracked so far. Never fails; per-resource failures
    /// land in `get_stats().errors`.
    pub async fn cleanup(&self) -> CleanupOutcome {
        if self.inner.is_cleaning_up.swap(true, Ordering::SeqCst) {
            warn!("Cleanup already in progress, ignoring concurrent request");
            return CleanupOutcome::AlreadyInProgress;
        }
        let _flag = TeardownFlag(&self.inner.is_cleaning_up);

        let started = Instant::now();
        info!("Starting resource cleanup");

        self.run_custom_cleanups().await;
        self.inner.supervisor.kill_all(false).await;
        self.cancel_timers();
        self.remove_temp_dirs().await;
        self.close_file_handles().await;

        info!(elapsed = ?started.elapsed(), "Resource cleanup completed");
        CleanupOutcome::Completed
    }

    /// Full cleanup, then clear the statistics and any custom cleanups
    pub async fn reset(&self) {
        if self.cleanup().await == CleanupOutcome::AlreadyInProgress {
            warn!("Reset skipped: cleanup already in progress");
            return;
        }

        self.inner.stats.reset();
        self.inner.registry.lock().clear_cleanups();
    }

    pub fn get_stats(&self) -> Stats {
        self.inner.stats.snapshot()
    }

    pub fn get_active_processes(&self) -> Vec<ActiveProcess> {
        self.inner.supervisor.active_processes()
    }

    pub fn generate_report(&self) -> String {
        render_report(&self.get_stats(), &self.get_active_processes())
    }

    async fn run_custom_cleanups(&self) {
        let entries = self.inner.registry.lock().take_cleanups_by_priority();

        for entry in entries {
            let (name, run) = entry.into_parts();
            debug!(name = %name, "Running custom cleanup");

            // Own task per callback so a panic is contained
            let reason = match tokio::spawn(run).await {
                Ok(Ok(())) => {
                    self.inner.stats.record_custom_cleanup();
                    continue;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(e) => panic_reason(e),
            };
            self.inner
                .stats
                .record_error(TeardownError::CustomCleanup { name, reason });
        }
    }

    fn cancel_timers(&self) {
        let (timers, intervals) = {
            let mut registry = self.inner.registry.lock();
            (registry.take_timers(), registry.take_intervals())
        };

        for canceller in timers.iter().chain(intervals.iter()) {
            match canceller.cancel() {
                Ok(()) => self.inner.stats.record_timer_cleared(),
                Err(e) => self.inner.stats.record_error(TeardownError::TimerCancel {
                    reason: format!("{e:#}"),
                }),
            }
        }
    }

    async fn remove_temp_dirs(&self) {
        let dirs = self.inner.registry.lock().take_temp_dirs();

        join_all(dirs.into_iter().map(|path| async move {
            match tokio::fs::try_exists(&path).await {
                Ok(false) => {
                    debug!(path = %path.display(), "Temp directory already gone");
                    return;
                }
                Ok(true) => {}
                Err(e) => {
                    self.inner.stats.record_error(TeardownError::TempDir {
                        path,
                        reason: e.to_string(),
                    });
                    return;
                }
            }

            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed temp directory");
                    self.inner.stats.record_temp_dir_removed();
                }
                Err(e) => self.inner.stats.record_error(TeardownError::TempDir {
                    path,
                    reason: e.to_string(),
                }),
            }
        }))
        .await;
    }

    async fn close_file_handles(&self) {
        let mut handles = self.inner.registry.lock().take_file_handles();

        join_all(handles.iter_mut().map(|handle| async move {
            let result = match handle.close().await {
                Some(result) => result,
                None => match handle.destroy() {
                    Some(result) => result,
                    None => return,
                },
            };

            if let Err(e) = result {
                self.inner.stats.record_error(TeardownError::FileHandle {
                    reason: format!("{e:#}"),
                });
            }
        }))
        .await;
    }
}

fn panic_reason(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }

    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
