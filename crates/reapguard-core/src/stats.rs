//! Teardown statistics and the human-readable report.

use crate::error::TeardownError;
use crate::process::ActiveProcess;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::Arc;
use tracing::warn;

/// Snapshot of everything recorded since creation or the last reset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub processes_tracked: u64,
    pub processes_killed: u64,
    pub timers_cleared: u64,
    pub temp_dirs_removed: u64,
    pub custom_cleanups: u64,
    pub errors: Vec<String>,
}

/// Shared, append-only accumulator behind `Stats`.
///
/// Cloning shares the same counters; `snapshot` hands out an independent copy.
#[derive(Debug, Clone, Default)]
pub struct StatsRecorder {
    inner: Arc<Mutex<Stats>>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Stats {
        self.inner.lock().clone()
    }

    pub fn reset(&self) {
        *self.inner.lock() = Stats::default();
    }

    pub fn record_process_tracked(&self) {
        self.inner.lock().processes_tracked += 1;
    }

    pub fn record_process_killed(&self) {
        self.inner.lock().processes_killed += 1;
    }

    pub fn record_timer_cleared(&self) {
        self.inner.lock().timers_cleared += 1;
    }

    pub fn record_temp_dir_removed(&self) {
        self.inner.lock().temp_dirs_removed += 1;
    }

    pub fn record_custom_cleanup(&self) {
        self.inner.lock().custom_cleanups += 1;
    }

    /// Log the failure and append its message to `Stats::errors`
    pub fn record_error(&self, error: TeardownError) {
        warn!("{error}");
        self.inner.lock().errors.push(error.to_string());
    }
}

/// Render the report for `stats` and the processes still active.
///
/// Output is deterministic: active processes are listed by ascending pid.
pub fn render_report(stats: &Stats, active: &[ActiveProcess]) -> String {
    let mut active = active.to_vec();
    active.sort_by_key(|process| process.id);

    let mut report = String::new();
    let _ = writeln!(report, "=== Resource Cleanup Report ===");
    let _ = writeln!(report, "Processes tracked: {}", stats.processes_tracked);
    let _ = writeln!(report, "Processes killed: {}", stats.processes_killed);
    let _ = writeln!(report, "Timers cleared: {}", stats.timers_cleared);
    let _ = writeln!(report, "Temp directories removed: {}", stats.temp_dirs_removed);
    let _ = writeln!(report, "Custom cleanups run: {}", stats.custom_cleanups);

    if stats.errors.is_empty() {
        let _ = writeln!(report, "Errors: none");
    } else {
        let _ = writeln!(report, "Errors ({}):", stats.errors.len());
        for error in &stats.errors {
            let _ = writeln!(report, "  - {error}");
        }
    }

    if active.is_empty() {
        let _ = writeln!(report, "Active processes: none");
    } else {
        let _ = writeln!(report, "Active processes ({}):", active.len());
        for process in &active {
            let _ = writeln!(report, "  - PID {}: {}", process.id, process.command);
        }
    }

    report
}
