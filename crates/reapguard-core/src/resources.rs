//! Non-process resources held until teardown: named cleanup callbacks,
//! timers/intervals, temporary directories and file handles.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

pub type CleanupFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// A named teardown callback. Consumed exactly once.
pub struct CleanupEntry {
    name: String,
    priority: i32,
    run: CleanupFn,
}

impl CleanupEntry {
    pub fn new<F, Fut>(name: impl Into<String>, priority: i32, run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            priority,
            run: Box::new(move || Box::pin(run())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Split into the name and a future that invokes the callback when first polled
    pub fn into_parts(self) -> (String, CleanupFuture) {
        let run = self.run;
        (self.name, Box::pin(async move { run().await }))
    }
}

impl fmt::Debug for CleanupEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupEntry")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Something that stops a pending timer or interval
pub trait Cancellable: Send + Sync {
    fn cancel(&self) -> Result<()>;
}

impl Cancellable for AbortHandle {
    fn cancel(&self) -> Result<()> {
        self.abort();
        Ok(())
    }
}

impl Cancellable for CancellationToken {
    fn cancel(&self) -> Result<()> {
        CancellationToken::cancel(self);
        Ok(())
    }
}

/// A timer handle the guard can keep a canceller for while the caller keeps
/// the handle itself
pub trait TimerHandle {
    fn canceller(&self) -> Box<dyn Cancellable>;
}

impl<T> TimerHandle for JoinHandle<T> {
    fn canceller(&self) -> Box<dyn Cancellable> {
        Box::new(self.abort_handle())
    }
}

impl TimerHandle for AbortHandle {
    fn canceller(&self) -> Box<dyn Cancellable> {
        Box::new(self.clone())
    }
}

impl TimerHandle for CancellationToken {
    fn canceller(&self) -> Box<dyn Cancellable> {
        Box::new(self.clone())
    }
}

/// Capability-typed file handle.
///
/// Each method returns `None` when the capability is absent. Teardown calls
/// `close` if present, otherwise `destroy`, never both.
#[async_trait]
pub trait TrackedHandle: Send {
    async fn close(&mut self) -> Option<Result<()>> {
        None
    }

    fn destroy(&mut self) -> Option<Result<()>> {
        None
    }
}

#[async_trait]
impl TrackedHandle for tokio::fs::File {
    async fn close(&mut self) -> Option<Result<()>> {
        use tokio::io::AsyncWriteExt;
        Some(self.flush().await.map_err(Into::into))
    }
}

#[async_trait]
impl TrackedHandle for std::fs::File {
    async fn close(&mut self) -> Option<Result<()>> {
        use std::io::Write;
        Some(self.flush().map_err(Into::into))
    }
}

type CloseFn = Box<dyn FnOnce() -> CleanupFuture + Send>;
type DestroyFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Closure-backed handle for resources that are not files in the std/tokio sense
#[derive(Default)]
pub struct FileHandle {
    close: Option<CloseFn>,
    destroy: Option<DestroyFn>,
}

impl FileHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_close<F, Fut>(mut self, close: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.close = Some(Box::new(move || Box::pin(close())));
        self
    }

    pub fn on_destroy<F>(mut self, destroy: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.destroy = Some(Box::new(destroy));
        self
    }
}

#[async_trait]
impl TrackedHandle for FileHandle {
    async fn close(&mut self) -> Option<Result<()>> {
        let close = self.close.take()?;
        Some(close().await)
    }

    fn destroy(&mut self) -> Option<Result<()>> {
        let destroy = self.destroy.take()?;
        Some(destroy())
    }
}

/// Plain collections behind the coordinator. Not synchronised on its own.
#[derive(Default)]
pub struct ResourceRegistry {
    cleanups: Vec<CleanupEntry>,
    timers: Vec<Box<dyn Cancellable>>,
    intervals: Vec<Box<dyn Cancellable>>,
    temp_dirs: Vec<PathBuf>,
    file_handles: Vec<Box<dyn TrackedHandle>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cleanup(&mut self, entry: CleanupEntry) {
        self.cleanups.push(entry);
    }

    /// Drain custom cleanups, highest priority first. Equal priorities keep
    /// registration order.
    pub fn take_cleanups_by_priority(&mut self) -> Vec<CleanupEntry> {
        let mut entries = std::mem::take(&mut self.cleanups);
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        entries
    }

    pub fn clear_cleanups(&mut self) {
        self.cleanups.clear();
    }

    pub fn add_timer(&mut self, canceller: Box<dyn Cancellable>) {
        self.timers.push(canceller);
    }

    pub fn take_timers(&mut self) -> Vec<Box<dyn Cancellable>> {
        std::mem::take(&mut self.timers)
    }

    pub fn add_interval(&mut self, canceller: Box<dyn Cancellable>) {
        self.intervals.push(canceller);
    }

    pub fn take_intervals(&mut self) -> Vec<Box<dyn Cancellable>> {
        std::mem::take(&mut self.intervals)
    }

    /// Returns false when the path was already tracked
    pub fn add_temp_dir(&mut self, path: PathBuf) -> bool {
        if self.temp_dirs.iter().any(|tracked| tracked == &path) {
            return false;
        }
        self.temp_dirs.push(path);
        true
    }

    pub fn take_temp_dirs(&mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.temp_dirs)
    }

    pub fn temp_dirs(&self) -> impl Iterator<Item = &Path> {
        self.temp_dirs.iter().map(PathBuf::as_path)
    }

    pub fn add_file_handle(&mut self, handle: Box<dyn TrackedHandle>) {
        self.file_handles.push(handle);
    }

    pub fn take_file_handles(&mut self) -> Vec<Box<dyn TrackedHandle>> {
        std::mem::take(&mut self.file_handles)
    }

    pub fn pending_cleanups(&self) -> usize {
        self.cleanups.len()
    }
}
