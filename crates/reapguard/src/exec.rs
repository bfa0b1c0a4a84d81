//! Command execution helpers that register what they spawn with a
//! [`ProcessSupervisor`], so a later teardown can stop anything left running.

use crate::supervisor::ProcessSupervisor;
use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use reapguard_core::{
    ExecError, ExecOptions, ExitWatch, GuardError, KillSignal, OutputBuffer, ProcessHandle,
    ProcessId, ProcessStatus, RetryConfig, stream,
};
use reapguard_unix::{UnixProcessHandle, send_signal};
use std::io::Read;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` for the empty result returned when `throw_on_error` is off
    pub exit_code: Option<i32>,
}

/// A spawned, supervised process whose stdio is left to the caller
pub struct SpawnedProcess {
    pub pid: ProcessId,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    pub exit: ExitWatch,
}

/// Check whether `command` resolves to an executable on `PATH`
pub fn is_command_available(command: &str) -> bool {
    which::which(command).is_ok()
}

/// Run `command` to completion, blocking the current thread.
///
/// While it runs, the process is tracked by `supervisor` if one is given and
/// a Tokio runtime is available. On timeout the configured kill signal is
/// sent, followed by SIGKILL if the process survives the supervisor's grace
/// period.
pub fn exec_sync_safe(
    command: &str,
    options: &ExecOptions,
    supervisor: Option<&ProcessSupervisor>,
) -> Result<ExecOutput, ExecError> {
    settle(command, options, run_blocking(command, options, supervisor))
}

/// Run `command` asynchronously, streaming its output.
///
/// On timeout the process is terminated gracefully, then forcibly after the
/// grace period, and a [`ExecError::Timeout`] is returned.
pub async fn exec_with_timeout(
    command: &str,
    options: &ExecOptions,
    supervisor: Option<&ProcessSupervisor>,
) -> Result<ExecOutput, ExecError> {
    settle(command, options, run_async(command, options, supervisor).await)
}

/// [`exec_with_timeout`] repeated up to `retry.max_attempts` times with a
/// fixed delay. Every execution failure is retried and the last error is
/// returned once attempts run out. An invalid `retry` is rejected before
/// anything is spawned, regardless of `throw_on_error`.
pub async fn exec_with_retry(
    command: &str,
    options: &ExecOptions,
    retry: &RetryConfig,
    supervisor: Option<&ProcessSupervisor>,
) -> Result<ExecOutput, ExecError> {
    retry.validate()?;
    let backoff = ConstantBuilder::default()
        .with_delay(retry.delay())
        .with_max_times(retry.max_attempts.saturating_sub(1) as usize);

    let result = (|| run_async(command, options, supervisor))
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .when(ExecError::is_retryable)
        .notify(|e: &ExecError, delay: Duration| {
            warn!(command, ?delay, "Attempt failed, retrying: {e}");
        })
        .await;

    settle(command, options, result)
}

/// Spawn `command` with piped stdio and track it with the supervisor's
/// default deadline
pub fn spawn_safe(
    command: &str,
    options: &ExecOptions,
    supervisor: &ProcessSupervisor,
) -> Result<SpawnedProcess, ExecError> {
    let mut child = build_command(command, options)
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|source| ExecError::Spawn {
            command: command.to_string(),
            source,
        })?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let exit = supervisor
        .track_child(child, describe(command, options))
        .ok_or_else(|| missing_pid(command))?;
    info!(pid = exit.pid(), command, "Spawned supervised process");

    Ok(SpawnedProcess {
        pid: exit.pid(),
        stdin,
        stdout,
        stderr,
        exit,
    })
}

/// Apply `throw_on_error`
fn settle(
    command: &str,
    options: &ExecOptions,
    result: Result<ExecOutput, ExecError>,
) -> Result<ExecOutput, ExecError> {
    match result {
        Err(e) if !options.throw_on_error => {
            debug!(command, "Command failed, returning empty output: {e}");
            Ok(ExecOutput::default())
        }
        other => other,
    }
}

fn build_command(command: &str, options: &ExecOptions) -> Command {
    let mut cmd = Command::new(command);
    cmd.args(&options.args)
        .envs(&options.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &options.working_directory {
        cmd.current_dir(dir);
    }
    cmd
}

fn describe(command: &str, options: &ExecOptions) -> String {
    if options.args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, options.args.join(" "))
    }
}

fn missing_pid(command: &str) -> ExecError {
    GuardError::MissingProcessId {
        command: command.to_string(),
    }
    .into()
}

fn finish(
    command: &str,
    status: ExitStatus,
    stdout: String,
    stderr: String,
) -> Result<ExecOutput, ExecError> {
    match status.code() {
        Some(0) => Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: Some(0),
        }),
        Some(code) => Err(ExecError::NonZeroExit {
            command: command.to_string(),
            code,
            stderr: stderr.trim().to_string(),
        }),
        None => Err(ExecError::Signalled {
            command: command.to_string(),
        }),
    }
}

async fn run_async(
    command: &str,
    options: &ExecOptions,
    supervisor: Option<&ProcessSupervisor>,
) -> Result<ExecOutput, ExecError> {
    let mut child = build_command(command, options)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            command: command.to_string(),
            source,
        })?;

    let stdout = OutputBuffer::new(options.max_output_bytes);
    let stderr = OutputBuffer::new(options.max_output_bytes);
    let mut readers = Vec::with_capacity(2);
    if let Some(io) = child.stdout.take() {
        readers.push(tokio::spawn(stream(io, stdout.clone())));
    }
    if let Some(io) = child.stderr.take() {
        readers.push(tokio::spawn(stream(io, stderr.clone())));
    }

    // The timeout below drives termination, so no supervisor deadline
    let local;
    let supervisor = match supervisor {
        Some(supervisor) => supervisor,
        None => {
            local = ProcessSupervisor::new();
            &local
        }
    };
    let mut exit = supervisor
        .track_process(
            UnixProcessHandle::new(child, command),
            describe(command, options),
            Duration::ZERO,
        )
        .ok_or_else(|| missing_pid(command))?;
    let pid = exit.pid();

    let status = match options.timeout() {
        Some(limit) => match tokio::time::timeout(limit, exit.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(pid, command, timeout_ms = options.timeout_ms, "Command timed out");
                supervisor.kill_process(pid, false).await;
                for reader in &readers {
                    reader.abort();
                }
                return Err(ExecError::Timeout {
                    command: command.to_string(),
                    timeout_ms: options.timeout_ms,
                });
            }
        },
        None => exit.wait().await,
    };

    for reader in readers {
        match reader.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ExecError::Io(e)),
            Err(e) => return Err(ExecError::Io(std::io::Error::other(e))),
        }
    }

    let status = match status {
        Some(ProcessStatus::Exited(status)) => status,
        Some(ProcessStatus::Failed(reason)) => {
            return Err(ExecError::Io(std::io::Error::other(reason)));
        }
        None => {
            return Err(ExecError::Io(std::io::Error::other(
                "process observer stopped before reporting an exit status",
            )));
        }
    };

    if stdout.overflowed() || stderr.overflowed() {
        return Err(ExecError::OutputLimitExceeded {
            command: command.to_string(),
            limit: options.max_output_bytes,
        });
    }
    finish(command, status, stdout.contents(), stderr.contents())
}

/// Stand-in handle for a child reaped by the blocking executor. Resolves
/// once the executor reports the exit status.
struct BlockingChild {
    pid: ProcessId,
    command: String,
    exited: oneshot::Receiver<ExitStatus>,
}

#[async_trait]
impl ProcessHandle for BlockingChild {
    fn get_pid(&self) -> Option<ProcessId> {
        Some(self.pid)
    }

    fn get_command(&self) -> &str {
        &self.command
    }

    async fn wait(&mut self) -> anyhow::Result<ProcessStatus> {
        let status = (&mut self.exited).await?;
        Ok(ProcessStatus::Exited(status))
    }
}

/// Pipe reader thread collecting up to `limit` bytes
fn drain<R: Read + Send + 'static>(
    mut reader: R,
    limit: usize,
    overflow: Arc<AtomicBool>,
) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut collected = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = limit.saturating_sub(collected.len());
                    if n > room {
                        collected.extend_from_slice(&chunk[..room]);
                        overflow.store(true, Ordering::SeqCst);
                        break;
                    }
                    collected.extend_from_slice(&chunk[..n]);
                }
            }
        }
        collected
    })
}

fn run_blocking(
    command: &str,
    options: &ExecOptions,
    supervisor: Option<&ProcessSupervisor>,
) -> Result<ExecOutput, ExecError> {
    let mut cmd = std::process::Command::new(command);
    cmd.args(&options.args)
        .envs(&options.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &options.working_directory {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        command: command.to_string(),
        source,
    })?;
    let pid = child.id();

    let overflow = Arc::new(AtomicBool::new(false));
    let stdout = child
        .stdout
        .take()
        .map(|io| drain(io, options.max_output_bytes, overflow.clone()));
    let stderr = child
        .stderr
        .take()
        .map(|io| drain(io, options.max_output_bytes, overflow.clone()));

    let reported = supervisor.and_then(|supervisor| {
        if tokio::runtime::Handle::try_current().is_err() {
            debug!(pid, command, "No async runtime, blocking command runs untracked");
            return None;
        }
        let (tx, exited) = oneshot::channel();
        let handle = BlockingChild {
            pid,
            command: command.to_string(),
            exited,
        };
        supervisor
            .track_process(handle, describe(command, options), Duration::ZERO)
            .map(|_| tx)
    });

    let grace = supervisor
        .map(|supervisor| supervisor.config().grace_period())
        .unwrap_or(Duration::from_secs(1));
    let deadline = options.timeout().map(|limit| Instant::now() + limit);
    let mut timed_out = false;
    let mut escalate_at: Option<Instant> = None;

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }

        let now = Instant::now();
        if overflow.load(Ordering::SeqCst) && escalate_at.is_none() {
            send_signal(pid, KillSignal::Kill);
            escalate_at = Some(now);
        } else if !timed_out && deadline.is_some_and(|deadline| now >= deadline) {
            warn!(pid, command, timeout_ms = options.timeout_ms, "Command timed out");
            timed_out = true;
            send_signal(pid, options.kill_signal);
            escalate_at = Some(now + grace);
        } else if escalate_at.is_some_and(|at| now >= at) {
            send_signal(pid, KillSignal::Kill);
            escalate_at = Some(now + grace);
        }

        std::thread::sleep(POLL_INTERVAL);
    };

    if let Some(tx) = reported {
        let _ = tx.send(status);
    }

    let stdout = collect(stdout);
    let stderr = collect(stderr);

    if timed_out {
        return Err(ExecError::Timeout {
            command: command.to_string(),
            timeout_ms: options.timeout_ms,
        });
    }
    if overflow.load(Ordering::SeqCst) {
        return Err(ExecError::OutputLimitExceeded {
            command: command.to_string(),
            limit: options.max_output_bytes,
        });
    }
    finish(command, status, stdout, stderr)
}

fn collect(reader: Option<std::thread::JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|reader| reader.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_joins_args() {
        let options = ExecOptions::builder().args(["-c", "exit 0"]).build().unwrap();
        assert_eq!(describe("sh", &options), "sh -c exit 0");
        assert_eq!(describe("true", &ExecOptions::default()), "true");
    }

    #[test]
    fn test_settle_swallows_errors_only_when_asked() {
        let quiet = ExecOptions::builder().throw_on_error(false).build().unwrap();
        let failure = || {
            Err(ExecError::Signalled {
                command: "x".to_string(),
            })
        };

        assert_eq!(settle("x", &quiet, failure()).unwrap(), ExecOutput::default());
        assert!(settle("x", &ExecOptions::default(), failure()).is_err());
    }

    #[test]
    fn test_blocking_exec_captures_stdout() {
        let options = ExecOptions::builder()
            .args(["-c", "printf hello"])
            .build()
            .unwrap();
        let output = exec_sync_safe("sh", &options, None).unwrap();
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.exit_code, Some(0));
    }

    #[test]
    fn test_blocking_exec_times_out() {
        let options = ExecOptions::builder()
            .args(["30"])
            .timeout_ms(200u64)
            .build()
            .unwrap();
        let started = Instant::now();
        let err = exec_sync_safe("sleep", &options, None).unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_blocking_exec_output_cap() {
        let options = ExecOptions::builder()
            .args(["-c", "yes | head -c 100000"])
            .max_output_bytes(1024usize)
            .build()
            .unwrap();
        let err = exec_sync_safe("sh", &options, None).unwrap_err();
        assert!(matches!(err, ExecError::OutputLimitExceeded { limit: 1024, .. }));
    }
}
