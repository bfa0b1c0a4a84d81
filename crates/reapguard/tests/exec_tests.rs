#![cfg(unix)]

use reapguard::{
    ExecError, ExecOptions, ExecOutput, GuardError, ProcessSupervisor, RetryConfig,
    SupervisorConfig, exec_sync_safe, exec_with_retry, exec_with_timeout, is_command_available, spawn_safe,
};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn shell(script: &str) -> ExecOptions {
    ExecOptions::builder().args(["-c", script]).build().unwrap()
}

fn fast_supervisor() -> ProcessSupervisor {
    ProcessSupervisor::with_config(SupervisorConfig {
        grace_period_ms: 300,
        ..SupervisorConfig::default()
    })
}

#[tokio::test]
async fn test_exec_captures_both_streams() {
    init_tracing();
    let output = exec_with_timeout("sh", &shell("echo out; echo err >&2"), None)
        .await
        .unwrap();

    assert_eq!(output.stdout, "out\n");
    assert_eq!(output.stderr, "err\n");
    assert_eq!(output.exit_code, Some(0));
}

#[tokio::test]
async fn test_exec_registers_with_supervisor() {
    init_tracing();
    let supervisor = ProcessSupervisor::new();

    exec_with_timeout("true", &ExecOptions::default(), Some(&supervisor))
        .await
        .unwrap();

    assert_eq!(supervisor.stats().snapshot().processes_tracked, 1);
    assert!(supervisor.active_processes().is_empty());
}

#[tokio::test]
async fn test_exec_timeout_escalates_and_rejects() {
    init_tracing();
    let supervisor = fast_supervisor();
    let options = ExecOptions::builder()
        .args(["-c", "trap '' TERM; sleep 30"])
        .timeout_ms(300u64)
        .build()
        .unwrap();

    let started = Instant::now();
    let err = exec_with_timeout("sh", &options, Some(&supervisor))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "Command 'sh' timed out after 300ms");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(supervisor.active_processes().is_empty());
    assert_eq!(supervisor.stats().snapshot().processes_killed, 1);
}

#[tokio::test]
async fn test_non_zero_exit_is_an_error() {
    init_tracing();
    let err = exec_with_timeout("sh", &shell("echo broken >&2; exit 3"), None)
        .await
        .unwrap_err();

    match err {
        ExecError::NonZeroExit { code, stderr, .. } => {
            assert_eq!(code, 3);
            assert_eq!(stderr, "broken");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_throw_on_error_false_returns_empty_output() {
    init_tracing();
    let options = ExecOptions::builder()
        .args(["-c", "echo partial; exit 1"])
        .throw_on_error(false)
        .build()
        .unwrap();

    let output = exec_with_timeout("sh", &options, None).await.unwrap();
    assert_eq!(output, ExecOutput::default());

    let output = exec_sync_safe("sh", &options, None).unwrap();
    assert_eq!(output, ExecOutput::default());
}

#[tokio::test]
async fn test_spawn_failure_surfaces() {
    init_tracing();
    let err = exec_with_timeout("definitely-not-a-real-binary-7f3a", &ExecOptions::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Spawn { .. }));
}

#[tokio::test]
async fn test_output_cap_is_enforced() {
    init_tracing();
    let options = ExecOptions::builder()
        .args(["-c", "head -c 4096 /dev/zero | tr '\\0' a"])
        .max_output_bytes(100usize)
        .build()
        .unwrap();

    let err = exec_with_timeout("sh", &options, None).await.unwrap_err();
    assert!(matches!(err, ExecError::OutputLimitExceeded { limit: 100, .. }));
}

#[tokio::test]
async fn test_retry_succeeds_after_failures() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("attempts");
    let script = format!(
        "echo x >> {0}; [ $(wc -l < {0}) -ge 3 ]",
        marker.display()
    );

    let output = exec_with_retry("sh", &shell(&script), &RetryConfig::new(3, 10), None)
        .await
        .unwrap();

    assert_eq!(output.exit_code, Some(0));
    let attempts = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(attempts.lines().count(), 3);
}

#[tokio::test]
async fn test_retry_surfaces_last_error() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("attempts");
    let script = format!("echo x >> {0}; exit $(wc -l < {0})", marker.display());
    let supervisor = ProcessSupervisor::new();

    let err = exec_with_retry(
        "sh",
        &shell(&script),
        &RetryConfig::new(2, 10),
        Some(&supervisor),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ExecError::NonZeroExit { code: 2, .. }));
    assert_eq!(supervisor.stats().snapshot().processes_tracked, 2);
}

#[tokio::test]
async fn test_retry_repeats_spawn_failures() {
    init_tracing();
    let started = Instant::now();

    let err = exec_with_retry(
        "definitely-not-a-real-binary-7f3a",
        &ExecOptions::default(),
        &RetryConfig::new(3, 150),
        None,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ExecError::Spawn { .. }));
    // Two delays between three attempts
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_retry_accepts_many_attempts() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("attempts");
    let script = format!("echo x >> {0}; [ $(wc -l < {0}) -ge 12 ]", marker.display());

    exec_with_retry("sh", &shell(&script), &RetryConfig::new(12, 1), None)
        .await
        .unwrap();

    let attempts = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(attempts.lines().count(), 12);
}

#[tokio::test]
async fn test_invalid_retry_config_is_not_attempted() {
    init_tracing();
    let err = exec_with_retry("true", &ExecOptions::default(), &RetryConfig::new(0, 10), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Guard(GuardError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_blocking_exec_is_supervised() {
    init_tracing();
    let supervisor = ProcessSupervisor::new();
    let options = shell("printf ok");

    let blocking = supervisor.clone();
    let output = tokio::task::spawn_blocking(move || exec_sync_safe("sh", &options, Some(&blocking)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(output.stdout, "ok");
    assert_eq!(supervisor.stats().snapshot().processes_tracked, 1);

    // The observer untracks once the executor reports the exit
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(supervisor.active_processes().is_empty());
}

#[tokio::test]
async fn test_spawn_safe_hands_back_stdio() {
    init_tracing();
    let supervisor = ProcessSupervisor::new();

    let mut spawned = spawn_safe("cat", &ExecOptions::default(), &supervisor).unwrap();
    assert!(supervisor.is_tracked(spawned.pid));

    let mut stdin = spawned.stdin.take().unwrap();
    stdin.write_all(b"echo").await.unwrap();
    drop(stdin);

    let mut echoed = String::new();
    spawned
        .stdout
        .take()
        .unwrap()
        .read_to_string(&mut echoed)
        .await
        .unwrap();
    assert_eq!(echoed, "echo");

    assert!(spawned.exit.wait().await.unwrap().success());
    assert!(!supervisor.is_tracked(spawned.pid));
}

/// Log sink shared with a test subscriber
#[derive(Clone, Default)]
struct CapturedLogs(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_unsupervised_exec_is_quiet_at_info() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    for _ in 0..3 {
        exec_with_timeout("true", &ExecOptions::default(), None)
            .await
            .unwrap();
    }

    let logs = String::from_utf8_lossy(&logs.0.lock()).into_owned();
    assert!(!logs.contains("Initializing"), "unexpected output: {logs}");
}

#[test]
fn test_command_availability() {
    assert!(is_command_available("sh"));
    assert!(!is_command_available("definitely-not-a-real-binary-7f3a"));
}
