use crate::process::ProcessId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced directly to callers of the guard API
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Registration of '{name}' rejected: cleanup in progress")]
    RegistrationRejected { name: String },

    #[error("Process for '{command}' has no PID and cannot be tracked")]
    MissingProcessId { command: String },
}

/// A failure while releasing a single resource.
///
/// These never propagate out of `cleanup()`. The `Display` output is what ends
/// up in `Stats::errors`, so every variant names the resource it belongs to.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TeardownError {
    #[error("Custom cleanup '{name}' failed: {reason}")]
    CustomCleanup { name: String, reason: String },

    #[error("Failed to kill process {pid} ({command}): {reason}")]
    ProcessKill {
        pid: ProcessId,
        command: String,
        reason: String,
    },

    #[error("Failed to cancel timer: {reason}")]
    TimerCancel { reason: String },

    #[error("Failed to remove temp directory {}: {reason}", path.display())]
    TempDir { path: PathBuf, reason: String },

    #[error("Failed to close file handle: {reason}")]
    FileHandle { reason: String },
}

/// Errors from the safe execution helpers
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{command}' exited with code {code}: {stderr}")]
    NonZeroExit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Command '{command}' was terminated by a signal")]
    Signalled { command: String },

    #[error("Command '{command}' timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("Command '{command}' exceeded output limit of {limit} bytes")]
    OutputLimitExceeded { command: String, limit: usize },

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Check if running the command again is worthwhile. Only guard errors
    /// (bad configuration, untrackable process) are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecError::Guard(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_error_display_names_resource() {
        let error = TeardownError::CustomCleanup {
            name: "db".to_string(),
            reason: "connection reset".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Custom cleanup 'db' failed: connection reset"
        );

        let error = TeardownError::TempDir {
            path: PathBuf::from("/tmp/work"),
            reason: "busy".to_string(),
        };
        assert!(error.to_string().contains("/tmp/work"));

        let error = TeardownError::ProcessKill {
            pid: 42,
            command: "eslint".to_string(),
            reason: "EPERM".to_string(),
        };
        let display = format!("{error}");
        assert!(display.contains("42"));
        assert!(display.contains("eslint"));
    }

    #[test]
    fn test_timeout_message() {
        let error = ExecError::Timeout {
            command: "sleep 10".to_string(),
            timeout_ms: 250,
        };
        assert!(error.to_string().contains("timed out after 250ms"));
        assert!(error.is_timeout());
    }

    #[test]
    fn test_error_categorization() {
        assert!(
            ExecError::NonZeroExit {
                command: "false".to_string(),
                code: 1,
                stderr: String::new(),
            }
            .is_retryable()
        );
        assert!(
            ExecError::Timeout {
                command: "x".to_string(),
                timeout_ms: 1,
            }
            .is_retryable()
        );

        let spawn = ExecError::Spawn {
            command: "missing-binary".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(spawn.is_retryable());
        assert!(!spawn.is_timeout());

        let config = ExecError::from(GuardError::InvalidConfig("bad".to_string()));
        assert!(!config.is_retryable());
    }

    #[test]
    fn test_guard_error_debug_format() {
        let error = GuardError::MissingProcessId {
            command: "node".to_string(),
        };
        let debug_str = format!("{error:?}");
        assert!(debug_str.contains("MissingProcessId"));
        assert!(debug_str.contains("node"));
    }
}
