use crate::error::GuardError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the process supervisor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Deadline applied by `track_child` when the caller does not pass one
    /// (0 disables the deadline)
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// How long a gracefully signalled process gets before it is force killed
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Whether forced kills also take down descendants of the process
    #[serde(default = "default_kill_process_tree")]
    pub kill_process_tree: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            grace_period_ms: default_grace_period_ms(),
            kill_process_tree: default_kill_process_tree(),
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), GuardError> {
        if self.grace_period_ms == 0 {
            return Err(GuardError::InvalidConfig(
                "grace_period_ms must be greater than zero".to_string(),
            ));
        }

        if self.grace_period_ms > 60_000 {
            return Err(GuardError::InvalidConfig(
                "grace_period_ms should not exceed 60 seconds".to_string(),
            ));
        }

        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Retry policy for `exec_with_retry`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between attempts (in milliseconds)
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
        }
    }

    /// A single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
        }
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        if self.max_attempts == 0 {
            return Err(GuardError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.delay_ms > 60_000 {
            return Err(GuardError::InvalidConfig(
                "delay_ms should not exceed 60 seconds".to_string(),
            ));
        }

        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn retries_enabled(&self) -> bool {
        self.max_attempts > 1
    }
}

/// Signal used to stop a command that overran its timeout
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KillSignal {
    #[default]
    Term,
    Kill,
    Int,
    Hup,
}

/// Options shared by the safe execution helpers
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct ExecOptions {
    #[builder(default)]
    #[builder(setter(custom))]
    pub args: Vec<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
    /// 0 disables the timeout
    #[builder(default = "default_timeout_ms()")]
    pub timeout_ms: u64,
    #[builder(default)]
    pub kill_signal: KillSignal,
    #[builder(default = "default_max_output_bytes()")]
    pub max_output_bytes: usize,
    /// When false, failures yield an empty `ExecOutput` instead of an error
    #[builder(default = "true")]
    pub throw_on_error: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            env: HashMap::new(),
            working_directory: None,
            timeout_ms: default_timeout_ms(),
            kill_signal: KillSignal::default(),
            max_output_bytes: default_max_output_bytes(),
            throw_on_error: true,
        }
    }
}

impl ExecOptions {
    pub fn builder() -> ExecOptionsBuilder {
        ExecOptionsBuilder::default()
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl ExecOptionsBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }
}

// Default value functions for serde
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_grace_period_ms() -> u64 {
    1_000
}
fn default_kill_process_tree() -> bool {
    true
}
fn default_max_attempts() -> u32 {
    3
}
fn default_delay_ms() -> u64 {
    1_000
}
fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_supervisor_config() {
        let config = SupervisorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.grace_period(), Duration::from_millis(1000));
    }

    #[test]
    fn test_invalid_supervisor_config() {
        let config = SupervisorConfig {
            grace_period_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_supervisor_config_partial_json() {
        let config: SupervisorConfig = serde_json::from_str(r#"{"gracePeriodMs": 250}"#).unwrap();
        assert_eq!(config.grace_period_ms, 250);
        assert_eq!(config.default_timeout_ms, 30_000);
        assert!(config.kill_process_tree);
    }

    #[test]
    fn test_retry_config() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::default().retries_enabled());
        assert!(!RetryConfig::no_retry().retries_enabled());
        assert!(RetryConfig::new(0, 10).validate().is_err());
        assert!(RetryConfig::new(12, 1).validate().is_ok());
        assert!(RetryConfig::new(3, 120_000).validate().is_err());
    }

    #[test]
    fn test_exec_options_builder() {
        let options = ExecOptions::builder()
            .args(["-c", "echo hi"])
            .env("LANG", "C")
            .working_directory("/tmp")
            .timeout_ms(500u64)
            .build()
            .unwrap();

        assert_eq!(options.args, vec!["-c", "echo hi"]);
        assert_eq!(options.env.get("LANG"), Some(&"C".to_string()));
        assert_eq!(options.working_directory, Some(PathBuf::from("/tmp")));
        assert_eq!(options.timeout(), Some(Duration::from_millis(500)));
        assert!(options.throw_on_error);
        assert_eq!(options.kill_signal, KillSignal::Term);
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let options = ExecOptions {
            timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(options.timeout(), None);
    }
}
