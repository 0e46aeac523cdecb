//! Dispatch configuration.

use std::time::Duration;

use tracing::warn;

/// Environment variable holding the shutdown budget in whole seconds.
pub const SHUTDOWN_TIMEOUT_ENV: &str = "SHUTDOWN_TIMEOUT_SECONDS";

const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ADMISSION_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Name used in logs and for the worker task.
    pub name: String,
    /// Total budget for gate close + drain at shutdown.
    pub shutdown_timeout: Duration,
    /// How long the worker waits for an admission slot per item.
    pub admission_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            name: "dispatch-worker".to_string(),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            admission_timeout: Duration::from_millis(DEFAULT_ADMISSION_TIMEOUT_MS),
        }
    }
}

impl DispatchConfig {
    /// Defaults, with the shutdown budget taken from `SHUTDOWN_TIMEOUT_SECONDS` when set.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(SHUTDOWN_TIMEOUT_ENV) {
            Ok(raw) => match parse_seconds(&raw) {
                Some(timeout) => config.with_shutdown_timeout(timeout),
                None => {
                    warn!(
                        value = %raw,
                        default_secs = DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                        "{SHUTDOWN_TIMEOUT_ENV} is not a whole number of seconds; using default"
                    );
                    config
                }
            },
            Err(_) => config,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}
