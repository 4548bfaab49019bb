/// Configuration management for the hopline engine
///
/// Handles server configuration and the runtime tuning knobs of the execution core
/// (row set capacity, feedback cadence, job tracker retention).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default capacity of a row set between two transforms
pub const DEFAULT_ROWSET_SIZE: usize = 10_000;
/// Default number of rows between two per-transform feedback log lines
pub const DEFAULT_FEEDBACK_SIZE: u64 = 50_000;
/// Default period of the pipeline progress monitor
pub const DEFAULT_FEEDBACK_INTERVAL_MS: u64 = 5_000;
/// Default number of job tracker records kept in memory
pub const DEFAULT_MAX_JOB_ENTRIES_LOGGED: usize = 1_000;
/// Default polling period of `wait_until_finished`
pub const DEFAULT_WAIT_POLL_MS: u64 = 10;
/// Default time a finished execution stays visible through the API
pub const DEFAULT_EXECUTION_RETENTION_SECS: u64 = 3_600;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Execution engine configuration
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
    /// Seconds a finished execution record is kept before it is evicted
    pub execution_retention_secs: u64,
}

impl ServerConfig {
    pub fn execution_retention(&self) -> Duration {
        Duration::from_secs(self.execution_retention_secs)
    }
}

/// Tuning of the execution core shared by pipelines and jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of every row set unless a pipeline overrides it
    pub rowset_size: usize,
    /// Log a line every `feedback_size` rows written by a transform (0 disables)
    pub feedback_size: u64,
    /// Period of the pipeline progress monitor in milliseconds
    pub feedback_interval_ms: u64,
    /// Maximum job tracker records retained per job (0 keeps everything)
    pub max_job_entries_logged: usize,
    /// Polling period used by `wait_until_finished`
    pub wait_poll_ms: u64,
}

impl EngineConfig {
    /// Progress monitor period as a `Duration`
    pub fn feedback_interval(&self) -> Duration {
        Duration::from_millis(self.feedback_interval_ms.max(1))
    }

    /// Polling period as a `Duration`
    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms.max(1))
    }
}

impl Default for EngineConfig {
    /// Engine defaults with ENV_VAR overrides
    fn default() -> Self {
        Self {
            rowset_size: env_or("HOPLINE_ROWSET_SIZE", DEFAULT_ROWSET_SIZE),
            feedback_size: env_or("HOPLINE_FEEDBACK_SIZE", DEFAULT_FEEDBACK_SIZE),
            feedback_interval_ms: env_or("HOPLINE_FEEDBACK_INTERVAL_MS", DEFAULT_FEEDBACK_INTERVAL_MS),
            max_job_entries_logged: env_or("HOPLINE_MAX_JOB_ENTRIES_LOGGED", DEFAULT_MAX_JOB_ENTRIES_LOGGED),
            wait_poll_ms: env_or("HOPLINE_WAIT_POLL_MS", DEFAULT_WAIT_POLL_MS),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("HOPLINE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("HOPLINE_PORT", 3004),
                execution_retention_secs: env_or(
                    "HOPLINE_EXECUTION_RETENTION_SECS",
                    DEFAULT_EXECUTION_RETENTION_SECS,
                ),
            },
            engine: EngineConfig::default(),
        }
    }
}

/// Read and parse an environment variable, falling back to `default` when it is
/// missing or malformed
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("⚠️ Ignoring invalid value for {}: '{}'", key, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("HOPLINE_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_or("HOPLINE_TEST_GARBAGE", 42usize), 42);
        std::env::remove_var("HOPLINE_TEST_GARBAGE");
    }

    #[test]
    fn env_or_reads_valid_value() {
        std::env::set_var("HOPLINE_TEST_VALID", " 17 ");
        assert_eq!(env_or("HOPLINE_TEST_VALID", 1u64), 17);
        std::env::remove_var("HOPLINE_TEST_VALID");
    }

    #[test]
    fn durations_never_zero() {
        let config = EngineConfig {
            rowset_size: 1,
            feedback_size: 0,
            feedback_interval_ms: 0,
            max_job_entries_logged: 0,
            wait_poll_ms: 0,
        };
        assert_eq!(config.feedback_interval(), Duration::from_millis(1));
        assert_eq!(config.wait_poll(), Duration::from_millis(1));
    }
}
