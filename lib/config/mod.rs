//! Environment-driven runtime configuration.
//!
//! Every knob has a default; the environment (usually via a `.env` file)
//! overrides. Provider selection read here is only the bootstrap value:
//! persisted settings in the durable store win over the environment.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backup::SyncRetryConfig;
use crate::processor::ProcessorConfig;

pub const DEFAULT_DATABASE_PATH: &str = "intake.db";
pub const DEFAULT_LOCAL_RUNNER: &str = "model-runner";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    Invalid { var: String, value: String },
}

/// Full runtime configuration for the worker process.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    /// Executable invoked by the local extraction provider.
    pub local_runner: PathBuf,
    pub remote_endpoint: Option<String>,
    pub remote_credential: Option<String>,
    /// Bootstrap provider selection; persisted settings override it.
    pub use_remote: bool,
    pub backup_endpoint: Option<String>,
    pub backup_token: Option<String>,
    pub backup_timeout: Duration,
    pub processor: ProcessorConfig,
    pub sync_retry: SyncRetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            local_runner: PathBuf::from(DEFAULT_LOCAL_RUNNER),
            remote_endpoint: None,
            remote_credential: None,
            use_remote: false,
            backup_endpoint: None,
            backup_token: None,
            backup_timeout: Duration::from_secs(10),
            processor: ProcessorConfig::default(),
            sync_retry: SyncRetryConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds a config from an arbitrary variable lookup.
    ///
    /// Split out from `from_env` so tests can drive it without mutating
    /// process-wide environment state.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(path) = lookup("INTAKE_DB_PATH") {
            config.database_path = path;
        }
        if let Some(runner) = lookup("INTAKE_LOCAL_RUNNER") {
            config.local_runner = PathBuf::from(runner);
        }
        config.remote_endpoint = lookup("INTAKE_REMOTE_ENDPOINT");
        config.remote_credential = lookup("INTAKE_REMOTE_CREDENTIAL");
        if let Some(value) = lookup("INTAKE_USE_REMOTE") {
            config.use_remote = parse_bool("INTAKE_USE_REMOTE", &value)?;
        }
        config.backup_endpoint = lookup("INTAKE_BACKUP_ENDPOINT");
        config.backup_token = lookup("INTAKE_BACKUP_TOKEN");
        if let Some(secs) = parse_opt::<u64>(&lookup, "INTAKE_BACKUP_TIMEOUT_SECS")? {
            config.backup_timeout = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_opt::<u64>(&lookup, "INTAKE_POLL_INTERVAL_MS")? {
            config.processor.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_opt::<u64>(&lookup, "INTAKE_EXTRACT_TIMEOUT_SECS")? {
            config.processor.extract_timeout = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_opt::<u64>(&lookup, "INTAKE_SYNC_BASE_BACKOFF_MS")? {
            config.sync_retry.base_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_opt::<u64>(&lookup, "INTAKE_SYNC_MAX_BACKOFF_MS")? {
            config.sync_retry.max_backoff = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_opt::<i32>(&lookup, "INTAKE_SYNC_MAX_ATTEMPTS")? {
            if attempts < 1 {
                return Err(ConfigError::Invalid {
                    var: "INTAKE_SYNC_MAX_ATTEMPTS".to_string(),
                    value: attempts.to_string(),
                });
            }
            config.sync_retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_opt::<u64>(&lookup, "INTAKE_SYNC_DRAIN_INTERVAL_MS")? {
            config.sync_retry.drain_interval = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Whether a backup target is configured at all.
    pub fn backup_enabled(&self) -> bool {
        self.backup_endpoint
            .as_deref()
            .is_some_and(|endpoint| !endpoint.trim().is_empty())
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_opt<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var: var.to_string(),
                value,
            }),
        None => Ok(None),
    }
}
