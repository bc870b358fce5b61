//! Configuration management for kuba-exec
//!
//! TOML file support with per-field defaults and environment variable
//! overrides. The query section maps onto [`QueryOptions`] and
//! [`ExecutorConfig`]; the logging section drives the tracing subscriber.

use crate::error::ConfigError;
use crate::query::executor::{
    default_decoding_concurrency, ExecutorConfig, QueryOptions, DEFAULT_LOOKBACK_DELTA_MS,
    DEFAULT_STEPS_BATCH, DEFAULT_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Query execution settings
    #[serde(default)]
    pub query: QueryConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Query execution configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Staleness horizon for instant selectors (ms)
    #[serde(default = "default_lookback_delta_ms")]
    pub lookback_delta_ms: i64,

    /// Steps emitted per batch
    #[serde(default = "default_steps_batch")]
    pub steps_batch: usize,

    /// Shards (worker tasks) per selector
    #[serde(default = "default_decoding_concurrency")]
    pub decoding_concurrency: usize,

    /// Query timeout (ms)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Point cap for drained results
    #[serde(default = "default_max_result_points")]
    pub max_result_points: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,
}

fn default_lookback_delta_ms() -> i64 { DEFAULT_LOOKBACK_DELTA_MS }
fn default_steps_batch() -> usize { DEFAULT_STEPS_BATCH }
fn default_timeout_ms() -> u64 { DEFAULT_TIMEOUT.as_millis() as u64 }
fn default_max_result_points() -> usize { ExecutorConfig::default().max_result_points }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            lookback_delta_ms: default_lookback_delta_ms(),
            steps_batch: default_steps_batch(),
            decoding_concurrency: default_decoding_concurrency(),
            timeout_ms: default_timeout_ms(),
            max_result_points: default_max_result_points(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
        }
    }
}

impl QueryConfig {
    /// Options for a range query using these settings
    pub fn query_options(&self, start_ms: i64, end_ms: i64, step_ms: i64) -> QueryOptions {
        QueryOptions::range(start_ms, end_ms, step_ms)
            .with_lookback_delta_ms(self.lookback_delta_ms)
            .with_steps_batch(self.steps_batch)
            .with_decoding_concurrency(self.decoding_concurrency)
    }

    /// Executor limits using these settings
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::new()
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_max_result_points(self.max_result_points)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    ///
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("KUBA_EXEC_LOOKBACK_DELTA_MS") {
            self.query.lookback_delta_ms = v;
        }
        if let Some(v) = env_parse("KUBA_EXEC_STEPS_BATCH") {
            self.query.steps_batch = v;
        }
        if let Some(v) = env_parse("KUBA_EXEC_DECODING_CONCURRENCY") {
            self.query.decoding_concurrency = v;
        }
        if let Some(v) = env_parse("KUBA_EXEC_TIMEOUT_MS") {
            self.query.timeout_ms = v;
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.query;
        if q.lookback_delta_ms <= 0 {
            return Err(invalid("query.lookback_delta_ms", q.lookback_delta_ms, "must be positive"));
        }
        if q.steps_batch == 0 {
            return Err(invalid("query.steps_batch", q.steps_batch, "must be at least 1"));
        }
        if q.decoding_concurrency == 0 {
            return Err(invalid(
                "query.decoding_concurrency",
                q.decoding_concurrency,
                "must be at least 1",
            ));
        }
        if q.timeout_ms == 0 {
            return Err(invalid("query.timeout_ms", q.timeout_ms, "must be positive"));
        }
        if q.max_result_points == 0 {
            return Err(invalid(
                "query.max_result_points",
                q.max_result_points,
                "must be at least 1",
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(invalid("logging.level", "\"\"", "cannot be empty"));
        }
        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })
    }

    /// Install the global tracing subscriber
    ///
    /// `RUST_LOG` wins over `logging.level`. Returns false if a subscriber
    /// was already installed.
    pub fn init_logging(&self) -> bool {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&self.logging.level));

        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(self.logging.with_target)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .try_init()
            .is_ok();

        if installed {
            info!(
                lookback_delta_ms = self.query.lookback_delta_ms,
                steps_batch = self.query.steps_batch,
                decoding_concurrency = self.query.decoding_concurrency,
                "Logging initialised"
            );
        }
        installed
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn invalid(field: &'static str, value: impl ToString, reason: &'static str) -> ConfigError {
    ConfigError::Invalid {
        field,
        value: value.to_string(),
        reason,
    }
}
