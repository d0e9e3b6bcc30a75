//! Fleet configuration
//!
//! Defaults, YAML loading and `FLEET_*` environment overrides for the
//! coordination core. Field names follow the camelCase option names used by
//! operators (`baseDelayMs`, `heartbeatTimeoutMs`, ...).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Reconnection backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt (ms)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay (ms)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Exponential growth factor
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Apply ±30% uniform jitter to each delay
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// Maximum attempts before giving up; -1 (or any value <= 0) means unlimited
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    /// Timeout for a single connection factory invocation (ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_factor() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}
fn default_max_attempts() -> i64 {
    -1
}
fn default_connect_timeout_ms() -> u64 {
    30_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ReconnectConfig {
    /// Attempt limit, `None` when unlimited
    pub fn attempt_limit(&self) -> Option<u32> {
        if self.max_attempts > 0 {
            Some(self.max_attempts.min(u32::MAX as i64) as u32)
        } else {
            None
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Agent directory liveness configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryConfig {
    /// Agents silent for longer than this are marked offline (ms)
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// How often the liveness sweep runs (ms)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}
fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Message bus retention configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    /// Messages older than this are purged by cleanup (ms)
    #[serde(default = "default_message_retention_ms")]
    pub message_retention_ms: u64,
    /// How often cleanup runs (ms)
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Hard bound on the message log; oldest entries are evicted first
    #[serde(default = "default_max_log_size")]
    pub max_log_size: usize,
    /// Per-agent inbox capacity; deliveries to a full inbox are dropped
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

fn default_message_retention_ms() -> u64 {
    3_600_000
}
fn default_cleanup_interval_ms() -> u64 {
    3_600_000
}
fn default_max_log_size() -> usize {
    10_000
}
fn default_inbox_capacity() -> usize {
    256
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            message_retention_ms: default_message_retention_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            max_log_size: default_max_log_size(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

/// Task scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// How many times a failed task is requeued
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Health value treated as full health by the fitness score
    #[serde(default = "default_max_health")]
    pub max_health: f64,
    /// Period of the reassignment tick (ms); 0 disables it
    #[serde(default = "default_reassign_interval_ms")]
    pub reassign_interval_ms: u64,
    /// Terminal tasks older than this are pruned (ms)
    #[serde(default = "default_terminal_retention_ms")]
    pub terminal_retention_ms: u64,
    /// Upper bound on retained terminal tasks
    #[serde(default = "default_max_terminal_tasks")]
    pub max_terminal_tasks: usize,
}

fn default_max_retries() -> u32 {
    3
}
fn default_max_health() -> f64 {
    20.0
}
fn default_reassign_interval_ms() -> u64 {
    5000
}
fn default_terminal_retention_ms() -> u64 {
    3_600_000
}
fn default_max_terminal_tasks() -> usize {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_health: default_max_health(),
            reassign_interval_ms: default_reassign_interval_ms(),
            terminal_retention_ms: default_terminal_retention_ms(),
            max_terminal_tasks: default_max_terminal_tasks(),
        }
    }
}

/// Logging output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Top-level configuration for the coordination core
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FleetConfig {
    /// Parse a YAML document; missing keys fall back to defaults
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a YAML config file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Defaults, then the optional file, then environment overrides, then validation
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FLEET_*` environment variables on top of the current values
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        if let Some(v) = env_parse("FLEET_BASE_DELAY_MS")? {
            self.reconnect.base_delay_ms = v;
        }
        if let Some(v) = env_parse("FLEET_MAX_DELAY_MS")? {
            self.reconnect.max_delay_ms = v;
        }
        if let Some(v) = env_parse("FLEET_RECONNECT_FACTOR")? {
            self.reconnect.factor = v;
        }
        if let Some(v) = env_parse("FLEET_RECONNECT_JITTER")? {
            self.reconnect.jitter = v;
        }
        if let Some(v) = env_parse("FLEET_MAX_ATTEMPTS")? {
            self.reconnect.max_attempts = v;
        }
        if let Some(v) = env_parse("FLEET_CONNECT_TIMEOUT_MS")? {
            self.reconnect.connect_timeout_ms = v;
        }
        if let Some(v) = env_parse("FLEET_HEARTBEAT_TIMEOUT_MS")? {
            self.directory.heartbeat_timeout_ms = v;
        }
        if let Some(v) = env_parse("FLEET_MESSAGE_RETENTION_MS")? {
            self.bus.message_retention_ms = v;
        }
        if let Some(v) = env_parse("FLEET_REASSIGN_INTERVAL_MS")? {
            self.scheduler.reassign_interval_ms = v;
        }
        if let Ok(level) = std::env::var("FLEET_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(v) = env_parse("FLEET_LOG_JSON")? {
            self.logging.json = v;
        }
        Ok(())
    }

    /// Reject values the components cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        let r = &self.reconnect;
        if r.base_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "baseDelayMs must be greater than 0".to_string(),
            ));
        }
        if r.max_delay_ms < r.base_delay_ms {
            return Err(ConfigError::Invalid(
                "maxDelayMs must be >= baseDelayMs".to_string(),
            ));
        }
        if !r.factor.is_finite() || r.factor < 1.0 {
            return Err(ConfigError::Invalid("factor must be >= 1".to_string()));
        }
        if r.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connectTimeoutMs must be greater than 0".to_string(),
            ));
        }
        if self.directory.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeatTimeoutMs must be greater than 0".to_string(),
            ));
        }
        if self.bus.max_log_size == 0 || self.bus.inbox_capacity == 0 {
            return Err(ConfigError::Invalid(
                "maxLogSize and inboxCapacity must be greater than 0".to_string(),
            ));
        }
        if !self.scheduler.max_health.is_finite() || self.scheduler.max_health <= 0.0 {
            return Err(ConfigError::Invalid(
                "maxHealth must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> ConfigResult<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
