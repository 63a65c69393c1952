//! Engine configuration
//!
//! Loaded from YAML; every field has a default, so an empty document is a
//! valid configuration.

use evt_core::Priority;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a file
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML
    #[error("failed to parse YAML: {source}")]
    ParseYaml {
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Largest accepted priority table entry, one day
pub const MAX_TABLE_SECONDS: f64 = 86_400.0;

/// A value in seconds for each priority class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityTable {
    pub realtime: f64,
    pub interactive: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
    pub verylow: f64,
}

impl PriorityTable {
    /// The entry for a priority as a duration
    ///
    /// Negative or NaN entries count as zero and entries above
    /// [`MAX_TABLE_SECONDS`] are clamped to it.
    pub fn get(&self, priority: Priority) -> Duration {
        let secs = match priority {
            Priority::Realtime => self.realtime,
            Priority::Interactive => self.interactive,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
            Priority::Verylow => self.verylow,
        };
        Duration::try_from_secs_f64(secs.min(MAX_TABLE_SECONDS)).unwrap_or_default()
    }

    fn values(&self) -> [(&'static str, f64); 6] {
        [
            ("realtime", self.realtime),
            ("interactive", self.interactive),
            ("high", self.high),
            ("medium", self.medium),
            ("low", self.low),
            ("verylow", self.verylow),
        ]
    }

    /// Minimum seconds between two polls of one event
    pub fn default_response() -> Self {
        Self {
            realtime: 0.0,
            interactive: 0.08,
            high: 0.2,
            medium: 0.5,
            low: 1.0,
            verylow: 3.0,
        }
    }

    /// Seconds an event is skipped by the poll loop after an evaluation error
    pub fn default_backoff() -> Self {
        Self {
            realtime: 0.0,
            interactive: 1.0,
            high: 2.0,
            medium: 5.0,
            low: 10.0,
            verylow: 30.0,
        }
    }
}

/// A priority table as written in YAML, where any entry may be left out
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialTable {
    realtime: Option<f64>,
    interactive: Option<f64>,
    high: Option<f64>,
    medium: Option<f64>,
    low: Option<f64>,
    verylow: Option<f64>,
}

impl PartialTable {
    fn over(self, base: PriorityTable) -> PriorityTable {
        PriorityTable {
            realtime: self.realtime.unwrap_or(base.realtime),
            interactive: self.interactive.unwrap_or(base.interactive),
            high: self.high.unwrap_or(base.high),
            medium: self.medium.unwrap_or(base.medium),
            low: self.low.unwrap_or(base.low),
            verylow: self.verylow.unwrap_or(base.verylow),
        }
    }
}

fn response_table<'de, D: Deserializer<'de>>(d: D) -> Result<PriorityTable, D::Error> {
    Ok(PartialTable::deserialize(d)?.over(PriorityTable::default_response()))
}

fn backoff_table<'de, D: Deserializer<'de>>(d: D) -> Result<PriorityTable, D::Error> {
    Ok(PartialTable::deserialize(d)?.over(PriorityTable::default_backoff()))
}

/// Worker pool sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Workers serving realtime and interactive events
    #[serde(default = "default_interactive_workers")]
    pub interactive: usize,

    /// Workers serving every other priority
    #[serde(default = "default_workers")]
    pub default: usize,

    /// Pending actions each pool holds before fires are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            interactive: default_interactive_workers(),
            default: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Event engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Poll loop base tick in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Per-priority minimum seconds between polls of one event
    #[serde(
        default = "PriorityTable::default_response",
        deserialize_with = "response_table"
    )]
    pub priority_response: PriorityTable,

    /// Per-priority seconds to skip an event after an evaluation error
    #[serde(
        default = "PriorityTable::default_backoff",
        deserialize_with = "backoff_table"
    )]
    pub error_backoff: PriorityTable,

    #[serde(default)]
    pub workers: WorkersConfig,

    /// Queue occupancy above which the poll loop skips a tick
    #[serde(default = "default_saturation_threshold")]
    pub saturation_threshold: f64,

    /// Errors kept per event
    #[serde(default = "default_errors_to_keep")]
    pub errors_to_keep: usize,

    /// Runs kept per event
    #[serde(default = "default_history_to_keep")]
    pub history_to_keep: usize,

    /// Publish error reports on the message bus
    #[serde(default = "default_true")]
    pub post_errors_to_bus: bool,

    /// Log filter used by the server binary
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_tick_interval_ms() -> u64 {
    10
}

fn default_interactive_workers() -> usize {
    4
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    120
}

fn default_saturation_threshold() -> f64 {
    0.5
}

fn default_errors_to_keep() -> usize {
    25
}

fn default_history_to_keep() -> usize {
    250
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            priority_response: PriorityTable::default_response(),
            error_backoff: PriorityTable::default_backoff(),
            workers: WorkersConfig::default(),
            saturation_threshold: default_saturation_threshold(),
            errors_to_keep: default_errors_to_keep(),
            history_to_keep: default_history_to_keep(),
            post_errors_to_bus: default_true(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml { source: e })?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        debug!("Loading engine configuration: {:?}", path);
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Check values the engine cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::invalid("tick_interval_ms", "must be greater than 0"));
        }
        if self.workers.interactive == 0 {
            return Err(ConfigError::invalid("workers.interactive", "must be greater than 0"));
        }
        if self.workers.default == 0 {
            return Err(ConfigError::invalid("workers.default", "must be greater than 0"));
        }
        if self.workers.queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "workers.queue_capacity",
                "must be greater than 0",
            ));
        }
        if !(self.saturation_threshold > 0.0 && self.saturation_threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "saturation_threshold",
                format!("{} is outside (0, 1]", self.saturation_threshold),
            ));
        }
        for (table, key) in [
            (&self.priority_response, "priority_response"),
            (&self.error_backoff, "error_backoff"),
        ] {
            for (name, secs) in table.values() {
                if !(0.0..=MAX_TABLE_SECONDS).contains(&secs) {
                    return Err(ConfigError::invalid(
                        &format!("{}.{}", key, name),
                        format!("must be between 0 and {} seconds", MAX_TABLE_SECONDS),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
