//! Runtime configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default region key prefix for session slots.
pub const DEFAULT_SLOT_PREFIX: &str = "pausepoint";

/// Default event history budget (1 MiB).
const DEFAULT_EVENT_HISTORY_BYTES: usize = 1024 * 1024;

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Configuration shared by sessions and their transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prefix of the region keys carrying session slots.
    pub slot_prefix: String,
    /// Byte budget of the event history kept for late controllers.
    pub event_history_bytes: usize,
    /// Capacity of the live event channel.
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slot_prefix: DEFAULT_SLOT_PREFIX.to_string(),
            event_history_bytes: DEFAULT_EVENT_HISTORY_BYTES,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl Config {
    /// Parse a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    /// Returns error if the document is not valid JSON for this shape.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build from `PAUSEPOINT_*` environment variables over the defaults.
    ///
    /// # Errors
    /// Returns error if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(prefix) = lookup("PAUSEPOINT_SLOT_PREFIX") {
            config.slot_prefix = prefix;
        }
        if let Some(bytes) = parse_usize(&lookup, "PAUSEPOINT_EVENT_HISTORY_BYTES")? {
            config.event_history_bytes = bytes;
        }
        if let Some(capacity) = parse_usize(&lookup, "PAUSEPOINT_EVENT_CHANNEL_CAPACITY")? {
            config.event_channel_capacity = capacity;
        }
        Ok(config)
    }
}

fn parse_usize(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<usize>, ConfigError> {
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { key, value })
        })
        .transpose()
}
