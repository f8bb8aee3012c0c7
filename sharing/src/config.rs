//! Tunables for the built-in backends and diagnostics
//!
//! Read from JSON (`from_json`) or from `SHARING_*` environment variables
//! (`from_env`). Missing fields fall back to the defaults.

use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Environment variable overriding [`SharingConfig::file_save_throttle_ms`]
pub const ENV_FILE_SAVE_THROTTLE_MS: &str = "SHARING_FILE_SAVE_THROTTLE_MS";
/// Environment variable overriding [`SharingConfig::file_poll_interval_ms`]
pub const ENV_FILE_POLL_INTERVAL_MS: &str = "SHARING_FILE_POLL_INTERVAL_MS";
/// Environment variable overriding [`SharingConfig::issue_channel_capacity`]
pub const ENV_ISSUE_CHANNEL_CAPACITY: &str = "SHARING_ISSUE_CHANNEL_CAPACITY";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    /// Window in which implicit file saves are coalesced into one write
    pub file_save_throttle_ms: u64,
    /// How often the file-system watcher polls a watched file
    pub file_poll_interval_ms: u64,
    /// Issues buffered per diagnostics receiver before it lags
    pub issue_channel_capacity: usize,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            file_save_throttle_ms: 1000,
            file_poll_interval_ms: 500,
            issue_channel_capacity: 64,
        }
    }
}

impl SharingConfig {
    /// Parse a JSON object; absent fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a field has the wrong type.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Defaults overridden by the `SHARING_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(ms) = parse_var(&lookup, ENV_FILE_SAVE_THROTTLE_MS) {
            config.file_save_throttle_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, ENV_FILE_POLL_INTERVAL_MS) {
            config.file_poll_interval_ms = ms;
        }
        if let Some(capacity) = parse_var(&lookup, ENV_ISSUE_CHANNEL_CAPACITY) {
            config.issue_channel_capacity = capacity;
        }
        config
    }

    #[must_use]
    pub fn file_save_throttle(&self) -> Duration {
        Duration::from_millis(self.file_save_throttle_ms)
    }

    #[must_use]
    pub fn file_poll_interval(&self) -> Duration {
        Duration::from_millis(self.file_poll_interval_ms)
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = ?raw, "ignoring config variable, not a valid number");
            None
        }
    }
}
