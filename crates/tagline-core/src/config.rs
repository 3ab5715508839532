//! Channel-level configuration.
//!
//! Routing tables and default assignments live in the persistent store; this
//! config covers behavior switches and tuning that operators set per
//! deployment. A missing file yields the defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Recognize and upgrade the legacy tag vocabulary while set.
    #[serde(default)]
    pub legacy_window: bool,
    /// Apply the channel's configured `(user, priority)` default to tickets
    /// missing a status.
    #[serde(default = "default_true")]
    pub insert_defaults: bool,
    /// Reassign tickets whose assignee is no longer an active member.
    #[serde(default = "default_true")]
    pub repair_assignee: bool,
    #[serde(default = "default_directory_ttl_secs")]
    pub directory_ttl_secs: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            legacy_window: false,
            insert_defaults: default_true(),
            repair_assignee: default_true(),
            directory_ttl_secs: default_directory_ttl_secs(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl ChannelConfig {
    #[must_use]
    pub const fn directory_ttl(&self) -> Duration {
        Duration::from_secs(self.directory_ttl_secs)
    }
}

const fn default_true() -> bool {
    true
}

const fn default_directory_ttl_secs() -> u64 {
    300
}

const fn default_retry_base_delay_ms() -> u64 {
    500
}

const fn default_retry_max_delay_ms() -> u64 {
    30_000
}

/// Load channel config from a TOML file; absent file means defaults.
pub fn load_channel_config(path: &Path) -> Result<ChannelConfig> {
    if !path.exists() {
        return Ok(ChannelConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<ChannelConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}
