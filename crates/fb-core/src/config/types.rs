//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Message outbox configuration
    #[serde(default)]
    pub outbox: OutboxConfig,
    /// Heartbeat configuration
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Dispatcher daemon configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file path (default: ~/.config/fleetbeat/fleetbeat.db)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// How long a writer waits for the database write lock, in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Configured database path, or `fleetbeat.db` under the global config dir.
    pub fn database_path(&self, home: &Path) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| crate::home::config_dir(home).join("fleetbeat.db"))
    }
}

/// Message outbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Ordered delivery services every message fans out to
    #[serde(default = "default_services")]
    pub services: Vec<String>,
    /// Longest serialized payload kept in the primary column
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    /// Lifetime of a retrieval claim, in seconds
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
    /// Rows per multi-row insert statement
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            services: default_services(),
            max_message_length: default_max_message_length(),
            claim_timeout_secs: default_claim_timeout_secs(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl OutboxConfig {
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeats older than this are ignored when computing ranks
    #[serde(default = "default_older_than_secs")]
    pub older_than_secs: u64,
    /// Heartbeats older than this are purged by the sanity check
    #[serde(default = "default_expiration_delay_secs")]
    pub expiration_delay_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            older_than_secs: default_older_than_secs(),
            expiration_delay_secs: default_expiration_delay_secs(),
        }
    }
}

impl HeartbeatConfig {
    pub fn older_than(&self) -> Duration {
        Duration::from_secs(self.older_than_secs)
    }

    pub fn expiration_delay(&self) -> Duration {
        Duration::from_secs(self.expiration_delay_secs)
    }
}

/// Dispatcher daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Heartbeat executable prefix; dispatchers append their service name
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Seconds between polls
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Maximum messages per poll
    #[serde(default = "default_bulk")]
    pub bulk: usize,
    /// Only handle messages for this service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Only handle messages of this event type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Directory for file-based delivery; logs only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spool_dir: Option<PathBuf>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            interval_secs: default_interval_secs(),
            bulk: default_bulk(),
            service: None,
            event_type: None,
            spool_dir: None,
        }
    }
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_services() -> Vec<String> {
    vec!["activemq".to_string(), "email".to_string()]
}

fn default_max_message_length() -> usize {
    4000
}

fn default_claim_timeout_secs() -> u64 {
    600
}

fn default_chunk_size() -> usize {
    1000
}

fn default_older_than_secs() -> u64 {
    600
}

fn default_expiration_delay_secs() -> u64 {
    86_400 // 1 day
}

fn default_executable() -> String {
    "fb-dispatcher".to_string()
}

fn default_interval_secs() -> u64 {
    10
}

fn default_bulk() -> usize {
    1000
}
