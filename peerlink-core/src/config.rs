//! Session configuration. Every field has a default, so an empty table is a valid config.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::DEFAULT_CHANNEL_TIMEOUT;
use crate::discovery::{
    DiscoverySettings, DEFAULT_ADVERTISEMENT_EXPIRATION, DEFAULT_ADVERTISEMENT_LIFETIME,
    DEFAULT_DISCOVERY_INTERVAL, DEFAULT_MAX_RESULTS,
};
use crate::transfer::DEFAULT_PACKET_SIZE;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Display name; the registry key other peers know us by.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Per-instance transport state directory.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Bootstrap seed list for transports that use one.
    #[serde(default)]
    pub seed_uri: Option<String>,
    /// Serve as an upstream node; skips the connectivity wait.
    #[serde(default)]
    pub act_as_rendezvous: bool,
    #[serde(default = "default_lifetime_secs")]
    pub advertisement_lifetime_secs: u64,
    #[serde(default = "default_expiration_secs")]
    pub advertisement_expiration_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_max_results")]
    pub discovery_max_results: u32,
    #[serde(default = "default_channel_timeout_secs")]
    pub channel_timeout_secs: u64,
    /// Bound on the startup connectivity wait. Unset waits forever.
    #[serde(default)]
    pub connect_wait_secs: Option<u64>,
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    /// Where received files are written.
    #[serde(default = "default_received_dir")]
    pub received_dir: PathBuf,
}

fn default_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("peer-{}", &id[..8])
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from(".peerlink")
}
fn default_lifetime_secs() -> u64 {
    DEFAULT_ADVERTISEMENT_LIFETIME.as_secs()
}
fn default_expiration_secs() -> u64 {
    DEFAULT_ADVERTISEMENT_EXPIRATION.as_secs()
}
fn default_interval_secs() -> u64 {
    DEFAULT_DISCOVERY_INTERVAL.as_secs()
}
fn default_max_results() -> u32 {
    DEFAULT_MAX_RESULTS
}
fn default_channel_timeout_secs() -> u64 {
    DEFAULT_CHANNEL_TIMEOUT.as_secs()
}
fn default_packet_size() -> usize {
    DEFAULT_PACKET_SIZE
}
fn default_received_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            description: None,
            cache_dir: default_cache_dir(),
            seed_uri: None,
            act_as_rendezvous: false,
            advertisement_lifetime_secs: default_lifetime_secs(),
            advertisement_expiration_secs: default_expiration_secs(),
            discovery_interval_secs: default_interval_secs(),
            discovery_max_results: default_max_results(),
            channel_timeout_secs: default_channel_timeout_secs(),
            connect_wait_secs: None,
            packet_size: default_packet_size(),
            received_dir: default_received_dir(),
        }
    }
}

impl SessionConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn discovery(&self) -> DiscoverySettings {
        DiscoverySettings {
            lifetime: Duration::from_secs(self.advertisement_lifetime_secs),
            expiration: Duration::from_secs(self.advertisement_expiration_secs),
            interval: Duration::from_secs(self.discovery_interval_secs),
            max_results: self.discovery_max_results,
        }
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs)
    }

    pub fn connect_wait(&self) -> Option<Duration> {
        self.connect_wait_secs.map(Duration::from_secs)
    }
}
