//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use peerlink_core::SessionConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/peerlink/config.toml or /etc/peerlink/config.toml.
/// Env overrides: PEERLINK_NAME, PEERLINK_DISCOVERY_PORT, PEERLINK_CHANNEL_PORT,
/// PEERLINK_RECEIVED_DIR, PEERLINK_RENDEZVOUS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Channel TCP port (default 45681). 0 picks a free port.
    #[serde(default = "default_channel_port")]
    pub channel_port: u16,
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_discovery_port() -> u16 {
    45680
}
fn default_channel_port() -> u16 {
    45681
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 60, 61)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            channel_port: default_channel_port(),
            multicast_group: default_multicast_group(),
            session: SessionConfig::default(),
        }
    }
}

/// Load config: default, then the config file (explicit path or the first one found), then env.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => parse_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => parse_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/config.toml"));
    out
}

/// Unparseable values are ignored and the file/default value kept.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(name) = var("PEERLINK_NAME").filter(|n| !n.trim().is_empty()) {
        c.session.name = name.trim().to_string();
    }
    if let Some(p) = var("PEERLINK_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("PEERLINK_CHANNEL_PORT").and_then(|s| s.parse().ok()) {
        c.channel_port = p;
    }
    if let Some(dir) = var("PEERLINK_RECEIVED_DIR") {
        c.session.received_dir = PathBuf::from(dir);
    }
    if let Some(flag) = var("PEERLINK_RENDEZVOUS").and_then(|s| parse_flag(&s)) {
        c.session.act_as_rendezvous = flag;
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
