//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use cardshare_core::core::{
    DEFAULT_CONNECT_TIMEOUT_TICKS, DEFAULT_MAX_IN_FLIGHT, DEFAULT_STALL_TIMEOUT_TICKS,
};
use cardshare_core::DEFAULT_CHUNK_SIZE;

/// Node configuration. File: ~/.config/cardshare/config.toml or /etc/cardshare/config.toml.
/// Env overrides: CARDSHARE_PORT, CARDSHARE_CONNECT_TIMEOUT, CARDSHARE_STALL_TIMEOUT,
/// CARDSHARE_CHUNK_SIZE, CARDSHARE_MAX_IN_FLIGHT.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// TCP port `serve` listens on (default 45680).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds to wait for the channel and the first reply (default 15).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Seconds without chunk traffic before a transfer is stalled (default 30).
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,
    /// Binary frame payload size in bytes (default 16 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Unacknowledged bytes the sender may have in flight (default 1 MiB).
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u64,
}

fn default_port() -> u16 {
    45680
}
fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_TICKS
}
fn default_stall_timeout() -> u64 {
    DEFAULT_STALL_TIMEOUT_TICKS
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_max_in_flight() -> u64 {
    DEFAULT_MAX_IN_FLIGHT
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
            stall_timeout_secs: default_stall_timeout(),
            chunk_size: default_chunk_size(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl NodeConfig {
    /// Session config. The node ticks sessions once per second, so seconds map to ticks.
    pub fn session_config(&self) -> cardshare_core::Config {
        cardshare_core::Config {
            connect_timeout_ticks: self.connect_timeout_secs,
            stall_timeout_ticks: self.stall_timeout_secs,
            chunk_size: self.chunk_size,
            max_in_flight: self.max_in_flight,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> NodeConfig {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut NodeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("CARDSHARE_PORT").and_then(|s| s.parse().ok()) {
        c.port = p;
    }
    if let Some(t) = var("CARDSHARE_CONNECT_TIMEOUT").and_then(|s| s.parse().ok()) {
        c.connect_timeout_secs = t;
    }
    if let Some(t) = var("CARDSHARE_STALL_TIMEOUT").and_then(|s| s.parse().ok()) {
        c.stall_timeout_secs = t;
    }
    if let Some(n) = var("CARDSHARE_CHUNK_SIZE").and_then(|s| s.parse().ok()) {
        c.chunk_size = n;
    }
    if let Some(n) = var("CARDSHARE_MAX_IN_FLIGHT").and_then(|s| s.parse().ok()) {
        c.max_in_flight = n;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/cardshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/cardshare/config.toml"));
    out
}

fn load_file() -> Option<NodeConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match load_from_path(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config");
            None
        }
    }
}

/// Parse one config file.
pub fn load_from_path(path: &Path) -> anyhow::Result<NodeConfig> {
    let s = std::fs::read_to_string(path)?;
    Ok(toml::from_str::<NodeConfig>(&s)?)
}
