use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::peers::parse_peer_id;

/// Top-level configuration for the ZTP daemon.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub keys: KeyConfig,
    #[serde(default)]
    pub transition: TransitionConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// Daemon identity and underlay settings.
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// This ZTP's underlay identity, format `"<IA>,<IP>"`.
    #[serde(default)]
    pub local_addr: String,
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    #[serde(default)]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            local_addr: String::new(),
            data_port: default_data_port(),
            log_level: "info".to_string(),
        }
    }
}

/// Key hierarchy settings.
#[derive(Debug, Deserialize, Clone)]
pub struct KeyConfig {
    /// Byte length K of all derived keys (16 or 32).
    #[serde(default = "default_key_length")]
    pub key_length: usize,
    /// Lifetime of L0 and fallback lifetime of fetched L1 entries.
    #[serde(default = "default_key_ttl")]
    pub key_ttl_secs: u64,
    /// Period at which expired cache entries are swept.
    #[serde(default = "default_key_purge_interval")]
    pub key_purge_interval_secs: u64,
    /// L1 key service listener port.
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Accepted clock skew for the IR timestamp.
    #[serde(default = "default_max_time_diff")]
    pub max_time_diff_secs: u64,
    /// Deadline for one remote L1 fetch.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            key_length: default_key_length(),
            key_ttl_secs: default_key_ttl(),
            key_purge_interval_secs: default_key_purge_interval(),
            server_port: default_server_port(),
            max_time_diff_secs: default_max_time_diff(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

impl KeyConfig {
    pub fn key_ttl(&self) -> Duration {
        Duration::from_secs(self.key_ttl_secs)
    }

    pub fn key_purge_interval(&self) -> Duration {
        Duration::from_secs(self.key_purge_interval_secs)
    }

    pub fn max_time_diff(&self) -> Duration {
        Duration::from_secs(self.max_time_diff_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Zone transition policy settings.
#[derive(Debug, Deserialize, Clone)]
pub struct TransitionConfig {
    /// Policy controller base address (`host:port`).
    #[serde(default)]
    pub controller_addr: String,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Admit a denied packet when the reverse flow was recently permitted.
    /// Softens the allow-set for bidirectional flows; off unless opted in.
    #[serde(default)]
    pub flow_bypass: bool,
    #[serde(default = "default_flow_bypass_ttl")]
    pub flow_bypass_ttl_secs: u64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            controller_addr: String::new(),
            refresh_interval_secs: default_refresh_interval(),
            flow_bypass: false,
            flow_bypass_ttl_secs: default_flow_bypass_ttl(),
        }
    }
}

impl TransitionConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn flow_bypass_ttl(&self) -> Duration {
        Duration::from_secs(self.flow_bypass_ttl_secs)
    }
}

/// Local tunnel endpoints bridging the LAN side.
#[derive(Debug, Deserialize, Clone)]
pub struct TunnelConfig {
    /// Where decrypted and intra-site packets are forwarded.
    #[serde(default = "default_forward_addr")]
    pub forward_addr: SocketAddr,
    /// Where cleartext egress packets are read from.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            forward_addr: default_forward_addr(),
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

/// One remote ZTP.
#[derive(Debug, Deserialize, Clone)]
pub struct PeerConfig {
    pub id: String,
    #[serde(default = "default_data_port")]
    pub data_port: u16,
}

fn default_data_port() -> u16 {
    30041
}
fn default_key_length() -> usize {
    16
}
fn default_key_ttl() -> u64 {
    86400
}
fn default_key_purge_interval() -> u64 {
    86400
}
fn default_server_port() -> u16 {
    9090
}
fn default_max_time_diff() -> u64 {
    1
}
fn default_fetch_timeout() -> u64 {
    5
}
fn default_refresh_interval() -> u64 {
    10
}
fn default_flow_bypass_ttl() -> u64 {
    2
}
fn default_forward_addr() -> SocketAddr {
    "127.0.0.1:30099".parse().unwrap()
}
fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:30098".parse().unwrap()
}
fn default_metrics_port() -> u16 {
    9100
}

/// Upper bound on the established-flow bypass window.
const MAX_FLOW_BYPASS_TTL: u64 = 10;

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("Failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from default paths or return default config.
    pub fn load_or_default() -> Self {
        let paths = ["/etc/ztpd/config.toml", "~/.ztpd/config.toml", "./config.toml"];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(config) = Self::load(&expanded) {
                    return config;
                }
            }
        }

        Self::default()
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.keys.key_length != 16 && self.keys.key_length != 32 {
            anyhow::bail!(
                "key_length must be 16 or 32, got {}",
                self.keys.key_length
            );
        }
        parse_peer_id(&self.daemon.local_addr)
            .map_err(|e| anyhow::anyhow!("local_addr: {}", e))?;
        for peer in &self.peers {
            parse_peer_id(&peer.id).map_err(|e| anyhow::anyhow!("peer {:?}: {}", peer.id, e))?;
        }
        if self.transition.controller_addr.is_empty() {
            anyhow::bail!("controller_addr must be set");
        }
        if self.transition.flow_bypass_ttl_secs > MAX_FLOW_BYPASS_TTL {
            anyhow::bail!(
                "flow_bypass_ttl_secs must be at most {}, got {}",
                MAX_FLOW_BYPASS_TTL,
                self.transition.flow_bypass_ttl_secs
            );
        }
        Ok(())
    }
}
