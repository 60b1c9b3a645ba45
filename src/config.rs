//! Daemon configuration
//!
//! A single JSON file, read on startup and rewritten whenever a setting
//! changes. Missing fields fall back to defaults so old files keep
//! loading across upgrades.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Charon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local proxy listener
    pub listen_host: String,
    pub listen_port: u16,

    /// Control socket path
    pub socket_path: String,

    /// Tunnel transport tuning
    pub tunnel: TunnelConfig,

    /// Routing behavior
    pub route: RouteConfig,

    /// Account and servers
    pub account: AccountConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Cap per round-trip payload (bytes)
    pub max_payload: u32,

    /// Delay before flushing buffered upload data (ms)
    pub send_delay: u16,

    /// Delay before piggybacking a bare ack (ms)
    pub ack_delay: u16,

    /// Retransmit an unacked payload after this long (ms)
    pub resend_timeout: u16,

    /// Per-connection receive window (bytes)
    pub window_size: u32,

    /// Emit a position ack every this many received bytes
    pub window_ack: u32,

    /// Round-trip worker pool size
    pub concurrent_thread_num: usize,

    /// Workers kept in flight even when idle
    pub min_on_road: usize,

    /// Server-side long-poll hold (s)
    pub roundtrip_timeout: u64,

    /// Network layer timeout added on top of the server hold (s)
    pub network_timeout: u64,

    /// Encrypt wire bodies
    pub encrypt_data: bool,
    pub encrypt_password: String,
    pub encrypt_method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Try direct / redirect-https egress
    pub auto_direct: bool,

    /// Insert an IPv6-only direct attempt ahead of direct
    pub auto_direct6: bool,

    /// Try the CDN-fronted egress
    pub auto_front: bool,

    /// Allow on-the-fly CA certificates for TLS interception on the front
    pub enable_fake_ca: bool,

    /// Drop connections to ad-listed hosts
    pub block_advertisement: bool,

    /// Rule-list policy; "black_relay" prefers the relay for blocked hosts
    pub pac_policy: String,

    /// Two-letter home country code
    pub country_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub login_account: String,
    pub login_password: String,

    /// Account API endpoint, e.g. "https://api.example.net"
    pub api_server: String,

    /// Pinned relay server; overrides whatever the API hands back
    pub server_host: String,
    pub server_port: u16,

    /// Report relay front health upstream
    pub enable_tls_relay: bool,

    /// Seconds between reporter runs
    pub report_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8086,
            socket_path: "/run/charon/charon.sock".to_string(),
            tunnel: TunnelConfig::default(),
            route: RouteConfig::default(),
            account: AccountConfig::default(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_payload: 8192,
            send_delay: 100,
            ack_delay: 300,
            resend_timeout: 5000,
            window_size: 2 * 1024 * 1024,
            window_ack: 64 * 1024,
            concurrent_thread_num: 20,
            min_on_road: 2,
            roundtrip_timeout: 25,
            network_timeout: 15,
            encrypt_data: false,
            encrypt_password: String::new(),
            encrypt_method: "chacha20-poly1305".to_string(),
        }
    }
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            auto_direct: true,
            auto_direct6: false,
            auto_front: true,
            enable_fake_ca: false,
            block_advertisement: false,
            pac_policy: "smart".to_string(),
            country_code: "CN".to_string(),
        }
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            login_account: String::new(),
            login_password: String::new(),
            api_server: String::new(),
            server_host: String::new(),
            server_port: 443,
            enable_tls_relay: false,
            report_interval: 600,
        }
    }
}

impl TunnelConfig {
    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay as u64)
    }

    pub fn ack_delay(&self) -> Duration {
        Duration::from_millis(self.ack_delay as u64)
    }

    pub fn resend_timeout(&self) -> Duration {
        Duration::from_millis(self.resend_timeout as u64)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            // Create default config
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, &content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tunnel.max_payload, config.tunnel.max_payload);
        assert_eq!(back.route.country_code, config.route.country_code);
    }

    #[test]
    fn test_partial_file_upgrades() {
        let back: Config = serde_json::from_str(r#"{"listen_port": 9999}"#).unwrap();
        assert_eq!(back.listen_port, 9999);
        assert_eq!(back.tunnel.concurrent_thread_num, 20);
    }
}
