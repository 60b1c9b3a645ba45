//! Shared daemon state
//!
//! One `Context` is built at startup and threaded through the router,
//! the session and the control surface. Nothing here is a process
//! global; the only process-wide state in the daemon is the tracing
//! subscriber.

use crate::config::Config;
use crate::crypto::Encryptor;
use crate::dns::Resolver;
use crate::egress::Front;
use crate::policy::{CidrTable, DomainCache, GfwList, IpCache, IpRegion, UserRules};
use crate::pool::ConnectManager;
use crate::stats::Stats;
use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

pub struct Context {
    pub config: RwLock<Config>,
    pub config_path: PathBuf,

    pub http: reqwest::Client,
    pub resolver: Resolver,
    pub pool: ConnectManager,

    pub domain_cache: DomainCache,
    pub ip_cache: IpCache,
    pub user_rules: UserRules,
    pub gfwlist: GfwList,
    pub ip_region: Box<dyn IpRegion>,

    /// The CDN-fronted egress, when one is plugged in
    pub front: Option<Arc<dyn Front>>,

    pub stats: Stats,
    pub ipv6_ready: AtomicBool,

    /// Relay server "host:port", handed back by the account API or
    /// pinned in config; None until a login succeeds
    pub server_host: RwLock<Option<String>>,
    pub last_api_error: Mutex<String>,
    /// Remaining traffic quota (bytes); counts down per round trip
    pub quota: AtomicI64,
    pub balance: Mutex<f64>,
    /// Serializes the whole login path
    pub login_lock: tokio::sync::Mutex<()>,

    pub relay_front: RelayFrontState,
}

impl Context {
    pub fn new(config: Config, config_path: PathBuf) -> Self {
        let network_timeout = Duration::from_secs(config.tunnel.network_timeout);
        let http = reqwest::Client::builder()
            .connect_timeout(network_timeout)
            .build()
            .unwrap_or_default();

        let server_host = if config.account.server_host.is_empty() {
            None
        } else {
            Some(format!(
                "{}:{}",
                config.account.server_host, config.account.server_port
            ))
        };

        Self {
            config: RwLock::new(config),
            config_path,
            http,
            resolver: Resolver::new(),
            pool: ConnectManager::new(Duration::from_secs(5)),
            domain_cache: DomainCache::new(),
            ip_cache: IpCache::new(),
            user_rules: UserRules::new(),
            gfwlist: GfwList::new(),
            ip_region: Box::new(CidrTable::default()),
            front: None,
            stats: Stats::new(),
            ipv6_ready: AtomicBool::new(false),
            server_host: RwLock::new(server_host),
            last_api_error: Mutex::new(String::new()),
            quota: AtomicI64::new(0),
            balance: Mutex::new(0.0),
            login_lock: tokio::sync::Mutex::new(()),
            relay_front: RelayFrontState::new(),
        }
    }

    pub fn config(&self) -> Config {
        self.config.read().unwrap().clone()
    }

    /// Wire encryptor for the current settings; passthrough when
    /// encryption is off
    pub fn encryptor(&self) -> Result<Encryptor> {
        let config = self.config.read().unwrap();
        if !config.tunnel.encrypt_data {
            return Ok(Encryptor::None);
        }
        Encryptor::new(
            &config.tunnel.encrypt_method,
            &config.tunnel.encrypt_password,
        )
    }

    pub fn server_host(&self) -> Option<String> {
        self.server_host.read().unwrap().clone()
    }

    pub fn set_server_host(&self, host: Option<String>) {
        *self.server_host.write().unwrap() = host;
    }

    pub fn set_api_error(&self, message: impl Into<String>) {
        *self.last_api_error.lock().unwrap() = message.into();
    }

    pub fn last_api_error(&self) -> String {
        self.last_api_error.lock().unwrap().clone()
    }

    pub fn charge_quota(&self, bytes: i64) {
        let left = self.quota.fetch_sub(bytes, Ordering::Relaxed) - bytes;
        if left < 0 {
            self.quota.store(0, Ordering::Relaxed);
        }
    }

    pub fn ipv6_ready(&self) -> bool {
        self.ipv6_ready.load(Ordering::Relaxed)
    }
}

/// Health of the TLS relay front addresses, fed by the reporter
pub struct RelayFrontState {
    ip_fails: Mutex<HashMap<String, u32>>,
}

impl RelayFrontState {
    pub fn new() -> Self {
        Self {
            ip_fails: Mutex::new(HashMap::new()),
        }
    }

    /// Any address with zero recorded failures?
    pub fn has_good_ip(&self) -> bool {
        self.ip_fails.lock().unwrap().values().any(|f| *f == 0)
    }

    pub fn set_ips(&self, ips: Vec<String>) {
        let mut dict = self.ip_fails.lock().unwrap();
        dict.clear();
        for ip in ips {
            dict.insert(ip, 0);
        }
    }

    pub fn report_fail(&self, ip: &str) {
        let mut dict = self.ip_fails.lock().unwrap();
        if let Some(fails) = dict.get_mut(ip) {
            *fails += 1;
        }
    }

    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.ip_fails.lock().unwrap().clone()
    }
}

impl Default for RelayFrontState {
    fn default() -> Self {
        Self::new()
    }
}
