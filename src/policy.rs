//! Routing policy caches and lookups
//!
//! The rule engine consults these before building a rule list:
//! - `DomainCache` / `IpCache`: which egress worked for a host/address
//!   recently, plus front-denial strikes per host
//! - `UserRules`: operator-pinned egress per host or address
//! - `GfwList`: white / block / advertisement host sets
//! - `IpRegion`: home-country address table

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cached egress verdict for a host or address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheRule {
    Front,
    Relay,
    Direct,
    /// Only meaningful as a user rule: drop the connection
    Black,
    Unknown,
}

impl CacheRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Front => "front",
            Self::Relay => "relay",
            Self::Direct => "direct",
            Self::Black => "black",
            Self::Unknown => "unknown",
        }
    }
}

/// Front-denial strikes expire after this window
const DENY_WINDOW: Duration = Duration::from_secs(600);
/// Strikes within the window before the front is avoided for a host
const DENY_LIMIT: u32 = 3;
/// Address cache entries go stale after this
const IP_CACHE_TTL: Duration = Duration::from_secs(3600);

struct DomainEntry {
    rule: CacheRule,
    deny_count: u32,
    last_deny: Option<Instant>,
    last_update: Instant,
}

/// Per-host egress memory
#[derive(Default)]
pub struct DomainCache {
    entries: Mutex<HashMap<String, DomainEntry>>,
}

impl DomainCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_rule(&self, host: &str) -> CacheRule {
        let entries = self.entries.lock().unwrap();
        entries.get(host).map(|e| e.rule).unwrap_or(CacheRule::Unknown)
    }

    pub fn set_rule(&self, host: &str, rule: CacheRule) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(host.to_string()).or_insert(DomainEntry {
            rule,
            deny_count: 0,
            last_deny: None,
            last_update: Instant::now(),
        });
        entry.rule = rule;
        entry.last_update = Instant::now();
    }

    /// Whether the fronted egress should still be offered this host
    pub fn accept_front(&self, host: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(host) {
            Some(entry) => {
                if let Some(last) = entry.last_deny {
                    if last.elapsed() > DENY_WINDOW {
                        entry.deny_count = 0;
                        entry.last_deny = None;
                    }
                }
                entry.deny_count < DENY_LIMIT
            }
            None => true,
        }
    }

    /// Record a front failure (TLS wrap or request parse) for a host
    pub fn report_front_deny(&self, host: &str) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(host.to_string()).or_insert(DomainEntry {
            rule: CacheRule::Unknown,
            deny_count: 0,
            last_deny: None,
            last_update: Instant::now(),
        });
        entry.deny_count += 1;
        entry.last_deny = Some(Instant::now());
    }

    pub fn snapshot(&self) -> Vec<(String, CacheRule, u32)> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .map(|(host, e)| (host.clone(), e.rule, e.deny_count))
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

struct IpEntry {
    rule: CacheRule,
    last_update: Instant,
}

/// Per-address egress memory with a TTL
#[derive(Default)]
pub struct IpCache {
    entries: Mutex<HashMap<IpAddr, IpEntry>>,
}

impl IpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached rule, or None when absent, stale, or unknown
    pub fn get(&self, ip: IpAddr) -> Option<CacheRule> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&ip) {
            Some(e) if e.last_update.elapsed() > IP_CACHE_TTL => {
                entries.remove(&ip);
                None
            }
            Some(e) if e.rule == CacheRule::Unknown => None,
            Some(e) => Some(e.rule),
            None => None,
        }
    }

    pub fn set_rule(&self, ip: IpAddr, rule: CacheRule) {
        self.entries.lock().unwrap().insert(
            ip,
            IpEntry {
                rule,
                last_update: Instant::now(),
            },
        );
    }

    pub fn snapshot(&self) -> Vec<(IpAddr, CacheRule)> {
        let entries = self.entries.lock().unwrap();
        entries.iter().map(|(ip, e)| (*ip, e.rule)).collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Operator-pinned egress per target
///
/// Keys are checked most-specific first: `host:port`, exact host, then
/// parent-domain suffixes.
#[derive(Default)]
pub struct UserRules {
    rules: Mutex<HashMap<String, CacheRule>>,
}

impl UserRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, target: &str, rule: CacheRule) {
        self.rules.lock().unwrap().insert(target.to_string(), rule);
    }

    pub fn check_host(&self, host: &str, port: u16) -> Option<CacheRule> {
        let rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.get(&format!("{}:{}", host, port)) {
            return Some(*rule);
        }
        if let Some(rule) = rules.get(host) {
            return Some(*rule);
        }
        let mut rest = host;
        while let Some(dot) = rest.find('.') {
            rest = &rest[dot + 1..];
            if let Some(rule) = rules.get(rest) {
                return Some(*rule);
            }
        }
        None
    }
}

/// Host classification sets
#[derive(Default)]
pub struct GfwList {
    white: HashSet<String>,
    block: HashSet<String>,
    advertisement: HashSet<String>,
}

impl GfwList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sets(
        white: HashSet<String>,
        block: HashSet<String>,
        advertisement: HashSet<String>,
    ) -> Self {
        Self {
            white,
            block,
            advertisement,
        }
    }

    pub fn in_white_list(&self, host: &str) -> bool {
        Self::match_suffix(&self.white, host)
    }

    pub fn in_block_list(&self, host: &str) -> bool {
        Self::match_suffix(&self.block, host)
    }

    pub fn is_advertisement(&self, host: &str) -> bool {
        Self::match_suffix(&self.advertisement, host)
    }

    fn match_suffix(set: &HashSet<String>, host: &str) -> bool {
        if set.contains(host) {
            return true;
        }
        let mut rest = host;
        while let Some(dot) = rest.find('.') {
            rest = &rest[dot + 1..];
            if set.contains(rest) {
                return true;
            }
        }
        false
    }
}

/// Home-country address lookup
pub trait IpRegion: Send + Sync {
    fn check_ip(&self, ip: IpAddr) -> bool;

    fn check_ips(&self, ips: &[IpAddr]) -> bool {
        ips.iter().any(|ip| self.check_ip(*ip))
    }
}

/// CIDR table implementation of [`IpRegion`]
#[derive(Default)]
pub struct CidrTable {
    /// (network, prefix_len), IPv4 only; v6 answers are never "home"
    nets: Vec<(Ipv4Addr, u8)>,
}

impl CidrTable {
    pub fn new(nets: Vec<(Ipv4Addr, u8)>) -> Self {
        Self { nets }
    }
}

impl IpRegion for CidrTable {
    fn check_ip(&self, ip: IpAddr) -> bool {
        let IpAddr::V4(v4) = ip else {
            return false;
        };
        let addr = u32::from(v4);
        self.nets.iter().any(|(net, prefix)| {
            let mask = if *prefix == 0 {
                0
            } else {
                u32::MAX << (32 - *prefix)
            };
            (addr & mask) == (u32::from(*net) & mask)
        })
    }
}

/// RFC 1918 / loopback / link-local check
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Is the host an IP literal?
pub fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    host.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_cache_deny_strikes() {
        let cache = DomainCache::new();
        assert!(cache.accept_front("x.com"));
        for _ in 0..DENY_LIMIT {
            cache.report_front_deny("x.com");
        }
        assert!(!cache.accept_front("x.com"));
        assert!(cache.accept_front("y.com"));
    }

    #[test]
    fn test_ip_cache_unknown_is_absent() {
        let cache = IpCache::new();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(cache.get(ip), None);
        cache.set_rule(ip, CacheRule::Unknown);
        assert_eq!(cache.get(ip), None);
        cache.set_rule(ip, CacheRule::Relay);
        assert_eq!(cache.get(ip), Some(CacheRule::Relay));
    }

    #[test]
    fn test_user_rules_specificity() {
        let rules = UserRules::new();
        rules.add("example.com", CacheRule::Direct);
        rules.add("api.example.com:443", CacheRule::Relay);
        assert_eq!(
            rules.check_host("api.example.com", 443),
            Some(CacheRule::Relay)
        );
        assert_eq!(
            rules.check_host("api.example.com", 80),
            Some(CacheRule::Direct)
        );
        assert_eq!(
            rules.check_host("deep.sub.example.com", 80),
            Some(CacheRule::Direct)
        );
        assert_eq!(rules.check_host("other.net", 80), None);
    }

    #[test]
    fn test_gfwlist_suffix_match() {
        let mut block = HashSet::new();
        block.insert("blocked.example".to_string());
        let list = GfwList::from_sets(HashSet::new(), block, HashSet::new());
        assert!(list.in_block_list("blocked.example"));
        assert!(list.in_block_list("cdn.blocked.example"));
        assert!(!list.in_block_list("notblocked.example"));
    }

    #[test]
    fn test_cidr_table() {
        let table = CidrTable::new(vec![("10.0.0.0".parse().unwrap(), 8)]);
        assert!(table.check_ip("10.1.2.3".parse().unwrap()));
        assert!(!table.check_ip("11.1.2.3".parse().unwrap()));
        assert!(!table.check_ip("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_private_ip() {
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
    }
}
