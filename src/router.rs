//! Smart routing
//!
//! Classifies each inbound connection, builds a prioritized list of
//! egress rules from the policy caches and configuration, and walks
//! the list until an adapter carries the connection. Every adapter
//! failure is a typed outcome; only `Fatal` stops the walk early.

use crate::config::RouteConfig;
use crate::context::Context;
use crate::egress::{self, RouteOutcome};
use crate::policy::{is_private_ip, parse_ip_literal, CacheRule};
use crate::session::Session;
use crate::sniff::{sniff_host, PeekableStream};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// An egress to try, in list order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Direct,
    Direct6,
    RedirectHttps,
    Front,
    Relay,
    Black,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Direct6 => "direct6",
            Self::RedirectHttps => "redirect_https",
            Self::Front => "front",
            Self::Relay => "relay",
            Self::Black => "black",
        }
    }
}

/// How a domain classifies before rule-list construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainClass {
    /// A cache verdict exists
    Cached(CacheRule),
    /// Home country, host on the white list
    HomeWhite,
    /// Home country, host on the block list
    HomeBlocked { prefer_relay: bool },
    /// Home country, recursive DNS answers stay in the home region
    HomeResolved,
    /// Home country, nothing known
    HomeDefault,
    /// Any other country
    Abroad,
}

/// Rule list for a domain target
pub fn domain_rule_list(class: DomainClass) -> Vec<Rule> {
    use Rule::*;
    match class {
        DomainClass::Cached(CacheRule::Front) => vec![Front, Relay, RedirectHttps, Direct],
        DomainClass::Cached(CacheRule::Relay) => vec![Relay, Front, RedirectHttps, Direct],
        DomainClass::Cached(_) => vec![Direct, Front, Relay, RedirectHttps],
        DomainClass::HomeWhite => vec![Direct, Front, Relay, RedirectHttps],
        DomainClass::HomeBlocked { prefer_relay: true } => {
            vec![Relay, RedirectHttps, Direct, Front]
        }
        DomainClass::HomeBlocked { prefer_relay: false } => {
            vec![Front, Relay, RedirectHttps, Direct]
        }
        DomainClass::HomeResolved => vec![Direct, Relay, RedirectHttps],
        DomainClass::HomeDefault => vec![Direct, Front, Relay, RedirectHttps],
        DomainClass::Abroad => vec![Direct, Relay, Front, RedirectHttps],
    }
}

/// Rule list for a bare address target
pub fn ip_rule_list(cached: Option<CacheRule>, home_region: bool) -> Vec<Rule> {
    use Rule::*;
    match cached {
        Some(CacheRule::Front) => vec![Front, Relay, Direct],
        Some(CacheRule::Relay) => vec![Relay, Front, Direct],
        Some(_) => vec![Direct, Front, Relay],
        None if home_region => vec![Direct, Relay],
        None => vec![Direct, Front, Relay],
    }
}

/// Configuration filters, applied after list construction:
/// no-direct strips both plain and TLS-redirect egress, direct6 slots
/// in ahead of direct, and the front drops when it would have to fake
/// a certificate it may not
pub fn filter_rules(route: &RouteConfig, port: u16, rules: &mut Vec<Rule>) {
    if !route.auto_direct {
        rules.retain(|r| *r != Rule::Direct && *r != Rule::RedirectHttps);
    } else if route.auto_direct6 {
        if let Some(pos) = rules.iter().position(|r| *r == Rule::Direct) {
            rules.insert(pos, Rule::Direct6);
        }
    }

    if (!route.enable_fake_ca && port == 443) || !route.auto_front {
        rules.retain(|r| *r != Rule::Front);
    }
}

fn user_rule_to_rule(rule: CacheRule) -> Option<Rule> {
    match rule {
        CacheRule::Front => Some(Rule::Front),
        CacheRule::Relay => Some(Rule::Relay),
        CacheRule::Direct => Some(Rule::Direct),
        CacheRule::Black => Some(Rule::Black),
        CacheRule::Unknown => None,
    }
}

pub struct Router {
    ctx: Arc<Context>,
    session: Arc<Session>,
}

impl Router {
    pub fn new(ctx: Arc<Context>, session: Arc<Session>) -> Self {
        Self { ctx, session }
    }

    /// Entry for a connection whose destination is a bare address
    pub async fn handle_ip_proxy(
        &self,
        mut stream: PeekableStream,
        ip: IpAddr,
        port: u16,
        client: SocketAddr,
    ) {
        debug!("connect to {}:{} from {}", ip, port, client);

        let mut rule = self
            .ctx
            .user_rules
            .check_host(&ip.to_string(), port)
            .and_then(user_rule_to_rule);
        if rule.is_none() && is_private_ip(ip) {
            rule = Some(Rule::Direct);
        }
        if let Some(rule) = rule {
            self.try_loop("ip user", vec![rule], stream, &ip.to_string(), port, Some(ip))
                .await;
            return;
        }

        // a host name in the first bytes upgrades this to a domain route
        match sniff_host(&mut stream).await {
            Ok(host) => {
                return self.handle_domain_proxy(stream, host, port, client).await;
            }
            Err(e) => debug!("ip:{}:{} sniff fail: {}", ip, port, e),
        }

        let mut rules = ip_rule_list(self.ctx.ip_cache.get(ip), self.ctx.ip_region.check_ip(ip));
        filter_rules(&self.ctx.config().route, port, &mut rules);

        self.try_loop("ip", rules, stream, &ip.to_string(), port, Some(ip))
            .await;
    }

    /// Entry for a connection with a known destination host name
    pub async fn handle_domain_proxy(
        &self,
        mut stream: PeekableStream,
        host: String,
        port: u16,
        client: SocketAddr,
    ) {
        let fake_host = self.ctx.front.as_ref().and_then(|f| f.fake_host());

        let mut rule = self
            .ctx
            .user_rules
            .check_host(&host, port)
            .and_then(user_rule_to_rule);
        if rule.is_none() {
            if fake_host.as_deref() == Some(host.as_str()) {
                rule = Some(Rule::Front);
            } else if parse_ip_literal(&host).map(is_private_ip).unwrap_or(false) {
                rule = Some(Rule::Direct);
            }
        }
        if let Some(rule) = rule {
            self.try_loop("domain user", vec![rule], stream, &host, port, None)
                .await;
            return;
        }

        let config = self.ctx.config();
        if config.route.block_advertisement && self.ctx.gfwlist.is_advertisement(&host) {
            info!("block advertisement {}:{}", host, port);
            let _ = stream.shutdown().await;
            return;
        }

        let class = self.classify_domain(&host, &config.route).await;
        let mut rules = domain_rule_list(class);

        if !self.ctx.domain_cache.accept_front(&host) {
            rules.retain(|r| *r != Rule::Front);
        }
        filter_rules(&config.route, port, &mut rules);

        debug!(
            "connect to {}:{} from {}, rules:{:?}",
            host,
            port,
            client,
            rules.iter().map(Rule::as_str).collect::<Vec<_>>()
        );
        self.try_loop("domain", rules, stream, &host, port, None).await;
    }

    async fn classify_domain(&self, host: &str, route: &RouteConfig) -> DomainClass {
        let cached = self.ctx.domain_cache.get_rule(host);
        if cached != CacheRule::Unknown {
            return DomainClass::Cached(cached);
        }

        if route.country_code != "CN" {
            return DomainClass::Abroad;
        }

        if self.ctx.gfwlist.in_white_list(host) {
            return DomainClass::HomeWhite;
        }
        if self.ctx.gfwlist.in_block_list(host) {
            return DomainClass::HomeBlocked {
                prefer_relay: route.pac_policy == "black_relay",
            };
        }

        let ips = self.ctx.resolver.query_recursively(host).await;
        if self.ctx.ip_region.check_ips(&ips) {
            DomainClass::HomeResolved
        } else {
            DomainClass::HomeDefault
        }
    }

    /// Walk the rule list until one adapter carries the connection
    async fn try_loop(
        &self,
        scene: &str,
        rules: Vec<Rule>,
        stream: PeekableStream,
        host: &str,
        port: u16,
        ip: Option<IpAddr>,
    ) {
        let mut stream = Some(stream);

        for rule in &rules {
            let Some(current) = stream.take() else {
                return;
            };
            let outcome = self.dispatch(*rule, current, host, port).await;
            match outcome {
                RouteOutcome::Handled => {
                    info!("{} {}:{} via {}", scene, host, port, rule.as_str());
                    self.record_success(*rule, host, ip);
                    return;
                }
                RouteOutcome::TryNext { stream: s, reason } => {
                    debug!("{} {}:{} {} -> {}", scene, host, port, rule.as_str(), reason);
                    stream = Some(s);
                }
                RouteOutcome::Fatal { reason } => {
                    warn!("{} {}:{} {}: {}", scene, host, port, rule.as_str(), reason);
                    return;
                }
            }
        }

        info!("{} to {}:{} all rules fail", scene, host, port);
        if let Some(mut s) = stream {
            let _ = s.shutdown().await;
        }
    }

    async fn dispatch(
        &self,
        rule: Rule,
        stream: PeekableStream,
        host: &str,
        port: u16,
    ) -> RouteOutcome {
        match rule {
            // parked: tables still place it, a future toggle re-enables
            Rule::RedirectHttps => RouteOutcome::TryNext {
                stream,
                reason: egress::RouteError::Parked,
            },
            Rule::Direct => egress::do_direct(&self.ctx, stream, host, port).await,
            Rule::Direct6 => egress::do_direct6(&self.ctx, stream, host, port).await,
            Rule::Relay => egress::do_relay(&self.ctx, &self.session, stream, host, port).await,
            Rule::Front => {
                let fake_host = self.ctx.front.as_ref().and_then(|f| f.fake_host());
                let workable = self
                    .ctx
                    .front
                    .as_ref()
                    .map(|f| f.is_workable())
                    .unwrap_or(false);
                if !workable && fake_host.as_deref() != Some(host) {
                    return RouteOutcome::TryNext {
                        stream,
                        reason: egress::RouteError::FrontNotWorkable,
                    };
                }
                if !self.ctx.domain_cache.accept_front(host) {
                    return RouteOutcome::TryNext {
                        stream,
                        reason: egress::RouteError::FrontDenied,
                    };
                }
                egress::do_front(&self.ctx, &self.session, stream, host, port).await
            }
            Rule::Black => {
                info!("{}:{} black", host, port);
                egress::do_black(stream).await
            }
        }
    }

    /// Remember which egress worked so the next connection starts there
    fn record_success(&self, rule: Rule, host: &str, ip: Option<IpAddr>) {
        let cached = match rule {
            Rule::Direct | Rule::Direct6 => CacheRule::Direct,
            Rule::Front => CacheRule::Front,
            Rule::Relay => CacheRule::Relay,
            _ => return,
        };
        match ip {
            Some(ip) => self.ctx.ip_cache.set_rule(ip, cached),
            None => self.ctx.domain_cache.set_rule(host, cached),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;

    fn cn_route() -> RouteConfig {
        RouteConfig {
            auto_direct: true,
            auto_direct6: false,
            auto_front: true,
            enable_fake_ca: true,
            block_advertisement: false,
            pac_policy: "smart".to_string(),
            country_code: "CN".to_string(),
        }
    }

    #[test]
    fn test_white_list_host_port_443() {
        let mut rules = domain_rule_list(DomainClass::HomeWhite);
        filter_rules(&cn_route(), 443, &mut rules);
        assert_eq!(
            rules,
            vec![Rule::Direct, Rule::Front, Rule::Relay, Rule::RedirectHttps]
        );
    }

    #[test]
    fn test_no_auto_direct_strips_both_direct_paths() {
        let mut route = cn_route();
        route.auto_direct = false;
        let mut rules = domain_rule_list(DomainClass::HomeWhite);
        filter_rules(&route, 443, &mut rules);
        assert_eq!(rules, vec![Rule::Front, Rule::Relay]);
    }

    #[test]
    fn test_no_fake_ca_drops_front_on_443_only() {
        let mut route = cn_route();
        route.enable_fake_ca = false;

        let mut rules = domain_rule_list(DomainClass::HomeWhite);
        filter_rules(&route, 443, &mut rules);
        assert!(!rules.contains(&Rule::Front));

        let mut rules = domain_rule_list(DomainClass::HomeWhite);
        filter_rules(&route, 80, &mut rules);
        assert!(rules.contains(&Rule::Front));
    }

    #[test]
    fn test_no_auto_front_drops_front_everywhere() {
        let mut route = cn_route();
        route.auto_front = false;
        let mut rules = domain_rule_list(DomainClass::HomeDefault);
        filter_rules(&route, 80, &mut rules);
        assert!(!rules.contains(&Rule::Front));
    }

    #[test]
    fn test_direct6_slots_ahead_of_direct() {
        let mut route = cn_route();
        route.auto_direct6 = true;
        let mut rules = domain_rule_list(DomainClass::HomeResolved);
        filter_rules(&route, 80, &mut rules);
        assert_eq!(
            rules,
            vec![
                Rule::Direct6,
                Rule::Direct,
                Rule::Relay,
                Rule::RedirectHttps
            ]
        );
    }

    #[test]
    fn test_blocked_host_prefers_relay_under_policy() {
        assert_eq!(
            domain_rule_list(DomainClass::HomeBlocked { prefer_relay: true }),
            vec![Rule::Relay, Rule::RedirectHttps, Rule::Direct, Rule::Front]
        );
        assert_eq!(
            domain_rule_list(DomainClass::HomeBlocked {
                prefer_relay: false
            }),
            vec![Rule::Front, Rule::Relay, Rule::RedirectHttps, Rule::Direct]
        );
    }

    #[test]
    fn test_cached_verdicts_lead_their_lists() {
        assert_eq!(
            domain_rule_list(DomainClass::Cached(CacheRule::Front))[0],
            Rule::Front
        );
        assert_eq!(
            domain_rule_list(DomainClass::Cached(CacheRule::Relay))[0],
            Rule::Relay
        );
        assert_eq!(
            domain_rule_list(DomainClass::Cached(CacheRule::Direct))[0],
            Rule::Direct
        );
    }

    #[test]
    fn test_ip_lists() {
        assert_eq!(
            ip_rule_list(Some(CacheRule::Front), false),
            vec![Rule::Front, Rule::Relay, Rule::Direct]
        );
        assert_eq!(
            ip_rule_list(Some(CacheRule::Relay), false),
            vec![Rule::Relay, Rule::Front, Rule::Direct]
        );
        assert_eq!(ip_rule_list(None, true), vec![Rule::Direct, Rule::Relay]);
        assert_eq!(
            ip_rule_list(None, false),
            vec![Rule::Direct, Rule::Front, Rule::Relay]
        );
    }
}
