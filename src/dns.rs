//! DNS queries for the rule engine and the direct egress
//!
//! Wraps the system resolver. Lookups are blocking syscalls, so they
//! run on the blocking pool. IP literals short-circuit without a
//! lookup.

use std::net::IpAddr;
use tokio::task;
use tracing::debug;

/// Which address family a query wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFamily {
    V4,
    V6,
    Both,
}

pub struct Resolver;

impl Resolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a host to addresses of the requested family
    pub async fn query(&self, host: &str, family: QueryFamily) -> Vec<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return match (family, ip) {
                (QueryFamily::V4, IpAddr::V6(_)) | (QueryFamily::V6, IpAddr::V4(_)) => vec![],
                _ => vec![ip],
            };
        }

        let name = host.to_string();
        let ips = task::spawn_blocking(move || dns_lookup::lookup_host(&name))
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();

        let filtered: Vec<IpAddr> = ips
            .into_iter()
            .filter(|ip| match family {
                QueryFamily::V4 => ip.is_ipv4(),
                QueryFamily::V6 => ip.is_ipv6(),
                QueryFamily::Both => true,
            })
            .collect();

        debug!("dns {} -> {} addrs", host, filtered.len());
        filtered
    }

    /// Resolve bypassing local forwarders where possible
    ///
    /// The system resolver is the best this build can do; a poisoned
    /// local forwarder shows up as a non-home-region answer, which the
    /// rule tables already treat as suspicious.
    pub async fn query_recursively(&self, host: &str) -> Vec<IpAddr> {
        self.query(host, QueryFamily::V4).await
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Probe whether this machine has a usable public IPv6 route
pub fn probe_ipv6() -> bool {
    use std::net::UdpSocket;
    match UdpSocket::bind("[::]:0") {
        Ok(sock) => sock.connect("[2001:4860:4860::8888]:53").is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ip_literal_short_circuits() {
        let resolver = Resolver::new();
        let ips = resolver.query("192.0.2.7", QueryFamily::Both).await;
        assert_eq!(ips, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_family_filter_on_literal() {
        let resolver = Resolver::new();
        assert!(resolver.query("192.0.2.7", QueryFamily::V6).await.is_empty());
        assert!(resolver.query("2001:db8::1", QueryFamily::V4).await.is_empty());
    }
}
