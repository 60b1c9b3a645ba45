//! Upstream connect manager
//!
//! Hands out connected upstream sockets for the direct and
//! redirect-https egress paths. Tries each resolved address in turn
//! with a per-attempt timeout; the first one that answers wins.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// A connected upstream socket plus the address that answered
pub struct PooledStream {
    pub stream: TcpStream,
    pub ip: IpAddr,
}

pub struct ConnectManager {
    connect_timeout: Duration,
}

impl ConnectManager {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Connect to the first answering address, or None if all fail
    pub async fn get_conn(&self, host: &str, ips: &[IpAddr], port: u16) -> Option<PooledStream> {
        for ip in ips {
            let addr = SocketAddr::new(*ip, port);
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Some(PooledStream { stream, ip: *ip });
                }
                Ok(Err(e)) => {
                    debug!("connect {}:{} ({}) fail: {}", host, port, ip, e);
                }
                Err(_) => {
                    debug!("connect {}:{} ({}) timeout", host, port, ip);
                }
            }
        }
        None
    }
}

impl Default for ConnectManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let manager = ConnectManager::default();
        let conn = manager
            .get_conn("localhost", &[addr.ip()], addr.port())
            .await
            .expect("connect");
        assert_eq!(conn.ip, addr.ip());
    }

    #[tokio::test]
    async fn test_no_ips_yields_none() {
        let manager = ConnectManager::default();
        assert!(manager.get_conn("nowhere", &[], 80).await.is_none());
    }
}
