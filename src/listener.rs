//! Local proxy listener
//!
//! Accepts application connections on the configured port, speaks just
//! enough SOCKS5 (no auth, CONNECT) to learn the destination, then
//! hands the socket to the router. Domain destinations go straight to
//! the domain entry; bare addresses let the router sniff for a host
//! name first.

use crate::context::Context;
use crate::router::Router;
use crate::sniff::PeekableStream;
use crate::stats::Stats;
use anyhow::{anyhow, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

const SOCKS_VERSION: u8 = 5;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

pub async fn run_listener(ctx: Arc<Context>, router: Arc<Router>) -> Result<()> {
    let config = ctx.config();
    let listener = TcpListener::bind((config.listen_host.as_str(), config.listen_port)).await?;
    info!(
        "listening on {}:{}",
        config.listen_host, config.listen_port
    );

    loop {
        match listener.accept().await {
            Ok((stream, client)) => {
                Stats::incr(&ctx.stats.handle_num);
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(router, stream, client).await {
                        debug!("client {} fail: {}", client, e);
                    }
                });
            }
            Err(e) => error!("accept fail: {}", e),
        }
    }
}

/// What a SOCKS request asked us to reach
enum Target {
    Ip(IpAddr),
    Domain(String),
}

async fn handle_client(
    router: Arc<Router>,
    mut stream: TcpStream,
    client: SocketAddr,
) -> Result<()> {
    let _ = stream.set_nodelay(true);

    let (target, port) = socks_handshake(&mut stream).await?;
    let stream = PeekableStream::new(stream);

    match target {
        Target::Domain(host) => router.handle_domain_proxy(stream, host, port, client).await,
        Target::Ip(ip) => router.handle_ip_proxy(stream, ip, port, client).await,
    }
    Ok(())
}

async fn socks_handshake<S: AsyncReadExt + AsyncWriteExt + Unpin>(
    stream: &mut S,
) -> Result<(Target, u16)> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(anyhow!("unsupported socks version: {}", head[0]));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS_VERSION, 0]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[1] != CMD_CONNECT {
        stream
            .write_all(&[SOCKS_VERSION, 7, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await?;
        return Err(anyhow!("unsupported socks command: {}", request[1]));
    }

    let target = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Target::Ip(IpAddr::V4(Ipv4Addr::from(addr)))
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Target::Ip(IpAddr::V6(Ipv6Addr::from(addr)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let host = String::from_utf8(name).map_err(|_| anyhow!("bad domain in request"))?;
            // some clients tunnel addresses through the domain field
            match host.parse::<IpAddr>() {
                Ok(ip) => Target::Ip(ip),
                Err(_) => Target::Domain(host),
            }
        }
        other => {
            return Err(anyhow!("unsupported address type: {}", other));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    stream
        .write_all(&[SOCKS_VERSION, 0, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;

    Ok((target, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_domain() {
        let (mut client, mut server) = tokio::io::duplex(256);

        // greeting + CONNECT example.com:443
        let mut req = vec![5, 1, 0, 5, 1, 0, ATYP_DOMAIN, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let (target, port) = socks_handshake(&mut server).await.unwrap();
        match target {
            Target::Domain(host) => assert_eq!(host, "example.com"),
            _ => panic!("expected domain target"),
        }
        assert_eq!(port, 443);

        // method selection + success reply
        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..2], &[5, 0]);
        assert_eq!(&reply[2..4], &[5, 0]);
    }

    #[tokio::test]
    async fn test_handshake_ipv4() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let mut req = vec![5, 1, 0, 5, 1, 0, ATYP_IPV4, 8, 8, 8, 8];
        req.extend_from_slice(&53u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let (target, port) = socks_handshake(&mut server).await.unwrap();
        match target {
            Target::Ip(ip) => assert_eq!(ip, "8.8.8.8".parse::<IpAddr>().unwrap()),
            _ => panic!("expected ip target"),
        }
        assert_eq!(port, 53);
    }
}
