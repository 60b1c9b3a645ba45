//! Egress adapters
//!
//! Each adapter either takes a client socket to its destination or
//! hands it back with a reason so the rule loop can try the next
//! egress. `Fatal` means the socket is gone and the loop must stop.

use crate::context::Context;
use crate::session::Session;
use crate::sniff::PeekableStream;
use crate::dns::QueryFamily;
use futures::future::BoxFuture;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Why an adapter handed the socket back
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    #[error("no address for host")]
    NoRoute,

    #[error("upstream connect fail")]
    ConnectFail,

    #[error("ipv6 not ready")]
    Ipv6NotReady,

    #[error("tls redirect fail")]
    RedirectHttpsFail,

    #[error("relay session not running")]
    RelayNotRunning,

    #[error("refusing to fake a certificate")]
    DontFakeCa,

    #[error("front not workable")]
    FrontNotWorkable,

    #[error("front denied for this host")]
    FrontDenied,

    #[error("egress parked")]
    Parked,
}

/// Result of one egress attempt
pub enum RouteOutcome {
    /// Socket handed off and serviced to completion
    Handled,
    /// Socket returned untouched; try the next rule
    TryNext {
        stream: PeekableStream,
        reason: RouteError,
    },
    /// Socket consumed or closed; stop the rule loop
    Fatal { reason: String },
}

/// Errors surfaced by a plugged-in CDN front
pub enum FrontError {
    /// The front cannot carry this request; the parsed head and the
    /// socket come back for a relay replay
    NotSupported {
        head: Vec<u8>,
        stream: PeekableStream,
    },
    /// TLS interception failed mid-handshake
    SslWrapFail,
    /// The intercepted request head would not parse
    ParseFail,
    /// The client never finished its request
    RequestTimeout,
    Other(String),
}

impl std::fmt::Debug for FrontError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSupported { head, .. } => {
                write!(f, "NotSupported(head {} bytes)", head.len())
            }
            Self::SslWrapFail => write!(f, "SslWrapFail"),
            Self::ParseFail => write!(f, "ParseFail"),
            Self::RequestTimeout => write!(f, "RequestTimeout"),
            Self::Other(e) => write!(f, "Other({})", e),
        }
    }
}

/// The CDN-fronted HTTP egress, owned by an external component
pub trait Front: Send + Sync {
    fn is_workable(&self) -> bool;

    /// Self-check sentinel host; requests to it always go to the front
    fn fake_host(&self) -> Option<String>;

    /// Intercept and carry one request on the socket
    fn handle(
        &self,
        stream: PeekableStream,
        host: String,
        port: u16,
    ) -> BoxFuture<'static, Result<(), FrontError>>;
}

/// Forward via a direct upstream connection
pub async fn do_direct(
    ctx: &Arc<Context>,
    mut stream: PeekableStream,
    host: &str,
    port: u16,
) -> RouteOutcome {
    let family = if ctx.ipv6_ready() {
        QueryFamily::Both
    } else {
        QueryFamily::V4
    };
    let ips = ctx.resolver.query(host, family).await;
    if ips.is_empty() {
        return RouteOutcome::TryNext {
            stream,
            reason: RouteError::NoRoute,
        };
    }

    match ctx.pool.get_conn(host, &ips, port).await {
        Some(upstream) => {
            debug!("host:{}:{} direct connect {} success", host, port, upstream.ip);
            splice(&mut stream, upstream.stream).await;
            RouteOutcome::Handled
        }
        None => RouteOutcome::TryNext {
            stream,
            reason: RouteError::ConnectFail,
        },
    }
}

/// Direct, but over IPv6 answers only
pub async fn do_direct6(
    ctx: &Arc<Context>,
    mut stream: PeekableStream,
    host: &str,
    port: u16,
) -> RouteOutcome {
    if !ctx.ipv6_ready() {
        return RouteOutcome::TryNext {
            stream,
            reason: RouteError::Ipv6NotReady,
        };
    }
    let ips = ctx.resolver.query(host, QueryFamily::V6).await;
    if ips.is_empty() {
        return RouteOutcome::TryNext {
            stream,
            reason: RouteError::NoRoute,
        };
    }

    match ctx.pool.get_conn(host, &ips, port).await {
        Some(upstream) => {
            debug!("host:{}:{} direct6 connect {} success", host, port, upstream.ip);
            splice(&mut stream, upstream.stream).await;
            RouteOutcome::Handled
        }
        None => RouteOutcome::TryNext {
            stream,
            reason: RouteError::ConnectFail,
        },
    }
}

/// Forward to port 443 with an unauthenticated TLS wrap upstream
pub async fn do_redirect_https(
    ctx: &Arc<Context>,
    mut stream: PeekableStream,
    host: &str,
    port: u16,
) -> RouteOutcome {
    let family = if ctx.ipv6_ready() {
        QueryFamily::Both
    } else {
        QueryFamily::V4
    };
    let ips = ctx.resolver.query(host, family).await;
    if ips.is_empty() {
        return RouteOutcome::TryNext {
            stream,
            reason: RouteError::NoRoute,
        };
    }

    let Some(upstream) = ctx.pool.get_conn(host, &ips, 443).await else {
        return RouteOutcome::TryNext {
            stream,
            reason: RouteError::RedirectHttpsFail,
        };
    };

    let Ok(server_name) = ServerName::try_from(host.to_string()) else {
        return RouteOutcome::TryNext {
            stream,
            reason: RouteError::RedirectHttpsFail,
        };
    };

    match tls_connector().connect(server_name, upstream.stream).await {
        Ok(mut tls) => {
            debug!(
                "host:{}:{} redirect_https connect {} success",
                host, port, upstream.ip
            );
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut tls).await;
            RouteOutcome::Handled
        }
        Err(e) => {
            debug!("host:{}:{} redirect_https wrap fail: {}", host, port, e);
            RouteOutcome::TryNext {
                stream,
                reason: RouteError::RedirectHttpsFail,
            }
        }
    }
}

/// Carry the socket through the relay session until it ends
pub async fn do_relay(
    ctx: &Arc<Context>,
    session: &Arc<Session>,
    stream: PeekableStream,
    host: &str,
    port: u16,
) -> RouteOutcome {
    if !crate::api::login_process(ctx, session).await {
        return RouteOutcome::TryNext {
            stream,
            reason: RouteError::RelayNotRunning,
        };
    }

    match session.create_conn(stream, host, port) {
        Ok(conn) => {
            debug!("relay conn:{} to {}:{}", conn.conn_id, host, port);
            conn.wait_closed().await;
            RouteOutcome::Handled
        }
        Err(stream) => {
            warn!("relay create conn fail for {}:{}", host, port);
            RouteOutcome::TryNext {
                stream,
                reason: RouteError::RelayNotRunning,
            }
        }
    }
}

/// Hand the socket to the CDN front, falling back to a relay replay
/// when the front cannot carry the request
pub async fn do_front(
    ctx: &Arc<Context>,
    session: &Arc<Session>,
    mut stream: PeekableStream,
    host: &str,
    port: u16,
) -> RouteOutcome {
    let Some(front) = ctx.front.clone() else {
        return RouteOutcome::TryNext {
            stream,
            reason: RouteError::FrontNotWorkable,
        };
    };

    let lead = match stream.peek(1).await {
        Ok(lead) => lead.first().copied(),
        Err(e) => {
            return RouteOutcome::Fatal {
                reason: format!("peek fail: {}", e),
            }
        }
    };

    if matches!(lead, Some(0x16) | Some(0x80)) {
        let is_fake_host = front.fake_host().as_deref() == Some(host);
        if !is_fake_host && !ctx.config().route.enable_fake_ca {
            return RouteOutcome::TryNext {
                stream,
                reason: RouteError::DontFakeCa,
            };
        }
    }

    debug!("host:{}:{} do front", host, port);
    match front.handle(stream, host.to_string(), port).await {
        Ok(()) => RouteOutcome::Handled,
        Err(FrontError::NotSupported { head, stream }) => {
            // replay the already-parsed request through the relay
            info!("host:{}:{} front fallback to relay", host, port);
            let mut stream = stream;
            stream.prepend(&head);
            match do_relay(ctx, session, stream, host, port).await {
                RouteOutcome::Handled => RouteOutcome::Handled,
                RouteOutcome::TryNext { mut stream, .. } => {
                    let _ = stream.shutdown().await;
                    RouteOutcome::Fatal {
                        reason: "front fallback relay unavailable".to_string(),
                    }
                }
                fatal => fatal,
            }
        }
        Err(FrontError::SslWrapFail) | Err(FrontError::ParseFail) => {
            ctx.domain_cache.report_front_deny(host);
            RouteOutcome::Fatal {
                reason: format!("front intercept fail for {}", host),
            }
        }
        Err(FrontError::RequestTimeout) => RouteOutcome::Fatal {
            reason: format!("front request timeout for {}", host),
        },
        Err(FrontError::Other(e)) => {
            ctx.domain_cache.report_front_deny(host);
            RouteOutcome::Fatal {
                reason: format!("front error for {}: {}", host, e),
            }
        }
    }
}

/// Drop the connection
pub async fn do_black(mut stream: PeekableStream) -> RouteOutcome {
    let _ = stream.shutdown().await;
    RouteOutcome::Handled
}

async fn splice(local: &mut PeekableStream, mut remote: TcpStream) {
    let _ = tokio::io::copy_bidirectional(local, &mut remote).await;
}

/// Upstream certificates are deliberately not verified on the
/// redirect-https path; the client inside the tunnel does its own TLS.
#[derive(Debug)]
struct NoVerify(rustls::crypto::CryptoProvider);

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn tls_connector() -> TlsConnector {
    static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();
    CONNECTOR
        .get_or_init(|| {
            let provider = rustls::crypto::ring::default_provider();
            let config = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerify(provider)))
                .with_no_client_auth();
            TlsConnector::from(Arc::new(config))
        })
        .clone()
}
