//! Control IPC
//!
//! JSON-lines over a UNIX socket: one request per line, one response
//! per line. `charonctl` is the only expected client, but the protocol
//! is plain enough for scripts.

use crate::config::Config;
use crate::context::Context;
use crate::policy::CacheRule;
use crate::session::{Session, SessionStatus};
use crate::stats::StatsSnapshot;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// IPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IpcRequest {
    /// Full daemon status
    GetStatus,

    /// Quota and balance left on the account
    GetQuota,

    /// Stop and restart the relay session
    ResetSession,

    /// Dump the routing caches
    GetCaches,

    /// Drop all routing cache entries
    FlushCaches,

    /// Current configuration
    GetConfig,
}

/// IPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum IpcResponse {
    Success { message: String },
    Status(DaemonStatus),
    Quota(QuotaInfo),
    Caches(CacheDump),
    Config(Box<Config>),
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub server_host: Option<String>,
    pub last_api_error: String,
    pub stats: StatsSnapshot,
    pub session: SessionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaInfo {
    pub quota: i64,
    pub balance: f64,
    pub last_api_error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDump {
    pub domains: Vec<DomainCacheLine>,
    pub ips: Vec<IpCacheLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainCacheLine {
    pub host: String,
    pub rule: CacheRule,
    pub deny_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpCacheLine {
    pub ip: IpAddr,
    pub rule: CacheRule,
}

/// IPC server
pub struct IpcServer {
    socket_path: String,
    ctx: Arc<Context>,
    session: Arc<Session>,
}

impl IpcServer {
    pub fn new(socket_path: &str, ctx: Arc<Context>, session: Arc<Session>) -> Self {
        Self {
            socket_path: socket_path.to_string(),
            ctx,
            session,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(parent) = std::path::Path::new(&self.socket_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("control socket at {}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let ctx = self.ctx.clone();
                    let session = self.session.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, ctx, session).await {
                            error!("control client error: {}", e);
                        }
                    });
                }
                Err(e) => error!("control accept error: {}", e),
            }
        }
    }
}

async fn handle_client(
    stream: UnixStream,
    ctx: Arc<Context>,
    session: Arc<Session>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => process_request(request, &ctx, &session).await,
            Err(e) => IpcResponse::Error {
                message: e.to_string(),
            },
        };

        let json = serde_json::to_string(&response)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

async fn process_request(
    request: IpcRequest,
    ctx: &Arc<Context>,
    session: &Arc<Session>,
) -> IpcResponse {
    match request {
        IpcRequest::GetStatus => IpcResponse::Status(DaemonStatus {
            version: VERSION.to_string(),
            server_host: ctx.server_host(),
            last_api_error: ctx.last_api_error(),
            stats: ctx.stats.snapshot(),
            session: session.status(),
        }),

        IpcRequest::GetQuota => IpcResponse::Quota(QuotaInfo {
            quota: ctx.quota.load(Ordering::Relaxed),
            balance: *ctx.balance.lock().unwrap(),
            last_api_error: ctx.last_api_error(),
        }),

        IpcRequest::ResetSession => {
            if session.reset().await {
                IpcResponse::Success {
                    message: "session reset".to_string(),
                }
            } else {
                IpcResponse::Error {
                    message: format!("session restart failed: {}", ctx.last_api_error()),
                }
            }
        }

        IpcRequest::GetCaches => IpcResponse::Caches(CacheDump {
            domains: ctx
                .domain_cache
                .snapshot()
                .into_iter()
                .map(|(host, rule, deny_count)| DomainCacheLine {
                    host,
                    rule,
                    deny_count,
                })
                .collect(),
            ips: ctx
                .ip_cache
                .snapshot()
                .into_iter()
                .map(|(ip, rule)| IpCacheLine { ip, rule })
                .collect(),
        }),

        IpcRequest::FlushCaches => {
            ctx.domain_cache.clear();
            ctx.ip_cache.clear();
            IpcResponse::Success {
                message: "caches flushed".to_string(),
            }
        }

        IpcRequest::GetConfig => IpcResponse::Config(Box::new(ctx.config())),
    }
}

/// Client side, used by charonctl
pub struct IpcClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl IpcClient {
    pub async fn connect(socket_path: &str) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub async fn request(&mut self, request: &IpcRequest) -> Result<IpcResponse> {
        let json = serde_json::to_string(request)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut line = String::new();
        self.reader.read_line(&mut line).await?;
        Ok(serde_json::from_str(&line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let req = IpcRequest::GetStatus;
        let json = serde_json::to_string(&req).unwrap();
        let back: IpcRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, IpcRequest::GetStatus));
    }

    #[test]
    fn test_response_tagging() {
        let resp = IpcResponse::Success {
            message: "ok".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"status\":\"Success\""));
    }
}
