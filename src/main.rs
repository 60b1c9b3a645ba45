//! Charond - smart-routing tunnel proxy daemon
//!
//! Accepts local application connections, routes each to the best
//! egress (direct, relay tunnel, CDN front, or drop) and serves the
//! control socket.

use anyhow::Result;
use charon::api;
use charon::config::Config;
use charon::context::Context;
use charon::dns::probe_ipv6;
use charon::ipc::IpcServer;
use charon::listener::run_listener;
use charon::router::Router;
use charon::session::Session;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Charon - smart-routing tunnel proxy daemon
#[derive(Parser, Debug)]
#[command(name = "charond", version, about)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/charon/charon.json")]
    config: PathBuf,

    /// Run in foreground (don't daemonize)
    #[arg(short, long)]
    foreground: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    info!("Charon v{} starting", VERSION);

    // Load configuration
    let config = Config::load(&args.config)?;
    info!("configuration loaded from {:?}", args.config);

    let ctx = Context::new(config.clone(), args.config.clone());
    ctx.ipv6_ready.store(probe_ipv6(), Ordering::Relaxed);
    let ctx = Arc::new(ctx);
    if ctx.ipv6_ready() {
        info!("public IPv6 route available");
    }

    let session = Session::new(ctx.clone());
    let router = Arc::new(Router::new(ctx.clone(), session.clone()));

    // Bring the relay up early; egress attempts retry on demand
    if !api::login_process(&ctx, &session).await {
        warn!("relay not available yet: {}", ctx.last_api_error());
    }

    // Local proxy listener
    {
        let ctx = ctx.clone();
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = run_listener(ctx, router).await {
                error!("listener error: {}", e);
            }
        });
    }

    // Control socket
    let server = IpcServer::new(&config.socket_path, ctx, session);
    info!("Charon ready");
    server.run().await
}
