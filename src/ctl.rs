//! charonctl - Charon control utility

use anyhow::{anyhow, Result};
use charon::ipc::{IpcClient, IpcRequest, IpcResponse};
use charon::stats::format_bytes;
use clap::{Parser, Subcommand};

/// Charon control utility
#[derive(Parser)]
#[command(name = "charonctl", version, about = "Control the Charon proxy daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Socket path
    #[arg(long, default_value = "/run/charon/charon.sock")]
    socket: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon and session status
    Status,

    /// Show remaining quota and balance
    Quota,

    /// Stop and restart the relay session
    Reset,

    /// Show the routing caches
    Caches,

    /// Drop all routing cache entries
    Flush,

    /// Show the active configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut client = IpcClient::connect(&cli.socket)
        .await
        .map_err(|e| anyhow!("cannot reach charond at {}: {}", cli.socket, e))?;

    let request = match cli.command {
        Commands::Status => IpcRequest::GetStatus,
        Commands::Quota => IpcRequest::GetQuota,
        Commands::Reset => IpcRequest::ResetSession,
        Commands::Caches => IpcRequest::GetCaches,
        Commands::Flush => IpcRequest::FlushCaches,
        Commands::Config => IpcRequest::GetConfig,
    };

    match client.request(&request).await? {
        IpcResponse::Success { message } => println!("{}", message),

        IpcResponse::Error { message } => {
            eprintln!("error: {}", message);
            std::process::exit(1);
        }

        IpcResponse::Status(status) => {
            println!("charond v{}", status.version);
            match &status.server_host {
                Some(host) => println!("relay server:     {}", host),
                None => println!("relay server:     (none)"),
            }
            if !status.last_api_error.is_empty() {
                println!("last api error:   {}", status.last_api_error);
            }
            println!("handled conns:    {}", status.stats.handle_num);
            println!(
                "round trips:      {} ({} slow, {} timeout, {} resend)",
                status.stats.roundtrip_num,
                status.stats.slow_roundtrip,
                status.stats.timeout_roundtrip,
                status.stats.resend
            );
            println!(
                "traffic:          up {} / down {}",
                format_bytes(status.stats.sent_bytes),
                format_bytes(status.stats.received_bytes)
            );

            let s = &status.session;
            println!();
            println!("session {}:", s.session_id);
            println!("  running:        {}", s.running);
            println!("  last send:      {} ms ago", s.since_last_send_ms);
            match s.since_last_receive_ms {
                Some(ms) => println!("  last receive:   {} ms ago", ms),
                None => println!("  last receive:   never"),
            }
            println!("  conn ids:       {}", s.last_conn_id);
            println!("  transfers:      {}", s.last_transfer_no);
            println!("  on road:        {} (target {})", s.on_road_num, s.target_on_roads);
            println!("  send pool:      {}", format_bytes(s.send_pool_size as u64));
            println!("  server pool:    {}", format_bytes(s.server_send_pool_size as u64));
            println!(
                "  wait ack:       {} entries, continue sn {}",
                s.wait_ack_len, s.ack_send_continue_sn
            );
            println!(
                "  receive:        next sn {}, {} pending",
                s.recv_next_sn,
                s.recv_pending.len()
            );
            for (no, stat, age_ms) in &s.transfers {
                println!("  [{}] {} t:{} ms", no, stat, age_ms);
            }
            for conn in &s.conns {
                println!(
                    "  conn:{} {}:{} up:{} acked:{} down:{}",
                    conn.conn_id,
                    conn.host,
                    conn.port,
                    format_bytes(conn.sent_bytes),
                    format_bytes(conn.peer_acked),
                    format_bytes(conn.recv_position)
                );
            }
        }

        IpcResponse::Quota(info) => {
            println!("quota:   {}", format_bytes(info.quota.max(0) as u64));
            println!("balance: {:.2}", info.balance);
            if !info.last_api_error.is_empty() {
                println!("error:   {}", info.last_api_error);
            }
        }

        IpcResponse::Caches(dump) => {
            println!("domain cache ({} entries):", dump.domains.len());
            for line in &dump.domains {
                println!(
                    "  {} -> {} (deny {})",
                    line.host,
                    line.rule.as_str(),
                    line.deny_count
                );
            }
            println!("ip cache ({} entries):", dump.ips.len());
            for line in &dump.ips {
                println!("  {} -> {}", line.ip, line.rule.as_str());
            }
        }

        IpcResponse::Config(config) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
