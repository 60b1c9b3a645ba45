//! Account API client
//!
//! JSON calls against the account server: login for the relay
//! host/port and quota, plus the front health report. The whole login
//! path is serialized behind the context's login lock so concurrent
//! egress attempts don't stampede the API.

use crate::context::Context;
use crate::session::Session;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Stop reusing a session this close to the server-side idle cutoff
const SESSION_REUSE_LIMIT: Duration = Duration::from_secs(5 * 60 - 5);

/// POST a JSON body to the account API, retrying transient failures
/// for up to 30 seconds
pub async fn call_api(ctx: &Arc<Context>, path: &str, req: Value) -> Result<Value> {
    let config = ctx.config();
    if config.account.api_server.is_empty() {
        return Err(anyhow!("no api server configured"));
    }
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    let url = format!("{}{}", config.account.api_server, path);

    let encryptor = ctx.encryptor()?;
    let body = encryptor.encrypt(&serde_json::to_vec(&req)?)?;

    let started = Instant::now();
    let deadline = started + Duration::from_secs(30);
    let mut last_status = 0u16;
    let mut content = None;

    while Instant::now() < deadline {
        let result = ctx
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::CONTENT_LENGTH, body.len())
            .timeout(Duration::from_secs(5))
            .body(body.clone())
            .send()
            .await;

        match result {
            Ok(response) => {
                last_status = response.status().as_u16();
                if last_status >= 400 {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                content = Some(response.bytes().await?);
                break;
            }
            Err(e) => {
                warn!("api:{} request fail: {}", path, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    let Some(content) = content else {
        let reason = format!("status:{}", last_status);
        warn!(
            "api:{} fail:{} t:{}",
            path,
            reason,
            started.elapsed().as_millis()
        );
        ctx.set_api_error(reason.clone());
        return Err(anyhow!(reason));
    };

    let plain = encryptor.decrypt(&content)?;
    let info: Value = match serde_json::from_slice(&plain) {
        Ok(v) => v,
        Err(e) => {
            ctx.set_api_error("parse json fail");
            warn!("api:{} parse json fail: {}", path, e);
            return Err(anyhow!("parse json fail"));
        }
    };

    if info["res"].as_str() != Some("success") {
        let reason = info["reason"].as_str().unwrap_or("unknown").to_string();
        ctx.set_api_error(reason.clone());
        warn!("api:{} fail:{}", path, reason);
        return Err(anyhow!(reason));
    }

    info!("api:{} success t:{}", path, started.elapsed().as_millis());
    ctx.set_api_error("");
    Ok(info)
}

/// Quota seconds still usable from the current and backup windows
pub fn calculate_quota_left(quota_list: &Value) -> i64 {
    let time_now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let mut quota_left = 0i64;

    if let Some(current) = quota_list.get("current") {
        if current["end_time"].as_i64().unwrap_or(0) > time_now {
            quota_left += current["quota"].as_i64().unwrap_or(0);
        }
    }
    if let Some(backups) = quota_list.get("backup").and_then(Value::as_array) {
        for entry in backups {
            if entry["end_time"].as_i64().unwrap_or(0) < time_now {
                continue;
            }
            quota_left += entry["quota"].as_i64().unwrap_or(0);
        }
    }

    quota_left
}

/// Refresh quota/balance and learn the relay server from the API.
/// With no API configured the config-pinned server is used as-is.
pub async fn request_balance(ctx: &Arc<Context>, update_server: bool) -> Result<()> {
    let config = ctx.config();

    if config.account.api_server.is_empty() {
        if config.account.server_host.is_empty() {
            return Err(anyhow!("no api server and no pinned relay server"));
        }
        let host = format!(
            "{}:{}",
            config.account.server_host, config.account.server_port
        );
        info!("no api server set, use pinned relay {}", host);
        ctx.set_server_host(Some(host));
        return Ok(());
    }

    if config.account.login_account.is_empty() || config.account.login_password.is_empty() {
        return Err(anyhow!("no account configured"));
    }

    let req = serde_json::json!({
        "account": config.account.login_account,
        "password": config.account.login_password,
        "protocol_version": "2",
    });

    let info = call_api(ctx, "/login", req).await?;

    let quota = calculate_quota_left(&info["quota_list"]);
    ctx.quota.store(quota, Ordering::Relaxed);
    if quota <= 0 {
        warn!("account has no quota");
    }
    if let Some(balance) = info["balance"].as_f64() {
        *ctx.balance.lock().unwrap() = balance;
    }

    if !config.account.server_host.is_empty() {
        let host = format!(
            "{}:{}",
            config.account.server_host, config.account.server_port
        );
        info!("use relay {} pinned in config", host);
        ctx.set_server_host(Some(host));
    } else if update_server || ctx.server_host().is_none() {
        let host = info["host"].as_str().unwrap_or_default();
        let port = info["port"].as_u64().unwrap_or(443);
        if host.is_empty() {
            return Err(anyhow!("api response carries no relay host"));
        }
        let server = format!("{}:{}", host, port);
        info!("update relay server {}", server);
        ctx.set_server_host(Some(server));
    }

    Ok(())
}

/// Make sure a live session exists: learn a relay server if needed,
/// retire near-idle-cutoff sessions, start when stopped
pub async fn login_process(ctx: &Arc<Context>, session: &Arc<Session>) -> bool {
    let _guard = ctx.login_lock.lock().await;

    let config = ctx.config();
    if config.account.login_account.is_empty() && config.account.api_server.is_empty() {
        // a pinned relay with open auth is still usable
        if config.account.server_host.is_empty() {
            debug!("no account configured");
            return false;
        }
    }

    if ctx.server_host().is_none() {
        debug!("no relay server, query the account api");
        if let Err(e) = request_balance(ctx, true).await {
            warn!("request_balance fail: {}", e);
            return false;
        }
    }

    if session.last_send_elapsed() > SESSION_REUSE_LIMIT && session.running() {
        info!("session idle too long, retire it");
        session.stop();
    }

    if !session.running() {
        return session.start().await;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_left_counts_live_windows() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let list = serde_json::json!({
            "current": {"quota": 100, "end_time": now + 3600},
            "backup": [
                {"quota": 50, "end_time": now + 3600},
                {"quota": 70, "end_time": now - 3600},
            ],
        });
        assert_eq!(calculate_quota_left(&list), 150);
    }

    #[test]
    fn test_quota_left_empty() {
        assert_eq!(calculate_quota_left(&serde_json::json!({})), 0);
    }
}
