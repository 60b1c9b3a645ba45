//! Relay proxy session
//!
//! One session per daemon. Many logical connections are multiplexed
//! into fixed-size encrypted HTTP POST round trips against the relay
//! server. The session owns the send buffer, the retransmit ledger,
//! ack aggregation, a pool of round-trip workers, a flush timer and an
//! optional health reporter.
//!
//! Workers park in the `WaitQueue` and are woken lowest-id first; the
//! elastic `target_on_roads` decides how many of them stay on the wire
//! holding long-poll requests.

use crate::api;
use crate::buffers::{BlockReceivePool, ReadBuffer, SendBuffer, WaitQueue, WriteBuffer};
use crate::config::TunnelConfig;
use crate::conn::{Conn, ConnStatus, FRAME_OVERHEAD};
use crate::context::Context;
use crate::sniff::PeekableStream;
use crate::stats::Stats;
use crate::wire::{
    self, build_ack, next_conn_record, next_sn_record, parse_ack, put_conn_record, put_sn_record,
    ConnCommand, ConnFrame, LoginResponse, ServerPacket, TransferRequest,
};
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Estimated HTTP header overhead charged against the quota per trip
const HTTP_OVERHEAD: u64 = 645;

/// A round trip slower than this counts as slow
const SLOW_ROUNDTRIP_MS: u128 = 8000;

/// Idle threshold for the reporter and the login path
const IDLE_AFTER: Duration = Duration::from_secs(60);

enum AckEntry {
    Pending { payload: Bytes, last_send: Instant },
    Acked,
}

struct TransferStat {
    start: Instant,
    stat: &'static str,
}

struct SessionState {
    session_id: [u8; 8],
    last_conn_id: u32,
    last_transfer_no: u32,
    conn_list: HashMap<u32, Arc<Conn>>,
    transfer_list: BTreeMap<u32, TransferStat>,
    /// sn -> unacked payload; keys stay dense above ack_send_continue_sn
    wait_ack_send_list: BTreeMap<u32, AckEntry>,
    /// highest sn with everything at or below it acked and dropped
    ack_send_continue_sn: u32,
    on_road_num: u32,
    target_on_roads: usize,
    last_send_time: Instant,
    last_receive_time: Option<Instant>,
    traffic: u64,
    server_send_pool_size: u32,
}

impl SessionState {
    fn fresh() -> Self {
        Self {
            session_id: random_session_id(),
            last_conn_id: 0,
            last_transfer_no: 0,
            conn_list: HashMap::new(),
            transfer_list: BTreeMap::new(),
            wait_ack_send_list: BTreeMap::new(),
            ack_send_continue_sn: 0,
            on_road_num: 0,
            target_on_roads: 0,
            last_send_time: Instant::now(),
            last_receive_time: None,
            traffic: 0,
            server_send_pool_size: 0,
        }
    }
}

pub struct Session {
    ctx: Arc<Context>,
    cfg: TunnelConfig,
    send_delay: Duration,
    ack_delay: Duration,
    resend_timeout: Duration,

    pub wait_queue: WaitQueue,
    pub send_buffer: SendBuffer,
    receive_pool: BlockReceivePool,
    state: Mutex<SessionState>,
    running: AtomicBool,
    /// Serializes start/stop/reset
    lifecycle: tokio::sync::Mutex<()>,
}

/// Status snapshot for the control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub running: bool,
    pub since_last_send_ms: u64,
    pub since_last_receive_ms: Option<u64>,
    pub last_conn_id: u32,
    pub last_transfer_no: u32,
    pub traffic: u64,
    pub on_road_num: u32,
    pub target_on_roads: usize,
    pub transfers: Vec<(u32, String, u64)>,
    pub send_pool_size: usize,
    pub server_send_pool_size: u32,
    pub wait_ack_len: usize,
    pub ack_send_continue_sn: u32,
    pub recv_next_sn: u32,
    pub recv_pending: Vec<u32>,
    pub conns: Vec<ConnStatus>,
}

fn random_session_id() -> [u8; 8] {
    let mut rng = rand::thread_rng();
    let mut id = [0u8; 8];
    for b in id.iter_mut() {
        *b = rng.gen_range(b'a'..=b'z');
    }
    id
}

impl Session {
    /// Build the session and spawn its reporter when TLS relay
    /// reporting is enabled
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let config = ctx.config();
        let cfg = config.tunnel.clone();
        let session = Arc::new(Self {
            send_delay: cfg.send_delay(),
            ack_delay: cfg.ack_delay(),
            resend_timeout: cfg.resend_timeout(),
            wait_queue: WaitQueue::new(),
            send_buffer: SendBuffer::new(cfg.max_payload as usize),
            receive_pool: BlockReceivePool::new(),
            state: Mutex::new(SessionState::fresh()),
            running: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            cfg,
            ctx,
        });
        if config.account.enable_tls_relay {
            tokio::spawn(session.clone().reporter_loop());
        }
        session
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.last_send_elapsed() > IDLE_AFTER
    }

    pub fn last_send_elapsed(&self) -> Duration {
        self.state.lock().unwrap().last_send_time.elapsed()
    }

    /// Log in and spawn the worker pool. Idempotent while running.
    pub fn start(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            let _guard = self.lifecycle.lock().await;
            if self.running() {
                warn!("session asked to start but is running");
                return true;
            }

            *self.state.lock().unwrap() = SessionState::fresh();
            self.send_buffer.reset();
            self.receive_pool.reset();

            if !self.login_session().await {
                warn!("relay login failed, session not started");
                return false;
            }

            self.wait_queue.restart();
            self.running.store(true, Ordering::SeqCst);

            for work_id in 0..self.cfg.concurrent_thread_num {
                tokio::spawn(self.clone().round_trip_worker(work_id));
            }
            tokio::spawn(self.clone().timer_loop());

            info!("session started");
            true
        })
    }

    /// Wind the session down; safe from any task
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("session asked to stop but not running");
            return;
        }

        let conns: Vec<Arc<Conn>> = {
            let mut state = self.state.lock().unwrap();
            state.target_on_roads = 0;
            state.session_id = [0u8; 8];
            state.conn_list.values().cloned().collect()
        };

        self.wait_queue.stop();
        for conn in conns {
            conn.shutdown_local();
        }
        self.send_buffer.reset();
        self.receive_pool.reset();

        debug!("session stopped");
    }

    pub async fn reset(self: &Arc<Self>) -> bool {
        debug!("session reset");
        self.stop();
        self.start().await
    }

    async fn login_session(&self) -> bool {
        let Some(server_host) = self.ctx.server_host() else {
            return false;
        };

        let config = self.ctx.config();
        let session_id = self.state.lock().unwrap().session_id;
        let request = wire::LoginRequest {
            session_id,
            max_payload: self.cfg.max_payload,
            send_delay: self.cfg.send_delay,
            window_size: self.cfg.window_size,
            window_ack: self.cfg.window_ack,
            resend_timeout: self.cfg.resend_timeout,
            ack_delay: self.cfg.ack_delay,
            account: config.account.login_account.clone(),
            password: config.account.login_password.clone(),
        };

        let encryptor = match self.ctx.encryptor() {
            Ok(e) => e,
            Err(e) => {
                error!("wire encryptor: {}", e);
                return false;
            }
        };
        let body = match encryptor.encrypt(&request.encode()) {
            Ok(b) => b,
            Err(e) => {
                error!("login encrypt: {}", e);
                return false;
            }
        };

        let url = format!("http://{}/data", server_host);
        let deadline = Instant::now() + Duration::from_secs(30);

        while Instant::now() < deadline {
            let started = Instant::now();
            let result = self
                .ctx
                .http
                .post(&url)
                .header(reqwest::header::CONTENT_LENGTH, body.len())
                .timeout(Duration::from_secs(self.cfg.network_timeout))
                .body(body.clone())
                .send()
                .await;

            let response = match result {
                Ok(r) => r,
                Err(e) => {
                    warn!("login request fail: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let status = response.status().as_u16();
            if status == 521 {
                self.ctx.set_api_error("relay server is down");
                warn!("login: relay server is down, need a new one");
                self.ctx.set_server_host(None);
                return false;
            }
            if status != 200 {
                self.ctx
                    .set_api_error(format!("relay login fail, status:{}", status));
                warn!("login fail, status:{}", status);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            let content = match response.bytes().await {
                Ok(b) => b,
                Err(e) => {
                    warn!("login read body fail: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if content.len() < 6 {
                self.ctx
                    .set_api_error(format!("relay login short response: {}", content.len()));
                continue;
            }

            let plain = match encryptor.decrypt(&content) {
                Ok(p) => p,
                Err(e) => {
                    warn!("login decrypt fail: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let login = match LoginResponse::decode(Bytes::from(plain)) {
                Ok(l) => l,
                Err(e) => {
                    error!(
                        "login head error after {} ms: {}",
                        started.elapsed().as_millis(),
                        e
                    );
                    return false;
                }
            };

            if login.res != 0 {
                self.ctx.set_api_error(format!(
                    "relay login fail, code:{} msg:{}",
                    login.res, login.message
                ));
                warn!("login fail, res:{} msg:{}", login.res, login.message);
                return false;
            }

            self.ctx.set_api_error("");
            info!(
                "login {} time:{} msg:{}",
                String::from_utf8_lossy(&session_id),
                started.elapsed().as_millis(),
                login.message
            );
            return true;
        }

        false
    }

    /// Open a logical stream through the relay. Hands the socket back
    /// when the session is down so the caller can try another egress.
    pub fn create_conn(
        self: &Arc<Self>,
        stream: PeekableStream,
        host: &str,
        port: u16,
    ) -> Result<Arc<Conn>, PeekableStream> {
        if !self.running() {
            debug!("session not running, cannot create conn");
            return Err(stream);
        }

        let conn_id = {
            let mut state = self.state.lock().unwrap();
            state.target_on_roads = state.target_on_roads.max(self.cfg.min_on_road);
            state.last_conn_id += 2;
            state.last_conn_id
        };

        let frame = ConnFrame {
            seq: 0,
            cmd: ConnCommand::Connect {
                sock_type: 0,
                host: Bytes::copy_from_slice(host.as_bytes()),
                port,
            },
        };
        self.send_conn_data(conn_id, &frame.encode());

        let read_chunk = (self.cfg.max_payload as usize).saturating_sub(FRAME_OVERHEAD);
        let conn = Conn::start(
            self,
            conn_id,
            stream,
            host.to_string(),
            port,
            self.cfg.window_size as u64,
            self.cfg.window_ack as u64,
            true,
            read_chunk,
        );
        self.state
            .lock()
            .unwrap()
            .conn_list
            .insert(conn_id, conn.clone());
        Ok(conn)
    }

    pub fn remove_conn(&self, conn_id: u32) {
        let mut state = self.state.lock().unwrap();
        if state.conn_list.remove(&conn_id).is_some() {
            debug!("remove conn:{}", conn_id);
        }
        if state.conn_list.is_empty() {
            state.target_on_roads = 0;
        }
    }

    /// Queue one framed command for upload
    pub fn send_conn_data(&self, conn_id: u32, frame: &[u8]) {
        if !self.running() {
            warn!("send_conn_data but session not running");
            return;
        }

        let mut buf = WriteBuffer::with_capacity(8 + frame.len());
        put_conn_record(&mut buf, conn_id, frame);
        self.send_buffer.put(buf.freeze());

        let backlogged = self.send_buffer.pool_size() > self.cfg.max_payload as usize;
        let aged = self
            .send_buffer
            .oldest_received()
            .map(|t| t.elapsed() > self.send_delay)
            .unwrap_or(false);
        if backlogged || aged {
            self.wait_queue.notify();
        }
    }

    fn target_on_roads(&self) -> usize {
        self.state.lock().unwrap().target_on_roads
    }

    /// Assemble the upload for one round trip: overdue retransmits
    /// first, then at most one fresh chunk
    fn get_data(&self, work_id: usize) -> Bytes {
        let now = Instant::now();
        let max_payload = self.cfg.max_payload as usize;
        let mut buf = WriteBuffer::new();

        {
            let mut state = self.state.lock().unwrap();
            for (sn, entry) in state.wait_ack_send_list.iter_mut() {
                let AckEntry::Pending { payload, last_send } = entry else {
                    continue;
                };
                if now.duration_since(*last_send) > self.resend_timeout {
                    Stats::incr(&self.ctx.stats.resend);
                    put_sn_record(&mut buf, *sn, payload);
                    *last_send = now;
                    if buf.len() > max_payload {
                        return buf.freeze();
                    }
                }
            }
        }

        let pool = self.send_buffer.pool_size();
        let want_fresh = pool > max_payload
            || (pool > 0 && {
                let aged = self
                    .send_buffer
                    .oldest_received()
                    .map(|t| t.elapsed() > self.send_delay)
                    .unwrap_or(false);
                aged || work_id < self.target_on_roads()
            });

        if want_fresh {
            if let Some((payload, sn)) = self.send_buffer.get() {
                self.state.lock().unwrap().wait_ack_send_list.insert(
                    sn,
                    AckEntry::Pending {
                        payload: payload.clone(),
                        last_send: now,
                    },
                );
                put_sn_record(&mut buf, sn, &payload);
            }
        }

        buf.freeze()
    }

    /// Ack body when forced, or when receive traffic has gone
    /// unacknowledged past ack_delay
    fn get_ack(&self, force: bool) -> Bytes {
        let justified = force || {
            let state = self.state.lock().unwrap();
            match state.last_receive_time {
                Some(received) => {
                    received.elapsed() < state.last_send_time.elapsed()
                        && received.elapsed() > self.ack_delay
                }
                None => false,
            }
        };
        if !justified {
            return Bytes::new();
        }
        build_ack(
            self.receive_pool.next_sn() - 1,
            &self.receive_pool.pending_sns(),
        )
    }

    /// The only worker suspension point: park until there is data, a
    /// justified ack, or this worker id is wanted on the wire
    async fn get_send_data(&self, work_id: usize) -> (Bytes, Bytes) {
        while self.running() {
            let data = self.get_data(work_id);
            let force = !data.is_empty() || work_id < self.target_on_roads();
            let ack = self.get_ack(force);
            if !data.is_empty() || !ack.is_empty() || force {
                return (data, ack);
            }
            if !self.wait_queue.wait(work_id).await {
                break;
            }
        }
        debug!("get_send_data on stop");
        (Bytes::new(), Bytes::new())
    }

    fn ack_process(&self, ack: Bytes) {
        let (last_ack, sns) = match parse_ack(ack) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("ack parse fail: {}", e);
                return;
            }
        };

        let mut state = self.state.lock().unwrap();
        for sn in sns {
            if let Some(entry) = state.wait_ack_send_list.get_mut(&sn) {
                *entry = AckEntry::Acked;
            }
        }

        let below: Vec<u32> = state
            .wait_ack_send_list
            .range(..=last_ack)
            .map(|(sn, _)| *sn)
            .collect();
        for sn in below {
            if let Some(entry) = state.wait_ack_send_list.get_mut(&sn) {
                *entry = AckEntry::Acked;
            }
        }

        loop {
            let next = state.ack_send_continue_sn + 1;
            let acked = matches!(
                state.wait_ack_send_list.get(&next),
                Some(AckEntry::Acked)
            );
            if !acked {
                break;
            }
            state.wait_ack_send_list.remove(&next);
            state.ack_send_continue_sn = next;
        }
    }

    /// Fan a downloaded payload out to its connections
    fn dispatch_download(&self, payload: Bytes) {
        let mut r = ReadBuffer::new(payload);
        loop {
            match next_conn_record(&mut r) {
                Ok(Some((conn_id, block))) => {
                    let conn = self.state.lock().unwrap().conn_list.get(&conn_id).cloned();
                    match conn {
                        Some(conn) => conn.put_cmd_data(block),
                        None => debug!("conn:{} not exist", conn_id),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("download walk fail: {}", e);
                    break;
                }
            }
        }
    }

    fn round_trip_process(&self, data: Bytes, ack: Bytes) {
        let mut r = ReadBuffer::new(data);
        loop {
            match next_sn_record(&mut r) {
                Ok(Some((sn, payload))) => {
                    for ready in self.receive_pool.put(sn, payload) {
                        self.dispatch_download(ready);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("download stream fail: {}", e);
                    break;
                }
            }
        }
        self.ack_process(ack);
    }

    fn next_transfer_no(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.last_transfer_no += 1;
        state.last_transfer_no
    }

    /// Wake parked workers until the elastic target is on the wire
    fn trigger_more(&self) {
        let running_num = self
            .cfg
            .concurrent_thread_num
            .saturating_sub(self.wait_queue.waiting());
        let action = self.target_on_roads().saturating_sub(running_num);
        for _ in 0..action {
            self.wait_queue.notify();
        }
    }

    /// Low worker ids hold long polls; the top of the pool stays
    /// nearly synchronous so bursts drain fast
    fn server_timeout_for(&self, work_id: usize) -> u8 {
        let pool = self.send_buffer.pool_size();
        let n = self.cfg.concurrent_thread_num;
        if pool > self.cfg.max_payload as usize
            || (pool > 0 && self.wait_queue.waiting() < self.cfg.min_on_road)
        {
            0
        } else if work_id as f64 > n as f64 * 0.9 {
            1
        } else if work_id as f64 > n as f64 * 0.7 {
            3
        } else {
            self.cfg.roundtrip_timeout.min(255) as u8
        }
    }

    async fn round_trip_worker(self: Arc<Self>, work_id: usize) {
        while self.running() {
            let (data, ack) = self.get_send_data(work_id).await;
            if !self.running() {
                break;
            }

            let send_data_len = data.len();
            let transfer_no = self.next_transfer_no();
            let server_timeout = self.server_timeout_for(work_id);

            let request_session_id = self.state.lock().unwrap().session_id;
            let request = TransferRequest {
                session_id: request_session_id,
                transfer_no,
                server_timeout,
                data,
                ack,
            };

            let encryptor = match self.ctx.encryptor() {
                Ok(e) => e,
                Err(e) => {
                    error!("wire encryptor: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let body = match encryptor.encrypt(&request.encode()) {
                Ok(b) => b,
                Err(e) => {
                    error!("round trip encrypt: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let upload_len = body.len();

            let Some(server_host) = self.ctx.server_host() else {
                warn!("no relay server, round trip parked");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };
            let url = format!("http://{}/data?tid={}", server_host, transfer_no);

            let start = Instant::now();
            {
                let mut state = self.state.lock().unwrap();
                state.last_send_time = start;
                state.on_road_num += 1;
                state.transfer_list.insert(
                    transfer_no,
                    TransferStat {
                        start,
                        stat: "request",
                    },
                );
            }

            let result = self
                .ctx
                .http
                .post(&url)
                .header(reqwest::header::CONTENT_LENGTH, upload_len)
                .timeout(Duration::from_secs(
                    server_timeout as u64 + self.cfg.network_timeout,
                ))
                .body(body)
                .send()
                .await;

            {
                let mut state = self.state.lock().unwrap();
                state.on_road_num -= 1;
                state.transfer_list.remove(&transfer_no);
            }

            let response = match result {
                Ok(r) => r,
                Err(e) => {
                    if e.is_timeout() {
                        Stats::incr(&self.ctx.stats.timeout_roundtrip);
                    }
                    if self.running() {
                        warn!("trip:{} no:{} request fail: {}", work_id, transfer_no, e);
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let status = response.status().as_u16();
            let content = match response.bytes().await {
                Ok(b) => b,
                Err(e) => {
                    warn!("trip:{} no:{} body fail: {}", work_id, transfer_no, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if !self.running() {
                // stopped while this trip was in flight; drop the result
                break;
            }

            let roundtrip_time = start.elapsed();
            let traffic = upload_len as u64 + content.len() as u64 + HTTP_OVERHEAD;
            self.state.lock().unwrap().traffic += traffic;
            self.ctx.charge_quota(traffic as i64);
            Stats::incr(&self.ctx.stats.roundtrip_num);
            Stats::add(&self.ctx.stats.sent_bytes, upload_len as u64);
            Stats::add(&self.ctx.stats.received_bytes, content.len() as u64);

            if status == 521 {
                warn!("relay server is down, try get a new one");
                self.ctx.set_server_host(None);
                self.ctx.set_api_error("relay server is down");
                self.stop();
                api::login_process(&self.ctx, &self).await;
                return;
            }

            if status != 200 {
                warn!(
                    "roundtrip time:{} no:{} send:{} status:{}",
                    roundtrip_time.as_millis(),
                    transfer_no,
                    send_data_len,
                    status
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            if content.len() < 6 {
                warn!(
                    "roundtrip time:{} no:{} short response:{}",
                    roundtrip_time.as_millis(),
                    transfer_no,
                    content.len()
                );
                continue;
            }

            let plain = match encryptor.decrypt(&content) {
                Ok(p) => p,
                Err(e) => {
                    warn!("trip:{} no:{} decrypt fail: {}", work_id, transfer_no, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let plain_len = plain.len();

            let packet = match ServerPacket::decode(Bytes::from(plain)) {
                Ok(p) => p,
                Err(e) => {
                    warn!("trip:{} no:{} bad head: {}", work_id, transfer_no, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let transfer = match packet {
                ServerPacket::Error { code, message } => match code {
                    wire::ERR_NO_QUOTA => {
                        warn!("relay server: no quota");
                        self.ctx.set_api_error("out of quota");
                        self.stop();
                        return;
                    }
                    wire::ERR_UNPACK => {
                        warn!(
                            "roundtrip no:{} send:{} unpack error:{}",
                            transfer_no, send_data_len, message
                        );
                        continue;
                    }
                    wire::ERR_SESSION_NOT_FOUND => {
                        let current = self.state.lock().unwrap().session_id;
                        if current == request_session_id {
                            warn!(
                                "server lost session {}, reset",
                                String::from_utf8_lossy(&request_session_id)
                            );
                            self.reset().await;
                            return;
                        }
                        continue;
                    }
                    other => {
                        error!("unknown server error code:{} msg:{}", other, message);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
                ServerPacket::Transfer(t) => t,
            };

            let rtt = roundtrip_time
                .as_millis()
                .saturating_sub(transfer.time_cost_ms as u128)
                .max(100);
            if rtt > SLOW_ROUNDTRIP_MS {
                debug!("trip:{} no:{} slow rtt:{}", work_id, transfer_no, rtt);
                Stats::incr(&self.ctx.stats.slow_roundtrip);
            }

            {
                let mut state = self.state.lock().unwrap();
                state.server_send_pool_size = transfer.server_pool_size;
                if state.conn_list.is_empty() {
                    state.target_on_roads = 0;
                } else if plain_len >= self.cfg.max_payload as usize {
                    state.target_on_roads = (state.target_on_roads + 10)
                        .min(self.cfg.concurrent_thread_num - self.cfg.min_on_road);
                } else if plain_len <= 21 {
                    state.target_on_roads =
                        state.target_on_roads.saturating_sub(5).max(self.cfg.min_on_road);
                }
                debug!(
                    "trip:{} no:{} rt:{} cost:{} to:{} snd:{} rcv:{} s_pool:{} on_road:{} target:{}",
                    work_id,
                    transfer_no,
                    roundtrip_time.as_millis(),
                    transfer.time_cost_ms,
                    server_timeout,
                    send_data_len,
                    plain_len,
                    transfer.server_pool_size,
                    state.on_road_num,
                    state.target_on_roads
                );
            }
            self.trigger_more();

            self.round_trip_process(transfer.data, transfer.ack);
            self.state.lock().unwrap().last_receive_time = Some(Instant::now());
        }

        info!("round trip worker {} exit", work_id);
    }

    /// Flush pacing: kick a worker whenever buffered upload data has
    /// waited out the send delay
    async fn timer_loop(self: Arc<Self>) {
        while self.running() {
            tokio::time::sleep(self.send_delay).await;
            if self.send_buffer.pool_size() > 0 {
                let aged = self
                    .send_buffer
                    .oldest_received()
                    .map(|t| t.elapsed() > self.send_delay)
                    .unwrap_or(false);
                if aged {
                    self.wait_queue.notify();
                }
            }
        }
    }

    /// Post front health upstream while the session is active and no
    /// relay address is healthy
    async fn reporter_loop(self: Arc<Self>) {
        tokio::time::sleep(Duration::from_secs(5)).await;
        let interval = Duration::from_secs(self.ctx.config().account.report_interval.max(1));
        loop {
            self.check_report_status().await;
            tokio::time::sleep(interval).await;
        }
    }

    async fn check_report_status(&self) {
        if self.is_idle() {
            return;
        }
        if self.ctx.relay_front.has_good_ip() {
            return;
        }

        let config = self.ctx.config();
        let stats = self.ctx.stats.snapshot();
        let report = serde_json::json!({
            "account": config.account.login_account,
            "password": config.account.login_password,
            "stat": {
                "roundtrip_num": stats.roundtrip_num,
                "slow_roundtrip": stats.slow_roundtrip,
                "timeout": stats.timeout_roundtrip,
                "resend": stats.resend,
                "sent_bytes": stats.sent_bytes,
                "received_bytes": stats.received_bytes,
                "ip_fails": self.ctx.relay_front.snapshot(),
            },
        });

        debug!("start report_stat");
        match api::call_api(&self.ctx, "/report_stat", report).await {
            Ok(info) => {
                let ips: Vec<String> = info["data"]["ips"]
                    .as_array()
                    .map(|list| {
                        list.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                self.ctx.relay_front.set_ips(ips);
            }
            Err(e) => warn!("report fail: {}", e),
        }
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.state.lock().unwrap();
        SessionStatus {
            session_id: String::from_utf8_lossy(&state.session_id).into_owned(),
            running: self.running(),
            since_last_send_ms: state.last_send_time.elapsed().as_millis() as u64,
            since_last_receive_ms: state
                .last_receive_time
                .map(|t| t.elapsed().as_millis() as u64),
            last_conn_id: state.last_conn_id,
            last_transfer_no: state.last_transfer_no,
            traffic: state.traffic,
            on_road_num: state.on_road_num,
            target_on_roads: state.target_on_roads,
            transfers: state
                .transfer_list
                .iter()
                .map(|(no, t)| (*no, t.stat.to_string(), t.start.elapsed().as_millis() as u64))
                .collect(),
            send_pool_size: self.send_buffer.pool_size(),
            server_send_pool_size: state.server_send_pool_size,
            wait_ack_len: state.wait_ack_send_list.len(),
            ack_send_continue_sn: state.ack_send_continue_sn,
            recv_next_sn: self.receive_pool.next_sn(),
            recv_pending: self.receive_pool.pending_sns(),
            conns: state.conn_list.values().map(|c| c.status()).collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn test_enqueue(&self, payload: Bytes) {
        self.send_buffer.put(payload);
    }

    #[cfg(test)]
    pub(crate) fn test_take_chunk(&self) -> Option<(Bytes, u32)> {
        let taken = self.send_buffer.get();
        if let Some((payload, sn)) = &taken {
            self.state.lock().unwrap().wait_ack_send_list.insert(
                *sn,
                AckEntry::Pending {
                    payload: payload.clone(),
                    last_send: Instant::now(),
                },
            );
        }
        taken
    }

    #[cfg(test)]
    pub(crate) fn test_ack(&self, ack: Bytes) {
        self.ack_process(ack);
    }

    #[cfg(test)]
    pub(crate) fn test_wait_ack_keys(&self) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .wait_ack_send_list
            .keys()
            .copied()
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn test_continue_sn(&self) -> u32 {
        self.state.lock().unwrap().ack_send_continue_sn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::path::PathBuf;

    fn test_session() -> Arc<Session> {
        let mut config = Config::default();
        config.tunnel.max_payload = 2048;
        config.tunnel.concurrent_thread_num = 4;
        config.tunnel.min_on_road = 1;
        let ctx = Arc::new(Context::new(config, PathBuf::from("/tmp/charon-test.json")));
        Session::new(ctx)
    }

    #[tokio::test]
    async fn test_ack_compaction() {
        let session = test_session();

        // 5 KiB splits into three chunks at max_payload 2048
        session.test_enqueue(Bytes::from(vec![1u8; 5 * 1024]));
        let mut sns = Vec::new();
        while let Some((_, sn)) = session.test_take_chunk() {
            sns.push(sn);
        }
        assert_eq!(sns, vec![1, 2, 3]);

        // two in-order acks compact away sns 1 and 2
        session.test_ack(build_ack(2, &[]));
        assert_eq!(session.test_wait_ack_keys(), vec![3]);
        assert_eq!(session.test_continue_sn(), 2);
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let session = test_session();
        session.test_enqueue(Bytes::from(vec![1u8; 3000]));
        while session.test_take_chunk().is_some() {}

        session.test_ack(build_ack(1, &[2]));
        session.test_ack(build_ack(1, &[2]));
        assert!(session.test_wait_ack_keys().is_empty());
        assert_eq!(session.test_continue_sn(), 2);
    }

    #[tokio::test]
    async fn test_out_of_order_ack_keeps_gap() {
        let session = test_session();
        session.test_enqueue(Bytes::from(vec![1u8; 5000]));
        while session.test_take_chunk().is_some() {}

        // only sn 2 acked explicitly: nothing compacts past the gap at 1
        session.test_ack(build_ack(0, &[2]));
        assert_eq!(session.test_wait_ack_keys(), vec![1, 2, 3]);
        assert_eq!(session.test_continue_sn(), 0);

        session.test_ack(build_ack(3, &[]));
        assert!(session.test_wait_ack_keys().is_empty());
        assert_eq!(session.test_continue_sn(), 3);
    }
}
