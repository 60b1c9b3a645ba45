//! Logical tunnel connection
//!
//! One `Conn` is one local socket carried through the relay session.
//! The reader task frames local bytes into data commands; incoming
//! command blocks are dispatched by `put_cmd_data`. Flow control is a
//! byte window: the local reader parks once the peer falls
//! `window_size` bytes behind, and we ack our own receive position
//! every `window_ack` bytes so the peer can keep sending.

use crate::session::Session;
use crate::sniff::{PeekableStream, PeekReadHalf};
use crate::wire::{ConnCommand, ConnFrame};
use bytes::Bytes;
use std::sync::{Arc, Mutex, Weak};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

/// Frame overhead on a data command: conn record header (8) plus
/// seq (4) and cmd (1)
pub const FRAME_OVERHEAD: usize = 13;

enum WriteOp {
    Data(Bytes),
    Shutdown,
}

struct ConnState {
    /// seq tag on the next frame we emit
    next_seq: u32,
    /// data bytes sent upstream
    sent_bytes: u64,
    /// send position the peer has acked
    peer_acked: u64,
    /// data bytes received and handed to the local socket
    recv_position: u64,
    /// receive position we last acked
    last_ack_sent: u64,
    stopped: bool,
}

pub struct Conn {
    pub conn_id: u32,
    pub host: String,
    pub port: u16,
    pub is_client: bool,

    session: Weak<Session>,
    state: Mutex<ConnState>,
    window_size: u64,
    window_ack: u64,

    write_tx: mpsc::UnboundedSender<WriteOp>,
    /// Wakes a producer parked on a full send window
    window_open: Notify,
    closed_tx: watch::Sender<bool>,
}

/// Status line data for one connection
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnStatus {
    pub conn_id: u32,
    pub host: String,
    pub port: u16,
    pub sent_bytes: u64,
    pub peer_acked: u64,
    pub recv_position: u64,
}

impl Conn {
    /// Register the connection and spawn its socket tasks
    pub fn start(
        session: &Arc<Session>,
        conn_id: u32,
        stream: PeekableStream,
        host: String,
        port: u16,
        window_size: u64,
        window_ack: u64,
        is_client: bool,
        read_chunk: usize,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let conn = Arc::new(Self {
            conn_id,
            host,
            port,
            is_client,
            session: Arc::downgrade(session),
            state: Mutex::new(ConnState {
                next_seq: 1,
                sent_bytes: 0,
                peer_acked: 0,
                recv_position: 0,
                last_ack_sent: 0,
                stopped: false,
            }),
            window_size,
            window_ack,
            write_tx,
            window_open: Notify::new(),
            closed_tx,
        });

        tokio::spawn(Self::write_loop(write_rx, write_half));
        tokio::spawn(conn.clone().read_loop(read_half, read_chunk));

        conn
    }

    async fn write_loop(mut rx: mpsc::UnboundedReceiver<WriteOp>, mut half: OwnedWriteHalf) {
        while let Some(op) = rx.recv().await {
            match op {
                WriteOp::Data(data) => {
                    if half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                WriteOp::Shutdown => break,
            }
        }
        let _ = half.shutdown().await;
    }

    async fn read_loop(self: Arc<Self>, mut half: PeekReadHalf, read_chunk: usize) {
        loop {
            let chunk = match half.read_chunk(read_chunk).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("conn:{} local read fail: {}", self.conn_id, e);
                    self.stop("local read fail");
                    return;
                }
            };
            if chunk.is_empty() {
                self.stop("local closed");
                return;
            }
            if !self.send_upstream(chunk).await {
                return;
            }
        }
    }

    /// Frame local bytes as a data command, respecting the send window
    async fn send_upstream(&self, data: Bytes) -> bool {
        loop {
            let notified = self.window_open.notified();
            {
                let state = self.state.lock().unwrap();
                if state.stopped {
                    return false;
                }
                if state.sent_bytes - state.peer_acked < self.window_size {
                    break;
                }
            }
            notified.await;
        }

        let Some(session) = self.session.upgrade() else {
            return false;
        };

        let frame = {
            let mut state = self.state.lock().unwrap();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.sent_bytes += data.len() as u64;
            ConnFrame {
                seq,
                cmd: ConnCommand::Data(data),
            }
        };
        session.send_conn_data(self.conn_id, &frame.encode());
        true
    }

    /// Dispatch one downloaded command block for this connection
    pub fn put_cmd_data(&self, block: Bytes) {
        let frame = match ConnFrame::decode(block) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("conn:{} bad command block: {}", self.conn_id, e);
                self.stop("bad command block");
                return;
            }
        };

        match frame.cmd {
            ConnCommand::Data(data) => {
                let ack_position = {
                    let mut state = self.state.lock().unwrap();
                    if state.stopped {
                        return;
                    }
                    state.recv_position += data.len() as u64;
                    if state.recv_position - state.last_ack_sent >= self.window_ack {
                        state.last_ack_sent = state.recv_position;
                        let seq = state.next_seq;
                        state.next_seq += 1;
                        Some((seq, state.recv_position))
                    } else {
                        None
                    }
                };

                let _ = self.write_tx.send(WriteOp::Data(data));

                if let Some((seq, position)) = ack_position {
                    if let Some(session) = self.session.upgrade() {
                        let frame = ConnFrame {
                            seq,
                            cmd: ConnCommand::Ack(position),
                        };
                        session.send_conn_data(self.conn_id, &frame.encode());
                    }
                }
            }
            ConnCommand::Closed(reason) => {
                debug!(
                    "conn:{} closed by peer: {}",
                    self.conn_id,
                    String::from_utf8_lossy(&reason)
                );
                self.shutdown_local();
            }
            ConnCommand::Ack(position) => {
                let mut state = self.state.lock().unwrap();
                if position > state.peer_acked {
                    state.peer_acked = position;
                }
                drop(state);
                self.window_open.notify_waiters();
            }
            ConnCommand::Connect { .. } => {
                // server-initiated streams are not part of this build
                warn!("conn:{} unexpected connect command", self.conn_id);
            }
        }
    }

    /// Close after telling the peer, used when the local side ends
    pub fn stop(&self, reason: &str) {
        let frame = {
            let mut state = self.state.lock().unwrap();
            if state.stopped {
                return;
            }
            state.stopped = true;
            let seq = state.next_seq;
            state.next_seq += 1;
            ConnFrame {
                seq,
                cmd: ConnCommand::Closed(Bytes::copy_from_slice(reason.as_bytes())),
            }
        };

        if let Some(session) = self.session.upgrade() {
            session.send_conn_data(self.conn_id, &frame.encode());
            session.remove_conn(self.conn_id);
        }

        self.finish();
    }

    /// Close without telling the peer, used when the peer closed first
    /// or the whole session is going down
    pub fn shutdown_local(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        if let Some(session) = self.session.upgrade() {
            session.remove_conn(self.conn_id);
        }
        self.finish();
    }

    fn finish(&self) {
        let _ = self.write_tx.send(WriteOp::Shutdown);
        self.window_open.notify_waiters();
        let _ = self.closed_tx.send(true);
    }

    /// Resolve once the connection has fully ended
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn status(&self) -> ConnStatus {
        let state = self.state.lock().unwrap();
        ConnStatus {
            conn_id: self.conn_id,
            host: self.host.clone(),
            port: self.port,
            sent_bytes: state.sent_bytes,
            peer_acked: state.peer_acked,
            recv_position: state.recv_position,
        }
    }
}
