//! Wire framing
//!
//! Fixed little-endian layouts shared with the relay server. Every
//! packet starts with magic `'P'`, a protocol version and a pack type.
//! Bodies travel through the configured [`crate::crypto::Encryptor`].
//!
//! The upload data stream is a concatenation of
//! `sn || len || payload` records; each payload in turn concatenates
//! `conn_id || len || block` records; each block is one connection
//! command (`seq || cmd || body`).

use crate::buffers::{ReadBuffer, WriteBuffer};
use bytes::Bytes;
use thiserror::Error;

pub const MAGIC: u8 = b'P';
pub const PROTOCOL_VERSION: u8 = 2;

pub const PACK_TYPE_LOGIN: u8 = 1;
pub const PACK_TYPE_DATA: u8 = 2;
pub const PACK_TYPE_ERROR: u8 = 3;

/// Server error codes carried in a pack_type=3 response
pub const ERR_NO_QUOTA: u8 = 1;
pub const ERR_UNPACK: u8 = 2;
pub const ERR_SESSION_NOT_FOUND: u8 = 3;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("packet truncated")]
    Truncated,

    #[error("bad magic byte: {0:#04x}")]
    BadMagic(u8),

    #[error("unsupported protocol version: {0}")]
    BadVersion(u8),

    #[error("unexpected pack type: {0}")]
    BadPackType(u8),

    #[error("unknown connection command: {0}")]
    BadCommand(u8),
}

type Result<T> = std::result::Result<T, WireError>;

/// Session login, pack_type=1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub session_id: [u8; 8],
    pub max_payload: u32,
    pub send_delay: u16,
    pub window_size: u32,
    pub window_ack: u32,
    pub resend_timeout: u16,
    pub ack_delay: u16,
    pub account: String,
    pub password: String,
}

impl LoginRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = WriteBuffer::with_capacity(64 + self.account.len() + self.password.len());
        buf.put_u8(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(PACK_TYPE_LOGIN);
        buf.append(&self.session_id);
        buf.put_u32_le(self.max_payload);
        buf.put_u16_le(self.send_delay);
        buf.put_u32_le(self.window_size);
        buf.put_u32_le(self.window_ack);
        buf.put_u16_le(self.resend_timeout);
        buf.put_u16_le(self.ack_delay);
        buf.put_u16_le(self.account.len() as u16);
        buf.append(self.account.as_bytes());
        buf.put_u16_le(self.password.len() as u16);
        buf.append(self.password.as_bytes());
        buf.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self> {
        let mut r = ReadBuffer::new(data);
        check_head(&mut r, PACK_TYPE_LOGIN)?;
        let session_id = get_session_id(&mut r)?;
        let max_payload = r.get_u32_le().ok_or(WireError::Truncated)?;
        let send_delay = r.get_u16_le().ok_or(WireError::Truncated)?;
        let window_size = r.get_u32_le().ok_or(WireError::Truncated)?;
        let window_ack = r.get_u32_le().ok_or(WireError::Truncated)?;
        let resend_timeout = r.get_u16_le().ok_or(WireError::Truncated)?;
        let ack_delay = r.get_u16_le().ok_or(WireError::Truncated)?;
        let account = get_string(&mut r)?;
        let password = get_string(&mut r)?;
        Ok(Self {
            session_id,
            max_payload,
            send_delay,
            window_size,
            window_ack,
            resend_timeout,
            ack_delay,
            account,
            password,
        })
    }
}

/// Login result, pack_type=1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub res: u8,
    pub message: String,
}

impl LoginResponse {
    pub fn decode(data: Bytes) -> Result<Self> {
        let mut r = ReadBuffer::new(data);
        check_head(&mut r, PACK_TYPE_LOGIN)?;
        let res = r.get_u8().ok_or(WireError::Truncated)?;
        let message = get_string(&mut r)?;
        Ok(Self { res, message })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = WriteBuffer::new();
        buf.put_u8(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(PACK_TYPE_LOGIN);
        buf.put_u8(self.res);
        buf.put_u16_le(self.message.len() as u16);
        buf.append(self.message.as_bytes());
        buf.freeze()
    }
}

/// One HTTP round trip upload, pack_type=2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub session_id: [u8; 8],
    pub transfer_no: u32,
    pub server_timeout: u8,
    pub data: Bytes,
    pub ack: Bytes,
}

impl TransferRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = WriteBuffer::with_capacity(23 + self.data.len() + self.ack.len());
        buf.put_u8(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(PACK_TYPE_DATA);
        buf.append(&self.session_id);
        buf.put_u32_le(self.transfer_no);
        buf.put_u8(self.server_timeout);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_u16_le(self.ack.len() as u16);
        buf.append(&self.data);
        buf.append(&self.ack);
        buf.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self> {
        let mut r = ReadBuffer::new(data);
        check_head(&mut r, PACK_TYPE_DATA)?;
        let session_id = get_session_id(&mut r)?;
        let transfer_no = r.get_u32_le().ok_or(WireError::Truncated)?;
        let server_timeout = r.get_u8().ok_or(WireError::Truncated)?;
        let data_len = r.get_u32_le().ok_or(WireError::Truncated)? as usize;
        let ack_len = r.get_u16_le().ok_or(WireError::Truncated)? as usize;
        let data = r.get(data_len).ok_or(WireError::Truncated)?;
        let ack = r.get(ack_len).ok_or(WireError::Truncated)?;
        Ok(Self {
            session_id,
            transfer_no,
            server_timeout,
            data,
            ack,
        })
    }
}

/// One HTTP round trip download, pack_type=2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResponse {
    /// Server-side processing time (ms)
    pub time_cost_ms: u32,
    /// Bytes still queued for us on the server
    pub server_pool_size: u32,
    pub data: Bytes,
    pub ack: Bytes,
}

impl TransferResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = WriteBuffer::with_capacity(17 + self.data.len() + self.ack.len());
        buf.put_u8(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(PACK_TYPE_DATA);
        buf.put_u32_le(self.time_cost_ms);
        buf.put_u32_le(self.server_pool_size);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_u16_le(self.ack.len() as u16);
        buf.append(&self.data);
        buf.append(&self.ack);
        buf.freeze()
    }
}

/// A decoded server response to a round trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    Transfer(TransferResponse),
    Error { code: u8, message: String },
}

impl ServerPacket {
    pub fn decode(data: Bytes) -> Result<Self> {
        let mut r = ReadBuffer::new(data);
        let magic = r.get_u8().ok_or(WireError::Truncated)?;
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let version = r.get_u8().ok_or(WireError::Truncated)?;
        if version != PROTOCOL_VERSION {
            return Err(WireError::BadVersion(version));
        }
        let pack_type = r.get_u8().ok_or(WireError::Truncated)?;
        match pack_type {
            PACK_TYPE_DATA => {
                let time_cost_ms = r.get_u32_le().ok_or(WireError::Truncated)?;
                let server_pool_size = r.get_u32_le().ok_or(WireError::Truncated)?;
                let data_len = r.get_u32_le().ok_or(WireError::Truncated)? as usize;
                let ack_len = r.get_u16_le().ok_or(WireError::Truncated)? as usize;
                let data = r.get(data_len).ok_or(WireError::Truncated)?;
                let ack = r.get(ack_len).ok_or(WireError::Truncated)?;
                Ok(Self::Transfer(TransferResponse {
                    time_cost_ms,
                    server_pool_size,
                    data,
                    ack,
                }))
            }
            PACK_TYPE_ERROR => {
                let code = r.get_u8().ok_or(WireError::Truncated)?;
                let message = get_string(&mut r)?;
                Ok(Self::Error { code, message })
            }
            other => Err(WireError::BadPackType(other)),
        }
    }
}

/// One command on a logical connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnCommand {
    /// Open a stream to host:port; sock_type 0 is TCP
    Connect {
        sock_type: u8,
        host: Bytes,
        port: u16,
    },
    /// Stream bytes
    Data(Bytes),
    /// Stream ended, with a reason
    Closed(Bytes),
    /// Receive-position ack for flow control
    Ack(u64),
}

pub const CMD_CONNECT: u8 = 0;
pub const CMD_DATA: u8 = 1;
pub const CMD_CLOSED: u8 = 2;
pub const CMD_ACK: u8 = 3;

/// `seq || cmd || body` block carried inside a connection record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnFrame {
    pub seq: u32,
    pub cmd: ConnCommand,
}

impl ConnFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = WriteBuffer::new();
        buf.put_u32_le(self.seq);
        match &self.cmd {
            ConnCommand::Connect {
                sock_type,
                host,
                port,
            } => {
                buf.put_u8(CMD_CONNECT);
                buf.put_u8(*sock_type);
                buf.put_u16_le(host.len() as u16);
                buf.append(host);
                buf.put_u16_le(*port);
            }
            ConnCommand::Data(data) => {
                buf.put_u8(CMD_DATA);
                buf.append(data);
            }
            ConnCommand::Closed(reason) => {
                buf.put_u8(CMD_CLOSED);
                buf.append(reason);
            }
            ConnCommand::Ack(position) => {
                buf.put_u8(CMD_ACK);
                buf.put_u64_le(*position);
            }
        }
        buf.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self> {
        let mut r = ReadBuffer::new(data);
        let seq = r.get_u32_le().ok_or(WireError::Truncated)?;
        let cmd_id = r.get_u8().ok_or(WireError::Truncated)?;
        let cmd = match cmd_id {
            CMD_CONNECT => {
                let sock_type = r.get_u8().ok_or(WireError::Truncated)?;
                let host_len = r.get_u16_le().ok_or(WireError::Truncated)? as usize;
                let host = r.get(host_len).ok_or(WireError::Truncated)?;
                let port = r.get_u16_le().ok_or(WireError::Truncated)?;
                ConnCommand::Connect {
                    sock_type,
                    host,
                    port,
                }
            }
            CMD_DATA => ConnCommand::Data(r.rest()),
            CMD_CLOSED => ConnCommand::Closed(r.rest()),
            CMD_ACK => ConnCommand::Ack(r.get_u64_le().ok_or(WireError::Truncated)?),
            other => return Err(WireError::BadCommand(other)),
        };
        Ok(Self { seq, cmd })
    }
}

/// Append a `sn || len || payload` record to an upload buffer
pub fn put_sn_record(buf: &mut WriteBuffer, sn: u32, payload: &[u8]) {
    buf.put_u32_le(sn);
    buf.put_u32_le(payload.len() as u32);
    buf.append(payload);
}

/// Pull the next `sn || len || payload` record; None at end of stream
pub fn next_sn_record(r: &mut ReadBuffer) -> Result<Option<(u32, Bytes)>> {
    if r.is_empty() {
        return Ok(None);
    }
    let sn = r.get_u32_le().ok_or(WireError::Truncated)?;
    let len = r.get_u32_le().ok_or(WireError::Truncated)? as usize;
    let payload = r.get(len).ok_or(WireError::Truncated)?;
    Ok(Some((sn, payload)))
}

/// Append a `conn_id || len || block` record to a payload buffer
pub fn put_conn_record(buf: &mut WriteBuffer, conn_id: u32, block: &[u8]) {
    buf.put_u32_le(conn_id);
    buf.put_u32_le(block.len() as u32);
    buf.append(block);
}

/// Pull the next `conn_id || len || block` record; None at end of payload
pub fn next_conn_record(r: &mut ReadBuffer) -> Result<Option<(u32, Bytes)>> {
    if r.is_empty() {
        return Ok(None);
    }
    let conn_id = r.get_u32_le().ok_or(WireError::Truncated)?;
    let len = r.get_u32_le().ok_or(WireError::Truncated)? as usize;
    let block = r.get(len).ok_or(WireError::Truncated)?;
    Ok(Some((conn_id, block)))
}

/// Build an ack body: cumulative ack then each out-of-order sn
pub fn build_ack(last_ack: u32, pending: &[u32]) -> Bytes {
    let mut buf = WriteBuffer::with_capacity(4 + 4 * pending.len());
    buf.put_u32_le(last_ack);
    for sn in pending {
        buf.put_u32_le(*sn);
    }
    buf.freeze()
}

/// Parse an ack body into (last_ack, explicit sns)
pub fn parse_ack(data: Bytes) -> Result<(u32, Vec<u32>)> {
    let mut r = ReadBuffer::new(data);
    let last_ack = r.get_u32_le().ok_or(WireError::Truncated)?;
    let mut sns = Vec::new();
    while !r.is_empty() {
        sns.push(r.get_u32_le().ok_or(WireError::Truncated)?);
    }
    Ok((last_ack, sns))
}

fn check_head(r: &mut ReadBuffer, expect_type: u8) -> Result<()> {
    let magic = r.get_u8().ok_or(WireError::Truncated)?;
    if magic != MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let version = r.get_u8().ok_or(WireError::Truncated)?;
    if version != PROTOCOL_VERSION {
        return Err(WireError::BadVersion(version));
    }
    let pack_type = r.get_u8().ok_or(WireError::Truncated)?;
    if pack_type != expect_type {
        return Err(WireError::BadPackType(pack_type));
    }
    Ok(())
}

fn get_session_id(r: &mut ReadBuffer) -> Result<[u8; 8]> {
    let raw = r.get(8).ok_or(WireError::Truncated)?;
    let mut id = [0u8; 8];
    id.copy_from_slice(&raw);
    Ok(id)
}

fn get_string(r: &mut ReadBuffer) -> Result<String> {
    let len = r.get_u16_le().ok_or(WireError::Truncated)? as usize;
    let raw = r.get(len).ok_or(WireError::Truncated)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_request_roundtrip() {
        let req = LoginRequest {
            session_id: *b"abcdefgh",
            max_payload: 8192,
            send_delay: 100,
            window_size: 1 << 21,
            window_ack: 1 << 16,
            resend_timeout: 5000,
            ack_delay: 300,
            account: "user".to_string(),
            password: "pass".to_string(),
        };
        let wire = req.encode();
        assert_eq!(LoginRequest::decode(wire).unwrap(), req);
    }

    #[test]
    fn test_transfer_request_roundtrip() {
        let req = TransferRequest {
            session_id: *b"zzzzzzzz",
            transfer_no: 42,
            server_timeout: 3,
            data: Bytes::from_static(b"payload"),
            ack: build_ack(7, &[9, 11]),
        };
        let wire = req.encode();
        assert_eq!(TransferRequest::decode(wire).unwrap(), req);
    }

    #[test]
    fn test_server_packet_transfer() {
        let resp = TransferResponse {
            time_cost_ms: 120,
            server_pool_size: 0,
            data: Bytes::from_static(b"dl"),
            ack: Bytes::from_static(b""),
        };
        match ServerPacket::decode(resp.encode()).unwrap() {
            ServerPacket::Transfer(t) => assert_eq!(t, resp),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_server_packet_error() {
        let mut buf = WriteBuffer::new();
        buf.put_u8(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(PACK_TYPE_ERROR);
        buf.put_u8(ERR_SESSION_NOT_FOUND);
        buf.put_u16_le(4);
        buf.append(b"gone");
        match ServerPacket::decode(buf.freeze()).unwrap() {
            ServerPacket::Error { code, message } => {
                assert_eq!(code, ERR_SESSION_NOT_FOUND);
                assert_eq!(message, "gone");
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_conn_frame_commands() {
        let frames = vec![
            ConnFrame {
                seq: 0,
                cmd: ConnCommand::Connect {
                    sock_type: 0,
                    host: Bytes::from_static(b"example.com"),
                    port: 443,
                },
            },
            ConnFrame {
                seq: 1,
                cmd: ConnCommand::Data(Bytes::from_static(b"some bytes")),
            },
            ConnFrame {
                seq: 2,
                cmd: ConnCommand::Closed(Bytes::from_static(b"eof")),
            },
            ConnFrame {
                seq: 3,
                cmd: ConnCommand::Ack(1 << 40),
            },
        ];
        for frame in frames {
            assert_eq!(ConnFrame::decode(frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn test_sn_stream_walk() {
        let mut buf = WriteBuffer::new();
        put_sn_record(&mut buf, 1, b"one");
        put_sn_record(&mut buf, 2, b"two");
        let mut r = ReadBuffer::new(buf.freeze());
        assert_eq!(
            next_sn_record(&mut r).unwrap(),
            Some((1, Bytes::from_static(b"one")))
        );
        assert_eq!(
            next_sn_record(&mut r).unwrap(),
            Some((2, Bytes::from_static(b"two")))
        );
        assert_eq!(next_sn_record(&mut r).unwrap(), None);
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let req = TransferRequest {
            session_id: *b"abcdefgh",
            transfer_no: 1,
            server_timeout: 0,
            data: Bytes::from_static(b"data"),
            ack: Bytes::new(),
        };
        let wire = req.encode();
        let cut = wire.slice(..wire.len() - 3);
        assert!(matches!(
            TransferRequest::decode(cut),
            Err(WireError::Truncated)
        ));
    }

    #[test]
    fn test_ack_roundtrip() {
        let wire = build_ack(12, &[14, 16, 17]);
        assert_eq!(parse_ack(wire).unwrap(), (12, vec![14, 16, 17]));
    }
}
