//! Connection sniffing
//!
//! Looks at the first bytes of an accepted socket to learn the target
//! host: the server_name extension of a TLS ClientHello, or the Host
//! header of a plain HTTP/1.x request. Nothing is consumed: sniffed
//! bytes stay in a replay buffer and every downstream reader sees the
//! stream from its first byte.

use bytes::{Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

#[derive(Error, Debug)]
pub enum SniffError {
    #[error("no host name in leading bytes")]
    NoHost,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Lead bytes that can start an HTTP/1.x method we understand
const HTTP_LEAD: &[u8] = b"GPDOHT";

const SUPPORT_METHODS: [&[u8]; 6] = [b"GET", b"POST", b"HEAD", b"PUT", b"DELETE", b"PATCH"];

/// A socket with a replayable look-ahead buffer
///
/// `peek` reads ahead without consuming; reads drain the look-ahead
/// first, then the socket, so the byte stream downstream consumers see
/// is exactly what arrived on the wire.
pub struct PeekableStream<S = TcpStream> {
    stream: S,
    buf: BytesMut,
}

impl<S> PeekableStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Push bytes to the front of the replay buffer
    pub fn prepend(&mut self, data: &[u8]) {
        let mut joined = BytesMut::with_capacity(data.len() + self.buf.len());
        joined.extend_from_slice(data);
        joined.extend_from_slice(&self.buf);
        self.buf = joined;
    }

    /// Bytes currently buffered ahead of the read cursor
    pub fn peeked(&self) -> &[u8] {
        &self.buf
    }
}

impl<S: AsyncRead + Unpin> PeekableStream<S> {
    /// Read ahead toward `n` buffered bytes (at most one socket read)
    /// and return everything buffered so far
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        if self.buf.len() < n {
            let mut chunk = vec![0u8; n - self.buf.len()];
            let got = self.stream.read(&mut chunk).await?;
            self.buf.extend_from_slice(&chunk[..got]);
        }
        Ok(&self.buf)
    }
}

impl PeekableStream<TcpStream> {
    /// Split for independent read/write tasks; the replay buffer stays
    /// with the read half
    pub fn into_split(self) -> (PeekReadHalf, OwnedWriteHalf) {
        let (read, write) = self.stream.into_split();
        (
            PeekReadHalf {
                buf: self.buf,
                half: read,
            },
            write,
        )
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Read half of a split [`PeekableStream`]
pub struct PeekReadHalf {
    buf: BytesMut,
    half: OwnedReadHalf,
}

impl PeekReadHalf {
    /// Read up to `max` bytes, draining the replay buffer first.
    /// Returns an empty chunk at EOF.
    pub async fn read_chunk(&mut self, max: usize) -> io::Result<Bytes> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(max);
            return Ok(self.buf.split_to(n).freeze());
        }
        let mut chunk = vec![0u8; max];
        let got = self.half.read(&mut chunk).await?;
        chunk.truncate(got);
        Ok(Bytes::from(chunk))
    }
}

/// Discover the target host from a socket's first bytes
pub async fn sniff_host<S: AsyncRead + Unpin>(
    stream: &mut PeekableStream<S>,
) -> Result<String, SniffError> {
    let lead = stream.peek(1).await?;
    let Some(&leadbyte) = lead.first() else {
        return Err(SniffError::NoHost);
    };

    if leadbyte == 0x16 {
        // TLS record; a second peek gives a slow hello time to arrive
        for _ in 0..2 {
            let data = stream.peek(1024).await?;
            if is_clienthello(data) {
                return match extract_sni_name(data) {
                    Some(name) => Ok(name),
                    None => Err(SniffError::NoHost),
                };
            }
        }
        return Err(SniffError::NoHost);
    }

    if leadbyte == 0x80 {
        // SSLv2-style hello carries no server name
        return Err(SniffError::NoHost);
    }

    if !HTTP_LEAD.contains(&leadbyte) {
        return Err(SniffError::NoHost);
    }

    let mut data = Vec::new();
    for attempt in 0..2 {
        data = stream.peek(65535).await?.to_vec();
        if !data.is_empty() {
            break;
        }
        if attempt == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    if data.is_empty() {
        return Err(SniffError::NoHost);
    }

    parse_http_host(&data).ok_or(SniffError::NoHost)
}

/// Does this look like a complete TLS ClientHello record?
fn is_clienthello(data: &[u8]) -> bool {
    if data.len() < 20 {
        return false;
    }
    if data[0] == 0x16 && data[1] == 0x03 {
        let length = u16::from_be_bytes([data[3], data[4]]) as usize;
        return data.len() == 5 + length;
    }
    false
}

/// Walk a ClientHello to the server_name extension
fn extract_sni_name(data: &[u8]) -> Option<String> {
    // record header (5) + handshake header (4) + version (2) + random (32)
    let mut pos = 0x2b;
    let session_id_len = *data.get(pos)? as usize;
    pos += 1 + session_id_len;
    let cipher_suites_len = be16(data, pos)? as usize;
    // suites, then the single-method compression list
    pos += 2 + cipher_suites_len + 2;
    let _extensions_len = be16(data, pos)?;
    pos += 2;

    while pos + 4 <= data.len() {
        let etype = be16(data, pos)?;
        let elen = be16(data, pos + 2)? as usize;
        let edata = data.get(pos + 4..pos + 4 + elen)?;
        if etype == 0 {
            // skip list length, entry type, name length
            let name = edata.get(5..)?;
            return String::from_utf8(name.to_vec()).ok();
        }
        pos += 4 + elen;
    }
    None
}

/// Pull the Host header out of a buffered HTTP/1.x request head
fn parse_http_host(data: &[u8]) -> Option<String> {
    let n1 = find(data, b"\r\n", 0)?;
    let req_line = &data[..n1];
    let words: Vec<&[u8]> = req_line.split(|b| *b == b' ').filter(|w| !w.is_empty()).collect();
    if words.len() != 2 && words.len() != 3 {
        return None;
    }
    if !SUPPORT_METHODS.contains(&words[0]) {
        return None;
    }

    let n2 = find(data, b"\r\n\r\n", n1)?;
    let header_block = &data[n1 + 2..n2];

    for line in header_block.split(|b| *b == b'\n') {
        let line = match line.strip_suffix(b"\r") {
            Some(l) => l,
            None => line,
        };
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            continue;
        };
        let (name, value) = line.split_at(colon);
        if name.trim_ascii().eq_ignore_ascii_case(b"host") {
            let value = value[1..].trim_ascii();
            let host = netloc_host(value);
            if host.is_empty() {
                return None;
            }
            return String::from_utf8(host.to_vec()).ok();
        }
    }
    None
}

/// Strip a trailing `:port` from a netloc, splitting on the rightmost
/// colon only when what follows parses as a port
fn netloc_host(netloc: &[u8]) -> &[u8] {
    if let Some(colon) = netloc.iter().rposition(|b| *b == b':') {
        let tail = &netloc[colon + 1..];
        if !tail.is_empty() && tail.iter().all(|b| b.is_ascii_digit()) {
            return &netloc[..colon];
        }
    }
    netloc
}

fn find(data: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn be16(data: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// A minimal but well-formed ClientHello with one SNI entry
    pub(crate) fn client_hello(name: &[u8]) -> Vec<u8> {
        let sni_entry_len = name.len() + 3; // type + length + name
        let ext_payload_len = sni_entry_len + 2; // list length prefix
        let ext_block_len = ext_payload_len + 4; // extension type + length

        let mut hello = Vec::new();
        hello.push(0x01); // handshake: client hello
        let body_len = 2 + 32 + 1 + 4 + 2 + 2 + ext_block_len;
        hello.extend_from_slice(&[0, (body_len >> 8) as u8, body_len as u8]);
        hello.extend_from_slice(&[0x03, 0x03]); // version
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0); // session id length
        hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        hello.extend_from_slice(&[0x01, 0x00]); // null compression
        hello.extend_from_slice(&(ext_block_len as u16).to_be_bytes());
        hello.extend_from_slice(&[0x00, 0x00]); // server_name extension
        hello.extend_from_slice(&(ext_payload_len as u16).to_be_bytes());
        hello.extend_from_slice(&(sni_entry_len as u16).to_be_bytes());
        hello.push(0x00); // host_name
        hello.extend_from_slice(&(name.len() as u16).to_be_bytes());
        hello.extend_from_slice(name);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(hello.len() as u16).to_be_bytes());
        record.extend_from_slice(&hello);
        record
    }

    #[tokio::test]
    async fn test_sniff_tls_sni() {
        let hello = client_hello(b"example.com");
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = client;
        writer.write_all(&hello).await.unwrap();

        let mut stream = PeekableStream::new(server);
        let host = sniff_host(&mut stream).await.unwrap();
        assert_eq!(host, "example.com");

        // Re-read: the original bytes are intact
        let mut back = vec![0u8; hello.len()];
        stream.read_exact(&mut back).await.unwrap();
        assert_eq!(back, hello);
    }

    #[tokio::test]
    async fn test_sniff_http_host_with_port() {
        let req = b"GET / HTTP/1.1\r\nHost: foo.bar:8443\r\n\r\n";
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = client;
        writer.write_all(req).await.unwrap();

        let mut stream = PeekableStream::new(server);
        let host = sniff_host(&mut stream).await.unwrap();
        assert_eq!(host, "foo.bar");

        let mut back = vec![0u8; req.len()];
        stream.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, req);
    }

    #[tokio::test]
    async fn test_sniff_rejects_unknown_lead() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = client;
        writer.write_all(b"\x05\x01\x00").await.unwrap();

        let mut stream = PeekableStream::new(server);
        assert!(matches!(
            sniff_host(&mut stream).await,
            Err(SniffError::NoHost)
        ));
    }

    #[tokio::test]
    async fn test_sslv2_lead_has_no_host() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = client;
        writer.write_all(&[0x80, 0x2e, 0x01, 0x03]).await.unwrap();

        let mut stream = PeekableStream::new(server);
        assert!(matches!(
            sniff_host(&mut stream).await,
            Err(SniffError::NoHost)
        ));
    }

    #[tokio::test]
    async fn test_prepend_replays_first() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = client;
        writer.write_all(b"world").await.unwrap();

        let mut stream = PeekableStream::new(server);
        stream.prepend(b"hello ");
        let mut back = vec![0u8; 11];
        stream.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"hello world");
    }

    #[test]
    fn test_netloc_without_port() {
        assert_eq!(netloc_host(b"plain.host"), b"plain.host");
        assert_eq!(netloc_host(b"host:443"), b"host");
        assert_eq!(netloc_host(b"host:"), b"host:");
    }
}
