//! Transport buffers
//!
//! The tunnel's working storage:
//! - `WriteBuffer` / `ReadBuffer`: cursor-based byte accumulators used
//!   by the wire codec
//! - `SendBuffer`: FIFO of upload chunks, assigns a sequence number on
//!   dequeue and splits oversized entries on enqueue
//! - `BlockReceivePool`: reorders downloaded chunks by sequence number
//!   and releases them strictly in order
//! - `WaitQueue`: parks round-trip workers; wakes the lowest worker id
//!   first so a small set of workers drains light traffic

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::oneshot;

/// Append-only byte accumulator
#[derive(Default)]
pub struct WriteBuffer {
    buf: BytesMut,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self { buf: BytesMut::with_capacity(n) }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.extend_from_slice(&[v]);
    }

    pub fn put_u16_le(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64_le(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over received bytes; every read is bounds-checked
pub struct ReadBuffer {
    data: Bytes,
}

impl ReadBuffer {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&mut self, n: usize) -> Option<Bytes> {
        if self.data.len() < n {
            return None;
        }
        Some(self.data.split_to(n))
    }

    pub fn get_u8(&mut self) -> Option<u8> {
        self.get(1).map(|b| b[0])
    }

    pub fn get_u16_le(&mut self) -> Option<u16> {
        self.get(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32_le(&mut self) -> Option<u32> {
        self.get(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64_le(&mut self) -> Option<u64> {
        self.get(8)
            .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Remaining unread bytes
    pub fn rest(&mut self) -> Bytes {
        self.data.split_to(self.data.len())
    }
}

struct SendInner {
    queue: VecDeque<Bytes>,
    last_sn: u32,
    /// When the oldest queued chunk arrived; None while empty
    oldest_received: Option<Instant>,
}

/// FIFO of upload chunks
///
/// Sequence numbers are assigned at `get`, not `put`, so retransmitted
/// chunks (which re-enter the wire directly) never shift numbering.
pub struct SendBuffer {
    inner: Mutex<SendInner>,
    pool_size: AtomicUsize,
    max_payload: usize,
}

impl SendBuffer {
    pub fn new(max_payload: usize) -> Self {
        Self {
            inner: Mutex::new(SendInner {
                queue: VecDeque::new(),
                last_sn: 0,
                oldest_received: None,
            }),
            pool_size: AtomicUsize::new(0),
            max_payload,
        }
    }

    /// Queue a chunk, splitting anything over `max_payload` in order
    pub fn put(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let mut rest = data;
        while rest.len() > self.max_payload {
            let chunk = rest.split_to(self.max_payload);
            self.pool_size.fetch_add(chunk.len(), Ordering::Relaxed);
            inner.queue.push_back(chunk);
        }
        self.pool_size.fetch_add(rest.len(), Ordering::Relaxed);
        inner.queue.push_back(rest);
        if inner.oldest_received.is_none() {
            inner.oldest_received = Some(Instant::now());
        }
    }

    /// Dequeue the next chunk with a freshly assigned sequence number
    pub fn get(&self) -> Option<(Bytes, u32)> {
        let mut inner = self.inner.lock().unwrap();
        let chunk = inner.queue.pop_front()?;
        self.pool_size.fetch_sub(chunk.len(), Ordering::Relaxed);
        inner.last_sn += 1;
        let sn = inner.last_sn;
        if inner.queue.is_empty() {
            inner.oldest_received = None;
        }
        Some((chunk, sn))
    }

    /// Total queued bytes
    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }

    /// Age of the oldest queued chunk; None while empty
    pub fn oldest_received(&self) -> Option<Instant> {
        self.inner.lock().unwrap().oldest_received
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        inner.last_sn = 0;
        inner.oldest_received = None;
        self.pool_size.store(0, Ordering::Relaxed);
    }
}

struct ReceiveInner {
    next_sn: u32,
    block_list: BTreeMap<u32, Bytes>,
}

/// Reorders downloaded chunks and releases them strictly in sequence
///
/// `put` returns every chunk that became deliverable, in order. A
/// sequence number below `next_sn` is a retransmit duplicate and is
/// dropped.
pub struct BlockReceivePool {
    inner: Mutex<ReceiveInner>,
}

impl Default for BlockReceivePool {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockReceivePool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ReceiveInner {
                next_sn: 1,
                block_list: BTreeMap::new(),
            }),
        }
    }

    pub fn put(&self, sn: u32, payload: Bytes) -> Vec<Bytes> {
        let mut inner = self.inner.lock().unwrap();
        let mut ready = Vec::new();

        if sn < inner.next_sn {
            // duplicate
            return ready;
        }

        if sn == inner.next_sn {
            ready.push(payload);
            inner.next_sn += 1;
            loop {
                let next_sn = inner.next_sn;
                let Some(p) = inner.block_list.remove(&next_sn) else {
                    break;
                };
                ready.push(p);
                inner.next_sn += 1;
            }
        } else {
            inner.block_list.insert(sn, payload);
        }

        ready
    }

    /// Next in-order sequence number
    pub fn next_sn(&self) -> u32 {
        self.inner.lock().unwrap().next_sn
    }

    /// Sequence numbers buffered out of order
    pub fn pending_sns(&self) -> Vec<u32> {
        self.inner.lock().unwrap().block_list.keys().copied().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().block_list.len()
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_sn = 1;
        inner.block_list.clear();
    }
}

struct WaitInner {
    waiters: BTreeMap<usize, oneshot::Sender<bool>>,
    stopped: bool,
}

/// Parking lot for round-trip workers
///
/// `notify` wakes the waiter with the smallest id, so low-id workers
/// carry the traffic and high-id workers only run when the elastic
/// target asks for more concurrency. `stop` releases everyone with a
/// shutdown signal.
pub struct WaitQueue {
    inner: Mutex<WaitInner>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WaitInner {
                waiters: BTreeMap::new(),
                stopped: false,
            }),
        }
    }

    /// Park until notified. Returns false when the queue is stopping.
    pub async fn wait(&self, work_id: usize) -> bool {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.stopped {
                return false;
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.insert(work_id, tx);
            rx
        };
        rx.await.unwrap_or(false)
    }

    /// Wake the lowest-id parked worker, if any
    pub fn notify(&self) {
        let tx = {
            let mut inner = self.inner.lock().unwrap();
            match inner.waiters.keys().next().copied() {
                Some(id) => inner.waiters.remove(&id),
                None => None,
            }
        };
        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
    }

    /// Number of parked workers
    pub fn waiting(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }

    /// Release all waiters with the shutdown signal
    pub fn stop(&self) {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.stopped = true;
            let keys: Vec<usize> = inner.waiters.keys().copied().collect();
            keys.into_iter()
                .filter_map(|id| inner.waiters.remove(&id))
                .collect()
        };
        for tx in drained {
            let _ = tx.send(false);
        }
    }

    /// Re-arm after a stop so a fresh session can reuse the queue
    pub fn restart(&self) {
        self.inner.lock().unwrap().stopped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_send_buffer_splits_on_put() {
        let buf = SendBuffer::new(2048);
        buf.put(Bytes::from(vec![7u8; 5 * 1024]));
        assert_eq!(buf.pool_size(), 5 * 1024);

        let (c1, sn1) = buf.get().unwrap();
        let (c2, sn2) = buf.get().unwrap();
        let (c3, sn3) = buf.get().unwrap();
        assert_eq!((sn1, sn2, sn3), (1, 2, 3));
        assert_eq!(c1.len(), 2048);
        assert_eq!(c2.len(), 2048);
        assert_eq!(c3.len(), 1024);
        assert!(buf.get().is_none());
        assert_eq!(buf.pool_size(), 0);
    }

    #[test]
    fn test_send_buffer_oldest_tracks_pool() {
        let buf = SendBuffer::new(1024);
        assert!(buf.oldest_received().is_none());
        buf.put(Bytes::from_static(b"abc"));
        assert!(buf.oldest_received().is_some());
        buf.get().unwrap();
        assert!(buf.oldest_received().is_none());
    }

    #[test]
    fn test_receive_pool_reorders() {
        let pool = BlockReceivePool::new();
        assert!(pool.put(2, Bytes::from_static(b"two")).is_empty());
        let ready = pool.put(1, Bytes::from_static(b"one"));
        assert_eq!(ready, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        let ready = pool.put(3, Bytes::from_static(b"three"));
        assert_eq!(ready, vec![Bytes::from_static(b"three")]);
        assert_eq!(pool.pending_len(), 0);
        assert_eq!(pool.next_sn(), 4);
    }

    #[test]
    fn test_receive_pool_drops_duplicates() {
        let pool = BlockReceivePool::new();
        assert_eq!(pool.put(1, Bytes::from_static(b"a")).len(), 1);
        assert!(pool.put(1, Bytes::from_static(b"a")).is_empty());
    }

    #[tokio::test]
    async fn test_wait_queue_wakes_lowest_id_first() {
        let queue = std::sync::Arc::new(WaitQueue::new());

        let q = queue.clone();
        let high = tokio::spawn(async move { q.wait(5).await });
        let q = queue.clone();
        let low = tokio::spawn(async move { q.wait(1).await });

        // Let both park
        while queue.waiting() < 2 {
            tokio::task::yield_now().await;
        }

        queue.notify();
        assert!(low.await.unwrap());
        assert_eq!(queue.waiting(), 1);

        queue.stop();
        assert!(!high.await.unwrap());
    }

    proptest! {
        /// Any put order delivers every sn exactly once, in order
        #[test]
        fn prop_ordered_delivery(order in Just((1..=20u32).collect::<Vec<u32>>()).prop_shuffle()) {
            let pool = BlockReceivePool::new();
            let mut seen = Vec::new();
            for sn in &order {
                for payload in pool.put(*sn, Bytes::from(sn.to_le_bytes().to_vec())) {
                    seen.push(u32::from_le_bytes(payload[..4].try_into().unwrap()));
                }
            }
            let expect: Vec<u32> = (1..=20).collect();
            prop_assert_eq!(seen, expect);
            prop_assert_eq!(pool.pending_len(), 0);
        }

        /// Split chunks re-concatenate to the original payload
        #[test]
        fn prop_split_preserves_bytes(data in proptest::collection::vec(any::<u8>(), 1..10_000)) {
            let buf = SendBuffer::new(2048);
            buf.put(Bytes::from(data.clone()));
            let mut out = Vec::new();
            let mut last_sn = 0;
            while let Some((chunk, sn)) = buf.get() {
                prop_assert!(chunk.len() <= 2048);
                prop_assert_eq!(sn, last_sn + 1);
                last_sn = sn;
                out.extend_from_slice(&chunk);
            }
            prop_assert_eq!(out, data);
        }
    }
}
