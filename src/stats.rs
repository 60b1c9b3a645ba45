//! Runtime counters
//!
//! Shared between the session workers, the router and the control
//! surface. Everything is a relaxed atomic; snapshots are taken for
//! the status command and the reporter.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    pub roundtrip_num: AtomicU64,
    pub slow_roundtrip: AtomicU64,
    pub timeout_roundtrip: AtomicU64,
    pub resend: AtomicU64,
    pub sent_bytes: AtomicU64,
    pub received_bytes: AtomicU64,
    /// Connections accepted by the local listener
    pub handle_num: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub roundtrip_num: u64,
    pub slow_roundtrip: u64,
    pub timeout_roundtrip: u64,
    pub resend: u64,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub handle_num: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            roundtrip_num: self.roundtrip_num.load(Ordering::Relaxed),
            slow_roundtrip: self.slow_roundtrip.load(Ordering::Relaxed),
            timeout_roundtrip: self.timeout_roundtrip.load(Ordering::Relaxed),
            resend: self.resend.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            handle_num: self.handle_num.load(Ordering::Relaxed),
        }
    }
}

/// Human byte formatting for status output
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
