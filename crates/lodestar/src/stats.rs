//! Per-connection network statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lodestar_protocol::NetworkStats;

const NO_RTT: u64 = u64::MAX;

/// Rolling counters for one connection.
///
/// All updates are relaxed atomics: the numbers are informational and a
/// snapshot may mix values from slightly different instants.
#[derive(Debug)]
pub struct ConnectionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    /// Last measured round trip in milliseconds, `NO_RTT` until measured.
    rtt_millis: AtomicU64,
    connected_at: Instant,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            rtt_millis: AtomicU64::new(NO_RTT),
            connected_at: Instant::now(),
        }
    }

    /// Counts one outbound frame of `bytes` wire bytes, length prefix included.
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one inbound frame of `bytes` wire bytes, length prefix included.
    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rtt(&self, rtt: Duration) {
        let millis = u64::try_from(rtt.as_millis()).unwrap_or(NO_RTT - 1);
        self.rtt_millis.store(millis.min(NO_RTT - 1), Ordering::Relaxed);
    }

    /// The last measured round trip, if any.
    pub fn rtt(&self) -> Option<Duration> {
        match self.rtt_millis.load(Ordering::Relaxed) {
            NO_RTT => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// A wire-ready copy of the current counters.
    pub fn snapshot(&self) -> NetworkStats {
        NetworkStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            rtt_millis: self.rtt().map(|rtt| rtt.as_millis() as u64),
            connected_secs: self.connected_for().as_secs(),
        }
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since the Unix epoch, used for ping timestamps.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
