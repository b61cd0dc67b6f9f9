//! Hook traits for extensibility
//!
//! Defines the extension points through which the host injects credentials
//! and receives traffic accounting.

use std::sync::atomic::{AtomicU64, Ordering};

use super::protocol::TrojanCmd;
use super::relay::RelayStats;

/// Authenticator trait for credential validation
///
/// Synchronous: validation is a set lookup, not an I/O operation, and it runs
/// on the accept path of every connection.
pub trait Authenticator: Send + Sync {
    /// True iff `credential` is exactly one of the authorized 56-char hex tokens
    fn validate(&self, credential: &str) -> bool;
}

/// Statistics collector trait for traffic tracking
pub trait StatsCollector: Send + Sync {
    /// Called once when a relay finishes, successfully or not
    fn record_relay(&self, cmd: TrojanCmd, stats: RelayStats);
}

/// Process-wide traffic totals
#[derive(Debug, Default)]
pub struct TrafficStats {
    tcp_relays: AtomicU64,
    udp_relays: AtomicU64,
    upload: AtomicU64,
    download: AtomicU64,
}

/// Point-in-time copy of [`TrafficStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub tcp_relays: u64,
    pub udp_relays: u64,
    pub upload: u64,
    pub download: u64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            tcp_relays: self.tcp_relays.load(Ordering::Relaxed),
            udp_relays: self.udp_relays.load(Ordering::Relaxed),
            upload: self.upload.load(Ordering::Relaxed),
            download: self.download.load(Ordering::Relaxed),
        }
    }
}

impl StatsCollector for TrafficStats {
    fn record_relay(&self, cmd: TrojanCmd, stats: RelayStats) {
        match cmd {
            TrojanCmd::Connect => self.tcp_relays.fetch_add(1, Ordering::Relaxed),
            TrojanCmd::UdpAssociate => self.udp_relays.fetch_add(1, Ordering::Relaxed),
        };
        self.upload.fetch_add(stats.upload, Ordering::Relaxed);
        self.download.fetch_add(stats.download, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traffic_stats_accumulates() {
        let stats = TrafficStats::new();
        stats.record_relay(
            TrojanCmd::Connect,
            RelayStats {
                upload: 10,
                download: 20,
            },
        );
        stats.record_relay(
            TrojanCmd::UdpAssociate,
            RelayStats {
                upload: 1,
                download: 2,
            },
        );
        stats.record_relay(TrojanCmd::Connect, RelayStats::default());

        assert_eq!(
            stats.snapshot(),
            TrafficSnapshot {
                tcp_relays: 2,
                udp_relays: 1,
                upload: 11,
                download: 22,
            }
        );
    }
}
