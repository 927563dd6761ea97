use crate::pump::{Direction, PumpReport};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Point-in-time view of the relay counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    /// Total number of accepted sessions
    pub total_sessions: u64,
    /// Sessions currently relaying
    pub active_sessions: u64,
    /// Sessions that never reached the upstream
    pub connect_failures: u64,
    /// Bytes read from clients
    pub bytes_from_client: u64,
    /// Bytes read from the upstream
    pub bytes_from_upstream: u64,
    /// Correction bytes injected in either direction
    pub corrections: u64,
    /// Timestamp when the relay started (Unix timestamp)
    pub start_time: u64,
}

/// Statistics shared by the broker and all of its sessions
#[derive(Debug, Clone)]
pub struct RelayStats {
    total_sessions: Arc<AtomicU64>,
    active_sessions: Arc<AtomicU64>,
    connect_failures: Arc<AtomicU64>,
    bytes_from_client: Arc<AtomicU64>,
    bytes_from_upstream: Arc<AtomicU64>,
    corrections: Arc<AtomicU64>,
    start_time: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            total_sessions: Arc::new(AtomicU64::new(0)),
            active_sessions: Arc::new(AtomicU64::new(0)),
            connect_failures: Arc::new(AtomicU64::new(0)),
            bytes_from_client: Arc::new(AtomicU64::new(0)),
            bytes_from_upstream: Arc::new(AtomicU64::new(0)),
            corrections: Arc::new(AtomicU64::new(0)),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Count a new session; the returned guard marks it inactive when dropped
    pub fn session_started(&self) -> SessionGuard {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            stats: self.clone(),
        }
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold the counters of one finished direction in
    pub fn record_pump(&self, report: &PumpReport) {
        let bytes = match report.direction {
            Direction::ClientToUpstream => &self.bytes_from_client,
            Direction::UpstreamToClient => &self.bytes_from_upstream,
        };
        bytes.fetch_add(report.bytes_read, Ordering::Relaxed);
        self.corrections
            .fetch_add(report.corrections, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            bytes_from_client: self.bytes_from_client.load(Ordering::Relaxed),
            bytes_from_upstream: self.bytes_from_upstream.load(Ordering::Relaxed),
            corrections: self.corrections.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the active session count on drop
#[derive(Debug)]
pub struct SessionGuard {
    stats: RelayStats,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.stats.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}
