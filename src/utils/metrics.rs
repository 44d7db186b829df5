//! Observability counters for a bridge instance.
//!
//! Uses atomic counters so every operation can record without locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::info;

use crate::core::constants::EventType;

/// Counters owned by one [`Bridge`](crate::bridge::Bridge).
#[derive(Debug)]
pub struct BridgeMetrics {
    pub hosts_created: AtomicU64,
    pub hosts_destroyed: AtomicU64,
    /// Outbound connection attempts started
    pub connects_started: AtomicU64,
    pub packets_created: AtomicU64,
    pub packets_destroyed: AtomicU64,
    /// Packets handed to the engine by a successful send
    pub packets_sent: AtomicU64,
    /// Sends the engine refused
    pub sends_rejected: AtomicU64,
    pub packets_broadcast: AtomicU64,
    pub events_connect: AtomicU64,
    pub events_disconnect: AtomicU64,
    pub events_receive: AtomicU64,
    /// Service calls that returned without an event
    pub service_idle: AtomicU64,
    pub service_errors: AtomicU64,
    /// Handles rejected as stale or unknown
    pub stale_handles: AtomicU64,
    start_time: Instant,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            hosts_created: AtomicU64::new(0),
            hosts_destroyed: AtomicU64::new(0),
            connects_started: AtomicU64::new(0),
            packets_created: AtomicU64::new(0),
            packets_destroyed: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            sends_rejected: AtomicU64::new(0),
            packets_broadcast: AtomicU64::new(0),
            events_connect: AtomicU64::new(0),
            events_disconnect: AtomicU64::new(0),
            events_receive: AtomicU64::new(0),
            service_idle: AtomicU64::new(0),
            service_errors: AtomicU64::new(0),
            stale_handles: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one dispatched event
    pub fn event(&self, kind: EventType) {
        match kind {
            EventType::Connect => Self::incr(&self.events_connect),
            EventType::Disconnect => Self::incr(&self.events_disconnect),
            EventType::Receive => Self::incr(&self.events_receive),
            EventType::None => Self::incr(&self.service_idle),
        }
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            hosts_created: load(&self.hosts_created),
            hosts_destroyed: load(&self.hosts_destroyed),
            connects_started: load(&self.connects_started),
            packets_created: load(&self.packets_created),
            packets_destroyed: load(&self.packets_destroyed),
            packets_sent: load(&self.packets_sent),
            sends_rejected: load(&self.sends_rejected),
            packets_broadcast: load(&self.packets_broadcast),
            events_connect: load(&self.events_connect),
            events_disconnect: load(&self.events_disconnect),
            events_receive: load(&self.events_receive),
            service_idle: load(&self.service_idle),
            service_errors: load(&self.service_errors),
            stale_handles: load(&self.stale_handles),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            hosts_created = s.hosts_created,
            hosts_destroyed = s.hosts_destroyed,
            connects_started = s.connects_started,
            packets_created = s.packets_created,
            packets_destroyed = s.packets_destroyed,
            packets_sent = s.packets_sent,
            sends_rejected = s.sends_rejected,
            packets_broadcast = s.packets_broadcast,
            events_connect = s.events_connect,
            events_disconnect = s.events_disconnect,
            events_receive = s.events_receive,
            service_idle = s.service_idle,
            service_errors = s.service_errors,
            stale_handles = s.stale_handles,
            uptime_seconds = s.uptime_seconds,
            "Bridge metrics snapshot"
        );
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub hosts_created: u64,
    pub hosts_destroyed: u64,
    pub connects_started: u64,
    pub packets_created: u64,
    pub packets_destroyed: u64,
    pub packets_sent: u64,
    pub sends_rejected: u64,
    pub packets_broadcast: u64,
    pub events_connect: u64,
    pub events_disconnect: u64,
    pub events_receive: u64,
    pub service_idle: u64,
    pub service_errors: u64,
    pub stale_handles: u64,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    /// Packets created or received that were neither sent nor destroyed.
    pub fn packets_outstanding(&self) -> u64 {
        (self.packets_created + self.events_receive)
            .saturating_sub(self.packets_sent + self.packets_destroyed + self.packets_broadcast)
    }
}
