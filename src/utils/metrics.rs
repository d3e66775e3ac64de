//! Observability and Metrics
//!
//! Process-wide counters for session admission, association and traffic on
//! both transports. All counters are relaxed atomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug)]
pub struct Metrics {
    /// Reliable connections admitted
    pub sessions_accepted: AtomicU64,
    /// Sessions not yet torn down
    pub sessions_active: AtomicU64,
    /// Connections refused (capacity or blocking)
    pub sessions_rejected: AtomicU64,
    /// Best-effort flows bound to a session
    pub associations_success: AtomicU64,
    /// First datagrams that were not a valid pending token
    pub associations_failed: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Datagrams discarded by a full virtual channel inbox
    pub datagrams_dropped: AtomicU64,
    pub pings_sent: AtomicU64,
    pub idle_timeouts: AtomicU64,
    /// Client sends parked in the outbound cache
    pub messages_cached: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub protocol_errors: AtomicU64,
    /// Listener callbacks that errored or panicked
    pub listener_failures: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            sessions_accepted: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            sessions_rejected: AtomicU64::new(0),
            associations_success: AtomicU64::new(0),
            associations_failed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            idle_timeouts: AtomicU64::new(0),
            messages_cached: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            listener_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn session_accepted(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_rejected(&self) {
        self.sessions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn association_success(&self) {
        self.associations_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn association_failed(&self) {
        self.associations_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame written to either transport
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ping_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idle_timeout(&self) {
        self.idle_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_cached(&self) {
        self.messages_cached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_failure(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            associations_success: self.associations_success.load(Ordering::Relaxed),
            associations_failed: self.associations_failed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            idle_timeouts: self.idle_timeouts.load(Ordering::Relaxed),
            messages_cached: self.messages_cached.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            sessions_accepted = snapshot.sessions_accepted,
            sessions_active = snapshot.sessions_active,
            sessions_rejected = snapshot.sessions_rejected,
            associations_success = snapshot.associations_success,
            associations_failed = snapshot.associations_failed,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            datagrams_dropped = snapshot.datagrams_dropped,
            pings_sent = snapshot.pings_sent,
            idle_timeouts = snapshot.idle_timeouts,
            messages_cached = snapshot.messages_cached,
            reconnect_attempts = snapshot.reconnect_attempts,
            protocol_errors = snapshot.protocol_errors,
            listener_failures = snapshot.listener_failures,
            uptime_seconds = snapshot.uptime_seconds,
            "Transport metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub sessions_accepted: u64,
    pub sessions_active: u64,
    pub sessions_rejected: u64,
    pub associations_success: u64,
    pub associations_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub datagrams_dropped: u64,
    pub pings_sent: u64,
    pub idle_timeouts: u64,
    pub messages_cached: u64,
    pub reconnect_attempts: u64,
    pub protocol_errors: u64,
    pub listener_failures: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Logs elapsed time at debug level when dropped
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_counters_balance() {
        let metrics = Metrics::new();
        metrics.session_accepted();
        metrics.session_accepted();
        metrics.session_closed();
        metrics.session_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_accepted, 2);
        assert_eq!(snapshot.sessions_active, 1);
        assert_eq!(snapshot.sessions_rejected, 1);
    }

    #[test]
    fn test_traffic_counts_bytes() {
        let metrics = Metrics::new();
        metrics.message_sent(10);
        metrics.message_sent(5);
        metrics.message_received(7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_sent, 15);
        assert_eq!(snapshot.bytes_received, 7);
    }
}
