//! Prometheus metrics for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Runtime counters shared by endpoints and the HTTP server.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    /// Messages read from a transport
    pub messages_received: AtomicU64,
    /// Messages written to a transport
    pub messages_sent: AtomicU64,
    /// Inbound requests dispatched to a handler
    pub requests_dispatched: AtomicU64,
    /// Error replies sent
    pub error_replies: AtomicU64,
    /// Replies suppressed by cancellation
    pub suppressed_replies: AtomicU64,
    /// Outbound calls that timed out
    pub call_timeouts: AtomicU64,
    /// Sessions created
    pub sessions_created: AtomicU64,
    /// Active sessions
    pub active_sessions: AtomicU64,
    /// SSE events emitted
    pub sse_events_emitted: AtomicU64,
    /// SSE events replayed after reconnect
    pub sse_events_replayed: AtomicU64,
}

impl RuntimeMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dispatched(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_error_replies(&self) {
        self.error_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_suppressed(&self) {
        self.suppressed_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timeouts(&self) {
        self.call_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a new session.
    pub fn session_opened(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a destroyed session.
    pub fn session_closed(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn inc_sse_emitted(&self) {
        self.sse_events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sse_replayed(&self, count: u64) {
        self.sse_events_replayed.fetch_add(count, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            error_replies: self.error_replies.load(Ordering::Relaxed),
            suppressed_replies: self.suppressed_replies.load(Ordering::Relaxed),
            call_timeouts: self.call_timeouts.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            sse_events_emitted: self.sse_events_emitted.load(Ordering::Relaxed),
            sse_events_replayed: self.sse_events_replayed.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP mcp_runtime_messages_received Messages read from transports
# TYPE mcp_runtime_messages_received counter
mcp_runtime_messages_received {}

# HELP mcp_runtime_messages_sent Messages written to transports
# TYPE mcp_runtime_messages_sent counter
mcp_runtime_messages_sent {}

# HELP mcp_runtime_requests_dispatched Inbound requests dispatched to handlers
# TYPE mcp_runtime_requests_dispatched counter
mcp_runtime_requests_dispatched {}

# HELP mcp_runtime_error_replies Error replies sent
# TYPE mcp_runtime_error_replies counter
mcp_runtime_error_replies {}

# HELP mcp_runtime_suppressed_replies Replies suppressed by cancellation
# TYPE mcp_runtime_suppressed_replies counter
mcp_runtime_suppressed_replies {}

# HELP mcp_runtime_call_timeouts Outbound calls that timed out
# TYPE mcp_runtime_call_timeouts counter
mcp_runtime_call_timeouts {}

# HELP mcp_runtime_sessions_created Sessions created
# TYPE mcp_runtime_sessions_created counter
mcp_runtime_sessions_created {}

# HELP mcp_runtime_active_sessions Active sessions
# TYPE mcp_runtime_active_sessions gauge
mcp_runtime_active_sessions {}

# HELP mcp_runtime_sse_events_emitted SSE events emitted
# TYPE mcp_runtime_sse_events_emitted counter
mcp_runtime_sse_events_emitted {}

# HELP mcp_runtime_sse_events_replayed SSE events replayed after reconnect
# TYPE mcp_runtime_sse_events_replayed counter
mcp_runtime_sse_events_replayed {}
"#,
            s.messages_received,
            s.messages_sent,
            s.requests_dispatched,
            s.error_replies,
            s.suppressed_replies,
            s.call_timeouts,
            s.sessions_created,
            s.active_sessions,
            s.sse_events_emitted,
            s.sse_events_replayed
        )
    }
}

/// Metrics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub requests_dispatched: u64,
    pub error_replies: u64,
    pub suppressed_replies: u64,
    pub call_timeouts: u64,
    pub sessions_created: u64,
    pub active_sessions: u64,
    pub sse_events_emitted: u64,
    pub sse_events_replayed: u64,
}

/// Timer for measuring durations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = RuntimeMetrics::new();
        metrics.inc_received();
        metrics.inc_received();
        metrics.inc_sent();
        metrics.inc_timeouts();
        metrics.add_sse_replayed(4);

        let s = metrics.snapshot();
        assert_eq!(s.messages_received, 2);
        assert_eq!(s.messages_sent, 1);
        assert_eq!(s.call_timeouts, 1);
        assert_eq!(s.sse_events_replayed, 4);
    }

    #[test]
    fn test_session_gauge_never_underflows() {
        let metrics = RuntimeMetrics::new();
        metrics.session_opened();
        metrics.session_closed();
        metrics.session_closed();

        let s = metrics.snapshot();
        assert_eq!(s.sessions_created, 1);
        assert_eq!(s.active_sessions, 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = RuntimeMetrics::new();
        metrics.inc_dispatched();
        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE mcp_runtime_requests_dispatched counter"));
        assert!(text.contains("mcp_runtime_requests_dispatched 1"));
        assert!(text.contains("mcp_runtime_active_sessions 0"));
    }
}
