//! Cancellation tracking for inbound requests.
//!
//! Cancellation is cooperative. The dispatcher consults the tracker before
//! invoking a handler and before sending its reply; handlers may also watch
//! their [`CancellationHandle`] to stop early.

use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mcp::protocol::RequestId;

/// Cancellation state of one in-flight request.
#[derive(Clone, Debug, Default)]
pub struct CancellationHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<Option<String>>>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the request cancelled. Only the first reason is kept.
    pub fn cancel(&self, reason: Option<String>) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.get().cloned().flatten()
    }

    /// Resolves once the request is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Per-request cancellation flags keyed by request id.
#[derive(Default)]
pub struct CancellationTracker {
    requests: DashMap<RequestId, CancellationHandle>,
}

impl CancellationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: RequestId) -> CancellationHandle {
        let handle = CancellationHandle::new();
        self.requests.insert(id, handle.clone());
        handle
    }

    /// Cancel a tracked request. Unknown ids are ignored.
    pub fn cancel(&self, id: &RequestId, reason: Option<String>) {
        match self.requests.get(id) {
            Some(handle) => {
                debug!("Cancelling request {} ({:?})", id, reason);
                handle.cancel(reason);
            }
            None => debug!("Ignoring cancellation for unknown request {}", id),
        }
    }

    pub fn is_cancelled(&self, id: &RequestId) -> bool {
        self.requests
            .get(id)
            .map(|h| h.is_cancelled())
            .unwrap_or(false)
    }

    pub fn reason(&self, id: &RequestId) -> Option<String> {
        self.requests.get(id).and_then(|h| h.reason())
    }

    pub fn release(&self, id: &RequestId) {
        self.requests.remove(id);
    }

    /// Cancel everything still in flight.
    pub fn cancel_all(&self, reason: &str) {
        for entry in self.requests.iter() {
            entry.value().cancel(Some(reason.to_string()));
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_and_reason() {
        let tracker = CancellationTracker::new();
        let id = RequestId::Number(1);
        tracker.register(id.clone());

        assert!(!tracker.is_cancelled(&id));
        tracker.cancel(&id, Some("user abort".to_string()));
        assert!(tracker.is_cancelled(&id));
        assert_eq!(tracker.reason(&id), Some("user abort".to_string()));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let tracker = CancellationTracker::new();
        let id = RequestId::from("r");
        tracker.register(id.clone());

        tracker.cancel(&id, Some("first".to_string()));
        tracker.cancel(&id, Some("second".to_string()));
        assert!(tracker.is_cancelled(&id));
        assert_eq!(tracker.reason(&id), Some("first".to_string()));
    }

    #[test]
    fn test_cancel_unknown_is_noop() {
        let tracker = CancellationTracker::new();
        tracker.cancel(&RequestId::Number(404), None);
        assert!(!tracker.is_cancelled(&RequestId::Number(404)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_release() {
        let tracker = CancellationTracker::new();
        let id = RequestId::Number(2);
        let handle = tracker.register(id.clone());
        tracker.release(&id);

        // Late cancellation after release does not reach the handle.
        tracker.cancel(&id, None);
        assert!(!handle.is_cancelled());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_handle_wakes_waiter() {
        let tracker = CancellationTracker::new();
        let id = RequestId::Number(3);
        let handle = tracker.register(id.clone());

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move {
                handle.cancelled().await;
                handle.reason()
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.cancel(&id, Some("stop".to_string()));

        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, Some("stop".to_string()));
    }

    #[test]
    fn test_cancel_all() {
        let tracker = CancellationTracker::new();
        let a = tracker.register(RequestId::Number(1));
        let b = tracker.register(RequestId::Number(2));
        tracker.cancel_all("shutdown");
        assert!(a.is_cancelled());
        assert_eq!(b.reason(), Some("shutdown".to_string()));
    }
}
