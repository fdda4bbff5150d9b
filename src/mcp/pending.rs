//! Pending-call registry.
//!
//! Maps outbound request ids to one-shot completion slots. Completion is
//! first-writer-wins: the slot is removed atomically from the map, so a
//! later completion for the same id finds nothing and is a no-op.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::mcp::protocol::{Message, RequestId};

type Slot = oneshot::Sender<Result<Value>>;

/// Registry of calls awaiting a reply from the peer.
pub struct PendingCalls {
    next_id: AtomicI64,
    calls: DashMap<RequestId, Slot>,
    closed: AtomicBool,
}

/// Completion handle returned by [`PendingCalls::register`].
#[derive(Debug)]
pub struct PendingCall {
    id: RequestId,
    receiver: oneshot::Receiver<Result<Value>>,
}

impl PendingCall {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the outcome of the call.
    pub async fn wait(self) -> Result<Value> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::TransportClosed(format!(
                "call {} dropped without a reply",
                self.id
            ))),
        }
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            calls: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Allocate a fresh numeric id and register a completion slot for it.
    pub fn register(&self) -> Result<PendingCall> {
        loop {
            let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
            match self.register_with_id(id) {
                Err(Error::InvalidRequest(_)) => continue,
                other => return other,
            }
        }
    }

    /// Register a caller-supplied id; a duplicate is an invalid request.
    pub fn register_with_id(&self, id: RequestId) -> Result<PendingCall> {
        if id.is_null() {
            return Err(Error::InvalidRequest(
                "null id cannot be used for a call".to_string(),
            ));
        }
        self.ensure_open()?;

        let (tx, rx) = oneshot::channel();
        match self.calls.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::InvalidRequest(format!("Duplicate request id: {}", id)));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        // fail_all may have drained between the first check and the insert.
        if self.closed.load(Ordering::SeqCst) {
            self.calls.remove(&id);
            return Err(Error::TransportClosed("endpoint is closed".to_string()));
        }

        trace!("Registered pending call {}", id);
        Ok(PendingCall { id, receiver: rx })
    }

    /// Complete a call with an explicit outcome. Returns false if no call was waiting.
    pub fn complete(&self, id: &RequestId, outcome: Result<Value>) -> bool {
        match self.calls.remove(id) {
            Some((_, slot)) => {
                if slot.send(outcome).is_err() {
                    debug!("Caller for {} is no longer waiting", id);
                }
                true
            }
            None => false,
        }
    }

    /// Route an inbound response or error reply to its waiting caller.
    pub fn complete_message(&self, message: Message) -> bool {
        let (id, outcome) = match message {
            Message::Response(resp) => (resp.id, Ok(resp.result)),
            Message::Error(err) => (err.id.clone(), Err(err.into_error())),
            other => {
                warn!("Ignoring {} routed to pending calls", other.kind());
                return false;
            }
        };
        let matched = self.complete(&id, outcome);
        if !matched {
            debug!("Dropping reply for unknown or expired call {}", id);
        }
        matched
    }

    /// Remove a call without completing it.
    pub fn remove_if_present(&self, id: &RequestId) -> bool {
        self.calls.remove(id).is_some()
    }

    /// Fail every waiting call and refuse further registrations.
    pub fn fail_all(&self, cause: &Error) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<RequestId> = self.calls.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            warn!("Failing {} pending calls: {}", ids.len(), cause);
        }
        for id in ids {
            self.complete(&id, Err(Error::TransportClosed(cause.to_string())));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::TransportClosed("endpoint is closed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{JsonRpcErrorResponse, JsonRpcResponse};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_register_and_complete() {
        let pending = PendingCalls::new();
        let call = pending.register().unwrap();
        let id = call.id().clone();
        assert_eq!(pending.len(), 1);

        assert!(pending.complete_message(Message::Response(JsonRpcResponse::new(
            id,
            json!({"ok": true})
        ))));
        assert_eq!(call.wait().await.unwrap(), json!({"ok": true}));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_error_reply_becomes_rpc_error() {
        let pending = PendingCalls::new();
        let call = pending.register_with_id(RequestId::from("a")).unwrap();

        pending.complete_message(Message::Error(JsonRpcErrorResponse::new(
            RequestId::from("a"),
            -32601,
            "Unknown method: x",
            None,
        )));

        match call.wait().await {
            Err(Error::Rpc { code, message, .. }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Unknown method: x");
            }
            other => panic!("Expected Rpc error, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let pending = PendingCalls::new();
        let _first = pending.register_with_id(RequestId::Number(5)).unwrap();
        let err = pending.register_with_id(RequestId::Number(5)).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(err.code(), -32600);
    }

    #[test]
    fn test_null_id_rejected() {
        let pending = PendingCalls::new();
        assert!(pending.register_with_id(RequestId::Null).is_err());
    }

    #[test]
    fn test_generated_ids_skip_taken() {
        let pending = PendingCalls::new();
        let _taken = pending.register_with_id(RequestId::Number(1)).unwrap();
        let call = pending.register().unwrap();
        assert_eq!(call.id(), &RequestId::Number(2));
    }

    #[test]
    fn test_unmatched_reply_dropped() {
        let pending = PendingCalls::new();
        assert!(!pending.complete_message(Message::Response(JsonRpcResponse::new(
            RequestId::Number(99),
            json!({})
        ))));
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let pending = Arc::new(PendingCalls::new());
        let call = pending.register().unwrap();
        let id = call.id().clone();

        let mut handles = Vec::new();
        for i in 0..8 {
            let pending = pending.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                pending.complete(&id, Ok(json!(i)))
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert!(call.wait().await.unwrap().is_number());
    }

    #[tokio::test]
    async fn test_fail_all_closes_registry() {
        let pending = PendingCalls::new();
        let a = pending.register().unwrap();
        let b = pending.register().unwrap();

        pending.fail_all(&Error::TransportClosed("eof".to_string()));

        assert!(matches!(a.wait().await, Err(Error::TransportClosed(_))));
        assert!(matches!(b.wait().await, Err(Error::TransportClosed(_))));
        assert!(pending.is_closed());
        assert!(matches!(
            pending.register(),
            Err(Error::TransportClosed(_))
        ));
    }

    #[test]
    fn test_remove_if_present() {
        let pending = PendingCalls::new();
        let call = pending.register().unwrap();
        assert!(pending.remove_if_present(call.id()));
        assert!(!pending.remove_if_present(call.id()));
    }
}
