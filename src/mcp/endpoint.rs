//! JSON-RPC endpoint: one side of a session.
//!
//! The endpoint owns the reader loop for its transport. Inbound requests are
//! registered for progress and cancellation in arrival order and then run on
//! their own task, so a `notifications/cancelled` can reach a handler that is
//! still working. Inbound responses complete the matching pending call.
//! Outbound calls go through [`Endpoint::request`].

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::mcp::cancellation::{CancellationHandle, CancellationTracker};
use crate::mcp::codec;
use crate::mcp::handler::{HandlerRegistry, RequestContext, RequestHandler};
use crate::mcp::pending::{PendingCall, PendingCalls};
use crate::mcp::progress::{NotificationSink, ProgressReporter, ProgressTracker};
use crate::mcp::protocol::{
    methods, CancelledParams, JsonRpcErrorResponse, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, Message, RequestId,
};
use crate::mcp::rate_limit::RateLimiter;
use crate::mcp::transport::Transport;
use crate::metrics::{RuntimeMetrics, Timer};

/// Default progress notifications per second per token.
pub const DEFAULT_PROGRESS_PER_SECOND: u32 = 20;

/// Default timeout for outbound calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Tunables for an [`Endpoint`].
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub progress_per_second: u32,
    pub request_timeout: Duration,
    pub metrics: Arc<RuntimeMetrics>,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            progress_per_second: DEFAULT_PROGRESS_PER_SECOND,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            metrics: RuntimeMetrics::new(),
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    handlers: Arc<HandlerRegistry>,
    pending: PendingCalls,
    progress: Arc<ProgressTracker>,
    cancellations: CancellationTracker,
    request_timeout: Duration,
    metrics: Arc<RuntimeMetrics>,
    shutdown: CancellationToken,
}

/// A bidirectional JSON-RPC endpoint over one transport.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

/// Releases per-request tracking state however handling ends.
struct InFlight {
    inner: Arc<Inner>,
    id: RequestId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.cancellations.release(&self.id);
        self.inner.progress.release(&self.id);
    }
}

impl Endpoint {
    pub fn new(
        transport: Arc<dyn Transport>,
        handlers: Arc<HandlerRegistry>,
        options: EndpointOptions,
    ) -> Result<Self> {
        let limiter = RateLimiter::per_second(options.progress_per_second)?;
        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                handlers,
                pending: PendingCalls::new(),
                progress: Arc::new(ProgressTracker::new(limiter)),
                cancellations: CancellationTracker::new(),
                request_timeout: options.request_timeout,
                metrics: options.metrics,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.inner.handlers
    }

    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.inner.metrics
    }

    /// Number of outbound calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of inbound requests still being handled.
    pub fn in_flight(&self) -> usize {
        self.inner.cancellations.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled() || self.inner.pending.is_closed()
    }

    /// Spawn the reader loop.
    pub fn start(&self) -> JoinHandle<Result<()>> {
        let endpoint = self.clone();
        tokio::spawn(async move { endpoint.run().await })
    }

    /// Read and dispatch messages until the transport fails or the endpoint closes.
    ///
    /// On exit every pending call is failed and in-flight handlers are told
    /// to stop.
    pub async fn run(&self) -> Result<()> {
        let outcome = loop {
            let received = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break Ok(()),
                received = self.inner.transport.receive() => received,
            };

            match received {
                Ok(value) => {
                    self.inner.metrics.inc_received();
                    self.handle_inbound(value).await;
                }
                Err(Error::TransportClosed(reason)) => {
                    info!("Transport closed: {}", reason);
                    break Ok(());
                }
                Err(e @ Error::Parse(_)) => {
                    warn!("Discarding unparseable message: {}", e);
                    let reply = JsonRpcErrorResponse::from_error(RequestId::Null, &e);
                    if let Err(e) = self.send_message(&Message::Error(reply)).await {
                        warn!("Failed to answer unparseable message: {}", e);
                    }
                }
                Err(e) => {
                    error!("Transport failure: {}", e);
                    break Err(e);
                }
            }
        };

        let cause = match &outcome {
            Ok(()) => Error::TransportClosed("endpoint stopped".to_string()),
            Err(e) => Error::TransportClosed(e.to_string()),
        };
        self.inner.pending.fail_all(&cause);
        self.inner.cancellations.cancel_all("connection closed");
        outcome
    }

    /// Stop the reader loop and close the transport.
    pub async fn close(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(());
        }
        debug!("Closing endpoint");
        self.inner.shutdown.cancel();
        self.inner
            .pending
            .fail_all(&Error::TransportClosed("endpoint closed".to_string()));
        self.inner.cancellations.cancel_all("connection closed");
        self.inner.transport.close().await
    }

    // ===== Outbound =====

    /// Call a method on the peer with the default timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_with_timeout(method, params, self.inner.request_timeout)
            .await
    }

    /// Call a method on the peer, giving up after `timeout`.
    ///
    /// On timeout the peer is sent `notifications/cancelled` with reason
    /// "timeout" and the caller gets [`Error::Timeout`]. A reply that arrives
    /// later is dropped.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let call = self.inner.pending.register()?;
        let request = JsonRpcRequest::new(call.id().clone(), method, params);
        self.call(request, call, timeout).await
    }

    /// Send a request with a caller-chosen id.
    ///
    /// Fails with invalid-request if a call with that id is already waiting.
    pub async fn send_request(&self, request: JsonRpcRequest, timeout: Duration) -> Result<Value> {
        let call = self.inner.pending.register_with_id(request.id.clone())?;
        self.call(request, call, timeout).await
    }

    async fn call(
        &self,
        request: JsonRpcRequest,
        call: PendingCall,
        timeout: Duration,
    ) -> Result<Value> {
        let id = request.id.clone();
        let method = request.method.clone();
        debug!("Calling {} (id: {})", method, id);

        if let Err(e) = self.send_message(&Message::Request(request)).await {
            self.inner.pending.remove_if_present(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, call.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.inner.pending.remove_if_present(&id);
                self.inner.metrics.inc_timeouts();
                let millis = timeout.as_millis() as u64;
                warn!("Call {} (id: {}) timed out after {} ms", method, id, millis);
                self.send_cancelled(id, "timeout").await;
                Err(Error::Timeout { millis })
            }
        }
    }

    /// Abandon an outbound call: the caller gets [`Error::Cancelled`] and the
    /// peer is told to stop.
    pub async fn cancel(&self, id: &RequestId, reason: &str) -> bool {
        let was_pending = self
            .inner
            .pending
            .complete(id, Err(Error::Cancelled(reason.to_string())));
        if was_pending {
            self.send_cancelled(id.clone(), reason).await;
        }
        was_pending
    }

    async fn send_cancelled(&self, id: RequestId, reason: &str) {
        let params = CancelledParams {
            request_id: id,
            reason: Some(reason.to_string()),
        };
        let params = match serde_json::to_value(&params) {
            Ok(params) => params,
            Err(e) => {
                debug!("Could not encode cancellation: {}", e);
                return;
            }
        };
        if let Err(e) = self.notify(methods::CANCELLED, Some(params)).await {
            debug!("Failed to send cancellation: {}", e);
        }
    }

    /// Send a notification to the peer.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send_message(&Message::Notification(JsonRpcNotification::new(
            method, params,
        )))
        .await
    }

    /// Encode and send one message.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::TransportClosed("endpoint closed".to_string()));
        }
        trace!("Sending {}", message.kind());
        self.inner.transport.send(codec::encode(message)?).await?;
        self.inner.metrics.inc_sent();
        if matches!(message, Message::Error(_)) {
            self.inner.metrics.inc_error_replies();
        }
        Ok(())
    }

    // ===== Inbound =====

    async fn handle_inbound(&self, value: Value) {
        let message = match codec::decode(&value) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable message: {}", e);
                if codec::expects_reply(&value) {
                    let reply = JsonRpcErrorResponse::from_error(codec::recover_id(&value), &e);
                    self.reply(Message::Error(reply)).await;
                }
                return;
            }
        };

        match message {
            Message::Request(request) => self.dispatch_request(request).await,
            Message::Notification(notification) => {
                self.dispatch_notification(notification).await
            }
            reply @ (Message::Response(_) | Message::Error(_)) => {
                self.inner.pending.complete_message(reply);
            }
        }
    }

    async fn dispatch_request(&self, request: JsonRpcRequest) {
        debug!("Handling request: {} (id: {})", request.method, request.id);
        let id = request.id.clone();

        let token = match self
            .inner
            .progress
            .register(&id, request.params.as_ref())
        {
            Ok(token) => token,
            Err(e) => {
                warn!("Rejecting request {}: {}", id, e);
                self.reply_error(id, &e).await;
                return;
            }
        };
        let cancellation = self.inner.cancellations.register(id.clone());
        let guard = InFlight {
            inner: self.inner.clone(),
            id: id.clone(),
        };

        if let Err(e) = self.inner.handlers.check(&request).await {
            debug!("Request {} rejected by filter: {}", id, e);
            self.reply_error(id, &e).await;
            return;
        }

        let Some(handler) = self.inner.handlers.request_handler(&request.method) else {
            self.reply_error(id, &Error::MethodNotFound(request.method))
                .await;
            return;
        };

        self.inner.metrics.inc_dispatched();
        let reporter = ProgressReporter::new(
            token,
            self.inner.progress.clone(),
            Arc::new(self.clone()),
        );
        let endpoint = self.clone();
        tokio::spawn(async move {
            endpoint
                .run_handler(handler, request, cancellation, reporter)
                .await;
            drop(guard);
        });
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn RequestHandler>,
        request: JsonRpcRequest,
        cancellation: CancellationHandle,
        reporter: ProgressReporter,
    ) {
        let id = request.id.clone();
        let method = request.method.clone();

        if cancellation.is_cancelled() {
            self.suppress(&id, &cancellation).await;
            return;
        }

        reporter.start().await;
        let ctx = RequestContext::new(id.clone(), cancellation.clone(), reporter.clone(), self.clone());
        let timer = Timer::start();
        let outcome = AssertUnwindSafe(handler.handle(request, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::Internal(format!("handler for {} panicked", method))));
        debug!("Handled {} (id: {}) in {} ms", method, id, timer.elapsed_ms());

        if cancellation.is_cancelled() {
            self.suppress(&id, &cancellation).await;
            return;
        }

        reporter.finish().await;
        let reply = match outcome {
            Ok(Value::Null) => {
                error!("Handler for {} returned null", method);
                Message::Error(JsonRpcErrorResponse::from_error(
                    id,
                    &Error::Internal("handler returned null".to_string()),
                ))
            }
            Ok(result) => Message::Response(JsonRpcResponse::new(id, result)),
            Err(e) => {
                debug!("Handler for {} failed: {}", method, e);
                Message::Error(JsonRpcErrorResponse::from_error(id, &reply_error_for(e)))
            }
        };
        self.reply(reply).await;
    }

    async fn suppress(&self, id: &RequestId, cancellation: &CancellationHandle) {
        info!(
            "Request {} cancelled ({}), suppressing reply",
            id,
            cancellation.reason().unwrap_or_else(|| "no reason".to_string())
        );
        self.inner.metrics.inc_suppressed();
        if let Err(e) = self.inner.transport.abandon(id).await {
            debug!("Transport could not abandon {}: {}", id, e);
        }
    }

    async fn dispatch_notification(&self, notification: JsonRpcNotification) {
        debug!("Handling notification: {}", notification.method);

        if notification.method == methods::CANCELLED {
            self.handle_cancelled(notification.params.as_ref());
        }

        match self.inner.handlers.notification_handler(&notification.method) {
            Some(handler) => {
                let method = notification.method.clone();
                if let Err(e) = handler.handle(notification).await {
                    warn!("Notification handler for {} failed: {}", method, e);
                }
            }
            None if notification.method != methods::CANCELLED => {
                debug!("Unknown notification: {}", notification.method);
            }
            None => {}
        }
    }

    fn handle_cancelled(&self, params: Option<&Value>) {
        let Some(params) = params else {
            debug!("Cancellation without params ignored");
            return;
        };
        match serde_json::from_value::<CancelledParams>(params.clone()) {
            Ok(cancel) => self
                .inner
                .cancellations
                .cancel(&cancel.request_id, cancel.reason),
            Err(e) => debug!("Malformed cancellation ignored: {}", e),
        }
    }

    async fn reply_error(&self, id: RequestId, err: &Error) {
        self.reply(Message::Error(JsonRpcErrorResponse::from_error(id, err)))
            .await;
    }

    async fn reply(&self, message: Message) {
        if let Err(e) = self.send_message(&message).await {
            warn!("Failed to send {}: {}", message.kind(), e);
        }
    }
}

/// Map a handler failure onto the error sent back to the peer.
fn reply_error_for(err: Error) -> Error {
    match err {
        e @ (Error::InvalidParams(_)
        | Error::Rpc { .. }
        | Error::MethodNotFound(_)
        | Error::InvalidRequest(_)
        | Error::InvalidState(_)
        | Error::RateLimited(_)
        | Error::NotInitialized) => e,
        Error::Json(e) => Error::InvalidParams(e.to_string()),
        other => Error::Internal(other.to_string()),
    }
}

#[async_trait]
impl NotificationSink for Endpoint {
    async fn send_notification(&self, notification: JsonRpcNotification) -> Result<()> {
        self.send_message(&Message::Notification(notification)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::error_codes;
    use crate::mcp::transport::StdioTransport;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    /// The far side of a duplex pipe, speaking raw JSON lines.
    struct RawPeer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl RawPeer {
        async fn send(&mut self, value: Value) {
            let mut line = serde_json::to_string(&value).unwrap();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap()
                .expect("stream ended");
            serde_json::from_str(&line).unwrap()
        }

        async fn recv_none(&mut self, wait: Duration) -> bool {
            tokio::time::timeout(wait, self.lines.next_line()).await.is_err()
        }
    }

    fn connected(handlers: HandlerRegistry) -> (Endpoint, RawPeer) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(ours);
        let transport = Arc::new(StdioTransport::new(r, w));
        let endpoint =
            Endpoint::new(transport, Arc::new(handlers), EndpointOptions::default()).unwrap();
        endpoint.start();

        let (pr, pw) = tokio::io::split(theirs);
        let peer = RawPeer {
            lines: BufReader::new(pr).lines(),
            writer: pw,
        };
        (endpoint, peer)
    }

    fn echo_handlers() -> HandlerRegistry {
        let handlers = HandlerRegistry::new();
        handlers.on_request("echo", |req: JsonRpcRequest, _ctx: RequestContext| async move {
            Ok::<Value, Error>(req.params.unwrap_or(json!({})))
        });
        handlers
    }

    #[tokio::test]
    async fn test_request_response() {
        let (_endpoint, mut peer) = connected(echo_handlers());
        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": {"x": 1}}))
            .await;
        let reply = peer.recv().await;
        assert_eq!(reply, json!({"jsonrpc": "2.0", "id": 1, "result": {"x": 1}}));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (_endpoint, mut peer) = connected(HandlerRegistry::new());
        peer.send(json!({"jsonrpc": "2.0", "id": "a", "method": "nope"}))
            .await;
        let reply = peer.recv().await;
        assert_eq!(reply["id"], "a");
        assert_eq!(reply["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_message_gets_error_reply() {
        let (_endpoint, mut peer) = connected(HandlerRegistry::new());
        peer.send(json!({"jsonrpc": "2.0", "id": 3, "method": 42})).await;
        let reply = peer.recv().await;
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["error"]["code"], error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_notification_is_silent() {
        let (_endpoint, mut peer) = connected(echo_handlers());
        peer.send(json!({"jsonrpc": "2.0", "method": "notifications/whatever"}))
            .await;
        peer.send(json!({"jsonrpc": "2.0", "id": 2, "method": "echo"})).await;
        // The only reply is for the request.
        assert_eq!(peer.recv().await["id"], 2);
    }

    #[tokio::test]
    async fn test_handler_error_mapping() {
        let handlers = HandlerRegistry::new();
        handlers.on_request("bad-params", |_req: JsonRpcRequest, _ctx: RequestContext| async {
            Err::<Value, Error>(Error::InvalidParams("name is required".to_string()))
        });
        handlers.on_request("boom", |_req: JsonRpcRequest, _ctx: RequestContext| async {
            Err::<Value, Error>(Error::Config("disk on fire".to_string()))
        });
        handlers.on_request("null", |_req: JsonRpcRequest, _ctx: RequestContext| async {
            Ok::<Value, Error>(Value::Null)
        });
        let (_endpoint, mut peer) = connected(handlers);

        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "bad-params"}))
            .await;
        let reply = peer.recv().await;
        assert_eq!(reply["error"]["code"], error_codes::INVALID_PARAMS);
        assert_eq!(reply["error"]["message"], "name is required");

        peer.send(json!({"jsonrpc": "2.0", "id": 2, "method": "boom"})).await;
        let reply = peer.recv().await;
        assert_eq!(reply["error"]["code"], error_codes::INTERNAL_ERROR);

        peer.send(json!({"jsonrpc": "2.0", "id": 3, "method": "null"})).await;
        let reply = peer.recv().await;
        assert_eq!(reply["error"]["code"], error_codes::INTERNAL_ERROR);
        assert_eq!(reply["error"]["message"], "handler returned null");
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let handlers = HandlerRegistry::new();
        handlers.on_request("slow", |_req: JsonRpcRequest, _ctx: RequestContext| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<Value, Error>(json!({}))
        });
        let (_endpoint, mut peer) = connected(handlers);

        peer.send(json!({"jsonrpc": "2.0", "id": 7, "method": "slow"})).await;
        peer.send(json!({"jsonrpc": "2.0", "id": 7, "method": "slow"})).await;

        let first = peer.recv().await;
        assert_eq!(first["error"]["code"], error_codes::INVALID_REQUEST);
        let second = peer.recv().await;
        assert_eq!(second, json!({"jsonrpc": "2.0", "id": 7, "result": {}}));
    }

    #[tokio::test]
    async fn test_cancellation_suppresses_reply() {
        let handlers = HandlerRegistry::new();
        handlers.on_request("wait", |_req: JsonRpcRequest, ctx: RequestContext| async move {
            ctx.cancelled().await;
            Ok::<Value, Error>(json!({"finished": true}))
        });
        handlers.on_request("echo", |req: JsonRpcRequest, _ctx: RequestContext| async move {
            Ok::<Value, Error>(req.params.unwrap_or(json!({})))
        });
        let (endpoint, mut peer) = connected(handlers);

        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "wait"})).await;
        peer.send(json!({
            "jsonrpc": "2.0",
            "method": "notifications/cancelled",
            "params": {"requestId": 1, "reason": "user abort"}
        }))
        .await;
        // Cancelling an unknown id is harmless.
        peer.send(json!({
            "jsonrpc": "2.0",
            "method": "notifications/cancelled",
            "params": {"requestId": 999}
        }))
        .await;
        peer.send(json!({"jsonrpc": "2.0", "id": 2, "method": "echo", "params": {"n": 2}}))
            .await;

        assert_eq!(peer.recv().await["id"], 2);
        assert!(peer.recv_none(Duration::from_millis(100)).await);
        assert_eq!(endpoint.metrics().snapshot().suppressed_replies, 1);
        assert_eq!(endpoint.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_progress_notifications_around_handler() {
        let handlers = HandlerRegistry::new();
        handlers.on_request("work", |_req: JsonRpcRequest, ctx: RequestContext| async move {
            ctx.progress().report(1.0, Some(2.0), Some("half")).await?;
            Ok::<Value, Error>(json!({"done": true}))
        });
        let (_endpoint, mut peer) = connected(handlers);

        peer.send(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "work",
            "params": {"_meta": {"progressToken": "tok"}}
        }))
        .await;

        let start = peer.recv().await;
        assert_eq!(start["method"], "notifications/progress");
        assert_eq!(start["params"]["progressToken"], "tok");
        assert_eq!(start["params"]["progress"], 0.0);

        let mid = peer.recv().await;
        assert_eq!(mid["params"]["progress"], 1.0);
        assert_eq!(mid["params"]["message"], "half");

        let end = peer.recv().await;
        assert_eq!(end["params"]["progress"], 2.0);
        assert_eq!(end["params"]["total"], 2.0);

        let reply = peer.recv().await;
        assert_eq!(reply["result"]["done"], true);
    }

    #[tokio::test]
    async fn test_misplaced_progress_token() {
        let (_endpoint, mut peer) = connected(echo_handlers());
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "echo",
            "params": {"progressToken": 5}
        }))
        .await;
        assert_eq!(
            peer.recv().await["error"]["code"],
            error_codes::INVALID_PARAMS
        );
    }

    #[tokio::test]
    async fn test_outbound_request() {
        let (endpoint, mut peer) = connected(HandlerRegistry::new());
        let call = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.request("sampling/createMessage", Some(json!({"a": 1}))).await }
        });

        let request = peer.recv().await;
        assert_eq!(request["method"], "sampling/createMessage");
        peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"ok": 1}}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!({"ok": 1}));
        assert_eq!(endpoint.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_outbound_error_reply() {
        let (endpoint, mut peer) = connected(HandlerRegistry::new());
        let call = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.request("roots/list", None).await }
        });

        let request = peer.recv().await;
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32601, "message": "Unknown method: roots/list"}
        }))
        .await;

        match call.await.unwrap() {
            Err(Error::Rpc { code, .. }) => assert_eq!(code, -32601),
            other => panic!("Expected Rpc error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_sends_cancellation() {
        let (endpoint, mut peer) = connected(HandlerRegistry::new());
        let started = std::time::Instant::now();
        let call = tokio::spawn({
            let endpoint = endpoint.clone();
            async move {
                endpoint
                    .request_with_timeout("slow", None, Duration::from_millis(30))
                    .await
            }
        });

        let request = peer.recv().await;
        let outcome = call.await.unwrap();
        assert!(matches!(outcome, Err(Error::Timeout { millis: 30 })));
        assert!(started.elapsed() < Duration::from_millis(1000));

        let cancelled = peer.recv().await;
        assert_eq!(cancelled["method"], "notifications/cancelled");
        assert_eq!(cancelled["params"]["requestId"], request["id"]);
        assert_eq!(cancelled["params"]["reason"], "timeout");
        assert_eq!(endpoint.pending_calls(), 0);

        // A late reply is dropped, and the endpoint keeps working.
        peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {}}))
            .await;
        let next = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.request("again", None).await }
        });
        let request = peer.recv().await;
        assert_eq!(request["method"], "again");
        peer.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"n": 2}}))
            .await;
        assert_eq!(next.await.unwrap().unwrap(), json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_transport_loss_fails_pending() {
        let (endpoint, peer) = connected(HandlerRegistry::new());
        let call = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.request("never", None).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(peer);

        let outcome = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(Error::TransportClosed(_))));
        assert!(endpoint.is_closed());
    }

    #[tokio::test]
    async fn test_caller_supplied_duplicate_id() {
        let (endpoint, mut peer) = connected(HandlerRegistry::new());
        let first = tokio::spawn({
            let endpoint = endpoint.clone();
            async move {
                endpoint
                    .send_request(
                        JsonRpcRequest::new(RequestId::from("fixed"), "a", None),
                        Duration::from_secs(2),
                    )
                    .await
            }
        });
        let _ = peer.recv().await;

        let second = endpoint
            .send_request(
                JsonRpcRequest::new(RequestId::from("fixed"), "b", None),
                Duration::from_secs(2),
            )
            .await;
        assert!(matches!(second, Err(Error::InvalidRequest(_))));

        peer.send(json!({"jsonrpc": "2.0", "id": "fixed", "result": {}}))
            .await;
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_outbound_call() {
        let (endpoint, mut peer) = connected(HandlerRegistry::new());
        let call = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.request("long", None).await }
        });
        let request = peer.recv().await;
        let id = RequestId::from_value(&request["id"]).unwrap();

        assert!(endpoint.cancel(&id, "user").await);
        assert!(matches!(call.await.unwrap(), Err(Error::Cancelled(_))));

        let note = peer.recv().await;
        assert_eq!(note["method"], "notifications/cancelled");
        assert_eq!(note["params"]["reason"], "user");
        assert!(!endpoint.cancel(&id, "again").await);
    }
}
