//! MCP request and notification handlers.
//!
//! Feature code registers a [`RequestHandler`] or [`NotificationHandler`]
//! against a method name. Closures of the right shape implement both traits.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::mcp::cancellation::CancellationHandle;
use crate::mcp::endpoint::Endpoint;
use crate::mcp::progress::ProgressReporter;
use crate::mcp::protocol::{JsonRpcNotification, JsonRpcRequest, RequestId};

/// Everything a request handler may need besides the request itself.
#[derive(Clone)]
pub struct RequestContext {
    request_id: RequestId,
    cancellation: CancellationHandle,
    progress: ProgressReporter,
    peer: Endpoint,
}

impl RequestContext {
    pub fn new(
        request_id: RequestId,
        cancellation: CancellationHandle,
        progress: ProgressReporter,
        peer: Endpoint,
    ) -> Self {
        Self {
            request_id,
            cancellation,
            progress,
            peer,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Whether the peer has cancelled this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the peer cancels this request.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn cancellation_reason(&self) -> Option<String> {
        self.cancellation.reason()
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// The endpoint the request arrived on, for calls back to the peer.
    pub fn peer(&self) -> &Endpoint {
        &self.peer
    }
}

/// Handler for an inbound request.
///
/// Returning `Err(Error::InvalidParams)` produces an invalid-params reply
/// carrying the error text; any other error becomes an internal error, except
/// `Error::Rpc` which is sent with its own code.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: JsonRpcRequest, ctx: RequestContext) -> Result<Value>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(JsonRpcRequest, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, request: JsonRpcRequest, ctx: RequestContext) -> Result<Value> {
        (self)(request, ctx).await
    }
}

/// Listener for an inbound notification.
///
/// Notification handlers run on the reader task, so they must not wait on
/// replies from the peer.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, notification: JsonRpcNotification) -> Result<()>;
}

#[async_trait]
impl<F, Fut> NotificationHandler for F
where
    F: Fn(JsonRpcNotification) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, notification: JsonRpcNotification) -> Result<()> {
        (self)(notification).await
    }
}

/// Hook consulted before a request is dispatched.
///
/// Returning an error rejects the request with that error's code.
#[async_trait]
pub trait RequestFilter: Send + Sync {
    async fn check(&self, request: &JsonRpcRequest) -> Result<()>;
}

/// Registry of request handlers, notification listeners, and request filters.
#[derive(Default)]
pub struct HandlerRegistry {
    requests: DashMap<String, Arc<dyn RequestHandler>>,
    notifications: DashMap<String, Arc<dyn NotificationHandler>>,
    filters: RwLock<Vec<Arc<dyn RequestFilter>>>,
}

impl HandlerRegistry {
    /// Create a new handler registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request handler, replacing any previous one for `method`.
    pub fn on_request<H: RequestHandler + 'static>(&self, method: impl Into<String>, handler: H) {
        self.requests.insert(method.into(), Arc::new(handler));
    }

    /// Register a notification listener, replacing any previous one for `method`.
    pub fn on_notification<H: NotificationHandler + 'static>(
        &self,
        method: impl Into<String>,
        handler: H,
    ) {
        self.notifications.insert(method.into(), Arc::new(handler));
    }

    /// Append a request filter. Filters run in registration order.
    pub async fn add_filter<F: RequestFilter + 'static>(&self, filter: F) {
        self.filters.write().await.push(Arc::new(filter));
    }

    /// Insert a filter ahead of every existing one.
    pub async fn add_filter_first<F: RequestFilter + 'static>(&self, filter: F) {
        self.filters.write().await.insert(0, Arc::new(filter));
    }

    /// A new registry sharing this one's handler instances.
    ///
    /// Each session forks the shared feature registry so it can add its own
    /// lifecycle handlers without affecting other sessions.
    pub async fn fork(&self) -> HandlerRegistry {
        let forked = HandlerRegistry::new();
        for entry in self.requests.iter() {
            forked
                .requests
                .insert(entry.key().clone(), entry.value().clone());
        }
        for entry in self.notifications.iter() {
            forked
                .notifications
                .insert(entry.key().clone(), entry.value().clone());
        }
        *forked.filters.write().await = self.filters.read().await.clone();
        forked
    }

    pub fn request_handler(&self, method: &str) -> Option<Arc<dyn RequestHandler>> {
        self.requests.get(method).map(|h| h.value().clone())
    }

    pub fn notification_handler(&self, method: &str) -> Option<Arc<dyn NotificationHandler>> {
        self.notifications.get(method).map(|h| h.value().clone())
    }

    pub fn has_request_handler(&self, method: &str) -> bool {
        self.requests.contains_key(method)
    }

    /// Run every filter against the request; the first rejection wins.
    pub async fn check(&self, request: &JsonRpcRequest) -> Result<()> {
        let filters = self.filters.read().await.clone();
        for filter in filters {
            filter.check(request).await?;
        }
        Ok(())
    }

    /// Names of all registered request methods.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.requests.iter().map(|e| e.key().clone()).collect();
        methods.sort();
        methods
    }
}
