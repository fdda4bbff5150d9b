//! Streamable HTTP sessions.
//!
//! Each session owns an [`McpServer`] running over an
//! [`HttpSessionTransport`]. POST bodies are queued into the transport; the
//! reply to a request goes back to the POST that carried it, everything else
//! goes to the session's event stream. A session outlives its connections
//! and ends only on `DELETE` or when it has been idle too long. A session
//! created from a known remote address answers only that address.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::http::sse::EventLog;
use crate::mcp::handler::HandlerRegistry;
use crate::mcp::lifecycle::{generate_session_id, Lifecycle};
use crate::mcp::protocol::{RequestId, PREVIOUS_PROTOCOL_VERSION};
use crate::mcp::server::{McpServer, ServerOptions};
use crate::mcp::transport::Transport;
use crate::metrics::RuntimeMetrics;

pub const SESSION_ID_HEADER: &str = "mcp-session-id";
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// How a POST carrying a request is answered.
#[derive(Debug)]
pub enum PostReply {
    Message(Value),
    /// The request was cancelled; no reply will be sent.
    Suppressed,
}

// ===== Transport =====

/// Transport between the HTTP handlers and one session's endpoint.
pub struct HttpSessionTransport {
    incoming_tx: mpsc::Sender<Value>,
    incoming_rx: Mutex<mpsc::Receiver<Value>>,
    waiting: DashMap<RequestId, oneshot::Sender<PostReply>>,
    events: Arc<EventLog>,
    closed: CancellationToken,
}

impl HttpSessionTransport {
    pub fn new(queue_capacity: usize, events: Arc<EventLog>) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            waiting: DashMap::new(),
            events,
            closed: CancellationToken::new(),
        }
    }

    /// Queue an inbound request and get the receiver its reply will arrive on.
    pub async fn deliver_request(
        &self,
        id: RequestId,
        message: Value,
    ) -> Result<oneshot::Receiver<PostReply>> {
        let (tx, rx) = oneshot::channel();
        match self.waiting.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::InvalidRequest(format!(
                    "Duplicate request id: {}",
                    id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        if let Err(e) = self.deliver(message).await {
            self.waiting.remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Queue an inbound notification or response.
    pub async fn deliver(&self, message: Value) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::TransportClosed("session closed".to_string()));
        }
        self.incoming_tx
            .send(message)
            .await
            .map_err(|_| Error::TransportClosed("session closed".to_string()))
    }

    /// Number of POSTs waiting for a reply.
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }
}

/// The id a reply is addressed to, if `message` is a reply.
fn reply_id(message: &Value) -> Option<RequestId> {
    if message.get("method").is_some() {
        return None;
    }
    message
        .get("id")
        .and_then(|id| RequestId::from_value(id).ok())
}

#[async_trait]
impl Transport for HttpSessionTransport {
    async fn send(&self, mut message: Value) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::TransportClosed("session closed".to_string()));
        }

        if let Some(id) = reply_id(&message) {
            if let Some((_, waiter)) = self.waiting.remove(&id) {
                match waiter.send(PostReply::Message(message)) {
                    Ok(()) => return Ok(()),
                    Err(PostReply::Message(returned)) => {
                        debug!("POST for {} is gone, sending reply on the event stream", id);
                        message = returned;
                    }
                    Err(PostReply::Suppressed) => return Ok(()),
                }
            }
        }

        self.events.publish(&message).await.map(|_| ())
    }

    async fn receive(&self) -> Result<Value> {
        let mut incoming = self.incoming_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::TransportClosed("session closed".to_string())),
            next = incoming.recv() => {
                next.ok_or_else(|| Error::TransportClosed("session closed".to_string()))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        self.events.close().await;
        self.waiting.clear();
        Ok(())
    }

    async fn abandon(&self, id: &RequestId) -> Result<()> {
        if let Some((_, waiter)) = self.waiting.remove(id) {
            let _ = waiter.send(PostReply::Suppressed);
        }
        Ok(())
    }
}

// ===== Session =====

/// One Streamable HTTP session.
pub struct HttpSession {
    id: String,
    server: Arc<McpServer>,
    transport: Arc<HttpSessionTransport>,
    events: Arc<EventLog>,
    owner: Option<IpAddr>,
    /// Set until the one tolerated request without a version header is used.
    version_grace: AtomicBool,
    created: Instant,
    last_seen_ms: AtomicU64,
}

impl HttpSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server(&self) -> &Arc<McpServer> {
        &self.server
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn transport(&self) -> &Arc<HttpSessionTransport> {
        &self.transport
    }

    pub fn touch(&self) {
        self.last_seen_ms
            .store(self.created.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// Whether an event stream is open or any exchange is still in progress.
    pub async fn is_busy(&self) -> bool {
        let endpoint = self.server.endpoint();
        self.transport.waiting() > 0
            || endpoint.in_flight() > 0
            || endpoint.pending_calls() > 0
            || self.events.has_subscriber().await
    }

    pub fn owner(&self) -> Option<IpAddr> {
        self.owner
    }

    /// Negotiated protocol version, or the compatibility version before the handshake.
    pub async fn protocol_version(&self) -> String {
        self.server
            .lifecycle()
            .protocol_version()
            .await
            .unwrap_or_else(|| PREVIOUS_PROTOCOL_VERSION.to_string())
    }

    /// Check the protocol-version header of a post-handshake request.
    ///
    /// A missing header is tolerated on the first such request only.
    pub async fn check_version(&self, header: Option<&str>) -> Result<()> {
        let expected = self.protocol_version().await;
        match header {
            Some(version) if version == expected => {
                self.version_grace.store(false, Ordering::SeqCst);
                Ok(())
            }
            Some(version) => Err(Error::HttpStatus {
                status: 400,
                message: format!(
                    "Protocol version mismatch: expected {}, got {}",
                    expected, version
                ),
            }),
            None if self.version_grace.swap(false, Ordering::SeqCst) => {
                debug!(
                    "Session {} sent no protocol version header, assuming {}",
                    self.id, expected
                );
                Ok(())
            }
            None => Err(Error::HttpStatus {
                status: 400,
                message: "Missing protocol version header".to_string(),
            }),
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.server.shutdown().await
    }
}

// ===== Session table =====

/// Settings shared by every session a manager creates.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub server: ServerOptions,
    pub history: usize,
    pub queue_capacity: usize,
    pub idle_timeout: Duration,
}

/// Table of live sessions.
pub struct SessionManager {
    sessions: DashMap<String, Arc<HttpSession>>,
    features: Arc<HandlerRegistry>,
    settings: SessionSettings,
    metrics: Arc<RuntimeMetrics>,
}

impl SessionManager {
    pub fn new(features: Arc<HandlerRegistry>, settings: SessionSettings) -> Self {
        let metrics = settings.server.endpoint.metrics.clone();
        Self {
            sessions: DashMap::new(),
            features,
            settings,
            metrics,
        }
    }

    /// Create a session and start its server.
    ///
    /// With an `owner` the session is only visible to requests from that address.
    pub async fn create(&self, owner: Option<IpAddr>) -> Result<Arc<HttpSession>> {
        let id = generate_session_id(self.settings.server.lifecycle.session_id_bytes);
        let events = Arc::new(EventLog::new(
            self.settings.history,
            self.settings.queue_capacity,
            self.metrics.clone(),
        ));
        let transport = Arc::new(HttpSessionTransport::new(
            self.settings.queue_capacity,
            events.clone(),
        ));
        let lifecycle = Lifecycle::new(self.settings.server.lifecycle.clone()).with_session_id(&id);
        let server = McpServer::with_lifecycle(
            transport.clone(),
            &self.features,
            lifecycle,
            self.settings.server.endpoint.clone(),
            self.settings.server.requests_per_second,
        )
        .await?;
        let server = Arc::new(server);

        tokio::spawn({
            let server = server.clone();
            async move {
                if let Err(e) = server.run().await {
                    warn!("Session server stopped with error: {}", e);
                }
            }
        });

        let session = Arc::new(HttpSession {
            id: id.clone(),
            server,
            transport,
            events,
            owner,
            version_grace: AtomicBool::new(true),
            created: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        });
        self.sessions.insert(id, session.clone());
        self.metrics.session_opened();
        info!("Created session {}", short_id(session.id()));
        Ok(session)
    }

    /// Look up a session on behalf of `remote` and mark it active.
    ///
    /// A session owned by another address is reported as not found.
    pub fn get(&self, id: &str, remote: Option<IpAddr>) -> Result<Arc<HttpSession>> {
        let session = self
            .sessions
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::SessionNotFound(short_id(id).to_string()))?;
        if let (Some(owner), Some(remote)) = (session.owner, remote) {
            if owner != remote {
                warn!(
                    "Session {} requested from {}, owned by {}",
                    short_id(id),
                    remote,
                    owner
                );
                return Err(Error::SessionNotFound(short_id(id).to_string()));
            }
        }
        session.touch();
        Ok(session)
    }

    /// Remove a session and close it.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(id)
            .ok_or_else(|| Error::SessionNotFound(short_id(id).to_string()))?;
        self.metrics.session_closed();
        info!("Closed session {}", short_id(id));
        session.close().await
    }

    /// Close every session idle for longer than the configured timeout.
    ///
    /// A session with an open stream or an unfinished exchange is not idle.
    pub async fn reap_idle(&self) -> usize {
        let idle: Vec<Arc<HttpSession>> = self
            .sessions
            .iter()
            .filter(|s| s.value().idle_for() > self.settings.idle_timeout)
            .map(|s| s.value().clone())
            .collect();

        let mut reaped = 0;
        for session in idle {
            if session.is_busy().await {
                session.touch();
                continue;
            }
            let id = session.id();
            debug!("Session {} idle, closing", short_id(id));
            if self.remove(id).await.is_ok() {
                reaped += 1;
            }
        }
        reaped
    }

    /// Periodically reap idle sessions until the manager is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = (self.settings.idle_timeout / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(sessions) = manager.upgrade() else {
                    break;
                };
                let reaped = sessions.reap_idle().await;
                if reaped > 0 {
                    info!("Reaped {} idle sessions", reaped);
                }
            }
        })
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            let _ = self.remove(&id).await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Enough of a session id to tell sessions apart in logs.
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
