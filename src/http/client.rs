//! Streamable HTTP client transport.
//!
//! Every outgoing message is POSTed to the server endpoint. Replies to our
//! requests come back in the POST response; everything the server sends on
//! its own arrives over a GET event stream that is opened once the session
//! exists and reopened with `Last-Event-ID` whenever it drops.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::http::session::{LAST_EVENT_ID_HEADER, PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER};
use crate::http::sse::{decode_sse_events, SseDecoder};
use crate::mcp::codec;
use crate::mcp::protocol::{methods, JsonRpcErrorResponse, Message, RequestId};
use crate::mcp::transport::Transport;

/// Delay before reopening a dropped event stream.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

const INCOMING_CAPACITY: usize = 64;

struct Shared {
    http: Client,
    url: String,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    incoming_tx: mpsc::Sender<Value>,
    last_event_id: AtomicU64,
    missed_events: AtomicU64,
    stream: Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
    reconnect_delay: Duration,
}

/// Client side of the Streamable HTTP transport.
pub struct HttpClientTransport {
    shared: Arc<Shared>,
    incoming_rx: Mutex<mpsc::Receiver<Value>>,
}

impl HttpClientTransport {
    /// Create a transport for the MCP endpoint at `url`.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("mcp-runtime/{}", crate::VERSION))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(http, url))
    }

    pub fn with_client(http: Client, url: impl Into<String>) -> Self {
        Self::with_options(http, url, RECONNECT_DELAY)
    }

    pub fn with_options(http: Client, url: impl Into<String>, reconnect_delay: Duration) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                http,
                url: url.into(),
                session_id: RwLock::new(None),
                protocol_version: RwLock::new(None),
                incoming_tx,
                last_event_id: AtomicU64::new(0),
                missed_events: AtomicU64::new(0),
                stream: Mutex::new(None),
                closed: CancellationToken::new(),
                reconnect_delay,
            }),
            incoming_rx: Mutex::new(incoming_rx),
        }
    }

    pub async fn session_id(&self) -> Option<String> {
        self.shared.session_id.read().await.clone()
    }

    pub async fn protocol_version(&self) -> Option<String> {
        self.shared.protocol_version.read().await.clone()
    }

    /// Id of the last event received on the event stream.
    pub fn last_event_id(&self) -> u64 {
        self.shared.last_event_id.load(Ordering::SeqCst)
    }

    /// Events the server could no longer replay after a reconnect.
    pub fn missed_events(&self) -> u64 {
        self.shared.missed_events.load(Ordering::SeqCst)
    }
}

impl Shared {
    async fn with_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(id) = self.session_id.read().await.as_deref() {
            req = req.header(SESSION_ID_HEADER, id);
        }
        if let Some(version) = self.protocol_version.read().await.as_deref() {
            req = req.header(PROTOCOL_VERSION_HEADER, version);
        }
        req
    }

    /// POST one message and return whatever messages the response carried.
    async fn post(&self, message: &Value) -> Result<Vec<Value>> {
        let req = self
            .http
            .post(&self.url)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        let resp = self.with_headers(req).await.send().await?;

        if let Some(id) = resp
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut session = self.session_id.write().await;
            if session.is_none() {
                info!("Joined session {}", id.get(..8).unwrap_or(id));
                *session = Some(id.to_string());
            }
        }
        if let Some(version) = resp
            .headers()
            .get(PROTOCOL_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.protocol_version.write().await = Some(version.to_string());
        }

        let status = resp.status();
        if status == StatusCode::ACCEPTED {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                message: body,
            });
        }

        let is_stream = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        if is_stream {
            decode_sse_events(&body)
                .iter()
                .map(|data| serde_json::from_str(data).map_err(Error::from))
                .collect()
        } else {
            Ok(vec![serde_json::from_str(&body)?])
        }
    }

    async fn forward(&self, message: Value) {
        if self.incoming_tx.send(message).await.is_err() {
            debug!("Receiver gone, dropping inbound message");
        }
    }

    /// Record the version an initialize result settled on.
    async fn observe_initialize(&self, reply: &Value) {
        if let Some(version) = reply
            .get("result")
            .and_then(|r| r.get("protocolVersion"))
            .and_then(Value::as_str)
        {
            *self.protocol_version.write().await = Some(version.to_string());
        }
    }

    /// Open the event stream once a session exists.
    async fn ensure_stream(self: &Arc<Self>) {
        if self.session_id.read().await.is_none() || self.closed.is_cancelled() {
            return;
        }
        let mut stream = self.stream.lock().await;
        if stream.is_none() {
            let shared = self.clone();
            *stream = Some(tokio::spawn(async move { shared.stream_loop().await }));
        }
    }

    async fn stream_loop(self: Arc<Self>) {
        loop {
            if self.closed.is_cancelled() {
                break;
            }
            match self.read_stream().await {
                Ok(StreamEnd::Dropped) => debug!("Event stream ended, reconnecting"),
                Ok(StreamEnd::Unavailable) => {
                    info!("Server offers no event stream");
                    break;
                }
                Err(Error::HttpStatus { status: 404, .. }) => {
                    warn!("Session no longer exists on the server");
                    break;
                }
                Err(e) if worth_reconnecting(&e) => warn!("Event stream failed: {}", e),
                Err(e) => {
                    warn!("Event stream failed, not reconnecting: {}", e);
                    break;
                }
            }
            tokio::select! {
                _ = self.closed.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    async fn read_stream(&self) -> Result<StreamEnd> {
        // Always resume, so events published before the first GET are replayed.
        let last = self.last_event_id.load(Ordering::SeqCst);
        let req = self
            .http
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(LAST_EVENT_ID_HEADER, last.to_string());
        let resp = self.with_headers(req).await.send().await?;

        let status = resp.status();
        if status == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(StreamEnd::Unavailable);
        }
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        debug!("Event stream open (last event id {})", last);

        let mut body = resp.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = self.closed.cancelled() => return Ok(StreamEnd::Dropped),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return Ok(StreamEnd::Dropped);
            };
            pending.extend_from_slice(&chunk?);
            let text = take_utf8(&mut pending);
            for event in decoder.push(&text) {
                self.accept_event(event.id.as_deref(), &event.data).await;
            }
        }
    }

    async fn accept_event(&self, id: Option<&str>, data: &str) {
        if let Some(id) = id.and_then(|id| id.parse::<u64>().ok()) {
            let last = self.last_event_id.load(Ordering::SeqCst);
            if id <= last {
                debug!("Skipping already seen event {}", id);
                return;
            }
            if id > last + 1 {
                let missed = id - last - 1;
                warn!("Event stream skipped {} events after {}", missed, last);
                self.missed_events.fetch_add(missed, Ordering::SeqCst);
            }
            self.last_event_id.store(id, Ordering::SeqCst);
        }
        match serde_json::from_str::<Value>(data) {
            Ok(message) => self.forward(message).await,
            Err(e) => warn!("Ignoring malformed event payload: {}", e),
        }
    }
}

enum StreamEnd {
    Dropped,
    Unavailable,
}

/// A lost connection or a transient server error is retried; a rejection is not.
fn worth_reconnecting(err: &Error) -> bool {
    err.is_retriable() || err.is_transport_failure()
}

/// Drain the longest valid UTF-8 prefix, keeping a split character for later.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    let rest = pending.split_off(valid);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}

#[async_trait]
impl Transport for HttpClientTransport {
    async fn send(&self, message: Value) -> Result<()> {
        if self.shared.closed.is_cancelled() {
            return Err(Error::TransportClosed("transport closed".to_string()));
        }

        let request = match codec::decode(&message) {
            Ok(Message::Request(request)) => Some(request),
            _ => None,
        };

        let Some(request) = request else {
            for inbound in self.shared.post(&message).await? {
                self.shared.forward(inbound).await;
            }
            self.shared.ensure_stream().await;
            return Ok(());
        };

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let initializing = request.method == methods::INITIALIZE;
            match shared.post(&message).await {
                Ok(replies) => {
                    for reply in replies {
                        if initializing && reply.get("id") == Some(&request.id.to_value()) {
                            shared.observe_initialize(&reply).await;
                        }
                        shared.forward(reply).await;
                    }
                    shared.ensure_stream().await;
                }
                Err(e) => {
                    warn!("POST {} failed: {}", request.method, e);
                    let failure = fail_reply(request.id, &e);
                    shared.forward(failure).await;
                }
            }
        });
        Ok(())
    }

    async fn receive(&self) -> Result<Value> {
        let mut incoming = self.incoming_rx.lock().await;
        tokio::select! {
            _ = self.shared.closed.cancelled() => {
                Err(Error::TransportClosed("transport closed".to_string()))
            }
            next = incoming.recv() => {
                next.ok_or_else(|| Error::TransportClosed("transport closed".to_string()))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.is_cancelled() {
            return Ok(());
        }
        self.shared.closed.cancel();
        if let Some(stream) = self.shared.stream.lock().await.take() {
            stream.abort();
        }

        if self.shared.session_id.read().await.is_some() {
            let req = self.shared.with_headers(self.shared.http.delete(&self.shared.url)).await;
            match req.send().await {
                Ok(resp) => debug!("Session delete returned {}", resp.status()),
                Err(e) => debug!("Session delete failed: {}", e),
            }
        }
        Ok(())
    }
}

/// A local error reply standing in for a request the server never answered.
fn fail_reply(id: RequestId, err: &Error) -> Value {
    codec::encode_error(&JsonRpcErrorResponse::from_error(id, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_utf8_keeps_split_character() {
        let bytes = "data: é\n".as_bytes();
        let mut pending = bytes[..7].to_vec();
        assert_eq!(take_utf8(&mut pending), "data: ");
        assert_eq!(pending.len(), 1);

        pending.extend_from_slice(&bytes[7..]);
        assert_eq!(take_utf8(&mut pending), "é\n");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_reconnect_decision() {
        let status = |status: u16| Error::HttpStatus {
            status,
            message: String::new(),
        };
        assert!(worth_reconnecting(&status(503)));
        assert!(worth_reconnecting(&status(429)));
        assert!(worth_reconnecting(&Error::TransportClosed("eof".into())));
        assert!(worth_reconnecting(&Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))));
        assert!(!worth_reconnecting(&status(400)));
        assert!(!worth_reconnecting(&status(403)));
    }

    #[test]
    fn test_fail_reply_is_error_for_request() {
        let reply = fail_reply(
            RequestId::Number(4),
            &Error::HttpStatus {
                status: 404,
                message: "gone".to_string(),
            },
        );
        assert_eq!(reply["id"], 4);
        assert_eq!(reply["error"]["code"], -32603);
    }

    #[tokio::test]
    async fn test_event_ids_detect_gaps_and_duplicates() {
        let transport = HttpClientTransport::with_client(Client::new(), "http://127.0.0.1:1/mcp");
        let shared = &transport.shared;

        shared.accept_event(Some("1"), r#"{"n":1}"#).await;
        shared.accept_event(Some("1"), r#"{"n":1}"#).await;
        shared.accept_event(Some("4"), r#"{"n":4}"#).await;

        assert_eq!(transport.last_event_id(), 4);
        assert_eq!(transport.missed_events(), 2);
        assert_eq!(transport.receive().await.unwrap()["n"], 1);
        assert_eq!(transport.receive().await.unwrap()["n"], 4);
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_request() {
        let transport = HttpClientTransport::with_client(Client::new(), "http://127.0.0.1:1/mcp");
        transport
            .send(serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await
            .unwrap();
        let reply = transport.receive().await.unwrap();
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["error"]["code"], -32603);

        let notify = transport
            .send(serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        assert!(notify.is_err());
    }
}
