//! Streamable HTTP transport.
//!
//! One endpoint path accepts `POST` (a message from the client), `GET` (the
//! server-to-client event stream) and `DELETE` (end the session). `/health`
//! and `/metrics` sit beside it.

pub mod client;
pub mod session;
pub mod sse;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use serde_json::Value;
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::mcp::codec;
use crate::mcp::handler::HandlerRegistry;
use crate::mcp::protocol::{methods, JsonRpcErrorResponse, Message, RequestId};
use crate::metrics::RuntimeMetrics;

use session::{
    HttpSession, PostReply, SessionManager, SessionSettings, LAST_EVENT_ID_HEADER,
    PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER,
};

pub use client::HttpClientTransport;

/// HTTP server state.
#[derive(Clone)]
pub struct HttpState {
    sessions: Arc<SessionManager>,
    allowed_origins: Arc<Vec<String>>,
    max_body_bytes: usize,
    metrics: Arc<RuntimeMetrics>,
}

impl HttpState {
    pub fn new(config: &Config, features: Arc<HandlerRegistry>, metrics: Arc<RuntimeMetrics>) -> Self {
        let settings = SessionSettings {
            server: config.server_options(metrics.clone()),
            history: config.sse_history,
            queue_capacity: config.queue_capacity,
            idle_timeout: config.session_idle_timeout(),
        };
        Self {
            sessions: Arc::new(SessionManager::new(features, settings)),
            allowed_origins: Arc::new(config.allowed_origins.clone()),
            max_body_bytes: config.max_message_bytes,
            metrics,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Reject a request whose `Origin` is present but not allowed.
    fn check_origin(&self, headers: &HeaderMap) -> Result<()> {
        let Some(origin) = headers.get(header::ORIGIN) else {
            return Ok(());
        };
        let origin = origin
            .to_str()
            .map_err(|_| Error::OriginRejected("non-ASCII origin".to_string()))?;
        if origin_allowed(origin, &self.allowed_origins) {
            Ok(())
        } else {
            warn!("Rejected request from origin {}", origin);
            Err(Error::OriginRejected(origin.to_string()))
        }
    }
}

/// `origin` matches an entry exactly or with an added port; `*` matches anything.
pub fn origin_allowed(origin: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|entry| {
        entry == "*"
            || entry == origin
            || origin
                .strip_prefix(entry.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .is_some_and(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
    })
}

/// Build the router for the MCP endpoint.
pub fn router(state: HttpState, endpoint: &str) -> Router {
    let allow_origin = if state.allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        AllowOrigin::list(origins)
    };
    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(SESSION_ID_HEADER),
            HeaderName::from_static(PROTOCOL_VERSION_HEADER),
        ]);
    let body_limit = DefaultBodyLimit::max(state.max_body_bytes);

    Router::new()
        .route(
            endpoint,
            get(handle_get).post(handle_post).delete(handle_delete),
        )
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(body_limit),
        )
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: HttpState, endpoint: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let reaper = state.sessions.spawn_reaper();
    let sessions = state.sessions.clone();
    let app = router(state, endpoint);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
        .await?;

    reaper.abort();
    sessions.close_all().await;
    info!("HTTP server stopped");
    Ok(())
}

/// Start the HTTP server.
pub async fn start_server(
    config: &Config,
    features: Arc<HandlerRegistry>,
    metrics: Arc<RuntimeMetrics>,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .map_err(|e| Error::Config(format!("invalid bind address: {}", e)))?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        "Starting HTTP server on http://{}{}",
        listener.local_addr()?,
        config.endpoint
    );

    let state = HttpState::new(config, features, metrics);
    serve(listener, state, &config.endpoint, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ===== Errors =====

/// Error rendered as an HTTP status with a plain-text body.
struct HttpError(Error);

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::OriginRejected(_) => StatusCode::FORBIDDEN,
            Error::SessionNotFound(_) | Error::TransportClosed(_) => StatusCode::NOT_FOUND,
            Error::HttpStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Error::InvalidRequest(_) | Error::Decode(_) | Error::Parse(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        debug!("HTTP {}: {}", status, self.0);
        (status, self.0.to_string()).into_response()
    }
}

fn bad_request(message: &str) -> Error {
    Error::HttpStatus {
        status: 400,
        message: message.to_string(),
    }
}

fn not_acceptable(message: &str) -> Error {
    Error::HttpStatus {
        status: 406,
        message: message.to_string(),
    }
}

/// A JSON-RPC error reply sent directly as the POST response.
fn rpc_error(status: StatusCode, id: RequestId, err: &Error) -> Response {
    let reply = codec::encode_error(&JsonRpcErrorResponse::from_error(id, err));
    (status, Json(reply)).into_response()
}

// ===== Header helpers =====

/// Read a header that must be visible ASCII if present.
fn visible_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let text = value
        .to_str()
        .ok()
        .filter(|v| !v.is_empty() && v.bytes().all(|b| (0x21..=0x7e).contains(&b)))
        .ok_or_else(|| bad_request(&format!("Invalid {} header", name)))?;
    Ok(Some(text))
}

fn accepts(headers: &HeaderMap, media: &str) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.split(';').next().unwrap_or("").trim())
        .any(|v| v == media || v == "*/*")
}

fn has_accept(headers: &HeaderMap) -> bool {
    headers.contains_key(header::ACCEPT)
}

/// Resolve the session named by the request's session header.
async fn existing_session(
    state: &HttpState,
    headers: &HeaderMap,
    remote: IpAddr,
) -> Result<Arc<HttpSession>> {
    let id = visible_header(headers, SESSION_ID_HEADER)?
        .ok_or_else(|| bad_request("Missing session id header"))?;
    let version = visible_header(headers, PROTOCOL_VERSION_HEADER)?;
    let session = state.sessions.get(id, Some(remote))?;
    session.check_version(version).await?;
    Ok(session)
}

fn with_session_headers(mut response: Response, session_id: Option<&str>, version: &str) -> Response {
    let headers = response.headers_mut();
    if let Some(id) = session_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        headers.insert(SESSION_ID_HEADER, id);
    }
    if let Ok(version) = HeaderValue::from_str(version) {
        headers.insert(PROTOCOL_VERSION_HEADER, version);
    }
    response
}

// ===== Handlers =====

/// Health check endpoint.
async fn health_check(State(state): State<HttpState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "sessions": state.sessions.len(),
    }))
}

/// Prometheus metrics endpoint.
async fn metrics(State(state): State<HttpState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

async fn handle_post(
    State(state): State<HttpState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match post_message(&state, &headers, remote.ip(), body).await {
        Ok(response) => response,
        Err(e) => HttpError(e).into_response(),
    }
}

async fn post_message(
    state: &HttpState,
    headers: &HeaderMap,
    remote: IpAddr,
    body: Bytes,
) -> Result<Response> {
    state.check_origin(headers)?;
    if has_accept(headers)
        && !accepts(headers, "application/json")
        && !accepts(headers, "text/event-stream")
    {
        return Err(not_acceptable(
            "POST must accept application/json or text/event-stream",
        ));
    }
    visible_header(headers, SESSION_ID_HEADER)?;
    visible_header(headers, PROTOCOL_VERSION_HEADER)?;

    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return Ok(rpc_error(
                StatusCode::BAD_REQUEST,
                RequestId::Null,
                &Error::Parse(e.to_string()),
            ))
        }
    };
    let message = match codec::decode(&value) {
        Ok(message) => message,
        Err(e) => return Ok(rpc_error(StatusCode::BAD_REQUEST, codec::recover_id(&value), &e)),
    };

    let initializing = matches!(&message, Message::Request(r) if r.method == methods::INITIALIZE);
    let (session, created) = if initializing && !headers.contains_key(SESSION_ID_HEADER) {
        (state.sessions.create(Some(remote)).await?, true)
    } else {
        (existing_session(state, headers, remote).await?, false)
    };

    let Message::Request(request) = message else {
        session.transport().deliver(value).await?;
        return Ok(StatusCode::ACCEPTED.into_response());
    };

    let receiver = match session
        .transport()
        .deliver_request(request.id.clone(), value)
        .await
    {
        Ok(receiver) => receiver,
        Err(e @ Error::InvalidRequest(_)) => {
            return Ok(rpc_error(StatusCode::OK, request.id, &e));
        }
        Err(e) => return Err(e),
    };
    let reply = receiver
        .await
        .map_err(|_| Error::TransportClosed("session closed".to_string()))?;

    let reply = match reply {
        PostReply::Suppressed => return Ok(StatusCode::ACCEPTED.into_response()),
        PostReply::Message(reply) => reply,
    };

    if created && reply.get("error").is_some() {
        debug!("Handshake failed, discarding session");
        let _ = state.sessions.remove(session.id()).await;
        return Ok((StatusCode::OK, Json(reply)).into_response());
    }

    let version = session.protocol_version().await;
    let session_id = created.then(|| session.id());
    Ok(with_session_headers(
        (StatusCode::OK, Json(reply)).into_response(),
        session_id,
        &version,
    ))
}

async fn handle_get(
    State(state): State<HttpState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    match open_stream(&state, &headers, remote.ip()).await {
        Ok(response) => response,
        Err(e) => HttpError(e).into_response(),
    }
}

async fn open_stream(state: &HttpState, headers: &HeaderMap, remote: IpAddr) -> Result<Response> {
    state.check_origin(headers)?;
    if !accepts(headers, "text/event-stream") {
        return Err(not_acceptable("GET must accept text/event-stream"));
    }
    let session = existing_session(state, headers, remote).await?;

    let last_event_id = match visible_header(headers, LAST_EVENT_ID_HEADER)? {
        Some(raw) => match raw.parse::<u64>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("Ignoring invalid Last-Event-ID: {}", raw);
                None
            }
        },
        None => None,
    };

    let subscription = session.events().subscribe(last_event_id).await?;
    debug!(
        "Event stream opened for session, replaying {} events",
        subscription.replay.events.len()
    );

    let stream = futures::stream::iter(subscription.replay.events)
        .chain(ReceiverStream::new(subscription.receiver))
        .map(|event| Ok::<Event, Infallible>(Event::default().id(event.id.to_string()).data(event.data)));

    let version = session.protocol_version().await;
    Ok(with_session_headers(
        Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response(),
        None,
        &version,
    ))
}

async fn handle_delete(
    State(state): State<HttpState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let outcome: Result<()> = async {
        state.check_origin(&headers)?;
        let session = existing_session(&state, &headers, remote.ip()).await?;
        state.sessions.remove(session.id()).await
    }
    .await;

    match outcome {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => HttpError(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_allowed() {
        let allowed = vec!["http://localhost".to_string(), "https://app.example".to_string()];
        assert!(origin_allowed("http://localhost", &allowed));
        assert!(origin_allowed("http://localhost:5173", &allowed));
        assert!(origin_allowed("https://app.example", &allowed));
        assert!(!origin_allowed("http://localhost.evil.example", &allowed));
        assert!(!origin_allowed("http://localhost:", &allowed));
        assert!(!origin_allowed("https://evil.example", &allowed));
        assert!(origin_allowed("https://evil.example", &["*".to_string()]));
    }

    #[test]
    fn test_accepts() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json;q=0.9, text/event-stream"),
        );
        assert!(accepts(&headers, "application/json"));
        assert!(accepts(&headers, "text/event-stream"));
        assert!(!accepts(&headers, "text/html"));

        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        assert!(accepts(&headers, "text/event-stream"));
    }

    #[test]
    fn test_visible_header() {
        let mut headers = HeaderMap::new();
        assert!(visible_header(&headers, SESSION_ID_HEADER).unwrap().is_none());

        headers.insert(SESSION_ID_HEADER, HeaderValue::from_static("abc123"));
        assert_eq!(
            visible_header(&headers, SESSION_ID_HEADER).unwrap(),
            Some("abc123")
        );

        headers.insert(SESSION_ID_HEADER, HeaderValue::from_static("abc 123"));
        assert!(visible_header(&headers, SESSION_ID_HEADER).is_err());
    }

    #[test]
    fn test_error_status_mapping() {
        let status = |e: Error| HttpError(e).into_response().status();
        assert_eq!(status(Error::OriginRejected("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(status(Error::SessionNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(bad_request("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status(not_acceptable("x")), StatusCode::NOT_ACCEPTABLE);
        assert_eq!(
            status(Error::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
