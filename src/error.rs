//! Error types for the MCP runtime.

use serde_json::Value;
use thiserror::Error;

use crate::mcp::protocol::error_codes;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the MCP runtime.
#[derive(Error, Debug)]
pub enum Error {
    // ===== Decode Errors =====
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Parse error: {0}")]
    Parse(String),

    // ===== Dispatch Errors =====
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// An error reply received from the peer.
    #[error("JSON-RPC error {code}: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    // ===== Protocol Errors =====
    #[error("Server not initialized")]
    NotInitialized,

    #[error("Invalid lifecycle state: {0}")]
    InvalidState(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(String),

    // ===== Transport Errors =====
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Origin not allowed: {0}")]
    OriginRejected(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("HTTP status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    // ===== I/O Errors =====
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // ===== Internal Errors =====
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout: operation timed out after {millis} ms")]
    Timeout { millis: u64 },

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Create an error reply value from code and message.
    pub fn rpc(code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
            data,
        }
    }

    /// The JSON-RPC error code used when this error is sent back to a peer.
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse(_) => error_codes::PARSE_ERROR,
            Self::Decode(_) | Self::InvalidRequest(_) | Self::InvalidState(_) => {
                error_codes::INVALID_REQUEST
            }
            Self::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) | Self::UnsupportedProtocolVersion(_) | Self::Json(_) => {
                error_codes::INVALID_PARAMS
            }
            Self::RateLimited(_) => error_codes::RATE_LIMITED,
            Self::NotInitialized => error_codes::NOT_INITIALIZED,
            Self::Rpc { code, .. } => *code,
            _ => error_codes::INTERNAL_ERROR,
        }
    }

    /// Message text used in an error reply.
    ///
    /// Dispatch errors carry the handler's original text rather than the
    /// prefixed `Display` form.
    pub fn reply_message(&self) -> String {
        match self {
            Self::Parse(m)
            | Self::Decode(m)
            | Self::InvalidRequest(m)
            | Self::InvalidParams(m)
            | Self::Internal(m)
            | Self::RateLimited(m)
            | Self::InvalidState(m) => m.clone(),
            Self::MethodNotFound(m) => format!("Unknown method: {}", m),
            Self::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Optional structured data attached to an error reply.
    pub fn reply_data(&self) -> Option<Value> {
        match self {
            Self::Rpc { data, .. } => data.clone(),
            _ => None,
        }
    }

    /// Check if this error is retriable (transient failures).
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => {
                *status == 503 || *status == 429 || (*status >= 500 && *status < 600)
            }
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::RateLimited(_) => true,
            _ => false,
        }
    }

    /// Check if this error means the underlying connection is gone.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::TransportClosed(_) | Self::Transport(_) | Self::Io(_) | Self::Http(_)
        )
    }
}
