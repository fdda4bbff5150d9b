//! Model Context Protocol (MCP) runtime.
//!
//! # Architecture
//!
//! - `protocol` - Message model, method names, handshake payloads
//! - `codec` - Wire object <-> message conversion
//! - `endpoint` - Dispatcher: correlation, reader loop, timeouts
//! - `pending` / `progress` / `cancellation` - Per-call bookkeeping
//! - `lifecycle` - Handshake state machine and version negotiation
//! - `server` / `client` - Endpoints pre-wired for each side of the handshake
//! - `transport` - Transport trait and newline-delimited stdio

pub mod cancellation;
pub mod client;
pub mod codec;
pub mod endpoint;
pub mod handler;
pub mod lifecycle;
pub mod pending;
pub mod progress;
pub mod protocol;
pub mod rate_limit;
pub mod server;
pub mod transport;

pub use client::McpClient;
pub use endpoint::{Endpoint, EndpointOptions};
pub use handler::{
    HandlerRegistry, NotificationHandler, RequestContext, RequestFilter, RequestHandler,
};
pub use lifecycle::{Lifecycle, LifecycleConfig, LifecycleState};
pub use protocol::*;
pub use server::{McpServer, ServerOptions};
pub use transport::{StdioTransport, Transport};
