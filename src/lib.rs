//! MCP Runtime - Rust Implementation
//!
//! The control plane of the Model Context Protocol: a bidirectional
//! JSON-RPC 2.0 runtime that lets a client and a server exchange requests,
//! notifications and replies over an exchangeable transport.
//!
//! # Architecture
//!
//! 1. **Message Layer** (`mcp::protocol`, `mcp::codec`) - typed messages and their wire form
//! 2. **Dispatch Layer** (`mcp::endpoint`, `mcp::handler`) - correlation, handlers, filters
//! 3. **Flow Control** (`mcp::progress`, `mcp::cancellation`, `mcp::rate_limit`)
//! 4. **Lifecycle** (`mcp::lifecycle`, `mcp::server`, `mcp::client`) - version and capability negotiation
//! 5. **Transports** (`mcp::transport`, `http`) - framed stdio and Streamable HTTP with SSE
//!
//! Feature handlers (tools, resources, prompts, ...) live outside the runtime
//! and register against a [`mcp::HandlerRegistry`].

pub mod config;
pub mod error;
pub mod http;
pub mod mcp;
pub mod metrics;

pub use error::{Error, Result};

/// Runtime version, reported as the server implementation version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
