//! MCP server implementation.
//!
//! An [`McpServer`] is an [`Endpoint`] with the lifecycle wired in: it
//! answers `initialize` and `ping`, listens for `notifications/initialized`,
//! and rejects feature requests until the session is operational.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::mcp::endpoint::{Endpoint, EndpointOptions};
use crate::mcp::handler::{HandlerRegistry, RequestContext};
use crate::mcp::lifecycle::{Lifecycle, LifecycleConfig, LifecycleFilter, LifecycleState};
use crate::mcp::protocol::*;
use crate::mcp::rate_limit::{MethodRateLimit, RateLimiter};
use crate::mcp::transport::Transport;
use crate::VERSION;

/// Settings for one server session.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub lifecycle: LifecycleConfig,
    pub endpoint: EndpointOptions,
    /// Per-method request budget for the session, if any.
    pub requests_per_second: Option<u32>,
}

impl ServerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            lifecycle: LifecycleConfig::new(Implementation::new(name, VERSION)),
            endpoint: EndpointOptions::default(),
            requests_per_second: None,
        }
    }
}

/// MCP server.
pub struct McpServer {
    endpoint: Endpoint,
    lifecycle: Arc<Lifecycle>,
}

impl McpServer {
    /// Create a server session over `transport`.
    ///
    /// `features` holds the feature handlers shared by every session; the
    /// server works on its own fork of it.
    pub async fn new(
        transport: Arc<dyn Transport>,
        features: &HandlerRegistry,
        options: ServerOptions,
    ) -> Result<Self> {
        let lifecycle = Lifecycle::new(options.lifecycle);
        Self::with_lifecycle(
            transport,
            features,
            lifecycle,
            options.endpoint,
            options.requests_per_second,
        )
        .await
    }

    /// Create a server session with a prepared lifecycle.
    pub async fn with_lifecycle(
        transport: Arc<dyn Transport>,
        features: &HandlerRegistry,
        lifecycle: Lifecycle,
        options: EndpointOptions,
        requests_per_second: Option<u32>,
    ) -> Result<Self> {
        let lifecycle = Arc::new(lifecycle);
        let handlers = features.fork().await;
        if let Some(limit) = requests_per_second {
            handlers
                .add_filter_first(MethodRateLimit::new(RateLimiter::per_second(limit)?))
                .await;
        }
        handlers
            .add_filter_first(LifecycleFilter::new(lifecycle.clone()))
            .await;

        let lc = lifecycle.clone();
        handlers.on_request(
            methods::INITIALIZE,
            move |req: JsonRpcRequest, _ctx: RequestContext| {
                let lc = lc.clone();
                async move {
                    let params: InitializeParams = req.parse_params()?;
                    let result = lc.initialize(params).await?;
                    Ok::<Value, Error>(serde_json::to_value(result)?)
                }
            },
        );

        handlers.on_request(
            methods::PING,
            |_req: JsonRpcRequest, _ctx: RequestContext| async { Ok::<Value, Error>(json!({})) },
        );

        let lc = lifecycle.clone();
        handlers.on_notification(methods::INITIALIZED, move |_n: JsonRpcNotification| {
            let lc = lc.clone();
            async move { lc.initialized().await }
        });

        let endpoint = Endpoint::new(transport, Arc::new(handlers), options)?;
        Ok(Self {
            endpoint,
            lifecycle,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Run the server until the transport closes.
    pub async fn run(&self) -> Result<()> {
        let info = self.lifecycle.server_info();
        info!("Starting MCP server: {} v{}", info.name, info.version);
        let outcome = self.endpoint.run().await;
        self.lifecycle.shutdown().await;
        info!("MCP server stopped");
        outcome
    }

    /// Shut the session down and close its transport.
    pub async fn shutdown(&self) -> Result<()> {
        self.lifecycle.shutdown().await;
        self.endpoint.close().await
    }

    /// Call a client method, checking that the client offered the matching capability.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.lifecycle.state().await != LifecycleState::Operational {
            return Err(Error::NotInitialized);
        }
        let offered = match method {
            methods::SAMPLING_CREATE_MESSAGE => self.lifecycle.client_supports_sampling().await,
            methods::ROOTS_LIST => self.lifecycle.client_supports_roots().await,
            methods::ELICITATION_CREATE => self.lifecycle.client_supports_elicitation().await,
            _ => true,
        };
        if !offered {
            warn!("Client did not offer the capability for {}", method);
            return Err(Error::InvalidState(format!(
                "client capability missing for {}",
                method
            )));
        }
        self.endpoint
            .request_with_timeout(method, params, timeout)
            .await
    }

    /// Send a notification to the client.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.endpoint.notify(method, params).await
    }

    /// Ping the client.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        self.endpoint
            .request_with_timeout(methods::PING, None, timeout)
            .await
            .map(|_| ())
    }
}
