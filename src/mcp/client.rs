//! MCP client.
//!
//! [`McpClient`] owns an [`Endpoint`] whose reader loop runs in the
//! background, and performs the client half of the handshake.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mcp::endpoint::{Endpoint, EndpointOptions};
use crate::mcp::handler::{HandlerRegistry, RequestContext};
use crate::mcp::protocol::*;
use crate::mcp::transport::Transport;

/// MCP client.
pub struct McpClient {
    endpoint: Endpoint,
    reader: Mutex<Option<JoinHandle<Result<()>>>>,
    server: RwLock<Option<InitializeResult>>,
}

impl McpClient {
    /// Start an endpoint over `transport`.
    ///
    /// `handlers` answers requests the server sends us (sampling, roots, ...).
    /// `ping` is always answered.
    pub fn connect(
        transport: Arc<dyn Transport>,
        handlers: HandlerRegistry,
        options: EndpointOptions,
    ) -> Result<Self> {
        handlers.on_request(
            methods::PING,
            |_req: JsonRpcRequest, _ctx: RequestContext| async { Ok::<Value, Error>(json!({})) },
        );
        let endpoint = Endpoint::new(transport, Arc::new(handlers), options)?;
        let reader = endpoint.start();
        Ok(Self {
            endpoint,
            reader: Mutex::new(Some(reader)),
            server: RwLock::new(None),
        })
    }

    /// Run the handshake: `initialize`, then `notifications/initialized`.
    pub async fn initialize(
        &self,
        client_info: ClientInfo,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResult> {
        if self.server.read().await.is_some() {
            return Err(Error::InvalidState("already initialized".to_string()));
        }

        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities,
            client_info,
        };
        let value = self
            .endpoint
            .request(methods::INITIALIZE, Some(serde_json::to_value(params)?))
            .await?;
        let result: InitializeResult = serde_json::from_value(value)?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            warn!(
                "Server chose unsupported protocol version {}",
                result.protocol_version
            );
            return Err(Error::UnsupportedProtocolVersion(result.protocol_version));
        }
        if let Some(requested) = result.downgraded_from() {
            debug!("Server downgraded protocol version from {}", requested);
        }

        self.endpoint.notify(methods::INITIALIZED, None).await?;
        info!(
            "Connected to {} v{} (protocol {})",
            result.server_info.name, result.server_info.version, result.protocol_version
        );
        *self.server.write().await = Some(result.clone());
        Ok(result)
    }

    /// Call a server method with the default timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.endpoint.request(method, params).await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.endpoint
            .request_with_timeout(method, params, timeout)
            .await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.endpoint.notify(method, params).await
    }

    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        self.request_with_timeout(methods::PING, None, timeout)
            .await
            .map(|_| ())
    }

    /// Negotiated protocol version, once initialized.
    pub async fn protocol_version(&self) -> Option<String> {
        self.server
            .read()
            .await
            .as_ref()
            .map(|r| r.protocol_version.clone())
    }

    /// The server's initialize result, once initialized.
    pub async fn server(&self) -> Option<InitializeResult> {
        self.server.read().await.clone()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Close the endpoint and wait for the reader loop to finish.
    pub async fn close(&self) -> Result<()> {
        self.endpoint.close().await?;
        if let Some(reader) = self.reader.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(2), reader).await {
                Ok(Ok(outcome)) => outcome?,
                Ok(Err(e)) => warn!("Reader task failed: {}", e),
                Err(_) => warn!("Reader task did not stop in time"),
            }
        }
        Ok(())
    }
}
