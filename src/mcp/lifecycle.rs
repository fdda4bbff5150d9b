//! Session lifecycle and version negotiation.
//!
//! `Uninitialized -> AwaitingInitialized -> Operational -> Shutdown`. The
//! `initialize` request moves the session out of `Uninitialized` exactly
//! once; the `notifications/initialized` notification makes it operational.
//! Until then only `initialize` and `ping` are dispatched.

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mcp::handler::RequestFilter;
use crate::mcp::protocol::{
    error_codes, methods, ClientCapabilities, ClientInfo, InitializeParams, InitializeResult,
    JsonRpcRequest, ServerCapabilities, ServerInfo, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Default length of a generated session id, in random bytes.
pub const DEFAULT_SESSION_ID_BYTES: usize = 32;

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    AwaitingInitialized,
    Operational,
    Shutdown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::AwaitingInitialized => "awaiting-initialized",
            Self::Operational => "operational",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Server-side negotiation settings.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub server_info: ServerInfo,
    pub capabilities: ServerCapabilities,
    pub instructions: Option<String>,
    pub supported_versions: Vec<String>,
    /// Reject unsupported versions instead of falling back to the latest.
    pub strict_versions: bool,
    pub session_id_bytes: usize,
}

impl LifecycleConfig {
    pub fn new(server_info: ServerInfo) -> Self {
        Self {
            server_info,
            capabilities: ServerCapabilities::default(),
            instructions: None,
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            strict_versions: false,
            session_id_bytes: DEFAULT_SESSION_ID_BYTES,
        }
    }
}

/// What the handshake settled on.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    pub session_id: String,
    pub protocol_version: String,
    pub client_info: ClientInfo,
    pub client_capabilities: ClientCapabilities,
    /// Experimental capabilities offered by both sides, sorted.
    pub shared_experimental: Vec<String>,
    /// The unsupported version the client asked for, if we fell back.
    pub downgraded_from: Option<String>,
}

struct State {
    phase: LifecycleState,
    negotiated: Option<Negotiated>,
}

/// Lifecycle of one server-side session.
pub struct Lifecycle {
    config: LifecycleConfig,
    /// Newest first.
    versions: Vec<String>,
    preset_session_id: Option<String>,
    state: RwLock<State>,
}

impl Lifecycle {
    pub fn new(config: LifecycleConfig) -> Self {
        let mut versions = config.supported_versions.clone();
        versions.sort_by(|a, b| b.cmp(a));
        versions.dedup();
        Self {
            config,
            versions,
            preset_session_id: None,
            state: RwLock::new(State {
                phase: LifecycleState::Uninitialized,
                negotiated: None,
            }),
        }
    }

    /// Use an id already issued by the transport instead of generating one.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.preset_session_id = Some(session_id.into());
        self
    }

    pub fn latest_version(&self) -> &str {
        self.versions
            .first()
            .map(String::as_str)
            .unwrap_or(crate::mcp::protocol::LATEST_PROTOCOL_VERSION)
    }

    pub fn supported_versions(&self) -> &[String] {
        &self.versions
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.config.server_info
    }

    pub fn server_capabilities(&self) -> &ServerCapabilities {
        &self.config.capabilities
    }

    /// Handle the `initialize` request.
    pub async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        let mut state = self.state.write().await;
        if state.phase != LifecycleState::Uninitialized {
            return Err(Error::InvalidState(format!(
                "Invalid lifecycle state: {}",
                state.phase
            )));
        }

        let requested = params.protocol_version;
        let (protocol_version, downgraded_from) = if self.versions.contains(&requested) {
            (requested, None)
        } else if self.config.strict_versions {
            return Err(Error::rpc(
                error_codes::INVALID_PARAMS,
                "Unsupported protocol version",
                Some(json!({
                    "supported": self.versions,
                    "requested": requested,
                })),
            ));
        } else {
            warn!(
                "Client requested unsupported protocol version {}, using {}",
                requested,
                self.latest_version()
            );
            (self.latest_version().to_string(), Some(requested))
        };

        let session_id = self
            .preset_session_id
            .clone()
            .unwrap_or_else(|| generate_session_id(self.config.session_id_bytes));

        info!(
            "Client initialized session: {} v{} (protocol {})",
            params.client_info.name, params.client_info.version, protocol_version
        );

        let meta = downgraded_from.as_ref().map(|requested| {
            json!({
                "compatibility": {
                    "requestedProtocolVersion": requested,
                    "downgraded": true,
                }
            })
        });

        let shared_experimental =
            shared_experimental(&params.capabilities, &self.config.capabilities);
        if !shared_experimental.is_empty() {
            debug!("Shared experimental capabilities: {:?}", shared_experimental);
        }

        state.negotiated = Some(Negotiated {
            session_id,
            protocol_version: protocol_version.clone(),
            client_info: params.client_info,
            client_capabilities: params.capabilities,
            shared_experimental,
            downgraded_from,
        });
        state.phase = LifecycleState::AwaitingInitialized;

        Ok(InitializeResult {
            protocol_version,
            capabilities: self.config.capabilities.clone(),
            server_info: self.config.server_info.clone(),
            instructions: self.config.instructions.clone(),
            meta,
        })
    }

    /// Handle `notifications/initialized`.
    pub async fn initialized(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.phase != LifecycleState::AwaitingInitialized {
            return Err(Error::InvalidState(format!(
                "Invalid lifecycle state: {}",
                state.phase
            )));
        }
        state.phase = LifecycleState::Operational;
        info!("Session is operational");
        Ok(())
    }

    /// Terminal transition.
    pub async fn shutdown(&self) {
        self.state.write().await.phase = LifecycleState::Shutdown;
    }

    pub async fn state(&self) -> LifecycleState {
        self.state.read().await.phase
    }

    pub async fn negotiated(&self) -> Option<Negotiated> {
        self.state.read().await.negotiated.clone()
    }

    pub async fn protocol_version(&self) -> Option<String> {
        self.state
            .read()
            .await
            .negotiated
            .as_ref()
            .map(|n| n.protocol_version.clone())
    }

    async fn client_offers(&self, offered: impl FnOnce(&ClientCapabilities) -> bool) -> bool {
        self.state
            .read()
            .await
            .negotiated
            .as_ref()
            .is_some_and(|n| offered(&n.client_capabilities))
    }

    /// Whether the client offered `sampling`.
    pub async fn client_supports_sampling(&self) -> bool {
        self.client_offers(|c| c.sampling.is_some()).await
    }

    /// Whether the client offered `roots`.
    pub async fn client_supports_roots(&self) -> bool {
        self.client_offers(|c| c.roots.is_some()).await
    }

    /// Whether the client offered `elicitation`.
    pub async fn client_supports_elicitation(&self) -> bool {
        self.client_offers(|c| c.elicitation.is_some()).await
    }

    /// Whether both sides offered the experimental capability `name`.
    pub async fn shares_experimental(&self, name: &str) -> bool {
        self.state
            .read()
            .await
            .negotiated
            .as_ref()
            .is_some_and(|n| n.shared_experimental.iter().any(|e| e == name))
    }
}

/// Names of the experimental capabilities both sides offered.
fn shared_experimental(client: &ClientCapabilities, server: &ServerCapabilities) -> Vec<String> {
    let (Some(client), Some(server)) = (&client.experimental, &server.experimental) else {
        return Vec::new();
    };
    let mut shared: Vec<String> = client
        .keys()
        .filter(|name| server.contains_key(*name))
        .cloned()
        .collect();
    shared.sort();
    shared
}

/// Request filter gating feature methods on the lifecycle state.
pub struct LifecycleFilter {
    lifecycle: Arc<Lifecycle>,
}

impl LifecycleFilter {
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl RequestFilter for LifecycleFilter {
    async fn check(&self, request: &JsonRpcRequest) -> Result<()> {
        match self.lifecycle.state().await {
            LifecycleState::Operational => Ok(()),
            LifecycleState::Shutdown => Err(Error::InvalidState(
                "Session has been shut down".to_string(),
            )),
            _ if methods::PRE_INITIALIZATION.contains(&request.method.as_str()) => Ok(()),
            _ => Err(Error::NotInitialized),
        }
    }
}

/// Generate a session id from `bytes` bytes of OS randomness, hex encoded.
pub fn generate_session_id(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
