//! Configuration management for the MCP runtime.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::mcp::endpoint::EndpointOptions;
use crate::mcp::lifecycle::LifecycleConfig;
use crate::mcp::protocol::Implementation;
use crate::mcp::server::ServerOptions;
use crate::mcp::transport::DEFAULT_MAX_MESSAGE_BYTES;
use crate::metrics::RuntimeMetrics;

/// Command-line arguments for the MCP runtime.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mcp-runtime")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bidirectional JSON-RPC runtime for the Model Context Protocol")]
pub struct Args {
    /// YAML configuration file; replaces every other setting except logging flags
    #[arg(short, long, env = "MCP_RUNTIME_CONFIG")]
    pub config: Option<PathBuf>,

    /// Transport mode: stdio or http
    #[arg(short, long, default_value = "stdio", env = "MCP_RUNTIME_TRANSPORT")]
    pub transport: Transport,

    /// HTTP bind address
    #[arg(long, default_value = "127.0.0.1", env = "MCP_RUNTIME_BIND")]
    pub bind: String,

    /// HTTP port (only for http transport)
    #[arg(short, long, default_value = "3000", env = "MCP_RUNTIME_PORT")]
    pub port: u16,

    /// HTTP endpoint path
    #[arg(long, default_value = "/mcp", env = "MCP_RUNTIME_ENDPOINT")]
    pub endpoint: String,

    /// Allowed Origin values, comma separated ("*" allows any)
    #[arg(long = "allowed-origin", value_delimiter = ',', env = "MCP_RUNTIME_ALLOWED_ORIGINS")]
    pub allowed_origins: Vec<String>,

    /// Random bytes in a generated session id
    #[arg(long, default_value = "32", env = "MCP_RUNTIME_SESSION_ID_BYTES")]
    pub session_id_bytes: usize,

    /// Server-sent events retained per session for replay
    #[arg(long, default_value = "100", env = "MCP_RUNTIME_SSE_HISTORY")]
    pub sse_history: usize,

    /// Outbound queue capacity per connection
    #[arg(long, default_value = "64", env = "MCP_RUNTIME_QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    /// Progress notifications allowed per second per session
    #[arg(long, default_value = "20", env = "MCP_RUNTIME_PROGRESS_PER_SECOND")]
    pub progress_per_second: u32,

    /// Default timeout for outbound requests, in milliseconds
    #[arg(long, default_value = "30000", env = "MCP_RUNTIME_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// Largest accepted inbound message (stdio line or POST body), in bytes
    #[arg(long, default_value = "4194304", env = "MCP_RUNTIME_MAX_MESSAGE_BYTES")]
    pub max_message_bytes: usize,

    /// Requests per second admitted for each method in a session (unlimited if unset)
    #[arg(long, env = "MCP_RUNTIME_REQUESTS_PER_SECOND")]
    pub requests_per_second: Option<u32>,

    /// Idle time after which an HTTP session is discarded, in seconds
    #[arg(long, default_value = "1800", env = "MCP_RUNTIME_SESSION_IDLE_SECS")]
    pub session_idle_secs: u64,

    /// Reject unsupported protocol versions instead of downgrading
    #[arg(long, env = "MCP_RUNTIME_STRICT_VERSIONS")]
    pub strict_versions: bool,

    /// Server name reported during the handshake
    #[arg(long, default_value = "mcp-runtime", env = "MCP_RUNTIME_SERVER_NAME")]
    pub server_name: String,

    /// Instructions returned to clients during the handshake
    #[arg(long, env = "MCP_RUNTIME_INSTRUCTIONS")]
    pub instructions: Option<String>,

    /// Act as a client: spawn this server program, handshake over its stdio and print the result
    #[arg(long, value_name = "PROGRAM")]
    pub connect: Option<String>,

    /// Argument passed to the --connect program (repeatable)
    #[arg(long = "connect-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub connect_args: Vec<String>,

    /// Enable debug logging
    #[arg(short, long, env = "MCP_RUNTIME_DEBUG")]
    pub debug: bool,

    /// Emit logs as JSON
    #[arg(long, env = "MCP_RUNTIME_LOG_JSON")]
    pub log_json: bool,
}

/// Transport mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Stdio,
    Http,
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transport mode
    pub transport: Transport,
    /// HTTP bind address
    pub bind: String,
    /// HTTP port
    pub port: u16,
    /// HTTP endpoint path
    pub endpoint: String,
    /// Allowed Origin header values
    pub allowed_origins: Vec<String>,
    pub session_id_bytes: usize,
    pub sse_history: usize,
    pub queue_capacity: usize,
    pub progress_per_second: u32,
    pub request_timeout_ms: u64,
    pub max_message_bytes: usize,
    pub requests_per_second: Option<u32>,
    pub session_idle_secs: u64,
    pub strict_versions: bool,
    pub server_name: String,
    pub instructions: Option<String>,
    /// Server program to spawn in client mode
    pub connect: Option<String>,
    pub connect_args: Vec<String>,
    /// Debug mode
    pub debug: bool,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: Transport::Stdio,
            bind: "127.0.0.1".to_string(),
            port: 3000,
            endpoint: "/mcp".to_string(),
            allowed_origins: default_origins(),
            session_id_bytes: 32,
            sse_history: 100,
            queue_capacity: 64,
            progress_per_second: 20,
            request_timeout_ms: 30_000,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            requests_per_second: None,
            session_idle_secs: 1800,
            strict_versions: false,
            server_name: "mcp-runtime".to_string(),
            instructions: None,
            connect: None,
            connect_args: Vec::new(),
            debug: false,
            log_json: false,
        }
    }
}

fn default_origins() -> Vec<String> {
    vec![
        "http://localhost".to_string(),
        "http://127.0.0.1".to_string(),
    ]
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        let allowed_origins = if args.allowed_origins.is_empty() {
            default_origins()
        } else {
            args.allowed_origins
        };
        Self {
            transport: args.transport,
            bind: args.bind,
            port: args.port,
            endpoint: args.endpoint,
            allowed_origins,
            session_id_bytes: args.session_id_bytes,
            sse_history: args.sse_history,
            queue_capacity: args.queue_capacity,
            progress_per_second: args.progress_per_second,
            request_timeout_ms: args.request_timeout_ms,
            max_message_bytes: args.max_message_bytes,
            requests_per_second: args.requests_per_second,
            session_idle_secs: args.session_idle_secs,
            strict_versions: args.strict_versions,
            server_name: args.server_name,
            instructions: args.instructions,
            connect: args.connect,
            connect_args: args.connect_args,
            debug: args.debug,
            log_json: args.log_json,
        }
    }
}

impl Config {
    /// Build the configuration from arguments, or from `--config` when given.
    pub fn load(args: Args) -> Result<Self> {
        let config = match &args.config {
            Some(path) => {
                let mut config = Self::from_file(path)?;
                config.debug |= args.debug;
                config.log_json |= args.log_json;
                config
            }
            None => Self::from(args),
        };
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML configuration file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("session_id_bytes", self.session_id_bytes as u64),
            ("sse_history", self.sse_history as u64),
            ("queue_capacity", self.queue_capacity as u64),
            ("progress_per_second", self.progress_per_second as u64),
            ("request_timeout_ms", self.request_timeout_ms),
            ("max_message_bytes", self.max_message_bytes as u64),
            ("requests_per_second", self.requests_per_second.map_or(1, u64::from)),
            ("session_idle_secs", self.session_idle_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        if !self.endpoint.starts_with('/') {
            return Err(Error::Config(format!(
                "endpoint must start with '/': {}",
                self.endpoint
            )));
        }
        if self.server_name.trim().is_empty() {
            return Err(Error::Config("server_name must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        let mut lifecycle =
            LifecycleConfig::new(Implementation::new(&self.server_name, crate::VERSION));
        lifecycle.instructions = self.instructions.clone();
        lifecycle.strict_versions = self.strict_versions;
        lifecycle.session_id_bytes = self.session_id_bytes;
        lifecycle
    }

    pub fn endpoint_options(&self, metrics: Arc<RuntimeMetrics>) -> EndpointOptions {
        EndpointOptions {
            progress_per_second: self.progress_per_second,
            request_timeout: self.request_timeout(),
            metrics,
        }
    }

    pub fn server_options(&self, metrics: Arc<RuntimeMetrics>) -> ServerOptions {
        ServerOptions {
            lifecycle: self.lifecycle_config(),
            endpoint: self.endpoint_options(metrics),
            requests_per_second: self.requests_per_second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_transport_default() {
        assert_eq!(Transport::default(), Transport::Stdio);
    }

    #[test]
    fn test_transport_serialization() {
        let transports = [
            (Transport::Stdio, "\"stdio\""),
            (Transport::Http, "\"http\""),
        ];

        for (transport, expected) in &transports {
            let json = serde_json::to_string(transport).unwrap();
            assert_eq!(json, *expected);
        }
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.transport, Transport::Stdio);
        assert_eq!(config.endpoint, "/mcp");
        assert_eq!(config.session_id_bytes, 32);
        assert_eq!(config.sse_history, 100);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.progress_per_second, 20);
        assert_eq!(config.request_timeout(), Duration::from_millis(30_000));
        assert_eq!(config.session_idle_timeout(), Duration::from_secs(1800));
        assert_eq!(config.max_message_bytes, 4 * 1024 * 1024);
        assert!(config.requests_per_second.is_none());
        assert!(config.connect.is_none());
        assert!(!config.strict_versions);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_args_to_config() {
        let args = Args::parse_from([
            "mcp-runtime",
            "--transport",
            "http",
            "--port",
            "4000",
            "--allowed-origin",
            "https://a.example,https://b.example",
            "--strict-versions",
            "--sse-history",
            "10",
        ]);
        let config: Config = args.into();

        assert_eq!(config.transport, Transport::Http);
        assert_eq!(config.port, 4000);
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert!(config.strict_versions);
        assert_eq!(config.sse_history, 10);
        assert_eq!(config.queue_capacity, 64);
    }

    #[test]
    fn test_args_client_mode_and_limits() {
        let args = Args::parse_from([
            "mcp-runtime",
            "--connect",
            "/usr/local/bin/server",
            "--connect-arg=--transport",
            "--connect-arg",
            "stdio",
            "--requests-per-second",
            "5",
            "--max-message-bytes",
            "1024",
        ]);
        let config: Config = args.into();
        assert_eq!(config.connect.as_deref(), Some("/usr/local/bin/server"));
        assert_eq!(config.connect_args, vec!["--transport", "stdio"]);
        assert_eq!(config.requests_per_second, Some(5));
        assert_eq!(config.max_message_bytes, 1024);

        let options = config.server_options(RuntimeMetrics::new());
        assert_eq!(options.requests_per_second, Some(5));

        let config = Config {
            requests_per_second: Some(0),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_args_default_origins() {
        let config: Config = Args::parse_from(["mcp-runtime"]).into();
        assert_eq!(config.allowed_origins, default_origins());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = Config {
            sse_history: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sse_history"));

        let config = Config {
            endpoint: "mcp".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "transport: http\nport: 8080\nsse_history: 10\nallowed_origins: ['*']"
        )
        .unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            debug: true,
            ..Args::default()
        };
        let config = Config::load(args).unwrap();

        assert_eq!(config.transport, Transport::Http);
        assert_eq!(config.port, 8080);
        assert_eq!(config.sse_history, 10);
        assert_eq!(config.allowed_origins, vec!["*"]);
        assert_eq!(config.queue_capacity, 64);
        assert!(config.debug);
    }

    #[test]
    fn test_load_invalid_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "queue_capacity: 0").unwrap();
        let args = Args {
            config: Some(file.path().to_path_buf()),
            ..Args::default()
        };
        assert!(matches!(Config::load(args), Err(Error::Config(_))));
    }

    #[test]
    fn test_lifecycle_config() {
        let config = Config {
            server_name: "demo".to_string(),
            strict_versions: true,
            session_id_bytes: 16,
            ..Config::default()
        };
        let lifecycle = config.lifecycle_config();
        assert_eq!(lifecycle.server_info.name, "demo");
        assert!(lifecycle.strict_versions);
        assert_eq!(lifecycle.session_id_bytes, 16);
    }
}
