//! MCP Runtime - Rust Implementation
//!
//! Serves the MCP lifecycle over stdio or Streamable HTTP, or with
//! `--connect` runs the client handshake against a spawned server.

use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mcp_runtime_rs::config::{Args, Config, Transport};
use mcp_runtime_rs::error::{Error, Result};
use mcp_runtime_rs::mcp::{
    ClientCapabilities, HandlerRegistry, Implementation, McpClient, McpServer, StdioTransport,
};
use mcp_runtime_rs::metrics::RuntimeMetrics;
use mcp_runtime_rs::{http, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::load(args)?;

    init_logging(&config)?;

    info!("MCP Runtime v{}", VERSION);
    info!("Transport: {:?}", config.transport);

    let metrics = RuntimeMetrics::new();
    if let Some(program) = &config.connect {
        return run_client(&config, program, metrics).await;
    }
    let features = HandlerRegistry::new();

    match config.transport {
        Transport::Stdio => {
            info!("Starting stdio transport...");
            let transport =
                Arc::new(StdioTransport::stdio().with_max_line_length(config.max_message_bytes));
            let server = McpServer::new(transport, &features, config.server_options(metrics)).await?;
            server.run().await?;
        }
        Transport::Http => {
            info!("Starting HTTP transport on port {}...", config.port);
            http::start_server(&config, Arc::new(features), metrics).await?;
        }
    }

    Ok(())
}

/// Spawn `program`, run the handshake and a ping, and print the server's
/// initialize result on stdout.
async fn run_client(config: &Config, program: &str, metrics: Arc<RuntimeMetrics>) -> Result<()> {
    let transport = StdioTransport::spawn(program, &config.connect_args)?
        .with_max_line_length(config.max_message_bytes);
    let client = McpClient::connect(
        Arc::new(transport),
        HandlerRegistry::new(),
        config.endpoint_options(metrics),
    )?;

    let outcome: Result<()> = async {
        let result = client
            .initialize(
                Implementation::new(&config.server_name, VERSION),
                ClientCapabilities::default(),
            )
            .await?;
        client.ping(config.request_timeout()).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        Ok(())
    }
    .await;

    client.close().await?;
    outcome
}

/// Logs go to stderr; stdout carries the stdio wire.
fn init_logging(config: &Config) -> Result<()> {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if config.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))
}
