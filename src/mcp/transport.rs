//! MCP transport layer implementations.
//!
//! A [`Transport`] moves raw JSON wire objects; framing and session
//! bookkeeping are its business, message semantics are not. This module
//! holds the trait and the newline-delimited stdio implementation. The
//! Streamable HTTP transports live in [`crate::http`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::mcp::protocol::RequestId;

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one wire object to the peer.
    async fn send(&self, message: Value) -> Result<()>;

    /// Wait for the next wire object from the peer.
    ///
    /// An error means the connection is unusable.
    async fn receive(&self) -> Result<Value>;

    /// Close the transport, waking any pending `receive`.
    async fn close(&self) -> Result<()>;

    /// The reply to `id` will never be sent because the request was cancelled.
    async fn abandon(&self, _id: &RequestId) -> Result<()> {
        Ok(())
    }
}

/// Default limit on one framed message, in bytes.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Newline-delimited JSON over a byte stream pair.
pub struct StdioTransport {
    reader: Mutex<FramedRead<BoxedReader, LinesCodec>>,
    writer: Mutex<FramedWrite<BoxedWriter, LinesCodec>>,
    shutdown: CancellationToken,
    child: Mutex<Option<Child>>,
}

impl StdioTransport {
    /// Create a transport over an arbitrary reader/writer pair.
    ///
    /// Inbound lines are limited to [`DEFAULT_MAX_MESSAGE_BYTES`].
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let codec = LinesCodec::new_with_max_length(DEFAULT_MAX_MESSAGE_BYTES);
        Self {
            reader: Mutex::new(FramedRead::new(Box::new(reader), codec)),
            writer: Mutex::new(FramedWrite::new(Box::new(writer), LinesCodec::new())),
            shutdown: CancellationToken::new(),
            child: Mutex::new(None),
        }
    }

    /// Limit inbound lines to `max` bytes. A longer line ends the stream.
    pub fn with_max_line_length(mut self, max: usize) -> Self {
        *self.reader.get_mut().decoder_mut() = LinesCodec::new_with_max_length(max);
        self
    }

    /// Create a transport over the process's own stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Spawn `program` and speak to it over its stdin/stdout.
    ///
    /// The child's stderr is forwarded to the log.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("child stdout unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = program.to_string();
            tokio::spawn(async move {
                let mut lines = FramedRead::new(
                    stderr,
                    LinesCodec::new_with_max_length(DEFAULT_MAX_MESSAGE_BYTES),
                );
                while let Some(Ok(line)) = lines.next().await {
                    debug!(target: "mcp_runtime::child", "[{}] {}", name, line);
                }
            });
        }

        info!("Spawned child process: {} {:?}", program, args);
        let transport = Self::new(stdout, stdin);
        Ok(Self {
            child: Mutex::new(Some(child)),
            ..transport
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: Value) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::TransportClosed("transport closed".to_string()));
        }
        let line = serde_json::to_string(&message)?;
        if line.contains('\n') || line.contains('\r') {
            return Err(Error::Transport(
                "message contains a raw line break".to_string(),
            ));
        }

        trace!("Sending: {}", line);
        let mut writer = self.writer.lock().await;
        writer.send(line).await.map_err(codec_error)
    }

    async fn receive(&self) -> Result<Value> {
        let mut reader = self.reader.lock().await;
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(Error::TransportClosed("transport closed".to_string()));
                }
                next = reader.next() => next,
            };

            match next {
                None => return Err(Error::TransportClosed("end of stream".to_string())),
                Some(Err(e)) => return Err(codec_error(e)),
                Some(Ok(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    trace!("Received: {}", trimmed);
                    return serde_json::from_str(trimmed)
                        .map_err(|e| Error::Parse(format!("malformed line: {}", e)));
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();

        if let Err(e) = SinkExt::<String>::close(&mut *self.writer.lock().await).await {
            debug!("Error closing writer: {}", e);
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(std::time::Duration::from_secs(2), child.wait()).await {
                Ok(Ok(status)) => debug!("Child exited: {}", status),
                _ => {
                    warn!("Child did not exit, killing it");
                    child.kill().await?;
                }
            }
        }
        Ok(())
    }
}

fn codec_error(err: LinesCodecError) -> Error {
    match err {
        LinesCodecError::Io(e) => Error::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            Error::Transport("line length limit exceeded".to_string())
        }
    }
}
