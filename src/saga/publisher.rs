//! Outbound command transports.
//!
//! A publish either hands the command to the transport or fails with an
//! [`EmitError`]. Every failure is retryable: the caller leaves its state
//! untouched and the triggering reading is reprocessed.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};

use crate::transport::{LineClient, TransportError};
use crate::types::SagaCommand;

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("command transport unavailable: {0}")]
    Transport(#[from] TransportError),

    #[error("command encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("command channel closed")]
    ChannelClosed,

    #[error("stdout write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for saga commands. Shared by all lanes.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(&self, command: &SagaCommand) -> Result<(), EmitError>;

    /// Human-readable name for logging
    fn transport_name(&self) -> &str;
}

// ============================================================================
// TCP (broker command endpoint)
// ============================================================================

/// Publishes one JSON line per command to the broker command endpoint.
///
/// Connects lazily and makes a single attempt per publish; a dead broker
/// surfaces as an `EmitError` within the write timeout.
pub struct TcpPublisher {
    client: Mutex<LineClient>,
    name: String,
}

impl TcpPublisher {
    pub fn new(endpoint: &str, topic: &str, write_timeout: Duration) -> Self {
        Self {
            client: Mutex::new(LineClient::new(endpoint).with_write_timeout(write_timeout)),
            name: format!("tcp://{endpoint}/{topic}"),
        }
    }
}

#[async_trait]
impl CommandPublisher for TcpPublisher {
    async fn publish(&self, command: &SagaCommand) -> Result<(), EmitError> {
        let line = serde_json::to_string(command)?;
        self.client.lock().await.write_line(&line).await?;
        Ok(())
    }

    fn transport_name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Stdout
// ============================================================================

/// Writes commands as JSON lines on stdout (logs go to stderr).
pub struct StdoutPublisher {
    stdout: Mutex<tokio::io::Stdout>,
}

impl StdoutPublisher {
    pub fn new() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandPublisher for StdoutPublisher {
    async fn publish(&self, command: &SagaCommand) -> Result<(), EmitError> {
        let mut line = serde_json::to_vec(command)?;
        line.push(b'\n');
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(&line).await?;
        stdout.flush().await?;
        Ok(())
    }

    fn transport_name(&self) -> &str {
        "stdout"
    }
}

// ============================================================================
// In-process channel
// ============================================================================

/// Delivers commands to an in-process receiver.
pub struct ChannelPublisher {
    tx: mpsc::Sender<SagaCommand>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SagaCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CommandPublisher for ChannelPublisher {
    async fn publish(&self, command: &SagaCommand) -> Result<(), EmitError> {
        self.tx
            .send(command.clone())
            .await
            .map_err(|_| EmitError::ChannelClosed)
    }

    fn transport_name(&self) -> &str {
        "channel"
    }
}
