//! Line-delimited TCP client for the broker endpoints.
//!
//! Both broker endpoints speak newline-delimited JSON: the telemetry endpoint
//! streams readings, the command endpoint accepts one command per line.
//! [`LineClient`] owns the connection, TCP keepalive, read timeouts and
//! reconnection with exponential backoff.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::defaults::{
    CONNECT_TIMEOUT_SECS, INITIAL_RECONNECT_DELAY_MS, MAX_RECONNECT_ATTEMPTS,
    MAX_RECONNECT_DELAY_MS, TCP_KEEPALIVE_INTERVAL_SECS, TCP_KEEPALIVE_TIME_SECS,
};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {addr} failed: {message}")]
    ConnectionFailed { addr: String, message: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection counters, logged by the broker source when its stream ends.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct LineClientStats {
    pub connected: bool,
    pub lines_received: u64,
    pub lines_sent: u64,
    pub reconnections: u64,
    pub timeouts: u64,
}

pub struct LineClient {
    addr: String,
    stream: Option<BufReader<TcpStream>>,
    line_buffer: String,
    read_timeout: Duration,
    write_timeout: Duration,
    max_reconnect_attempts: u32,
    stats: LineClientStats,
}

impl LineClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
            line_buffer: String::with_capacity(512),
            read_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(5),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            stats: LineClientStats::default(),
        }
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stats(&self) -> LineClientStats {
        LineClientStats {
            connected: self.is_connected(),
            ..self.stats
        }
    }

    /// Connect with a bounded timeout. No-op when already connected.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        tracing::info!(address = %self.addr, "Connecting to broker endpoint");

        let connect_timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout(connect_timeout))?
            .map_err(|e| TransportError::ConnectionFailed {
                addr: self.addr.clone(),
                message: e.to_string(),
            })?;

        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(TCP_KEEPALIVE_TIME_SECS))
            .with_interval(Duration::from_secs(TCP_KEEPALIVE_INTERVAL_SECS));
        if let Err(e) = socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            tracing::debug!(error = %e, "Could not enable TCP keepalive");
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Could not set TCP_NODELAY");
        }

        self.stream = Some(BufReader::new(stream));
        tracing::info!(address = %self.addr, "Broker connection established");
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut reader) = self.stream.take() {
            let _ = reader.get_mut().shutdown().await;
        }
    }

    /// Drop the current connection and reconnect with exponential backoff.
    pub async fn reconnect(&mut self) -> Result<(), TransportError> {
        self.disconnect().await;

        for attempt in 1..=self.max_reconnect_attempts {
            let delay_ms = INITIAL_RECONNECT_DELAY_MS
                .saturating_mul(2u64.saturating_pow(attempt - 1))
                .min(MAX_RECONNECT_DELAY_MS);
            tracing::warn!(
                attempt,
                max_attempts = self.max_reconnect_attempts,
                delay_ms,
                address = %self.addr,
                "Reconnecting to broker endpoint"
            );
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            match self.connect().await {
                Ok(()) => {
                    self.stats.reconnections += 1;
                    return Ok(());
                }
                Err(e) => tracing::warn!(attempt, error = %e, "Reconnection attempt failed"),
            }
        }

        tracing::error!(
            max_attempts = self.max_reconnect_attempts,
            address = %self.addr,
            "Broker reconnection exhausted"
        );
        Err(TransportError::ConnectionFailed {
            addr: self.addr.clone(),
            message: format!(
                "failed to reconnect after {} attempts",
                self.max_reconnect_attempts
            ),
        })
    }

    /// Read the next non-empty line, reconnecting on timeout or disconnect.
    ///
    /// Returns `Ok(None)` only when reconnection is disabled
    /// (`max_reconnect_attempts == 0`) and the peer closed the stream.
    pub async fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        self.connect().await?;
        loop {
            match self.read_line_inner().await {
                Ok(Some(line)) => {
                    self.stats.lines_received += 1;
                    return Ok(Some(line));
                }
                Ok(None) => continue,
                Err(TransportError::Timeout(after)) => {
                    self.stats.timeouts += 1;
                    tracing::warn!(timeout = ?after, "Broker read timeout, reconnecting");
                    self.reconnect().await?;
                }
                Err(TransportError::ConnectionClosed) => {
                    if self.max_reconnect_attempts == 0 {
                        self.disconnect().await;
                        return Ok(None);
                    }
                    tracing::warn!("Broker closed the connection, reconnecting");
                    self.reconnect().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One read with timeout. `Ok(None)` means a blank line.
    async fn read_line_inner(&mut self) -> Result<Option<String>, TransportError> {
        let reader = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        self.line_buffer.clear();

        let bytes = tokio::time::timeout(self.read_timeout, reader.read_line(&mut self.line_buffer))
            .await
            .map_err(|_| TransportError::Timeout(self.read_timeout))??;
        if bytes == 0 {
            return Err(TransportError::ConnectionClosed);
        }

        let line = self.line_buffer.trim();
        Ok((!line.is_empty()).then(|| line.to_owned()))
    }

    /// Write one line, connecting lazily. A failed write drops the connection
    /// so the next call starts fresh; no retry happens here.
    pub async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let write_timeout = self.write_timeout;
        let connected = tokio::time::timeout(write_timeout, self.connect())
            .await
            .map_err(|_| TransportError::Timeout(write_timeout))
            .and_then(|r| r);
        if let Err(e) = connected {
            self.disconnect().await;
            return Err(e);
        }

        let reader = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let stream = reader.get_mut();
        let write = async {
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await
        };
        let result = match tokio::time::timeout(write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Timeout(write_timeout)),
        };

        match result {
            Ok(()) => {
                self.stats.lines_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.disconnect().await;
                Err(e)
            }
        }
    }
}
