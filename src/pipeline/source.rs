//! Telemetry source abstraction.
//!
//! Provides a unified trait for reading inbound JSON lines from different
//! places: a replay file, stdin, and the broker telemetry endpoint over TCP.
//! Every non-blank line consumes one offset, whether or not it decodes, so
//! offsets are stable across restarts of the same input. Only a replay file
//! can be re-read from a committed offset; stdin and the broker stream always
//! start at offset 0 and commit their position for observability only.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::metrics::EngineMetrics;
use crate::storage::{OffsetStore, SinkError};
use crate::transport::{LineClient, LineClientStats, TransportError};
use crate::types::{Delivery, TelemetryReading};

/// Events produced by a telemetry source.
pub enum SourceEvent {
    Delivery(Delivery),
    /// No more data (EOF for files/stdin, permanent disconnect for TCP).
    Eof,
}

/// Where telemetry comes from.
///
/// Implementations handle format parsing, reconnection and pacing internally.
/// The ingest loop calls [`next_delivery`](TelemetrySource::next_delivery)
/// in a `select!` with cancellation.
#[async_trait]
pub trait TelemetrySource: Send + 'static {
    /// Returns `Err` only on unrecoverable errors (e.g. reconnection exhausted).
    async fn next_delivery(&mut self) -> Result<SourceEvent>;

    /// Name used for logging and as the offset key.
    fn source_name(&self) -> &str;

    /// First offset this source will hand out.
    fn start_offset(&self) -> u64;
}

/// Which input a run reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    Replay(PathBuf),
    Stdin,
    Broker { endpoint: String, topic: String },
}

impl InputKind {
    /// Key the committed offset is stored under.
    pub fn source_name(&self) -> String {
        match self {
            Self::Replay(path) => ReplaySource::name_for(path),
            Self::Stdin => StdinSource::NAME.to_string(),
            Self::Broker { endpoint, topic } => TcpSource::name_for(endpoint, topic),
        }
    }

    /// Whether line `n` of a restarted run is the same line `n` as before.
    pub fn is_replayable(&self) -> bool {
        matches!(self, Self::Replay(_))
    }

    /// First offset to deliver. Live streams ignore a stored position: the
    /// broker never learns it, so skipping would drop fresh readings.
    pub fn resume_offset(&self, store: &dyn OffsetStore) -> Result<u64, SinkError> {
        let name = self.source_name();
        let committed = store.load_offset(&name)?;
        if self.is_replayable() {
            let offset = committed.unwrap_or(0);
            if offset > 0 {
                tracing::info!(source = %name, offset, "Resuming after committed offset");
            }
            return Ok(offset);
        }
        if let Some(offset) = committed {
            tracing::info!(
                source = %name,
                previous = offset,
                "Live source restarts at offset 0; previous position kept for reference only"
            );
        }
        Ok(0)
    }
}

/// Offset assignment and decoding shared by every line-based source.
struct LineDecoder {
    next_offset: u64,
    start_offset: u64,
    metrics: Arc<EngineMetrics>,
}

impl LineDecoder {
    fn new(start_offset: u64, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            next_offset: 0,
            start_offset,
            metrics,
        }
    }

    /// `None` for blank, already-committed or malformed lines.
    fn decode(&mut self, line: &str, source: &str) -> Option<Delivery> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let offset = self.next_offset;
        self.next_offset += 1;
        if offset < self.start_offset {
            return None;
        }
        match TelemetryReading::from_json_line(line) {
            Ok(reading) => Some(Delivery::new(offset, reading)),
            Err(e) => {
                self.metrics.record_decode_error();
                tracing::warn!(source, offset, error = %e, "Skipping malformed telemetry line");
                None
            }
        }
    }
}

// ============================================================================
// Line reader sources (stdin, replay file)
// ============================================================================

/// Reads JSON lines from any buffered reader.
///
/// Used with the simulator:
/// `reactor-sim --scenario mixed | reactor-saga --stdin`
pub struct LineSource<R> {
    name: String,
    reader: R,
    decoder: LineDecoder,
    delay: Option<Duration>,
    yielded_first: bool,
    line_buffer: String,
}

pub type StdinSource = LineSource<BufReader<tokio::io::Stdin>>;
pub type ReplaySource = LineSource<BufReader<tokio::fs::File>>;

impl<R> LineSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn from_reader(
        name: impl Into<String>,
        reader: R,
        start_offset: u64,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            name: name.into(),
            reader,
            decoder: LineDecoder::new(start_offset, metrics),
            delay: None,
            yielded_first: false,
            line_buffer: String::with_capacity(256),
        }
    }

    /// Sleep between deliveries (not before the first one).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = (!delay.is_zero()).then_some(delay);
        self
    }
}

impl StdinSource {
    pub const NAME: &'static str = "stdin";

    /// Stdin cannot be rewound, so it always starts at offset 0.
    pub fn stdin(metrics: Arc<EngineMetrics>) -> Self {
        Self::from_reader(Self::NAME, BufReader::new(tokio::io::stdin()), 0, metrics)
    }
}

impl ReplaySource {
    pub fn name_for(path: &Path) -> String {
        format!("replay:{}", path.display())
    }

    /// Open a JSON-lines file. Lines below `start_offset` were already
    /// committed by a previous run and are skipped.
    pub async fn open(path: &Path, start_offset: u64, metrics: Arc<EngineMetrics>) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("opening replay file {}", path.display()))?;
        Ok(Self::from_reader(
            Self::name_for(path),
            BufReader::new(file),
            start_offset,
            metrics,
        ))
    }
}

#[async_trait]
impl<R> TelemetrySource for LineSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn next_delivery(&mut self) -> Result<SourceEvent> {
        loop {
            self.line_buffer.clear();
            let bytes = self.reader.read_line(&mut self.line_buffer).await?;
            if bytes == 0 {
                return Ok(SourceEvent::Eof);
            }
            let Some(delivery) = self.decoder.decode(&self.line_buffer, &self.name) else {
                continue;
            };
            if let Some(delay) = self.delay.filter(|_| self.yielded_first) {
                tokio::time::sleep(delay).await;
            }
            self.yielded_first = true;
            return Ok(SourceEvent::Delivery(delivery));
        }
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn start_offset(&self) -> u64 {
        self.decoder.start_offset
    }
}

// ============================================================================
// TCP Source (broker telemetry endpoint)
// ============================================================================

/// Reads JSON lines from the broker telemetry endpoint.
///
/// Wraps [`LineClient`] which handles reconnection and timeouts internally.
pub struct TcpSource {
    client: LineClient,
    name: String,
    decoder: LineDecoder,
}

impl TcpSource {
    pub fn name_for(endpoint: &str, topic: &str) -> String {
        format!("tcp://{endpoint}/{topic}")
    }

    /// Connect to the broker and return a ready source. The broker pushes
    /// from its current position, so offsets restart at 0.
    pub async fn connect(
        mut client: LineClient,
        topic: &str,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self, TransportError> {
        client.connect().await?;
        Ok(Self {
            name: Self::name_for(client.addr(), topic),
            client,
            decoder: LineDecoder::new(0, metrics),
        })
    }

    pub fn connection_stats(&self) -> LineClientStats {
        self.client.stats()
    }

    fn log_end(&self, reason: &str) {
        let stats = self.client.stats();
        tracing::info!(
            source = %self.name,
            reason,
            lines_received = stats.lines_received,
            reconnections = stats.reconnections,
            timeouts = stats.timeouts,
            "Broker telemetry stream ended"
        );
    }
}

#[async_trait]
impl TelemetrySource for TcpSource {
    async fn next_delivery(&mut self) -> Result<SourceEvent> {
        loop {
            // read_line() reconnects internally; an error means reconnection
            // has already been exhausted.
            let line = match self.client.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.log_end("closed");
                    return Ok(SourceEvent::Eof);
                }
                Err(e) => {
                    self.log_end("reconnection exhausted");
                    return Err(anyhow::Error::new(e).context("broker telemetry stream"));
                }
            };
            if let Some(delivery) = self.decoder.decode(&line, &self.name) {
                return Ok(SourceEvent::Delivery(delivery));
            }
        }
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    fn start_offset(&self) -> u64 {
        self.decoder.start_offset
    }
}
