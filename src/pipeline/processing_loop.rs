//! Ingest loop shared across all input modes.
//!
//! Pulls deliveries from a [`TelemetrySource`] and submits them to the
//! [`PartitionedRuntime`] until the source ends or cancellation fires. The
//! runtime itself is shut down by the caller.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::runtime::{PartitionedRuntime, SubmitError};
use super::source::{SourceEvent, TelemetrySource};
use crate::metrics::EngineMetrics;

/// Log a progress line every this many submitted deliveries.
const PROGRESS_EVERY: u64 = 1_000;

/// Why the ingest loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestEnd {
    SourceExhausted,
    Cancelled,
    SourceFailed,
    RuntimeClosed,
}

/// Counters for one ingest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub submitted: u64,
    pub rejected: u64,
    pub end: IngestEnd,
}

/// Owns the runtime while ingesting; take it back with
/// [`into_runtime`](IngestLoop::into_runtime) to shut it down.
pub struct IngestLoop {
    runtime: PartitionedRuntime,
    metrics: Arc<EngineMetrics>,
    cancel: CancellationToken,
}

impl IngestLoop {
    pub fn new(
        runtime: PartitionedRuntime,
        metrics: Arc<EngineMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            metrics,
            cancel,
        }
    }

    pub fn into_runtime(self) -> PartitionedRuntime {
        self.runtime
    }

    /// Run until the source is exhausted or cancellation.
    pub async fn run<S: TelemetrySource>(&self, source: &mut S) -> IngestStats {
        let mut submitted = 0u64;
        let mut rejected = 0u64;

        info!(
            source = source.source_name(),
            start_offset = source.start_offset(),
            lanes = self.runtime.partition_count(),
            "Consuming telemetry"
        );

        let end = loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("Shutdown signal received, ingestion stopped");
                    break IngestEnd::Cancelled;
                }
                result = source.next_delivery() => match result {
                    Ok(ev) => ev,
                    Err(e) => {
                        warn!(source = source.source_name(), error = ?e, "Source error");
                        break IngestEnd::SourceFailed;
                    }
                }
            };

            let delivery = match event {
                SourceEvent::Delivery(d) => d,
                SourceEvent::Eof => {
                    info!(submitted, "Source reached end");
                    break IngestEnd::SourceExhausted;
                }
            };

            let offset = delivery.offset;
            match self.runtime.submit(delivery).await {
                Ok(_) => submitted += 1,
                Err(SubmitError::LaneFull { lane }) => {
                    // the offset stays pending, so a restart replays it
                    rejected += 1;
                    warn!(lane, offset, "Lane full, delivery rejected");
                }
                Err(e @ SubmitError::Closed { .. }) => {
                    warn!(offset, error = %e, "Runtime stopped accepting deliveries");
                    break IngestEnd::RuntimeClosed;
                }
            }

            if submitted > 0 && submitted % PROGRESS_EVERY == 0 {
                let snap = self.metrics.snapshot();
                info!(
                    submitted,
                    processed = snap.readings_processed,
                    commands = snap.commands_emitted,
                    late_drops = snap.late_drops,
                    "Progress"
                );
            }
        };

        let snap = self.metrics.snapshot();
        info!(
            submitted,
            rejected,
            processed = snap.readings_processed,
            violations = snap.violations,
            commands_emitted = snap.commands_emitted,
            commands_suppressed = snap.commands_suppressed,
            late_drops = snap.late_drops,
            decode_errors = snap.decode_errors,
            "Ingestion finished"
        );

        IngestStats {
            submitted,
            rejected,
            end,
        }
    }
}
