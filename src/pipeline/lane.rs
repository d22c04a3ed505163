//! Lane Pipeline - per-reading processing sequence for one partition
//!
//! ```text
//! STAGE 1: Aggregate  (window store apply; late readings stop here)
//! STAGE 2: Detect     (band lookup + deviation check)
//! STAGE 3: Initiate   (command emission, STARTED row on success)
//! STAGE 4: Persist    (aggregate rows, regardless of violation)
//! ```
//!
//! A lane owns its window store and episode state outright; the only shared
//! resources are the sink adapter and the command publisher.

use std::sync::Arc;
use tracing::debug;

use crate::config::AggregateWritePolicy;
use crate::detection::BandRegistry;
use crate::metrics::EngineMetrics;
use crate::saga::{EmitError, Initiation, SagaInitiator};
use crate::storage::SinkAdapter;
use crate::types::{SagaCommand, SagaLogEntry, TelemetryReading};
use crate::window::WindowStore;

/// What one reading did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaneOutcome {
    pub late: bool,
    pub violation: bool,
    pub started: Option<SagaCommand>,
    pub suppressed: bool,
    pub buckets_updated: usize,
    pub buckets_closed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Command emission failed; the reading must be processed again.
    #[error("command emission failed for {device_id}: {source}")]
    Emit {
        device_id: String,
        #[source]
        source: EmitError,
    },
}

pub struct LanePipeline {
    lane: usize,
    windows: WindowStore,
    bands: Arc<BandRegistry>,
    initiator: SagaInitiator,
    sink: SinkAdapter,
    write_policy: AggregateWritePolicy,
    metrics: Arc<EngineMetrics>,
}

impl LanePipeline {
    pub fn new(
        lane: usize,
        windows: WindowStore,
        bands: Arc<BandRegistry>,
        initiator: SagaInitiator,
        sink: SinkAdapter,
        write_policy: AggregateWritePolicy,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            lane,
            windows,
            bands,
            initiator,
            sink,
            write_policy,
            metrics,
        }
    }

    pub fn lane(&self) -> usize {
        self.lane
    }

    pub fn windows(&self) -> &WindowStore {
        &self.windows
    }

    pub fn initiator(&self) -> &SagaInitiator {
        &self.initiator
    }

    /// Re-enter cooldown for sagas recorded before a restart.
    pub fn restore_sagas<'a, I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = &'a SagaLogEntry>,
    {
        for entry in entries {
            self.initiator.restore(entry);
        }
    }

    /// Run one reading through all stages.
    ///
    /// Safe to call again with the same reading after an `Err`: the window
    /// store ignores the repeat and the initiator is still idle.
    pub async fn process(
        &mut self,
        reading: &TelemetryReading,
    ) -> Result<LaneOutcome, PipelineError> {
        // STAGE 1: Aggregate
        let applied = self
            .windows
            .apply(&reading.device_id, reading.value, reading.event_time);
        if applied.late {
            self.metrics.record_late_drop();
            return Ok(LaneOutcome {
                late: true,
                ..LaneOutcome::default()
            });
        }

        // STAGE 2: Detect
        let band = self.bands.band_for(&reading.device_id);
        let violation = band.is_violated_by(reading);
        if violation && !applied.duplicate {
            self.metrics.record_violation();
        }

        // STAGE 3: Initiate
        let initiation = self.initiator.on_reading(reading, band, violation).await;
        let mut outcome = LaneOutcome {
            violation,
            buckets_updated: applied.updated.len(),
            buckets_closed: applied.closed.len(),
            ..LaneOutcome::default()
        };
        match &initiation {
            Ok(Initiation::Started { command, log_entry }) => {
                self.metrics.record_command_emitted();
                self.sink.write_saga_log(log_entry).await;
                outcome.started = Some(command.clone());
            }
            Ok(Initiation::Suppressed { saga_id }) => {
                self.metrics.record_command_suppressed();
                debug!(device_id = %reading.device_id, %saga_id, "Violation inside cooldown");
                outcome.suppressed = true;
            }
            Ok(Initiation::InTolerance) => {}
            Err(e) => {
                self.metrics.record_emission_failure();
                tracing::warn!(
                    lane = self.lane,
                    device_id = %reading.device_id,
                    event_time = reading.event_time,
                    error = %e,
                    "Command emission failed, reading will be retried"
                );
            }
        }

        // STAGE 4: Persist
        let to_write = match self.write_policy {
            AggregateWritePolicy::EveryUpdate => &applied.updated,
            AggregateWritePolicy::OnClose => &applied.closed,
        };
        for bucket in to_write {
            self.sink.write_aggregate(bucket).await;
        }

        match initiation {
            Ok(_) => {
                self.metrics.record_processed(self.lane);
                Ok(outcome)
            }
            Err(source) => Err(PipelineError::Emit {
                device_id: reading.device_id.clone(),
                source,
            }),
        }
    }

    /// Flush retained buckets at shutdown when writing on close.
    pub async fn finish(mut self) -> LaneReport {
        let mut flushed = 0;
        if self.write_policy == AggregateWritePolicy::OnClose {
            for bucket in self.windows.drain() {
                self.sink.write_aggregate(&bucket).await;
                flushed += 1;
            }
        }
        LaneReport {
            lane: self.lane,
            keys: self.windows.key_count(),
            late_drops: self.windows.late_drops(),
            buckets_flushed: flushed,
        }
    }
}

/// Per-lane summary returned at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneReport {
    pub lane: usize,
    pub keys: usize,
    pub late_drops: u64,
    pub buckets_flushed: usize,
}
