//! Partitioned Runtime - key-routed lanes with bounded queues
//!
//! ```text
//!   submit(delivery)
//!        │  lane = hash(device_id) % N
//!        ▼
//!   ┌─────────┐  ┌─────────┐       ┌─────────┐
//!   │ lane 0  │  │ lane 1  │  ...  │ lane N-1│   bounded mpsc per lane
//!   └────┬────┘  └────┬────┘       └────┬────┘
//!        ▼            ▼                 ▼
//!   LanePipeline (windows, detection, initiator, sink) one task each
//!        │
//!        └── ack(offset) ──► OffsetCommitter
//! ```
//!
//! A device always hashes to the same lane, and a lane consumes its queue in
//! order, so per-device ordering holds without any lock on window state.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::lane::{LanePipeline, LaneReport};
use super::offsets::OffsetCommitter;
use crate::config::{AggregateWritePolicy, BackpressurePolicy, EngineConfig};
use crate::detection::BandRegistry;
use crate::metrics::EngineMetrics;
use crate::saga::{CommandPublisher, SagaInitiator};
use crate::storage::SinkAdapter;
use crate::types::{Delivery, EventTime, SagaLogEntry};
use crate::window::{WindowSpec, WindowSpecError, WindowStore};

/// Lane owning `device_id` out of `partition_count` lanes.
pub fn lane_for(device_id: &str, partition_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    (hasher.finish() % partition_count.max(1) as u64) as usize
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("lane {lane} queue is full")]
    LaneFull { lane: usize },

    #[error("lane {lane} has stopped")]
    Closed { lane: usize },
}

/// Tunables for the runtime, usually derived from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub partition_count: usize,
    pub lane_queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub max_delivery_attempts: u32,
    pub retry_backoff: Duration,
    pub window: WindowSpec,
    pub cooldown: EventTime,
    pub write_policy: AggregateWritePolicy,
}

impl RuntimeSettings {
    pub fn from_config(config: &EngineConfig) -> Result<Self, WindowSpecError> {
        Ok(Self {
            partition_count: config.runtime.partition_count.max(1),
            lane_queue_capacity: config.runtime.lane_queue_capacity.max(1),
            backpressure: config.runtime.backpressure,
            max_delivery_attempts: config.runtime.max_delivery_attempts.max(1),
            retry_backoff: Duration::from_millis(config.runtime.retry_backoff_ms),
            window: config.window_spec()?,
            cooldown: config.cooldown_ms(),
            write_policy: config.sink.aggregate_writes,
        })
    }
}

/// Shared collaborators handed to every lane.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub bands: Arc<BandRegistry>,
    pub publisher: Arc<dyn CommandPublisher>,
    pub sink: SinkAdapter,
    pub offsets: OffsetCommitter,
    pub metrics: Arc<EngineMetrics>,
}

/// Summary returned by [`PartitionedRuntime::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeReport {
    pub lanes: Vec<LaneReport>,
    pub committed_offset: u64,
    pub outstanding: usize,
}

pub struct PartitionedRuntime {
    senders: Vec<mpsc::Sender<Delivery>>,
    workers: Vec<JoinHandle<LaneReport>>,
    backpressure: BackpressurePolicy,
    offsets: OffsetCommitter,
    sink: SinkAdapter,
    metrics: Arc<EngineMetrics>,
    cancel: CancellationToken,
}

impl PartitionedRuntime {
    /// Spawn one task per lane. `restored` are STARTED rows from the durable
    /// log; each lane takes the ones for devices it owns.
    pub fn start(
        settings: &RuntimeSettings,
        deps: RuntimeDeps,
        restored: &[SagaLogEntry],
        cancel: CancellationToken,
    ) -> Self {
        let cancel = cancel.child_token();
        let n = settings.partition_count.max(1);
        let mut senders = Vec::with_capacity(n);
        let mut workers = Vec::with_capacity(n);

        for lane in 0..n {
            let mut pipeline = LanePipeline::new(
                lane,
                WindowStore::new(settings.window),
                deps.bands.clone(),
                SagaInitiator::new(settings.cooldown, deps.publisher.clone()),
                deps.sink.clone(),
                settings.write_policy,
                deps.metrics.clone(),
            );
            pipeline.restore_sagas(
                restored
                    .iter()
                    .filter(|entry| lane_for(&entry.device_id, n) == lane),
            );

            let (tx, rx) = mpsc::channel(settings.lane_queue_capacity.max(1));
            let worker = LaneWorker {
                pipeline,
                rx,
                offsets: deps.offsets.clone(),
                metrics: deps.metrics.clone(),
                max_attempts: settings.max_delivery_attempts.max(1),
                backoff: settings.retry_backoff,
                cancel: cancel.clone(),
            };
            senders.push(tx);
            workers.push(tokio::spawn(worker.run()));
        }

        info!(
            lanes = n,
            queue_capacity = settings.lane_queue_capacity,
            backpressure = ?settings.backpressure,
            restored_sagas = restored.len(),
            "Partitioned runtime started"
        );

        Self {
            senders,
            workers,
            backpressure: settings.backpressure,
            offsets: deps.offsets,
            sink: deps.sink,
            metrics: deps.metrics,
            cancel,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.senders.len()
    }

    pub fn offsets(&self) -> &OffsetCommitter {
        &self.offsets
    }

    /// Route a delivery to its lane. Returns the lane index.
    ///
    /// The offset is registered before enqueueing, so a rejected delivery
    /// holds the commit position back until it is resubmitted.
    pub async fn submit(&self, delivery: Delivery) -> Result<usize, SubmitError> {
        let lane = lane_for(&delivery.reading.device_id, self.senders.len());
        let sender = &self.senders[lane];
        self.offsets.begin(delivery.offset);

        match self.backpressure {
            BackpressurePolicy::Block => sender
                .send(delivery)
                .await
                .map_err(|_| SubmitError::Closed { lane })?,
            BackpressurePolicy::Reject => {
                sender.try_send(delivery).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => {
                        self.metrics.record_submit_rejected();
                        SubmitError::LaneFull { lane }
                    }
                    mpsc::error::TrySendError::Closed(_) => SubmitError::Closed { lane },
                })?
            }
        }
        Ok(lane)
    }

    /// Drain lane queues, join workers, commit and flush.
    pub async fn shutdown(self) -> RuntimeReport {
        drop(self.senders);

        let mut lanes = Vec::with_capacity(self.workers.len());
        for joined in futures::future::join_all(self.workers).await {
            match joined {
                Ok(report) => lanes.push(report),
                Err(e) => warn!(error = %e, "Lane task failed"),
            }
        }

        let committed_offset = self.offsets.commit_now();
        self.sink.flush().await;
        self.cancel.cancel();

        let report = RuntimeReport {
            lanes,
            committed_offset,
            outstanding: self.offsets.outstanding(),
        };
        info!(
            committed_offset = report.committed_offset,
            outstanding = report.outstanding,
            "Partitioned runtime stopped"
        );
        report
    }
}

struct LaneWorker {
    pipeline: LanePipeline,
    rx: mpsc::Receiver<Delivery>,
    offsets: OffsetCommitter,
    metrics: Arc<EngineMetrics>,
    max_attempts: u32,
    backoff: Duration,
    cancel: CancellationToken,
}

impl LaneWorker {
    async fn run(mut self) -> LaneReport {
        let lane = self.pipeline.lane();
        debug!(lane, "Lane started");
        while let Some(delivery) = self.rx.recv().await {
            if self.deliver(&delivery).await {
                self.offsets.ack(delivery.offset);
            }
        }
        let report = self.pipeline.finish().await;
        debug!(lane, keys = report.keys, late_drops = report.late_drops, "Lane stopped");
        report
    }

    /// Process with in-lane redelivery. Returns whether the offset may be
    /// acknowledged.
    async fn deliver(&mut self, delivery: &Delivery) -> bool {
        let mut backoff = self.backoff;
        for attempt in 1..=self.max_attempts {
            match self.pipeline.process(&delivery.reading).await {
                Ok(_) => return true,
                Err(e) if attempt < self.max_attempts && !self.cancel.is_cancelled() => {
                    self.metrics.record_redelivery();
                    debug!(
                        lane = self.pipeline.lane(),
                        offset = delivery.offset,
                        attempt,
                        error = %e,
                        "Redelivering"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => {}
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    self.metrics.record_abandoned();
                    warn!(
                        lane = self.pipeline.lane(),
                        offset = delivery.offset,
                        attempts = attempt,
                        error = %e,
                        "Delivery abandoned, offset left unacknowledged"
                    );
                    return false;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DeviceBand;
    use crate::saga::ChannelPublisher;
    use crate::storage::InMemoryStore;
    use crate::types::{SagaCommand, TelemetryReading};

    fn settings(partitions: usize, capacity: usize, backpressure: BackpressurePolicy) -> RuntimeSettings {
        RuntimeSettings {
            partition_count: partitions,
            lane_queue_capacity: capacity,
            backpressure,
            max_delivery_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            window: WindowSpec::new(300_000, 60_000).unwrap(),
            cooldown: 300_000,
            write_policy: AggregateWritePolicy::EveryUpdate,
        }
    }

    fn deps(
        partitions: usize,
    ) -> (RuntimeDeps, Arc<InMemoryStore>, mpsc::Receiver<SagaCommand>) {
        let metrics = Arc::new(EngineMetrics::new(partitions));
        let store = Arc::new(InMemoryStore::new());
        let (publisher, rx) = ChannelPublisher::new(1_024);
        let deps = RuntimeDeps {
            bands: Arc::new(BandRegistry::new(DeviceBand::new("vver-1000", 980.0, 0.05))),
            publisher: Arc::new(publisher),
            sink: SinkAdapter::new(store.clone(), Duration::from_secs(1), metrics.clone()),
            offsets: OffsetCommitter::new("test", 0, Some(store.clone()), metrics.clone()),
            metrics,
        };
        (deps, store, rx)
    }

    #[test]
    fn lane_assignment_is_stable_and_in_range() {
        for device in ["Rivne-3", "Rivne-4", "ZAP-5", "ZAP-6"] {
            let lane = lane_for(device, 3);
            assert!(lane < 3);
            assert_eq!(lane, lane_for(device, 3));
        }
        assert_eq!(lane_for("anything", 0), 0);
    }

    #[tokio::test]
    async fn processes_and_commits_every_delivery() {
        let (deps, store, mut commands) = deps(3);
        let metrics = deps.metrics.clone();
        let runtime = PartitionedRuntime::start(
            &settings(3, 16, BackpressurePolicy::Block),
            deps,
            &[],
            CancellationToken::new(),
        );

        let devices = ["Rivne-3", "Rivne-4", "ZAP-5", "ZAP-6"];
        for i in 0..40usize {
            let device = devices[i % devices.len()];
            let value = if device == "ZAP-6" { 900.0 } else { 980.0 };
            let reading = TelemetryReading::new(device, value, i as i64 * 1_000);
            runtime.submit(Delivery::new(i as u64, reading)).await.unwrap();
        }

        let report = runtime.shutdown().await;
        assert_eq!(report.committed_offset, 40);
        assert_eq!(report.outstanding, 0);
        assert_eq!(metrics.snapshot().readings_processed, 40);
        assert_eq!(store.saga_log().len(), 1);
        assert_eq!(commands.recv().await.unwrap().target_device, "ZAP-6");
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn reject_policy_fails_fast_when_lane_is_full() {
        let (deps, _store, _commands) = deps(1);
        let runtime = PartitionedRuntime::start(
            &settings(1, 1, BackpressurePolicy::Reject),
            deps,
            &[],
            CancellationToken::new(),
        );

        let mut rejected = 0;
        for offset in 0..200u64 {
            let reading = TelemetryReading::new("Rivne-3", 980.0, offset as i64 * 1_000);
            match runtime.submit(Delivery::new(offset, reading)).await {
                Ok(lane) => assert_eq!(lane, 0),
                Err(SubmitError::LaneFull { lane }) => {
                    assert_eq!(lane, 0);
                    rejected += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(rejected > 0);

        // rejected offsets were never acknowledged
        let report = runtime.shutdown().await;
        assert!(report.outstanding > 0);
        assert!(report.committed_offset < 200);
    }
}
