//! Restart Integration Tests
//!
//! Replays a telemetry file through the ingest loop into a sled keyspace,
//! stops, reopens the keyspace and checks that committed offsets and saga
//! cooldowns carry over to the next run.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reactor_saga::config::{AggregateWritePolicy, BackpressurePolicy};
use reactor_saga::metrics::EngineMetrics;
use reactor_saga::pipeline::{
    IngestEnd, IngestLoop, OffsetCommitter, PartitionedRuntime, ReplaySource, RuntimeDeps,
    RuntimeReport, RuntimeSettings,
};
use reactor_saga::saga::ChannelPublisher;
use reactor_saga::storage::{OffsetStore, SinkError};
use reactor_saga::types::{SagaCommand, TelemetryReading};
use reactor_saga::{BandRegistry, DeviceBand, DurableStore, SinkAdapter, SledStore, WindowSpec};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn settings() -> RuntimeSettings {
    RuntimeSettings {
        partition_count: 3,
        lane_queue_capacity: 16,
        backpressure: BackpressurePolicy::Block,
        max_delivery_attempts: 3,
        retry_backoff: Duration::from_millis(1),
        window: WindowSpec::new(300_000, 60_000).unwrap(),
        cooldown: 300_000,
        write_policy: AggregateWritePolicy::EveryUpdate,
    }
}

fn write_telemetry(path: &Path, readings: &[(&str, f64, i64)]) {
    let lines: Vec<String> = readings
        .iter()
        .map(|(device, value, t)| {
            serde_json::to_string(&TelemetryReading::new(*device, *value, *t).to_message()).unwrap()
        })
        .collect();
    std::fs::write(path, lines.join("\n") + "\n").unwrap();
}

/// One engine run over `input`, resuming from the keyspace's committed offset.
async fn run_once(
    keyspace: &Path,
    input: &Path,
) -> (RuntimeReport, Vec<SagaCommand>, Arc<SledStore>) {
    let store = Arc::new(SledStore::open(keyspace, false).unwrap());
    let metrics = Arc::new(EngineMetrics::new(3));
    let source_name = ReplaySource::name_for(input);
    let start = store.load_offset(&source_name).unwrap().unwrap_or(0);
    let restored = store.started_sagas().await.unwrap();

    let (publisher, mut rx) = ChannelPublisher::new(1_024);
    let deps = RuntimeDeps {
        bands: Arc::new(BandRegistry::new(DeviceBand::new("vver-1000", 980.0, 0.05))),
        publisher: Arc::new(publisher),
        sink: SinkAdapter::new(store.clone(), Duration::from_secs(2), metrics.clone()),
        offsets: OffsetCommitter::new(source_name, start, Some(store.clone()), metrics.clone()),
        metrics: metrics.clone(),
    };

    let cancel = CancellationToken::new();
    let runtime = PartitionedRuntime::start(&settings(), deps, &restored, cancel.clone());
    let mut source = ReplaySource::open(input, start, metrics.clone()).await.unwrap();
    let ingest = IngestLoop::new(runtime, metrics, cancel);
    let stats = ingest.run(&mut source).await;
    assert_eq!(stats.end, IngestEnd::SourceExhausted);
    let report = ingest.into_runtime().shutdown().await;

    let mut commands = Vec::new();
    while let Ok(command) = rx.try_recv() {
        commands.push(command);
    }
    (report, commands, store)
}

#[test]
fn opening_without_schema_is_fatal() {
    let dir = TempDir::new().unwrap();
    let result = SledStore::open(dir.path().join("energy_monitoring"), false);
    assert!(matches!(result, Err(SinkError::SchemaNotFound(_))));
}

#[tokio::test]
async fn restart_resumes_offsets_and_cooldowns() {
    let dir = TempDir::new().unwrap();
    let keyspace = dir.path().join("energy_monitoring");
    SledStore::init_schema(&keyspace).unwrap();

    let input = dir.path().join("telemetry.jsonl");
    write_telemetry(
        &input,
        &[
            ("Rivne-3", 979.0, 0),
            ("ZAP-6", 905.0, 0),
            ("Rivne-3", 981.0, 10_000),
            ("ZAP-6", 902.0, 10_000),
        ],
    );

    let (report, commands, store) = run_once(&keyspace, &input).await;
    assert_eq!(report.committed_offset, 4);
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command_id, "ZAP-6-0");
    assert_eq!(store.saga_log_count(), 1);
    assert_eq!(store.aggregates_for("Rivne-3").unwrap().len(), 5);
    drop(store);

    // same file again: everything is below the committed offset
    let (report, commands, store) = run_once(&keyspace, &input).await;
    assert_eq!(report.committed_offset, 4);
    assert!(commands.is_empty());
    drop(store);

    // new data for the same episode stays inside the restored cooldown
    let more = dir.path().join("telemetry-2.jsonl");
    write_telemetry(&more, &[("ZAP-6", 900.0, 60_000), ("ZAP-6", 899.0, 120_000)]);
    let (report, commands, store) = run_once(&keyspace, &more).await;
    assert_eq!(report.committed_offset, 2);
    assert!(commands.is_empty(), "{commands:?}");
    assert_eq!(store.saga_log_count(), 1);
}
