//! Saga Episode Tests
//!
//! Runs readings through a single `LanePipeline` with an in-memory store and
//! a channel publisher, and checks that each violation episode yields exactly
//! one command and one STARTED row.

use std::sync::Arc;
use std::time::Duration;

use reactor_saga::config::AggregateWritePolicy;
use reactor_saga::metrics::EngineMetrics;
use reactor_saga::pipeline::LanePipeline;
use reactor_saga::saga::{ChannelPublisher, EpisodeState};
use reactor_saga::storage::InMemoryStore;
use reactor_saga::types::{EventTime, SagaAction, SagaCommand, SagaLogEntry, STARTED_STEP};
use reactor_saga::{
    BandRegistry, DeviceBand, SagaInitiator, SinkAdapter, TelemetryReading, WindowSpec,
    WindowStore,
};
use tokio::sync::mpsc;

const COOLDOWN: EventTime = 300_000;

struct Harness {
    lane: LanePipeline,
    store: Arc<InMemoryStore>,
    commands: mpsc::Receiver<SagaCommand>,
    metrics: Arc<EngineMetrics>,
}

fn harness() -> Harness {
    let metrics = Arc::new(EngineMetrics::new(1));
    let store = Arc::new(InMemoryStore::new());
    let (publisher, commands) = ChannelPublisher::new(1_024);
    let bands = BandRegistry::new(DeviceBand::new("vver-1000", 980.0, 0.05))
        .with_class(DeviceBand::new("vver-440", 440.0, 0.05), ["Kola-"]);
    let lane = LanePipeline::new(
        0,
        WindowStore::new(WindowSpec::new(300_000, 60_000).unwrap()),
        Arc::new(bands),
        SagaInitiator::new(COOLDOWN, Arc::new(publisher)),
        SinkAdapter::new(store.clone(), Duration::from_secs(1), metrics.clone()),
        AggregateWritePolicy::EveryUpdate,
        metrics.clone(),
    );
    Harness {
        lane,
        store,
        commands,
        metrics,
    }
}

fn drain(rx: &mut mpsc::Receiver<SagaCommand>) -> Vec<SagaCommand> {
    let mut out = Vec::new();
    while let Ok(command) = rx.try_recv() {
        out.push(command);
    }
    out
}

#[tokio::test]
async fn sustained_violation_starts_one_saga() {
    let mut h = harness();
    for i in 0..100 {
        let reading = TelemetryReading::new("ZAP-6", 900.0, i * 1_000);
        h.lane.process(&reading).await.unwrap();
    }

    let commands = drain(&mut h.commands);
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command_id, "ZAP-6-0");
    assert_eq!(commands[0].target_device, "ZAP-6");
    assert!((commands[0].requested_value - 980.0).abs() < f64::EPSILON);
    assert!(!commands[0].compensation_needed);

    let log = h.store.saga_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action_type, SagaAction::Started);
    assert_eq!(log[0].step_number, STARTED_STEP);
    assert_eq!(log[0].saga_id, commands[0].command_id);

    let snap = h.metrics.snapshot();
    assert_eq!(snap.commands_emitted, 1);
    assert_eq!(snap.commands_suppressed, 99);
    assert_eq!(snap.violations, 100);

    // aggregates are persisted during the episode too
    assert!(!h.store.aggregates().is_empty());
}

#[tokio::test]
async fn redelivered_trigger_does_not_emit_twice() {
    let mut h = harness();
    let trigger = TelemetryReading::new("Rivne-3", 920.0, 5_000);

    let first = h.lane.process(&trigger).await.unwrap();
    assert!(first.started.is_some());
    let again = h.lane.process(&trigger).await.unwrap();
    assert!(again.started.is_none());
    assert!(again.suppressed);

    assert_eq!(drain(&mut h.commands).len(), 1);
    assert_eq!(h.store.saga_log().len(), 1);
    // the repeat is not a second sample either
    let bucket = h.lane.windows().bucket("Rivne-3", 0).unwrap();
    assert_eq!(bucket.sample_count, 1);
}

#[tokio::test]
async fn return_to_band_ends_the_episode() {
    let mut h = harness();
    for (value, t) in [(900.0, 0), (980.0, 10_000), (900.0, 20_000)] {
        h.lane
            .process(&TelemetryReading::new("ZAP-6", value, t))
            .await
            .unwrap();
    }

    let ids: Vec<_> = drain(&mut h.commands)
        .into_iter()
        .map(|c| c.command_id)
        .collect();
    assert_eq!(ids, vec!["ZAP-6-0", "ZAP-6-20000"]);
    assert_eq!(h.store.saga_log().len(), 2);
}

#[tokio::test]
async fn continuous_violation_restarts_after_cooldown() {
    let mut h = harness();
    for t in [0, COOLDOWN - 1, COOLDOWN] {
        h.lane
            .process(&TelemetryReading::new("ZAP-5", 900.0, t))
            .await
            .unwrap();
    }

    let ids: Vec<_> = drain(&mut h.commands)
        .into_iter()
        .map(|c| c.command_id)
        .collect();
    assert_eq!(ids, vec!["ZAP-5-0".to_string(), format!("ZAP-5-{COOLDOWN}")]);
}

#[tokio::test]
async fn boundary_value_is_not_a_violation() {
    let mut h = harness();
    // exactly nominal * (1 - tolerance)
    let outcome = h
        .lane
        .process(&TelemetryReading::new("Rivne-4", 931.0, 0))
        .await
        .unwrap();
    assert!(!outcome.violation);
    assert!(drain(&mut h.commands).is_empty());
}

#[tokio::test]
async fn device_class_prefix_selects_the_band() {
    let mut h = harness();
    // far below the default band but inside the 440 MW class
    let outcome = h
        .lane
        .process(&TelemetryReading::new("Kola-3", 430.0, 0))
        .await
        .unwrap();
    assert!(!outcome.violation);

    let outcome = h
        .lane
        .process(&TelemetryReading::new("Kola-3", 400.0, 1_000))
        .await
        .unwrap();
    assert!(outcome.violation);
    let command = outcome.started.unwrap();
    assert!((command.requested_value - 440.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn late_reading_does_not_start_a_saga() {
    let mut h = harness();
    h.lane
        .process(&TelemetryReading::new("ZAP-6", 980.0, 10_000_000))
        .await
        .unwrap();
    let outcome = h
        .lane
        .process(&TelemetryReading::new("ZAP-6", 100.0, 0))
        .await
        .unwrap();
    assert!(outcome.late);
    assert!(drain(&mut h.commands).is_empty());
    assert_eq!(h.metrics.snapshot().late_drops, 1);
}

#[tokio::test]
async fn restored_saga_suppresses_until_cooldown_ends() {
    let mut h = harness();
    let entry = SagaLogEntry {
        saga_id: "ZAP-6-0".to_string(),
        timestamp: 0,
        step_number: STARTED_STEP,
        action_type: SagaAction::Started,
        device_id: "ZAP-6".to_string(),
        details: String::new(),
    };
    h.lane.restore_sagas([&entry]);
    assert!(matches!(
        h.lane.initiator().state("ZAP-6"),
        EpisodeState::Cooldown { until: COOLDOWN, .. }
    ));

    let suppressed = h
        .lane
        .process(&TelemetryReading::new("ZAP-6", 900.0, 60_000))
        .await
        .unwrap();
    assert!(suppressed.suppressed);

    let started = h
        .lane
        .process(&TelemetryReading::new("ZAP-6", 900.0, COOLDOWN))
        .await
        .unwrap();
    assert!(started.started.is_some());
    assert_eq!(drain(&mut h.commands).len(), 1);
}
