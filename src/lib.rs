//! Reactor Saga: windowed telemetry aggregation and deviation-triggered sagas
//!
//! Consumes per-device power readings, keeps hopping-window aggregates per
//! device, and starts one load-following saga per deviation episode.
//!
//! ## Architecture
//!
//! - **Window Store / Aggregator**: per-key hopping windows with a watermark
//! - **Deviation Detector**: nominal bands per device class
//! - **Saga Initiator**: per-device episode state, command emission, STARTED row
//! - **Sink Adapter**: best-effort, timeout-bounded writes to the durable store
//! - **Partitioned Runtime**: key-routed lanes with bounded queues and offset acks

pub mod api;
pub mod config;
pub mod detection;
pub mod metrics;
pub mod pipeline;
pub mod saga;
pub mod storage;
pub mod transport;
pub mod types;
pub mod window;

// Re-export configuration
pub use config::EngineConfig;

// Re-export commonly used types
pub use types::{
    AggregateRow, Delivery, EventTime, SagaAction, SagaCommand, SagaLogEntry, TelemetryMessage,
    TelemetryReading, WindowBucket,
};

// Re-export the engine building blocks
pub use detection::{BandRegistry, DeviceBand};
pub use metrics::EngineMetrics;
pub use pipeline::{PartitionedRuntime, RuntimeDeps, RuntimeSettings};
pub use saga::{CommandPublisher, SagaInitiator};
pub use storage::{DurableStore, SinkAdapter, SledStore};
pub use window::{WindowSpec, WindowStore};
