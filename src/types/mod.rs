//! Shared data structures for the telemetry aggregation and saga pipeline
//!
//! - Inbound: `TelemetryMessage` (wire) and `TelemetryReading` (decoded)
//! - Windowing: `WindowBucket` snapshots and `AggregateRow` persisted rows
//! - Saga: `SagaCommand` (outbound) and `SagaLogEntry` (append-only log)
//! - Delivery: `Delivery` envelope carrying the source offset for acks

mod aggregate;
mod saga;
mod telemetry;

pub use aggregate::*;
pub use saga::*;
pub use telemetry::*;
