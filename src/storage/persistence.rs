//! DurableStore trait - pluggable backend for aggregates and the saga log
//!
//! - `SledStore`: embedded keyspace, durable across restarts
//! - `InMemoryStore`: tests and minimal deployments
//!
//! Writes are upserts keyed by row identity, so appending the same row twice
//! leaves one row behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{AggregateRow, EventTime, SagaAction, SagaLogEntry};

/// Backend for persisted rows.
///
/// Implementations must be `Send + Sync`; one handle is shared by all lanes.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Upsert an aggregate row keyed by `(device_id, window_end)`.
    async fn append_aggregate(&self, row: &AggregateRow) -> Result<(), SinkError>;

    /// Upsert a saga log row keyed by `(saga_id, step_number)`.
    async fn append_saga_log(&self, entry: &SagaLogEntry) -> Result<(), SinkError>;

    /// Every STARTED row, oldest first. Used to restore cooldowns.
    async fn started_sagas(&self) -> Result<Vec<SagaLogEntry>, SinkError>;

    /// Make previous writes durable.
    async fn flush(&self) -> Result<(), SinkError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// Committed consumer positions, one per source name.
pub trait OffsetStore: Send + Sync {
    /// Next offset to consume, if one was ever committed.
    fn load_offset(&self, source: &str) -> Result<Option<u64>, SinkError>;

    fn commit_offset(&self, source: &str, next_offset: u64) -> Result<(), SinkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("schema not found in keyspace {0}; run `init-schema` or set sink.create_schema")]
    SchemaNotFound(String),

    #[error("schema version {found} in keyspace {path} does not match expected {expected}")]
    SchemaMismatch {
        path: String,
        found: u32,
        expected: u32,
    },

    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    #[error("blocking write task failed: {0}")]
    Task(String),
}

impl From<sled::Error> for SinkError {
    fn from(err: sled::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SinkError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-memory store. Thread-safe via `RwLock`; not durable.
#[derive(Default)]
pub struct InMemoryStore {
    aggregates: RwLock<BTreeMap<(String, EventTime), AggregateRow>>,
    saga_log: RwLock<BTreeMap<(String, u32), SagaLogEntry>>,
    offsets: RwLock<HashMap<String, u64>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All aggregate rows ordered by device then window end.
    pub fn aggregates(&self) -> Vec<AggregateRow> {
        self.aggregates
            .read()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// All saga log rows ordered by saga id then step.
    pub fn saga_log(&self) -> Vec<SagaLogEntry> {
        self.saga_log
            .read()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn lock_error<T>(err: &std::sync::PoisonError<T>) -> SinkError {
    SinkError::Storage(err.to_string())
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn append_aggregate(&self, row: &AggregateRow) -> Result<(), SinkError> {
        let mut rows = self.aggregates.write().map_err(|e| lock_error(&e))?;
        rows.insert((row.device_id.clone(), row.window_end), row.clone());
        Ok(())
    }

    async fn append_saga_log(&self, entry: &SagaLogEntry) -> Result<(), SinkError> {
        let mut rows = self.saga_log.write().map_err(|e| lock_error(&e))?;
        rows.insert((entry.saga_id.clone(), entry.step_number), entry.clone());
        Ok(())
    }

    async fn started_sagas(&self) -> Result<Vec<SagaLogEntry>, SinkError> {
        let rows = self.saga_log.read().map_err(|e| lock_error(&e))?;
        let mut started: Vec<_> = rows
            .values()
            .filter(|e| e.action_type == SagaAction::Started)
            .cloned()
            .collect();
        started.sort_by_key(|e| e.timestamp);
        Ok(started)
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}

impl OffsetStore for InMemoryStore {
    fn load_offset(&self, source: &str) -> Result<Option<u64>, SinkError> {
        let offsets = self.offsets.read().map_err(|e| lock_error(&e))?;
        Ok(offsets.get(source).copied())
    }

    fn commit_offset(&self, source: &str, next_offset: u64) -> Result<(), SinkError> {
        let mut offsets = self.offsets.write().map_err(|e| lock_error(&e))?;
        offsets.insert(source.to_string(), next_offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::STARTED_STEP;

    fn row(device: &str, end: EventTime, value: f64) -> AggregateRow {
        AggregateRow {
            device_id: device.to_string(),
            window_end: end,
            last_value: value,
            window_start: end - 300_000,
            sample_count: 1,
        }
    }

    fn started(saga_id: &str, ts: EventTime) -> SagaLogEntry {
        SagaLogEntry {
            saga_id: saga_id.to_string(),
            timestamp: ts,
            step_number: STARTED_STEP,
            action_type: SagaAction::Started,
            device_id: "Rivne-3".to_string(),
            details: String::new(),
        }
    }

    #[tokio::test]
    async fn aggregate_upsert_keeps_one_row_per_identity() {
        let store = InMemoryStore::new();
        store.append_aggregate(&row("Rivne-3", 300_000, 975.0)).await.unwrap();
        store.append_aggregate(&row("Rivne-3", 300_000, 931.0)).await.unwrap();
        store.append_aggregate(&row("Rivne-3", 360_000, 931.0)).await.unwrap();

        let rows = store.aggregates();
        assert_eq!(rows.len(), 2);
        assert!((rows[0].last_value - 931.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn saga_log_is_idempotent_and_ordered() {
        let store = InMemoryStore::new();
        store.append_saga_log(&started("Rivne-3-2000", 2_000)).await.unwrap();
        store.append_saga_log(&started("Rivne-3-1000", 1_000)).await.unwrap();
        store.append_saga_log(&started("Rivne-3-1000", 1_000)).await.unwrap();

        let started = store.started_sagas().await.unwrap();
        assert_eq!(started.len(), 2);
        assert_eq!(started[0].timestamp, 1_000);
    }

    #[test]
    fn offsets_round_trip_per_source() {
        let store = InMemoryStore::new();
        assert_eq!(store.load_offset("stdin").unwrap(), None);
        store.commit_offset("stdin", 42).unwrap();
        store.commit_offset("replay", 7).unwrap();
        assert_eq!(store.load_offset("stdin").unwrap(), Some(42));
        assert_eq!(store.load_offset("replay").unwrap(), Some(7));
    }
}
