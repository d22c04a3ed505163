//! Best-effort sink in front of the durable store.
//!
//! Every write is bounded by the configured timeout. Failures and timeouts
//! are logged and counted, then swallowed: persistence is a side channel and
//! must never stall or fail a lane. Retrying is left to redelivery.

use std::sync::Arc;
use std::time::Duration;

use super::persistence::{DurableStore, SinkError};
use crate::metrics::EngineMetrics;
use crate::types::{SagaLogEntry, WindowBucket};

/// What happened to one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    Failed,
    TimedOut,
}

/// Shared, cloneable handle used by every lane.
#[derive(Clone)]
pub struct SinkAdapter {
    store: Arc<dyn DurableStore>,
    write_timeout: Duration,
    metrics: Arc<EngineMetrics>,
}

impl SinkAdapter {
    pub fn new(
        store: Arc<dyn DurableStore>,
        write_timeout: Duration,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            write_timeout,
            metrics,
        }
    }

    pub async fn write_aggregate(&self, bucket: &WindowBucket) -> WriteStatus {
        let row = bucket.to_row();
        let status = self
            .bounded(self.store.append_aggregate(&row))
            .await;
        if let Err(ref e) = status {
            tracing::warn!(
                device_id = %row.device_id,
                window_end = row.window_end,
                backend = self.store.backend_name(),
                error = %e,
                "Aggregate write failed"
            );
        }
        self.record(status)
    }

    pub async fn write_saga_log(&self, entry: &SagaLogEntry) -> WriteStatus {
        let status = self.bounded(self.store.append_saga_log(entry)).await;
        if let Err(ref e) = status {
            tracing::warn!(
                saga_id = %entry.saga_id,
                step_number = entry.step_number,
                backend = self.store.backend_name(),
                error = %e,
                "Saga log write failed"
            );
        }
        self.record(status)
    }

    /// Flush the store; used at shutdown. Errors are logged only.
    pub async fn flush(&self) {
        if let Err(e) = self.bounded(self.store.flush()).await {
            tracing::warn!(backend = self.store.backend_name(), error = %e, "Sink flush failed");
        }
    }

    async fn bounded<F>(&self, write: F) -> Result<(), SinkError>
    where
        F: std::future::Future<Output = Result<(), SinkError>>,
    {
        tokio::time::timeout(self.write_timeout, write)
            .await
            .map_err(|_| SinkError::Timeout(self.write_timeout))?
    }

    fn record(&self, status: Result<(), SinkError>) -> WriteStatus {
        match status {
            Ok(()) => {
                self.metrics.record_sink_write();
                WriteStatus::Written
            }
            Err(SinkError::Timeout(_)) => {
                self.metrics.record_sink_timeout();
                WriteStatus::TimedOut
            }
            Err(_) => {
                self.metrics.record_sink_failure();
                WriteStatus::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::types::{AggregateRow, EventTime};
    use async_trait::async_trait;

    struct StalledStore;

    #[async_trait]
    impl DurableStore for StalledStore {
        async fn append_aggregate(&self, _row: &AggregateRow) -> Result<(), SinkError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(())
        }
        async fn append_saga_log(&self, _entry: &SagaLogEntry) -> Result<(), SinkError> {
            Err(SinkError::Storage("keyspace unavailable".into()))
        }
        async fn started_sagas(&self) -> Result<Vec<SagaLogEntry>, SinkError> {
            Ok(Vec::new())
        }
        async fn flush(&self) -> Result<(), SinkError> {
            Ok(())
        }
        fn backend_name(&self) -> &'static str {
            "stalled"
        }
    }

    fn bucket(start: EventTime) -> WindowBucket {
        WindowBucket {
            device_id: "Rivne-4".to_string(),
            window_start: start,
            window_end: start + 300_000,
            last_value: 978.0,
            sample_count: 1,
        }
    }

    #[tokio::test]
    async fn successful_write_is_counted() {
        let metrics = Arc::new(EngineMetrics::new(1));
        let store = Arc::new(InMemoryStore::new());
        let sink = SinkAdapter::new(store.clone(), Duration::from_secs(1), metrics.clone());

        assert_eq!(sink.write_aggregate(&bucket(0)).await, WriteStatus::Written);
        assert_eq!(store.aggregates().len(), 1);
        assert_eq!(metrics.snapshot().sink_writes, 1);
    }

    #[tokio::test]
    async fn slow_and_failing_writes_are_swallowed() {
        let metrics = Arc::new(EngineMetrics::new(1));
        let sink = SinkAdapter::new(
            Arc::new(StalledStore),
            Duration::from_millis(20),
            metrics.clone(),
        );

        assert_eq!(sink.write_aggregate(&bucket(0)).await, WriteStatus::TimedOut);
        let entry = SagaLogEntry {
            saga_id: "Rivne-4-1".to_string(),
            timestamp: 1,
            step_number: 1,
            action_type: crate::types::SagaAction::Started,
            device_id: "Rivne-4".to_string(),
            details: String::new(),
        };
        assert_eq!(sink.write_saga_log(&entry).await, WriteStatus::Failed);

        let snap = metrics.snapshot();
        assert_eq!(snap.sink_timeouts, 1);
        assert_eq!(snap.sink_failures, 1);
    }
}
