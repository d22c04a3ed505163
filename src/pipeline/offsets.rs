//! Offset tracking and periodic commits.
//!
//! Offsets are registered when a delivery is submitted and acknowledged when
//! its lane has finished with it. The commit position is the lowest offset
//! still outstanding, so a crash replays everything not yet acknowledged.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::metrics::EngineMetrics;
use crate::storage::OffsetStore;

/// Outstanding offsets of one source.
#[derive(Debug, Clone)]
pub struct OffsetTracker {
    pending: BTreeSet<u64>,
    next_unseen: u64,
}

impl OffsetTracker {
    /// Start tracking at `start`, the first offset this run will see.
    pub fn new(start: u64) -> Self {
        Self {
            pending: BTreeSet::new(),
            next_unseen: start,
        }
    }

    pub fn begin(&mut self, offset: u64) {
        self.pending.insert(offset);
        self.next_unseen = self.next_unseen.max(offset.saturating_add(1));
    }

    pub fn ack(&mut self, offset: u64) {
        self.pending.remove(&offset);
    }

    /// Next offset a restarted consumer should read.
    pub fn commit_position(&self) -> u64 {
        self.pending.first().copied().unwrap_or(self.next_unseen)
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

/// Shared handle used by `submit`, the lanes and the commit task.
#[derive(Clone)]
pub struct OffsetCommitter {
    source: String,
    tracker: Arc<Mutex<OffsetTracker>>,
    store: Option<Arc<dyn OffsetStore>>,
    metrics: Arc<EngineMetrics>,
}

impl OffsetCommitter {
    pub fn new(
        source: impl Into<String>,
        start: u64,
        store: Option<Arc<dyn OffsetStore>>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        metrics.set_committed_offset(start);
        Self {
            source: source.into(),
            tracker: Arc::new(Mutex::new(OffsetTracker::new(start))),
            store,
            metrics,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn begin(&self, offset: u64) {
        self.with_tracker(|t| t.begin(offset));
    }

    pub fn ack(&self, offset: u64) {
        self.with_tracker(|t| t.ack(offset));
    }

    pub fn commit_position(&self) -> u64 {
        self.with_tracker(|t| t.commit_position())
    }

    pub fn outstanding(&self) -> usize {
        self.with_tracker(|t| t.outstanding())
    }

    fn with_tracker<R>(&self, f: impl FnOnce(&mut OffsetTracker) -> R) -> R {
        // a poisoned tracker is still consistent: every update is one call
        let mut guard = self
            .tracker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    /// Persist the current commit position. Failures are logged only; the
    /// next commit retries.
    pub fn commit_now(&self) -> u64 {
        let position = self.commit_position();
        if let Some(store) = &self.store {
            match store.commit_offset(&self.source, position) {
                Ok(()) => self.metrics.set_committed_offset(position),
                Err(e) => tracing::warn!(source = %self.source, position, error = %e, "Offset commit failed"),
            }
        } else {
            self.metrics.set_committed_offset(position);
        }
        position
    }

    /// Commit every `interval` until cancelled.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = None;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let position = self.commit_position();
                    if last != Some(position) {
                        self.commit_now();
                        last = Some(position);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    #[test]
    fn commit_position_waits_for_lowest_outstanding() {
        let mut tracker = OffsetTracker::new(10);
        assert_eq!(tracker.commit_position(), 10);
        for offset in 10..15 {
            tracker.begin(offset);
        }
        tracker.ack(11);
        tracker.ack(12);
        assert_eq!(tracker.commit_position(), 10);
        tracker.ack(10);
        assert_eq!(tracker.commit_position(), 13);
        tracker.ack(13);
        tracker.ack(14);
        assert_eq!(tracker.commit_position(), 15);
    }

    #[test]
    fn unacknowledged_offset_blocks_commit() {
        let mut tracker = OffsetTracker::new(0);
        tracker.begin(0);
        tracker.begin(1);
        tracker.ack(1);
        assert_eq!(tracker.commit_position(), 0);
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn commit_now_persists_position() {
        let store = Arc::new(InMemoryStore::new());
        let metrics = Arc::new(EngineMetrics::new(1));
        let committer = OffsetCommitter::new("stdin", 0, Some(store.clone()), metrics.clone());
        committer.begin(0);
        committer.begin(1);
        committer.ack(0);

        assert_eq!(committer.commit_now(), 1);
        assert_eq!(store.load_offset("stdin").unwrap(), Some(1));
        assert_eq!(metrics.snapshot().committed_offset, 1);
    }
}
