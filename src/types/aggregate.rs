//! Window bucket snapshots and the persisted aggregate row.

use super::EventTime;
use serde::{Deserialize, Serialize};

/// Snapshot of one hopping-window bucket for a device.
///
/// The window store owns the live state; these are copies handed to the
/// sink and to callers inspecting an `apply` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowBucket {
    pub device_id: String,
    pub window_start: EventTime,
    pub window_end: EventTime,
    pub last_value: f64,
    pub sample_count: u64,
}

impl WindowBucket {
    /// Row shape written to the `load_following_aggregates` table.
    pub fn to_row(&self) -> AggregateRow {
        AggregateRow {
            device_id: self.device_id.clone(),
            window_end: self.window_end,
            last_value: self.last_value,
            window_start: self.window_start,
            sample_count: self.sample_count,
        }
    }
}

/// Persisted aggregate: `(device_id, window_end, last_value, window_start)`.
///
/// Identity is `(device_id, window_end)`; re-appending the same identity
/// overwrites the previous row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub device_id: String,
    pub window_end: EventTime,
    pub last_value: f64,
    pub window_start: EventTime,
    #[serde(default)]
    pub sample_count: u64,
}
