//! Per-key bucket arena with watermark-driven eviction.

use std::collections::{BTreeMap, HashMap};

use super::WindowSpec;
use crate::types::{EventTime, WindowBucket};

/// Live state of one bucket.
#[derive(Debug, Clone, Copy)]
struct BucketState {
    last_value: f64,
    sample_count: u64,
    last_event_time: EventTime,
}

impl BucketState {
    /// Same reading as the one that last touched this bucket (redelivery).
    fn is_repeat_of(&self, value: f64, event_time: EventTime) -> bool {
        self.sample_count > 0
            && self.last_event_time == event_time
            && self.last_value.to_bits() == value.to_bits()
    }
}

/// All retained buckets for one device.
#[derive(Debug, Default)]
struct KeyWindows {
    watermark: Option<EventTime>,
    buckets: BTreeMap<EventTime, BucketState>,
}

/// Result of applying one reading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutcome {
    /// Buckets touched by the reading, newest window first.
    pub updated: Vec<WindowBucket>,
    /// Buckets that crossed their eviction horizon because of this reading.
    pub closed: Vec<WindowBucket>,
    /// The reading was behind the horizon and was not merged.
    pub late: bool,
    /// The reading repeated the last update of every bucket it touched.
    pub duplicate: bool,
}

/// Hopping-window store for every key owned by one lane.
#[derive(Debug)]
pub struct WindowStore {
    spec: WindowSpec,
    keys: HashMap<String, KeyWindows>,
    late_drops: u64,
}

impl WindowStore {
    pub fn new(spec: WindowSpec) -> Self {
        Self {
            spec,
            keys: HashMap::new(),
            late_drops: 0,
        }
    }

    pub fn spec(&self) -> WindowSpec {
        self.spec
    }

    /// Merge one reading into every retained window containing `event_time`.
    ///
    /// Merge is last-write-wins: `last_value` is replaced and `sample_count`
    /// incremented, except when the reading is an exact repeat of the one
    /// that last updated the bucket. Readings behind the horizon are dropped
    /// and counted, never merged.
    pub fn apply(&mut self, device_id: &str, value: f64, event_time: EventTime) -> ApplyOutcome {
        let spec = self.spec;
        let windows = self.keys.entry(device_id.to_owned()).or_default();

        if let Some(watermark) = windows.watermark {
            if spec.is_expired(spec.latest_start(event_time), watermark) {
                self.late_drops += 1;
                tracing::debug!(
                    device_id,
                    event_time,
                    watermark,
                    "Dropping reading behind window horizon"
                );
                return ApplyOutcome {
                    late: true,
                    ..ApplyOutcome::default()
                };
            }
        }

        let mut outcome = ApplyOutcome {
            duplicate: true,
            ..ApplyOutcome::default()
        };

        for start in spec.starts_containing(event_time) {
            if windows
                .watermark
                .is_some_and(|watermark| spec.is_expired(start, watermark))
            {
                continue;
            }
            let bucket = windows.buckets.entry(start).or_insert(BucketState {
                last_value: value,
                sample_count: 0,
                last_event_time: event_time,
            });
            if !bucket.is_repeat_of(value, event_time) {
                bucket.last_value = value;
                bucket.last_event_time = event_time;
                bucket.sample_count += 1;
                outcome.duplicate = false;
            }
            outcome
                .updated
                .push(snapshot(device_id, spec, start, bucket));
        }

        let watermark = windows
            .watermark
            .map_or(event_time, |w| w.max(event_time));
        windows.watermark = Some(watermark);

        // Everything at or below this start is past the horizon.
        let first_retained = spec.first_retained_start(watermark);
        let retained = windows.buckets.split_off(&first_retained);
        let expired = std::mem::replace(&mut windows.buckets, retained);
        outcome.closed = expired
            .iter()
            .map(|(start, bucket)| snapshot(device_id, spec, *start, bucket))
            .collect();

        outcome
    }

    /// Buckets still ahead of the key's watermark (`window_end > watermark`).
    pub fn open_bucket_count(&self, device_id: &str) -> usize {
        self.keys.get(device_id).map_or(0, |windows| {
            let Some(watermark) = windows.watermark else {
                return 0;
            };
            windows
                .buckets
                .keys()
                .filter(|start| self.spec.window_end(**start) > watermark)
                .count()
        })
    }

    /// Buckets retained for late updates, open or not.
    pub fn retained_bucket_count(&self, device_id: &str) -> usize {
        self.keys.get(device_id).map_or(0, |w| w.buckets.len())
    }

    pub fn watermark(&self, device_id: &str) -> Option<EventTime> {
        self.keys.get(device_id).and_then(|w| w.watermark)
    }

    /// Snapshot of one retained bucket.
    pub fn bucket(&self, device_id: &str, window_start: EventTime) -> Option<WindowBucket> {
        self.keys
            .get(device_id)
            .and_then(|w| w.buckets.get(&window_start))
            .map(|bucket| snapshot(device_id, self.spec, window_start, bucket))
    }

    pub fn late_drops(&self) -> u64 {
        self.late_drops
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Remove and return every retained bucket. Watermarks are kept.
    pub fn drain(&mut self) -> Vec<WindowBucket> {
        let spec = self.spec;
        let mut drained = Vec::new();
        for (device_id, windows) in &mut self.keys {
            let buckets = std::mem::take(&mut windows.buckets);
            drained.extend(
                buckets
                    .iter()
                    .map(|(start, bucket)| snapshot(device_id, spec, *start, bucket)),
            );
        }
        drained
    }
}

fn snapshot(
    device_id: &str,
    spec: WindowSpec,
    start: EventTime,
    bucket: &BucketState,
) -> WindowBucket {
    WindowBucket {
        device_id: device_id.to_owned(),
        window_start: start,
        window_end: spec.window_end(start),
        last_value: bucket.last_value,
        sample_count: bucket.sample_count,
    }
}
