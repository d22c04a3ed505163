//! Hopping-window state per device key.
//!
//! Windows are `[start, start + size)` with starts aligned to multiples of
//! `step` from the epoch, so a reading at `t` falls into `size / step`
//! overlapping buckets. Each key carries its own watermark (the highest event
//! time seen for that key); a bucket is retained until
//! `window_end + allowed_lateness <= watermark`, at which point it is evicted
//! and handed back to the caller as closed.
//!
//! The store is pure state. It is owned by exactly one lane, so it needs no
//! locking.

mod store;

pub use store::{ApplyOutcome, WindowStore};

use crate::types::EventTime;

/// Window geometry in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    size: EventTime,
    step: EventTime,
    allowed_lateness: EventTime,
}

/// Invalid window geometry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowSpecError {
    #[error("window step must be > 0 (got {0} ms)")]
    NonPositiveStep(EventTime),
    #[error("window size ({size} ms) must be a positive multiple of step ({step} ms)")]
    SizeNotMultipleOfStep { size: EventTime, step: EventTime },
    #[error("allowed lateness must be >= 0 (got {0} ms)")]
    NegativeLateness(EventTime),
}

impl WindowSpec {
    /// Hopping windows of `size` advancing by `step`. Lateness defaults to
    /// `size`, i.e. buckets live until `window_end + size`.
    pub fn new(size: EventTime, step: EventTime) -> Result<Self, WindowSpecError> {
        Self::with_lateness(size, step, size)
    }

    pub fn with_lateness(
        size: EventTime,
        step: EventTime,
        allowed_lateness: EventTime,
    ) -> Result<Self, WindowSpecError> {
        if step <= 0 {
            return Err(WindowSpecError::NonPositiveStep(step));
        }
        if size <= 0 || size % step != 0 {
            return Err(WindowSpecError::SizeNotMultipleOfStep { size, step });
        }
        if allowed_lateness < 0 {
            return Err(WindowSpecError::NegativeLateness(allowed_lateness));
        }
        Ok(Self {
            size,
            step,
            allowed_lateness,
        })
    }

    pub fn size(&self) -> EventTime {
        self.size
    }

    pub fn step(&self) -> EventTime {
        self.step
    }

    pub fn allowed_lateness(&self) -> EventTime {
        self.allowed_lateness
    }

    /// Start of the newest window containing `t`.
    pub fn latest_start(&self, t: EventTime) -> EventTime {
        t.div_euclid(self.step) * self.step
    }

    /// Starts of every window containing `t`, newest first.
    pub fn starts_containing(&self, t: EventTime) -> impl Iterator<Item = EventTime> {
        let newest = self.latest_start(t);
        let step = self.step;
        (0..self.size / self.step).map(move |k| newest - k * step)
    }

    /// End of the window starting at `start`, saturating at `EventTime::MAX`.
    pub fn window_end(&self, start: EventTime) -> EventTime {
        start.saturating_add(self.size)
    }

    /// Whether the window starting at `start` is past its eviction horizon
    /// for a key whose watermark is `watermark`. A horizon beyond
    /// `EventTime::MAX` is never reached.
    pub fn is_expired(&self, start: EventTime, watermark: EventTime) -> bool {
        start
            .checked_add(self.size)
            .and_then(|end| end.checked_add(self.allowed_lateness))
            .is_some_and(|horizon| horizon <= watermark)
    }

    /// Lowest window start still retained at `watermark`.
    pub fn first_retained_start(&self, watermark: EventTime) -> EventTime {
        watermark
            .saturating_sub(self.size)
            .saturating_sub(self.allowed_lateness)
            .saturating_add(1)
    }
}
