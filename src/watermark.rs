//! Event-time watermark tracking for one worker.
//!
//! Two inputs move the watermark forward:
//! - explicit watermark records from the Event Source, taken as-is
//! - observed event times, minus the bounded out-of-orderness
//!
//! The watermark never regresses.

use chrono::{DateTime, Duration, Utc};

/// Per-worker watermark state.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    max_out_of_orderness: Duration,
    current: Option<DateTime<Utc>>,
    max_event_time: Option<DateTime<Utc>>,
}

impl WatermarkTracker {
    pub fn new(max_out_of_orderness: Duration) -> Self {
        Self {
            max_out_of_orderness,
            current: None,
            max_event_time: None,
        }
    }

    /// Resume from a checkpointed watermark.
    pub fn resume(max_out_of_orderness: Duration, current: Option<DateTime<Utc>>) -> Self {
        Self {
            current,
            ..Self::new(max_out_of_orderness)
        }
    }

    /// Record an event time. Returns the new watermark if it advanced.
    pub fn observe_event(&mut self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.max_event_time.is_some_and(|max| max >= time) {
            return None;
        }
        self.max_event_time = Some(time);
        self.advance(time - self.max_out_of_orderness)
    }

    /// Record an explicit watermark. Returns the new watermark if it advanced.
    pub fn observe_watermark(&mut self, watermark: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.advance(watermark)
    }

    pub fn current(&self) -> Option<DateTime<Utc>> {
        self.current
    }

    fn advance(&mut self, candidate: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.current.is_some_and(|current| current >= candidate) {
            return None;
        }
        self.current = Some(candidate);
        self.current
    }
}

impl Default for WatermarkTracker {
    fn default() -> Self {
        Self::new(Duration::seconds(10))
    }
}
