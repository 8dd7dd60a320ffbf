//! Engine counters, shared by all workers and the HTTP server.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::buffer::{DropReason, DroppedEvent};
use crate::processor::ProcessOutcome;
use crate::replica::ApplyOutcome;

/// Lock-free counters. Shared through an `Arc`.
#[derive(Debug)]
pub struct EngineMetrics {
    started: Instant,
    pub events: AtomicU64,
    pub watermarks: AtomicU64,
    pub updates_applied: AtomicU64,
    pub updates_ignored: AtomicU64,
    pub emitted: AtomicU64,
    pub unmatched: AtomicU64,
    pub buffered: AtomicU64,
    pub drained: AtomicU64,
    pub dropped_expired: AtomicU64,
    pub dropped_overflow: AtomicU64,
    pub decode_errors: AtomicU64,
    pub checkpoints: AtomicU64,
    pub restarts: AtomicU64,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            events: AtomicU64::new(0),
            watermarks: AtomicU64::new(0),
            updates_applied: AtomicU64::new(0),
            updates_ignored: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            drained: AtomicU64::new(0),
            dropped_expired: AtomicU64::new(0),
            dropped_overflow: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }
}

fn bump(counter: &AtomicU64, by: usize) {
    if by > 0 {
        counter.fetch_add(by as u64, Ordering::Relaxed);
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for the outputs, buffering and drops of one processor command.
    pub fn record(&self, outcome: &ProcessOutcome) {
        bump(&self.emitted, outcome.emitted.len());
        bump(
            &self.unmatched,
            outcome.emitted.iter().filter(|e| e.is_unmatched()).count(),
        );
        bump(&self.buffered, outcome.buffered);
        bump(&self.drained, outcome.drained);
        self.record_dropped(&outcome.dropped);
    }

    /// Count one reference update. Every worker applies every update, so
    /// only one of them reports it.
    pub fn record_update(&self, applied: ApplyOutcome) {
        match applied {
            ApplyOutcome::Ignored { .. } => bump(&self.updates_ignored, 1),
            _ => bump(&self.updates_applied, 1),
        }
    }

    fn record_dropped(&self, dropped: &[DroppedEvent]) {
        for entry in dropped {
            match entry.reason {
                DropReason::Expired => bump(&self.dropped_expired, 1),
                DropReason::Overflow => bump(&self.dropped_overflow, 1),
            }
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            events: load(&self.events),
            watermarks: load(&self.watermarks),
            updates_applied: load(&self.updates_applied),
            updates_ignored: load(&self.updates_ignored),
            emitted: load(&self.emitted),
            unmatched: load(&self.unmatched),
            buffered: load(&self.buffered),
            drained: load(&self.drained),
            dropped_expired: load(&self.dropped_expired),
            dropped_overflow: load(&self.dropped_overflow),
            decode_errors: load(&self.decode_errors),
            checkpoints: load(&self.checkpoints),
            restarts: load(&self.restarts),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Point-in-time copy of the counters, served on `/metrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events: u64,
    pub watermarks: u64,
    pub updates_applied: u64,
    pub updates_ignored: u64,
    pub emitted: u64,
    pub unmatched: u64,
    pub buffered: u64,
    pub drained: u64,
    pub dropped_expired: u64,
    pub dropped_overflow: u64,
    pub decode_errors: u64,
    pub checkpoints: u64,
    pub restarts: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{LocationEvent, RegionEvent};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_record_outcome() {
        let metrics = EngineMetrics::new();
        let event = LocationEvent::new("A", "e1", "guest.position", Utc.timestamp_opt(0, 0).unwrap());
        let outcome = ProcessOutcome {
            emitted: vec![
                RegionEvent::from_match(&event, Some("A".into())),
                RegionEvent::from_match(&event, None),
            ],
            dropped: vec![DroppedEvent {
                event: event.clone(),
                reason: DropReason::Overflow,
                enqueued_at: event.time,
                dropped_at: event.time,
            }],
            buffered: 1,
            drained: 2,
            applied: Some(ApplyOutcome::Upserted { replaced: false }),
        };
        metrics.record(&outcome);
        metrics.record_update(ApplyOutcome::Upserted { replaced: false });
        metrics.record_update(ApplyOutcome::Ignored { last_sequence: 1 });
        EngineMetrics::incr(&metrics.decode_errors);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.emitted, 2);
        assert_eq!(snapshot.unmatched, 1);
        assert_eq!(snapshot.buffered, 1);
        assert_eq!(snapshot.drained, 2);
        assert_eq!(snapshot.dropped_overflow, 1);
        assert_eq!(snapshot.dropped_expired, 0);
        assert_eq!(snapshot.updates_applied, 1);
        assert_eq!(snapshot.updates_ignored, 1);
        assert_eq!(snapshot.decode_errors, 1);
    }
}
