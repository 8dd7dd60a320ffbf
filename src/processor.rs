//! Join Processor - the per-key state machine joining events to definitions.
//!
//! ```text
//!                 upsert (drains buffer)
//!   Unresolved ---------------------------> Resolved
//!       ^  event: buffer                      |  event: match + emit
//!       |                                     |  upsert: replace in place
//!       +------------- remove ----------------+
//! ```
//!
//! A key's state is created lazily on its first event or update. Every event
//! ends up either as exactly one [`RegionEvent`] or as one [`DroppedEvent`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::buffer::{BufferConfig, BufferSnapshot, DropReason, DroppedEvent, PendingBuffer, TimeDomain};
use crate::event::{LocationEvent, RegionEvent};
use crate::matcher;
use crate::reference::{ReferenceChange, ReferenceUpdate, RegionDefinition};
use crate::replica::{ApplyOutcome, Replica, ReplicaSnapshot};
use crate::watermark::WatermarkTracker;

/// Join state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// No definition; events are buffered
    Unresolved,
    /// Definition present; events are matched immediately
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorConfig {
    pub buffer: BufferConfig,
    /// Lag of the derived watermark behind the highest event time seen
    pub max_out_of_orderness: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            max_out_of_orderness: Duration::seconds(10),
        }
    }
}

/// Everything one command produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutcome {
    /// Outputs in emission order
    pub emitted: Vec<RegionEvent>,
    pub dropped: Vec<DroppedEvent>,
    /// Events placed in the buffer
    pub buffered: usize,
    /// Events released from the buffer and emitted
    pub drained: usize,
    /// Set for reference updates
    pub applied: Option<ApplyOutcome>,
}

impl ProcessOutcome {
    fn merge(&mut self, other: ProcessOutcome) {
        self.emitted.extend(other.emitted);
        self.dropped.extend(other.dropped);
        self.buffered += other.buffered;
        self.drained += other.drained;
        self.applied = other.applied.or(self.applied);
    }
}

/// One worker's join state: replica, pending buffer and watermark.
#[derive(Debug, Clone)]
pub struct JoinProcessor {
    config: ProcessorConfig,
    replica: Replica,
    buffer: PendingBuffer,
    states: HashMap<String, KeyState>,
    watermark: WatermarkTracker,
}

impl JoinProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self::from_parts(config, Replica::new(), PendingBuffer::new(config.buffer), None)
    }

    /// Processor over a pre-built replica, e.g. after seeding.
    pub fn with_replica(config: ProcessorConfig, replica: Replica) -> Self {
        Self::from_parts(config, replica, PendingBuffer::new(config.buffer), None)
    }

    /// Rebuild a processor from a checkpoint. Buffered events beyond the
    /// current capacity are returned as overflow drops; `now` is the wall
    /// clock, used unless the buffer runs in the event domain.
    pub fn restore(
        config: ProcessorConfig,
        snapshot: ProcessorSnapshot,
        now: DateTime<Utc>,
    ) -> (Self, Vec<DroppedEvent>) {
        let clock = match config.buffer.time_domain {
            TimeDomain::Wall => now,
            TimeDomain::Event => snapshot.watermark.unwrap_or(now),
        };
        let (buffer, dropped) = PendingBuffer::restore(config.buffer, snapshot.buffer, clock);
        let processor = Self::from_parts(
            config,
            Replica::restore(snapshot.replica),
            buffer,
            snapshot.watermark,
        );
        (processor, dropped)
    }

    fn from_parts(
        config: ProcessorConfig,
        replica: Replica,
        buffer: PendingBuffer,
        watermark: Option<DateTime<Utc>>,
    ) -> Self {
        let mut states = HashMap::new();
        for key in buffer.keys() {
            states.insert(key.to_string(), KeyState::Unresolved);
        }
        for key in replica.tracked_keys() {
            states.insert(key.to_string(), KeyState::Unresolved);
        }
        for key in replica.keys() {
            states.insert(key.to_string(), KeyState::Resolved);
        }

        Self {
            config,
            replica,
            buffer,
            states,
            watermark: WatermarkTracker::resume(config.max_out_of_orderness, watermark),
        }
    }

    /// Handle a location event. `now` is the worker's wall clock.
    pub fn on_event(&mut self, event: LocationEvent, now: DateTime<Utc>) -> ProcessOutcome {
        let advanced = self.watermark.observe_event(event.time);
        let mut outcome = self.route_event(event, now);
        if let Some(watermark) = advanced {
            outcome.merge(self.evict_on_watermark(watermark));
        }
        outcome
    }

    /// Handle an explicit watermark record.
    pub fn on_watermark(&mut self, watermark: DateTime<Utc>) -> ProcessOutcome {
        match self.watermark.observe_watermark(watermark) {
            Some(watermark) => self.evict_on_watermark(watermark),
            None => ProcessOutcome::default(),
        }
    }

    /// Apply a reference update, draining the key's buffer on upsert.
    pub fn on_update(&mut self, update: &ReferenceUpdate) -> ProcessOutcome {
        let applied = self.replica.apply_update(update);
        let mut outcome = ProcessOutcome {
            applied: Some(applied),
            ..ProcessOutcome::default()
        };
        if !applied.is_applied() {
            return outcome;
        }

        let key = &update.location_id;
        match &update.change {
            ReferenceChange::Upsert(_) => {
                let previous = self.states.insert(key.clone(), KeyState::Resolved);
                if previous != Some(KeyState::Resolved) {
                    debug!(location_id = %key, sequence = %update.sequence, "Key resolved");
                }

                let pending = self.buffer.drain(key);
                if let Some(definition) = self.replica.get(key) {
                    outcome.drained = pending.len();
                    outcome.emitted = pending
                        .iter()
                        .map(|event| resolve(event, definition))
                        .collect();
                }
                if outcome.drained > 0 {
                    debug!(location_id = %key, drained = outcome.drained, "Drained pending events");
                }
            }
            ReferenceChange::Remove => {
                self.states.insert(key.clone(), KeyState::Unresolved);
                debug!(location_id = %key, sequence = %update.sequence, "Key unresolved by tombstone");
            }
        }
        outcome
    }

    /// Periodic TTL sweep. In the wall domain entries are checked against
    /// `now`; in the event domain against the watermark.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> ProcessOutcome {
        let clock = match self.config.buffer.time_domain {
            TimeDomain::Wall => Some(now),
            TimeDomain::Event => self.watermark.current(),
        };
        match clock {
            Some(clock) => self.evict(clock),
            None => ProcessOutcome::default(),
        }
    }

    pub fn state(&self, location_id: &str) -> Option<KeyState> {
        self.states.get(location_id).copied()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn buffer(&self) -> &PendingBuffer {
        &self.buffer
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark.current()
    }

    pub fn snapshot(&self) -> ProcessorSnapshot {
        ProcessorSnapshot {
            replica: self.replica.snapshot(),
            buffer: self.buffer.snapshot(),
            watermark: self.watermark.current(),
        }
    }

    fn route_event(&mut self, event: LocationEvent, now: DateTime<Utc>) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();
        let key = event.location_id.clone();

        if let Some(definition) = self.replica.get(&key) {
            self.states.insert(key, KeyState::Resolved);
            outcome.emitted.push(resolve(&event, definition));
            return outcome;
        }
        self.states.insert(key, KeyState::Unresolved);

        // Already past its deadline in the event domain: it could never drain
        if self.config.buffer.time_domain == TimeDomain::Event {
            if let Some(watermark) = self.watermark.current() {
                if event.time + self.config.buffer.ttl <= watermark {
                    warn!(
                        location_id = %event.location_id,
                        entitlement_id = %event.entitlement_id,
                        "Dropping late event for unresolved key"
                    );
                    outcome.dropped.push(DroppedEvent {
                        enqueued_at: event.time,
                        event,
                        reason: DropReason::Expired,
                        dropped_at: watermark,
                    });
                    return outcome;
                }
            }
        }

        let overflow_clock = match self.config.buffer.time_domain {
            TimeDomain::Wall => now,
            TimeDomain::Event => self.watermark.current().unwrap_or(event.time),
        };
        outcome.buffered = 1;
        if let Some(dropped) = self.buffer.enqueue(event, overflow_clock) {
            warn!(
                location_id = %dropped.event.location_id,
                entitlement_id = %dropped.event.entitlement_id,
                "Pending buffer full, dropped oldest event"
            );
            outcome.dropped.push(dropped);
        }
        outcome
    }

    fn evict_on_watermark(&mut self, watermark: DateTime<Utc>) -> ProcessOutcome {
        match self.config.buffer.time_domain {
            TimeDomain::Event => self.evict(watermark),
            TimeDomain::Wall => ProcessOutcome::default(),
        }
    }

    fn evict(&mut self, clock: DateTime<Utc>) -> ProcessOutcome {
        let dropped = self.buffer.evict_expired(clock);
        for entry in &dropped {
            warn!(
                location_id = %entry.event.location_id,
                entitlement_id = %entry.event.entitlement_id,
                enqueued_at = %entry.enqueued_at,
                "Pending event expired without reference data"
            );
        }
        ProcessOutcome {
            dropped,
            ..ProcessOutcome::default()
        }
    }
}

/// Match one event against a definition. A detail without a usable
/// coordinate is a spatial miss.
fn resolve(event: &LocationEvent, definition: &RegionDefinition) -> RegionEvent {
    let region = match event.coordinate() {
        Ok(coordinate) => matcher::matches(&coordinate, definition).map(str::to_string),
        Err(err) => {
            warn!(
                location_id = %event.location_id,
                entitlement_id = %event.entitlement_id,
                error = %err,
                "Event has no usable coordinate, emitting without region"
            );
            None
        }
    };
    RegionEvent::from_match(event, region)
}

/// Serializable processor state captured at a checkpoint barrier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSnapshot {
    pub replica: ReplicaSnapshot,
    pub buffer: BufferSnapshot,
    pub watermark: Option<DateTime<Utc>>,
}
