//! Pending Buffer - holds events whose location has no definition yet.
//!
//! Each key owns a FIFO queue bounded by a capacity; each entry also carries
//! a deadline, `enqueue time + ttl`. Time is read in one of two domains:
//!
//! - [`TimeDomain::Wall`]: enqueue time is the worker clock at arrival, the
//!   sweep clock is the wall clock.
//! - [`TimeDomain::Event`]: enqueue time is the event's own timestamp and the
//!   sweep clock is the worker's watermark.
//!
//! Evicted entries come back as [`DroppedEvent`]s, oldest first. They are
//! never matched.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::event::LocationEvent;

/// Clock used to measure buffering time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeDomain {
    #[default]
    Wall,
    Event,
}

/// Why an event left the buffer without being matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropReason {
    /// Reference data did not arrive within the TTL
    Expired,
    /// The key's queue was full and this was its oldest entry
    Overflow,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Expired => f.write_str("expired"),
            DropReason::Overflow => f.write_str("overflow"),
        }
    }
}

/// An event the engine gave up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedEvent {
    pub event: LocationEvent,
    pub reason: DropReason,
    pub enqueued_at: DateTime<Utc>,
    pub dropped_at: DateTime<Utc>,
}

/// A buffered event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub event: LocationEvent,
    pub enqueued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Arrival order across the whole buffer
    pub order: u64,
}

impl PendingEntry {
    fn into_dropped(self, reason: DropReason, dropped_at: DateTime<Utc>) -> DroppedEvent {
        DroppedEvent {
            event: self.event,
            reason,
            enqueued_at: self.enqueued_at,
            dropped_at,
        }
    }
}

/// Bounds applied to every key's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// Maximum entries per key
    pub capacity: usize,
    /// Time an entry may wait, measured from enqueue time
    pub ttl: Duration,
    pub time_domain: TimeDomain,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            ttl: Duration::seconds(60),
            time_domain: TimeDomain::Wall,
        }
    }
}

/// Per-key FIFO of events waiting for reference data.
#[derive(Debug, Clone)]
pub struct PendingBuffer {
    config: BufferConfig,
    queues: HashMap<String, VecDeque<PendingEntry>>,
    next_order: u64,
    len: usize,
}

impl PendingBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config: BufferConfig {
                capacity: config.capacity.max(1),
                ..config
            },
            queues: HashMap::new(),
            next_order: 0,
            len: 0,
        }
    }

    /// Append `event` to its key's queue. `now` is the clock of the configured
    /// domain. Returns the entry pushed out when the queue was full.
    pub fn enqueue(&mut self, event: LocationEvent, now: DateTime<Utc>) -> Option<DroppedEvent> {
        let enqueued_at = match self.config.time_domain {
            TimeDomain::Wall => now,
            TimeDomain::Event => event.time,
        };
        let entry = PendingEntry {
            deadline: enqueued_at + self.config.ttl,
            enqueued_at,
            order: self.next_order,
            event,
        };
        self.next_order += 1;

        let queue = self
            .queues
            .entry(entry.event.location_id.clone())
            .or_default();
        queue.push_back(entry);
        self.len += 1;

        if queue.len() > self.config.capacity {
            let oldest = queue.pop_front()?;
            self.len -= 1;
            return Some(oldest.into_dropped(DropReason::Overflow, now));
        }
        None
    }

    /// Remove and return every event buffered for `key`, in enqueue order.
    pub fn drain(&mut self, key: &str) -> Vec<LocationEvent> {
        let Some(queue) = self.queues.remove(key) else {
            return Vec::new();
        };
        self.len -= queue.len();
        queue.into_iter().map(|entry| entry.event).collect()
    }

    /// Drop every entry whose deadline is at or before `now`, returned in
    /// enqueue order.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> Vec<DroppedEvent> {
        let mut expired = Vec::new();

        self.queues.retain(|_, queue| {
            // Event-time deadlines are not monotonic within a queue.
            let (gone, kept): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|entry| entry.deadline <= now);
            expired.extend(gone);
            *queue = kept;
            !queue.is_empty()
        });

        self.len -= expired.len();
        expired.sort_by_key(|entry| entry.order);
        expired
            .into_iter()
            .map(|entry| entry.into_dropped(DropReason::Expired, now))
            .collect()
    }

    /// Number of events buffered for `key`.
    pub fn pending(&self, key: &str) -> usize {
        self.queues.get(key).map_or(0, VecDeque::len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            queues: self
                .queues
                .iter()
                .map(|(key, queue)| (key.clone(), queue.iter().cloned().collect()))
                .collect(),
            next_order: self.next_order,
        }
    }

    /// Rebuild a buffer from a snapshot under `config`. Queues longer than
    /// the configured capacity lose their oldest entries, returned as
    /// overflow drops stamped with `now`.
    pub fn restore(
        config: BufferConfig,
        snapshot: BufferSnapshot,
        now: DateTime<Utc>,
    ) -> (Self, Vec<DroppedEvent>) {
        let mut buffer = Self::new(config);
        buffer.next_order = snapshot.next_order;
        let mut trimmed = Vec::new();

        for (key, entries) in snapshot.queues {
            let mut queue: VecDeque<PendingEntry> = entries.into();
            while queue.len() > buffer.config.capacity {
                if let Some(oldest) = queue.pop_front() {
                    trimmed.push(oldest);
                }
            }
            if queue.is_empty() {
                continue;
            }
            buffer.len += queue.len();
            buffer.queues.insert(key, queue);
        }

        trimmed.sort_by_key(|entry| entry.order);
        let dropped = trimmed
            .into_iter()
            .map(|entry| entry.into_dropped(DropReason::Overflow, now))
            .collect();
        (buffer, dropped)
    }
}

/// Serializable buffer contents, per key in enqueue order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub queues: BTreeMap<String, Vec<PendingEntry>>,
    pub next_order: u64,
}
