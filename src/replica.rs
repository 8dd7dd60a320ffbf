//! Reference Replicator - a worker's local copy of the region definitions.
//!
//! Every worker receives the full changelog in the same per-key order and
//! applies it here. Workers never talk to each other; they converge because
//! [`Replica::apply_update`] is deterministic and idempotent per sequence
//! number.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::reference::{ReferenceChange, ReferenceUpdate, RegionDefinition, SequenceNumber};

/// Result of applying one changelog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Definition inserted or replaced
    Upserted { replaced: bool },
    /// Key deleted; `existed` is false for a tombstone of an unknown key
    Removed { existed: bool },
    /// Sequence number already applied for this key
    Ignored { last_sequence: SequenceNumber },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, ApplyOutcome::Ignored { .. })
    }
}

/// Per-worker replica of the reference data.
#[derive(Debug, Clone, Default)]
pub struct Replica {
    definitions: HashMap<String, RegionDefinition>,

    /// Survives tombstones so a replayed upsert cannot resurrect a removed key
    last_sequence: HashMap<String, SequenceNumber>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a changelog entry. Entries at or below the key's last applied
    /// sequence number are ignored.
    pub fn apply_update(&mut self, update: &ReferenceUpdate) -> ApplyOutcome {
        let key = &update.location_id;
        if let Some(&last_sequence) = self.last_sequence.get(key) {
            if update.sequence <= last_sequence {
                debug!(
                    location_id = %key,
                    sequence = %update.sequence,
                    last_sequence = %last_sequence,
                    "Ignoring already applied reference update"
                );
                return ApplyOutcome::Ignored { last_sequence };
            }
        }
        self.last_sequence.insert(key.clone(), update.sequence);

        match &update.change {
            ReferenceChange::Upsert(definition) => {
                let mut definition = definition.clone();
                definition.location_id = key.clone();
                definition.stamp(update.sequence, self.definitions.get(key));
                let replaced = self.definitions.insert(key.clone(), definition).is_some();
                ApplyOutcome::Upserted { replaced }
            }
            ReferenceChange::Remove => ApplyOutcome::Removed {
                existed: self.definitions.remove(key).is_some(),
            },
        }
    }

    /// Load a bulk snapshot of definitions. Returns how many were loaded.
    ///
    /// Seeded definitions record no changelog sequence, so the first
    /// changelog entry for a seeded key always applies, sequence 0 included.
    /// Keys the changelog already touched keep their changelog state.
    pub fn seed<I>(&mut self, definitions: I) -> usize
    where
        I: IntoIterator<Item = RegionDefinition>,
    {
        let mut loaded = 0;
        for mut definition in definitions {
            if self.last_sequence.contains_key(&definition.location_id) {
                debug!(location_id = %definition.location_id, "Skipping seed for key with changelog state");
                continue;
            }
            let version = definition.version;
            definition.stamp(version, None);
            self.definitions
                .insert(definition.location_id.clone(), definition);
            loaded += 1;
        }
        loaded
    }

    pub fn get(&self, location_id: &str) -> Option<&RegionDefinition> {
        self.definitions.get(location_id)
    }

    pub fn contains(&self, location_id: &str) -> bool {
        self.definitions.contains_key(location_id)
    }

    pub fn last_sequence(&self, location_id: &str) -> Option<SequenceNumber> {
        self.last_sequence.get(location_id).copied()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    /// Every key that has seen an update, tombstoned ones included.
    pub fn tracked_keys(&self) -> impl Iterator<Item = &str> {
        self.last_sequence.keys().map(String::as_str)
    }

    pub fn snapshot(&self) -> ReplicaSnapshot {
        ReplicaSnapshot {
            definitions: self
                .definitions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            last_sequence: self
                .last_sequence
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    pub fn restore(snapshot: ReplicaSnapshot) -> Self {
        Self {
            definitions: snapshot.definitions.into_iter().collect(),
            last_sequence: snapshot.last_sequence.into_iter().collect(),
        }
    }
}

/// Serializable replica state. Ordered maps keep the encoding stable so
/// identical replicas produce identical checkpoint bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub definitions: BTreeMap<String, RegionDefinition>,
    pub last_sequence: BTreeMap<String, SequenceNumber>,
}
