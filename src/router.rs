//! Partition Router - decides which worker owns a location.
//!
//! Location events are routed by key so every event of one location lands on
//! the same worker, in arrival order. Reference updates and watermarks are not
//! routed; the engine broadcasts them to every worker.
//!
//! # Routing
//!
//! ```text
//! Record                     | Delivered to
//! ---------------------------|---------------------------------
//! location (location_id=k)   | worker hash(k) % workers
//! watermark                  | every worker
//! reference update           | every worker, changelog order
//! ```
//!
//! # Architecture
//!
//! ```text
//! LocationEvent (location_id: "park-1")
//!     │
//!     ▼
//! ┌─────────────────────────────────────┐
//! │         PARTITION ROUTER            │
//! │                                     │
//! │  fnv1a("park-1") = 0x106f66d7...    │
//! │  0x106f66d7... % 4 = worker 3       │
//! └─────────────────────────────────────┘
//! ```
//!
//! The hash is FNV-1a over the key bytes, so assignments stay stable across
//! restarts and toolchains. A checkpoint taken with N workers can only be
//! restored with N workers.

use thiserror::Error;

/// Errors that can occur while building a router.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouterError {
    #[error("partition router requires at least one worker")]
    NoWorkers,
}

/// Maps location keys to worker indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRouter {
    workers: usize,
}

impl PartitionRouter {
    pub fn new(workers: usize) -> Result<Self, RouterError> {
        if workers == 0 {
            return Err(RouterError::NoWorkers);
        }
        Ok(Self { workers })
    }

    /// Worker index owning `location_id`.
    pub fn route(&self, location_id: &str) -> usize {
        (hash_partition_key(location_id) % self.workers as u64) as usize
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

/// 64-bit FNV-1a hash of a partition key.
pub fn hash_partition_key(key: impl AsRef<[u8]>) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    key.as_ref().iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}
