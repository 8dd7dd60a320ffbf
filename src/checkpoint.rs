//! Checkpoint Coordinator - consistent snapshots of every worker.
//!
//! A checkpoint is taken in three steps:
//!
//! 1. The engine injects a barrier into every worker's command channel and
//!    records the source positions dispatched so far.
//! 2. Each worker snapshots its processor between two commands; the
//!    coordinator writes each snapshot to the [`CheckpointStore`] with its
//!    SHA-256 checksum.
//! 3. A [`CheckpointManifest`] naming the worker count, source positions and
//!    checksums is committed. Only a committed manifest makes a checkpoint
//!    complete; a crash in between leaves the previous one in place.
//!
//! # File layout
//!
//! ```text
//! <dir>/chk-00000000000000000007/worker-0.json
//! <dir>/chk-00000000000000000007/worker-1.json
//! <dir>/chk-00000000000000000007/manifest.json
//! <dir>/latest.json                      <- committed manifest, replaced atomically
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::processor::ProcessorSnapshot;
use crate::source::StreamPosition;

pub type CheckpointId = u64;

/// Errors raised while writing or restoring checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint {checkpoint_id} worker {worker_id} is corrupted: expected checksum {expected}, found {actual}")]
    Corrupted {
        checkpoint_id: CheckpointId,
        worker_id: usize,
        expected: String,
        actual: String,
    },

    #[error("checkpoint {checkpoint_id} has no snapshot for worker {worker_id}")]
    MissingSnapshot {
        checkpoint_id: CheckpointId,
        worker_id: usize,
    },

    #[error("checkpoint was taken with {found} workers but the engine runs {expected}")]
    TopologyMismatch { expected: usize, found: usize },

    #[error("worker {0} stopped before answering the checkpoint barrier")]
    WorkerUnavailable(usize),
}

/// Last dispatched position of each source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePositions {
    pub events: Option<StreamPosition>,
    pub reference: Option<StreamPosition>,
}

/// Record of a complete checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub checkpoint_id: CheckpointId,
    pub workers: usize,
    pub positions: SourcePositions,
    /// SHA-256 of each worker snapshot, indexed by worker id
    pub checksums: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// One worker's state at a barrier, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub checkpoint_id: CheckpointId,
    pub worker_id: usize,
    pub taken_at: DateTime<Utc>,
    pub state: ProcessorSnapshot,
}

/// Contract implemented by checkpoint storage backends.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist the encoded snapshot of one worker.
    async fn write_snapshot(
        &self,
        checkpoint_id: CheckpointId,
        worker_id: usize,
        bytes: &[u8],
    ) -> Result<(), CheckpointError>;

    /// Load the encoded snapshot of one worker.
    async fn read_snapshot(
        &self,
        checkpoint_id: CheckpointId,
        worker_id: usize,
    ) -> Result<Vec<u8>, CheckpointError>;

    /// Atomically publish `manifest` as the latest complete checkpoint.
    async fn commit(&self, manifest: &CheckpointManifest) -> Result<(), CheckpointError>;

    async fn latest_manifest(&self) -> Result<Option<CheckpointManifest>, CheckpointError>;
}

/// A checkpoint loaded and verified for restore.
#[derive(Debug, Clone)]
pub struct RestoredCheckpoint {
    pub manifest: CheckpointManifest,
    /// Indexed by worker id
    pub snapshots: Vec<ProcessorSnapshot>,
}

/// Drives checkpoints for one engine run.
pub struct CheckpointCoordinator<S: CheckpointStore + ?Sized> {
    store: std::sync::Arc<S>,
    next_id: CheckpointId,
}

impl<S: CheckpointStore + ?Sized> CheckpointCoordinator<S> {
    /// `last` is the id of the checkpoint the run restored from, if any.
    pub fn new(store: std::sync::Arc<S>, last: Option<CheckpointId>) -> Self {
        Self {
            store,
            next_id: last.map_or(1, |id| id + 1),
        }
    }

    pub fn next_id(&self) -> CheckpointId {
        self.next_id
    }

    /// Complete a checkpoint whose barriers were already injected. `barriers`
    /// are the workers' snapshot replies, indexed by worker id.
    pub async fn complete(
        &mut self,
        barriers: Vec<oneshot::Receiver<ProcessorSnapshot>>,
        positions: SourcePositions,
    ) -> Result<CheckpointManifest, CheckpointError> {
        let checkpoint_id = self.next_id;
        let workers = barriers.len();
        let mut checksums = Vec::with_capacity(workers);

        for (worker_id, barrier) in barriers.into_iter().enumerate() {
            let state = barrier
                .await
                .map_err(|_| CheckpointError::WorkerUnavailable(worker_id))?;
            let snapshot = WorkerSnapshot {
                checkpoint_id,
                worker_id,
                taken_at: Utc::now(),
                state,
            };
            let bytes = serde_json::to_vec(&snapshot)?;
            self.store
                .write_snapshot(checkpoint_id, worker_id, &bytes)
                .await?;
            checksums.push(compute_checksum(&bytes));
        }

        let manifest = CheckpointManifest {
            checkpoint_id,
            workers,
            positions,
            checksums,
            completed_at: Utc::now(),
        };
        self.store.commit(&manifest).await?;
        self.next_id += 1;

        info!(
            checkpoint_id,
            workers,
            events_position = ?manifest.positions.events,
            reference_position = ?manifest.positions.reference,
            "Checkpoint complete"
        );
        Ok(manifest)
    }
}

/// Load the latest complete checkpoint for an engine of `workers` workers,
/// verifying every snapshot against the manifest.
pub async fn load_latest<S: CheckpointStore + ?Sized>(
    store: &S,
    workers: usize,
) -> Result<Option<RestoredCheckpoint>, CheckpointError> {
    let Some(manifest) = store.latest_manifest().await? else {
        return Ok(None);
    };
    if manifest.workers != workers || manifest.checksums.len() != workers {
        return Err(CheckpointError::TopologyMismatch {
            expected: workers,
            found: manifest.workers,
        });
    }

    let mut snapshots = Vec::with_capacity(workers);
    for (worker_id, expected) in manifest.checksums.iter().enumerate() {
        let bytes = store
            .read_snapshot(manifest.checkpoint_id, worker_id)
            .await?;
        let actual = compute_checksum(&bytes);
        if &actual != expected {
            return Err(CheckpointError::Corrupted {
                checkpoint_id: manifest.checkpoint_id,
                worker_id,
                expected: expected.clone(),
                actual,
            });
        }
        let snapshot: WorkerSnapshot = serde_json::from_slice(&bytes)?;
        snapshots.push(snapshot.state);
    }

    debug!(checkpoint_id = manifest.checkpoint_id, workers, "Loaded checkpoint");
    Ok(Some(RestoredCheckpoint {
        manifest,
        snapshots,
    }))
}

/// Checkpoints stored as JSON files under one directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    /// Complete checkpoints kept on disk, newest first
    retain: usize,
}

const LATEST_FILE: &str = "latest.json";
const MANIFEST_FILE: &str = "manifest.json";

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retain: 3,
        }
    }

    pub fn with_retain(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    fn checkpoint_dir(&self, checkpoint_id: CheckpointId) -> PathBuf {
        self.dir.join(format!("chk-{checkpoint_id:020}"))
    }

    fn snapshot_path(&self, checkpoint_id: CheckpointId, worker_id: usize) -> PathBuf {
        self.checkpoint_dir(checkpoint_id)
            .join(format!("worker-{worker_id}.json"))
    }

    /// Remove checkpoint directories older than the retained ones.
    async fn prune(&self, newest: CheckpointId) -> Result<(), CheckpointError> {
        let oldest_kept = newest.saturating_sub(self.retain as u64 - 1);
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|name| name.strip_prefix("chk-"))
                .and_then(|id| id.parse::<CheckpointId>().ok())
            else {
                continue;
            };
            if id < oldest_kept {
                if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                    warn!(checkpoint_id = id, error = %e, "Failed to prune checkpoint");
                }
            }
        }
        Ok(())
    }
}

/// Write `bytes` next to `path` and rename into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn write_snapshot(
        &self,
        checkpoint_id: CheckpointId,
        worker_id: usize,
        bytes: &[u8],
    ) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(self.checkpoint_dir(checkpoint_id)).await?;
        write_atomic(&self.snapshot_path(checkpoint_id, worker_id), bytes).await
    }

    async fn read_snapshot(
        &self,
        checkpoint_id: CheckpointId,
        worker_id: usize,
    ) -> Result<Vec<u8>, CheckpointError> {
        match tokio::fs::read(self.snapshot_path(checkpoint_id, worker_id)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CheckpointError::MissingSnapshot {
                    checkpoint_id,
                    worker_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn commit(&self, manifest: &CheckpointManifest) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        let dir = self.checkpoint_dir(manifest.checkpoint_id);
        tokio::fs::create_dir_all(&dir).await?;
        write_atomic(&dir.join(MANIFEST_FILE), &bytes).await?;
        write_atomic(&self.dir.join(LATEST_FILE), &bytes).await?;
        self.prune(manifest.checkpoint_id).await
    }

    async fn latest_manifest(&self) -> Result<Option<CheckpointManifest>, CheckpointError> {
        match tokio::fs::read(self.dir.join(LATEST_FILE)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Checkpoints kept in process memory. Survives engine restarts within one
/// process, not process restarts.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    snapshots: Mutex<HashMap<(CheckpointId, usize), Vec<u8>>>,
    latest: Mutex<Option<CheckpointManifest>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn write_snapshot(
        &self,
        checkpoint_id: CheckpointId,
        worker_id: usize,
        bytes: &[u8],
    ) -> Result<(), CheckpointError> {
        self.snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((checkpoint_id, worker_id), bytes.to_vec());
        Ok(())
    }

    async fn read_snapshot(
        &self,
        checkpoint_id: CheckpointId,
        worker_id: usize,
    ) -> Result<Vec<u8>, CheckpointError> {
        self.snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(checkpoint_id, worker_id))
            .cloned()
            .ok_or(CheckpointError::MissingSnapshot {
                checkpoint_id,
                worker_id,
            })
    }

    async fn commit(&self, manifest: &CheckpointManifest) -> Result<(), CheckpointError> {
        let mut snapshots = self
            .snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        snapshots.retain(|(id, _), _| *id >= manifest.checkpoint_id);
        drop(snapshots);

        *self.latest.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(manifest.clone());
        Ok(())
    }

    async fn latest_manifest(&self) -> Result<Option<CheckpointManifest>, CheckpointError> {
        Ok(self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }
}

fn compute_checksum(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    to_hex(&digest)
}

fn to_hex(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        encoded.push_str(&format!("{:02x}", byte));
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LocationEvent;
    use crate::processor::{JoinProcessor, ProcessorConfig};
    use crate::reference::ReferenceUpdate;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn processor_state(key: &str) -> ProcessorSnapshot {
        let mut processor = JoinProcessor::new(ProcessorConfig::default());
        processor.on_update(&ReferenceUpdate::upsert(key, 1, ["89c2"]).unwrap());
        processor.on_event(
            LocationEvent::new("pending", "e1", "guest.position", Utc.timestamp_opt(0, 0).unwrap()),
            Utc.timestamp_opt(0, 0).unwrap(),
        );
        processor.snapshot()
    }

    fn barriers(states: Vec<ProcessorSnapshot>) -> Vec<oneshot::Receiver<ProcessorSnapshot>> {
        states
            .into_iter()
            .map(|state| {
                let (tx, rx) = oneshot::channel();
                tx.send(state).unwrap();
                rx
            })
            .collect()
    }

    fn positions() -> SourcePositions {
        SourcePositions {
            events: Some(StreamPosition::new("1700000000000-4")),
            reference: Some(StreamPosition::new("1700000000000-1")),
        }
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            compute_checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path()));
        assert!(load_latest(store.as_ref(), 2).await.unwrap().is_none());

        let states = vec![processor_state("A"), processor_state("B")];
        let mut coordinator = CheckpointCoordinator::new(store.clone(), None);
        let manifest = coordinator
            .complete(barriers(states.clone()), positions())
            .await
            .unwrap();
        assert_eq!(manifest.checkpoint_id, 1);
        assert_eq!(coordinator.next_id(), 2);

        let restored = load_latest(store.as_ref(), 2).await.unwrap().unwrap();
        assert_eq!(restored.manifest, manifest);
        assert_eq!(restored.snapshots, states);
        assert!(dir.path().join("latest.json").exists());
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path()));
        let mut coordinator = CheckpointCoordinator::new(store.clone(), None);
        coordinator
            .complete(barriers(vec![processor_state("A")]), positions())
            .await
            .unwrap();

        let path = store.snapshot_path(1, 0);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 2;
        bytes[last] = b' ';
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            load_latest(store.as_ref(), 1).await,
            Err(CheckpointError::Corrupted { worker_id: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_topology_mismatch() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut coordinator = CheckpointCoordinator::new(store.clone(), None);
        coordinator
            .complete(barriers(vec![processor_state("A")]), positions())
            .await
            .unwrap();

        assert!(matches!(
            load_latest(store.as_ref(), 3).await,
            Err(CheckpointError::TopologyMismatch {
                expected: 3,
                found: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_uncommitted_checkpoint_is_invisible() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut coordinator = CheckpointCoordinator::new(store.clone(), None);
        coordinator
            .complete(barriers(vec![processor_state("A")]), positions())
            .await
            .unwrap();

        // Second checkpoint: a worker dies before answering the barrier
        let (tx, rx) = oneshot::channel::<ProcessorSnapshot>();
        drop(tx);
        let result = coordinator.complete(vec![rx], positions()).await;
        assert!(matches!(result, Err(CheckpointError::WorkerUnavailable(0))));

        let restored = load_latest(store.as_ref(), 1).await.unwrap().unwrap();
        assert_eq!(restored.manifest.checkpoint_id, 1);
    }

    #[tokio::test]
    async fn test_file_store_prunes_old_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path()).with_retain(2));
        let mut coordinator = CheckpointCoordinator::new(store.clone(), None);
        for _ in 0..4 {
            coordinator
                .complete(barriers(vec![processor_state("A")]), positions())
                .await
                .unwrap();
        }

        assert!(!store.checkpoint_dir(1).exists());
        assert!(!store.checkpoint_dir(2).exists());
        assert!(store.checkpoint_dir(3).exists());
        assert!(store.checkpoint_dir(4).exists());
        let restored = load_latest(store.as_ref(), 1).await.unwrap().unwrap();
        assert_eq!(restored.manifest.checkpoint_id, 4);
    }
}
