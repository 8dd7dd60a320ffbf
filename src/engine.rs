//! The region-join engine: one dispatcher, N workers, periodic checkpoints.
//!
//! ```text
//!  Reference-Data Source ──┐                       ┌──> worker 0 ──┐
//!                          ├──> dispatcher ──route─┼──> worker 1 ──┼──> Output Sink
//!  Event Source ───────────┘   (broadcast updates, └──> worker N ──┘
//!                               watermarks, sweeps,
//!                               barriers)
//! ```
//!
//! Each source is read by its own task, so a blocking read is never cut short
//! by the dispatcher; batches reach the dispatcher over a channel. Reference
//! updates, watermarks, sweeps and checkpoint barriers go to every worker in
//! dispatch order; location events go to the worker owning their key. Any
//! source, sink or checkpoint failure ends the run with an [`EngineError`];
//! the [`supervise`] loop then restarts from the last complete checkpoint.
//!
//! # Delivery guarantees
//!
//! State recovery is exactly-once: a restored run resumes with the replicas,
//! buffers and source positions of one consistent checkpoint. Output delivery
//! is at-least-once: region events and drop reports produced after that
//! checkpoint are produced again by the next run. Sink consumers deduplicate
//! on `(entitlement_id, time)`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{
    load_latest, CheckpointCoordinator, CheckpointError, CheckpointManifest, CheckpointStore,
    SourcePositions,
};
use crate::clock::Clock;
use crate::event::SourceEvent;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::processor::{JoinProcessor, ProcessOutcome, ProcessorConfig};
use crate::reference::{ReferenceFormat, RegionDefinition};
use crate::replica::Replica;
use crate::router::{PartitionRouter, RouterError};
use crate::shutdown::ShutdownSignal;
use crate::sink::{OutputSink, SinkError};
use crate::source::{InitialPosition, RecordSource, SourceError, SourceRecord, StartPosition};
use crate::worker::{WorkerCommand, WorkerContext, WorkerFailure, WorkerHandle, WorkerStopped};

/// Errors that end an engine run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Reference changelog delivery failed; replicas can no longer be trusted
    #[error("reference source '{stream}' failed: {source}")]
    Replication {
        stream: String,
        #[source]
        source: SourceError,
    },

    #[error("reference source '{0}' closed")]
    ReplicationClosed(String),

    #[error("event source '{stream}' failed: {source}")]
    EventSource {
        stream: String,
        #[source]
        source: SourceError,
    },

    #[error("worker {worker_id} sink failed: {source}")]
    Sink {
        worker_id: usize,
        #[source]
        source: SinkError,
    },

    #[error(transparent)]
    WorkerStopped(#[from] WorkerStopped),
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub processor: ProcessorConfig,
    pub checkpoint_interval: Duration,
    pub sweep_interval: Duration,
    /// Where the Event Source starts without a checkpoint
    pub event_start: InitialPosition,
    /// Where the Reference-Data Source starts without a checkpoint
    pub reference_start: InitialPosition,
    pub reference_format: ReferenceFormat,
    /// Bound of each worker's command channel
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            processor: ProcessorConfig::default(),
            checkpoint_interval: Duration::from_millis(5_000),
            sweep_interval: Duration::from_millis(1_000),
            event_start: InitialPosition::Latest,
            reference_start: InitialPosition::Earliest,
            reference_format: ReferenceFormat::Changelog,
            channel_capacity: 1_024,
        }
    }
}

/// External collaborators of one engine run.
pub struct EngineIo {
    pub events: Box<dyn RecordSource>,
    pub references: Box<dyn RecordSource>,
    pub sink: Arc<dyn OutputSink>,
    pub store: Arc<dyn CheckpointStore>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<EngineMetrics>,
}

/// Summary of a run that ended on shutdown.
#[derive(Debug, Clone)]
pub struct EngineReport {
    /// The final checkpoint taken before the workers stopped
    pub last_checkpoint: CheckpointManifest,
    pub metrics: MetricsSnapshot,
}

/// A started engine, ready to [`run`](Engine::run).
pub struct Engine {
    config: EngineConfig,
    router: PartitionRouter,
    workers: Vec<WorkerHandle>,
    failures: mpsc::UnboundedReceiver<WorkerFailure>,
    coordinator: CheckpointCoordinator<dyn CheckpointStore>,
    events: SourceReader,
    references: SourceReader,
    positions: SourcePositions,
    metrics: Arc<EngineMetrics>,
}

type SourceBatch = Result<Option<Vec<SourceRecord>>, SourceError>;

/// A source polled on its own task.
///
/// The task keeps at most one batch in flight towards the dispatcher and
/// stops once the source closes or fails, or when the reader is dropped.
struct SourceReader {
    name: String,
    batches: mpsc::Receiver<SourceBatch>,
}

impl SourceReader {
    fn spawn(mut source: Box<dyn RecordSource>) -> Self {
        let name = source.name().to_string();
        let (sender, batches) = mpsc::channel(1);
        tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    batch = source.next_batch() => batch,
                    _ = sender.closed() => break,
                };
                if matches!(&batch, Ok(Some(records)) if records.is_empty()) {
                    continue;
                }
                let last = !matches!(batch, Ok(Some(_)));
                if sender.send(batch).await.is_err() || last {
                    break;
                }
            }
            debug!(stream = %source.name(), "Source reader stopped");
        });
        Self { name, batches }
    }
}

impl Engine {
    /// Restore from the latest complete checkpoint, or seed the replicas
    /// with `seed` when there is none. Positions both sources and spawns
    /// the workers.
    pub async fn start(
        config: EngineConfig,
        io: EngineIo,
        seed: &[RegionDefinition],
    ) -> Result<Self, EngineError> {
        let router = PartitionRouter::new(config.workers)?;
        let EngineIo {
            mut events,
            mut references,
            sink,
            store,
            clock,
            metrics,
        } = io;

        let restored = load_latest(store.as_ref(), config.workers).await?;
        let (processors, positions, last_checkpoint) = match restored {
            Some(restored) => {
                info!(
                    checkpoint_id = restored.manifest.checkpoint_id,
                    workers = config.workers,
                    "Restoring from checkpoint"
                );
                let now = clock.now();
                let mut processors = Vec::with_capacity(config.workers);
                for (worker_id, snapshot) in restored.snapshots.into_iter().enumerate() {
                    let (processor, dropped) =
                        JoinProcessor::restore(config.processor, snapshot, now);
                    if !dropped.is_empty() {
                        warn!(
                            worker = worker_id,
                            dropped = dropped.len(),
                            capacity = config.processor.buffer.capacity,
                            "Restored buffer exceeds capacity, dropped oldest events"
                        );
                        sink.report_dropped(&dropped)
                            .await
                            .map_err(|source| EngineError::Sink { worker_id, source })?;
                        metrics.record(&ProcessOutcome {
                            dropped,
                            ..ProcessOutcome::default()
                        });
                    }
                    processors.push(processor);
                }
                (
                    processors,
                    restored.manifest.positions,
                    Some(restored.manifest.checkpoint_id),
                )
            }
            None => {
                let mut replica = Replica::new();
                let seeded = replica.seed(seed.iter().cloned());
                if !seed.is_empty() {
                    info!(definitions = seeded, "Seeded replicas from snapshot");
                }
                let processors = (0..config.workers)
                    .map(|_| JoinProcessor::with_replica(config.processor, replica.clone()))
                    .collect();
                (processors, SourcePositions::default(), None)
            }
        };

        events
            .seek(StartPosition::resolve(config.event_start, positions.events.clone()))
            .await
            .map_err(|source| EngineError::EventSource {
                stream: events.name().to_string(),
                source,
            })?;
        references
            .seek(StartPosition::resolve(
                config.reference_start,
                positions.reference.clone(),
            ))
            .await
            .map_err(|source| EngineError::Replication {
                stream: references.name().to_string(),
                source,
            })?;

        let (failures_tx, failures) = mpsc::unbounded_channel();
        let context = WorkerContext {
            sink,
            clock,
            metrics: metrics.clone(),
            failures: failures_tx,
        };
        let workers = processors
            .into_iter()
            .enumerate()
            .map(|(id, processor)| {
                WorkerHandle::spawn(id, processor, context.clone(), config.channel_capacity)
            })
            .collect();

        let events = SourceReader::spawn(events);
        let references = SourceReader::spawn(references);
        info!(
            workers = config.workers,
            events = %events.name,
            references = %references.name,
            "Engine started"
        );

        Ok(Self {
            coordinator: CheckpointCoordinator::new(store, last_checkpoint),
            config,
            router,
            workers,
            failures,
            events,
            references,
            positions,
            metrics,
        })
    }

    /// Process until `shutdown` fires or a fatal error occurs. On shutdown a
    /// final checkpoint is taken before the workers stop.
    pub async fn run(mut self, shutdown: &ShutdownSignal) -> Result<EngineReport, EngineError> {
        let mut checkpoint_tick = interval_at(
            Instant::now() + self.config.checkpoint_interval,
            self.config.checkpoint_interval,
        );
        checkpoint_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_tick = interval_at(
            Instant::now() + self.config.sweep_interval,
            self.config.sweep_interval,
        );
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.triggered() => {
                    info!("Shutdown requested, taking final checkpoint");
                    break;
                }
                Some(failure) = self.failures.recv() => {
                    return Err(EngineError::Sink {
                        worker_id: failure.worker_id,
                        source: failure.error,
                    });
                }
                _ = checkpoint_tick.tick() => {
                    self.checkpoint().await?;
                }
                _ = sweep_tick.tick() => {
                    self.broadcast(|| WorkerCommand::Sweep).await?;
                }
                batch = self.references.batches.recv() => match batch {
                    Some(Ok(Some(records))) => self.dispatch_references(records).await?,
                    Some(Ok(None)) | None => {
                        return Err(EngineError::ReplicationClosed(self.references.name.clone()));
                    }
                    Some(Err(source)) => {
                        return Err(EngineError::Replication {
                            stream: self.references.name.clone(),
                            source,
                        });
                    }
                },
                batch = self.events.batches.recv(), if events_open => match batch {
                    Some(Ok(Some(records))) => self.dispatch_events(records).await?,
                    Some(Ok(None)) | None => {
                        info!(stream = %self.events.name, "Event source closed");
                        events_open = false;
                    }
                    Some(Err(source)) => {
                        return Err(EngineError::EventSource {
                            stream: self.events.name.clone(),
                            source,
                        });
                    }
                },
            }
        }

        self.finish().await
    }

    async fn dispatch_references(&mut self, records: Vec<SourceRecord>) -> Result<(), EngineError> {
        for record in records {
            match self.config.reference_format.decode(&record.payload) {
                Ok(update) => {
                    let update = Arc::new(update);
                    self.broadcast(|| WorkerCommand::Update(update.clone()))
                        .await?;
                }
                Err(e) => {
                    EngineMetrics::incr(&self.metrics.decode_errors);
                    warn!(
                        stream = %self.references.name,
                        position = %record.position,
                        error = %e,
                        "Skipping undecodable reference record"
                    );
                }
            }
            self.positions.reference = Some(record.position);
        }
        Ok(())
    }

    async fn dispatch_events(&mut self, records: Vec<SourceRecord>) -> Result<(), EngineError> {
        for record in records {
            match SourceEvent::decode(&record.payload) {
                Ok(SourceEvent::Location(event)) => {
                    EngineMetrics::incr(&self.metrics.events);
                    let worker = self.router.route(&event.location_id);
                    self.send(worker, WorkerCommand::Event(event)).await?;
                }
                Ok(SourceEvent::Watermark(mark)) => {
                    EngineMetrics::incr(&self.metrics.watermarks);
                    self.broadcast(|| WorkerCommand::Watermark(mark.watermark))
                        .await?;
                }
                Err(e) => {
                    EngineMetrics::incr(&self.metrics.decode_errors);
                    warn!(
                        stream = %self.events.name,
                        position = %record.position,
                        error = %e,
                        "Skipping undecodable event record"
                    );
                }
            }
            self.positions.events = Some(record.position);
        }
        Ok(())
    }

    async fn send(&mut self, worker: usize, command: WorkerCommand) -> Result<(), EngineError> {
        match self.workers[worker].send(command).await {
            Ok(()) => Ok(()),
            Err(stopped) => Err(self.stopped(stopped)),
        }
    }

    async fn broadcast(&mut self, command: impl Fn() -> WorkerCommand) -> Result<(), EngineError> {
        for worker in 0..self.workers.len() {
            self.send(worker, command()).await?;
        }
        Ok(())
    }

    /// A worker that stopped early reported why on the failure channel.
    fn stopped(&mut self, stopped: WorkerStopped) -> EngineError {
        match self.failures.try_recv() {
            Ok(failure) => EngineError::Sink {
                worker_id: failure.worker_id,
                source: failure.error,
            },
            Err(_) => stopped.into(),
        }
    }

    async fn checkpoint(&mut self) -> Result<CheckpointManifest, EngineError> {
        // Barriers go out to every worker before any snapshot is awaited
        let mut barriers = Vec::with_capacity(self.workers.len());
        for worker in 0..self.workers.len() {
            match self.workers[worker].barrier().await {
                Ok(barrier) => barriers.push(barrier),
                Err(stopped) => return Err(self.stopped(stopped)),
            }
        }

        let manifest = self
            .coordinator
            .complete(barriers, self.positions.clone())
            .await?;
        EngineMetrics::incr(&self.metrics.checkpoints);
        Ok(manifest)
    }

    async fn finish(mut self) -> Result<EngineReport, EngineError> {
        let last_checkpoint = self.checkpoint().await?;
        for worker in self.workers.drain(..) {
            worker.stop().await;
        }
        if let Ok(failure) = self.failures.try_recv() {
            return Err(EngineError::Sink {
                worker_id: failure.worker_id,
                source: failure.error,
            });
        }

        let metrics = self.metrics.snapshot();
        info!(
            checkpoint_id = last_checkpoint.checkpoint_id,
            emitted = metrics.emitted,
            dropped_expired = metrics.dropped_expired,
            dropped_overflow = metrics.dropped_overflow,
            "Engine stopped"
        );
        Ok(EngineReport {
            last_checkpoint,
            metrics,
        })
    }
}

/// Restart policy of [`supervise`].
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub base_delay: Duration,
    /// Give up after this many consecutive failed runs
    pub max_restarts: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_restarts: None,
        }
    }
}

impl RestartPolicy {
    /// Exponential backoff, capped at 32x the base delay.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * (1 << attempt.min(5))
    }
}

/// Run engines until one ends cleanly on shutdown. After a fatal error the
/// next run is started with exponential backoff; it restores from the last
/// complete checkpoint on its own.
pub async fn supervise<F, Fut>(
    mut run: F,
    shutdown: &ShutdownSignal,
    policy: RestartPolicy,
    metrics: &EngineMetrics,
) -> Result<EngineReport, EngineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<EngineReport, EngineError>>,
{
    let mut attempt: u32 = 0;
    loop {
        let err = match run(attempt).await {
            Ok(report) => return Ok(report),
            Err(e) => e,
        };
        if shutdown.is_shutdown() {
            return Err(err);
        }
        if policy.max_restarts.is_some_and(|max| attempt >= max) {
            error!(error = %err, attempts = attempt + 1, "Engine failed, giving up");
            return Err(err);
        }

        let delay = policy.backoff(attempt);
        error!(
            error = %err,
            attempt,
            backoff_ms = delay.as_millis() as u64,
            "Engine run failed, restarting from last checkpoint"
        );
        EngineMetrics::incr(&metrics.restarts);
        attempt += 1;

        tokio::select! {
            _ = shutdown.triggered() => return Err(err),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
