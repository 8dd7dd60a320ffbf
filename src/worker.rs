//! Worker tasks.
//!
//! Each worker is a tokio task that exclusively owns one [`JoinProcessor`] and
//! consumes a single ordered command channel, so everything for one key is
//! processed strictly in dispatch order. Outputs go to the shared sink right
//! after matching; a sink failure stops the worker and is reported on the
//! failure channel.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::clock::Clock;
use crate::event::LocationEvent;
use crate::metrics::EngineMetrics;
use crate::processor::{JoinProcessor, ProcessOutcome, ProcessorSnapshot};
use crate::reference::ReferenceUpdate;
use crate::sink::{OutputSink, SinkError};

/// Ordered input of a worker.
#[derive(Debug)]
pub enum WorkerCommand {
    Event(LocationEvent),
    Watermark(DateTime<Utc>),
    Update(Arc<ReferenceUpdate>),
    /// TTL sweep against the worker clock or watermark
    Sweep,
    /// Checkpoint barrier: reply with a snapshot taken between two commands
    Barrier(oneshot::Sender<ProcessorSnapshot>),
}

#[derive(Debug, Error)]
#[error("worker {0} has stopped")]
pub struct WorkerStopped(pub usize);

/// A worker that stopped on a sink error.
#[derive(Debug)]
pub struct WorkerFailure {
    pub worker_id: usize,
    pub error: SinkError,
}

/// Shared collaborators of every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub sink: Arc<dyn OutputSink>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<EngineMetrics>,
    pub failures: mpsc::UnboundedSender<WorkerFailure>,
}

struct Worker {
    id: usize,
    processor: JoinProcessor,
    context: WorkerContext,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>) {
        debug!(worker = self.id, "Worker started");

        while let Some(command) = commands.recv().await {
            let outcome = match command {
                WorkerCommand::Event(event) => {
                    let now = self.context.clock.now();
                    self.processor.on_event(event, now)
                }
                WorkerCommand::Watermark(watermark) => self.processor.on_watermark(watermark),
                WorkerCommand::Update(update) => self.processor.on_update(&update),
                WorkerCommand::Sweep => {
                    let now = self.context.clock.now();
                    self.processor.sweep(now)
                }
                WorkerCommand::Barrier(reply) => {
                    // The coordinator may have given up; nothing to do then
                    let _ = reply.send(self.processor.snapshot());
                    continue;
                }
            };

            self.context.metrics.record(&outcome);
            if self.id == 0 {
                if let Some(applied) = outcome.applied {
                    self.context.metrics.record_update(applied);
                }
            }

            if let Err(e) = self.deliver(&outcome).await {
                error!(worker = self.id, sink = %self.context.sink.name(), error = %e, "Sink failed, stopping worker");
                let _ = self.context.failures.send(WorkerFailure {
                    worker_id: self.id,
                    error: e,
                });
                return;
            }
        }

        debug!(
            worker = self.id,
            pending = self.processor.buffer().len(),
            "Worker stopped"
        );
    }

    async fn deliver(&self, outcome: &ProcessOutcome) -> Result<(), SinkError> {
        if !outcome.emitted.is_empty() {
            self.context.sink.emit(&outcome.emitted).await?;
        }
        if !outcome.dropped.is_empty() {
            self.context.sink.report_dropped(&outcome.dropped).await?;
        }
        Ok(())
    }
}

/// Handle to a running worker task.
pub struct WorkerHandle {
    id: usize,
    sender: mpsc::Sender<WorkerCommand>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn a worker owning `processor`. `capacity` bounds its command
    /// channel, so a slow worker applies backpressure to the dispatcher.
    pub fn spawn(
        id: usize,
        processor: JoinProcessor,
        context: WorkerContext,
        capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = Worker {
            id,
            processor,
            context,
        };
        let task = tokio::spawn(worker.run(receiver));
        Self { id, sender, task }
    }

    pub async fn send(&self, command: WorkerCommand) -> Result<(), WorkerStopped> {
        self.sender
            .send(command)
            .await
            .map_err(|_| WorkerStopped(self.id))
    }

    /// Inject a checkpoint barrier; the receiver yields the snapshot.
    pub async fn barrier(&self) -> Result<oneshot::Receiver<ProcessorSnapshot>, WorkerStopped> {
        let (reply, receiver) = oneshot::channel();
        self.send(WorkerCommand::Barrier(reply)).await?;
        Ok(receiver)
    }

    /// Close the command channel and wait for the worker to drain it.
    pub async fn stop(self) {
        drop(self.sender);
        if let Err(e) = self.task.await {
            error!(worker = self.id, error = %e, "Worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::geohash;
    use crate::processor::ProcessorConfig;
    use crate::sink::CollectingSink;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::time::Duration;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn context(sink: Arc<dyn OutputSink>) -> (WorkerContext, mpsc::UnboundedReceiver<WorkerFailure>) {
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let context = WorkerContext {
            sink,
            clock: Arc::new(ManualClock::new(ts(0))),
            metrics: Arc::new(EngineMetrics::new()),
            failures,
        };
        (context, failures_rx)
    }

    fn event(key: &str, entitlement: &str, cell: &str) -> LocationEvent {
        LocationEvent::new(key, entitlement, "guest.position", ts(0))
            .with_coordinate(geohash::center(cell).unwrap())
    }

    #[tokio::test]
    async fn test_worker_processes_commands_in_order() {
        let sink = CollectingSink::new();
        let (context, _failures) = context(Arc::new(sink.clone()));
        let metrics = context.metrics.clone();
        let worker = WorkerHandle::spawn(0, JoinProcessor::new(ProcessorConfig::default()), context, 8);

        worker
            .send(WorkerCommand::Event(event("A", "e1", "89c2")))
            .await
            .unwrap();
        let update = ReferenceUpdate::upsert("A", 1, ["89c2"]).unwrap();
        worker
            .send(WorkerCommand::Update(Arc::new(update)))
            .await
            .unwrap();
        worker
            .send(WorkerCommand::Event(event("A", "e2", "89c3")))
            .await
            .unwrap();

        let snapshot = worker.barrier().await.unwrap().await.unwrap();
        assert_eq!(snapshot.replica.definitions.len(), 1);
        assert!(snapshot.buffer.queues.is_empty());

        assert!(sink.wait_for_emitted(2, Duration::from_secs(2)).await);
        let regions: Vec<Option<String>> = sink.emitted().into_iter().map(|e| e.region).collect();
        assert_eq!(regions, vec![Some("A".to_string()), None]);

        worker.stop().await;
        let counters = metrics.snapshot();
        assert_eq!(counters.buffered, 1);
        assert_eq!(counters.drained, 1);
        assert_eq!(counters.updates_applied, 1);
    }

    struct FailingSink;

    #[async_trait]
    impl OutputSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn emit(&self, _events: &[crate::event::RegionEvent]) -> Result<(), SinkError> {
            Err(SinkError::Connection("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_sink_failure_stops_worker() {
        let (context, mut failures) = context(Arc::new(FailingSink));
        let worker = WorkerHandle::spawn(3, JoinProcessor::new(ProcessorConfig::default()), context, 8);

        let update = ReferenceUpdate::upsert("A", 1, ["89c2"]).unwrap();
        worker
            .send(WorkerCommand::Update(Arc::new(update)))
            .await
            .unwrap();
        worker
            .send(WorkerCommand::Event(event("A", "e1", "89c2")))
            .await
            .unwrap();

        let failure = tokio::time::timeout(Duration::from_secs(2), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.worker_id, 3);
        assert!(matches!(failure.error, SinkError::Connection(_)));

        // Channel is closed once the task has returned
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(worker.barrier().await.is_err());
    }
}
