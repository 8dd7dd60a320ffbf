//! Record sources for the Event Source and the Reference-Data Source.
//!
//! A [`RecordSource`] yields raw records in stream order together with their
//! [`StreamPosition`]. The engine records the last position it dispatched and
//! stores it in checkpoints; after a restart the source is positioned with
//! [`StartPosition::After`] so reading resumes right behind it.
//!
//! ## Built-in Sources
//!
//! - [`RedisStreamSource`]: `XREAD BLOCK` over a Redis stream
//! - [`MemorySource`]: an in-process log, fed through a [`MemoryStream`]

pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Notify;

pub use self::redis::RedisStreamSource;

/// Errors raised while reading a source.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Could not obtain a connection
    #[error("connection error: {0}")]
    Connection(String),

    /// A read or positioning command failed
    #[error("read from '{stream}' failed: {message}")]
    Read { stream: String, message: String },

    /// The position handed to `seek` does not belong to this source
    #[error("invalid position '{0}'")]
    InvalidPosition(String),
}

/// Opaque position of a record within its stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamPosition(pub String);

impl StreamPosition {
    pub fn new(position: impl Into<String>) -> Self {
        Self(position.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where to start reading when there is no checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialPosition {
    Earliest,
    #[default]
    Latest,
}

/// Where a source starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPosition {
    Earliest,
    Latest,
    /// Right after the given record
    After(StreamPosition),
}

impl StartPosition {
    /// A recorded checkpoint position wins over the configured initial one.
    pub fn resolve(initial: InitialPosition, recorded: Option<StreamPosition>) -> Self {
        match (recorded, initial) {
            (Some(position), _) => StartPosition::After(position),
            (None, InitialPosition::Earliest) => StartPosition::Earliest,
            (None, InitialPosition::Latest) => StartPosition::Latest,
        }
    }
}

/// One raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub position: StreamPosition,
    pub payload: Vec<u8>,
}

/// A positionable stream of raw records.
#[async_trait]
pub trait RecordSource: Send {
    /// Stream name, used in logs and health output
    fn name(&self) -> &str;

    /// Position the source. Called once before the first read.
    async fn seek(&mut self, start: StartPosition) -> Result<(), SourceError>;

    /// Next batch of records in stream order. An empty batch means nothing
    /// arrived in time; `None` means the source is closed for good.
    ///
    /// Must be cancel safe: a dropped call loses no records.
    async fn next_batch(&mut self) -> Result<Option<Vec<SourceRecord>>, SourceError>;
}

#[derive(Debug, Default)]
struct MemoryLog {
    records: Vec<Vec<u8>>,
    closed: bool,
}

/// Producer half of an in-memory stream. Clones append to the same log.
#[derive(Debug, Clone)]
pub struct MemoryStream {
    name: Arc<str>,
    log: Arc<Mutex<MemoryLog>>,
    notify: Arc<Notify>,
}

impl MemoryStream {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            log: Arc::new(Mutex::new(MemoryLog::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Append a record; returns its position.
    pub fn push(&self, payload: impl Into<Vec<u8>>) -> StreamPosition {
        let index = {
            let mut log = self.lock();
            log.records.push(payload.into());
            log.records.len() - 1
        };
        self.notify.notify_one();
        StreamPosition(index.to_string())
    }

    /// Close the stream; readers see `None` after the last record.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A reader positioned at the start of the log.
    pub fn reader(&self) -> MemorySource {
        MemorySource {
            stream: self.clone(),
            cursor: 0,
            batch_size: 16,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Consumer half of a [`MemoryStream`]. Positions are record indexes.
#[derive(Debug)]
pub struct MemorySource {
    stream: MemoryStream,
    cursor: usize,
    batch_size: usize,
}

impl MemorySource {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    fn name(&self) -> &str {
        &self.stream.name
    }

    async fn seek(&mut self, start: StartPosition) -> Result<(), SourceError> {
        self.cursor = match start {
            StartPosition::Earliest => 0,
            StartPosition::Latest => self.stream.len(),
            StartPosition::After(position) => {
                position
                    .as_str()
                    .parse::<usize>()
                    .map_err(|_| SourceError::InvalidPosition(position.0.clone()))?
                    + 1
            }
        };
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<Vec<SourceRecord>>, SourceError> {
        loop {
            let notified = self.stream.notify.notified();
            {
                let log = self.stream.lock();
                if self.cursor < log.records.len() {
                    let end = (self.cursor + self.batch_size).min(log.records.len());
                    let batch = (self.cursor..end)
                        .map(|index| SourceRecord {
                            position: StreamPosition(index.to_string()),
                            payload: log.records[index].clone(),
                        })
                        .collect();
                    self.cursor = end;
                    return Ok(Some(batch));
                }
                if log.closed {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_resolve_start_position() {
        assert_eq!(
            StartPosition::resolve(InitialPosition::Latest, None),
            StartPosition::Latest
        );
        assert_eq!(
            StartPosition::resolve(InitialPosition::Earliest, None),
            StartPosition::Earliest
        );
        let recorded = StreamPosition::new("1700000000000-3");
        assert_eq!(
            StartPosition::resolve(InitialPosition::Latest, Some(recorded.clone())),
            StartPosition::After(recorded)
        );
    }

    #[test]
    fn test_initial_position_from_config_string() {
        #[derive(Deserialize)]
        struct Wrapper {
            position: InitialPosition,
        }
        let parsed: Wrapper = toml::from_str("position = \"earliest\"").unwrap();
        assert_eq!(parsed.position, InitialPosition::Earliest);
    }

    #[tokio::test]
    async fn test_memory_source_reads_in_order_and_closes() {
        let stream = MemoryStream::new("events");
        stream.push("a");
        stream.push("b");
        stream.push("c");

        let mut source = stream.reader().with_batch_size(2);
        source.seek(StartPosition::Earliest).await.unwrap();

        let batch = source.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, b"a");
        assert_eq!(batch[1].position, StreamPosition::new("1"));

        let batch = source.next_batch().await.unwrap().unwrap();
        assert_eq!(batch[0].payload, b"c");

        stream.close();
        assert!(source.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_source_seek_after_and_latest() {
        let stream = MemoryStream::new("events");
        stream.push("a");
        stream.push("b");

        let mut source = stream.reader();
        source
            .seek(StartPosition::After(StreamPosition::new("0")))
            .await
            .unwrap();
        let batch = source.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"b");

        let mut latest = stream.reader();
        latest.seek(StartPosition::Latest).await.unwrap();
        stream.push("c");
        let batch = latest.next_batch().await.unwrap().unwrap();
        assert_eq!(batch[0].payload, b"c");

        assert!(matches!(
            stream
                .reader()
                .seek(StartPosition::After(StreamPosition::new("x")))
                .await,
            Err(SourceError::InvalidPosition(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_source_wakes_on_push() {
        let stream = MemoryStream::new("events");
        let mut source = stream.reader();

        let producer = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push("late");
        });

        let batch = tokio::time::timeout(Duration::from_secs(2), source.next_batch())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].payload, b"late");
    }
}
