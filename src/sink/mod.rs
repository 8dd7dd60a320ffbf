//! Output sinks for the region join.
//!
//! A worker hands its outputs to an [`OutputSink`] right after matching, in
//! emission order. The sink also receives reports of events the engine gave up
//! on, so a downstream consumer can see every input accounted for.
//!
//! ## Built-in Sinks
//!
//! - [`LogSink`]: structured logging of outputs (useful for debugging)
//! - [`RedisStreamSink`]: `XADD` to an output stream plus a dropped-event stream
//! - [`CollectingSink`]: keeps everything in memory for tests and embedding
//!
//! ## Creating Custom Sinks
//!
//! ```rust,ignore
//! use regionjoin::sink::{OutputSink, SinkError};
//! use regionjoin::RegionEvent;
//! use async_trait::async_trait;
//!
//! struct MySink;
//!
//! #[async_trait]
//! impl OutputSink for MySink {
//!     fn name(&self) -> &str {
//!         "my-sink"
//!     }
//!
//!     async fn emit(&self, events: &[RegionEvent]) -> Result<(), SinkError> {
//!         // Deliver the batch
//!         Ok(())
//!     }
//! }
//! ```

pub mod log;
pub mod redis;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

use crate::buffer::DroppedEvent;
use crate::event::RegionEvent;

pub use self::log::LogSink;
pub use self::redis::RedisStreamSink;

/// Errors that can occur while delivering outputs.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Could not obtain a connection
    #[error("connection error: {0}")]
    Connection(String),

    /// The transport rejected a write
    #[error("write to '{stream}' failed: {message}")]
    Write { stream: String, message: String },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Destination of join outputs.
///
/// Sinks are shared by all workers and must be `Send + Sync`. Calls for one
/// key always come from the same worker, in emission order.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Returns the unique name of this sink (e.g., "log", "redis")
    fn name(&self) -> &str;

    /// Deliver a batch of outputs.
    async fn emit(&self, events: &[RegionEvent]) -> Result<(), SinkError>;

    /// Report events dropped by buffer eviction. Ignored by default.
    async fn report_dropped(&self, _dropped: &[DroppedEvent]) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Collected {
    emitted: Vec<RegionEvent>,
    dropped: Vec<DroppedEvent>,
}

/// In-memory sink. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    inner: Arc<Mutex<Collected>>,
    notify: Arc<Notify>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> Vec<RegionEvent> {
        self.lock().emitted.clone()
    }

    pub fn dropped(&self) -> Vec<DroppedEvent> {
        self.lock().dropped.clone()
    }

    /// Wait until at least `count` outputs were emitted, or `timeout` passes.
    /// Returns whether the count was reached.
    pub async fn wait_for_emitted(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |collected| collected.emitted.len() >= count)
            .await
    }

    /// Wait until at least `count` drops were reported, or `timeout` passes.
    pub async fn wait_for_dropped(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |collected| collected.dropped.len() >= count)
            .await
    }

    async fn wait_until(&self, timeout: Duration, done: impl Fn(&Collected) -> bool) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if done(&self.lock()) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Collected> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl OutputSink for CollectingSink {
    fn name(&self) -> &str {
        "collect"
    }

    async fn emit(&self, events: &[RegionEvent]) -> Result<(), SinkError> {
        self.lock().emitted.extend_from_slice(events);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn report_dropped(&self, dropped: &[DroppedEvent]) -> Result<(), SinkError> {
        self.lock().dropped.extend_from_slice(dropped);
        self.notify.notify_waiters();
        Ok(())
    }
}
