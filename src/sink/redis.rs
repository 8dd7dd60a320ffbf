//! Redis Streams output sink.
//!
//! Outputs are appended to the output stream; dropped events go to a sibling
//! stream named `<output>:dropped` for investigation. Both streams are capped
//! with `MAXLEN ~` so they cannot grow without bound.
//!
//! ```text
//! XADD regionjoin:regions MAXLEN ~ 100000 * data '{...}' locationId park-1 region coaster
//! XADD regionjoin:regions:dropped MAXLEN ~ 10000 * data '{...}' reason expired droppedAt ...
//! ```

use async_trait::async_trait;
use deadpool_redis::redis::{pipe, Pipeline};
use deadpool_redis::Pool;
use tracing::{debug, error, info};

use super::{OutputSink, SinkError};
use crate::buffer::DroppedEvent;
use crate::event::RegionEvent;

/// Suffix of the dropped-event stream.
pub const DROPPED_SUFFIX: &str = ":dropped";

/// Default cap of the output stream
const OUTPUT_MAX_LEN: usize = 100_000;

/// Default cap of the dropped-event stream
const DROPPED_MAX_LEN: usize = 10_000;

/// Writes outputs and drop reports to Redis streams.
#[derive(Clone)]
pub struct RedisStreamSink {
    pool: Pool,
    stream: String,
    dropped_stream: String,
    max_len: usize,
}

impl RedisStreamSink {
    pub fn new(pool: Pool, stream: impl Into<String>) -> Self {
        let stream = stream.into();
        Self {
            pool,
            dropped_stream: dropped_stream_name(&stream),
            stream,
            max_len: OUTPUT_MAX_LEN,
        }
    }

    /// Cap the output stream at roughly `max_len` entries.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    async fn run(&self, stream: &str, pipeline: Pipeline) -> Result<(), SinkError> {
        let mut conn = self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for output sink");
            SinkError::Connection(e.to_string())
        })?;

        let _: () = pipeline.query_async(&mut conn).await.map_err(|e| {
            error!(stream = %stream, error = %e, "Failed to append to stream");
            SinkError::Write {
                stream: stream.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(())
    }
}

#[async_trait]
impl OutputSink for RedisStreamSink {
    fn name(&self) -> &str {
        "redis"
    }

    async fn emit(&self, events: &[RegionEvent]) -> Result<(), SinkError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut pipeline = pipe();
        for event in events {
            let data = serde_json::to_string(event)?;
            pipeline
                .cmd("XADD")
                .arg(&self.stream)
                .arg("MAXLEN")
                .arg("~")
                .arg(self.max_len)
                .arg("*")
                .arg("data")
                .arg(&data)
                .arg("locationId")
                .arg(&event.location_id)
                .arg("region")
                .arg(event.region.as_deref().unwrap_or(""))
                .ignore();
        }
        self.run(&self.stream, pipeline).await?;

        debug!(stream = %self.stream, count = events.len(), "Appended region events");
        Ok(())
    }

    async fn report_dropped(&self, dropped: &[DroppedEvent]) -> Result<(), SinkError> {
        if dropped.is_empty() {
            return Ok(());
        }

        let mut pipeline = pipe();
        for entry in dropped {
            let data = serde_json::to_string(&entry.event)?;
            pipeline
                .cmd("XADD")
                .arg(&self.dropped_stream)
                .arg("MAXLEN")
                .arg("~")
                .arg(DROPPED_MAX_LEN)
                .arg("*")
                .arg("data")
                .arg(&data)
                .arg("reason")
                .arg(entry.reason.to_string())
                .arg("enqueuedAt")
                .arg(entry.enqueued_at.to_rfc3339())
                .arg("droppedAt")
                .arg(entry.dropped_at.to_rfc3339())
                .arg("locationId")
                .arg(&entry.event.location_id)
                .ignore();
        }
        self.run(&self.dropped_stream, pipeline).await?;

        info!(
            stream = %self.dropped_stream,
            count = dropped.len(),
            "Dropped events moved to dropped stream"
        );
        Ok(())
    }
}

/// Name of the dropped-event stream for `stream`.
pub fn dropped_stream_name(stream: &str) -> String {
    format!("{stream}{DROPPED_SUFFIX}")
}
