//! Redis Streams source.
//!
//! Reads one stream with `XREAD BLOCK`, without a consumer group: the engine
//! owns the read position and stores it in checkpoints, so the stream id of the
//! last dispatched record is all that is needed to resume.
//!
//! Each stream entry carries the raw record in its `data` field:
//!
//! ```text
//! XADD regionjoin:locations * data '{"type":"location",...}'
//! ```
//!
//! Blocking reads run on a connection detached from the pool. A read that is
//! dropped mid-flight closes that connection with it instead of handing a
//! connection with an unread reply back to the pool; the next read opens a
//! fresh one.

use async_trait::async_trait;
use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::aio::MultiplexedConnection;
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::{Connection, Pool};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{RecordSource, SourceError, SourceRecord, StartPosition, StreamPosition};

/// Stream entry field holding the record payload.
pub const DATA_FIELD: &str = "data";

/// Id before the first entry of any stream.
const STREAM_START: &str = "0-0";

const DEFAULT_BLOCK_MS: usize = 2000;
const DEFAULT_BATCH: usize = 100;

/// A [`RecordSource`] over one Redis stream.
pub struct RedisStreamSource {
    pool: Pool,
    /// Dedicated to `XREAD BLOCK`; `None` until the first read or after an error
    reader: Option<MultiplexedConnection>,
    stream: String,
    last_id: String,
    block_ms: usize,
    count: usize,
}

impl RedisStreamSource {
    pub fn new(pool: Pool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            reader: None,
            stream: stream.into(),
            last_id: STREAM_START.to_string(),
            block_ms: DEFAULT_BLOCK_MS,
            count: DEFAULT_BATCH,
        }
    }

    /// How long one read blocks waiting for entries.
    pub fn with_block_ms(mut self, block_ms: usize) -> Self {
        self.block_ms = block_ms;
        self
    }

    /// Maximum entries per read.
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count.max(1);
        self
    }

    async fn connection(&self) -> Result<Connection, SourceError> {
        self.pool
            .get()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))
    }

    /// The blocking-read connection, taken out of `self` for one read.
    async fn take_reader(&mut self) -> Result<MultiplexedConnection, SourceError> {
        match self.reader.take() {
            Some(conn) => Ok(conn),
            None => {
                let conn = Connection::take(self.connection().await?);
                debug!(stream = %self.stream, "Opened dedicated read connection");
                Ok(conn)
            }
        }
    }

    fn read_error(&self, e: impl ToString) -> SourceError {
        SourceError::Read {
            stream: self.stream.clone(),
            message: e.to_string(),
        }
    }

    /// Id of the newest entry, or the stream start when it is empty.
    async fn newest_id(&self) -> Result<String, SourceError> {
        let mut conn = self.connection().await?;
        let entries: Vec<(String, HashMap<String, RedisValue>)> = cmd("XREVRANGE")
            .arg(&self.stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.read_error(e))?;

        Ok(entries
            .into_iter()
            .next()
            .map(|(id, _)| id)
            .unwrap_or_else(|| STREAM_START.to_string()))
    }
}

#[async_trait]
impl RecordSource for RedisStreamSource {
    fn name(&self) -> &str {
        &self.stream
    }

    async fn seek(&mut self, start: StartPosition) -> Result<(), SourceError> {
        self.last_id = match start {
            StartPosition::Earliest => STREAM_START.to_string(),
            StartPosition::Latest => self.newest_id().await?,
            StartPosition::After(position) => {
                if !is_stream_id(position.as_str()) {
                    return Err(SourceError::InvalidPosition(position.0));
                }
                position.0
            }
        };
        debug!(stream = %self.stream, last_id = %self.last_id, "Positioned stream source");
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<Vec<SourceRecord>>, SourceError> {
        let mut conn = self.take_reader().await?;
        let opts = StreamReadOptions::default()
            .block(self.block_ms)
            .count(self.count);

        let reply: StreamReadReply = match conn
            .xread_options(&[&self.stream], &[&self.last_id], &opts)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                let err_str = e.to_string();
                // An empty blocking read can surface as a nil reply
                if err_str.contains("timed out") || err_str.contains("response was nil") {
                    self.reader = Some(conn);
                    return Ok(Some(Vec::new()));
                }
                // conn is dropped; the next read reconnects
                return Err(self.read_error(e));
            }
        };
        self.reader = Some(conn);

        let mut batch = Vec::new();
        for stream_key in reply.keys {
            for element in stream_key.ids {
                let payload = field_bytes(&element.map, DATA_FIELD).unwrap_or_else(|| {
                    warn!(stream = %self.stream, id = %element.id, "Stream entry has no data field");
                    Vec::new()
                });
                self.last_id = element.id.clone();
                batch.push(SourceRecord {
                    position: StreamPosition(element.id),
                    payload,
                });
            }
        }
        Ok(Some(batch))
    }
}

/// Extract a field's raw bytes from a stream entry.
fn field_bytes(map: &HashMap<String, RedisValue>, key: &str) -> Option<Vec<u8>> {
    match map.get(key)? {
        RedisValue::BulkString(bytes) => Some(bytes.clone()),
        RedisValue::SimpleString(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

/// `<ms>-<seq>`
fn is_stream_id(id: &str) -> bool {
    match id.split_once('-') {
        Some((ms, seq)) => {
            !ms.is_empty()
                && !seq.is_empty()
                && ms.bytes().all(|b| b.is_ascii_digit())
                && seq.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_validation() {
        assert!(is_stream_id("1700000000000-0"));
        assert!(is_stream_id("0-0"));
        assert!(!is_stream_id("17"));
        assert!(!is_stream_id("abc-1"));
        assert!(!is_stream_id("-1"));
    }

    #[test]
    fn test_field_bytes() {
        let mut map = HashMap::new();
        map.insert(
            DATA_FIELD.to_string(),
            RedisValue::BulkString(br#"{"type":"watermark"}"#.to_vec()),
        );
        map.insert("other".to_string(), RedisValue::Int(3));

        assert_eq!(
            field_bytes(&map, DATA_FIELD).unwrap(),
            br#"{"type":"watermark"}"#.to_vec()
        );
        assert!(field_bytes(&map, "other").is_none());
        assert!(field_bytes(&map, "missing").is_none());
    }

    #[tokio::test]
    async fn test_failed_read_leaves_no_dedicated_connection() {
        use deadpool_redis::{Config, Runtime};

        // Nothing listens on port 1
        let pool = Config::from_url("redis://127.0.0.1:1")
            .create_pool(Some(Runtime::Tokio1))
            .unwrap();
        let mut source = RedisStreamSource::new(pool.clone(), "regionjoin:locations");

        let result = source.next_batch().await;
        assert!(matches!(result, Err(SourceError::Connection(_))));
        assert!(source.reader.is_none());
        assert_eq!(pool.status().size, 0);
    }
}
