//! Log Sink - Structured logging of join outputs.
//!
//! The [`LogSink`] writes every [`RegionEvent`] through `tracing`. Useful when
//! running the engine without an output stream, and for auditing.
//!
//! # Example
//!
//! ```rust,ignore
//! use regionjoin::sink::LogSink;
//!
//! let sink = LogSink::new();
//! // or with custom prefix
//! let sink = LogSink::with_prefix("audit");
//! ```

use super::{OutputSink, SinkError};
use crate::buffer::DroppedEvent;
use crate::event::RegionEvent;
use async_trait::async_trait;
use tracing::{info, warn};

/// A sink that logs outputs using structured logging.
#[derive(Debug, Clone)]
pub struct LogSink {
    /// Prefix for log messages
    prefix: String,
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            prefix: "region".to_string(),
        }
    }

    /// The prefix appears in log messages, useful for telling several
    /// engines apart in one log stream
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutputSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn emit(&self, events: &[RegionEvent]) -> Result<(), SinkError> {
        for event in events {
            info!(
                prefix = %self.prefix,
                location_id = %event.location_id,
                entitlement_id = %event.entitlement_id,
                detail_type = %event.detail_type,
                region = event.region.as_deref().unwrap_or("-"),
                time = %event.time,
                "[{}] {}/{} -> {}",
                self.prefix,
                event.location_id,
                event.entitlement_id,
                event.region.as_deref().unwrap_or("no region")
            );
        }
        Ok(())
    }

    async fn report_dropped(&self, dropped: &[DroppedEvent]) -> Result<(), SinkError> {
        for entry in dropped {
            warn!(
                prefix = %self.prefix,
                location_id = %entry.event.location_id,
                entitlement_id = %entry.event.entitlement_id,
                reason = %entry.reason,
                enqueued_at = %entry.enqueued_at,
                "[{}] Dropped event for {}",
                self.prefix,
                entry.event.location_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DropReason;
    use crate::event::LocationEvent;
    use chrono::{TimeZone, Utc};

    fn event() -> LocationEvent {
        LocationEvent::new("park-1", "ticket-42", "guest.position", Utc.timestamp_opt(0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_log_sink() {
        let sink = LogSink::new();
        assert_eq!(sink.name(), "log");
        assert_eq!(sink.prefix(), "region");

        let outputs = [
            RegionEvent::from_match(&event(), Some("coaster".into())),
            RegionEvent::from_match(&event(), None),
        ];
        assert!(sink.emit(&outputs).await.is_ok());
    }

    #[tokio::test]
    async fn test_log_sink_reports_drops() {
        let sink = LogSink::with_prefix("audit");
        assert_eq!(sink.prefix(), "audit");

        let dropped = DroppedEvent {
            event: event(),
            reason: DropReason::Expired,
            enqueued_at: Utc.timestamp_opt(0, 0).unwrap(),
            dropped_at: Utc.timestamp_opt(5, 0).unwrap(),
        };
        assert!(sink.report_dropped(&[dropped]).await.is_ok());
    }
}
