//! Core event types for the region-join engine.
//!
//! The Event Source delivers JSON records carrying a `type` discriminator:
//! `location` records decode to [`LocationEvent`], `watermark` records to
//! [`WatermarkEvent`]. Both arrive as variants of [`SourceEvent`]. The engine
//! answers every location event with one [`RegionEvent`] once its key is
//! resolved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::geohash::{Coordinate, GeohashError};

/// Errors raised while decoding source records.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record does not define a type field")]
    MissingType,

    #[error("unsupported event type: {0}")]
    UnknownType(String),

    #[error("detail payload carries no coordinate")]
    MissingCoordinate,

    #[error("invalid coordinate: {0}")]
    Coordinate(#[from] GeohashError),

    #[error("invalid record: {0}")]
    Invalid(String),
}

/// A record delivered by the Event Source, dispatched on its `type` field.
///
/// # Example
///
/// ```json
/// {
///   "type": "location",
///   "location_id": "park-1",
///   "entitlement_id": "ticket-42",
///   "detail_type": "guest.position",
///   "time": "2024-06-01T10:00:00Z",
///   "detail": "{\"latitude\": 28.4193, \"longitude\": -81.5775}"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceEvent {
    Location(LocationEvent),
    Watermark(WatermarkEvent),
}

impl SourceEvent {
    /// Decode a raw record, rejecting a missing or unknown discriminator.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?;

        match kind {
            "location" | "watermark" => Ok(serde_json::from_value(value)?),
            other => Err(DecodeError::UnknownType(other.to_string())),
        }
    }

    /// Serialize back into the wire format.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Event-time timestamp carried by the record.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SourceEvent::Location(event) => event.time,
            SourceEvent::Watermark(mark) => mark.watermark,
        }
    }
}

/// A guest position report keyed by location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationEvent {
    /// Partition key; joins against the region definition of the same id
    pub location_id: String,

    /// Entitlement (ticket, wristband) that produced the event
    pub entitlement_id: String,

    /// Free-form event classification, copied to the output
    pub detail_type: String,

    /// Event time
    pub time: DateTime<Utc>,

    /// Raw detail payload carrying `latitude`/`longitude`, either as an
    /// object or as a JSON-encoded string
    #[serde(default)]
    pub detail: Value,
}

impl LocationEvent {
    /// Create a location event with an empty detail payload.
    pub fn new(
        location_id: impl Into<String>,
        entitlement_id: impl Into<String>,
        detail_type: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            location_id: location_id.into(),
            entitlement_id: entitlement_id.into(),
            detail_type: detail_type.into(),
            time,
            detail: Value::Null,
        }
    }

    /// Set the raw detail payload
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    /// Set the detail payload to the given coordinate
    pub fn with_coordinate(self, coordinate: Coordinate) -> Self {
        self.with_detail(json!({
            "latitude": coordinate.latitude,
            "longitude": coordinate.longitude,
        }))
    }

    /// Extract the coordinate from the detail payload.
    pub fn coordinate(&self) -> Result<Coordinate, DecodeError> {
        match &self.detail {
            Value::Object(_) => coordinate_from(&self.detail),
            Value::String(raw) => {
                let parsed: Value = serde_json::from_str(raw)?;
                coordinate_from(&parsed)
            }
            _ => Err(DecodeError::MissingCoordinate),
        }
    }
}

fn coordinate_from(detail: &Value) -> Result<Coordinate, DecodeError> {
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| detail.get(*name).and_then(Value::as_f64))
    };
    let latitude = field(&["latitude", "lat"]).ok_or(DecodeError::MissingCoordinate)?;
    let longitude = field(&["longitude", "lon", "lng"]).ok_or(DecodeError::MissingCoordinate)?;
    Ok(Coordinate::new(latitude, longitude)?)
}

/// Declares that no future event will carry an earlier timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkEvent {
    pub watermark: DateTime<Utc>,
}

impl WatermarkEvent {
    pub fn new(watermark: DateTime<Utc>) -> Self {
        Self { watermark }
    }
}

/// Output of the join: a location event annotated with its region.
///
/// `region` is `None` when the location's definition was known but the
/// coordinate fell outside every zone. It serializes as an explicit `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEvent {
    pub location_id: String,
    pub entitlement_id: String,
    pub detail_type: String,

    /// Matched region identifier, `None` marks "no region"
    pub region: Option<String>,

    /// Original event time
    pub time: DateTime<Utc>,
}

impl RegionEvent {
    /// Build the output for `event` with the matcher's verdict.
    pub fn from_match(event: &LocationEvent, region: Option<String>) -> Self {
        Self {
            location_id: event.location_id.clone(),
            entitlement_id: event.entitlement_id.clone(),
            detail_type: event.detail_type.clone(),
            region,
            time: event.time,
        }
    }

    /// True when the coordinate matched no zone.
    pub fn is_unmatched(&self) -> bool {
        self.region.is_none()
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_decode_location() {
        let raw = br#"{
            "type": "location",
            "location_id": "park-1",
            "entitlement_id": "ticket-42",
            "detail_type": "guest.position",
            "time": "2024-06-01T10:00:00Z",
            "detail": "{\"latitude\": 28.4193, \"longitude\": -81.5775}"
        }"#;

        let event = SourceEvent::decode(raw).unwrap();
        let SourceEvent::Location(location) = event else {
            panic!("expected location event");
        };
        assert_eq!(location.location_id, "park-1");
        assert_eq!(location.entitlement_id, "ticket-42");
        assert_eq!(location.time.to_rfc3339(), "2024-06-01T10:00:00+00:00");

        let coordinate = location.coordinate().unwrap();
        assert!((coordinate.latitude - 28.4193).abs() < 1e-9);
        assert!((coordinate.longitude + 81.5775).abs() < 1e-9);
    }

    #[test]
    fn test_decode_watermark() {
        let raw = br#"{"type": "watermark", "watermark": "2024-06-01T10:00:05Z"}"#;
        let event = SourceEvent::decode(raw).unwrap();
        assert!(matches!(event, SourceEvent::Watermark(_)));
        assert_eq!(event.timestamp().to_rfc3339(), "2024-06-01T10:00:05+00:00");
    }

    #[test]
    fn test_decode_missing_type() {
        let raw = br#"{"location_id": "park-1"}"#;
        assert!(matches!(
            SourceEvent::decode(raw),
            Err(DecodeError::MissingType)
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        let raw = br#"{"type": "heartbeat"}"#;
        match SourceEvent::decode(raw) {
            Err(DecodeError::UnknownType(kind)) => assert_eq!(kind, "heartbeat"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_decode_malformed_payload() {
        assert!(matches!(
            SourceEvent::decode(b"not json"),
            Err(DecodeError::Json(_))
        ));
        // Known type, missing fields
        assert!(matches!(
            SourceEvent::decode(br#"{"type": "location", "location_id": "x"}"#),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_coordinate_from_object_and_aliases() {
        let event = LocationEvent::new("a", "e", "t", ts(0))
            .with_detail(json!({"lat": 10.0, "lng": -155.5}));
        let coordinate = event.coordinate().unwrap();
        assert_eq!(coordinate.latitude, 10.0);
        assert_eq!(coordinate.longitude, -155.5);
    }

    #[test]
    fn test_coordinate_missing() {
        let event = LocationEvent::new("a", "e", "t", ts(0));
        assert!(matches!(
            event.coordinate(),
            Err(DecodeError::MissingCoordinate)
        ));

        let event = event.with_detail(json!({"latitude": 91.0, "longitude": 0.0}));
        assert!(matches!(event.coordinate(), Err(DecodeError::Coordinate(_))));
    }

    #[test]
    fn test_region_event_serializes_no_region_marker() {
        let event = LocationEvent::new("park-1", "ticket-42", "guest.position", ts(60));
        let output = RegionEvent::from_match(&event, None);
        assert!(output.is_unmatched());

        let json: Value = serde_json::from_slice(&output.encode().unwrap()).unwrap();
        assert_eq!(json["region"], Value::Null);
        assert!(json.as_object().unwrap().contains_key("region"));
        assert_eq!(json["location_id"], "park-1");
    }

    #[test]
    fn test_source_event_encode_carries_discriminator() {
        let event = SourceEvent::Watermark(WatermarkEvent::new(ts(5)));
        let json: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "watermark");
    }
}
