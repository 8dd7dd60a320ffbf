//! Reference data: region definitions and the changelog that mutates them.
//!
//! A [`RegionDefinition`] describes the geofenced area of one location as one
//! or more named [`Zone`]s, each an ordered set of geohash cells. Definitions
//! change through [`ReferenceUpdate`]s read from the Reference-Data Source.
//!
//! Two changelog encodings are accepted (see [`ReferenceFormat`]):
//!
//! ```json
//! {"location_id": "park-1", "operation": "upsert", "sequence": 7,
//!  "definition": {"cells": ["djjc"], "zones": {"coaster": ["djjcxt"]}}}
//! {"location_id": "park-1", "operation": "remove", "sequence": 8}
//! ```
//!
//! and DynamoDB Streams change records whose images carry `locationId` plus a
//! `region` list of cells.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::event::DecodeError;
use crate::geohash;

/// Changelog sequence number.
///
/// DynamoDB Streams sequence numbers are up to 40 decimal digits, hence 128 bits.
pub type SequenceNumber = u128;

/// Kind of changelog mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateOp {
    Upsert,
    Remove,
}

/// A named sub-region of a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    /// Identifier reported in the output's `region` field
    pub region_id: String,

    /// Geohash cells covering the zone
    pub cells: BTreeSet<String>,

    /// Sequence number of the update that last changed this zone's cells
    #[serde(default)]
    pub version: SequenceNumber,
}

/// The geofence of one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDefinition {
    pub location_id: String,

    /// Sequence number of the update that produced this definition
    pub version: SequenceNumber,

    /// Zones ordered by region id
    pub zones: Vec<Zone>,
}

impl RegionDefinition {
    /// A definition with a single zone named after the location.
    pub fn new<I, S>(
        location_id: impl Into<String>,
        version: SequenceNumber,
        cells: I,
    ) -> Result<Self, DecodeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let location_id = location_id.into();
        let zone = (location_id.clone(), cells);
        Self::with_zones(location_id, version, [zone])
    }

    /// A definition made of named zones.
    pub fn with_zones<Z, I, S>(
        location_id: impl Into<String>,
        version: SequenceNumber,
        zones: Z,
    ) -> Result<Self, DecodeError>
    where
        Z: IntoIterator<Item = (String, I)>,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let location_id = location_id.into();
        let mut merged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (region_id, cells) in zones {
            let entry = merged.entry(region_id).or_default();
            for cell in cells {
                entry.insert(geohash::normalize_cell(cell.as_ref())?);
            }
        }
        merged.retain(|_, cells| !cells.is_empty());
        if merged.is_empty() {
            return Err(DecodeError::Invalid(format!(
                "definition for '{location_id}' has no cells"
            )));
        }

        let zones = merged
            .into_iter()
            .map(|(region_id, cells)| Zone {
                region_id,
                cells,
                version,
            })
            .collect();

        Ok(Self {
            location_id,
            version,
            zones,
        })
    }

    /// Precision a coordinate must be encoded at to be tested against this
    /// definition: the longest cell across all zones.
    pub fn precision(&self) -> usize {
        self.zones
            .iter()
            .flat_map(|zone| zone.cells.iter())
            .map(String::len)
            .max()
            .unwrap_or(0)
    }

    pub fn zone(&self, region_id: &str) -> Option<&Zone> {
        self.zones.iter().find(|zone| zone.region_id == region_id)
    }

    /// Stamp this definition with `version`, keeping the older version of
    /// every zone whose cells are unchanged since `previous`.
    pub(crate) fn stamp(&mut self, version: SequenceNumber, previous: Option<&RegionDefinition>) {
        self.version = version;
        for zone in &mut self.zones {
            zone.version = previous
                .and_then(|prev| prev.zone(&zone.region_id))
                .filter(|prev_zone| prev_zone.cells == zone.cells)
                .map(|prev_zone| prev_zone.version)
                .unwrap_or(version);
        }
    }

    /// Parse a bulk seed file: a JSON array of `{location_id, cells, zones}`.
    ///
    /// Seed definitions carry version 0. They sit below the changelog rather
    /// than in it: see [`Replica::seed`](crate::replica::Replica::seed).
    pub fn parse_seed(bytes: &[u8]) -> Result<Vec<Self>, DecodeError> {
        let entries: Vec<SeedEntry> = serde_json::from_slice(bytes)?;
        entries
            .into_iter()
            .map(|entry| entry.body.into_definition(entry.location_id, 0))
            .collect()
    }
}

/// The change carried by a [`ReferenceUpdate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceChange {
    Upsert(RegionDefinition),
    Remove,
}

/// One entry of the reference changelog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceUpdate {
    pub location_id: String,
    pub sequence: SequenceNumber,
    pub change: ReferenceChange,
}

impl ReferenceUpdate {
    /// Upsert of a single-zone definition.
    pub fn upsert<I, S>(
        location_id: impl Into<String>,
        sequence: SequenceNumber,
        cells: I,
    ) -> Result<Self, DecodeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let definition = RegionDefinition::new(location_id, sequence, cells)?;
        Ok(Self::from_definition(definition, sequence))
    }

    pub fn from_definition(definition: RegionDefinition, sequence: SequenceNumber) -> Self {
        Self {
            location_id: definition.location_id.clone(),
            sequence,
            change: ReferenceChange::Upsert(definition),
        }
    }

    /// Tombstone for `location_id`.
    pub fn remove(location_id: impl Into<String>, sequence: SequenceNumber) -> Self {
        Self {
            location_id: location_id.into(),
            sequence,
            change: ReferenceChange::Remove,
        }
    }

    pub fn op(&self) -> UpdateOp {
        match self.change {
            ReferenceChange::Upsert(_) => UpdateOp::Upsert,
            ReferenceChange::Remove => UpdateOp::Remove,
        }
    }

    /// Encode in the native changelog format.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let definition = match &self.change {
            ReferenceChange::Upsert(definition) => Some(DefinitionBody {
                cells: Vec::new(),
                zones: definition
                    .zones
                    .iter()
                    .map(|zone| {
                        let cells = zone.cells.iter().cloned().collect::<Vec<_>>();
                        (zone.region_id.clone(), cells)
                    })
                    .collect(),
            }),
            ReferenceChange::Remove => None,
        };
        serde_json::to_vec(&ChangelogRecord {
            location_id: self.location_id.clone(),
            operation: self.op(),
            definition,
            sequence: self.sequence,
        })
    }
}

/// Wire encoding used by the Reference-Data Source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceFormat {
    /// Native `{location_id, operation, definition, sequence}` records
    #[default]
    Changelog,
    /// DynamoDB Streams change records (`NEW_IMAGE` or `NEW_AND_OLD_IMAGES` view)
    DynamoDb,
}

impl ReferenceFormat {
    pub fn decode(&self, bytes: &[u8]) -> Result<ReferenceUpdate, DecodeError> {
        match self {
            ReferenceFormat::Changelog => decode_changelog(bytes),
            ReferenceFormat::DynamoDb => decode_stream_record(bytes),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ChangelogRecord {
    location_id: String,
    operation: UpdateOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    definition: Option<DefinitionBody>,
    sequence: SequenceNumber,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DefinitionBody {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    cells: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    zones: BTreeMap<String, Vec<String>>,
}

impl DefinitionBody {
    fn into_definition(
        self,
        location_id: String,
        version: SequenceNumber,
    ) -> Result<RegionDefinition, DecodeError> {
        let mut zones = self.zones;
        if !self.cells.is_empty() {
            zones
                .entry(location_id.clone())
                .or_default()
                .extend(self.cells);
        }
        RegionDefinition::with_zones(location_id, version, zones)
    }
}

#[derive(Debug, Deserialize)]
struct SeedEntry {
    location_id: String,
    #[serde(flatten)]
    body: DefinitionBody,
}

fn decode_changelog(bytes: &[u8]) -> Result<ReferenceUpdate, DecodeError> {
    let record: ChangelogRecord = serde_json::from_slice(bytes)?;
    if record.location_id.is_empty() {
        return Err(DecodeError::Invalid("changelog record has empty location_id".into()));
    }

    match record.operation {
        UpdateOp::Upsert => {
            let body = record.definition.ok_or_else(|| {
                DecodeError::Invalid(format!(
                    "upsert for '{}' carries no definition",
                    record.location_id
                ))
            })?;
            let definition = body.into_definition(record.location_id, record.sequence)?;
            Ok(ReferenceUpdate::from_definition(definition, record.sequence))
        }
        UpdateOp::Remove => Ok(ReferenceUpdate::remove(record.location_id, record.sequence)),
    }
}

const KEY_ATTRIBUTE: &str = "locationId";
const REGION_ATTRIBUTE: &str = "region";
const ZONES_ATTRIBUTE: &str = "zones";

fn decode_stream_record(bytes: &[u8]) -> Result<ReferenceUpdate, DecodeError> {
    let record: Value = serde_json::from_slice(bytes)?;
    let invalid = |msg: &str| DecodeError::Invalid(format!("stream record {msg}"));

    let event_name = record
        .get("eventName")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("has no eventName"))?;
    let body = record
        .get("dynamodb")
        .ok_or_else(|| invalid("has no dynamodb section"))?;
    let sequence = body
        .get("SequenceNumber")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<SequenceNumber>().ok())
        .ok_or_else(|| invalid("has no numeric SequenceNumber"))?;
    let location_id = body
        .get("Keys")
        .and_then(|keys| keys.get(KEY_ATTRIBUTE))
        .and_then(string_attribute)
        .ok_or_else(|| invalid("has no locationId key"))?
        .to_string();

    match event_name {
        "REMOVE" => Ok(ReferenceUpdate::remove(location_id, sequence)),
        "INSERT" | "MODIFY" => {
            let image = body
                .get("NewImage")
                .ok_or_else(|| invalid("has no NewImage; the stream view must include new images"))?;

            let mut zones: BTreeMap<String, Vec<String>> = BTreeMap::new();
            if let Some(cells) = image.get(REGION_ATTRIBUTE).and_then(cell_list_attribute) {
                zones.insert(location_id.clone(), cells);
            }
            if let Some(map) = image
                .get(ZONES_ATTRIBUTE)
                .and_then(|zones| zones.get("M"))
                .and_then(Value::as_object)
            {
                for (region_id, attr) in map {
                    let cells = cell_list_attribute(attr)
                        .ok_or_else(|| invalid(&format!("zone '{region_id}' is not a cell list")))?;
                    zones.insert(region_id.clone(), cells);
                }
            }

            let definition = RegionDefinition::with_zones(location_id, sequence, zones)?;
            Ok(ReferenceUpdate::from_definition(definition, sequence))
        }
        other => Err(invalid(&format!("has unsupported eventName '{other}'"))),
    }
}

/// `{"S": "..."}`
fn string_attribute(attr: &Value) -> Option<&str> {
    attr.get("S").and_then(Value::as_str)
}

/// `{"SS": [...]}` or `{"L": [{"S": ...}, ...]}`
fn cell_list_attribute(attr: &Value) -> Option<Vec<String>> {
    if let Some(set) = attr.get("SS").and_then(Value::as_array) {
        return set
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect();
    }
    attr.get("L").and_then(Value::as_array).and_then(|list| {
        list.iter()
            .map(|item| string_attribute(item).map(str::to_string))
            .collect()
    })
}
