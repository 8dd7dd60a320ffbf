//! Spatial Matcher - point-in-geofence tests against a region definition.
//!
//! The coordinate is encoded at the definition's precision; it lies in a zone
//! when that cell or any coarser prefix of it appears in the zone's cell set.
//!
//! # Ambiguity
//!
//! Zones of one location may overlap. When several contain the point, the
//! zone updated most recently (highest version) wins, and equal versions fall
//! back to the smallest region id:
//!
//! ```text
//! zone     | cells  | version
//! ---------|--------|--------
//! east     | djj    | 4
//! coaster  | djjcxt | 9      <- a point in djjcxt matches "coaster"
//! ```

use std::cmp::Ordering;

use crate::geohash::{self, Coordinate};
use crate::reference::{RegionDefinition, Zone};

/// Region id of the zone containing `coordinate`, or `None` when the point
/// lies outside every zone.
pub fn matches<'a>(coordinate: &Coordinate, definition: &'a RegionDefinition) -> Option<&'a str> {
    containing_zones(coordinate, definition)
        .into_iter()
        .max_by(|a, b| precedence(a, b))
        .map(|zone| zone.region_id.as_str())
}

/// All zones of `definition` containing `coordinate`, in definition order.
pub fn containing_zones<'a>(coordinate: &Coordinate, definition: &'a RegionDefinition) -> Vec<&'a Zone> {
    let precision = definition.precision();
    if precision == 0 {
        return Vec::new();
    }
    let Ok(cell) = geohash::encode(*coordinate, precision) else {
        return Vec::new();
    };

    definition
        .zones
        .iter()
        .filter(|zone| geohash::ancestors(&cell).any(|prefix| zone.cells.contains(prefix)))
        .collect()
}

/// Greater means higher precedence.
fn precedence(a: &Zone, b: &Zone) -> Ordering {
    a.version
        .cmp(&b.version)
        .then_with(|| b.region_id.cmp(&a.region_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(cell: &str) -> Coordinate {
        geohash::center(cell).unwrap()
    }

    fn zoned(zones: &[(&str, &[&str], u128)]) -> RegionDefinition {
        let mut definition = RegionDefinition::with_zones(
            "park",
            1,
            zones
                .iter()
                .map(|(id, cells, _)| (id.to_string(), cells.to_vec())),
        )
        .unwrap();
        for (id, _, version) in zones {
            let zone = definition
                .zones
                .iter_mut()
                .find(|zone| zone.region_id == *id)
                .unwrap();
            zone.version = *version;
        }
        definition
    }

    #[test]
    fn test_match_exact_cell() {
        let definition = RegionDefinition::new("A", 1, ["89c2"]).unwrap();
        assert_eq!(matches(&at("89c2"), &definition), Some("A"));
        assert_eq!(matches(&at("89c3"), &definition), None);
    }

    #[test]
    fn test_match_through_ancestor_prefix() {
        // A coarse cell contains every finer cell below it
        let definition = zoned(&[("east", &["djj"], 1), ("coaster", &["djjcxt"], 1)]);
        assert_eq!(definition.precision(), 6);
        assert_eq!(matches(&at("djjcxs"), &definition), Some("east"));
        assert_eq!(matches(&at("dhvzzz"), &definition), None);
    }

    #[test]
    fn test_ambiguity_most_recent_zone_wins() {
        let definition = zoned(&[("east", &["djj"], 4), ("coaster", &["djjcxt"], 9)]);
        let point = at("djjcxt");

        assert_eq!(containing_zones(&point, &definition).len(), 2);
        assert_eq!(matches(&point, &definition), Some("coaster"));

        let definition = zoned(&[("east", &["djj"], 12), ("coaster", &["djjcxt"], 9)]);
        assert_eq!(matches(&point, &definition), Some("east"));
    }

    #[test]
    fn test_ambiguity_tie_breaks_on_region_id() {
        let definition = zoned(&[("west", &["djjc"], 3), ("alpha", &["djj"], 3)]);
        assert_eq!(matches(&at("djjc"), &definition), Some("alpha"));
    }
}
