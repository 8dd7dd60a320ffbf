//! Geohash spatial index cells.
//!
//! A cell is the base32 geohash of a coordinate at a fixed precision, as
//! produced by the `geohash` crate. Every
//! cell is strictly contained in the cells named by its prefixes, so testing
//! whether a point lies in a coarse cell reduces to a prefix comparison.
//!
//! ```text
//! precision | cell size (approx.)
//! ----------|--------------------
//! 4         | 39 km x 19.5 km
//! 6         | 1.2 km x 0.6 km
//! 8         | 38 m x 19 m
//! ```

use ::geohash::Coord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest geohash accepted for a cell.
pub const MAX_PRECISION: usize = 12;

/// Errors raised while encoding coordinates or parsing cells.
#[derive(Debug, Error, PartialEq)]
pub enum GeohashError {
    #[error("invalid geohash character '{0}'")]
    InvalidCharacter(char),

    #[error("geohash precision must be between 1 and {MAX_PRECISION}, got {0}")]
    InvalidPrecision(usize),

    #[error("coordinate out of range: latitude {latitude}, longitude {longitude}")]
    OutOfRange { latitude: f64, longitude: f64 },
}

/// A WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// Create a coordinate, rejecting values outside the WGS84 ranges.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, GeohashError> {
        let in_range = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        if !in_range {
            return Err(GeohashError::OutOfRange {
                latitude,
                longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

/// Latitude/longitude bounds of a cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellBounds {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

impl CellBounds {
    /// Center point of the cell.
    pub fn center(&self) -> Coordinate {
        Coordinate {
            latitude: (self.min_latitude + self.max_latitude) / 2.0,
            longitude: (self.min_longitude + self.max_longitude) / 2.0,
        }
    }
}

/// Encode a coordinate into its cell at the given precision.
pub fn encode(coordinate: Coordinate, precision: usize) -> Result<String, GeohashError> {
    if precision == 0 || precision > MAX_PRECISION {
        return Err(GeohashError::InvalidPrecision(precision));
    }
    let Coordinate {
        latitude,
        longitude,
    } = Coordinate::new(coordinate.latitude, coordinate.longitude)?;

    ::geohash::encode(
        Coord {
            x: longitude,
            y: latitude,
        },
        precision,
    )
    .map_err(|e| cell_error(e, precision))
}

/// Decode a cell into its bounds.
pub fn bounds(cell: &str) -> Result<CellBounds, GeohashError> {
    let cell = normalize_cell(cell)?;
    decode_bounds(&cell)
}

/// Center point of a cell.
pub fn center(cell: &str) -> Result<Coordinate, GeohashError> {
    bounds(cell).map(|b| b.center())
}

/// Validate a cell and return it lowercased.
pub fn normalize_cell(cell: &str) -> Result<String, GeohashError> {
    let trimmed = cell.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_PRECISION {
        return Err(GeohashError::InvalidPrecision(trimmed.len()));
    }
    let lowered = trimmed.to_ascii_lowercase();
    decode_bounds(&lowered)?;
    Ok(lowered)
}

/// The cell itself followed by each of its shorter prefixes, finest first.
///
/// Cells are ASCII after [`normalize_cell`], so byte slicing is safe.
pub fn ancestors(cell: &str) -> impl Iterator<Item = &str> {
    (1..=cell.len()).rev().map(move |len| &cell[..len])
}

fn decode_bounds(cell: &str) -> Result<CellBounds, GeohashError> {
    let rect = ::geohash::decode_bbox(cell).map_err(|e| cell_error(e, cell.len()))?;
    let (min, max) = (rect.min(), rect.max());
    Ok(CellBounds {
        min_latitude: min.y,
        max_latitude: max.y,
        min_longitude: min.x,
        max_longitude: max.x,
    })
}

fn cell_error(error: ::geohash::GeohashError, precision: usize) -> GeohashError {
    match error {
        ::geohash::GeohashError::InvalidHashCharacter(ch) => GeohashError::InvalidCharacter(ch),
        _ => GeohashError::InvalidPrecision(precision),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(latitude: f64, longitude: f64) -> Coordinate {
        Coordinate::new(latitude, longitude).unwrap()
    }

    #[test]
    fn test_encode_known_values() {
        assert_eq!(encode(coord(28.419309, -81.577516), 6).unwrap(), "djjcxt");
        assert_eq!(
            encode(coord(57.64911, 10.40744), 11).unwrap(),
            "u4pruydqqvj"
        );
        assert_eq!(encode(coord(0.0, 0.0), 5).unwrap(), "s0000");
    }

    #[test]
    fn test_encode_is_prefix_stable() {
        let point = coord(28.419309, -81.577516);
        let fine = encode(point, 9).unwrap();
        for precision in 1..9 {
            assert_eq!(encode(point, precision).unwrap(), &fine[..precision]);
        }
    }

    #[test]
    fn test_center_round_trips_to_same_cell() {
        for cell in ["89c2", "89c3", "89c9", "djjcxt"] {
            let center = center(cell).unwrap();
            assert_eq!(encode(center, cell.len()).unwrap(), cell);
        }
    }

    #[test]
    fn test_bounds_contain_center() {
        let b = bounds("89c2").unwrap();
        assert!((b.min_latitude - 9.84375).abs() < 1e-9);
        assert!((b.max_latitude - 10.01953125).abs() < 1e-9);
        assert!((b.min_longitude + 155.7421875).abs() < 1e-9);
        assert!((b.max_longitude + 155.390625).abs() < 1e-9);
    }

    #[test]
    fn test_ancestors_finest_first() {
        let prefixes: Vec<&str> = ancestors("djjc").collect();
        assert_eq!(prefixes, vec!["djjc", "djj", "dj", "d"]);
    }

    #[test]
    fn test_normalize_cell() {
        assert_eq!(normalize_cell(" DJJC ").unwrap(), "djjc");
        assert_eq!(
            normalize_cell("djac"),
            Err(GeohashError::InvalidCharacter('a'))
        );
        assert_eq!(normalize_cell(""), Err(GeohashError::InvalidPrecision(0)));
        assert!(normalize_cell("0123456789bcd").is_err());
    }

    #[test]
    fn test_invalid_precision() {
        let point = coord(1.0, 1.0);
        assert_eq!(encode(point, 0), Err(GeohashError::InvalidPrecision(0)));
        assert_eq!(encode(point, 13), Err(GeohashError::InvalidPrecision(13)));
    }

    #[test]
    fn test_coordinate_out_of_range() {
        assert!(Coordinate::new(91.0, 0.0).is_err());
        assert!(Coordinate::new(0.0, -180.5).is_err());
        assert!(Coordinate::new(f64::NAN, 0.0).is_err());
        assert!(Coordinate::new(-90.0, 180.0).is_ok());
    }
}
