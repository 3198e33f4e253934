//! Search-area polygons.
//!
//! In memory a polygon is an open ring of `{lat, lon}` points (no closing
//! duplicate). At rest it is a GeoJSON `Feature` holding a `Polygon` with a
//! single closed ring in `[longitude, latitude]` order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Equatorial radius used for spherical area, in metres.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;
pub const MIN_RING_POINTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeoError {
    #[error("polygon needs at least {MIN_RING_POINTS} points, got {0}")]
    TooFewPoints(usize),
    #[error("polygon contains a non-finite coordinate")]
    NonFiniteCoordinate,
    #[error("unsupported GeoJSON: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<LatLon>", into = "Vec<LatLon>")]
pub struct AreaPolygon {
    ring: Vec<LatLon>,
}

impl AreaPolygon {
    /// Builds a polygon from an open ring. A trailing point equal to the first
    /// is treated as an explicit closing point and dropped.
    pub fn new(mut ring: Vec<LatLon>) -> Result<Self, GeoError> {
        if ring
            .iter()
            .any(|p| !p.lat.is_finite() || !p.lon.is_finite())
        {
            return Err(GeoError::NonFiniteCoordinate);
        }
        if ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        if ring.len() < MIN_RING_POINTS {
            return Err(GeoError::TooFewPoints(ring.len()));
        }
        Ok(Self { ring })
    }

    pub fn points(&self) -> &[LatLon] {
        &self.ring
    }

    pub fn to_geojson(&self) -> GeoJson {
        let mut ring: Vec<[f64; 2]> = self.ring.iter().map(|p| [p.lon, p.lat]).collect();
        ring.push([self.ring[0].lon, self.ring[0].lat]);
        GeoJson::Feature {
            properties: Map::new(),
            geometry: Geometry::Polygon {
                coordinates: vec![ring],
            },
        }
    }

    pub fn from_geojson(value: &GeoJson) -> Result<Self, GeoError> {
        let coordinates = match value {
            GeoJson::Feature {
                geometry: Geometry::Polygon { coordinates },
                ..
            } => coordinates,
            GeoJson::Polygon { coordinates } => coordinates,
        };
        let ring = coordinates
            .first()
            .ok_or_else(|| GeoError::Unsupported("polygon has no rings".into()))?;
        Self::new(ring.iter().map(|c| LatLon::new(c[1], c[0])).collect())
    }

    pub fn to_json_string(&self) -> String {
        // A GeoJson value is plain data; serializing it cannot fail.
        serde_json::to_string(&self.to_geojson()).unwrap_or_default()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, GeoError> {
        let value: GeoJson =
            serde_json::from_str(raw).map_err(|err| GeoError::Unsupported(err.to_string()))?;
        Self::from_geojson(&value)
    }

    /// Area on a spherical earth, in square kilometres.
    pub fn area_km2(&self) -> f64 {
        ring_area_m2(&self.ring) / 1_000_000.0
    }
}

impl TryFrom<Vec<LatLon>> for AreaPolygon {
    type Error = GeoError;

    fn try_from(value: Vec<LatLon>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AreaPolygon> for Vec<LatLon> {
    fn from(value: AreaPolygon) -> Self {
        value.ring
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GeoJson {
    Feature {
        #[serde(default)]
        properties: Map<String, Value>,
        geometry: Geometry,
    },
    Polygon {
        coordinates: Vec<Vec<[f64; 2]>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Polygon { coordinates: Vec<Vec<[f64; 2]>> },
}

fn ring_area_m2(ring: &[LatLon]) -> f64 {
    let n = ring.len();
    if n < MIN_RING_POINTS {
        return 0.0;
    }
    let mut total = 0.0;
    for i in 0..n {
        let lower = ring[i];
        let middle = ring[(i + 1) % n];
        let upper = ring[(i + 2) % n];
        total += (upper.lon.to_radians() - lower.lon.to_radians()) * middle.lat.to_radians().sin();
    }
    (total * EARTH_RADIUS_M * EARTH_RADIUS_M / 2.0).abs()
}

#[cfg(test)]
#[path = "tests/geo_tests.rs"]
mod tests;
