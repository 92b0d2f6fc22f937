//! Geographic coordinate primitives.
//!
//! Regions carry a degree-space bounding box so the core can answer
//! "which region covers this location?" for the UI and for migration
//! prefetch. No projection math is needed here; containment checks in
//! plain degrees are enough for region lookup.

/// Minimum/maximum valid latitude in degrees.
pub const MIN_LAT: f64 = -90.0;
pub const MAX_LAT: f64 = 90.0;

/// Minimum/maximum valid longitude in degrees.
pub const MIN_LON: f64 = -180.0;
pub const MAX_LON: f64 = 180.0;

/// A geographic position in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    /// The null-island fallback used when the device location is unknown.
    pub const ZERO: LatLon = LatLon { lat: 0.0, lon: 0.0 };

    /// Creates a position, clamping out-of-range inputs into the valid
    /// degree space rather than failing.
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat: lat.clamp(MIN_LAT, MAX_LAT),
            lon: lon.clamp(MIN_LON, MAX_LON),
        }
    }
}

/// An axis-aligned bounding box in degree space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Rect {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    /// Whether the point lies inside this box (inclusive bounds).
    pub fn contains(&self, p: LatLon) -> bool {
        p.lat >= self.min_lat
            && p.lat <= self.max_lat
            && p.lon >= self.min_lon
            && p.lon <= self.max_lon
    }

    /// Center point, used to rank candidate regions by distance when
    /// several boxes overlap a location.
    pub fn center(&self) -> LatLon {
        LatLon {
            lat: (self.min_lat + self.max_lat) / 2.0,
            lon: (self.min_lon + self.max_lon) / 2.0,
        }
    }
}

/// Squared degree-space distance between two points. Good enough for
/// picking the nearest of a handful of overlapping regions; not a
/// geodesic.
pub fn distance_sq(a: LatLon, b: LatLon) -> f64 {
    let dlat = a.lat - b.lat;
    let dlon = a.lon - b.lon;
    dlat * dlat + dlon * dlon
}
