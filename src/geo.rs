//! Geodetic value types shared across the converter.
//!
//! Angles are radians, heights are metres above the WGS84 ellipsoid. These
//! are plain value types; everything that knows about CDB addressing or
//! 3D Tiles lives in the other modules.

/// WGS84 semi-major axis in metres.
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening.
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// WGS84 first eccentricity squared: e² = 2f − f².
pub const WGS84_E2: f64 = 2.0 * WGS84_F - WGS84_F * WGS84_F;

/// Tolerance for rectangle containment checks. Rectangles are derived from
/// tile addresses, so anything beyond floating point noise is a real error.
const CONTAINS_EPSILON: f64 = 1e-12;

/// A geodetic position: longitude and latitude in radians, height in metres.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct Cartographic {
    pub longitude: f64,
    pub latitude: f64,
    pub height: f64,
}

impl Cartographic {
    pub fn new(longitude: f64, latitude: f64, height: f64) -> Self {
        Self {
            longitude,
            latitude,
            height,
        }
    }

    pub fn from_degrees(longitude: f64, latitude: f64, height: f64) -> Self {
        Self {
            longitude: longitude.to_radians(),
            latitude: latitude.to_radians(),
            height,
        }
    }

    /// Convert to earth-centered earth-fixed XYZ in metres.
    pub fn to_ecef(&self) -> [f64; 3] {
        let sin_lat = self.latitude.sin();
        let cos_lat = self.latitude.cos();
        let sin_lon = self.longitude.sin();
        let cos_lon = self.longitude.cos();

        // Radius of curvature in the prime vertical
        let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();

        [
            (n + self.height) * cos_lat * cos_lon,
            (n + self.height) * cos_lat * sin_lon,
            (n * (1.0 - WGS84_E2) + self.height) * sin_lat,
        ]
    }

    /// The geodetic surface normal (the local "up" axis) in ECEF.
    pub fn surface_normal(&self) -> [f64; 3] {
        let cos_lat = self.latitude.cos();
        [
            cos_lat * self.longitude.cos(),
            cos_lat * self.longitude.sin(),
            self.latitude.sin(),
        ]
    }

    /// The local east axis in ECEF.
    pub fn east(&self) -> [f64; 3] {
        [-self.longitude.sin(), self.longitude.cos(), 0.0]
    }

    /// The local north axis in ECEF.
    pub fn north(&self) -> [f64; 3] {
        let sin_lat = self.latitude.sin();
        [
            -sin_lat * self.longitude.cos(),
            -sin_lat * self.longitude.sin(),
            self.latitude.cos(),
        ]
    }
}

/// The up and right axes of a model instance sitting at `position` with the
/// given heading.
///
/// The instance frame is the local east-north-up frame rotated about the up
/// axis by `heading_degrees`, measured clockwise from north. Up is the second
/// column and right the first column of the instance's local-to-ECEF rotation,
/// which is what the I3DM `NORMAL_UP`/`NORMAL_RIGHT` semantics expect.
pub fn instance_axes(position: &Cartographic, heading_degrees: f64) -> ([f64; 3], [f64; 3]) {
    let up = position.surface_normal();
    let east = position.east();
    let north = position.north();
    let (sin_h, cos_h) = heading_degrees.to_radians().sin_cos();
    let right = [
        east[0] * cos_h - north[0] * sin_h,
        east[1] * cos_h - north[1] * sin_h,
        east[2] * cos_h - north[2] * sin_h,
    ];
    (up, right)
}

/// A geodetic rectangle in radians, `west < east` and `south < north` after
/// normalization.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct GeodeticRectangle {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl GeodeticRectangle {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    pub fn from_degrees(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west: west.to_radians(),
            south: south.to_radians(),
            east: east.to_radians(),
            north: north.to_radians(),
        }
    }

    /// The smallest rectangle enclosing `self` and `other`.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            west: self.west.min(other.west),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            north: self.north.max(other.north),
        }
    }

    /// Whether `other` lies entirely inside `self`, up to floating point
    /// noise.
    pub fn contains(&self, other: &Self) -> bool {
        other.west >= self.west - CONTAINS_EPSILON
            && other.south >= self.south - CONTAINS_EPSILON
            && other.east <= self.east + CONTAINS_EPSILON
            && other.north <= self.north + CONTAINS_EPSILON
    }

    pub fn center(&self) -> Cartographic {
        Cartographic::new(
            (self.west + self.east) * 0.5,
            (self.south + self.north) * 0.5,
            0.0,
        )
    }
}

/// A geodetic rectangle plus a height interval. This is exactly the payload
/// of a 3D Tiles `boundingVolume.region`.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct BoundingRegion {
    pub rectangle: GeodeticRectangle,
    pub min_height: f64,
    pub max_height: f64,
}

impl BoundingRegion {
    pub fn new(rectangle: GeodeticRectangle, min_height: f64, max_height: f64) -> Self {
        Self {
            rectangle,
            min_height,
            max_height,
        }
    }

    /// Componentwise union: rectangle union, min of minima, max of maxima.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            rectangle: self.rectangle.union(&other.rectangle),
            min_height: self.min_height.min(other.min_height),
            max_height: self.max_height.max(other.max_height),
        }
    }

    pub fn contains(&self, other: &Self) -> bool {
        self.rectangle.contains(&other.rectangle)
            && other.min_height >= self.min_height - CONTAINS_EPSILON
            && other.max_height <= self.max_height + CONTAINS_EPSILON
    }

    /// The `[west, south, east, north, minH, maxH]` array used in tileset
    /// JSON.
    pub fn to_array(&self) -> [f64; 6] {
        [
            self.rectangle.west,
            self.rectangle.south,
            self.rectangle.east,
            self.rectangle.north,
            self.min_height,
            self.max_height,
        ]
    }
}
