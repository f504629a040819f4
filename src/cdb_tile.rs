//! CDB tile addressing.
//!
//! A tile is addressed by (geocell, dataset, component selectors, level,
//! UREF, RREF). The address alone determines the tile's geodetic rectangle,
//! its canonical file name and its location in both the source store and the
//! output tree; nothing here touches the filesystem.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use crate::geo::GeodeticRectangle;

/// Coarsest CDB level of detail.
pub const MIN_LEVEL: i32 = -10;
/// Finest CDB level of detail.
pub const MAX_LEVEL: i32 = 23;

/// A one-degree (wider near the poles) geodetic cell, identified by the
/// integer latitude and longitude of its south-west corner.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CDBGeoCell {
    pub latitude: i32,
    pub longitude: i32,
}

impl CDBGeoCell {
    pub fn new(latitude: i32, longitude: i32) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Longitude extent of the cell in degrees. CDB widens cells toward the
    /// poles so that they stay roughly square on the ground.
    pub fn width_degrees(&self) -> i32 {
        // The zone is keyed by the cell edge closest to the pole.
        let band = if self.latitude >= 0 {
            self.latitude
        } else {
            -self.latitude - 1
        };
        match band {
            0..=49 => 1,
            50..=69 => 2,
            70..=74 => 3,
            75..=79 => 4,
            80..=88 => 6,
            _ => 12,
        }
    }

    pub fn rectangle(&self) -> GeodeticRectangle {
        GeodeticRectangle::from_degrees(
            self.longitude as f64,
            self.latitude as f64,
            (self.longitude + self.width_degrees()) as f64,
            (self.latitude + 1) as f64,
        )
    }

    /// Directory name of the latitude band, e.g. `N50` or `S09`.
    pub fn latitude_dir(&self) -> String {
        if self.latitude >= 0 {
            format!("N{:02}", self.latitude)
        } else {
            format!("S{:02}", -self.latitude)
        }
    }

    /// Directory name of the longitude band, e.g. `E007` or `W120`.
    pub fn longitude_dir(&self) -> String {
        if self.longitude >= 0 {
            format!("E{:03}", self.longitude)
        } else {
            format!("W{:03}", -self.longitude)
        }
    }

    /// Relative path of the cell under the tile tree, `N50/E007` style.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.latitude_dir()).join(self.longitude_dir())
    }

    /// Parse a `N50`/`S09` and `E007`/`W120` directory pair.
    pub fn from_dir_names(lat_dir: &str, lon_dir: &str) -> Option<Self> {
        let latitude = match lat_dir.split_at_checked(1)? {
            ("N", digits) => digits.parse::<i32>().ok()?,
            ("S", digits) => -digits.parse::<i32>().ok()?,
            _ => return None,
        };
        let longitude = match lon_dir.split_at_checked(1)? {
            ("E", digits) => digits.parse::<i32>().ok()?,
            ("W", digits) => -digits.parse::<i32>().ok()?,
            _ => return None,
        };
        if !(-90..90).contains(&latitude) || !(-180..180).contains(&longitude) {
            return None;
        }
        Some(Self::new(latitude, longitude))
    }
}

impl Display for CDBGeoCell {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.latitude_dir(), self.longitude_dir())
    }
}

/// The CDB datasets this converter understands.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum CDBDataset {
    Elevation,
    Imagery,
    RoadNetwork,
    RailRoadNetwork,
    PowerlineNetwork,
    HydrographyNetwork,
    GTModel,
    GSModel,
}

impl CDBDataset {
    pub const ALL: [CDBDataset; 8] = [
        CDBDataset::Elevation,
        CDBDataset::Imagery,
        CDBDataset::RoadNetwork,
        CDBDataset::RailRoadNetwork,
        CDBDataset::PowerlineNetwork,
        CDBDataset::HydrographyNetwork,
        CDBDataset::GTModel,
        CDBDataset::GSModel,
    ];

    /// The CDB dataset code, the `D` component of tile names.
    pub fn code(&self) -> u32 {
        match self {
            CDBDataset::Elevation => 1,
            CDBDataset::Imagery => 4,
            CDBDataset::RoadNetwork => 201,
            CDBDataset::RailRoadNetwork => 202,
            CDBDataset::PowerlineNetwork => 203,
            CDBDataset::HydrographyNetwork => 204,
            CDBDataset::GTModel => 101,
            CDBDataset::GSModel => 300,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|d| d.code() == code)
    }

    /// The dataset name used in output paths and combination specs.
    pub fn name(&self) -> &'static str {
        match self {
            CDBDataset::Elevation => "Elevation",
            CDBDataset::Imagery => "Imagery",
            CDBDataset::RoadNetwork => "RoadNetwork",
            CDBDataset::RailRoadNetwork => "RailRoadNetwork",
            CDBDataset::PowerlineNetwork => "PowerlineNetwork",
            CDBDataset::HydrographyNetwork => "HydrographyNetwork",
            CDBDataset::GTModel => "GTModels",
            CDBDataset::GSModel => "GSModels",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|d| d.name() == name)
    }

    /// Directory name inside a geocell of the source store, e.g.
    /// `001_Elevation`.
    pub fn source_dir(&self) -> String {
        format!("{:03}_{}", self.code(), self.name())
    }

    /// Extension of the source tile files of this dataset.
    pub fn source_extension(&self) -> &'static str {
        match self {
            CDBDataset::Elevation => "tif",
            CDBDataset::Imagery => "jp2",
            CDBDataset::GSModel => "zip",
            _ => "shp",
        }
    }

    /// Extension of the 3D Tiles content emitted for this dataset. Geotypical
    /// model tiles hold one instanced batch per model class, wrapped in a
    /// composite.
    pub fn content_extension(&self) -> &'static str {
        match self {
            CDBDataset::GTModel => "cmpt",
            _ => "b3dm",
        }
    }

    /// Whether tilesets of this dataset refine with REPLACE. Terrain and
    /// imagery children fully replace their parents; vector and model
    /// overlays are additive.
    pub fn replace_refinement(&self) -> bool {
        matches!(self, CDBDataset::Elevation | CDBDataset::Imagery)
    }
}

impl Display for CDBDataset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A fully qualified CDB tile address.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CDBTileAddress {
    pub geocell: CDBGeoCell,
    pub dataset: CDBDataset,
    pub cs1: u32,
    pub cs2: u32,
    /// Signed level of detail. Negative levels are coarser-than-geocell
    /// aggregates with a single tile each.
    pub level: i32,
    /// Row inside the geocell, counted from the south.
    pub uref: u32,
    /// Column inside the geocell, counted from the west.
    pub rref: u32,
}

impl CDBTileAddress {
    pub fn new(
        geocell: CDBGeoCell,
        dataset: CDBDataset,
        cs1: u32,
        cs2: u32,
        level: i32,
        uref: u32,
        rref: u32,
    ) -> Self {
        Self {
            geocell,
            dataset,
            cs1,
            cs2,
            level,
            uref,
            rref,
        }
    }

    /// The canonical tile name, e.g.
    /// `N50E007_D001_S001_T001_L02_U1_R3` or `..._LC05_U0_R0`.
    pub fn tile_name(&self) -> String {
        format!(
            "{}_D{:03}_S{:03}_T{:03}_{}_U{}_R{}",
            self.geocell,
            self.dataset.code(),
            self.cs1,
            self.cs2,
            level_token(self.level),
            self.uref,
            self.rref
        )
    }

    /// Parse a tile name as produced by [`tile_name`](Self::tile_name).
    pub fn parse_name(stem: &str) -> Option<Self> {
        let parts: Vec<&str> = stem.split('_').collect();
        if parts.len() != 7 {
            return None;
        }
        let (lat_dir, lon_dir) = parts[0].split_at_checked(3)?;
        let geocell = CDBGeoCell::from_dir_names(lat_dir, lon_dir)?;
        let dataset = CDBDataset::from_code(parts[1].strip_prefix('D')?.parse().ok()?)?;
        let cs1 = parts[2].strip_prefix('S')?.parse().ok()?;
        let cs2 = parts[3].strip_prefix('T')?.parse().ok()?;
        let level = parse_level_token(parts[4])?;
        let uref = parts[5].strip_prefix('U')?.parse().ok()?;
        let rref = parts[6].strip_prefix('R')?.parse().ok()?;
        let address = Self::new(geocell, dataset, cs1, cs2, level, uref, rref);
        if !address.is_valid() {
            return None;
        }
        Some(address)
    }

    /// Whether level, UREF and RREF are mutually consistent.
    pub fn is_valid(&self) -> bool {
        if !(MIN_LEVEL..=MAX_LEVEL).contains(&self.level) {
            return false;
        }
        if self.level < 0 {
            self.uref == 0 && self.rref == 0
        } else {
            let side = 1u32 << self.level;
            self.uref < side && self.rref < side
        }
    }

    /// The geodetic rectangle covered by the tile.
    ///
    /// A level `L ≥ 0` tile spans one cell of the 2^L × 2^L grid inside its
    /// geocell. A negative level tile covers 2^|L| geocells along each axis
    /// starting at the geocell origin.
    pub fn rectangle(&self) -> GeodeticRectangle {
        let cell = self.geocell.rectangle();
        if self.level < 0 {
            let n = (1u64 << (-self.level as u32)) as f64;
            return GeodeticRectangle::new(
                cell.west,
                cell.south,
                cell.west + (cell.east - cell.west) * n,
                cell.south + (cell.north - cell.south) * n,
            );
        }
        let side = (1u64 << self.level) as f64;
        let dlon = (cell.east - cell.west) / side;
        let dlat = (cell.north - cell.south) / side;
        let west = cell.west + self.rref as f64 * dlon;
        let south = cell.south + self.uref as f64 * dlat;
        GeodeticRectangle::new(west, south, west + dlon, south + dlat)
    }

    /// The address one level up, or `None` at the coarsest level.
    pub fn parent(&self) -> Option<Self> {
        if self.level <= MIN_LEVEL {
            return None;
        }
        let mut parent = *self;
        parent.level -= 1;
        if self.level > 0 {
            parent.uref = self.uref / 2;
            parent.rref = self.rref / 2;
        } else {
            parent.uref = 0;
            parent.rref = 0;
        }
        Some(parent)
    }

    /// The addresses one level down. Four quadrants for `level ≥ 0`, a single
    /// refinement step for the negative aggregate levels.
    pub fn children(&self) -> Vec<Self> {
        if self.level >= MAX_LEVEL {
            return Vec::new();
        }
        if self.level < 0 {
            let mut child = *self;
            child.level += 1;
            return vec![child];
        }
        let mut children = Vec::with_capacity(4);
        for du in 0..2 {
            for dr in 0..2 {
                let mut child = *self;
                child.level += 1;
                child.uref = self.uref * 2 + du;
                child.rref = self.rref * 2 + dr;
                children.push(child);
            }
        }
        children
    }

    /// Directory of the collection this tile belongs to, relative to the
    /// output root: `{geocell}/{Dataset}/{cs1}_{cs2}`.
    pub fn collection_path(&self) -> PathBuf {
        self.geocell
            .relative_path()
            .join(self.dataset.name())
            .join(format!("{}_{}", self.cs1, self.cs2))
    }

    /// File name of the tile's content payload.
    pub fn content_file_name(&self) -> String {
        format!("{}.{}", self.tile_name(), self.dataset.content_extension())
    }

    /// Content URI relative to the collection's `tileset.json`.
    pub fn content_uri(&self) -> String {
        self.content_file_name()
    }

    /// Path of the tile's content payload relative to the output root.
    pub fn content_path(&self) -> PathBuf {
        self.collection_path().join(self.content_file_name())
    }
}

impl Display for CDBTileAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.tile_name())
    }
}

fn level_token(level: i32) -> String {
    if level < 0 {
        format!("LC{:02}", -level)
    } else {
        format!("L{:02}", level)
    }
}

fn parse_level_token(token: &str) -> Option<i32> {
    if let Some(digits) = token.strip_prefix("LC") {
        Some(-digits.parse::<i32>().ok()?)
    } else {
        token.strip_prefix('L')?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(level: i32, uref: u32, rref: u32) -> CDBTileAddress {
        CDBTileAddress::new(
            CDBGeoCell::new(50, 7),
            CDBDataset::Elevation,
            1,
            1,
            level,
            uref,
            rref,
        )
    }

    #[test]
    fn test_geocell_widths() {
        assert_eq!(CDBGeoCell::new(0, 0).width_degrees(), 1);
        assert_eq!(CDBGeoCell::new(49, 0).width_degrees(), 1);
        assert_eq!(CDBGeoCell::new(50, 0).width_degrees(), 2);
        assert_eq!(CDBGeoCell::new(70, 0).width_degrees(), 3);
        assert_eq!(CDBGeoCell::new(75, 0).width_degrees(), 4);
        assert_eq!(CDBGeoCell::new(80, 0).width_degrees(), 6);
        assert_eq!(CDBGeoCell::new(89, 0).width_degrees(), 12);
        // Southern cells mirror the northern bands
        assert_eq!(CDBGeoCell::new(-50, 0).width_degrees(), 1);
        assert_eq!(CDBGeoCell::new(-51, 0).width_degrees(), 2);
        assert_eq!(CDBGeoCell::new(-90, 0).width_degrees(), 12);
    }

    #[test]
    fn test_geocell_dirs() {
        let cell = CDBGeoCell::new(50, 7);
        assert_eq!(cell.latitude_dir(), "N50");
        assert_eq!(cell.longitude_dir(), "E007");
        assert_eq!(cell.to_string(), "N50E007");
        let cell = CDBGeoCell::new(-9, -120);
        assert_eq!(cell.latitude_dir(), "S09");
        assert_eq!(cell.longitude_dir(), "W120");
        assert_eq!(
            CDBGeoCell::from_dir_names("S09", "W120"),
            Some(CDBGeoCell::new(-9, -120))
        );
        assert_eq!(CDBGeoCell::from_dir_names("X09", "W120"), None);
        assert_eq!(CDBGeoCell::from_dir_names("N91", "E000"), None);
    }

    #[test]
    fn test_tile_name_round_trip() {
        for tile in [address(2, 1, 3), address(-5, 0, 0), address(0, 0, 0)] {
            let name = tile.tile_name();
            assert_eq!(CDBTileAddress::parse_name(&name), Some(tile), "{}", name);
        }
        assert_eq!(
            address(2, 1, 3).tile_name(),
            "N50E007_D001_S001_T001_L02_U1_R3"
        );
        assert_eq!(
            address(-5, 0, 0).tile_name(),
            "N50E007_D001_S001_T001_LC05_U0_R0"
        );
    }

    #[test]
    fn test_parse_rejects_inconsistent_addresses() {
        // UREF out of range for the level
        assert_eq!(
            CDBTileAddress::parse_name("N50E007_D001_S001_T001_L01_U2_R0"),
            None
        );
        // Negative levels have a single tile
        assert_eq!(
            CDBTileAddress::parse_name("N50E007_D001_S001_T001_LC01_U1_R0"),
            None
        );
        assert_eq!(CDBTileAddress::parse_name("garbage"), None);
    }

    #[test]
    fn test_children_partition_parent() {
        // The four level L+1 children exactly partition a level L tile.
        for parent in [address(0, 0, 0), address(1, 1, 0), address(3, 5, 2)] {
            let rect = parent.rectangle();
            let children = parent.children();
            assert_eq!(children.len(), 4);
            let mut union = children[0].rectangle();
            for child in &children {
                let child_rect = child.rectangle();
                assert!(rect.contains(&child_rect), "{} in {}", child, parent);
                assert_eq!(child.parent(), Some(parent));
                union = union.union(&child_rect);
            }
            assert!((union.west - rect.west).abs() < 1e-12);
            assert!((union.south - rect.south).abs() < 1e-12);
            assert!((union.east - rect.east).abs() < 1e-12);
            assert!((union.north - rect.north).abs() < 1e-12);
        }
    }

    #[test]
    fn test_negative_level_rectangle() {
        let tile = address(-2, 0, 0);
        let rect = tile.rectangle();
        let cell = CDBGeoCell::new(50, 7).rectangle();
        // Covers 4 geocells along each axis from the geocell origin
        assert_eq!(rect.west, cell.west);
        assert_eq!(rect.south, cell.south);
        assert!((rect.east - (cell.west + 4.0 * (cell.east - cell.west))).abs() < 1e-12);
        assert!((rect.north - (cell.south + 4.0_f64.to_radians())).abs() < 1e-12);
        // The single refinement chain bottoms out in the geocell tile
        assert_eq!(tile.children(), vec![address(-1, 0, 0)]);
        assert_eq!(address(-1, 0, 0).children(), vec![address(0, 0, 0)]);
    }

    #[test]
    fn test_level_zero_parent_is_aggregate() {
        assert_eq!(address(0, 0, 0).parent(), Some(address(-1, 0, 0)));
        let mut tile = address(MIN_LEVEL, 0, 0);
        assert_eq!(tile.parent(), None);
        tile.level = MIN_LEVEL + 1;
        assert!(tile.parent().is_some());
    }

    #[test]
    fn test_content_paths() {
        let tile = address(2, 1, 3);
        assert_eq!(
            tile.collection_path(),
            PathBuf::from("N50/E007/Elevation/1_1")
        );
        assert_eq!(
            tile.content_uri(),
            "N50E007_D001_S001_T001_L02_U1_R3.b3dm"
        );
        assert_eq!(
            tile.content_path(),
            PathBuf::from("N50/E007/Elevation/1_1/N50E007_D001_S001_T001_L02_U1_R3.b3dm")
        );
        let mut gt = tile;
        gt.dataset = CDBDataset::GTModel;
        assert!(gt.content_uri().ends_with(".cmpt"));
    }
}
