//! CDB source store access.
//!
//! [`Cdb`] enumerates geocells and tiles by walking the store's `Tiles/`
//! tree and parsing canonical tile names. Decoding the payloads behind those
//! names (rasters, shapefiles, model archives) is delegated through the
//! [`ContentProducer`] trait; [`SidecarContent`] is the built-in producer
//! that picks up pre-encoded glTF payloads laid down next to the source
//! tiles by an upstream mesher.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;
use walkdir::WalkDir;

use crate::cdb_tile::{CDBDataset, CDBGeoCell, CDBTileAddress};
use crate::geo::Cartographic;
use crate::tileset::Texture;

/// An elevation tile yielded by the source reader.
#[derive(Debug, Clone)]
pub struct CDBElevation {
    pub tile: CDBTileAddress,
    pub path: PathBuf,
}

/// A vector-feature tile (road, railroad, powerline or hydrography network).
#[derive(Debug, Clone)]
pub struct CDBGeometryVectors {
    pub tile: CDBTileAddress,
    pub path: PathBuf,
}

/// A geotypical model placement tile.
#[derive(Debug, Clone)]
pub struct CDBGTModels {
    pub tile: CDBTileAddress,
    pub path: PathBuf,
}

/// A geospecific model tile.
#[derive(Debug, Clone)]
pub struct CDBGSModels {
    pub tile: CDBTileAddress,
    pub path: PathBuf,
}

/// Per-instance attribute columns of a batch of instanced models.
///
/// Every column has exactly one entry per instance; `is_consistent` checks
/// that invariant after deserialization.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceAttributes {
    /// Model class name of each instance, the `CNAM` batch table column.
    pub cnams: Vec<String>,
    pub integer_attribs: BTreeMap<String, Vec<i32>>,
    pub double_attribs: BTreeMap<String, Vec<f64>>,
    pub string_attribs: BTreeMap<String, Vec<String>>,
}

impl InstanceAttributes {
    pub fn instances_count(&self) -> usize {
        self.cnams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cnams.is_empty()
    }

    pub fn is_consistent(&self) -> bool {
        let n = self.instances_count();
        self.integer_attribs.values().all(|column| column.len() == n)
            && self.double_attribs.values().all(|column| column.len() == n)
            && self.string_attribs.values().all(|column| column.len() == n)
    }
}

/// Payload of one elevation tile.
#[derive(Debug)]
pub struct ElevationPayload {
    pub glb: Vec<u8>,
    pub min_height: f64,
    pub max_height: f64,
    /// Imagery decoded alongside the elevation, cached for descendants.
    pub texture: Option<Texture>,
}

/// Payload of one vector-network tile.
pub struct VectorPayload {
    pub glb: Vec<u8>,
    pub attributes: Option<InstanceAttributes>,
    pub min_height: f64,
    pub max_height: f64,
}

/// One model class worth of instances within a geotypical model tile.
pub struct GTModelBatch {
    /// URI of the external glTF asset the instances share.
    pub gltf_uri: String,
    pub positions: Vec<Cartographic>,
    pub scales: Vec<[f32; 3]>,
    /// Heading in degrees, clockwise from north.
    pub headings: Vec<f64>,
    pub attributes: InstanceAttributes,
}

/// Payload of one geospecific model tile.
pub struct GSModelPayload {
    pub glb: Vec<u8>,
    pub attributes: Option<InstanceAttributes>,
    pub min_height: f64,
    pub max_height: f64,
}

/// Produces renderable content for source tiles.
///
/// Raster and vector decoding, meshing and glTF encoding all live behind
/// this trait; the conversion driver only sees finished payloads. An
/// implementation backed by a raster library owns that library's process
/// wide initialization (constructor and `Drop`).
pub trait ContentProducer {
    fn elevation(
        &mut self,
        elevation: &CDBElevation,
        parent_imagery: Option<&Texture>,
    ) -> io::Result<ElevationPayload>;

    fn vector(&mut self, vector: &CDBGeometryVectors) -> io::Result<VectorPayload>;

    fn gt_models(&mut self, models: &CDBGTModels) -> io::Result<Vec<GTModelBatch>>;

    fn gs_models(&mut self, models: &CDBGSModels) -> io::Result<GSModelPayload>;
}

/// A CDB store rooted at a directory containing `Tiles/`.
pub struct Cdb {
    root: PathBuf,
}

impl Cdb {
    pub fn new(root: &Path) -> io::Result<Self> {
        let tiles = root.join("Tiles");
        if !tiles.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{:?} is not a CDB store: missing Tiles directory", root),
            ));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// All geocells present in the store, in a stable (latitude, longitude)
    /// order.
    pub fn geocells(&self) -> Vec<CDBGeoCell> {
        let mut cells: Vec<CDBGeoCell> = WalkDir::new(self.root.join("Tiles"))
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir())
            .filter_map(|entry| {
                let lon_dir = entry.file_name().to_str()?;
                let lat_dir = entry.path().parent()?.file_name()?.to_str()?;
                CDBGeoCell::from_dir_names(lat_dir, lon_dir)
            })
            .collect();
        cells.sort();
        cells.dedup();
        cells
    }

    /// All tiles of `dataset` within `geocell`, sorted by component
    /// selectors, then (level, UREF, RREF).
    fn tiles(&self, geocell: &CDBGeoCell, dataset: CDBDataset) -> Vec<(CDBTileAddress, PathBuf)> {
        let dataset_dir = self
            .root
            .join("Tiles")
            .join(geocell.relative_path())
            .join(dataset.source_dir());
        if !dataset_dir.is_dir() {
            return Vec::new();
        }
        let mut tiles: Vec<(CDBTileAddress, PathBuf)> = WalkDir::new(&dataset_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension()?.to_str()? != dataset.source_extension() {
                    return None;
                }
                let stem = path.file_stem()?.to_str()?;
                let address = match CDBTileAddress::parse_name(stem) {
                    Some(address) => address,
                    None => {
                        debug!("skipping unrecognized tile name {:?}", path);
                        return None;
                    }
                };
                if address.geocell != *geocell || address.dataset != dataset {
                    debug!("skipping misplaced tile {:?}", path);
                    return None;
                }
                Some((address, path.to_path_buf()))
            })
            .collect();
        tiles.sort_by_key(|(address, _)| *address);
        tiles
    }

    pub fn for_each_elevation_tile(&self, geocell: &CDBGeoCell, mut f: impl FnMut(CDBElevation)) {
        for (tile, path) in self.tiles(geocell, CDBDataset::Elevation) {
            f(CDBElevation { tile, path });
        }
    }

    /// Visit the vector tiles of one of the network datasets.
    pub fn for_each_vector_tile(
        &self,
        geocell: &CDBGeoCell,
        dataset: CDBDataset,
        mut f: impl FnMut(CDBGeometryVectors),
    ) {
        debug_assert!(matches!(
            dataset,
            CDBDataset::RoadNetwork
                | CDBDataset::RailRoadNetwork
                | CDBDataset::PowerlineNetwork
                | CDBDataset::HydrographyNetwork
        ));
        for (tile, path) in self.tiles(geocell, dataset) {
            f(CDBGeometryVectors { tile, path });
        }
    }

    pub fn for_each_gt_model_tile(&self, geocell: &CDBGeoCell, mut f: impl FnMut(CDBGTModels)) {
        for (tile, path) in self.tiles(geocell, CDBDataset::GTModel) {
            f(CDBGTModels { tile, path });
        }
    }

    pub fn for_each_gs_model_tile(&self, geocell: &CDBGeoCell, mut f: impl FnMut(CDBGSModels)) {
        for (tile, path) in self.tiles(geocell, CDBDataset::GSModel) {
            f(CDBGSModels { tile, path });
        }
    }
}

/// Sidecar metadata for meshed tiles: `{tile}.meta.json` next to the source
/// tile.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MeshSidecar {
    min_height: f64,
    max_height: f64,
    attributes: Option<InstanceAttributes>,
}

/// Sidecar instance placements for model tiles: `{tile}.instances.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstancesSidecar {
    batches: Vec<BatchSidecar>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchSidecar {
    gltf_uri: String,
    /// `[longitude°, latitude°, height m]` per instance.
    positions: Vec<[f64; 3]>,
    #[serde(default)]
    scales: Vec<[f32; 3]>,
    #[serde(default)]
    headings: Vec<f64>,
    #[serde(default)]
    attributes: InstanceAttributes,
}

/// Content producer reading pre-encoded payloads from sidecar files.
///
/// For a source tile `{name}.tif` it expects `{name}.glb` (the encoded
/// payload) and optionally `{name}.meta.json` (height range and feature
/// attributes). Model tiles use `{name}.instances.json` instead of a GLB.
#[derive(Debug, Default)]
pub struct SidecarContent;

impl SidecarContent {
    fn read_glb(path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path.with_extension("glb"))
    }

    fn read_meta(path: &Path) -> io::Result<MeshSidecar> {
        let meta_path = path.with_extension("meta.json");
        if !meta_path.is_file() {
            return Ok(MeshSidecar::default());
        }
        let file = File::open(&meta_path)?;
        serde_json::from_reader(file)
            .map_err(|e| invalid_data(format!("malformed sidecar {:?}: {}", meta_path, e)))
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

impl ContentProducer for SidecarContent {
    fn elevation(
        &mut self,
        elevation: &CDBElevation,
        _parent_imagery: Option<&Texture>,
    ) -> io::Result<ElevationPayload> {
        let glb = Self::read_glb(&elevation.path)?;
        let meta = Self::read_meta(&elevation.path)?;
        let texture_path = elevation.path.with_extension("png");
        let texture = texture_path.is_file().then(|| Texture {
            path: texture_path,
        });
        Ok(ElevationPayload {
            glb,
            min_height: meta.min_height,
            max_height: meta.max_height,
            texture,
        })
    }

    fn vector(&mut self, vector: &CDBGeometryVectors) -> io::Result<VectorPayload> {
        let glb = Self::read_glb(&vector.path)?;
        let meta = Self::read_meta(&vector.path)?;
        if let Some(attributes) = &meta.attributes {
            if !attributes.is_consistent() {
                return Err(invalid_data(format!(
                    "attribute columns of {} do not all have {} entries",
                    vector.tile,
                    attributes.instances_count()
                )));
            }
        }
        Ok(VectorPayload {
            glb,
            attributes: meta.attributes,
            min_height: meta.min_height,
            max_height: meta.max_height,
        })
    }

    fn gt_models(&mut self, models: &CDBGTModels) -> io::Result<Vec<GTModelBatch>> {
        let sidecar_path = models.path.with_extension("instances.json");
        let file = File::open(&sidecar_path)?;
        let sidecar: InstancesSidecar = serde_json::from_reader(file)
            .map_err(|e| invalid_data(format!("malformed sidecar {:?}: {}", sidecar_path, e)))?;

        let mut batches = Vec::with_capacity(sidecar.batches.len());
        for batch in sidecar.batches {
            let n = batch.positions.len();
            let mut scales = batch.scales;
            if scales.is_empty() {
                scales = vec![[1.0, 1.0, 1.0]; n];
            }
            let mut headings = batch.headings;
            if headings.is_empty() {
                headings = vec![0.0; n];
            }
            if scales.len() != n
                || headings.len() != n
                || batch.attributes.instances_count() != n
                || !batch.attributes.is_consistent()
            {
                return Err(invalid_data(format!(
                    "instance columns of {} do not all have {} entries",
                    models.tile, n
                )));
            }
            batches.push(GTModelBatch {
                gltf_uri: batch.gltf_uri,
                positions: batch
                    .positions
                    .iter()
                    .map(|p| Cartographic::from_degrees(p[0], p[1], p[2]))
                    .collect(),
                scales,
                headings,
                attributes: batch.attributes,
            });
        }
        Ok(batches)
    }

    fn gs_models(&mut self, models: &CDBGSModels) -> io::Result<GSModelPayload> {
        let glb = Self::read_glb(&models.path)?;
        let meta = Self::read_meta(&models.path)?;
        Ok(GSModelPayload {
            glb,
            attributes: meta.attributes,
            min_height: meta.min_height,
            max_height: meta.max_height,
        })
    }
}
