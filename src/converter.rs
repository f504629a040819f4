//! The conversion driver.
//!
//! Walks the source store geocell by geocell, feeds tiles through the
//! content producer into per-dataset tileset collections, writes the binary
//! containers, and finally combines the per-geocell tilesets into
//! per-dataset roots and the top-level `tileset.json`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::cdb::{
    Cdb, CDBElevation, CDBGSModels, CDBGTModels, CDBGeometryVectors, ContentProducer,
    ElevationPayload,
};
use crate::cdb_tile::{CDBDataset, CDBGeoCell, CDBTileAddress};
use crate::formats::cesium3dtiles::Tileset;
use crate::formats::container::{
    write_atomic, write_b3dm, write_cmpt, write_i3dm, ContainerError,
};
use crate::geo::BoundingRegion;
use crate::implicit::SubtreeSet;
use crate::tileset::{ParentImageryCache, TilesetCollection, TopologyError};

/// Minimum height assigned to geocell bounding regions, tolerating terrain
/// depressions below the ellipsoid.
const GEOCELL_MIN_HEIGHT: f64 = -10.0;

const VECTOR_DATASETS: [CDBDataset; 4] = [
    CDBDataset::RoadNetwork,
    CDBDataset::RailRoadNetwork,
    CDBDataset::PowerlineNetwork,
    CDBDataset::HydrographyNetwork,
];

/// A malformed or unrecognized dataset combination spec. Reported before any
/// conversion work begins.
#[derive(Debug, Error)]
pub enum DatasetSpecError {
    #[error(
        "wrong format {spec:?}: required format is \
         {{DatasetName}}_{{ComponentSelector1}}_{{ComponentSelector2}}"
    )]
    Malformed { spec: String },
    #[error("unrecognized dataset {name:?}; correct dataset names are: {allowed}")]
    UnknownDataset { name: String, allowed: String },
    #[error("component selector {selector:?} in {spec:?} has to be a positive number")]
    BadSelector { spec: String, selector: String },
}

/// One `{DatasetName}_{CS1}_{CS2}` entry of a combination request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DatasetSelector {
    pub dataset: CDBDataset,
    pub cs1: u32,
    pub cs2: u32,
}

impl DatasetSelector {
    pub fn from_spec(spec: &str) -> Result<Self, DatasetSpecError> {
        let malformed = || DatasetSpecError::Malformed {
            spec: spec.to_string(),
        };
        let mut parts = spec.splitn(3, '_');
        let name = parts.next().filter(|part| !part.is_empty()).ok_or_else(malformed)?;
        let cs1 = parts.next().ok_or_else(malformed)?;
        let cs2 = parts.next().ok_or_else(malformed)?;
        let dataset =
            CDBDataset::from_name(name).ok_or_else(|| DatasetSpecError::UnknownDataset {
                name: name.to_string(),
                allowed: allowed_dataset_names(),
            })?;
        Ok(Self {
            dataset,
            cs1: parse_selector(spec, cs1)?,
            cs2: parse_selector(spec, cs2)?,
        })
    }

    /// The combined tileset name, e.g. `Elevation_1_1`.
    pub fn combined_name(&self) -> String {
        format!("{}_{}_{}", self.dataset.name(), self.cs1, self.cs2)
    }
}

fn parse_selector(spec: &str, selector: &str) -> Result<u32, DatasetSpecError> {
    let bad = || DatasetSpecError::BadSelector {
        spec: spec.to_string(),
        selector: selector.to_string(),
    };
    if selector.is_empty() || !selector.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }
    let value: u32 = selector.parse().map_err(|_| bad())?;
    if value == 0 {
        return Err(bad());
    }
    Ok(value)
}

fn allowed_dataset_names() -> String {
    CDBDataset::ALL
        .iter()
        .map(|dataset| dataset.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Conversion options. The elevation tuning values are forwarded to the
/// content producer's mesher.
#[derive(Debug, Clone)]
pub struct ConverterOptions {
    /// Generate per-vertex normals for elevation meshes.
    pub elevation_normal: bool,
    /// Convert only the elevation LOD chain, skipping full-resolution leaves.
    pub elevation_lod: bool,
    /// Emit implicit tiling (subtree availability) instead of the explicit
    /// per-dataset trees.
    pub three_d_tiles_next: bool,
    /// Levels per subtree in implicit tiling.
    pub subtree_levels: u32,
    pub elevation_threshold_indices: f32,
    pub elevation_decimate_error: f32,
}

impl Default for ConverterOptions {
    fn default() -> Self {
        Self {
            elevation_normal: false,
            elevation_lod: false,
            three_d_tiles_next: false,
            subtree_levels: 7,
            elevation_threshold_indices: 0.3,
            elevation_decimate_error: 0.01,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// Per-tile failures. All of them skip the tile and continue, except a
/// container invariant violation, which aborts the conversion.
#[derive(Debug, Error)]
enum TileError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Container(#[from] ContainerError),
}

pub struct Converter<P> {
    cdb_path: PathBuf,
    output_path: PathBuf,
    options: ConverterOptions,
    producer: P,
    requested_combinations: Vec<Vec<DatasetSelector>>,
}

impl<P: ContentProducer> Converter<P> {
    pub fn new(cdb_path: &Path, output_path: &Path, options: ConverterOptions, producer: P) -> Self {
        Self {
            cdb_path: cdb_path.to_path_buf(),
            output_path: output_path.to_path_buf(),
            options,
            producer,
            requested_combinations: Vec::new(),
        }
    }

    pub fn options(&self) -> &ConverterOptions {
        &self.options
    }

    /// Request the datasets named by `specs` to be combined into one root.
    ///
    /// A request with fewer than two entries is skipped: such a tileset
    /// either does not exist or is already combined across geocells by
    /// default.
    pub fn combine_dataset(&mut self, specs: &[String]) -> Result<(), DatasetSpecError> {
        if specs.len() < 2 {
            debug!("ignoring combination request of {} dataset(s)", specs.len());
            return Ok(());
        }
        let combination = specs
            .iter()
            .map(|spec| DatasetSelector::from_spec(spec))
            .collect::<Result<Vec<_>, _>>()?;
        self.requested_combinations.push(combination);
        Ok(())
    }

    /// Run the conversion over every geocell of the store.
    pub fn convert(&mut self) -> Result<(), ConvertError> {
        let cdb = Cdb::new(&self.cdb_path)?;
        fs::create_dir_all(&self.output_path)?;

        // Per combined-name: the per-geocell tileset URIs with their regions,
        // and the aggregate region across geocells.
        let mut combined_tilesets: BTreeMap<String, Vec<(String, BoundingRegion)>> =
            BTreeMap::new();
        let mut aggregate_regions: BTreeMap<String, BoundingRegion> = BTreeMap::new();
        let mut subtrees = SubtreeSet::new(self.options.subtree_levels);

        for geocell in cdb.geocells() {
            info!("converting geocell {}", geocell);
            subtrees.clear();
            let mut flushed: Vec<(String, PathBuf, BoundingRegion)> = Vec::new();

            self.process_elevation(&cdb, &geocell, &mut subtrees, &mut flushed)?;

            if self.options.three_d_tiles_next {
                let subtree_dir = self
                    .output_path
                    .join(geocell.relative_path())
                    .join(CDBDataset::Elevation.name())
                    .join("subtrees");
                subtrees.write_all(&subtree_dir)?;
            } else {
                for dataset in VECTOR_DATASETS {
                    self.process_vectors(&cdb, &geocell, dataset, &mut flushed)?;
                }
                self.process_gt_models(&cdb, &geocell, &mut flushed)?;
                self.process_gs_models(&cdb, &geocell, &mut flushed)?;
            }

            let geocell_rectangle = geocell.rectangle();
            for (combined_name, path, root_region) in flushed {
                let region = BoundingRegion::new(
                    geocell_rectangle,
                    GEOCELL_MIN_HEIGHT,
                    root_region.max_height.max(0.0),
                );
                combined_tilesets
                    .entry(combined_name.clone())
                    .or_default()
                    .push((path_to_uri(&path), region));
                aggregate_regions
                    .entry(combined_name)
                    .and_modify(|aggregate| *aggregate = aggregate.union(&region))
                    .or_insert(region);
            }
        }

        self.write_combined_tilesets(&combined_tilesets, &aggregate_regions)?;
        Ok(())
    }

    fn process_elevation(
        &mut self,
        cdb: &Cdb,
        geocell: &CDBGeoCell,
        subtrees: &mut SubtreeSet,
        flushed: &mut Vec<(String, PathBuf, BoundingRegion)>,
    ) -> Result<(), ConvertError> {
        let mut collections: BTreeMap<(u32, u32), TilesetCollection> = BTreeMap::new();
        let mut parent_imagery = ParentImageryCache::default();
        let mut outcome: Result<(), ConvertError> = Ok(());
        let implicit = self.options.three_d_tiles_next;
        cdb.for_each_elevation_tile(geocell, |elevation| {
            if outcome.is_err() {
                return;
            }
            let tile = elevation.tile;
            if implicit && tile.level >= 0 {
                subtrees.record_tile(tile.level, tile.uref, tile.rref);
            }
            if let Err(err) = self.add_elevation(&elevation, &mut collections, &mut parent_imagery)
            {
                handle_tile_error(&tile, err, &mut outcome);
            }
        });
        outcome?;
        self.flush_collections(geocell, CDBDataset::Elevation, collections, flushed)?;
        // The imagery cache does not outlive the geocell flush
        parent_imagery.clear();
        Ok(())
    }

    fn add_elevation(
        &mut self,
        elevation: &CDBElevation,
        collections: &mut BTreeMap<(u32, u32), TilesetCollection>,
        parent_imagery: &mut ParentImageryCache,
    ) -> Result<(), TileError> {
        let tile = elevation.tile;
        let imagery_tile = imagery_address(&tile);
        let ElevationPayload {
            glb,
            min_height,
            max_height,
            texture,
        } = self
            .producer
            .elevation(elevation, parent_imagery.nearest_ancestor(&imagery_tile))?;
        if let Some(texture) = texture {
            parent_imagery.insert(imagery_tile, texture);
        }
        write_container(&self.output_path.join(tile.content_path()), |out| {
            write_b3dm(&glb, None, out)
        })?;
        let region = BoundingRegion::new(tile.rectangle(), min_height, max_height);
        collections
            .entry((tile.cs1, tile.cs2))
            .or_default()
            .add(tile, tile.content_uri(), region)?;
        Ok(())
    }

    fn process_vectors(
        &mut self,
        cdb: &Cdb,
        geocell: &CDBGeoCell,
        dataset: CDBDataset,
        flushed: &mut Vec<(String, PathBuf, BoundingRegion)>,
    ) -> Result<(), ConvertError> {
        let mut collections: BTreeMap<(u32, u32), TilesetCollection> = BTreeMap::new();
        let mut outcome: Result<(), ConvertError> = Ok(());
        cdb.for_each_vector_tile(geocell, dataset, |vector| {
            if outcome.is_err() {
                return;
            }
            if let Err(err) = self.add_vector(&vector, &mut collections) {
                handle_tile_error(&vector.tile, err, &mut outcome);
            }
        });
        outcome?;
        Ok(self.flush_collections(geocell, dataset, collections, flushed)?)
    }

    fn add_vector(
        &mut self,
        vector: &CDBGeometryVectors,
        collections: &mut BTreeMap<(u32, u32), TilesetCollection>,
    ) -> Result<(), TileError> {
        let tile = vector.tile;
        let payload = self.producer.vector(vector)?;
        write_container(&self.output_path.join(tile.content_path()), |out| {
            write_b3dm(&payload.glb, payload.attributes.as_ref(), out)
        })?;
        let region = BoundingRegion::new(tile.rectangle(), payload.min_height, payload.max_height);
        collections
            .entry((tile.cs1, tile.cs2))
            .or_default()
            .add(tile, tile.content_uri(), region)?;
        Ok(())
    }

    fn process_gt_models(
        &mut self,
        cdb: &Cdb,
        geocell: &CDBGeoCell,
        flushed: &mut Vec<(String, PathBuf, BoundingRegion)>,
    ) -> Result<(), ConvertError> {
        let mut collections: BTreeMap<(u32, u32), TilesetCollection> = BTreeMap::new();
        let mut outcome: Result<(), ConvertError> = Ok(());
        cdb.for_each_gt_model_tile(geocell, |models| {
            if outcome.is_err() {
                return;
            }
            if let Err(err) = self.add_gt_models(&models, &mut collections) {
                handle_tile_error(&models.tile, err, &mut outcome);
            }
        });
        outcome?;
        Ok(self.flush_collections(geocell, CDBDataset::GTModel, collections, flushed)?)
    }

    fn add_gt_models(
        &mut self,
        models: &CDBGTModels,
        collections: &mut BTreeMap<(u32, u32), TilesetCollection>,
    ) -> Result<(), TileError> {
        let tile = models.tile;
        let batches: Vec<_> = self
            .producer
            .gt_models(models)?
            .into_iter()
            .filter(|batch| !batch.positions.is_empty())
            .collect();
        if batches.is_empty() {
            debug!("tile {} has no model instances", tile);
            return Ok(());
        }

        let mut min_height = f64::INFINITY;
        let mut max_height = f64::NEG_INFINITY;
        for batch in &batches {
            for position in &batch.positions {
                min_height = min_height.min(position.height);
                max_height = max_height.max(position.height);
            }
        }

        // One i3dm per model class, wrapped in a composite
        write_container(&self.output_path.join(tile.content_path()), |out| {
            write_cmpt(out, batches.len() as u32, |out, index| {
                let batch = &batches[index];
                write_i3dm(
                    &batch.gltf_uri,
                    &batch.attributes,
                    &batch.positions,
                    &batch.scales,
                    &batch.headings,
                    out,
                )
            })
        })?;
        let region = BoundingRegion::new(tile.rectangle(), min_height, max_height);
        collections
            .entry((tile.cs1, tile.cs2))
            .or_default()
            .add(tile, tile.content_uri(), region)?;
        Ok(())
    }

    fn process_gs_models(
        &mut self,
        cdb: &Cdb,
        geocell: &CDBGeoCell,
        flushed: &mut Vec<(String, PathBuf, BoundingRegion)>,
    ) -> Result<(), ConvertError> {
        let mut collections: BTreeMap<(u32, u32), TilesetCollection> = BTreeMap::new();
        let mut outcome: Result<(), ConvertError> = Ok(());
        cdb.for_each_gs_model_tile(geocell, |models| {
            if outcome.is_err() {
                return;
            }
            if let Err(err) = self.add_gs_models(&models, &mut collections) {
                handle_tile_error(&models.tile, err, &mut outcome);
            }
        });
        outcome?;
        Ok(self.flush_collections(geocell, CDBDataset::GSModel, collections, flushed)?)
    }

    fn add_gs_models(
        &mut self,
        models: &CDBGSModels,
        collections: &mut BTreeMap<(u32, u32), TilesetCollection>,
    ) -> Result<(), TileError> {
        let tile = models.tile;
        let payload = self.producer.gs_models(models)?;
        write_container(&self.output_path.join(tile.content_path()), |out| {
            write_b3dm(&payload.glb, payload.attributes.as_ref(), out)
        })?;
        let region = BoundingRegion::new(tile.rectangle(), payload.min_height, payload.max_height);
        collections
            .entry((tile.cs1, tile.cs2))
            .or_default()
            .add(tile, tile.content_uri(), region)?;
        Ok(())
    }

    fn flush_collections(
        &self,
        geocell: &CDBGeoCell,
        dataset: CDBDataset,
        mut collections: BTreeMap<(u32, u32), TilesetCollection>,
        flushed: &mut Vec<(String, PathBuf, BoundingRegion)>,
    ) -> io::Result<()> {
        for ((cs1, cs2), collection) in collections.iter_mut() {
            let collection_dir = self
                .output_path
                .join(geocell.relative_path())
                .join(dataset.name())
                .join(format!("{}_{}", cs1, cs2));
            let Some(path) = collection.flush(&collection_dir, dataset.replace_refinement())?
            else {
                continue;
            };
            let combined_name = format!("{}_{}_{}", dataset.name(), cs1, cs2);
            info!(
                "flushed {} tiles of {} in geocell {}",
                collection.len(),
                combined_name,
                geocell
            );
            let root_region = collection.root_region().unwrap_or_default();
            let relative = path
                .strip_prefix(&self.output_path)
                .map(Path::to_path_buf)
                .unwrap_or(path);
            flushed.push((combined_name, relative, root_region));
        }
        Ok(())
    }

    fn write_combined_tilesets(
        &self,
        combined_tilesets: &BTreeMap<String, Vec<(String, BoundingRegion)>>,
        aggregate_regions: &BTreeMap<String, BoundingRegion>,
    ) -> io::Result<()> {
        if self.options.three_d_tiles_next {
            // One root referencing every per-geocell tileset directly
            let children: Vec<(String, BoundingRegion)> = combined_tilesets
                .values()
                .flat_map(|entries| entries.iter().cloned())
                .collect();
            return Tileset::combine(&children).to_file(self.output_path.join("tileset.json"));
        }

        for (name, children) in combined_tilesets {
            Tileset::combine(children).to_file(self.output_path.join(format!("{}.json", name)))?;
        }

        if self.requested_combinations.is_empty() {
            // Default: every converted dataset under one root
            let children: Vec<(String, BoundingRegion)> = aggregate_regions
                .iter()
                .map(|(name, region)| (format!("{}.json", name), *region))
                .collect();
            return Tileset::combine(&children).to_file(self.output_path.join("tileset.json"));
        }

        let single_request = self.requested_combinations.len() == 1;
        for combination in &self.requested_combinations {
            let file_name = if single_request {
                String::from("tileset.json")
            } else {
                let mut concatenated: String = combination
                    .iter()
                    .map(DatasetSelector::combined_name)
                    .collect();
                concatenated.push_str(".json");
                concatenated
            };
            let children: Vec<(String, BoundingRegion)> = combination
                .iter()
                .filter_map(|selector| {
                    let name = selector.combined_name();
                    aggregate_regions
                        .get(&name)
                        .map(|region| (format!("{}.json", name), *region))
                })
                .collect();
            Tileset::combine(&children).to_file(self.output_path.join(file_name))?;
        }
        Ok(())
    }
}

/// The imagery tile that shares an elevation tile's coverage.
fn imagery_address(tile: &CDBTileAddress) -> CDBTileAddress {
    let mut imagery = *tile;
    imagery.dataset = CDBDataset::Imagery;
    imagery.cs1 = 1;
    imagery.cs2 = 1;
    imagery
}

/// Assemble a container in memory, then land it on disk atomically.
fn write_container(
    path: &Path,
    write: impl FnOnce(&mut Cursor<Vec<u8>>) -> Result<u64, ContainerError>,
) -> Result<(), TileError> {
    let mut cursor = Cursor::new(Vec::new());
    write(&mut cursor)?;
    write_atomic(path, &cursor.into_inner())?;
    Ok(())
}

fn handle_tile_error(
    tile: &CDBTileAddress,
    err: TileError,
    outcome: &mut Result<(), ConvertError>,
) {
    match err {
        TileError::Container(violation @ ContainerError::InvariantViolation { .. }) => {
            error!("aborting: format invariant violated in tile {}: {}", tile, violation);
            *outcome = Err(ConvertError::Container(violation));
        }
        err => warn!("skipping tile {}: {}", tile, err),
    }
}

fn path_to_uri(path: &Path) -> String {
    path.iter()
        .map(|component| component.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_spec_parsing() {
        let selector = DatasetSelector::from_spec("Elevation_1_1").unwrap();
        assert_eq!(selector.dataset, CDBDataset::Elevation);
        assert_eq!((selector.cs1, selector.cs2), (1, 1));
        assert_eq!(selector.combined_name(), "Elevation_1_1");

        let selector = DatasetSelector::from_spec("GSModels_2_13").unwrap();
        assert_eq!(selector.dataset, CDBDataset::GSModel);
        assert_eq!((selector.cs1, selector.cs2), (2, 13));
    }

    #[test]
    fn test_dataset_spec_errors() {
        assert!(matches!(
            DatasetSelector::from_spec("Elevation"),
            Err(DatasetSpecError::Malformed { .. })
        ));
        assert!(matches!(
            DatasetSelector::from_spec("Elevation_1"),
            Err(DatasetSpecError::Malformed { .. })
        ));
        let err = DatasetSelector::from_spec("Bogus_1_1").unwrap_err();
        // The allowed dataset names are enumerated in the message
        let message = err.to_string();
        assert!(message.contains("Elevation"));
        assert!(message.contains("HydrographyNetwork"));
        assert!(matches!(err, DatasetSpecError::UnknownDataset { .. }));

        for spec in ["Elevation_x_1", "Elevation_1_", "Elevation_0_1", "Elevation_1_2_3"] {
            assert!(
                matches!(
                    DatasetSelector::from_spec(spec),
                    Err(DatasetSpecError::BadSelector { .. })
                ),
                "{}",
                spec
            );
        }
    }

    #[test]
    fn test_single_dataset_combination_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut converter = Converter::new(
            dir.path(),
            dir.path(),
            ConverterOptions::default(),
            crate::cdb::SidecarContent,
        );
        // Skipped before validation, matching the reference behavior
        converter
            .combine_dataset(&["NotEvenASpec".to_string()])
            .unwrap();
        assert!(converter.requested_combinations.is_empty());
        converter
            .combine_dataset(&["Elevation_1_1".to_string(), "GTModels_1_1".to_string()])
            .unwrap();
        assert_eq!(converter.requested_combinations.len(), 1);
        assert!(converter
            .combine_dataset(&["Elevation_1_1".to_string(), "Bogus_1_1".to_string()])
            .is_err());
    }

    #[test]
    fn test_path_to_uri_uses_forward_slashes() {
        let path: PathBuf = ["N12", "E023", "Elevation", "1_1", "tileset.json"]
            .iter()
            .collect();
        assert_eq!(path_to_uri(&path), "N12/E023/Elevation/1_1/tileset.json");
    }

    #[test]
    fn test_imagery_address_mirrors_elevation() {
        let tile = CDBTileAddress::new(
            CDBGeoCell::new(12, 23),
            CDBDataset::Elevation,
            1,
            1,
            3,
            2,
            5,
        );
        let imagery = imagery_address(&tile);
        assert_eq!(imagery.dataset, CDBDataset::Imagery);
        assert_eq!(
            (imagery.level, imagery.uref, imagery.rref),
            (tile.level, tile.uref, tile.rref)
        );
    }
}
