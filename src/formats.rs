//! Output formats for the tiles.

pub mod cesium3dtiles {
    //! Cesium [3D Tiles](https://github.com/CesiumGS/3d-tiles) tileset JSON.
    //!
    //! Two shapes are emitted: the per-collection tileset built from a
    //! [`TilesetCollection`], and the combined root whose children reference
    //! other tileset JSON files.

    use std::fs::File;
    use std::io;
    use std::io::BufWriter;
    use std::path::Path;

    use serde::Serialize;

    use crate::cdb_tile::CDBTileAddress;
    use crate::geo::BoundingRegion;
    use crate::tileset::TilesetCollection;

    /// Geometric error of every tileset root. Each level of refinement
    /// halves it; clients derive screen-space error from these numbers.
    pub const MAX_GEOMETRIC_ERROR: f64 = 300_000.0;

    /// [Tileset](https://github.com/CesiumGS/3d-tiles/tree/main/specification#tileset).
    ///
    /// Not supported: `properties`, `extensions`, `extras`.
    #[derive(Serialize, Default, Debug, Clone)]
    #[serde(rename_all = "camelCase")]
    pub struct Tileset {
        asset: Asset,
        geometric_error: f64,
        root: Tile,
    }

    impl Tileset {
        /// Write the tileset to a `tileset.json` file.
        pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
            let file_out = BufWriter::new(File::create(path.as_ref())?);
            serde_json::to_writer(file_out, self).map_err(io::Error::from)
        }

        /// Build the explicit tile tree of one collection.
        ///
        /// `replace_mode` selects the refinement of the root: REPLACE for
        /// terrain and imagery, ADD for vector and model overlays.
        pub fn from_collection(collection: &TilesetCollection, replace_mode: bool) -> Self {
            let refine = if replace_mode {
                Refinement::Replace
            } else {
                Refinement::Add
            };
            let root = match collection.root() {
                Some(address) => {
                    let mut root = Self::generate_tiles(collection, address, MAX_GEOMETRIC_ERROR);
                    root.refine = Some(refine);
                    root
                }
                None => Tile {
                    refine: Some(refine),
                    geometric_error: MAX_GEOMETRIC_ERROR,
                    ..Default::default()
                },
            };
            Self {
                asset: Default::default(),
                geometric_error: root.geometric_error,
                root,
            }
        }

        fn generate_tiles(
            collection: &TilesetCollection,
            address: CDBTileAddress,
            geometric_error: f64,
        ) -> Tile {
            let subtree_region = collection.subtree_region(&address);
            // The tile spans its full address rectangle; heights come from
            // the content found underneath it.
            let tile_region = BoundingRegion::new(
                address.rectangle(),
                subtree_region.min_height,
                subtree_region.max_height,
            );

            let content = collection.node(&address).and_then(|node| {
                let uri = node.content_uri.clone()?;
                let bounding_volume = node
                    .content_region
                    .filter(|region| *region != tile_region)
                    .map(BoundingVolume::from);
                Some(Content {
                    bounding_volume,
                    uri,
                })
            });

            let children: Vec<Tile> = collection
                .children_of(&address)
                .into_iter()
                .map(|child| Self::generate_tiles(collection, child, geometric_error / 2.0))
                .collect();

            Tile {
                bounding_volume: BoundingVolume::from(tile_region),
                geometric_error,
                refine: None,
                content,
                children: if children.is_empty() {
                    None
                } else {
                    Some(children)
                },
            }
        }

        /// Build a combined root referencing child tileset JSON files.
        ///
        /// The root's region is the union of all child regions; every child
        /// becomes a content-only tile pointing at its tileset JSON.
        pub fn combine(children: &[(String, BoundingRegion)]) -> Self {
            let mut root_region: Option<BoundingRegion> = None;
            let mut root_children = Vec::with_capacity(children.len());
            for (uri, region) in children {
                root_region = Some(match root_region {
                    Some(r) => r.union(region),
                    None => *region,
                });
                root_children.push(Tile {
                    bounding_volume: BoundingVolume::from(*region),
                    geometric_error: MAX_GEOMETRIC_ERROR,
                    refine: None,
                    content: Some(Content {
                        bounding_volume: None,
                        uri: uri.clone(),
                    }),
                    children: None,
                });
            }
            let root = Tile {
                bounding_volume: BoundingVolume::from(root_region.unwrap_or_default()),
                geometric_error: MAX_GEOMETRIC_ERROR,
                refine: Some(Refinement::Add),
                content: None,
                children: if root_children.is_empty() {
                    None
                } else {
                    Some(root_children)
                },
            };
            Self {
                asset: Default::default(),
                geometric_error: MAX_GEOMETRIC_ERROR,
                root,
            }
        }
    }

    /// [Asset](https://github.com/CesiumGS/3d-tiles/tree/main/specification#asset).
    #[derive(Serialize, Debug, Clone)]
    #[serde(rename_all = "camelCase")]
    struct Asset {
        version: String,
    }

    impl Default for Asset {
        fn default() -> Self {
            Self {
                version: String::from("1.0"),
            }
        }
    }

    /// [Tile](https://github.com/CesiumGS/3d-tiles/tree/main/specification#tile).
    #[derive(Serialize, Default, Debug, Clone)]
    #[serde(rename_all = "camelCase")]
    pub struct Tile {
        bounding_volume: BoundingVolume,
        geometric_error: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        refine: Option<Refinement>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<Content>,
        #[serde(skip_serializing_if = "Option::is_none")]
        children: Option<Vec<Tile>>,
    }

    /// [boundingVolume](https://github.com/CesiumGS/3d-tiles/tree/main/specification#bounding-volume).
    /// Only the `region` volume is emitted; CDB rectangles are geodetic
    /// already.
    #[derive(Serialize, Debug, Copy, Clone)]
    #[serde(rename_all = "lowercase")]
    enum BoundingVolume {
        Region([f64; 6]),
    }

    impl Default for BoundingVolume {
        fn default() -> Self {
            Self::Region([0.0; 6])
        }
    }

    impl From<BoundingRegion> for BoundingVolume {
        fn from(region: BoundingRegion) -> Self {
            Self::Region(region.to_array())
        }
    }

    /// [Tile.refine](https://github.com/CesiumGS/3d-tiles/tree/main/specification#tilerefine).
    #[derive(Serialize, Debug, Copy, Clone)]
    #[serde(rename_all = "UPPERCASE")]
    enum Refinement {
        Add,
        Replace,
    }

    /// [Tile.content](https://github.com/CesiumGS/3d-tiles/tree/main/specification#content).
    #[derive(Serialize, Default, Debug, Clone)]
    #[serde(rename_all = "camelCase")]
    struct Content {
        #[serde(skip_serializing_if = "Option::is_none")]
        bounding_volume: Option<BoundingVolume>,
        uri: String,
    }

}

pub mod container {
    //! Binary tile containers: B3DM, I3DM and CMPT.
    //!
    //! Every writer follows the same discipline: all section lengths are
    //! computed up front, every section is padded to an 8 byte boundary
    //! (spaces for JSON, zeros for binary), and the header's total byte
    //! length is verified against the bytes actually written. CMPT is the
    //! one format whose header is rewritten after the fact, because inner
    //! tile lengths are only known once they are written.

    use std::fs;
    use std::io;
    use std::io::{Seek, SeekFrom, Write};
    use std::path::Path;

    use serde_json::{json, Map, Value};
    use thiserror::Error;

    use crate::cdb::InstanceAttributes;
    use crate::geo::{instance_axes, Cartographic};

    pub const B3DM_HEADER_BYTE_LENGTH: usize = 28;
    pub const I3DM_HEADER_BYTE_LENGTH: usize = 32;
    pub const CMPT_HEADER_BYTE_LENGTH: usize = 16;

    #[derive(Debug, Error)]
    pub enum ContainerError {
        #[error(transparent)]
        Io(#[from] io::Error),
        /// The computed total byte length disagrees with the bytes written.
        /// This is an internal assertion; conversion aborts on it.
        #[error("{container} byte length mismatch: header declares {declared}, wrote {actual}")]
        InvariantViolation {
            container: &'static str,
            declared: u64,
            actual: u64,
        },
    }

    /// Bytes needed to reach the next 8 byte boundary after `length`.
    fn padding_to_8(length: usize) -> usize {
        (8 - length % 8) % 8
    }

    /// Pad a JSON section with ASCII spaces so that it ends on an 8 byte
    /// boundary, taking the bytes already written before it into account.
    fn pad_json_section(json: &mut String, preceding_byte_length: usize) {
        let padding = padding_to_8(preceding_byte_length + json.len());
        for _ in 0..padding {
            json.push(' ');
        }
    }

    /// Pad a binary section with zero bytes to an 8 byte boundary.
    fn pad_binary_section(buffer: &mut Vec<u8>) {
        let padded = buffer.len() + padding_to_8(buffer.len());
        buffer.resize(padded, 0);
    }

    /// Serialize the batch table of a tile.
    ///
    /// String-valued columns (and the special `CNAM` class column) go into
    /// the batch table JSON directly. Integer columns are packed into the
    /// binary as 32-bit signed little-endian; after 8 byte alignment the
    /// double columns follow. The JSON carries their byte offsets.
    fn build_batch_table(instances: Option<&InstanceAttributes>) -> (String, Vec<u8>) {
        let Some(instances) = instances else {
            return (String::new(), Vec::new());
        };

        let mut batch_table = Map::new();
        batch_table.insert("CNAM".to_string(), json!(instances.cnams));
        for (name, column) in &instances.string_attribs {
            batch_table.insert(name.clone(), json!(column));
        }

        let mut buffer = Vec::new();
        for (name, column) in &instances.integer_attribs {
            let byte_offset = buffer.len();
            for value in column {
                buffer.extend_from_slice(&value.to_le_bytes());
            }
            batch_table.insert(
                name.clone(),
                json!({
                    "byteOffset": byte_offset,
                    "componentType": "INT",
                    "type": "SCALAR",
                }),
            );
        }
        pad_binary_section(&mut buffer);
        for (name, column) in &instances.double_attribs {
            let byte_offset = buffer.len();
            for value in column {
                buffer.extend_from_slice(&value.to_le_bytes());
            }
            batch_table.insert(
                name.clone(),
                json!({
                    "byteOffset": byte_offset,
                    "componentType": "DOUBLE",
                    "type": "SCALAR",
                }),
            );
        }
        pad_binary_section(&mut buffer);

        let mut json = Value::Object(batch_table).to_string();
        pad_json_section(&mut json, 0);
        (json, buffer)
    }

    /// Write a Batched 3D Model tile embedding `glb` and return its total
    /// byte length.
    pub fn write_b3dm<W: Write>(
        glb: &[u8],
        instances: Option<&InstanceAttributes>,
        out: &mut W,
    ) -> Result<u64, ContainerError> {
        let batch_length = instances.map(|i| i.instances_count()).unwrap_or(0);
        let mut feature_table_json = format!("{{\"BATCH_LENGTH\":{}}}", batch_length);
        pad_json_section(&mut feature_table_json, B3DM_HEADER_BYTE_LENGTH);

        let (batch_table_json, batch_table_bin) = build_batch_table(instances);

        let glb_padding = padding_to_8(glb.len());
        let glb_byte_length = glb.len() + glb_padding;

        let byte_length = (B3DM_HEADER_BYTE_LENGTH
            + feature_table_json.len()
            + batch_table_json.len()
            + batch_table_bin.len()
            + glb_byte_length) as u64;

        out.write_all(b"b3dm")?;
        out.write_all(&1u32.to_le_bytes())?;
        out.write_all(&(byte_length as u32).to_le_bytes())?;
        out.write_all(&(feature_table_json.len() as u32).to_le_bytes())?;
        // The b3dm feature table has no binary section
        out.write_all(&0u32.to_le_bytes())?;
        out.write_all(&(batch_table_json.len() as u32).to_le_bytes())?;
        out.write_all(&(batch_table_bin.len() as u32).to_le_bytes())?;
        out.write_all(feature_table_json.as_bytes())?;
        out.write_all(batch_table_json.as_bytes())?;
        out.write_all(&batch_table_bin)?;
        out.write_all(glb)?;
        out.write_all(&vec![0u8; glb_padding])?;
        Ok(byte_length)
    }

    /// Write an Instanced 3D Model tile referencing an external glTF asset
    /// and return its total byte length.
    ///
    /// The feature table stores per-instance positions relative to an RTC
    /// center (the midpoint of the instance bounding box in ECEF), non
    /// uniform scales, and the up and right axes of each instance's
    /// rotation.
    pub fn write_i3dm<W: Write>(
        gltf_uri: &str,
        instances: &InstanceAttributes,
        positions: &[Cartographic],
        scales: &[[f32; 3]],
        headings: &[f64],
        out: &mut W,
    ) -> Result<u64, ContainerError> {
        let total_instances = positions.len();
        if total_instances == 0 {
            return Err(ContainerError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "an i3dm needs at least one instance",
            )));
        }
        if scales.len() != total_instances
            || headings.len() != total_instances
            || instances.instances_count() != total_instances
        {
            return Err(ContainerError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "instance columns must all have the same length",
            )));
        }

        // Find the RTC center from the world positions
        let world_positions: Vec<[f64; 3]> = positions.iter().map(|p| p.to_ecef()).collect();
        let mut min = world_positions[0];
        let mut max = world_positions[0];
        for position in &world_positions[1..] {
            for i in 0..3 {
                min[i] = min[i].min(position[i]);
                max[i] = max[i].max(position[i]);
            }
        }
        let center = [
            (min[0] + max[0]) / 2.0,
            (min[1] + max[1]) / 2.0,
            (min[2] + max[2]) / 2.0,
        ];

        let vec3_byte_length = 3 * std::mem::size_of::<f32>();
        let position_offset = 0;
        let scale_offset = total_instances * vec3_byte_length;
        let normal_up_offset = scale_offset + total_instances * vec3_byte_length;
        let normal_right_offset = normal_up_offset + total_instances * vec3_byte_length;

        let feature_table = json!({
            "INSTANCES_LENGTH": total_instances,
            "RTC_CENTER": center,
            "POSITION": {"byteOffset": position_offset},
            "SCALE_NON_UNIFORM": {"byteOffset": scale_offset},
            "NORMAL_UP": {"byteOffset": normal_up_offset},
            "NORMAL_RIGHT": {"byteOffset": normal_right_offset},
        });
        let mut feature_table_json = feature_table.to_string();
        pad_json_section(&mut feature_table_json, I3DM_HEADER_BYTE_LENGTH);

        let mut feature_table_bin =
            Vec::with_capacity(normal_right_offset + total_instances * vec3_byte_length);
        fn write_vec3(buffer: &mut Vec<u8>, v: [f32; 3]) {
            for component in v {
                buffer.extend_from_slice(&component.to_le_bytes());
            }
        }
        for position in &world_positions {
            write_vec3(
                &mut feature_table_bin,
                [
                    (position[0] - center[0]) as f32,
                    (position[1] - center[1]) as f32,
                    (position[2] - center[2]) as f32,
                ],
            );
        }
        for scale in scales {
            write_vec3(&mut feature_table_bin, *scale);
        }
        let axes: Vec<([f64; 3], [f64; 3])> = positions
            .iter()
            .zip(headings)
            .map(|(position, heading)| instance_axes(position, *heading))
            .collect();
        for (up, _) in &axes {
            write_vec3(
                &mut feature_table_bin,
                [up[0] as f32, up[1] as f32, up[2] as f32],
            );
        }
        for (_, right) in &axes {
            write_vec3(
                &mut feature_table_bin,
                [right[0] as f32, right[1] as f32, right[2] as f32],
            );
        }
        pad_binary_section(&mut feature_table_bin);

        let (batch_table_json, batch_table_bin) = build_batch_table(Some(instances));

        let mut uri = String::from(gltf_uri);
        pad_json_section(&mut uri, 0);

        let byte_length = (I3DM_HEADER_BYTE_LENGTH
            + feature_table_json.len()
            + feature_table_bin.len()
            + batch_table_json.len()
            + batch_table_bin.len()
            + uri.len()) as u64;

        out.write_all(b"i3dm")?;
        out.write_all(&1u32.to_le_bytes())?;
        out.write_all(&(byte_length as u32).to_le_bytes())?;
        out.write_all(&(feature_table_json.len() as u32).to_le_bytes())?;
        out.write_all(&(feature_table_bin.len() as u32).to_le_bytes())?;
        out.write_all(&(batch_table_json.len() as u32).to_le_bytes())?;
        out.write_all(&(batch_table_bin.len() as u32).to_le_bytes())?;
        // gltfFormat 0: the glTF payload is a URI
        out.write_all(&0u32.to_le_bytes())?;
        out.write_all(feature_table_json.as_bytes())?;
        out.write_all(&feature_table_bin)?;
        out.write_all(batch_table_json.as_bytes())?;
        out.write_all(&batch_table_bin)?;
        out.write_all(uri.as_bytes())?;
        Ok(byte_length)
    }

    /// Write a Composite tile whose inner tiles are produced by
    /// `write_inner`, called once per inner tile with the output stream and
    /// the tile index.
    ///
    /// The header is written twice: a placeholder first, then the real one
    /// once the accumulated inner byte lengths are known.
    pub fn write_cmpt<W: Write + Seek>(
        out: &mut W,
        tiles_count: u32,
        mut write_inner: impl FnMut(&mut W, usize) -> Result<u64, ContainerError>,
    ) -> Result<u64, ContainerError> {
        let header_position = out.stream_position()?;
        let mut byte_length = CMPT_HEADER_BYTE_LENGTH as u64;
        write_cmpt_header(out, byte_length, tiles_count)?;

        for index in 0..tiles_count {
            byte_length += write_inner(out, index as usize)?;
        }

        let end_position = out.stream_position()?;
        if end_position - header_position != byte_length {
            return Err(ContainerError::InvariantViolation {
                container: "cmpt",
                declared: byte_length,
                actual: end_position - header_position,
            });
        }
        out.seek(SeekFrom::Start(header_position))?;
        write_cmpt_header(out, byte_length, tiles_count)?;
        out.seek(SeekFrom::Start(end_position))?;
        Ok(byte_length)
    }

    /// Write a finished container to disk through a temp-file-then-rename
    /// step, so that an aborted run never leaves a partially written file
    /// behind. Parent directories are created as needed.
    pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("bad path {:?}", path))
            })?;
        let tmp = path.with_file_name(format!("{}.tmp", file_name));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)
    }

    fn write_cmpt_header<W: Write>(
        out: &mut W,
        byte_length: u64,
        tiles_count: u32,
    ) -> Result<(), ContainerError> {
        out.write_all(b"cmpt")?;
        out.write_all(&1u32.to_le_bytes())?;
        out.write_all(&(byte_length as u32).to_le_bytes())?;
        out.write_all(&tiles_count.to_le_bytes())?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::io::Cursor;

        struct TileSections {
            byte_length: u32,
            feature_table_json: String,
            feature_table_bin: Vec<u8>,
            batch_table_json: String,
            batch_table_bin: Vec<u8>,
            tail: Vec<u8>,
        }

        fn u32_at(bytes: &[u8], offset: usize) -> u32 {
            u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
        }

        /// Split a b3dm/i3dm byte stream into its declared sections.
        fn read_sections(bytes: &[u8], header_byte_length: usize) -> TileSections {
            let byte_length = u32_at(bytes, 8);
            let ft_json_len = u32_at(bytes, 12) as usize;
            let ft_bin_len = u32_at(bytes, 16) as usize;
            let bt_json_len = u32_at(bytes, 20) as usize;
            let bt_bin_len = u32_at(bytes, 24) as usize;
            for section in [ft_json_len, ft_bin_len, bt_json_len, bt_bin_len] {
                assert_eq!(section % 8, 0, "sections must be 8-byte aligned");
            }
            let mut offset = header_byte_length;
            let mut take = |len: usize| {
                let slice = bytes[offset..offset + len].to_vec();
                offset += len;
                slice
            };
            let feature_table_json = String::from_utf8(take(ft_json_len)).unwrap();
            let feature_table_bin = take(ft_bin_len);
            let batch_table_json = String::from_utf8(take(bt_json_len)).unwrap();
            let batch_table_bin = take(bt_bin_len);
            let tail = bytes[offset..].to_vec();
            TileSections {
                byte_length,
                feature_table_json,
                feature_table_bin,
                batch_table_json,
                batch_table_bin,
                tail,
            }
        }

        fn f32_slice(bytes: &[u8]) -> Vec<f32> {
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                .collect()
        }

        #[test]
        fn test_b3dm_without_features() {
            // S3: no attribute table, BATCH_LENGTH 0, empty batch table
            let glb = vec![0xAB; 13];
            let mut bytes = Vec::new();
            let written = write_b3dm(&glb, None, &mut bytes).unwrap();
            assert_eq!(&bytes[0..4], b"b3dm");
            assert_eq!(u32_at(&bytes, 4), 1);
            assert_eq!(written, bytes.len() as u64);

            let sections = read_sections(&bytes, B3DM_HEADER_BYTE_LENGTH);
            assert_eq!(sections.byte_length as usize, bytes.len());
            assert_eq!(
                sections.feature_table_json.trim_end(),
                "{\"BATCH_LENGTH\":0}"
            );
            // Header plus feature table JSON lands on an 8 byte boundary
            assert_eq!(
                (B3DM_HEADER_BYTE_LENGTH + sections.feature_table_json.len()) % 8,
                0
            );
            assert!(sections.feature_table_bin.is_empty());
            assert!(sections.batch_table_json.is_empty());
            assert!(sections.batch_table_bin.is_empty());
            // GLB zero-padded to 8 bytes
            assert_eq!(sections.tail.len(), 16);
            assert_eq!(&sections.tail[..13], &glb[..]);
            assert_eq!(&sections.tail[13..], &[0, 0, 0]);
        }

        #[test]
        fn test_b3dm_batch_table_layout() {
            let mut instances = InstanceAttributes::default();
            instances.cnams = vec!["a".into(), "b".into(), "c".into()];
            instances
                .integer_attribs
                .insert("AHGT".into(), vec![1, 0, 1]);
            instances
                .double_attribs
                .insert("BBH".into(), vec![4.5, 6.0, 7.25]);
            instances
                .string_attribs
                .insert("MODL".into(), vec!["x".into(), "y".into(), "z".into()]);

            let mut bytes = Vec::new();
            write_b3dm(&[0u8; 8], Some(&instances), &mut bytes).unwrap();
            let sections = read_sections(&bytes, B3DM_HEADER_BYTE_LENGTH);
            assert_eq!(sections.byte_length as usize, bytes.len());
            assert!(sections
                .feature_table_json
                .starts_with("{\"BATCH_LENGTH\":3}"));

            let batch_table: serde_json::Value =
                serde_json::from_str(&sections.batch_table_json).unwrap();
            assert_eq!(batch_table["CNAM"], serde_json::json!(["a", "b", "c"]));
            assert_eq!(batch_table["MODL"], serde_json::json!(["x", "y", "z"]));
            assert_eq!(batch_table["AHGT"]["componentType"], "INT");
            assert_eq!(batch_table["BBH"]["componentType"], "DOUBLE");

            // Three i32, padding to 8, then three f64
            let int_offset = batch_table["AHGT"]["byteOffset"].as_u64().unwrap() as usize;
            let double_offset = batch_table["BBH"]["byteOffset"].as_u64().unwrap() as usize;
            assert_eq!(int_offset, 0);
            assert_eq!(double_offset, 16);
            assert_eq!(sections.batch_table_bin.len(), 40);
            let first =
                i32::from_le_bytes(sections.batch_table_bin[0..4].try_into().unwrap());
            assert_eq!(first, 1);
            let bbh = f64::from_le_bytes(
                sections.batch_table_bin[double_offset..double_offset + 8]
                    .try_into()
                    .unwrap(),
            );
            assert_eq!(bbh, 4.5);
        }

        #[test]
        fn test_i3dm_rtc_and_normals() {
            // S4: two instances straddling the prime meridian at the equator
            let positions = vec![
                Cartographic::from_degrees(0.0, 0.0, 0.0),
                Cartographic::from_degrees(0.001, 0.0, 0.0),
            ];
            let scales = vec![[1.0, 1.0, 1.0]; 2];
            let headings = vec![0.0; 2];
            let mut instances = InstanceAttributes::default();
            instances.cnams = vec!["tree".into(), "tree".into()];

            let mut bytes = Vec::new();
            let written = write_i3dm(
                "models/tree.gltf",
                &instances,
                &positions,
                &scales,
                &headings,
                &mut bytes,
            )
            .unwrap();
            assert_eq!(&bytes[0..4], b"i3dm");
            assert_eq!(u32_at(&bytes, 4), 1);
            assert_eq!(written, bytes.len() as u64);
            assert_eq!(u32_at(&bytes, 8) as usize, bytes.len());
            // gltfFormat 0 marks an external URI
            assert_eq!(u32_at(&bytes, 28), 0);

            let sections = read_sections(&bytes, I3DM_HEADER_BYTE_LENGTH);
            let feature_table: serde_json::Value =
                serde_json::from_str(&sections.feature_table_json).unwrap();
            assert_eq!(feature_table["INSTANCES_LENGTH"], 2);

            // RTC center is the midpoint of the two world positions
            let world: Vec<[f64; 3]> = positions.iter().map(|p| p.to_ecef()).collect();
            let rtc: Vec<f64> = feature_table["RTC_CENTER"]
                .as_array()
                .unwrap()
                .iter()
                .map(|v| v.as_f64().unwrap())
                .collect();
            for i in 0..3 {
                assert!((rtc[i] - (world[0][i] + world[1][i]) / 2.0).abs() < 1e-9);
            }

            let floats = f32_slice(&sections.feature_table_bin);
            let position_base =
                feature_table["POSITION"]["byteOffset"].as_u64().unwrap() as usize / 4;
            // Symmetric around the center: the two offsets cancel
            for i in 0..3 {
                let sum = floats[position_base + i] + floats[position_base + 3 + i];
                assert!(sum.abs() < 1e-3, "position sum {}", sum);
            }

            let up_base =
                feature_table["NORMAL_UP"]["byteOffset"].as_u64().unwrap() as usize / 4;
            let right_base = feature_table["NORMAL_RIGHT"]["byteOffset"]
                .as_u64()
                .unwrap() as usize
                / 4;
            // At (0°, 0°) up is the +X ellipsoid normal and right is east (+Y)
            assert!((floats[up_base] - 1.0).abs() < 1e-6);
            assert!(floats[up_base + 1].abs() < 1e-6);
            assert!((floats[right_base + 1] - 1.0).abs() < 1e-6);

            // The external URI is space padded to 8 bytes
            let uri = String::from_utf8(sections.tail).unwrap();
            assert_eq!(uri.len() % 8, 0);
            assert_eq!(uri.trim_end(), "models/tree.gltf");

            // RTC invariant: no instance offset exceeds half the bbox diagonal
            let diag: f64 = (0..3)
                .map(|i| (world[1][i] - world[0][i]).powi(2))
                .sum::<f64>()
                .sqrt();
            for instance in 0..2 {
                let norm: f32 = (0..3)
                    .map(|i| floats[position_base + instance * 3 + i].powi(2))
                    .sum::<f32>()
                    .sqrt();
                assert!(norm as f64 <= 0.5 * diag + 1e-3);
            }
        }

        #[test]
        fn test_i3dm_rejects_mismatched_columns() {
            let positions = vec![Cartographic::from_degrees(0.0, 0.0, 0.0)];
            let instances = InstanceAttributes::default();
            let mut bytes = Vec::new();
            let err = write_i3dm(
                "m.gltf",
                &instances,
                &positions,
                &[[1.0, 1.0, 1.0]],
                &[0.0],
                &mut bytes,
            )
            .unwrap_err();
            assert!(matches!(err, ContainerError::Io(_)));
        }

        #[test]
        fn test_cmpt_of_two_b3dm() {
            // S5: inner tiles of 256 and 512 bytes at offsets 16 and 272
            let mut cursor = Cursor::new(Vec::new());
            let total = write_cmpt(&mut cursor, 2, |out, index| {
                // 28 header + 20 feature table + glb = 256 / 512
                let glb_len = if index == 0 { 208 } else { 464 };
                write_b3dm(&vec![0u8; glb_len], None, out)
            })
            .unwrap();
            assert_eq!(total, 16 + 256 + 512);

            let bytes = cursor.into_inner();
            assert_eq!(bytes.len() as u64, total);
            assert_eq!(&bytes[0..4], b"cmpt");
            assert_eq!(u32_at(&bytes, 4), 1);
            assert_eq!(u32_at(&bytes, 8), 784);
            assert_eq!(u32_at(&bytes, 12), 2);
            // Inner tile boundaries
            assert_eq!(&bytes[16..20], b"b3dm");
            assert_eq!(u32_at(&bytes, 16 + 8), 256);
            assert_eq!(&bytes[272..276], b"b3dm");
            assert_eq!(u32_at(&bytes, 272 + 8), 512);
        }
    }
}
