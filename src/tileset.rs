//! Per-dataset, per-geocell tileset collections.
//!
//! A collection is a sparse quadtree over CDB tile addresses. Inserting a
//! tile materializes all of its structural ancestors up to the collection
//! root, so the tree that reaches the JSON emitter is always connected.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

use crate::cdb_tile::CDBTileAddress;
use crate::formats::cesium3dtiles::Tileset;
use crate::geo::BoundingRegion;

/// A tile whose rectangle escapes its structural parent. This happens when a
/// source tile carries an address that is inconsistent with the quadtree, and
/// the offending tile is skipped.
#[derive(Debug, Error)]
#[error("tile {tile} is not contained in its structural parent {parent}")]
pub struct TopologyError {
    pub tile: CDBTileAddress,
    pub parent: CDBTileAddress,
}

/// One node of the sparse quadtree. Structural nodes materialized for
/// connectivity carry neither content nor a region.
#[derive(Debug, Default, Clone)]
pub struct TileNode {
    pub content_uri: Option<String>,
    pub content_region: Option<BoundingRegion>,
}

/// Accumulates the tiles of a single dataset within one geocell.
///
/// Keys sort by (level, UREF, RREF) within a collection, which fixes the
/// traversal order of the emitter independently of insertion order.
#[derive(Debug, Default)]
pub struct TilesetCollection {
    nodes: BTreeMap<CDBTileAddress, TileNode>,
    root: Option<CDBTileAddress>,
    flushed_to: Option<PathBuf>,
}

impl TilesetCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tile with its content URI and bounding region, materializing
    /// structural ancestors as needed.
    ///
    /// The collection root sits at the lowest negative level seen so far (or
    /// level 0 when no aggregate tiles exist).
    pub fn add(
        &mut self,
        tile: CDBTileAddress,
        content_uri: String,
        region: BoundingRegion,
    ) -> Result<(), TopologyError> {
        if !tile.is_valid() {
            let parent = tile.parent().unwrap_or(tile);
            return Err(TopologyError { tile, parent });
        }
        let target_root_level = self
            .root
            .map(|r| r.level)
            .unwrap_or(0)
            .min(tile.level)
            .min(0);

        // Walk to the root first; nothing is materialized until the whole
        // chain checks out.
        let mut chain = vec![tile];
        let mut current = tile;
        while current.level > target_root_level {
            let parent = current.parent().expect("target root is above MIN_LEVEL");
            if !parent.rectangle().contains(&current.rectangle()) {
                return Err(TopologyError {
                    tile: current,
                    parent,
                });
            }
            chain.push(parent);
            current = parent;
        }

        for address in &chain {
            self.nodes.entry(*address).or_default();
        }
        self.root = Some(current);

        let node = self.nodes.get_mut(&tile).expect("just materialized");
        if node.content_uri.is_some() {
            debug!("replacing content of tile {}", tile);
        }
        node.content_uri = Some(content_uri);
        node.content_region = Some(region);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> Option<CDBTileAddress> {
        self.root
    }

    pub fn node(&self, address: &CDBTileAddress) -> Option<&TileNode> {
        self.nodes.get(address)
    }

    /// The children of `address` that exist in the collection, in
    /// (UREF, RREF) order.
    pub fn children_of(&self, address: &CDBTileAddress) -> Vec<CDBTileAddress> {
        address
            .children()
            .into_iter()
            .filter(|child| self.nodes.contains_key(child))
            .collect()
    }

    /// The bounding region of the subtree rooted at `address`: the union of
    /// the node's own content region and its children's regions. A bare
    /// structural node falls back to its address rectangle with a zero height
    /// interval.
    pub fn subtree_region(&self, address: &CDBTileAddress) -> BoundingRegion {
        let node = self.nodes.get(address);
        let mut region = node.and_then(|n| n.content_region);
        for child in self.children_of(address) {
            let child_region = self.subtree_region(&child);
            region = Some(match region {
                Some(r) => r.union(&child_region),
                None => child_region,
            });
        }
        region.unwrap_or_else(|| BoundingRegion::new(address.rectangle(), 0.0, 0.0))
    }

    /// The bounding region of the whole collection.
    pub fn root_region(&self) -> Option<BoundingRegion> {
        self.root.map(|root| self.subtree_region(&root))
    }

    /// Write the collection's `tileset.json` into `collection_dir` and return
    /// its path. Idempotent: a second flush returns the recorded path without
    /// rewriting. An empty collection flushes to nothing.
    pub fn flush(&mut self, collection_dir: &Path, replace_mode: bool) -> io::Result<Option<PathBuf>> {
        if self.nodes.is_empty() {
            return Ok(None);
        }
        if let Some(path) = &self.flushed_to {
            return Ok(Some(path.clone()));
        }
        std::fs::create_dir_all(collection_dir)?;
        let path = collection_dir.join("tileset.json");
        Tileset::from_collection(self, replace_mode).to_file(&path)?;
        self.flushed_to = Some(path.clone());
        Ok(Some(path))
    }
}

/// Handle to a decoded imagery tile kept around for descendants that need
/// their ancestor's texture.
#[derive(Debug, Clone)]
pub struct Texture {
    pub path: PathBuf,
}

/// Cache of processed parent imagery, keyed by tile address and scoped to
/// one geocell pass.
#[derive(Debug, Default)]
pub struct ParentImageryCache {
    cache: HashMap<CDBTileAddress, Texture>,
}

impl ParentImageryCache {
    pub fn insert(&mut self, tile: CDBTileAddress, texture: Texture) {
        self.cache.insert(tile, texture);
    }

    /// The texture cached for `tile` or for its nearest ancestor.
    pub fn nearest_ancestor(&self, tile: &CDBTileAddress) -> Option<&Texture> {
        let mut current = Some(*tile);
        while let Some(address) = current {
            if let Some(texture) = self.cache.get(&address) {
                return Some(texture);
            }
            current = address.parent();
        }
        None
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
