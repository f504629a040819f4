//! Convert an OGC CDB store into Cesium 3D Tiles.
//!
//! The pipeline walks the CDB tile pyramid geocell by geocell, accumulates
//! each dataset into a sparse quadtree, writes the tile payloads as B3DM,
//! I3DM and CMPT containers (plus subtree availability files in the 3D Tiles
//! Next mode), and combines everything under one root tileset.

pub mod cdb;
pub mod cdb_tile;
pub mod cli;
pub mod converter;
pub mod formats;
pub mod geo;
pub mod implicit;
pub mod tileset;

pub use cdb::{ContentProducer, SidecarContent};
pub use converter::{Converter, ConverterOptions};
