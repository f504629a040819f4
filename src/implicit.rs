//! Implicit tiling: subtree availability bitmaps.
//!
//! In the 3D Tiles Next output mode the quadtree is not spelled out as
//! explicit tile JSON; instead fixed-depth subtrees carry two bitmaps, one
//! marking which tiles exist and one marking which child subtrees exist.
//! [`SubtreeSet`] accumulates those bitmaps while tiles stream by and
//! serializes each subtree into the `.subtree` binary format.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::io;
use std::path::Path;

use bitvec::prelude as bv;
use log::debug;
use morton_encoding::morton_encode;
use rayon::prelude::*;
use serde::Serialize;
use serde_repr::Serialize_repr;

pub const SUBTREE_HEADER_BYTE_LENGTH: usize = 24;

fn align_to_8(value: usize) -> usize {
    (value + 7) & !7
}

/// Number of quadtree nodes above depth `delta`: (4^delta − 1) / 3.
fn level_offset(delta: u32) -> u64 {
    (4u64.pow(delta) - 1) / 3
}

/// Morton index of a (row, column) pair; the column interleaves into the
/// low bit.
fn morton_index(local_u: u32, local_r: u32) -> u64 {
    morton_encode([local_u as u64, local_r as u64]) as u64
}

/// Identifies a subtree by the address of its root tile.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubtreeKey {
    pub root_level: i32,
    pub root_u: u32,
    pub root_r: u32,
}

impl Display for SubtreeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.root_level, self.root_u, self.root_r)
    }
}

/// Sizes shared by every subtree of a fixed depth.
#[derive(Debug, Copy, Clone)]
pub struct SubtreeLayout {
    pub levels: u32,
    /// Nodes in one subtree: (4^levels − 1) / 3.
    pub node_count: u64,
    /// Child subtree slots below one subtree: 4^levels.
    pub child_count: u64,
    pub node_bitmap_byte_length: usize,
    pub child_bitmap_byte_length: usize,
}

impl SubtreeLayout {
    pub fn new(levels: u32) -> Self {
        debug_assert!(levels >= 1);
        let node_count = level_offset(levels);
        let child_count = 4u64.pow(levels);
        Self {
            levels,
            node_count,
            child_count,
            node_bitmap_byte_length: node_count.div_ceil(8) as usize,
            child_bitmap_byte_length: child_count.div_ceil(8) as usize,
        }
    }
}

/// The availability state of a single subtree.
#[derive(Debug, Clone)]
pub struct SubtreeAvailability {
    node_bits: bv::BitVec<u8, bv::Lsb0>,
    child_bits: bv::BitVec<u8, bv::Lsb0>,
    available_node_count: u64,
    available_child_count: u64,
}

impl SubtreeAvailability {
    fn new(layout: &SubtreeLayout) -> Self {
        let mut node_bits: bv::BitVec<u8, bv::Lsb0> = bv::BitVec::new();
        node_bits.resize(layout.node_count as usize, false);
        let mut child_bits: bv::BitVec<u8, bv::Lsb0> = bv::BitVec::new();
        child_bits.resize(layout.child_count as usize, false);
        Self {
            node_bits,
            child_bits,
            available_node_count: 0,
            available_child_count: 0,
        }
    }

    /// Set a node availability bit. Returns whether the bit was newly set.
    fn set_node(&mut self, bit_index: usize) -> bool {
        if self.node_bits[bit_index] {
            return false;
        }
        self.node_bits.set(bit_index, true);
        self.available_node_count += 1;
        true
    }

    fn set_child(&mut self, bit_index: usize) {
        if !self.child_bits[bit_index] {
            self.child_bits.set(bit_index, true);
            self.available_child_count += 1;
        }
    }

    pub fn available_node_count(&self) -> u64 {
        self.available_node_count
    }

    pub fn available_child_count(&self) -> u64 {
        self.available_child_count
    }

    pub fn node_bit(&self, bit_index: usize) -> bool {
        self.node_bits[bit_index]
    }

    pub fn child_bit(&self, bit_index: usize) -> bool {
        self.child_bits[bit_index]
    }
}

/// All subtree buffers of one geocell pass, keyed by subtree root.
#[derive(Debug)]
pub struct SubtreeSet {
    layout: SubtreeLayout,
    buffers: HashMap<SubtreeKey, SubtreeAvailability>,
}

impl SubtreeSet {
    pub fn new(subtree_levels: u32) -> Self {
        Self {
            layout: SubtreeLayout::new(subtree_levels),
            buffers: HashMap::new(),
        }
    }

    pub fn layout(&self) -> &SubtreeLayout {
        &self.layout
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn get(&self, key: &SubtreeKey) -> Option<&SubtreeAvailability> {
        self.buffers.get(key)
    }

    /// Record a tile at `(level, uref, rref)` with `level ≥ 0`.
    ///
    /// The tile's bit is set in its subtree, and so are the bits of every
    /// structural ancestor up to level 0, across subtree boundaries: the
    /// availability contract requires an ancestor to be available whenever a
    /// descendant is. Whenever a touched tile roots a subtree, the matching
    /// child-subtree bit is set in the parent subtree, so a child bit is set
    /// exactly when that `.subtree` file exists.
    pub fn record_tile(&mut self, level: i32, uref: u32, rref: u32) {
        debug_assert!(level >= 0);
        let subtree_levels = self.layout.levels as i32;
        let layout = self.layout;
        let (mut level, mut u, mut r) = (level, uref, rref);
        loop {
            let root_level = (level / subtree_levels) * subtree_levels;
            let delta = (level - root_level) as u32;
            let key = SubtreeKey {
                root_level,
                root_u: u >> delta,
                root_r: r >> delta,
            };
            let local_u = u & ((1 << delta) - 1);
            let local_r = r & ((1 << delta) - 1);
            let bit_index = level_offset(delta) + morton_index(local_u, local_r);
            let newly_set = self
                .buffers
                .entry(key)
                .or_insert_with(|| SubtreeAvailability::new(&layout))
                .set_node(bit_index as usize);

            if delta == 0 && level > 0 {
                // This tile roots a subtree; mark it in the parent subtree.
                let parent_key = SubtreeKey {
                    root_level: root_level - subtree_levels,
                    root_u: u >> layout.levels,
                    root_r: r >> layout.levels,
                };
                let child_mask = (1u32 << layout.levels) - 1;
                let child_bit = morton_index(u & child_mask, r & child_mask);
                self.buffers
                    .entry(parent_key)
                    .or_insert_with(|| SubtreeAvailability::new(&layout))
                    .set_child(child_bit as usize);
            }

            if !newly_set || level == 0 {
                // Ancestors of an already-recorded tile are recorded too.
                break;
            }
            level -= 1;
            u >>= 1;
            r >>= 1;
        }
    }

    /// Serialize every populated subtree into `dir` as
    /// `{rootLevel}_{rootU}_{rootR}.subtree`. The subtrees are independent,
    /// so they are written in parallel.
    pub fn write_all(&self, dir: &Path) -> io::Result<()> {
        if self.buffers.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(dir)?;
        self.buffers.par_iter().try_for_each(|(key, availability)| {
            debug!("writing subtree {}", key);
            let bytes = serialize_subtree(&self.layout, availability);
            crate::formats::container::write_atomic(
                &dir.join(format!("{}.subtree", key)),
                &bytes,
            )
        })
    }
}

/// Subtree JSON descriptor.
/// https://github.com/CesiumGS/3d-tiles/tree/main/specification/ImplicitTiling#subtrees
#[derive(Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct Subtree {
    #[serde(skip_serializing_if = "Option::is_none")]
    buffers: Option<Vec<Buffer>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    buffer_views: Option<Vec<BufferView>>,
    tile_availability: Availability,
    content_availability: Availability,
    child_subtree_availability: Availability,
}

#[derive(Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct Buffer {
    byte_length: usize,
}

#[derive(Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct BufferView {
    buffer: u8,
    byte_offset: usize,
    byte_length: usize,
}

#[derive(Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct Availability {
    #[serde(skip_serializing_if = "Option::is_none")]
    buffer_view: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    available_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    constant: Option<AvailabilityConstant>,
}

impl Availability {
    /// A bitmap whose popcount is zero or full is not emitted; it collapses
    /// to a constant in the JSON.
    fn for_bitmap(available_count: u64, total_count: u64, buffer_view: usize) -> Self {
        if available_count == 0 {
            Self {
                buffer_view: None,
                available_count: None,
                constant: Some(AvailabilityConstant::Unavailable),
            }
        } else if available_count == total_count {
            Self {
                buffer_view: None,
                available_count: None,
                constant: Some(AvailabilityConstant::Available),
            }
        } else {
            Self {
                buffer_view: Some(buffer_view),
                available_count: Some(available_count),
                constant: None,
            }
        }
    }

    fn is_constant(&self) -> bool {
        self.constant.is_some()
    }
}

/// Integer indicating whether all elements are Available (1) or all are
/// Unavailable (0).
#[derive(Debug, Default, Serialize_repr)]
#[repr(u8)]
enum AvailabilityConstant {
    #[default]
    Unavailable = 0,
    Available = 1,
}

/// Serialize one subtree into its binary file layout: a 24 byte header, the
/// space-padded JSON descriptor, then the non-constant bitmaps, each zero
/// padded to 8 bytes.
fn serialize_subtree(layout: &SubtreeLayout, availability: &SubtreeAvailability) -> Vec<u8> {
    debug_assert_eq!(
        availability.available_node_count,
        availability.node_bits.count_ones() as u64
    );
    debug_assert_eq!(
        availability.available_child_count,
        availability.child_bits.count_ones() as u64
    );
    let node_padded = align_to_8(layout.node_bitmap_byte_length);
    let child_padded = align_to_8(layout.child_bitmap_byte_length);

    let node_availability =
        Availability::for_bitmap(availability.available_node_count, layout.node_count, 0);
    let node_is_constant = node_availability.is_constant();
    let child_buffer_view = if node_is_constant { 0 } else { 1 };
    let child_availability = Availability::for_bitmap(
        availability.available_child_count,
        layout.child_count,
        child_buffer_view,
    );
    let child_is_constant = child_availability.is_constant();

    let mut buffer_byte_length = 0;
    let mut buffer_views = Vec::new();
    if !node_is_constant {
        buffer_views.push(BufferView {
            buffer: 0,
            byte_offset: buffer_byte_length,
            byte_length: layout.node_bitmap_byte_length,
        });
        buffer_byte_length += node_padded;
    }
    if !child_is_constant {
        buffer_views.push(BufferView {
            buffer: 0,
            byte_offset: buffer_byte_length,
            byte_length: layout.child_bitmap_byte_length,
        });
        buffer_byte_length += child_padded;
    }

    let content_availability = node_availability_copy(&node_availability);
    let subtree = Subtree {
        buffers: (buffer_byte_length > 0).then(|| {
            vec![Buffer {
                byte_length: buffer_byte_length,
            }]
        }),
        buffer_views: (!buffer_views.is_empty()).then_some(buffer_views),
        tile_availability: node_availability,
        content_availability,
        child_subtree_availability: child_availability,
    };

    let mut json = serde_json::to_string(&subtree).expect("subtree JSON serialization");
    let json_padding = (8 - json.len() % 8) % 8;
    for _ in 0..json_padding {
        json.push(' ');
    }

    let mut out =
        Vec::with_capacity(SUBTREE_HEADER_BYTE_LENGTH + json.len() + buffer_byte_length);
    out.extend_from_slice(b"subt");
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&(json.len() as u64).to_le_bytes());
    out.extend_from_slice(&(buffer_byte_length as u64).to_le_bytes());
    out.extend_from_slice(json.as_bytes());
    if !node_is_constant {
        out.extend_from_slice(availability.node_bits.as_raw_slice());
        out.resize(out.len() + node_padded - layout.node_bitmap_byte_length, 0);
    }
    if !child_is_constant {
        out.extend_from_slice(availability.child_bits.as_raw_slice());
        out.resize(out.len() + child_padded - layout.child_bitmap_byte_length, 0);
    }
    out
}

/// The content availability shares the tile availability's bitmap or
/// constant; only tiles with content are recorded in the first place.
fn node_availability_copy(availability: &Availability) -> Availability {
    Availability {
        buffer_view: availability.buffer_view,
        available_count: availability.available_count,
        constant: match availability.constant {
            Some(AvailabilityConstant::Available) => Some(AvailabilityConstant::Available),
            Some(AvailabilityConstant::Unavailable) => Some(AvailabilityConstant::Unavailable),
            None => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    fn u64_at(bytes: &[u8], offset: usize) -> u64 {
        u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
    }

    fn parse_subtree(bytes: &[u8]) -> (serde_json::Value, Vec<u8>) {
        assert_eq!(&bytes[0..4], b"subt");
        assert_eq!(u32_at(bytes, 4), 1);
        let json_byte_length = u64_at(bytes, 8) as usize;
        let bin_byte_length = u64_at(bytes, 16) as usize;
        assert_eq!(json_byte_length % 8, 0);
        assert_eq!(bin_byte_length % 8, 0);
        assert_eq!(
            bytes.len(),
            SUBTREE_HEADER_BYTE_LENGTH + json_byte_length + bin_byte_length
        );
        let json_bytes = &bytes[SUBTREE_HEADER_BYTE_LENGTH..SUBTREE_HEADER_BYTE_LENGTH + json_byte_length];
        let json = serde_json::from_slice(json_bytes).unwrap();
        let bin = bytes[SUBTREE_HEADER_BYTE_LENGTH + json_byte_length..].to_vec();
        (json, bin)
    }

    #[test]
    fn test_layout_counts() {
        let layout = SubtreeLayout::new(4);
        assert_eq!(layout.node_count, 85);
        assert_eq!(layout.child_count, 256);
        assert_eq!(layout.node_bitmap_byte_length, 11);
        assert_eq!(layout.child_bitmap_byte_length, 32);
        let layout = SubtreeLayout::new(3);
        assert_eq!(layout.node_count, 21);
        assert_eq!(layout.child_count, 64);
    }

    #[test]
    fn test_single_root_tile() {
        // S1: depth 4, one tile at (0, 0, 0)
        let mut set = SubtreeSet::new(4);
        set.record_tile(0, 0, 0);
        assert_eq!(set.len(), 1);
        let key = SubtreeKey {
            root_level: 0,
            root_u: 0,
            root_r: 0,
        };
        let availability = set.get(&key).unwrap();
        assert!(availability.node_bit(0));
        assert_eq!(availability.available_node_count(), 1);
        assert_eq!(availability.available_child_count(), 0);

        let bytes = serialize_subtree(set.layout(), availability);
        let (json, bin) = parse_subtree(&bytes);
        assert_eq!(json["tileAvailability"]["bufferView"], 0);
        assert_eq!(json["contentAvailability"]["bufferView"], 0);
        assert_eq!(json["childSubtreeAvailability"]["constant"], 0);
        assert_eq!(json["tileAvailability"]["availableCount"], 1);
        // Only the node bitmap is in the binary, padded from 11 to 16 bytes
        assert_eq!(json["buffers"][0]["byteLength"], 16);
        assert_eq!(json["bufferViews"][0]["byteOffset"], 0);
        assert_eq!(json["bufferViews"][0]["byteLength"], 11);
        assert_eq!(bin.len(), 16);
        // Bit 0 set, little endian within the byte
        assert_eq!(bin[0], 1);
        assert!(bin[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_full_subtree_collapses_to_constants() {
        // S2: every tile of a depth 3 subtree present
        let mut set = SubtreeSet::new(3);
        for level in 0..3 {
            let side = 1u32 << level;
            for u in 0..side {
                for r in 0..side {
                    set.record_tile(level as i32, u, r);
                }
            }
        }
        assert_eq!(set.len(), 1);
        let availability = set
            .get(&SubtreeKey {
                root_level: 0,
                root_u: 0,
                root_r: 0,
            })
            .unwrap();
        assert_eq!(availability.available_node_count(), 21);

        let bytes = serialize_subtree(set.layout(), availability);
        let (json, bin) = parse_subtree(&bytes);
        assert_eq!(json["tileAvailability"]["constant"], 1);
        assert_eq!(json["contentAvailability"]["constant"], 1);
        assert_eq!(json["childSubtreeAvailability"]["constant"], 0);
        assert!(json.get("buffers").is_none());
        assert!(json.get("bufferViews").is_none());
        assert!(bin.is_empty());
    }

    #[test]
    fn test_placement_across_subtrees() {
        // A deep tile sets its own bit, every ancestor bit, and the child
        // subtree bit in the parent subtree.
        let mut set = SubtreeSet::new(4);
        set.record_tile(5, 3, 7);
        assert_eq!(set.len(), 2);

        let child_key = SubtreeKey {
            root_level: 4,
            root_u: 1,
            root_r: 3,
        };
        let child_subtree = set.get(&child_key).unwrap();
        // The level 5 tile: delta 1, local (1, 1) → offset 1 + morton 3
        assert!(child_subtree.node_bit(4));
        // Its subtree root at level 4
        assert!(child_subtree.node_bit(0));
        assert_eq!(child_subtree.available_node_count(), 2);

        let root_key = SubtreeKey {
            root_level: 0,
            root_u: 0,
            root_r: 0,
        };
        let root_subtree = set.get(&root_key).unwrap();
        // Ancestors at levels 3, 2, 1, 0
        assert!(root_subtree.node_bit(21 + 1)); // level 3, local (0, 1)
        assert!(root_subtree.node_bit(5)); // level 2, local (0, 0)
        assert!(root_subtree.node_bit(1)); // level 1, local (0, 0)
        assert!(root_subtree.node_bit(0)); // level 0
        assert_eq!(root_subtree.available_node_count(), 4);
        // The level 4 subtree root registers as an available child subtree
        assert!(root_subtree.child_bit(7)); // morton(1, 3)
        assert_eq!(root_subtree.available_child_count(), 1);
    }

    #[test]
    fn test_recording_is_idempotent() {
        let mut set = SubtreeSet::new(4);
        set.record_tile(2, 1, 1);
        set.record_tile(2, 1, 1);
        let availability = set
            .get(&SubtreeKey {
                root_level: 0,
                root_u: 0,
                root_r: 0,
            })
            .unwrap();
        assert_eq!(availability.available_node_count(), 3);
    }

    #[test]
    fn test_bitmap_json_consistency() {
        // A partially filled node bitmap and a set child bit: both bitmaps
        // are emitted, node before child.
        let mut set = SubtreeSet::new(2);
        set.record_tile(2, 0, 0);
        set.record_tile(2, 3, 3);
        let root = set
            .get(&SubtreeKey {
                root_level: 0,
                root_u: 0,
                root_r: 0,
            })
            .unwrap();
        let layout = set.layout();
        let bytes = serialize_subtree(layout, root);
        let (json, bin) = parse_subtree(&bytes);
        let node_padded = align_to_8(layout.node_bitmap_byte_length);
        let child_padded = align_to_8(layout.child_bitmap_byte_length);
        assert_eq!(
            json["buffers"][0]["byteLength"].as_u64().unwrap() as usize,
            node_padded + child_padded
        );
        assert_eq!(json["tileAvailability"]["bufferView"], 0);
        assert_eq!(json["childSubtreeAvailability"]["bufferView"], 1);
        assert_eq!(
            json["bufferViews"][1]["byteOffset"].as_u64().unwrap() as usize,
            node_padded
        );
        assert_eq!(bin.len(), node_padded + child_padded);
        // Popcount of the serialized node bitmap matches availableCount
        let node_popcount: u32 = bin[..layout.node_bitmap_byte_length]
            .iter()
            .map(|b| b.count_ones())
            .sum();
        assert_eq!(
            node_popcount as u64,
            json["tileAvailability"]["availableCount"].as_u64().unwrap()
        );
    }

    #[test]
    fn test_write_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = SubtreeSet::new(4);
        set.record_tile(0, 0, 0);
        set.record_tile(4, 9, 2);
        let subtree_dir = dir.path().join("subtrees");
        set.write_all(&subtree_dir).unwrap();
        assert!(subtree_dir.join("0_0_0.subtree").is_file());
        assert!(subtree_dir.join("4_9_2.subtree").is_file());
        let bytes = std::fs::read(subtree_dir.join("0_0_0.subtree")).unwrap();
        assert_eq!(&bytes[0..4], b"subt");
    }
}
