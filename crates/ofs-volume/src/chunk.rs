//! Logical to physical address mapping.

use ofs_error::{OfsError, Result};
use ofs_ondisk::{ChunkItem, DevExtentItem, Stripe, parse_sys_chunk_array};
use ofs_types::{Key, block_group_flag, key_type, tree_id};
use std::collections::BTreeMap;
use tracing::trace;

/// Objectid under which chunk items are stored in the chunk tree.
pub const FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

/// One chunk: a logical range `[offset, offset + length)` and its stripes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    offset: u64,
    item: ChunkItem,
}

impl Chunk {
    #[must_use]
    pub fn new(item: ChunkItem, offset: u64) -> Self {
        trace!(
            offset,
            length = item.length,
            chunk_type = item.chunk_type,
            stripes = item.stripes.len(),
            "chunk_new"
        );
        Self { offset, item }
    }

    /// Single-stripe chunk mapping `logical` onto `physical` one to one.
    #[must_use]
    pub fn single(offset: u64, length: u64, physical: u64, chunk_type: u64) -> Self {
        Self::new(
            ChunkItem {
                length,
                owner: tree_id::EXTENT_TREE,
                stripe_len: 65536,
                chunk_type,
                io_align: 4096,
                io_width: 4096,
                sector_size: 4096,
                num_stripes: 1,
                sub_stripes: 0,
                stripes: vec![Stripe {
                    devid: 1,
                    offset: physical,
                    dev_uuid: [0; 16],
                }],
            },
            offset,
        )
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.item.length
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.item.length)
    }

    #[must_use]
    pub fn chunk_type(&self) -> u64 {
        self.item.chunk_type
    }

    /// Encoded size of the chunk item including its stripes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.item.encoded_len()
    }

    #[must_use]
    pub fn item(&self) -> &ChunkItem {
        &self.item
    }

    #[must_use]
    pub fn contains(&self, logical: u64) -> bool {
        logical >= self.offset && logical < self.end()
    }

    /// Physical byte address of `logical`, using the first stripe only.
    pub fn find_block(&self, logical: u64) -> Result<u64> {
        let Some(stripe) = self.item.stripes.first() else {
            return Err(OfsError::NotInitialized(format!(
                "chunk at {:#x} has no stripes",
                self.offset
            )));
        };
        if !self.contains(logical) {
            return Err(OfsError::BadValue(format!(
                "logical {logical:#x} outside chunk [{:#x}, {:#x})",
                self.offset,
                self.end()
            )));
        }
        let physical = (logical - self.offset)
            .checked_add(stripe.offset)
            .ok_or_else(|| OfsError::BadValue("physical address overflow".to_owned()))?;
        trace!(logical, physical, chunk = self.offset, "chunk_find_block");
        Ok(physical)
    }
}

/// All known chunks, ordered by logical start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkMap {
    chunks: BTreeMap<u64, Chunk>,
}

impl ChunkMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One system+metadata chunk where logical equals physical over `[0, length)`.
    #[must_use]
    pub fn identity(length: u64) -> Self {
        let mut map = Self::new();
        map.insert(Chunk::single(
            0,
            length,
            0,
            block_group_flag::SYSTEM | block_group_flag::METADATA,
        ));
        map
    }

    /// Bootstrap the map from the superblock's system chunk array.
    pub fn from_sys_chunk_array(data: &[u8]) -> Result<Self> {
        let entries = parse_sys_chunk_array(data)
            .map_err(|err| OfsError::Format(format!("sys_chunk_array: {err}")))?;
        let mut map = Self::new();
        for (key, item) in entries {
            if key.item_type != key_type::CHUNK_ITEM {
                return Err(OfsError::Format(format!(
                    "sys_chunk_array: unexpected key type {} at {key}",
                    key.item_type
                )));
            }
            map.insert(Chunk::new(item, key.offset));
        }
        Ok(map)
    }

    /// Insert or replace the chunk starting at the same logical offset.
    pub fn insert(&mut self, chunk: Chunk) {
        self.chunks.insert(chunk.offset(), chunk);
    }

    #[must_use]
    pub fn find(&self, logical: u64) -> Option<&Chunk> {
        self.chunks
            .range(..=logical)
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.contains(logical))
    }

    /// Resolve `logical` to a physical byte address.
    pub fn find_physical(&self, logical: u64) -> Result<u64> {
        let chunk = self.find(logical).ok_or(OfsError::Unmapped { logical })?;
        chunk.find_block(logical)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }
}

/// A device extent: a physical range on one device that backs a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevExtent {
    key: Key,
    item: DevExtentItem,
}

impl DevExtent {
    /// `key` is `(devid, DEV_EXTENT, physical_start)`.
    #[must_use]
    pub fn new(key: Key, item: DevExtentItem) -> Self {
        Self { key, item }
    }

    #[must_use]
    pub fn devid(&self) -> u64 {
        self.key.objectid
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.key.offset
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.key.offset.saturating_add(self.item.length)
    }

    #[must_use]
    pub fn item(&self) -> &DevExtentItem {
        &self.item
    }

    #[must_use]
    pub fn contains(&self, physical: u64) -> bool {
        physical >= self.offset() && physical < self.end()
    }

    /// Translate a physical address back to a logical one.
    ///
    /// An extent starting at physical 0 maps identically.
    pub fn to_logical(&self, physical: u64) -> Result<u64> {
        if self.offset() == 0 {
            return Ok(physical);
        }
        if !self.contains(physical) {
            return Err(OfsError::BadValue(format!(
                "physical {physical:#x} outside device extent [{:#x}, {:#x})",
                self.offset(),
                self.end()
            )));
        }
        (physical - self.offset())
            .checked_add(self.item.chunk_offset)
            .ok_or_else(|| OfsError::BadValue("logical address overflow".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofs_ondisk::node::{KEY_SIZE, write_key};

    #[test]
    fn find_block_uses_first_stripe() {
        let chunk = Chunk::single(0x10_0000, 0x10_0000, 0x50_0000, block_group_flag::DATA);
        assert_eq!(chunk.find_block(0x10_0000).expect("start"), 0x50_0000);
        assert_eq!(chunk.find_block(0x10_1000).expect("mid"), 0x50_1000);
        assert!(matches!(
            chunk.find_block(0x20_0000),
            Err(OfsError::BadValue(_))
        ));
        assert!(matches!(
            chunk.find_block(0x0F_FFFF),
            Err(OfsError::BadValue(_))
        ));
    }

    #[test]
    fn chunk_without_stripes_is_uninitialized() {
        let chunk = Chunk::new(ChunkItem::default(), 0);
        assert!(matches!(
            chunk.find_block(0),
            Err(OfsError::NotInitialized(_))
        ));
    }

    #[test]
    fn chunk_map_picks_covering_chunk() {
        let mut map = ChunkMap::new();
        map.insert(Chunk::single(0, 0x1000, 0, block_group_flag::SYSTEM));
        map.insert(Chunk::single(0x4000, 0x4000, 0x9000, block_group_flag::METADATA));
        assert_eq!(map.find_physical(0x800).expect("first"), 0x800);
        assert_eq!(map.find_physical(0x5000).expect("second"), 0xA000);
        assert!(matches!(
            map.find_physical(0x2000),
            Err(OfsError::Unmapped { logical: 0x2000 })
        ));
        assert!(matches!(
            map.find_physical(0x8000),
            Err(OfsError::Unmapped { .. })
        ));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn sys_chunk_array_bootstrap() {
        let chunk = Chunk::single(0x40_0000, 0x80_0000, 0x40_0000, block_group_flag::SYSTEM);
        let mut array = vec![0_u8; KEY_SIZE];
        write_key(
            &mut array,
            0,
            &Key::new(FIRST_CHUNK_TREE_OBJECTID, key_type::CHUNK_ITEM, 0x40_0000),
        )
        .expect("key");
        array.extend_from_slice(&chunk.item().to_bytes().expect("encode"));

        let map = ChunkMap::from_sys_chunk_array(&array).expect("parse");
        assert_eq!(map.find(0x40_1000), Some(&chunk));
        assert!(matches!(
            ChunkMap::from_sys_chunk_array(&array[..40]),
            Err(OfsError::Format(_))
        ));
    }

    #[test]
    fn dev_extent_to_logical() {
        let item = DevExtentItem {
            chunk_offset: 0x100_0000,
            length: 0x10_0000,
            ..DevExtentItem::default()
        };
        let extent = DevExtent::new(Key::new(1, key_type::DEV_EXTENT, 0x20_0000), item);
        assert_eq!(extent.to_logical(0x20_0800).expect("inside"), 0x100_0800);
        assert!(matches!(
            extent.to_logical(0x30_0000),
            Err(OfsError::BadValue(_))
        ));

        let identity = DevExtent::new(Key::new(1, key_type::DEV_EXTENT, 0), item);
        assert_eq!(identity.to_logical(0x12_3456).expect("identity"), 0x12_3456);
    }
}
