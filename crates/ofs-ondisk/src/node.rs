//! Tree node layout.
//!
//! ```text
//! 0x00  csum[32]
//! 0x20  fsid[16]
//! 0x30  bytenr            u64   logical address of this node
//! 0x38  flags             u64
//! 0x40  chunk_tree_uuid[16]
//! 0x50  generation        u64
//! 0x58  owner             u64
//! 0x60  nritems           u32
//! 0x64  level             u8
//! 0x65  items...
//! ```
//!
//! Internal nodes follow the header with `nritems` key pointers of 33 bytes.
//! Leaves follow it with `nritems` item headers of 25 bytes whose
//! `data_offset` is relative to the end of the header; payload bytes are
//! packed from the end of the block toward the item table.

use ofs_types::{
    Key, MAX_LEVEL, ParseError, read_fixed, read_le_u32, read_le_u64, read_u8, write_bytes,
    write_le_u32, write_le_u64, write_u8,
};
use serde::{Deserialize, Serialize};

pub const HEADER_SIZE: usize = 101;
pub const KEY_SIZE: usize = 17;
pub const ITEM_SIZE: usize = 25;
pub const KEY_PTR_SIZE: usize = 33;

const OFF_CSUM: usize = 0x00;
const OFF_FSID: usize = 0x20;
const OFF_BYTENR: usize = 0x30;
const OFF_FLAGS: usize = 0x38;
const OFF_CHUNK_TREE_UUID: usize = 0x40;
const OFF_GENERATION: usize = 0x50;
const OFF_OWNER: usize = 0x58;
const OFF_NRITEMS: usize = 0x60;
const OFF_LEVEL: usize = 0x64;

pub fn read_key(data: &[u8], offset: usize) -> Result<Key, ParseError> {
    Ok(Key {
        objectid: read_le_u64(data, offset)?,
        item_type: read_u8(data, offset + 8)?,
        offset: read_le_u64(data, offset + 9)?,
    })
}

pub fn write_key(data: &mut [u8], offset: usize, key: &Key) -> Result<(), ParseError> {
    write_le_u64(data, offset, key.objectid)?;
    write_u8(data, offset + 8, key.item_type)?;
    write_le_u64(data, offset + 9, key.offset)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeader {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub chunk_tree_uuid: [u8; 16],
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

impl NodeHeader {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        Ok(Self {
            csum: read_fixed::<32>(block, OFF_CSUM)?,
            fsid: read_fixed::<16>(block, OFF_FSID)?,
            bytenr: read_le_u64(block, OFF_BYTENR)?,
            flags: read_le_u64(block, OFF_FLAGS)?,
            chunk_tree_uuid: read_fixed::<16>(block, OFF_CHUNK_TREE_UUID)?,
            generation: read_le_u64(block, OFF_GENERATION)?,
            owner: read_le_u64(block, OFF_OWNER)?,
            nritems: read_le_u32(block, OFF_NRITEMS)?,
            level: read_u8(block, OFF_LEVEL)?,
        })
    }

    pub fn write_to_block(&self, block: &mut [u8]) -> Result<(), ParseError> {
        write_bytes(block, OFF_CSUM, &self.csum)?;
        write_bytes(block, OFF_FSID, &self.fsid)?;
        write_le_u64(block, OFF_BYTENR, self.bytenr)?;
        write_le_u64(block, OFF_FLAGS, self.flags)?;
        write_bytes(block, OFF_CHUNK_TREE_UUID, &self.chunk_tree_uuid)?;
        write_le_u64(block, OFF_GENERATION, self.generation)?;
        write_le_u64(block, OFF_OWNER, self.owner)?;
        write_le_u32(block, OFF_NRITEMS, self.nritems)?;
        write_u8(block, OFF_LEVEL, self.level)
    }

    /// Validate the header against the block it was parsed from.
    ///
    /// Checks the self address (if an expectation is given), the level
    /// ceiling, and that `nritems` entries fit in the block.
    pub fn validate(
        &self,
        block_size: usize,
        expected_bytenr: Option<u64>,
    ) -> Result<(), ParseError> {
        if let Some(expected) = expected_bytenr {
            if self.bytenr != expected {
                return Err(ParseError::InvalidField {
                    field: "bytenr",
                    reason: "header bytenr does not match expected",
                });
            }
        }

        if self.level > MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree depth",
            });
        }

        let nritems = usize::try_from(self.nritems)
            .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;
        if nritems > max_entries(block_size, self.level) {
            return Err(ParseError::InvalidField {
                field: "nritems",
                reason: "item count exceeds block capacity",
            });
        }

        Ok(())
    }
}

/// Size of one entry-table element at `level`.
#[must_use]
pub const fn entry_size(level: u8) -> usize {
    if level == 0 { ITEM_SIZE } else { KEY_PTR_SIZE }
}

#[must_use]
pub const fn max_entries(block_size: usize, level: u8) -> usize {
    block_size.saturating_sub(HEADER_SIZE) / entry_size(level)
}

/// Byte offset of entry `slot` in the table of a node at `level`.
#[must_use]
pub const fn entry_offset(level: u8, slot: usize) -> usize {
    HEADER_SIZE + slot * entry_size(level)
}

/// Update only the item count field.
pub fn write_nritems(block: &mut [u8], nritems: u32) -> Result<(), ParseError> {
    write_le_u32(block, OFF_NRITEMS, nritems)
}

pub fn write_level(block: &mut [u8], level: u8) -> Result<(), ParseError> {
    write_u8(block, OFF_LEVEL, level)
}

pub fn write_bytenr(block: &mut [u8], bytenr: u64) -> Result<(), ParseError> {
    write_le_u64(block, OFF_BYTENR, bytenr)
}

pub fn write_generation(block: &mut [u8], generation: u64) -> Result<(), ParseError> {
    write_le_u64(block, OFF_GENERATION, generation)
}

pub fn write_owner(block: &mut [u8], owner: u64) -> Result<(), ParseError> {
    write_le_u64(block, OFF_OWNER, owner)
}

/// Leaf item header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemHeader {
    pub key: Key,
    /// Payload start, relative to the end of the node header.
    pub data_offset: u32,
    pub data_size: u32,
}

impl ItemHeader {
    pub fn read(block: &[u8], slot: usize) -> Result<Self, ParseError> {
        let base = entry_offset(0, slot);
        Ok(Self {
            key: read_key(block, base)?,
            data_offset: read_le_u32(block, base + KEY_SIZE)?,
            data_size: read_le_u32(block, base + KEY_SIZE + 4)?,
        })
    }

    pub fn write(&self, block: &mut [u8], slot: usize) -> Result<(), ParseError> {
        let base = entry_offset(0, slot);
        write_key(block, base, &self.key)?;
        write_le_u32(block, base + KEY_SIZE, self.data_offset)?;
        write_le_u32(block, base + KEY_SIZE + 4, self.data_size)
    }

    /// Absolute byte range of the payload inside the block.
    pub fn data_range(&self, block_size: usize) -> Result<std::ops::Range<usize>, ParseError> {
        let start = HEADER_SIZE
            .checked_add(self.data_offset as usize)
            .ok_or(ParseError::InvalidField {
                field: "data_offset",
                reason: "overflow",
            })?;
        let end = start
            .checked_add(self.data_size as usize)
            .ok_or(ParseError::InvalidField {
                field: "data_size",
                reason: "overflow",
            })?;
        if end > block_size {
            return Err(ParseError::InvalidField {
                field: "data_offset",
                reason: "item points outside block",
            });
        }
        Ok(start..end)
    }
}

/// Internal node index entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPtr {
    pub key: Key,
    pub blockptr: u64,
    pub generation: u64,
}

impl KeyPtr {
    pub fn read(block: &[u8], slot: usize) -> Result<Self, ParseError> {
        let base = entry_offset(1, slot);
        Ok(Self {
            key: read_key(block, base)?,
            blockptr: read_le_u64(block, base + KEY_SIZE)?,
            generation: read_le_u64(block, base + KEY_SIZE + 8)?,
        })
    }

    pub fn write(&self, block: &mut [u8], slot: usize) -> Result<(), ParseError> {
        let base = entry_offset(1, slot);
        write_key(block, base, &self.key)?;
        write_le_u64(block, base + KEY_SIZE, self.blockptr)?;
        write_le_u64(block, base + KEY_SIZE + 8, self.generation)
    }
}

/// Decode a leaf's header and complete item table.
pub fn parse_leaf_items(block: &[u8]) -> Result<(NodeHeader, Vec<ItemHeader>), ParseError> {
    let header = NodeHeader::parse_from_block(block)?;
    if header.level != 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected leaf level 0",
        });
    }
    header.validate(block.len(), None)?;

    let nritems = header.nritems as usize;
    let mut items = Vec::with_capacity(nritems);
    for slot in 0..nritems {
        let item = ItemHeader::read(block, slot)?;
        item.data_range(block.len())?;
        items.push(item);
    }
    Ok((header, items))
}

/// Decode an internal node's header and key pointers.
pub fn parse_internal_items(block: &[u8]) -> Result<(NodeHeader, Vec<KeyPtr>), ParseError> {
    let header = NodeHeader::parse_from_block(block)?;
    if header.level == 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected internal node (level > 0)",
        });
    }
    header.validate(block.len(), None)?;

    let nritems = header.nritems as usize;
    let mut ptrs = Vec::with_capacity(nritems);
    for slot in 0..nritems {
        let ptr = KeyPtr::read(block, slot)?;
        if ptr.blockptr == 0 {
            return Err(ParseError::InvalidField {
                field: "blockptr",
                reason: "child block pointer is zero",
            });
        }
        ptrs.push(ptr);
    }
    Ok((header, ptrs))
}
