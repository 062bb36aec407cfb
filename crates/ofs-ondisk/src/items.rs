//! Leaf payload codecs for the chunk, device and extent trees.

use crate::node::{KEY_SIZE, read_key};
use ofs_types::{
    Key, ParseError, ensure_slice, read_fixed, read_le_u16, read_le_u32, read_le_u64,
    write_bytes, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const BLOCK_GROUP_ITEM_SIZE: usize = 24;
pub const DEV_EXTENT_ITEM_SIZE: usize = 48;
/// Chunk fields before the stripe array.
pub const CHUNK_FIXED_SIZE: usize = 48;
pub const STRIPE_SIZE: usize = 32;

/// Payload of a `BLOCK_GROUP_ITEM`, keyed `(start, BLOCK_GROUP_ITEM, length)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGroupItem {
    pub used: u64,
    pub chunk_objectid: u64,
    pub flags: u64,
}

impl BlockGroupItem {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, BLOCK_GROUP_ITEM_SIZE)?;
        Ok(Self {
            used: read_le_u64(data, 0)?,
            chunk_objectid: read_le_u64(data, 8)?,
            flags: read_le_u64(data, 16)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; BLOCK_GROUP_ITEM_SIZE];
        out[0..8].copy_from_slice(&self.used.to_le_bytes());
        out[8..16].copy_from_slice(&self.chunk_objectid.to_le_bytes());
        out[16..24].copy_from_slice(&self.flags.to_le_bytes());
        out
    }
}

/// Payload of a `DEV_EXTENT`, keyed `(devid, DEV_EXTENT, physical_start)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevExtentItem {
    pub chunk_tree: u64,
    pub chunk_objectid: u64,
    pub chunk_offset: u64,
    pub length: u64,
    pub chunk_tree_uuid: [u8; 16],
}

impl DevExtentItem {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, DEV_EXTENT_ITEM_SIZE)?;
        Ok(Self {
            chunk_tree: read_le_u64(data, 0)?,
            chunk_objectid: read_le_u64(data, 8)?,
            chunk_offset: read_le_u64(data, 16)?,
            length: read_le_u64(data, 24)?,
            chunk_tree_uuid: read_fixed::<16>(data, 32)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; DEV_EXTENT_ITEM_SIZE];
        out[0..8].copy_from_slice(&self.chunk_tree.to_le_bytes());
        out[8..16].copy_from_slice(&self.chunk_objectid.to_le_bytes());
        out[16..24].copy_from_slice(&self.chunk_offset.to_le_bytes());
        out[24..32].copy_from_slice(&self.length.to_le_bytes());
        out[32..48].copy_from_slice(&self.chunk_tree_uuid);
        out
    }
}

/// A single stripe within a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

/// Payload of a `CHUNK_ITEM`, keyed `(FIRST_CHUNK_TREE, CHUNK_ITEM, logical)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkItem {
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<Stripe>,
}

impl ChunkItem {
    /// Decode one chunk starting at the beginning of `data`.
    ///
    /// Returns the chunk and the number of bytes it occupied.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        ensure_slice(data, 0, CHUNK_FIXED_SIZE)?;
        let num_stripes = read_le_u16(data, 44)?;
        if num_stripes == 0 {
            return Err(ParseError::InvalidField {
                field: "num_stripes",
                reason: "chunk must have at least one stripe",
            });
        }

        let count = usize::from(num_stripes);
        let stripes_bytes = count
            .checked_mul(STRIPE_SIZE)
            .ok_or(ParseError::InvalidField {
                field: "num_stripes",
                reason: "stripe count overflow",
            })?;
        ensure_slice(data, CHUNK_FIXED_SIZE, stripes_bytes)?;

        let mut stripes = Vec::with_capacity(count);
        for idx in 0..count {
            let base = CHUNK_FIXED_SIZE + idx * STRIPE_SIZE;
            stripes.push(Stripe {
                devid: read_le_u64(data, base)?,
                offset: read_le_u64(data, base + 8)?,
                dev_uuid: read_fixed::<16>(data, base + 16)?,
            });
        }

        let chunk = Self {
            length: read_le_u64(data, 0)?,
            owner: read_le_u64(data, 8)?,
            stripe_len: read_le_u64(data, 16)?,
            chunk_type: read_le_u64(data, 24)?,
            io_align: read_le_u32(data, 32)?,
            io_width: read_le_u32(data, 36)?,
            sector_size: read_le_u32(data, 40)?,
            num_stripes,
            sub_stripes: read_le_u16(data, 46)?,
            stripes,
        };
        Ok((chunk, CHUNK_FIXED_SIZE + stripes_bytes))
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        CHUNK_FIXED_SIZE + self.stripes.len() * STRIPE_SIZE
    }

    /// Encode the chunk; `num_stripes` is taken from the stripe vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = vec![0_u8; self.encoded_len()];
        let num_stripes =
            u16::try_from(self.stripes.len()).map_err(|_| ParseError::IntegerConversion {
                field: "num_stripes",
            })?;
        write_le_u64(&mut out, 0, self.length)?;
        write_le_u64(&mut out, 8, self.owner)?;
        write_le_u64(&mut out, 16, self.stripe_len)?;
        write_le_u64(&mut out, 24, self.chunk_type)?;
        write_le_u32(&mut out, 32, self.io_align)?;
        write_le_u32(&mut out, 36, self.io_width)?;
        write_le_u32(&mut out, 40, self.sector_size)?;
        write_le_u16(&mut out, 44, num_stripes)?;
        write_le_u16(&mut out, 46, self.sub_stripes)?;
        for (idx, stripe) in self.stripes.iter().enumerate() {
            let base = CHUNK_FIXED_SIZE + idx * STRIPE_SIZE;
            write_le_u64(&mut out, base, stripe.devid)?;
            write_le_u64(&mut out, base + 8, stripe.offset)?;
            write_bytes(&mut out, base + 16, &stripe.dev_uuid)?;
        }
        Ok(out)
    }
}

/// Parse the superblock's bootstrap array of `(disk key, chunk)` pairs.
pub fn parse_sys_chunk_array(data: &[u8]) -> Result<Vec<(Key, ChunkItem)>, ParseError> {
    let mut entries = Vec::new();
    let mut cur = 0_usize;

    while cur < data.len() {
        let key = read_key(data, cur)?;
        cur += KEY_SIZE;
        let rest = data.get(cur..).ok_or(ParseError::InsufficientData {
            needed: CHUNK_FIXED_SIZE,
            offset: cur,
            actual: 0,
        })?;
        let (chunk, used) = ChunkItem::parse(rest)?;
        cur += used;
        entries.push((key, chunk));
    }

    Ok(entries)
}
