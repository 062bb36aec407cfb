#![forbid(unsafe_code)]
//! Volume: the geometry and mapping collaborator of the tree engine.
//!
//! A [`Volume`] bundles the block cache, the chunk map used to turn logical
//! node addresses into cache blocks, the superblock fields the journal
//! maintains (generation, identifiers stamped into new nodes), and the hook
//! that hands out logical addresses for freshly allocated nodes.

pub mod chunk;

pub use chunk::{Chunk, ChunkMap, DevExtent, FIRST_CHUNK_TREE_OBJECTID};

use ofs_block::{BlockCache, BlockDevice, ByteBlockDevice, TxnBlockCache};
use ofs_error::{OfsError, Result};
use ofs_types::{BlockNumber, Generation};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

pub const MIN_NODE_SIZE: u32 = 4096;
pub const MAX_NODE_SIZE: u32 = 65536;
pub const DEFAULT_NODE_SIZE: u32 = 16384;

/// Mount-time configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Tree node size in bytes; equals the cache block size.
    pub node_size: u32,
    /// Validate the header of every node bound from the cache.
    pub verify_headers: bool,
    /// Superblock generation at mount.
    pub generation: u64,
    pub fsid: [u8; 16],
    pub chunk_tree_uuid: [u8; 16],
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            node_size: DEFAULT_NODE_SIZE,
            verify_headers: true,
            generation: 0,
            fsid: [0; 16],
            chunk_tree_uuid: [0; 16],
        }
    }
}

impl VolumeConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.node_size.is_power_of_two()
            || !(MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&self.node_size)
        {
            return Err(OfsError::InvalidGeometry(format!(
                "node_size={} (must be a power of two in {MIN_NODE_SIZE}..={MAX_NODE_SIZE})",
                self.node_size
            )));
        }
        Ok(())
    }
}

/// Source of logical addresses for new tree nodes.
pub trait NodeAllocator: Send {
    /// Logical byte address of a fresh node.
    fn alloc_node(&mut self) -> Result<u64>;
}

/// Hands out consecutive node-sized addresses from `[start, end)`.
#[derive(Debug, Clone)]
pub struct SequentialNodeAllocator {
    next: u64,
    end: u64,
    node_size: u64,
}

impl SequentialNodeAllocator {
    #[must_use]
    pub fn new(start: u64, end: u64, node_size: u32) -> Self {
        Self {
            next: start,
            end,
            node_size: u64::from(node_size),
        }
    }

    /// Nodes still available.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.next) / self.node_size
    }
}

impl NodeAllocator for SequentialNodeAllocator {
    fn alloc_node(&mut self) -> Result<u64> {
        let end = self.next.checked_add(self.node_size).ok_or(OfsError::NoSpace)?;
        if end > self.end {
            return Err(OfsError::NoSpace);
        }
        let logical = self.next;
        self.next = end;
        Ok(logical)
    }
}

#[derive(Debug)]
struct SuperblockState {
    generation: Generation,
}

pub struct Volume {
    config: VolumeConfig,
    cache: Arc<dyn BlockCache>,
    chunks: RwLock<ChunkMap>,
    superblock: Mutex<SuperblockState>,
    allocator: Mutex<Box<dyn NodeAllocator>>,
    system_chunk_offset: u64,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("config", &self.config)
            .field("chunks", &self.chunks.read().len())
            .field("generation", &self.superblock.lock().generation)
            .field("system_chunk_offset", &self.system_chunk_offset)
            .finish_non_exhaustive()
    }
}

impl Volume {
    /// Assemble a volume. The cache block size must equal the node size.
    pub fn new(
        config: VolumeConfig,
        cache: Arc<dyn BlockCache>,
        chunks: ChunkMap,
        allocator: Box<dyn NodeAllocator>,
    ) -> Result<Self> {
        config.validate()?;
        if cache.block_size() != config.node_size {
            return Err(OfsError::InvalidGeometry(format!(
                "cache block_size={} does not match node_size={}",
                cache.block_size(),
                config.node_size
            )));
        }
        let system_chunk_offset = chunks
            .iter()
            .find(|chunk| chunk.chunk_type() & ofs_types::block_group_flag::SYSTEM != 0)
            .map_or(0, Chunk::offset);
        debug!(
            node_size = config.node_size,
            chunks = chunks.len(),
            generation = config.generation,
            system_chunk_offset,
            "volume_open"
        );
        Ok(Self {
            superblock: Mutex::new(SuperblockState {
                generation: Generation(config.generation),
            }),
            config,
            cache,
            chunks: RwLock::new(chunks),
            allocator: Mutex::new(allocator),
            system_chunk_offset,
        })
    }

    /// Memory-backed volume of `blocks` nodes with an identity chunk.
    ///
    /// Block 0 is reserved; nodes are allocated sequentially from block 1.
    pub fn in_memory(config: VolumeConfig, blocks: usize) -> Result<Self> {
        config.validate()?;
        let device = ByteBlockDevice::in_memory(config.node_size, blocks)?;
        let length = device.block_count() * u64::from(config.node_size);
        let allocator = SequentialNodeAllocator::new(
            u64::from(config.node_size),
            length,
            config.node_size,
        );
        Self::new(
            config,
            Arc::new(TxnBlockCache::new(device)),
            ChunkMap::identity(length),
            Box::new(allocator),
        )
    }

    #[must_use]
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    #[must_use]
    pub fn node_size(&self) -> u32 {
        self.config.node_size
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<dyn BlockCache> {
        &self.cache
    }

    #[must_use]
    pub fn fsid(&self) -> [u8; 16] {
        self.config.fsid
    }

    #[must_use]
    pub fn chunk_tree_uuid(&self) -> [u8; 16] {
        self.config.chunk_tree_uuid
    }

    /// Logical offset where block-group scans begin.
    #[must_use]
    pub fn system_chunk_offset(&self) -> u64 {
        self.system_chunk_offset
    }

    /// Resolve a logical node address to its cache block.
    pub fn find_block(&self, logical: u64) -> Result<BlockNumber> {
        let physical = self
            .chunks
            .read()
            .find_physical(logical)
            .map_err(|_| OfsError::Unmapped { logical })?;
        let node_size = u64::from(self.config.node_size);
        if physical % node_size != 0 {
            return Err(OfsError::Unmapped { logical });
        }
        trace!(logical, physical, "volume_find_block");
        Ok(BlockNumber(physical / node_size))
    }

    /// Allocate a node: its logical address and resolved block.
    pub fn allocate_node(&self) -> Result<(u64, BlockNumber)> {
        let logical = self.allocator.lock().alloc_node()?;
        let block = self.find_block(logical)?;
        trace!(logical, block = block.0, "volume_allocate_node");
        Ok((logical, block))
    }

    #[must_use]
    pub fn superblock_generation(&self) -> Generation {
        self.superblock.lock().generation
    }

    pub fn set_superblock_generation(&self, generation: Generation) {
        self.superblock.lock().generation = generation;
        debug!(generation = generation.0, "superblock_generation_updated");
    }

    /// Replace the chunk map, e.g. after loading the full chunk tree.
    pub fn set_chunk_map(&self, chunks: ChunkMap) {
        *self.chunks.write() = chunks;
    }

    #[must_use]
    pub fn chunk_map(&self) -> ChunkMap {
        self.chunks.read().clone()
    }
}
