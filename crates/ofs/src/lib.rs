#![forbid(unsafe_code)]
//! OakFS metadata tree engine: public API facade.
//!
//! Re-exports the engine crates through one stable interface. Downstream
//! filesystem layers (directories, inodes) depend on this crate only.

pub use ofs_alloc::{BlockGroup, ExtentAllocator, FreeExtent, FreeExtentTree};
pub use ofs_block::{
    BlockBuf, BlockCache, BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice,
    MemoryByteDevice, TransactionEvent, TxnBlockCache, WritableBlock,
};
pub use ofs_btree::{
    BTree, IteratorState, LeafEntry, Node, Path, RootState, Traversal, TreeIterator,
    find_dev_extent, load_chunk_map,
};
pub use ofs_error::{OfsError, Result};
pub use ofs_journal::{Journal, OwnerId, Transaction};
pub use ofs_types::{
    BlockNumber, Generation, Key, MAX_LEVEL, MAX_TREE_DEPTH, TxnId, block_group_flag, key_type,
    tree_id,
};
pub use ofs_volume::{
    Chunk, ChunkMap, DevExtent, NodeAllocator, SequentialNodeAllocator, Volume, VolumeConfig,
};

pub mod ondisk {
    //! On-disk codecs.
    pub use ofs_ondisk::*;
}
