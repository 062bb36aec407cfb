#![forbid(unsafe_code)]
//! On-disk format codecs for OakFS metadata trees.
//!
//! Pure parsing crate with no I/O. It covers the node header, the leaf item
//! table and internal key pointers, and the payloads the engine itself reads:
//! block groups, chunks with their stripes, device extents and the bootstrap
//! system chunk array.

pub mod items;
pub mod node;

pub use items::{
    BlockGroupItem, ChunkItem, DevExtentItem, Stripe, parse_sys_chunk_array,
};
pub use node::{
    HEADER_SIZE, ITEM_SIZE, ItemHeader, KEY_PTR_SIZE, KEY_SIZE, KeyPtr, NodeHeader,
    parse_internal_items, parse_leaf_items,
};
