//! Chunk and device tree lookups.

use crate::BTree;
use ofs_error::{OfsError, Result};
use ofs_ondisk::{ChunkItem, DevExtentItem};
use ofs_types::{Key, key_type};
use ofs_volume::{Chunk, ChunkMap, DevExtent, FIRST_CHUNK_TREE_OBJECTID};
use tracing::debug;

fn corrupt(tree: &BTree, key: &Key, err: &impl std::fmt::Display) -> OfsError {
    OfsError::Corruption {
        block: tree.root().block.0,
        detail: format!("item {key}: {err}"),
    }
}

/// Build the logical mapping from every CHUNK_ITEM in the chunk tree.
pub fn load_chunk_map(chunk_tree: &BTree) -> Result<ChunkMap> {
    let mut map = ChunkMap::new();
    let mut iter = chunk_tree.iter(Key::new(
        FIRST_CHUNK_TREE_OBJECTID,
        key_type::CHUNK_ITEM,
        0,
    ));
    iter.rewind(false)?;
    loop {
        let (key, data) = match iter.get_next_entry() {
            Ok(entry) => entry,
            Err(err) if err.is_not_found() => break,
            Err(err) => return Err(err),
        };
        let (item, _) = ChunkItem::parse(&data).map_err(|err| corrupt(chunk_tree, &key, &err))?;
        map.insert(Chunk::new(item, key.offset));
    }
    debug!(chunks = map.len(), "chunk_map_loaded");
    Ok(map)
}

/// Device extent of `devid` covering byte `physical` of the device.
pub fn find_dev_extent(dev_tree: &BTree, devid: u64, physical: u64) -> Result<DevExtent> {
    let mut key = Key::new(devid, key_type::DEV_EXTENT, physical);
    let data = dev_tree.find_previous(&mut key)?;
    if key.objectid != devid {
        return Err(OfsError::NotFound(format!(
            "no device extent on device {devid} at {physical:#x}"
        )));
    }
    let item = DevExtentItem::parse(&data).map_err(|err| corrupt(dev_tree, &key, &err))?;
    let extent = DevExtent::new(key, item);
    if !extent.contains(physical) {
        return Err(OfsError::NotFound(format!(
            "{physical:#x} lies past the device extent at {:#x}",
            extent.offset()
        )));
    }
    Ok(extent)
}
