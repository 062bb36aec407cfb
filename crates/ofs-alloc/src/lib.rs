#![forbid(unsafe_code)]
//! Block groups and free-extent discovery.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **FreeExtentTree**: in-memory, offset-ordered index of free ranges.
//! 2. **BlockGroup**: one extent-tree block-group record, able to derive
//!    its free (or occupied) ranges from the extent records inside it.
//! 3. **ExtentAllocator**: binds a block group of the extent tree and
//!    rebuilds its free-extent index on demand. Handing out extents to
//!    callers is not implemented; the index is the extension point.

pub mod free_extent;

pub use free_extent::{FreeExtent, FreeExtentTree};

use ofs_btree::{BTree, Traversal};
use ofs_error::{OfsError, Result};
use ofs_ondisk::BlockGroupItem;
use ofs_types::{Key, block_group_flag, key_type};
use std::ops::ControlFlow;
use tracing::{debug, trace};

// ── Extent-tree scanning ────────────────────────────────────────────────────

/// Visit extent-tree records from `from` onward in key order until `visit`
/// breaks or the tree ends.
fn scan_records(
    tree: &BTree,
    from: &Key,
    mut visit: impl FnMut(&Key, &[u8]) -> Result<ControlFlow<()>>,
) -> Result<()> {
    let mut path = tree.path();
    let slot = tree.locate(&mut path, from, Traversal::Forward)?;
    if slot >= path.node(0)?.item_count()? {
        return Ok(());
    }
    loop {
        let entry = path.current_entry()?;
        if visit(&entry.key, &entry.data)?.is_break() {
            return Ok(());
        }
        match path.move_slot(0, true) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

/// First block-group record at or after logical offset `start`.
fn next_block_group(tree: &BTree, start: u64) -> Result<Option<(Key, BlockGroupItem)>> {
    let mut found = None;
    scan_records(
        tree,
        &Key::new(start, key_type::BLOCK_GROUP_ITEM, 0),
        |key, data| {
            if key.item_type != key_type::BLOCK_GROUP_ITEM {
                return Ok(ControlFlow::Continue(()));
            }
            let item = BlockGroupItem::parse(data).map_err(|err| OfsError::Corruption {
                block: tree.root().block.0,
                detail: format!("block group {key}: {err}"),
            })?;
            found = Some((*key, item));
            Ok(ControlFlow::Break(()))
        },
    )?;
    Ok(found)
}

// ── Block groups ────────────────────────────────────────────────────────────

/// A block-group record: `[start, start + length)` of logical space with
/// one allocation policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockGroup {
    key: Key,
    item: BlockGroupItem,
}

impl BlockGroup {
    /// First block group at or after the system chunk whose flags include
    /// every bit of `flag`. Each rejected group is skipped as a whole.
    pub fn allocate(extent_tree: &BTree, flag: u64) -> Result<Self> {
        let mut start = extent_tree.volume().system_chunk_offset();
        loop {
            let Some((key, item)) = next_block_group(extent_tree, start)? else {
                debug!(flag, "block_group_not_found");
                return Err(OfsError::NotFound(format!(
                    "no block group with flags {flag:#x}"
                )));
            };
            if item.flags & flag == flag {
                debug!(
                    start = key.objectid,
                    length = key.offset,
                    flags = item.flags,
                    "block_group_selected"
                );
                return Ok(Self { key, item });
            }
            trace!(start = key.objectid, flags = item.flags, flag, "block_group_rejected");
            let Some(next) = key.objectid.checked_add(key.offset.max(1)) else {
                return Err(OfsError::NotFound(format!(
                    "no block group with flags {flag:#x}"
                )));
            };
            start = next;
        }
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.key.objectid
    }

    #[must_use]
    pub fn length(&self) -> u64 {
        self.key.offset
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.key.objectid.saturating_add(self.key.offset)
    }

    #[must_use]
    pub fn flags(&self) -> u64 {
        self.item.flags
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.item.used
    }

    #[must_use]
    pub fn item(&self) -> &BlockGroupItem {
        &self.item
    }

    fn is_data(&self) -> bool {
        self.item.flags & block_group_flag::KIND_MASK == block_group_flag::DATA
    }

    /// Index this group's ranges into `index` and return how many were
    /// added.
    ///
    /// Occupied extents are EXTENT_ITEM records (sized by their key
    /// offset) in data groups and METADATA_ITEM records (one node each)
    /// otherwise. With `inverse` the gaps between them, and the tail up to
    /// the group end, are indexed; without it the occupied extents are.
    /// Empty gaps are skipped.
    pub fn load_extent(
        &self,
        extent_tree: &BTree,
        index: &mut FreeExtentTree,
        inverse: bool,
    ) -> Result<usize> {
        let data_group = self.is_data();
        let item_type = if data_group {
            key_type::EXTENT_ITEM
        } else {
            key_type::METADATA_ITEM
        };
        let node_size = u64::from(extent_tree.volume().node_size());
        let flags = self.flags();
        let end = self.end();
        let mut cursor = self.start();
        let mut added = 0_usize;

        scan_records(extent_tree, &Key::new(self.start(), 0, 0), |key, _| {
            if key.objectid >= end {
                return Ok(ControlFlow::Break(()));
            }
            if key.item_type != item_type {
                return Ok(ControlFlow::Continue(()));
            }
            let size = if data_group { key.offset } else { node_size };
            let extent = if inverse {
                FreeExtent::new(cursor, key.objectid.saturating_sub(cursor), flags)
            } else {
                FreeExtent::new(key.objectid, size, flags)
            };
            if record(index, extent)? {
                added += 1;
            }
            cursor = cursor.max(key.objectid.saturating_add(size));
            Ok(ControlFlow::Continue(()))
        })?;

        if inverse && record(index, FreeExtent::new(cursor, end.saturating_sub(cursor), flags))? {
            added += 1;
        }
        debug!(start = self.start(), added, inverse, "block_group_extents_loaded");
        Ok(added)
    }
}

/// Insert `extent`, treating an empty range as nothing to record.
fn record(index: &mut FreeExtentTree, extent: FreeExtent) -> Result<bool> {
    match index.insert(extent) {
        Ok(()) => Ok(true),
        Err(OfsError::BadData(detail)) => {
            trace!(offset = extent.offset, %detail, "free_extent_skipped");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Free-space view over one block group of the extent tree.
#[derive(Debug)]
pub struct ExtentAllocator {
    extent_tree: BTree,
    group: BlockGroup,
}

impl ExtentAllocator {
    /// Bind the first metadata block group.
    pub fn new(extent_tree: BTree) -> Result<Self> {
        Self::with_flag(extent_tree, block_group_flag::METADATA)
    }

    pub fn with_flag(extent_tree: BTree, flag: u64) -> Result<Self> {
        let group = BlockGroup::allocate(&extent_tree, flag)?;
        Ok(Self { extent_tree, group })
    }

    #[must_use]
    pub fn block_group(&self) -> &BlockGroup {
        &self.group
    }

    #[must_use]
    pub fn extent_tree(&self) -> &BTree {
        &self.extent_tree
    }

    /// Rebuild the free-extent index of the bound group from the current
    /// extent tree.
    pub fn allocate_free_extent(&self) -> Result<FreeExtentTree> {
        let tree = self.extent_tree.reopen()?;
        let mut index = FreeExtentTree::new();
        self.group.load_extent(&tree, &mut index, true)?;
        index.dump_in_order(tree.volume().node_size());
        debug!(
            group = self.group.start(),
            extents = index.len(),
            free = index.total_free(),
            "free_extents_rebuilt"
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofs_journal::{Journal, Transaction};
    use ofs_types::tree_id;
    use ofs_volume::{Volume, VolumeConfig};
    use std::sync::Arc;

    const NODE: u64 = 4096;

    fn extent_tree(records: &[(Key, Vec<u8>)]) -> (Arc<Journal>, BTree) {
        let config = VolumeConfig {
            node_size: 4096,
            ..VolumeConfig::default()
        };
        let journal = Arc::new(Journal::new(Arc::new(
            Volume::in_memory(config, 64).expect("volume"),
        )));
        let txn = Transaction::begin(&journal).expect("txn");
        let tree = BTree::create(&txn, Arc::clone(journal.volume()), tree_id::EXTENT_TREE)
            .expect("create");
        for (key, data) in records {
            tree.insert(&txn, *key, data).expect("insert");
        }
        txn.done().expect("commit");
        (journal, tree)
    }

    fn group(start: u64, length: u64, flags: u64) -> (Key, Vec<u8>) {
        let item = BlockGroupItem {
            used: 0,
            chunk_objectid: 256,
            flags,
        };
        (
            Key::new(start, key_type::BLOCK_GROUP_ITEM, length),
            item.to_bytes(),
        )
    }

    fn data_extent(start: u64, length: u64) -> (Key, Vec<u8>) {
        (Key::new(start, key_type::EXTENT_ITEM, length), vec![0; 24])
    }

    fn metadata_extent(start: u64, level: u64) -> (Key, Vec<u8>) {
        (Key::new(start, key_type::METADATA_ITEM, level), vec![0; 24])
    }

    fn ranges(index: &FreeExtentTree) -> Vec<(u64, u64)> {
        index.iter().map(|e| (e.offset, e.end())).collect()
    }

    #[test]
    fn inverse_load_yields_gaps_and_tail() {
        let (_journal, tree) = extent_tree(&[
            group(0, 1000, block_group_flag::DATA),
            data_extent(100, 100),
            data_extent(500, 100),
            data_extent(1000, 50),
        ]);
        let group = BlockGroup::allocate(&tree, block_group_flag::DATA).expect("group");
        let mut index = FreeExtentTree::new();
        assert_eq!(group.load_extent(&tree, &mut index, true).expect("load"), 3);
        assert_eq!(ranges(&index), vec![(0, 100), (200, 500), (600, 1000)]);
        assert!(index.iter().all(|e| e.flags == block_group_flag::DATA));
    }

    #[test]
    fn adjacent_extents_leave_no_empty_gap() {
        let (_journal, tree) = extent_tree(&[
            group(0, 1000, block_group_flag::DATA),
            data_extent(0, 100),
            data_extent(100, 100),
            data_extent(200, 50),
            data_extent(900, 100),
        ]);
        let group = BlockGroup::allocate(&tree, block_group_flag::DATA).expect("group");
        let mut index = FreeExtentTree::new();
        assert_eq!(group.load_extent(&tree, &mut index, true).expect("load"), 1);
        assert_eq!(ranges(&index), vec![(250, 900)]);
    }

    #[test]
    fn plain_load_records_occupied_extents() {
        let (_journal, tree) = extent_tree(&[
            group(0, 1000, block_group_flag::DATA),
            data_extent(100, 100),
            data_extent(500, 100),
        ]);
        let group = BlockGroup::allocate(&tree, block_group_flag::DATA).expect("group");
        let mut index = FreeExtentTree::new();
        group.load_extent(&tree, &mut index, false).expect("load");
        assert_eq!(ranges(&index), vec![(100, 200), (500, 600)]);
    }

    #[test]
    fn metadata_groups_count_whole_nodes() {
        let start = 0x10_0000;
        let (_journal, tree) = extent_tree(&[
            group(start, 16 * NODE, block_group_flag::METADATA),
            metadata_extent(start, 0),
            metadata_extent(start + 2 * NODE, 1),
            data_extent(start + 8 * NODE, NODE),
        ]);
        let group = BlockGroup::allocate(&tree, block_group_flag::METADATA).expect("group");
        assert_eq!(group.start(), start);
        let mut index = FreeExtentTree::new();
        group.load_extent(&tree, &mut index, true).expect("load");
        assert_eq!(
            ranges(&index),
            vec![
                (start + NODE, start + 2 * NODE),
                (start + 3 * NODE, start + 16 * NODE)
            ]
        );
    }

    #[test]
    fn allocate_skips_groups_without_the_flag() {
        let (_journal, tree) = extent_tree(&[
            group(0, 1000, block_group_flag::DATA),
            data_extent(100, 100),
            group(1000, 1000, block_group_flag::METADATA | block_group_flag::DUP),
            group(2000, 1000, block_group_flag::SYSTEM),
        ]);
        let metadata = BlockGroup::allocate(&tree, block_group_flag::METADATA).expect("meta");
        assert_eq!((metadata.start(), metadata.end()), (1000, 2000));
        let dup = BlockGroup::allocate(
            &tree,
            block_group_flag::METADATA | block_group_flag::DUP,
        )
        .expect("dup");
        assert_eq!(dup, metadata);
        let system = BlockGroup::allocate(&tree, block_group_flag::SYSTEM).expect("system");
        assert_eq!(system.start(), 2000);
        assert!(
            BlockGroup::allocate(&tree, block_group_flag::RAID1)
                .expect_err("missing")
                .is_not_found()
        );
    }

    #[test]
    fn allocator_rebuilds_index_on_every_call() {
        let start = 0x20_0000;
        let (journal, tree) = extent_tree(&[
            group(0, start, block_group_flag::DATA),
            group(start, 8 * NODE, block_group_flag::METADATA),
            metadata_extent(start + NODE, 0),
        ]);
        let allocator = ExtentAllocator::new(tree).expect("allocator");
        assert_eq!(allocator.block_group().start(), start);

        let first = allocator.allocate_free_extent().expect("index");
        assert_eq!(
            ranges(&first),
            vec![(start, start + NODE), (start + 2 * NODE, start + 8 * NODE)]
        );

        let txn = Transaction::begin(&journal).expect("txn");
        let (key, data) = metadata_extent(start + 4 * NODE, 0);
        allocator
            .extent_tree()
            .insert(&txn, key, &data)
            .expect("insert");
        txn.done().expect("commit");

        let second = allocator.allocate_free_extent().expect("index");
        assert_eq!(second.len(), 3);
        assert_eq!(second.total_free(), first.total_free() - NODE);
        assert!(second.find(start + 4 * NODE).is_none());
    }
}
