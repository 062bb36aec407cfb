#![forbid(unsafe_code)]
//! Copy-on-write metadata B-tree.
//!
//! A [`BTree`] is a handle on one tree root. Reads descend from the root
//! with a [`Path`]; mutations run inside a [`Transaction`] and copy every
//! node they touch (and its ancestors up to the root) into freshly
//! allocated blocks, so the previous root stays intact until the
//! transaction commits.
//!
//! Internal levels always descend through the greatest index key at or
//! below the target. At the leaf the caller picks the direction:
//! [`Traversal::Exact`], [`Traversal::Forward`] or [`Traversal::Backward`].

pub mod iterator;
pub mod mapping;
pub mod node;
pub mod path;

pub use iterator::{IteratorState, TreeIterator};
pub use mapping::{find_dev_extent, load_chunk_map};
pub use node::{Node, Traversal};
pub use path::{LeafEntry, Path};

use iterator::IteratorRegistry;
use ofs_block::TransactionEvent;
use ofs_error::{OfsError, Result};
use ofs_journal::Transaction;
use ofs_ondisk::node::{ITEM_SIZE, KEY_PTR_SIZE, KeyPtr, NodeHeader};
use ofs_types::{BlockNumber, Key, MAX_TREE_DEPTH, TxnId};
use ofs_volume::Volume;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, trace};

#[expect(clippy::cast_possible_wrap)]
const KEY_PTR_BYTES: i64 = KEY_PTR_SIZE as i64;

/// Upper bound on leaf splits performed for one insertion.
const SPLIT_ATTEMPTS: usize = 2 * MAX_TREE_DEPTH;

/// Where the tree currently starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootState {
    pub logical: u64,
    pub block: BlockNumber,
    pub level: u8,
}

/// State shared by a tree handle, its paths and its iterators.
pub(crate) struct TreeCore {
    pub(crate) volume: Arc<Volume>,
    owner: u64,
    root: RwLock<RootState>,
    /// Transaction whose abort restores the root it started from.
    guarded: Mutex<Option<TxnId>>,
}

impl TreeCore {
    fn new(volume: Arc<Volume>, owner: u64, root: RootState) -> Self {
        Self {
            volume,
            owner,
            root: RwLock::new(root),
            guarded: Mutex::new(None),
        }
    }

    fn root(&self) -> RootState {
        *self.root.read()
    }

    /// Install a root produced inside `txn`. Should `txn` abort, the root
    /// that was current before its first change is put back.
    pub(crate) fn replace_root(self: &Arc<Self>, txn: TxnId, root: RootState) -> Result<()> {
        let mut guarded = self.guarded.lock();
        if *guarded != Some(txn) {
            let previous = self.root();
            let core = Arc::downgrade(self);
            self.volume.cache().add_transaction_listener(
                txn,
                Box::new(move |txn, event| {
                    if !matches!(event, TransactionEvent::Aborted) {
                        return;
                    }
                    if let Some(core) = core.upgrade() {
                        debug!(txn = txn.0, root = previous.logical, "btree_root_restored");
                        core.set_root(previous);
                    }
                }),
            )?;
            *guarded = Some(txn);
        }
        drop(guarded);
        self.set_root(root);
        Ok(())
    }

    pub(crate) fn set_root(&self, root: RootState) {
        let previous = std::mem::replace(&mut *self.root.write(), root);
        debug!(
            owner = self.owner,
            old_root = previous.logical,
            new_root = root.logical,
            level = root.level,
            "btree_set_root"
        );
    }

    /// Logical node address to cache block.
    pub(crate) fn resolve(&self, logical: u64) -> Result<BlockNumber> {
        self.volume.find_block(logical).inspect_err(|err| {
            error!(owner = self.owner, logical, error = %err, "btree_unmapped_node");
        })
    }

    fn load_root(volume: &Volume, logical: u64) -> Result<(RootState, u64)> {
        let block = volume.find_block(logical).inspect_err(|err| {
            error!(logical, error = %err, "btree_unmapped_root");
        })?;
        let mut node = Node::new(volume);
        node.set_to_checked(block, Some(logical))?;
        let header = node.header()?;
        if usize::from(header.level) >= MAX_TREE_DEPTH {
            return Err(OfsError::TreeTooDeep {
                depth: usize::from(header.level) + 1,
            });
        }
        Ok((
            RootState {
                logical,
                block,
                level: header.level,
            },
            header.owner,
        ))
    }

    fn expect_level(node: &Node, level: usize) -> Result<()> {
        let found = usize::from(node.level()?);
        if found == level {
            Ok(())
        } else {
            Err(OfsError::Corruption {
                block: node.block().map_or(0, |block| block.0),
                detail: format!("node at level {found}, expected {level}"),
            })
        }
    }

    /// Fill `path` from the root down to the leaf that may hold `key`.
    fn descend(&self, path: &mut Path, key: &Key) -> Result<()> {
        let root = self.root();
        let top = usize::from(root.level);
        if top >= MAX_TREE_DEPTH {
            return Err(OfsError::TreeTooDeep { depth: top + 1 });
        }
        path.release();
        path.set_depth(top + 1);

        let mut node = Node::new(&self.volume);
        node.set_to_checked(root.block, Some(root.logical))?;
        Self::expect_level(&node, top)?;
        path.install(top, node, 0);

        for level in (1..=top).rev() {
            let parent = path.node(level)?;
            if parent.item_count()? == 0 {
                return Err(OfsError::Corruption {
                    block: parent.block().map_or(0, |block| block.0),
                    detail: "internal node without entries".to_owned(),
                });
            }
            let slot = match parent.search_slot(key, Traversal::Backward) {
                Ok(slot) => slot,
                Err(err) if err.is_not_found() => 0,
                Err(err) => return Err(err),
            };
            let ptr = parent.index(slot)?;
            path.set_slot(level, slot)?;

            let block = self.resolve(ptr.blockptr)?;
            let mut child = Node::new(&self.volume);
            child.set_to_checked(block, Some(ptr.blockptr))?;
            Self::expect_level(&child, level - 1)?;
            trace!(level, slot, child = block.0, "btree_descend");
            path.install(level - 1, child, 0);
        }
        Ok(())
    }

    /// Descend and pick the leaf slot for `key`.
    ///
    /// A forward search that runs past the end of its leaf continues at the
    /// first slot of the next leaf; at the right edge of the tree the
    /// returned slot equals the leaf's item count.
    fn search(&self, path: &mut Path, key: &Key, traversal: Traversal) -> Result<usize> {
        self.descend(path, key)?;
        let leaf = path.node(0)?;
        let slot = leaf.search_slot(key, traversal)?;
        let count = leaf.item_count()?;
        path.set_slot(0, slot)?;
        if traversal == Traversal::Forward && slot >= count {
            match path.switch_leaf(true) {
                Ok(()) => return Ok(path.slot(0)),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(slot)
    }

    /// Read-mode search: rewrite `key` to the matched key and return a copy
    /// of its payload. A matched entry of another item type counts as absent.
    pub(crate) fn find(self: &Arc<Self>, key: &mut Key, traversal: Traversal) -> Result<Vec<u8>> {
        let mut path = Path::new(Arc::clone(self));
        let slot = self.search(&mut path, key, traversal)?;
        let leaf = path.node(0)?;
        if slot >= leaf.item_count()? {
            return Err(OfsError::NotFound(format!("no entry after {key}")));
        }
        let item = leaf.item(slot)?;
        if item.key.item_type != key.item_type {
            return Err(OfsError::NotFound(format!(
                "{key}: nearest entry {} has another type",
                item.key
            )));
        }
        let data = leaf.item_data(slot)?;
        trace!(query = %key, found = %item.key, size = data.len(), "btree_find");
        *key = item.key;
        Ok(data)
    }
}

/// Handle on one tree. Dropping it stops every iterator created from it.
pub struct BTree {
    core: Arc<TreeCore>,
    registry: Arc<IteratorRegistry>,
}

impl fmt::Debug for BTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BTree")
            .field("owner", &self.core.owner)
            .field("root", &self.core.root())
            .field("iterators", &self.registry.len())
            .finish()
    }
}

impl BTree {
    fn from_core(core: TreeCore) -> Self {
        Self {
            core: Arc::new(core),
            registry: Arc::new(IteratorRegistry::default()),
        }
    }

    /// Open the tree whose root node lives at `logical_root`.
    pub fn open(volume: Arc<Volume>, logical_root: u64) -> Result<Self> {
        let (root, owner) = TreeCore::load_root(&volume, logical_root)?;
        debug!(owner, root = logical_root, level = root.level, "btree_open");
        Ok(Self::from_core(TreeCore::new(volume, owner, root)))
    }

    /// Create a tree made of one empty leaf owned by tree id `owner`.
    pub fn create(txn: &Transaction, volume: Arc<Volume>, owner: u64) -> Result<Self> {
        let txn_id = txn.id()?;
        let generation = txn.generation()?.0;
        let (logical, block) = volume.allocate_node()?;
        let mut node = Node::new(&volume);
        node.set_to_writable(block, txn_id, true)?;
        node.init_header(&NodeHeader {
            fsid: volume.fsid(),
            bytenr: logical,
            chunk_tree_uuid: volume.chunk_tree_uuid(),
            generation,
            owner,
            ..NodeHeader::default()
        })?;
        debug!(owner, root = logical, block = block.0, generation, "btree_create");
        Ok(Self::from_core(TreeCore::new(
            volume,
            owner,
            RootState {
                logical,
                block,
                level: 0,
            },
        )))
    }

    /// A separate handle on the current root, with its own iterators.
    pub fn reopen(&self) -> Result<Self> {
        Self::open(Arc::clone(&self.core.volume), self.core.root().logical)
    }

    /// Point the handle at the root node stored at `logical`.
    pub fn set_root(&self, logical: u64) -> Result<()> {
        let (root, _) = TreeCore::load_root(&self.core.volume, logical)?;
        self.core.set_root(root);
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> RootState {
        self.core.root()
    }

    #[must_use]
    pub fn owner(&self) -> u64 {
        self.core.owner
    }

    #[must_use]
    pub fn volume(&self) -> &Arc<Volume> {
        &self.core.volume
    }

    /// An empty path over this tree.
    #[must_use]
    pub fn path(&self) -> Path {
        Path::new(Arc::clone(&self.core))
    }

    /// Iterator whose first step searches inclusively from `key`.
    #[must_use]
    pub fn iter(&self, key: Key) -> TreeIterator {
        TreeIterator::new(&self.core, &self.registry, key)
    }

    /// Iterators created from this handle that are still alive.
    #[must_use]
    pub fn live_iterators(&self) -> usize {
        self.registry.len()
    }

    pub fn find_exact(&self, key: &mut Key) -> Result<Vec<u8>> {
        self.core.find(key, Traversal::Exact)
    }

    /// First entry at or after `key` with the same item type.
    pub fn find_next(&self, key: &mut Key) -> Result<Vec<u8>> {
        self.core.find(key, Traversal::Forward)
    }

    /// Last entry at or before `key` with the same item type.
    pub fn find_previous(&self, key: &mut Key) -> Result<Vec<u8>> {
        self.core.find(key, Traversal::Backward)
    }

    /// Position `path` at the leaf slot for `key` without reading the
    /// payload or checking the item type. A forward search may return the
    /// leaf's item count at the right edge of the tree.
    pub fn locate(&self, path: &mut Path, key: &Key, traversal: Traversal) -> Result<usize> {
        self.check_path(path)?;
        self.core.search(path, key, traversal)
    }

    pub fn next_leaf(&self, path: &mut Path) -> Result<()> {
        self.check_path(path)?;
        path.switch_leaf(true)
    }

    pub fn previous_leaf(&self, path: &mut Path) -> Result<()> {
        self.check_path(path)?;
        path.switch_leaf(false)
    }

    fn check_path(&self, path: &Path) -> Result<()> {
        if Arc::ptr_eq(&path.tree, &self.core) {
            Ok(())
        } else {
            Err(OfsError::BadValue("path belongs to another tree".to_owned()))
        }
    }

    /// First key at or after `key`, of any type.
    fn first_key_from(&self, key: &Key) -> Result<Option<Key>> {
        let mut path = self.path();
        let slot = self.core.search(&mut path, key, Traversal::Forward)?;
        let leaf = path.node(0)?;
        if slot < leaf.item_count()? {
            Ok(Some(leaf.key(slot)?))
        } else {
            Ok(None)
        }
    }

    /// Open `num` empty slots for keys starting at `start_key` whose payloads
    /// total `length` bytes, splitting the target leaf as needed. Returns the
    /// first slot; `path` is left on the writable leaf.
    pub fn make_entries(
        &self,
        txn: &Transaction,
        path: &mut Path,
        start_key: &Key,
        num: usize,
        length: usize,
    ) -> Result<usize> {
        self.check_path(path)?;
        if num == 0 {
            return Err(OfsError::BadValue("no entries to make".to_owned()));
        }
        let needed = num
            .checked_mul(ITEM_SIZE)
            .and_then(|table| table.checked_add(length))
            .ok_or_else(|| OfsError::BadValue("entry size overflow".to_owned()))?;
        if needed > path.leaf_capacity() {
            return Err(OfsError::BadValue(format!(
                "{num} entries need {needed} bytes, a leaf holds {}",
                path.leaf_capacity()
            )));
        }
        let reserve = i64::try_from(needed)
            .map_err(|_| OfsError::BadValue("entry size overflow".to_owned()))?;

        self.core.descend(path, start_key)?;
        let slot = path.node(0)?.search_slot(start_key, Traversal::Forward)?;
        path.set_slot(0, slot)?;

        for _ in 0..SPLIT_ATTEMPTS {
            if path.node(0)?.space_left()? >= needed {
                let slot = path.slot(0);
                path.copy_on_write(txn, 0, slot, num, reserve)?;
                return Ok(slot);
            }
            let count = path.node(0)?.item_count()?;
            let mid = if count >= 2 { count / 2 } else { path.slot(0) };
            self.split_at(txn, path, 0, mid, Some(start_key))?;
        }
        Err(OfsError::BadValue(format!(
            "no room for {needed} bytes after {SPLIT_ATTEMPTS} splits"
        )))
    }

    /// Insert strictly ascending `entries`. None of their keys may exist yet.
    /// Returns the leaf slot of the first entry.
    pub fn insert_entries(
        &self,
        txn: &Transaction,
        path: &mut Path,
        entries: &[(Key, &[u8])],
    ) -> Result<usize> {
        self.check_path(path)?;
        let (Some((first, _)), Some((last, _))) = (entries.first(), entries.last()) else {
            return Err(OfsError::BadValue("no entries to insert".to_owned()));
        };
        if entries.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
            return Err(OfsError::BadValue(
                "entries must be strictly ascending".to_owned(),
            ));
        }
        if let Some(existing) = self.first_key_from(first)? {
            if existing <= *last {
                return Err(OfsError::BadValue(format!("key {existing} already exists")));
            }
        }

        let payload = entries.iter().map(|(_, data)| data.len()).sum();
        let slot = self.make_entries(txn, path, first, entries.len(), payload)?;

        let mut upper = if slot > 0 {
            path.node(0)?.item(slot - 1)?.data_offset
        } else {
            u32::try_from(path.leaf_capacity())
                .map_err(|_| OfsError::BadValue("node size overflow".to_owned()))?
        };
        for (index, (key, data)) in entries.iter().enumerate() {
            let size = u32::try_from(data.len())
                .map_err(|_| OfsError::BadValue(format!("payload of {} bytes", data.len())))?;
            upper = upper
                .checked_sub(size)
                .ok_or_else(|| OfsError::BadValue("payload area exhausted".to_owned()))?;
            path.set_entry(slot + index, key, data, upper)?;
        }
        path.set_slot(0, slot)?;
        if slot == 0 {
            self.fix_low_keys(txn, path, 1)?;
        }
        trace!(
            owner = self.core.owner,
            first = %first,
            count = entries.len(),
            slot,
            "btree_insert_entries"
        );
        Ok(slot)
    }

    /// Insert one entry.
    pub fn insert(&self, txn: &Transaction, key: Key, data: &[u8]) -> Result<()> {
        let mut path = self.path();
        self.insert_entries(txn, &mut path, &[(key, data)])
            .map(|_| ())
    }

    /// Remove `num` consecutive entries starting at the exact key
    /// `start_key`, returning them. Emptied nodes are unlinked from their
    /// parents; the path is released when that happens.
    pub fn remove_entries(
        &self,
        txn: &Transaction,
        path: &mut Path,
        start_key: &Key,
        num: usize,
    ) -> Result<Vec<LeafEntry>> {
        self.check_path(path)?;
        if num == 0 {
            return Err(OfsError::BadValue("no entries to remove".to_owned()));
        }
        self.core.descend(path, start_key)?;
        let leaf = path.node(0)?;
        let slot = leaf.search_slot(start_key, Traversal::Exact)?;
        let count = leaf.item_count()?;
        if slot + num > count {
            return Err(OfsError::BadValue(format!(
                "removing {num} entries from slot {slot} of {count}"
            )));
        }

        let mut removed = Vec::new();
        removed
            .try_reserve_exact(num)
            .map_err(|_| OfsError::NoMemory)?;
        let mut bytes = 0_usize;
        for current in slot..slot + num {
            let entry = path.get_entry(current)?;
            bytes += ITEM_SIZE + entry.data.len();
            removed.push(entry);
        }
        let length = i64::try_from(bytes)
            .map_err(|_| OfsError::BadValue("removal size overflow".to_owned()))?;

        path.set_slot(0, slot)?;
        path.copy_on_write(txn, 0, slot, num, -length)?;
        if num == count && path.depth() > 1 {
            self.unlink_child(txn, path, 1)?;
            path.release();
        } else if slot == 0 && num < count {
            self.fix_low_keys(txn, path, 1)?;
        }
        trace!(
            owner = self.core.owner,
            first = %start_key,
            count = num,
            slot,
            "btree_remove_entries"
        );
        Ok(removed)
    }

    /// Remove the entry with exactly `key` and return its payload.
    pub fn remove(&self, txn: &Transaction, key: &Key) -> Result<Vec<u8>> {
        let mut path = self.path();
        let mut removed = self.remove_entries(txn, &mut path, key, 1)?;
        Ok(removed.pop().map(|entry| entry.data).unwrap_or_default())
    }

    /// Split the node at `level` of `path` in two halves.
    pub fn split_node(&self, txn: &Transaction, path: &mut Path, level: usize) -> Result<()> {
        self.check_path(path)?;
        let count = path.node(level)?.item_count()?;
        if count < 2 {
            return Err(OfsError::BadValue(format!(
                "cannot split a node with {count} entries"
            )));
        }
        self.split_at(txn, path, level, count / 2, None)
    }

    /// Keep `[0, mid)` in the node at `level` and move `[mid, count)` into a
    /// new right sibling. Either half may end up empty when splitting for an
    /// insertion; an empty right half is indexed under `insert_key`. The
    /// path follows the half that holds its slot.
    fn split_at(
        &self,
        txn: &Transaction,
        path: &mut Path,
        level: usize,
        mid: usize,
        insert_key: Option<&Key>,
    ) -> Result<()> {
        if level + 1 == path.depth() {
            if level + 1 >= MAX_TREE_DEPTH {
                return Err(OfsError::TreeTooDeep { depth: level + 2 });
            }
            self.grow_root(txn, path)?;
        } else if path.node(level + 1)?.space_left()? < KEY_PTR_SIZE {
            let parent_count = path.node(level + 1)?.item_count()?;
            self.split_at(txn, path, level + 1, parent_count / 2, None)?;
        }

        let txn_id = txn.id()?;
        let generation = txn.generation()?.0;
        let node = path.node(level)?;
        let count = node.item_count()?;
        let origin = node.snapshot()?;
        let header = node.header()?;
        let old_block = node.block().map_or(0, |block| block.0);
        if mid > count {
            return Err(OfsError::BadValue(format!(
                "split point {mid} beyond {count} entries"
            )));
        }

        let volume = Arc::clone(&self.core.volume);
        let (logical, block) = volume.allocate_node()?;
        let mut right = Node::new(&volume);
        right.set_to_writable(block, txn_id, true)?;
        right.init_header(&header)?;
        right.copy_range(&origin, mid..count, 0)?;
        right.set_logical(logical)?;
        right.set_generation(generation)?;
        let separator = if mid < count {
            right.key(0)?
        } else {
            *insert_key.ok_or_else(|| {
                OfsError::BadValue("empty right half needs a separator key".to_owned())
            })?
        };

        path.copy_on_write(txn, level, 0, mid, 0)?;
        let parent_slot = path.slot(level + 1) + 1;
        path.copy_on_write(txn, level + 1, parent_slot, 1, KEY_PTR_BYTES)?;
        path.node_mut(level + 1)?.set_index(
            parent_slot,
            &KeyPtr {
                key: separator,
                blockptr: logical,
                generation,
            },
        )?;
        debug!(
            old_node = old_block,
            new_node = block.0,
            separator_key = %separator,
            level,
            mid,
            count,
            "btree_split"
        );

        let slot = path.slot(level);
        let go_right = if mid == 0 {
            false
        } else if mid == count {
            true
        } else {
            slot >= mid
        };
        if go_right {
            path.install(level, right, slot - mid);
            path.set_slot(level + 1, parent_slot)?;
        }
        Ok(())
    }

    /// Put a new root above the current one, with a single index entry.
    fn grow_root(&self, txn: &Transaction, path: &mut Path) -> Result<()> {
        let level = path.depth() - 1;
        let old = path.node(level)?;
        let header = old.header()?;
        let first = if header.nritems > 0 { old.key(0)? } else { Key::MIN };
        let child = KeyPtr {
            key: first,
            blockptr: header.bytenr,
            generation: header.generation,
        };

        let volume = Arc::clone(&self.core.volume);
        let generation = txn.generation()?.0;
        let (logical, block) = volume.allocate_node()?;
        let mut root = Node::new(&volume);
        root.set_to_writable(block, txn.id()?, true)?;
        root.init_header(&NodeHeader {
            bytenr: logical,
            generation,
            level: header.level + 1,
            nritems: 1,
            ..header
        })?;
        root.set_index(0, &child)?;

        path.set_depth(level + 2);
        path.install(level + 1, root, 0);
        self.core.replace_root(
            txn.id()?,
            RootState {
                logical,
                block,
                level: header.level + 1,
            },
        )?;
        debug!(
            owner = self.core.owner,
            new_root = block.0,
            level = level + 1,
            "btree_grow_root"
        );
        Ok(())
    }

    /// Walk up from `from_level`, rewriting each index key that no longer
    /// equals its child's first key, while the path runs through slot 0.
    fn fix_low_keys(&self, txn: &Transaction, path: &mut Path, from_level: usize) -> Result<()> {
        let mut level = from_level;
        while level < path.depth() {
            let child = path.node(level - 1)?;
            if child.item_count()? == 0 {
                break;
            }
            let first = child.key(0)?;
            let slot = path.slot(level);
            let node = path.node(level)?;
            if node.key(slot)? != first {
                let count = node.item_count()?;
                path.copy_on_write(txn, level, 0, count, 0)?;
                path.node_mut(level)?.set_key(slot, &first)?;
                trace!(level, slot, key = %first, "btree_fix_low_key");
            }
            if slot != 0 {
                break;
            }
            level += 1;
        }
        Ok(())
    }

    /// Drop the index entry at `path.slot(level)`; recurse while nodes
    /// become empty. A root left without entries turns into an empty leaf.
    fn unlink_child(&self, txn: &Transaction, path: &mut Path, level: usize) -> Result<()> {
        let slot = path.slot(level);
        let count = path.node(level)?.item_count()?;
        path.copy_on_write(txn, level, slot, 1, -KEY_PTR_BYTES)?;
        debug!(owner = self.core.owner, level, slot, "btree_unlink_child");
        if count > 1 {
            if slot == 0 {
                self.fix_low_keys(txn, path, level + 1)?;
            }
            return Ok(());
        }
        if level + 1 < path.depth() {
            return self.unlink_child(txn, path, level + 1);
        }

        let root = path.node_mut(level)?;
        root.set_level(0)?;
        let logical = root.logical()?;
        let block = root
            .block()
            .ok_or_else(|| OfsError::NotInitialized("root node is unbound".to_owned()))?;
        self.core.replace_root(
            txn.id()?,
            RootState {
                logical,
                block,
                level: 0,
            },
        )?;
        debug!(owner = self.core.owner, root = logical, "btree_root_collapse");
        Ok(())
    }
}

impl Drop for BTree {
    fn drop(&mut self) {
        let stopped = self.registry.stop_all();
        if stopped > 0 {
            debug!(owner = self.core.owner, stopped, "btree_iterators_stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofs_journal::Journal;
    use ofs_types::key_type;
    use ofs_volume::VolumeConfig;

    fn journal(blocks: usize) -> Arc<Journal> {
        let config = VolumeConfig {
            node_size: 4096,
            ..VolumeConfig::default()
        };
        Arc::new(Journal::new(Arc::new(
            Volume::in_memory(config, blocks).expect("volume"),
        )))
    }

    fn key(offset: u64) -> Key {
        Key::new(256, key_type::DIR_INDEX, offset)
    }

    #[test]
    fn empty_tree_finds_nothing() {
        let journal = journal(8);
        let txn = Transaction::begin(&journal).expect("txn");
        let tree = BTree::create(&txn, Arc::clone(journal.volume()), 5).expect("create");
        assert!(tree.find_exact(&mut key(1)).expect_err("empty").is_not_found());
        assert!(tree.find_next(&mut key(0)).expect_err("empty").is_not_found());
        assert!(tree.find_previous(&mut key(9)).expect_err("empty").is_not_found());
        assert_eq!(tree.root().level, 0);
        assert_eq!(tree.owner(), 5);
    }

    #[test]
    fn find_rewrites_key_and_checks_type() {
        let journal = journal(8);
        let txn = Transaction::begin(&journal).expect("txn");
        let tree = BTree::create(&txn, Arc::clone(journal.volume()), 5).expect("create");
        tree.insert(&txn, key(10), b"ten").expect("insert");
        tree.insert(&txn, Key::new(256, key_type::XATTR_ITEM, 3), b"x")
            .expect("insert");

        let mut probe = key(4);
        assert_eq!(tree.find_next(&mut probe).expect("next"), b"ten");
        assert_eq!(probe, key(10));

        let mut other_type = Key::new(256, key_type::DIR_ITEM, 0);
        assert!(tree.find_next(&mut other_type).expect_err("type").is_not_found());
        assert_eq!(other_type, Key::new(256, key_type::DIR_ITEM, 0));
    }

    #[test]
    fn duplicate_and_unordered_inserts_are_rejected() {
        let journal = journal(8);
        let txn = Transaction::begin(&journal).expect("txn");
        let tree = BTree::create(&txn, Arc::clone(journal.volume()), 5).expect("create");
        tree.insert(&txn, key(1), b"a").expect("insert");
        assert!(matches!(tree.insert(&txn, key(1), b"b"), Err(OfsError::BadValue(_))));

        let mut path = tree.path();
        let unordered: [(Key, &[u8]); 2] = [(key(5), b"x"), (key(4), b"y")];
        assert!(matches!(
            tree.insert_entries(&txn, &mut path, &unordered),
            Err(OfsError::BadValue(_))
        ));
        let too_big = vec![0_u8; 4096];
        assert!(matches!(tree.insert(&txn, key(2), &too_big), Err(OfsError::BadValue(_))));
    }

    #[test]
    fn path_from_another_tree_is_rejected() {
        let journal = journal(8);
        let txn = Transaction::begin(&journal).expect("txn");
        let a = BTree::create(&txn, Arc::clone(journal.volume()), 5).expect("a");
        let b = BTree::create(&txn, Arc::clone(journal.volume()), 6).expect("b");
        let mut path = a.path();
        assert!(matches!(
            b.locate(&mut path, &key(1), Traversal::Forward),
            Err(OfsError::BadValue(_))
        ));
    }

    #[test]
    fn reopen_sees_committed_root() {
        let journal = journal(8);
        let txn = Transaction::begin(&journal).expect("txn");
        let tree = BTree::create(&txn, Arc::clone(journal.volume()), 5).expect("create");
        tree.insert(&txn, key(3), b"three").expect("insert");
        txn.done().expect("commit");

        let again = tree.reopen().expect("reopen");
        assert_eq!(again.root(), tree.root());
        assert_eq!(again.owner(), 5);
        assert_eq!(again.find_exact(&mut key(3)).expect("find"), b"three");
    }

    #[test]
    fn open_unmapped_root_fails() {
        let journal = journal(4);
        assert!(matches!(
            BTree::open(Arc::clone(journal.volume()), 1 << 40),
            Err(OfsError::Unmapped { .. })
        ));
    }
}
