//! Root-to-leaf cursor with per-level nodes and slots.

use crate::node::Node;
use crate::{RootState, TreeCore};
use ofs_error::{OfsError, Result};
use ofs_journal::Transaction;
use ofs_ondisk::node::{HEADER_SIZE, ItemHeader};
use ofs_types::{BlockNumber, Key, MAX_TREE_DEPTH};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// One leaf item as read through a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Key,
    /// Payload start relative to the end of the node header.
    pub offset: u32,
    pub data: Vec<u8>,
}

/// Nodes and slots from the root (at `depth - 1`) down to a leaf (level 0).
///
/// `slots[level]` is the entry of `nodes[level]` the path runs through; for
/// internal levels that is the index entry pointing at `nodes[level - 1]`.
pub struct Path {
    pub(crate) tree: Arc<TreeCore>,
    nodes: [Option<Node>; MAX_TREE_DEPTH],
    slots: [usize; MAX_TREE_DEPTH],
    depth: usize,
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Path")
            .field("depth", &self.depth)
            .field("slots", &&self.slots[..self.depth])
            .finish_non_exhaustive()
    }
}

impl Path {
    pub(crate) fn new(tree: Arc<TreeCore>) -> Self {
        Self {
            tree,
            nodes: std::array::from_fn(|_| None),
            slots: [0; MAX_TREE_DEPTH],
            depth: 0,
        }
    }

    /// Levels currently held, root included.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn slot(&self, level: usize) -> usize {
        self.slots.get(level).copied().unwrap_or(0)
    }

    pub fn set_slot(&mut self, level: usize, slot: usize) -> Result<()> {
        self.check_level(level)?;
        self.slots[level] = slot;
        Ok(())
    }

    /// Drop every held node.
    pub fn release(&mut self) {
        for node in &mut self.nodes {
            *node = None;
        }
        self.slots = [0; MAX_TREE_DEPTH];
        self.depth = 0;
    }

    fn check_level(&self, level: usize) -> Result<()> {
        if level < self.depth {
            Ok(())
        } else {
            Err(OfsError::BadValue(format!(
                "level {level} outside path of depth {}",
                self.depth
            )))
        }
    }

    pub fn node(&self, level: usize) -> Result<&Node> {
        self.nodes
            .get(level)
            .and_then(Option::as_ref)
            .filter(|_| level < self.depth)
            .ok_or_else(|| OfsError::NotInitialized(format!("no node held at level {level}")))
    }

    pub fn node_mut(&mut self, level: usize) -> Result<&mut Node> {
        if level >= self.depth {
            return Err(OfsError::NotInitialized(format!("no node held at level {level}")));
        }
        self.nodes
            .get_mut(level)
            .and_then(Option::as_mut)
            .ok_or_else(|| OfsError::NotInitialized(format!("no node held at level {level}")))
    }

    /// The node at `level`, bound read-only to `block` unless it already is.
    pub fn get_node(&mut self, level: usize, block: BlockNumber) -> Result<&Node> {
        if level >= MAX_TREE_DEPTH {
            return Err(OfsError::TreeTooDeep { depth: level + 1 });
        }
        let held = self.nodes[level]
            .as_ref()
            .is_some_and(|node| node.block() == Some(block));
        if !held {
            let mut node = Node::new(&self.tree.volume);
            node.set_to(block)?;
            self.nodes[level] = Some(node);
        }
        self.depth = self.depth.max(level + 1);
        self.node(level)
    }

    pub(crate) fn install(&mut self, level: usize, node: Node, slot: usize) {
        self.nodes[level] = Some(node);
        self.slots[level] = slot;
    }

    pub(crate) fn set_depth(&mut self, depth: usize) {
        for node in self.nodes.iter_mut().skip(depth) {
            *node = None;
        }
        self.depth = depth;
    }

    /// Read the leaf entry at `slot`.
    pub fn get_entry(&self, slot: usize) -> Result<LeafEntry> {
        let leaf = self.node(0)?;
        let item = leaf.item(slot)?;
        Ok(LeafEntry {
            key: item.key,
            offset: item.data_offset,
            data: leaf.item_data(slot)?,
        })
    }

    /// The leaf entry the path currently points at.
    pub fn current_entry(&self) -> Result<LeafEntry> {
        self.get_entry(self.slot(0))
    }

    /// Write the item at `slot` of the (writable) leaf: its key, its
    /// payload location and the payload bytes.
    pub fn set_entry(&mut self, slot: usize, key: &Key, data: &[u8], offset: u32) -> Result<()> {
        let leaf = self.node_mut(0)?;
        let data_size = u32::try_from(data.len())
            .map_err(|_| OfsError::BadValue(format!("payload of {} bytes", data.len())))?;
        leaf.set_item(
            slot,
            &ItemHeader {
                key: *key,
                data_offset: offset,
                data_size,
            },
        )?;
        leaf.write_item_data(slot, data)
    }

    /// Lowest level at or above `level` whose slot can step in `forward`
    /// direction without leaving its node.
    fn find_pivot(&self, level: usize, forward: bool) -> Result<usize> {
        for current in level..self.depth {
            let slot = self.slots[current];
            let count = self.node(current)?.item_count()?;
            let movable = if forward { slot + 1 < count } else { slot > 0 };
            if movable {
                return Ok(current);
            }
        }
        Err(OfsError::NotFound(format!(
            "no {} neighbour at level {level}",
            if forward { "next" } else { "previous" }
        )))
    }

    fn step_down(&mut self, pivot: usize, level: usize, forward: bool) -> Result<()> {
        if forward {
            self.slots[pivot] += 1;
        } else {
            self.slots[pivot] -= 1;
        }
        for current in (level..pivot).rev() {
            let ptr = self.node(current + 1)?.index(self.slots[current + 1])?;
            let block = self.tree.resolve(ptr.blockptr)?;
            let mut child = Node::new(&self.tree.volume);
            child.set_to_checked(block, Some(ptr.blockptr))?;
            let count = child.item_count()?;
            self.slots[current] = if forward { 0 } else { count.saturating_sub(1) };
            self.nodes[current] = Some(child);
        }
        Ok(())
    }

    /// Step the cursor at `level` by one entry, crossing into the
    /// neighbouring node through the parents when the node is exhausted.
    ///
    /// At the edge of the tree this fails with `NotFound` and leaves the
    /// path untouched.
    pub fn move_slot(&mut self, level: usize, forward: bool) -> Result<()> {
        self.check_level(level)?;
        let pivot = self.find_pivot(level, forward)?;
        self.step_down(pivot, level, forward)
    }

    /// Move to the neighbouring leaf: its first slot going forward, its
    /// last going backward.
    pub fn switch_leaf(&mut self, forward: bool) -> Result<()> {
        if self.depth < 2 {
            return Err(OfsError::NotFound("tree has a single leaf".to_owned()));
        }
        let pivot = self.find_pivot(1, forward)?;
        self.step_down(pivot, 0, forward)
    }

    /// Make the node at `level` writable in `txn` and repack it.
    ///
    /// The repack keeps `[start, start + num)` when `length` is zero,
    /// removes that range when `length` is negative, and opens `num` empty
    /// slots at `start` reserving `length` bytes when positive.
    ///
    /// A node already written in `txn` is repacked in place. Otherwise a
    /// new node is allocated, stamped with the transaction generation and
    /// hooked into its parent (copied the same way) or installed as the
    /// tree root.
    pub fn copy_on_write(
        &mut self,
        txn: &Transaction,
        level: usize,
        start: usize,
        num: usize,
        length: i64,
    ) -> Result<()> {
        let txn_id = txn.id()?;
        let generation = txn.generation()?.0;
        let old = self.node(level)?;
        let old_block = old
            .block()
            .ok_or_else(|| OfsError::NotInitialized(format!("node at level {level} is unbound")))?;
        let origin = old.snapshot()?;
        let header = old.header()?;
        let range = start..start + num;

        if txn.has_block(old_block) {
            let node = self.node_mut(level)?;
            if !node.is_writable() {
                node.set_to_writable(old_block, txn_id, false)?;
            }
            trace!(block = old_block.0, level, start, num, length, "btree_cow_in_place");
            return node.copy_range(&origin, range, length);
        }

        let volume = Arc::clone(&self.tree.volume);
        let (logical, block) = volume.allocate_node()?;
        let mut fresh = Node::new(&volume);
        fresh.set_to_writable(block, txn_id, true)?;
        fresh.init_header(&header)?;
        fresh.copy_range(&origin, range, length)?;
        fresh.set_logical(logical)?;
        fresh.set_generation(generation)?;
        debug!(
            old_node = old_block.0,
            new_node = block.0,
            level,
            logical,
            generation,
            "btree_cow"
        );
        self.nodes[level] = Some(fresh);

        if level + 1 >= self.depth {
            return self.tree.replace_root(
                txn_id,
                RootState {
                    logical,
                    block,
                    level: header.level,
                },
            );
        }

        let parent_count = self.node(level + 1)?.item_count()?;
        self.copy_on_write(txn, level + 1, 0, parent_count, 0)?;
        let parent_slot = self.slots[level + 1];
        let parent = self.node_mut(level + 1)?;
        let mut ptr = parent.index(parent_slot)?;
        ptr.blockptr = logical;
        ptr.generation = generation;
        parent.set_index(parent_slot, &ptr)
    }

    /// Bytes available for new items in an empty leaf.
    pub(crate) fn leaf_capacity(&self) -> usize {
        self.tree.volume.node_size() as usize - HEADER_SIZE
    }
}
