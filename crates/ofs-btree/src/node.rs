//! A tree node bound to one cache block.
//!
//! A [`Node`] is either bound read-only (a [`BlockBuf`] snapshot) or
//! writable inside a cache transaction. Dropping or rebinding a node
//! releases its cache reference.

use ofs_block::{BlockBuf, BlockCache, WritableBlock};
use ofs_error::{OfsError, Result};
use ofs_ondisk::node::{
    HEADER_SIZE, ITEM_SIZE, ItemHeader, KEY_PTR_SIZE, KeyPtr, NodeHeader, entry_offset, read_key,
    write_bytenr, write_generation, write_level, write_nritems,
};
use ofs_types::{BlockNumber, Key, ParseError, TxnId, usize_to_u32};
use ofs_volume::Volume;
use std::cmp::Ordering;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use tracing::trace;

/// How a search treats a key that is not present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// Only an equal key matches.
    Exact,
    /// Smallest key at or after the search key.
    Forward,
    /// Largest key at or before the search key.
    Backward,
}

enum Binding {
    Unbound,
    ReadOnly(BlockBuf),
    Writable(WritableBlock),
}

pub struct Node {
    cache: Arc<dyn BlockCache>,
    block_size: usize,
    verify: bool,
    block: Option<BlockNumber>,
    binding: Binding,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("block", &self.block)
            .field("writable", &self.is_writable())
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

/// One entry decoded out of an origin node while repacking.
enum Entry {
    Item(ItemHeader, Vec<u8>),
    Index(KeyPtr),
    Hole,
}

impl Node {
    /// An unbound node using the volume's cache and node size.
    #[must_use]
    pub fn new(volume: &Volume) -> Self {
        Self {
            cache: Arc::clone(volume.cache()),
            block_size: volume.node_size() as usize,
            verify: volume.config().verify_headers,
            block: None,
            binding: Binding::Unbound,
        }
    }

    #[must_use]
    pub fn block(&self) -> Option<BlockNumber> {
        self.block
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        !matches!(self.binding, Binding::Unbound)
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        matches!(self.binding, Binding::Writable(_))
    }

    /// Release the cache reference and return to the unbound state.
    pub fn unset(&mut self) {
        self.binding = Binding::Unbound;
        if let Some(block) = self.block.take() {
            self.cache.put(block);
        }
    }

    /// Bind read-only to `block`.
    pub fn set_to(&mut self, block: BlockNumber) -> Result<()> {
        self.set_to_checked(block, None)
    }

    /// Bind read-only and, with header verification on, require the
    /// header to carry `expected` as its own logical address.
    pub fn set_to_checked(&mut self, block: BlockNumber, expected: Option<u64>) -> Result<()> {
        self.unset();
        let buf = self.cache.get(block)?;
        self.block = Some(block);
        self.binding = Binding::ReadOnly(buf);
        self.verify_header(expected)
    }

    /// Bind writable to `block` inside `txn`. With `empty` the block is
    /// zero-filled and its header is not checked.
    pub fn set_to_writable(&mut self, block: BlockNumber, txn: TxnId, empty: bool) -> Result<()> {
        self.unset();
        let writable = if empty {
            self.cache.get_empty(block, txn)?
        } else {
            self.cache.get_writable(block, txn)?
        };
        self.block = Some(block);
        self.binding = Binding::Writable(writable);
        if empty {
            Ok(())
        } else {
            self.verify_header(None)
        }
    }

    fn verify_header(&mut self, expected: Option<u64>) -> Result<()> {
        if !self.verify {
            return Ok(());
        }
        let block_size = self.block_size;
        let checked = self.with_bytes(|bytes| {
            NodeHeader::parse_from_block(bytes)
                .and_then(|header| header.validate(block_size, expected))
                .map_err(|err| self.corrupt(&err))
        });
        if checked.is_err() {
            self.unset();
        }
        checked
    }

    fn corrupt(&self, err: &ParseError) -> OfsError {
        OfsError::Corruption {
            block: self.block.map_or(0, |block| block.0),
            detail: err.to_string(),
        }
    }

    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        match &self.binding {
            Binding::Unbound => Err(OfsError::NotInitialized("node is not bound".to_owned())),
            Binding::ReadOnly(buf) => f(buf.as_slice()),
            Binding::Writable(writable) => {
                let guard = writable.lock();
                f(&guard)
            }
        }
    }

    fn with_bytes_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> Result<R>) -> Result<R> {
        match &self.binding {
            Binding::Unbound => Err(OfsError::NotInitialized("node is not bound".to_owned())),
            Binding::ReadOnly(_) => Err(OfsError::BadValue(format!(
                "node {} is bound read-only",
                self.block.map_or(0, |block| block.0)
            ))),
            Binding::Writable(writable) => {
                let mut guard = writable.lock();
                f(&mut guard)
            }
        }
    }

    /// Copy of the whole block.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.with_bytes(|bytes| Ok(bytes.to_vec()))
    }

    pub fn header(&self) -> Result<NodeHeader> {
        self.with_bytes(|bytes| NodeHeader::parse_from_block(bytes).map_err(|err| self.corrupt(&err)))
    }

    pub fn level(&self) -> Result<u8> {
        Ok(self.header()?.level)
    }

    pub fn item_count(&self) -> Result<usize> {
        Ok(self.header()?.nritems as usize)
    }

    /// Logical address recorded in the header.
    pub fn logical(&self) -> Result<u64> {
        Ok(self.header()?.bytenr)
    }

    pub fn generation(&self) -> Result<u64> {
        Ok(self.header()?.generation)
    }

    pub fn owner(&self) -> Result<u64> {
        Ok(self.header()?.owner)
    }

    fn check_slot(&self, header: &NodeHeader, slot: usize) -> Result<()> {
        if slot < header.nritems as usize {
            Ok(())
        } else {
            Err(OfsError::BadValue(format!(
                "slot {slot} out of range for node {} with {} entries",
                self.block.map_or(0, |block| block.0),
                header.nritems
            )))
        }
    }

    /// Key of entry `slot`, leaf or internal.
    pub fn key(&self, slot: usize) -> Result<Key> {
        self.with_bytes(|bytes| {
            let header = NodeHeader::parse_from_block(bytes).map_err(|err| self.corrupt(&err))?;
            self.check_slot(&header, slot)?;
            read_key(bytes, entry_offset(header.level, slot)).map_err(|err| self.corrupt(&err))
        })
    }

    /// Item header at `slot` of a leaf.
    pub fn item(&self, slot: usize) -> Result<ItemHeader> {
        self.with_bytes(|bytes| {
            let header = NodeHeader::parse_from_block(bytes).map_err(|err| self.corrupt(&err))?;
            if header.level != 0 {
                return Err(OfsError::BadValue("item() on an internal node".to_owned()));
            }
            self.check_slot(&header, slot)?;
            ItemHeader::read(bytes, slot).map_err(|err| self.corrupt(&err))
        })
    }

    /// Copy of the payload of leaf item `slot`.
    pub fn item_data(&self, slot: usize) -> Result<Vec<u8>> {
        let item = self.item(slot)?;
        let range = item
            .data_range(self.block_size)
            .map_err(|err| self.corrupt(&err))?;
        self.with_bytes(|bytes| {
            let mut out = Vec::new();
            out.try_reserve_exact(range.len())
                .map_err(|_| OfsError::NoMemory)?;
            out.extend_from_slice(&bytes[range]);
            Ok(out)
        })
    }

    /// Index entry at `slot` of an internal node.
    pub fn index(&self, slot: usize) -> Result<KeyPtr> {
        self.with_bytes(|bytes| {
            let header = NodeHeader::parse_from_block(bytes).map_err(|err| self.corrupt(&err))?;
            if header.level == 0 {
                return Err(OfsError::BadValue("index() on a leaf".to_owned()));
            }
            self.check_slot(&header, slot)?;
            KeyPtr::read(bytes, slot).map_err(|err| self.corrupt(&err))
        })
    }

    /// Bytes in use: header, entry table and, for leaves, the payload area.
    pub fn space_used(&self) -> Result<usize> {
        let block_size = self.block_size;
        self.with_bytes(|bytes| space_used_of(bytes, block_size).map_err(|err| self.corrupt(&err)))
    }

    pub fn space_left(&self) -> Result<usize> {
        Ok(self.block_size.saturating_sub(self.space_used()?))
    }

    /// Binary search over the node's keys.
    ///
    /// `Forward` may return `item_count()` when every key is smaller.
    /// `Exact` misses and `Backward` searches below the first key fail with
    /// `NotFound`.
    pub fn search_slot(&self, key: &Key, traversal: Traversal) -> Result<usize> {
        self.with_bytes(|bytes| {
            let header = NodeHeader::parse_from_block(bytes).map_err(|err| self.corrupt(&err))?;
            let (mut low, mut high) = (0_usize, header.nritems as usize);
            while low < high {
                let mid = low + (high - low) / 2;
                let probe = read_key(bytes, entry_offset(header.level, mid))
                    .map_err(|err| self.corrupt(&err))?;
                match key.cmp(&probe) {
                    Ordering::Less => high = mid,
                    Ordering::Greater => low = mid + 1,
                    Ordering::Equal => return Ok(mid),
                }
            }
            match traversal {
                Traversal::Exact => Err(OfsError::NotFound(format!("key {key}"))),
                Traversal::Forward => Ok(low),
                Traversal::Backward => low
                    .checked_sub(1)
                    .ok_or_else(|| OfsError::NotFound(format!("no key at or before {key}"))),
            }
        })
    }

    /// Overwrite the whole header.
    pub fn init_header(&mut self, header: &NodeHeader) -> Result<()> {
        self.with_bytes_mut(|bytes| {
            header
                .write_to_block(bytes)
                .map_err(|err| OfsError::BadValue(err.to_string()))
        })
    }

    pub fn set_level(&mut self, level: u8) -> Result<()> {
        self.with_bytes_mut(|bytes| write_level(bytes, level).map_err(|err| OfsError::BadValue(err.to_string())))
    }

    pub fn set_item_count(&mut self, count: usize) -> Result<()> {
        let count = usize_to_u32(count, "nritems").map_err(|err| OfsError::BadValue(err.to_string()))?;
        self.with_bytes_mut(|bytes| write_nritems(bytes, count).map_err(|err| OfsError::BadValue(err.to_string())))
    }

    pub fn set_logical(&mut self, logical: u64) -> Result<()> {
        self.with_bytes_mut(|bytes| write_bytenr(bytes, logical).map_err(|err| OfsError::BadValue(err.to_string())))
    }

    pub fn set_generation(&mut self, generation: u64) -> Result<()> {
        self.with_bytes_mut(|bytes| {
            write_generation(bytes, generation).map_err(|err| OfsError::BadValue(err.to_string()))
        })
    }

    /// Replace the key of entry `slot`, leaf or internal.
    pub fn set_key(&mut self, slot: usize, key: &Key) -> Result<()> {
        let level = self.level()?;
        if level == 0 {
            let mut item = self.item(slot)?;
            item.key = *key;
            self.set_item(slot, &item)
        } else {
            let mut ptr = self.index(slot)?;
            ptr.key = *key;
            self.set_index(slot, &ptr)
        }
    }

    /// Write the item header at `slot` of a leaf.
    pub fn set_item(&mut self, slot: usize, item: &ItemHeader) -> Result<()> {
        let header = self.header()?;
        if header.level != 0 {
            return Err(OfsError::BadValue("set_item() on an internal node".to_owned()));
        }
        self.check_slot(&header, slot)?;
        let range = item
            .data_range(self.block_size)
            .map_err(|err| OfsError::BadValue(err.to_string()))?;
        if range.start < entry_offset(0, header.nritems as usize) {
            return Err(OfsError::BadValue(format!(
                "item data at {} overlaps the item table",
                item.data_offset
            )));
        }
        self.with_bytes_mut(|bytes| {
            item.write(bytes, slot)
                .map_err(|err| OfsError::BadValue(err.to_string()))
        })
    }

    /// Copy `data` into the payload area of item `slot`. The length must
    /// equal the item's recorded size.
    pub fn write_item_data(&mut self, slot: usize, data: &[u8]) -> Result<()> {
        let item = self.item(slot)?;
        if item.data_size as usize != data.len() {
            return Err(OfsError::BadValue(format!(
                "payload of {} bytes for item of size {}",
                data.len(),
                item.data_size
            )));
        }
        let range = item
            .data_range(self.block_size)
            .map_err(|err| OfsError::BadValue(err.to_string()))?;
        self.with_bytes_mut(|bytes| {
            bytes[range].copy_from_slice(data);
            Ok(())
        })
    }

    /// Write the index entry at `slot` of an internal node.
    pub fn set_index(&mut self, slot: usize, ptr: &KeyPtr) -> Result<()> {
        let header = self.header()?;
        if header.level == 0 {
            return Err(OfsError::BadValue("set_index() on a leaf".to_owned()));
        }
        self.check_slot(&header, slot)?;
        self.with_bytes_mut(|bytes| {
            ptr.write(bytes, slot)
                .map_err(|err| OfsError::BadValue(err.to_string()))
        })
    }

    /// Rebuild this node's entries from `origin`, an image of a node at the
    /// same level, keeping this node's header apart from its level and count.
    ///
    /// `end` is inclusive. With `length == 0` only `[start, end]` is kept
    /// (an empty origin yields an empty node). A negative `length` removes
    /// `[start, end]`, which together occupy `-length` bytes. A positive
    /// `length` opens `end - start + 1` empty slots at `start` that together
    /// with their payload take `length` bytes.
    pub fn copy(&mut self, origin: &[u8], start: usize, end: usize, length: i64) -> Result<()> {
        let count = origin_header(origin, self.block_size)?.nritems as usize;
        if length == 0 && count == 0 {
            return self.copy_range(origin, 0..0, 0);
        }
        if end < start {
            return Err(OfsError::BadValue(format!("copy range [{start}, {end}] is inverted")));
        }
        self.copy_range(origin, start..end + 1, length)
    }

    /// [`Node::copy`] with a half-open range; an empty range with zero
    /// length empties the node.
    pub(crate) fn copy_range(&mut self, origin: &[u8], range: Range<usize>, length: i64) -> Result<()> {
        let block_size = self.block_size;
        let header = origin_header(origin, block_size)?;
        let entries = decode_entries(origin, &header, block_size)?;
        let count = entries.len();
        let level = header.level;

        let mut gap = 0_usize;
        let plan: Vec<Entry> = match length.cmp(&0) {
            Ordering::Equal => {
                if range.end > count {
                    return Err(OfsError::BadValue(format!(
                        "copy range {range:?} exceeds {count} entries"
                    )));
                }
                entries.into_iter().skip(range.start).take(range.len()).collect()
            }
            Ordering::Less => {
                if range.is_empty() || range.end > count {
                    return Err(OfsError::BadValue(format!(
                        "remove range {range:?} invalid for {count} entries"
                    )));
                }
                let removed = usize::try_from(length.unsigned_abs())
                    .map_err(|_| OfsError::BadValue("remove length overflow".to_owned()))?;
                let used = space_used_of(origin, block_size).map_err(|err| OfsError::BadValue(err.to_string()))?;
                if removed > used - HEADER_SIZE {
                    return Err(OfsError::BadValue(format!(
                        "cannot remove {removed} bytes from a node using {used}"
                    )));
                }
                entries
                    .into_iter()
                    .enumerate()
                    .filter(|(slot, _)| !range.contains(slot))
                    .map(|(_, entry)| entry)
                    .collect()
            }
            Ordering::Greater => {
                if range.is_empty() || range.start > count {
                    return Err(OfsError::BadValue(format!(
                        "insert range {range:?} invalid for {count} entries"
                    )));
                }
                let reserve = usize::try_from(length)
                    .map_err(|_| OfsError::BadValue("insert length overflow".to_owned()))?;
                let used = space_used_of(origin, block_size).map_err(|err| OfsError::BadValue(err.to_string()))?;
                if reserve > block_size.saturating_sub(used) {
                    return Err(OfsError::BadValue(format!(
                        "{reserve} bytes requested, {} left",
                        block_size.saturating_sub(used)
                    )));
                }
                let table = range.len() * if level == 0 { ITEM_SIZE } else { KEY_PTR_SIZE };
                let payload = reserve.checked_sub(table).ok_or_else(|| {
                    OfsError::BadValue(format!(
                        "{reserve} bytes cannot hold {} entries",
                        range.len()
                    ))
                })?;
                if level == 0 {
                    gap = payload;
                }
                let mut plan = Vec::with_capacity(count + range.len());
                let mut rest = entries.into_iter();
                plan.extend(rest.by_ref().take(range.start));
                plan.extend(range.clone().map(|_| Entry::Hole));
                plan.extend(rest);
                plan
            }
        };

        trace!(
            block = self.block.map_or(0, |block| block.0),
            level,
            from = count,
            to = plan.len(),
            length,
            "node_copy"
        );
        self.with_bytes_mut(|bytes| write_entries(bytes, level, &plan, gap))
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.unset();
    }
}

fn origin_header(origin: &[u8], block_size: usize) -> Result<NodeHeader> {
    if origin.len() != block_size {
        return Err(OfsError::BadValue(format!(
            "origin of {} bytes for node size {block_size}",
            origin.len()
        )));
    }
    NodeHeader::parse_from_block(origin).map_err(|err| OfsError::BadValue(err.to_string()))
}

fn decode_entries(origin: &[u8], header: &NodeHeader, block_size: usize) -> Result<Vec<Entry>> {
    let bad = |err: ParseError| OfsError::BadValue(err.to_string());
    let count = header.nritems as usize;
    let mut entries = Vec::new();
    entries
        .try_reserve_exact(count)
        .map_err(|_| OfsError::NoMemory)?;
    for slot in 0..count {
        if header.level == 0 {
            let item = ItemHeader::read(origin, slot).map_err(bad)?;
            let range = item.data_range(block_size).map_err(bad)?;
            entries.push(Entry::Item(item, origin[range].to_vec()));
        } else {
            entries.push(Entry::Index(KeyPtr::read(origin, slot).map_err(bad)?));
        }
    }
    Ok(entries)
}

/// Lay `plan` out below the header. The first hole reserves `gap` payload
/// bytes; every hole item sits at the bottom of that gap with size zero.
fn write_entries(bytes: &mut [u8], level: u8, plan: &[Entry], gap: usize) -> Result<()> {
    let block_size = bytes.len();
    let bad = |err: ParseError| OfsError::BadValue(err.to_string());
    let overflow = || OfsError::BadValue("entries do not fit in the node".to_owned());

    let table_end = entry_offset(level, plan.len());
    if table_end > block_size {
        return Err(overflow());
    }
    bytes[HEADER_SIZE..].fill(0);
    write_nritems(bytes, usize_to_u32(plan.len(), "nritems").map_err(bad)?).map_err(bad)?;
    write_level(bytes, level).map_err(bad)?;

    let mut cursor = block_size - HEADER_SIZE;
    let mut gap_taken = false;
    for (slot, entry) in plan.iter().enumerate() {
        match entry {
            Entry::Item(item, data) => {
                cursor = cursor.checked_sub(data.len()).ok_or_else(overflow)?;
                if HEADER_SIZE + cursor < table_end {
                    return Err(overflow());
                }
                let placed = ItemHeader {
                    key: item.key,
                    data_offset: usize_to_u32(cursor, "data_offset").map_err(bad)?,
                    data_size: usize_to_u32(data.len(), "data_size").map_err(bad)?,
                };
                placed.write(bytes, slot).map_err(bad)?;
                let start = HEADER_SIZE + cursor;
                bytes[start..start + data.len()].copy_from_slice(data);
            }
            Entry::Index(ptr) => ptr.write(bytes, slot).map_err(bad)?,
            Entry::Hole if level == 0 => {
                if !gap_taken {
                    cursor = cursor.checked_sub(gap).ok_or_else(overflow)?;
                    if HEADER_SIZE + cursor < table_end {
                        return Err(overflow());
                    }
                    gap_taken = true;
                }
                let hole = ItemHeader {
                    key: Key::MIN,
                    data_offset: usize_to_u32(cursor, "data_offset").map_err(bad)?,
                    data_size: 0,
                };
                hole.write(bytes, slot).map_err(bad)?;
            }
            Entry::Hole => {}
        }
    }
    Ok(())
}

/// Used bytes of a node image: header, table and the packed payload area.
pub(crate) fn space_used_of(bytes: &[u8], block_size: usize) -> std::result::Result<usize, ParseError> {
    let header = NodeHeader::parse_from_block(bytes)?;
    let count = header.nritems as usize;
    if header.level != 0 {
        return Ok(HEADER_SIZE + count * KEY_PTR_SIZE);
    }
    let area = block_size - HEADER_SIZE;
    let mut lowest = area;
    for slot in 0..count {
        lowest = lowest.min(ItemHeader::read(bytes, slot)?.data_offset as usize);
    }
    Ok(HEADER_SIZE + count * ITEM_SIZE + (area - lowest))
}

#[cfg(test)]
#[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
mod tests {
    use super::*;
    use ofs_volume::VolumeConfig;

    const BS: usize = 4096;

    fn volume() -> Volume {
        Volume::in_memory(
            VolumeConfig {
                node_size: BS as u32,
                ..VolumeConfig::default()
            },
            8,
        )
        .expect("volume")
    }

    fn leaf_image(items: &[(Key, &[u8])]) -> Vec<u8> {
        let mut bytes = vec![0_u8; BS];
        NodeHeader {
            bytenr: 4096,
            nritems: items.len() as u32,
            ..NodeHeader::default()
        }
        .write_to_block(&mut bytes)
        .expect("header");
        let mut cursor = BS - HEADER_SIZE;
        for (slot, (key, data)) in items.iter().enumerate() {
            cursor -= data.len();
            ItemHeader {
                key: *key,
                data_offset: cursor as u32,
                data_size: data.len() as u32,
            }
            .write(&mut bytes, slot)
            .expect("item");
            bytes[HEADER_SIZE + cursor..HEADER_SIZE + cursor + data.len()].copy_from_slice(data);
        }
        bytes
    }

    fn writable(volume: &Volume, image: &[u8]) -> Node {
        let txn = volume.cache().begin_transaction().expect("txn");
        let mut node = Node::new(volume);
        node.set_to_writable(BlockNumber(1), txn, true).expect("bind");
        node.with_bytes_mut(|bytes| {
            bytes.copy_from_slice(image);
            Ok(())
        })
        .expect("fill");
        node
    }

    fn k(offset: u64) -> Key {
        Key::new(256, 1, offset)
    }

    #[test]
    fn unbound_node_reports_not_initialized() {
        let volume = volume();
        let node = Node::new(&volume);
        assert!(matches!(node.item_count(), Err(OfsError::NotInitialized(_))));
        assert!(!node.is_bound());
    }

    #[test]
    fn search_slot_directions() {
        let volume = volume();
        let node = writable(&volume, &leaf_image(&[(k(10), b"a"), (k(20), b"b"), (k(30), b"c")]));
        assert_eq!(node.search_slot(&k(20), Traversal::Exact).expect("exact"), 1);
        assert!(node.search_slot(&k(25), Traversal::Exact).expect_err("miss").is_not_found());
        assert_eq!(node.search_slot(&k(25), Traversal::Forward).expect("fwd"), 2);
        assert_eq!(node.search_slot(&k(35), Traversal::Forward).expect("end"), 3);
        assert_eq!(node.search_slot(&k(25), Traversal::Backward).expect("back"), 1);
        assert!(node.search_slot(&k(5), Traversal::Backward).expect_err("below").is_not_found());
    }

    #[test]
    fn space_accounting_for_leaf() {
        let volume = volume();
        let node = writable(&volume, &leaf_image(&[(k(1), &[1; 10]), (k(2), &[2; 30])]));
        assert_eq!(node.space_used().expect("used"), HEADER_SIZE + 2 * ITEM_SIZE + 40);
        assert_eq!(node.space_left().expect("left"), BS - HEADER_SIZE - 2 * ITEM_SIZE - 40);
        assert_eq!(node.item_data(1).expect("data"), vec![2; 30]);
    }

    #[test]
    fn copy_keeps_inclusive_range() {
        let volume = volume();
        let origin = leaf_image(&[(k(1), b"one"), (k(2), b"two"), (k(3), b"three")]);
        let mut node = writable(&volume, &origin);
        node.copy(&origin, 1, 2, 0).expect("copy");
        assert_eq!(node.item_count().expect("count"), 2);
        assert_eq!(node.key(0).expect("key"), k(2));
        assert_eq!(node.item_data(1).expect("data"), b"three");
        assert_eq!(node.logical().expect("header kept"), 4096);
    }

    #[test]
    fn copy_removes_range_and_checks_length() {
        let volume = volume();
        let origin = leaf_image(&[(k(1), b"one"), (k(2), b"two"), (k(3), b"three")]);
        let mut node = writable(&volume, &origin);
        let too_much = -((3 * ITEM_SIZE + 12) as i64);
        assert!(matches!(node.copy(&origin, 0, 0, too_much), Err(OfsError::BadValue(_))));

        node.copy(&origin, 1, 1, -((ITEM_SIZE + 3) as i64)).expect("remove");
        assert_eq!(node.item_count().expect("count"), 2);
        assert_eq!(node.key(1).expect("key"), k(3));
        assert_eq!(node.space_used().expect("used"), HEADER_SIZE + 2 * ITEM_SIZE + 8);
    }

    #[test]
    fn copy_opens_hole_below_previous_item() {
        let volume = volume();
        let origin = leaf_image(&[(k(1), b"aaaa"), (k(3), b"cccc")]);
        let mut node = writable(&volume, &origin);
        node.copy(&origin, 1, 1, (ITEM_SIZE + 6) as i64).expect("insert");

        assert_eq!(node.item_count().expect("count"), 3);
        let first = node.item(0).expect("first");
        let hole = node.item(1).expect("hole");
        assert_eq!(hole.data_size, 0);
        assert_eq!(hole.data_offset, first.data_offset - 6);
        assert_eq!(node.item(2).expect("moved").data_offset, hole.data_offset - 4);
        assert_eq!(node.item_data(2).expect("data"), b"cccc");
        assert_eq!(node.space_used().expect("used"), HEADER_SIZE + 3 * ITEM_SIZE + 14);

        let full = (node.space_left().expect("left") + 1) as i64;
        let snapshot = node.snapshot().expect("snapshot");
        assert!(matches!(node.copy(&snapshot, 0, 0, full), Err(OfsError::BadValue(_))));
    }

    #[test]
    fn copy_of_empty_origin_yields_empty_node() {
        let volume = volume();
        let origin = leaf_image(&[]);
        let mut node = writable(&volume, &leaf_image(&[(k(9), b"x")]));
        node.copy(&origin, 0, 0, 0).expect("copy");
        assert_eq!(node.item_count().expect("count"), 0);
        assert_eq!(node.space_used().expect("used"), HEADER_SIZE);
    }

    #[test]
    fn read_only_node_rejects_writes() {
        let volume = volume();
        let mut node = Node::new(&volume);
        node.set_to(BlockNumber(2)).expect("bind");
        assert!(matches!(node.set_level(1), Err(OfsError::BadValue(_))));
    }

    #[test]
    fn header_verification_maps_to_corruption() {
        let volume = volume();
        let mut image = leaf_image(&[]);
        NodeHeader {
            bytenr: 8192,
            level: 9,
            ..NodeHeader::default()
        }
        .write_to_block(&mut image)
        .expect("header");
        let txn = volume.cache().begin_transaction().expect("txn");
        volume
            .cache()
            .get_empty(BlockNumber(2), txn)
            .expect("bind")
            .lock()
            .copy_from_slice(&image);
        volume.cache().end_transaction(txn, None).expect("commit");

        let mut node = Node::new(&volume);
        assert!(matches!(
            node.set_to(BlockNumber(2)),
            Err(OfsError::Corruption { block: 2, .. })
        ));
        assert!(!node.is_bound());
    }
}
