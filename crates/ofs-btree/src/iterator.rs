//! Cursor-style iteration over one item type.

use crate::TreeCore;
use crate::node::Traversal;
use ofs_error::{OfsError, Result};
use ofs_types::Key;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    /// No entry returned yet since creation, `find` or `rewind`.
    Fresh,
    /// The cursor holds the last returned key; steps move past it.
    Positioned,
    /// The tree went away; every call fails with `Interrupted`.
    Stopped,
}

/// The iterator's reference to its tree, cleared when the tree is dropped.
pub(crate) struct IteratorLink {
    tree: Mutex<Option<Arc<TreeCore>>>,
}

impl IteratorLink {
    fn current(&self) -> Option<Arc<TreeCore>> {
        self.tree.lock().clone()
    }

    fn stop(&self) {
        self.tree.lock().take();
    }
}

/// Live iterators of one tree handle, by id.
#[derive(Default)]
pub(crate) struct IteratorRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, Weak<IteratorLink>>>,
}

impl IteratorRegistry {
    fn register(&self, link: &Arc<IteratorLink>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.lock().insert(id, Arc::downgrade(link));
        id
    }

    fn unregister(&self, id: u64) {
        self.live.lock().remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// Stop every registered iterator; returns how many were still alive.
    pub(crate) fn stop_all(&self) -> usize {
        let links: Vec<_> = self.live.lock().drain().map(|(_, link)| link).collect();
        let mut stopped = 0;
        for link in links.iter().filter_map(Weak::upgrade) {
            link.stop();
            stopped += 1;
        }
        stopped
    }
}

/// Steps through entries of the cursor key's item type in key order.
///
/// Each step searches the tree afresh, so the iterator observes mutations
/// made between steps.
pub struct TreeIterator {
    id: u64,
    link: Arc<IteratorLink>,
    registry: Weak<IteratorRegistry>,
    cursor: Key,
    /// Set by `rewind`: the cursor sits past the tree's edge, so the next
    /// step lands on the edge offset itself.
    outside: bool,
    state: IteratorState,
}

impl fmt::Debug for TreeIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeIterator")
            .field("id", &self.id)
            .field("cursor", &self.cursor)
            .field("state", &self.state())
            .finish()
    }
}

impl TreeIterator {
    pub(crate) fn new(tree: &Arc<TreeCore>, registry: &Arc<IteratorRegistry>, key: Key) -> Self {
        let link = Arc::new(IteratorLink {
            tree: Mutex::new(Some(Arc::clone(tree))),
        });
        let id = registry.register(&link);
        Self {
            id,
            link,
            registry: Arc::downgrade(registry),
            cursor: key,
            outside: false,
            state: IteratorState::Fresh,
        }
    }

    #[must_use]
    pub fn state(&self) -> IteratorState {
        if self.link.current().is_none() {
            IteratorState::Stopped
        } else {
            self.state
        }
    }

    /// Cursor key: the start key while fresh, the last returned key after.
    /// Steps search from one offset past it.
    #[must_use]
    pub fn key(&self) -> Key {
        self.cursor
    }

    fn tree(&mut self) -> Result<Arc<TreeCore>> {
        if let Some(tree) = self.link.current() {
            return Ok(tree);
        }
        self.state = IteratorState::Stopped;
        Err(OfsError::Interrupted)
    }

    /// Restart from `key` without touching the tree.
    pub fn find(&mut self, key: Key) -> Result<()> {
        self.tree()?;
        self.cursor = key;
        self.outside = false;
        self.state = IteratorState::Fresh;
        Ok(())
    }

    /// Restart at the lowest offset of the cursor's object and type, or at
    /// the highest with `inverse`.
    pub fn rewind(&mut self, inverse: bool) -> Result<()> {
        self.tree()?;
        self.cursor = self
            .cursor
            .with_offset(if inverse { u64::MAX } else { 0 });
        self.outside = true;
        self.state = IteratorState::Fresh;
        Ok(())
    }

    pub fn get_next_entry(&mut self) -> Result<(Key, Vec<u8>)> {
        self.traverse(true)
    }

    pub fn get_previous_entry(&mut self) -> Result<(Key, Vec<u8>)> {
        self.traverse(false)
    }

    fn traverse(&mut self, forward: bool) -> Result<(Key, Vec<u8>)> {
        let tree = self.tree()?;
        let traversal = if forward {
            Traversal::Forward
        } else {
            Traversal::Backward
        };
        if self.state == IteratorState::Stopped {
            return Err(OfsError::Interrupted);
        }
        let mut key = if self.outside {
            self.cursor
        } else {
            let offset = if forward {
                self.cursor.offset.checked_add(1)
            } else {
                self.cursor.offset.checked_sub(1)
            };
            let Some(offset) = offset else {
                return Err(OfsError::NotFound(format!(
                    "iterator at the edge of {}",
                    self.cursor
                )));
            };
            self.cursor.with_offset(offset)
        };
        let data = tree.find(&mut key, traversal)?;
        trace!(iterator = self.id, key = %key, forward, "btree_iterator_step");
        self.cursor = key;
        self.outside = false;
        self.state = IteratorState::Positioned;
        Ok((key, data))
    }
}

impl Drop for TreeIterator {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}
