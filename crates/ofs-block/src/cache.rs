//! Transactional block cache.
//!
//! The tree engine only talks to the [`BlockCache`] trait. [`TxnBlockCache`]
//! is the reference implementation: clean blocks are cached as immutable
//! [`BlockBuf`] snapshots, and blocks bound writable inside a transaction live
//! in a dirty map until the transaction commits (written through to the
//! device) or aborts (dropped).

use crate::{BlockBuf, BlockDevice};
use ofs_error::{OfsError, Result};
use ofs_types::{BlockNumber, TxnId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Transaction lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEvent {
    /// Commit accepted; dirty blocks are about to become clean.
    Ended,
    /// All dirty blocks reached the device.
    Written,
    /// Dirty blocks were discarded.
    Aborted,
}

pub type TransactionListener = Box<dyn FnMut(TxnId, TransactionEvent) + Send>;

/// Invoked once after a committed transaction reached the device.
pub type WrittenCallback = Box<dyn FnOnce(TxnId) + Send>;

/// Exclusive writable handle on one block inside one transaction.
///
/// Clones share the same buffer, so a node rebound writable in the same
/// transaction sees earlier modifications.
#[derive(Debug, Clone)]
pub struct WritableBlock {
    block: BlockNumber,
    txn: TxnId,
    data: Arc<Mutex<Vec<u8>>>,
}

impl WritableBlock {
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    #[must_use]
    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock()
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

/// Block cache contract used by the tree engine.
pub trait BlockCache: Send + Sync {
    fn block_size(&self) -> u32;

    fn block_count(&self) -> u64;

    /// Read-only view of the newest content of `block`.
    fn get(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Bind `block` writable in `txn`, starting from its current content.
    fn get_writable(&self, block: BlockNumber, txn: TxnId) -> Result<WritableBlock>;

    /// Bind `block` writable in `txn`, zero-filled.
    fn get_empty(&self, block: BlockNumber, txn: TxnId) -> Result<WritableBlock>;

    /// Release one reference taken by `get`, `get_writable` or `get_empty`.
    fn put(&self, block: BlockNumber);

    fn begin_transaction(&self) -> Result<TxnId>;

    /// Commit `txn`. `on_written` runs after the blocks reached the device.
    fn end_transaction(&self, txn: TxnId, on_written: Option<WrittenCallback>) -> Result<()>;

    fn abort_transaction(&self, txn: TxnId) -> Result<()>;

    fn has_block_in_transaction(&self, txn: TxnId, block: BlockNumber) -> bool;

    fn add_transaction_listener(&self, txn: TxnId, listener: TransactionListener) -> Result<()>;

    /// Outstanding references on `block`, for diagnostics.
    fn ref_count(&self, block: BlockNumber) -> usize;
}

struct DirtyBlock {
    txn: TxnId,
    data: Arc<Mutex<Vec<u8>>>,
}

#[derive(Default)]
struct TxnState {
    blocks: BTreeSet<BlockNumber>,
    listeners: Vec<TransactionListener>,
}

#[derive(Default)]
struct CacheState {
    clean: HashMap<BlockNumber, BlockBuf>,
    dirty: HashMap<BlockNumber, DirtyBlock>,
    txns: HashMap<TxnId, TxnState>,
    refs: HashMap<BlockNumber, usize>,
    next_txn: u64,
}

impl CacheState {
    fn acquire(&mut self, block: BlockNumber) {
        *self.refs.entry(block).or_insert(0) += 1;
    }

    fn ensure_open(&self, txn: TxnId) -> Result<()> {
        if self.txns.contains_key(&txn) {
            Ok(())
        } else {
            Err(OfsError::NotInitialized(format!(
                "transaction {txn} is not open"
            )))
        }
    }

    /// Fails with `Busy` when another open transaction owns `block`.
    fn check_owner(&self, block: BlockNumber, txn: TxnId) -> Result<Option<&DirtyBlock>> {
        match self.dirty.get(&block) {
            Some(dirty) if dirty.txn != txn => Err(OfsError::Busy { block: block.0 }),
            other => Ok(other),
        }
    }
}

/// Reference transactional cache over any [`BlockDevice`].
pub struct TxnBlockCache<D: BlockDevice> {
    device: D,
    state: Mutex<CacheState>,
}

impl<D: BlockDevice> std::fmt::Debug for TxnBlockCache<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TxnBlockCache")
            .field("block_size", &self.device.block_size())
            .field("clean", &state.clean.len())
            .field("dirty", &state.dirty.len())
            .field("open_txns", &state.txns.len())
            .finish()
    }
}

impl<D: BlockDevice> TxnBlockCache<D> {
    #[must_use]
    pub fn new(device: D) -> Self {
        Self {
            device,
            state: Mutex::new(CacheState {
                next_txn: 1,
                ..CacheState::default()
            }),
        }
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Number of blocks currently dirty in `txn`.
    #[must_use]
    pub fn dirty_count(&self, txn: TxnId) -> usize {
        self.state
            .lock()
            .txns
            .get(&txn)
            .map_or(0, |state| state.blocks.len())
    }

    fn check_block(&self, block: BlockNumber) -> Result<()> {
        if block.0 >= self.device.block_count() {
            return Err(OfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0,
                self.device.block_count()
            )));
        }
        Ok(())
    }

    /// Write every dirty block of a committing transaction to the device.
    ///
    /// On failure the blocks not yet written are discarded and dropped from
    /// the clean map, so later reads go back to the device.
    fn write_through(&self, blocks: &BTreeSet<BlockNumber>) -> Result<usize> {
        let mut state = self.state.lock();
        let mut written = 0_usize;
        for (index, block) in blocks.iter().enumerate() {
            let Some(dirty) = state.dirty.remove(block) else {
                continue;
            };
            let bytes = dirty.data.lock().clone();
            if let Err(err) = self.device.write_block(*block, &bytes) {
                state.clean.remove(block);
                for rest in blocks.iter().skip(index + 1) {
                    state.dirty.remove(rest);
                    state.clean.remove(rest);
                }
                return Err(err);
            }
            state.clean.insert(*block, BlockBuf::new(bytes));
            written += 1;
        }
        drop(state);
        self.device.sync()?;
        Ok(written)
    }

    fn bind(&self, block: BlockNumber, txn: TxnId, zeroed: bool) -> Result<WritableBlock> {
        self.check_block(block)?;
        let mut state = self.state.lock();
        state.ensure_open(txn)?;

        if let Some(existing) = state.check_owner(block, txn)? {
            let data = Arc::clone(&existing.data);
            if zeroed {
                data.lock().fill(0);
            }
            state.acquire(block);
            drop(state);
            return Ok(WritableBlock { block, txn, data });
        }

        let contents = if zeroed {
            vec![0_u8; self.device.block_size() as usize]
        } else if let Some(clean) = state.clean.get(&block) {
            clean.to_vec()
        } else {
            self.device.read_block(block)?.to_vec()
        };

        let data = Arc::new(Mutex::new(contents));
        state.dirty.insert(
            block,
            DirtyBlock {
                txn,
                data: Arc::clone(&data),
            },
        );
        if let Some(txn_state) = state.txns.get_mut(&txn) {
            txn_state.blocks.insert(block);
        }
        state.acquire(block);
        drop(state);
        trace!(block = block.0, txn = txn.0, zeroed, "cache_bind_writable");
        Ok(WritableBlock { block, txn, data })
    }
}

impl<D: BlockDevice> BlockCache for TxnBlockCache<D> {
    fn block_size(&self) -> u32 {
        self.device.block_size()
    }

    fn block_count(&self) -> u64 {
        self.device.block_count()
    }

    fn get(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.check_block(block)?;
        let mut state = self.state.lock();
        let buf = if let Some(dirty) = state.dirty.get(&block) {
            BlockBuf::new(dirty.data.lock().clone())
        } else if let Some(clean) = state.clean.get(&block) {
            clean.clone()
        } else {
            let buf = self.device.read_block(block)?;
            state.clean.insert(block, buf.clone());
            buf
        };
        state.acquire(block);
        drop(state);
        Ok(buf)
    }

    fn get_writable(&self, block: BlockNumber, txn: TxnId) -> Result<WritableBlock> {
        self.bind(block, txn, false)
    }

    fn get_empty(&self, block: BlockNumber, txn: TxnId) -> Result<WritableBlock> {
        self.bind(block, txn, true)
    }

    fn put(&self, block: BlockNumber) {
        let mut state = self.state.lock();
        let Some(count) = state.refs.get_mut(&block) else {
            warn!(block = block.0, "cache_put_without_reference");
            return;
        };
        *count -= 1;
        if *count == 0 {
            state.refs.remove(&block);
        }
    }

    fn begin_transaction(&self) -> Result<TxnId> {
        let mut state = self.state.lock();
        let txn = TxnId(state.next_txn);
        state.next_txn += 1;
        state.txns.insert(txn, TxnState::default());
        drop(state);
        debug!(txn = txn.0, "cache_txn_begin");
        Ok(txn)
    }

    fn end_transaction(&self, txn: TxnId, on_written: Option<WrittenCallback>) -> Result<()> {
        let Some(mut txn_state) = self.state.lock().txns.remove(&txn) else {
            return Err(OfsError::NotInitialized(format!(
                "transaction {txn} is not open"
            )));
        };

        for listener in &mut txn_state.listeners {
            listener(txn, TransactionEvent::Ended);
        }

        let written = match self.write_through(&txn_state.blocks) {
            Ok(written) => written,
            Err(err) => {
                warn!(txn = txn.0, error = %err, "cache_txn_commit_failed");
                for listener in &mut txn_state.listeners {
                    listener(txn, TransactionEvent::Aborted);
                }
                return Err(err);
            }
        };
        debug!(txn = txn.0, blocks = written, "cache_txn_commit");

        if let Some(callback) = on_written {
            callback(txn);
        }
        for listener in &mut txn_state.listeners {
            listener(txn, TransactionEvent::Written);
        }
        Ok(())
    }

    fn abort_transaction(&self, txn: TxnId) -> Result<()> {
        let mut state = self.state.lock();
        let Some(mut txn_state) = state.txns.remove(&txn) else {
            return Err(OfsError::NotInitialized(format!(
                "transaction {txn} is not open"
            )));
        };
        for block in &txn_state.blocks {
            state.dirty.remove(block);
        }
        drop(state);
        debug!(txn = txn.0, blocks = txn_state.blocks.len(), "cache_txn_abort");
        for listener in &mut txn_state.listeners {
            listener(txn, TransactionEvent::Aborted);
        }
        Ok(())
    }

    fn has_block_in_transaction(&self, txn: TxnId, block: BlockNumber) -> bool {
        self.state
            .lock()
            .dirty
            .get(&block)
            .is_some_and(|dirty| dirty.txn == txn)
    }

    fn add_transaction_listener(&self, txn: TxnId, listener: TransactionListener) -> Result<()> {
        let mut state = self.state.lock();
        let Some(txn_state) = state.txns.get_mut(&txn) else {
            return Err(OfsError::NotInitialized(format!(
                "transaction {txn} is not open"
            )));
        };
        txn_state.listeners.push(listener);
        Ok(())
    }

    fn ref_count(&self, block: BlockNumber) -> usize {
        self.state.lock().refs.get(&block).copied().unwrap_or(0)
    }
}
