#![forbid(unsafe_code)]
//! Journal and transactions.
//!
//! The [`Journal`] is one recursive critical section per volume. The thread
//! that holds it may enter again; nested entries share the block-cache
//! transaction opened by the outermost one. Nesting is tracked explicitly:
//! a depth counter plus an arena of owner records, each naming the owner that
//! was active when it entered.
//!
//! A [`Transaction`] is the scoped handle over one entry. Dropping it without
//! calling [`Transaction::done`] releases its level with `success = false`,
//! which aborts the cache transaction when it was the outermost level.

use ofs_block::WrittenCallback;
use ofs_error::{OfsError, Result};
use ofs_types::{BlockNumber, Generation, TxnId};
use ofs_volume::Volume;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use tracing::{debug, trace, warn};

/// Identity of one journal entry (one [`Transaction`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct OwnerRecord {
    parent: Option<OwnerId>,
}

#[derive(Debug, Default)]
struct JournalState {
    holder: Option<ThreadId>,
    depth: usize,
    owners: HashMap<OwnerId, OwnerRecord>,
    active: Option<OwnerId>,
    cache_txn: Option<TxnId>,
    generation: Generation,
    next_owner: u64,
}

pub struct Journal {
    volume: Arc<Volume>,
    state: Mutex<JournalState>,
    released: Condvar,
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Journal")
            .field("depth", &state.depth)
            .field("active", &state.active)
            .field("cache_txn", &state.cache_txn)
            .field("generation", &state.generation)
            .finish_non_exhaustive()
    }
}

impl Journal {
    #[must_use]
    pub fn new(volume: Arc<Volume>) -> Self {
        let generation = volume.superblock_generation();
        Self {
            volume,
            state: Mutex::new(JournalState {
                generation,
                next_owner: 1,
                ..JournalState::default()
            }),
            released: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, JournalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    /// Reserve an identity for a new entry.
    pub fn new_owner(&self) -> OwnerId {
        let mut state = self.state();
        let owner = OwnerId(state.next_owner);
        state.next_owner += 1;
        owner
    }

    /// Enter the critical section as `owner`.
    ///
    /// Blocks while another thread holds the journal. The outermost entry
    /// opens a cache transaction and advances the generation.
    pub fn lock(&self, owner: OwnerId) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        while state.holder.is_some_and(|holder| holder != me) {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.owners.contains_key(&owner) {
            return Err(OfsError::BadValue(format!(
                "owner {owner} already holds the journal"
            )));
        }

        let parent = state.active;
        state.holder = Some(me);
        state.depth += 1;
        state.owners.insert(owner, OwnerRecord { parent });
        state.active = Some(owner);

        if state.depth > 1 {
            trace!(owner = owner.0, depth = state.depth, "journal_lock_nested");
            return Ok(());
        }

        match self.volume.cache().begin_transaction() {
            Ok(txn) => {
                state.cache_txn = Some(txn);
                state.generation = state.generation.next();
                debug!(
                    owner = owner.0,
                    txn = txn.0,
                    generation = state.generation.0,
                    "journal_txn_begin"
                );
                Ok(())
            }
            Err(err) => {
                state.owners.remove(&owner);
                state.active = parent;
                state.depth -= 1;
                state.holder = None;
                drop(state);
                self.released.notify_all();
                Err(err)
            }
        }
    }

    /// Leave one level of the critical section.
    ///
    /// When the outermost level leaves, the cache transaction is committed
    /// (`success`) or aborted. A commit persists the new generation into the
    /// superblock once the blocks are written.
    pub fn unlock(&self, owner: OwnerId, success: bool) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.holder != Some(me) {
            return Err(OfsError::BadValue(
                "journal is not held by this thread".to_owned(),
            ));
        }
        let Some(record) = state.owners.remove(&owner) else {
            return Err(OfsError::NotInitialized(format!(
                "owner {owner} does not hold the journal"
            )));
        };
        if state.active == Some(owner) {
            state.active = record.parent;
        }

        let result = if state.depth == 1 {
            self.finish(&mut state, owner, success)
        } else {
            trace!(owner = owner.0, depth = state.depth, success, "journal_unlock_nested");
            Ok(())
        };

        state.depth -= 1;
        if state.depth == 0 {
            state.holder = None;
            state.active = None;
            drop(state);
            self.released.notify_all();
        }
        result
    }

    fn finish(&self, state: &mut JournalState, owner: OwnerId, success: bool) -> Result<()> {
        let Some(txn) = state.cache_txn.take() else {
            return Ok(());
        };
        let cache = self.volume.cache();
        if success {
            let generation = state.generation;
            let volume = Arc::downgrade(&self.volume);
            let on_written: WrittenCallback = Box::new(move |_| {
                if let Some(volume) = volume.upgrade() {
                    volume.set_superblock_generation(generation);
                }
            });
            debug!(
                owner = owner.0,
                txn = txn.0,
                generation = generation.0,
                "journal_txn_commit"
            );
            cache.end_transaction(txn, Some(on_written))
        } else {
            debug!(owner = owner.0, txn = txn.0, "journal_txn_abort");
            cache.abort_transaction(txn)
        }
    }

    /// Open cache transaction, if any entry is active.
    #[must_use]
    pub fn current_transaction(&self) -> Option<TxnId> {
        self.state().cache_txn
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.state().generation
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.state().depth
    }

    #[must_use]
    pub fn active_owner(&self) -> Option<OwnerId> {
        self.state().active
    }

    /// The owner that was active when `owner` entered.
    #[must_use]
    pub fn parent_of(&self, owner: OwnerId) -> Option<OwnerId> {
        self.state()
            .owners
            .get(&owner)
            .and_then(|record| record.parent)
    }
}

/// Scoped handle over one journal entry.
///
/// Not `Send`: the journal is re-entrant per thread, so an entry must be
/// released on the thread that took it.
pub struct Transaction {
    journal: Option<Arc<Journal>>,
    owner: Option<OwnerId>,
    parent: Option<OwnerId>,
    _thread_bound: PhantomData<*const ()>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("owner", &self.owner)
            .field("parent", &self.parent)
            .field("started", &self.journal.is_some())
            .finish()
    }
}

impl Transaction {
    /// Enter `journal` and return the handle.
    pub fn begin(journal: &Arc<Journal>) -> Result<Self> {
        let mut transaction = Self::detached();
        transaction.start(journal)?;
        Ok(transaction)
    }

    /// A handle not yet bound to any journal.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            journal: None,
            owner: None,
            parent: None,
            _thread_bound: PhantomData,
        }
    }

    pub fn start(&mut self, journal: &Arc<Journal>) -> Result<()> {
        if self.journal.is_some() {
            return Err(OfsError::BadValue(
                "transaction already started".to_owned(),
            ));
        }
        let owner = journal.new_owner();
        journal.lock(owner)?;
        self.parent = journal.parent_of(owner);
        self.owner = Some(owner);
        self.journal = Some(Arc::clone(journal));
        Ok(())
    }

    fn journal(&self) -> Result<&Arc<Journal>> {
        self.journal
            .as_ref()
            .ok_or_else(|| OfsError::NotInitialized("transaction not started".to_owned()))
    }

    /// Underlying cache transaction id (shared by nested transactions).
    pub fn id(&self) -> Result<TxnId> {
        self.journal()?
            .current_transaction()
            .ok_or_else(|| OfsError::NotInitialized("no cache transaction open".to_owned()))
    }

    /// Generation stamped into nodes written by this transaction.
    pub fn generation(&self) -> Result<Generation> {
        Ok(self.journal()?.generation())
    }

    #[must_use]
    pub fn owner(&self) -> Option<OwnerId> {
        self.owner
    }

    /// Owner that was active when this transaction started.
    #[must_use]
    pub fn parent(&self) -> Option<OwnerId> {
        self.parent
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.journal.is_some()
    }

    /// Whether `block` is already writable inside this transaction.
    #[must_use]
    pub fn has_block(&self, block: BlockNumber) -> bool {
        let Ok(journal) = self.journal() else {
            return false;
        };
        journal
            .current_transaction()
            .is_some_and(|txn| journal.volume().cache().has_block_in_transaction(txn, block))
    }

    /// Complete the transaction successfully and detach from the journal.
    pub fn done(mut self) -> Result<()> {
        let journal = self
            .journal
            .take()
            .ok_or_else(|| OfsError::NotInitialized("transaction not started".to_owned()))?;
        let owner = self
            .owner
            .ok_or_else(|| OfsError::NotInitialized("transaction has no owner".to_owned()))?;
        journal.unlock(owner, true)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let (Some(journal), Some(owner)) = (self.journal.take(), self.owner) else {
            return;
        };
        if let Err(err) = journal.unlock(owner, false) {
            warn!(owner = owner.0, error = %err, "transaction_abort_failed");
        }
    }
}
