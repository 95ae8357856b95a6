//! # Transactions
//!
//! A transaction links the key lock manager, the redo log, and an
//! in-memory undo log. Ids come from a global monotonically increasing
//! counter; id 0 is reserved for autocommit operations in the redo
//! stream.
//!
//! ## Lock modes
//!
//! `LockMode` selects the isolation the cursor read/write paths enforce:
//!
//! | mode            | read behavior                       | repeatable |
//! |-----------------|--------------------------------------|-----------|
//! | ReadUncommitted | no read locks                        | no        |
//! | ReadCommitted   | lock, read, unlock                   | no        |
//! | RepeatableRead  | shared locks held to commit          | yes       |
//! | Upgradable      | upgradable locks held to commit      | yes       |
//! | Exclusive       | exclusive locks held to commit       | yes       |
//! | Unsafe          | no locking at all                    | no        |
//!
//! ## Ghosts and undo
//!
//! A transactional delete leaves a ghost: the key stays, the value becomes
//! null, and the key lock is retained. Commit physically deletes every
//! ghost before releasing locks; rollback walks the undo log in reverse,
//! restoring values and removing inserted keys.
//!
//! ## The bogus transaction
//!
//! [`Transaction::bogus`] is the distinguished no-isolation transaction:
//! no locks, no redo, no undo. Operations run with raw latch consistency
//! only. It is a value, not a shared singleton.

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::lock::{LockType, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Redo record synced to disk before the operation reports success.
    Sync,
    /// Redo record written but fsync left to the OS.
    NoSync,
    /// Redo record buffered; flushed on checkpoint or close.
    NoFlush,
    /// No redo logging; the operation survives only via checkpoints.
    NoRedo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Upgradable,
    Exclusive,
    Unsafe,
}

impl LockMode {
    /// Reads skip the lock manager entirely.
    pub fn no_read_lock(self) -> bool {
        matches!(self, LockMode::ReadUncommitted | LockMode::Unsafe)
    }

    /// Read locks are retained until commit.
    pub fn repeatable(self) -> bool {
        matches!(
            self,
            LockMode::RepeatableRead | LockMode::Upgradable | LockMode::Exclusive
        )
    }

    /// Lock strength a read at this mode acquires.
    pub fn read_lock_type(self) -> LockType {
        match self {
            LockMode::Upgradable => LockType::Upgradable,
            LockMode::Exclusive => LockType::Exclusive,
            _ => LockType::Shared,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnState {
    #[default]
    Active,
    Committed,
    Aborted,
}

/// One lock registered for release at transaction end.
#[derive(Debug, Clone)]
pub struct HeldLock {
    pub tree_id: u64,
    pub key: Vec<u8>,
    pub hash: u32,
}

/// Undo record applied in reverse order on rollback.
#[derive(Debug, Clone)]
pub enum UndoEntry {
    /// Remove a key this transaction inserted.
    Uninsert { tree_id: u64, key: Vec<u8> },
    /// Restore the previous value of an updated key.
    Unupdate {
        tree_id: u64,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Restore a value this transaction deleted (ghosted).
    Undelete {
        tree_id: u64,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

/// Ghost left by a transactional delete, physically removed at commit.
#[derive(Debug, Clone)]
pub struct GhostRef {
    pub tree_id: u64,
    pub key: Vec<u8>,
    pub hash: u32,
}

#[derive(Default)]
pub(crate) struct TxnInner {
    pub state: TxnState,
    pub held_locks: SmallVec<[HeldLock; 16]>,
    pub undo: Vec<UndoEntry>,
    pub ghosts: Vec<GhostRef>,
}

pub struct Transaction {
    id: TxnId,
    lock_mode: LockMode,
    durability: DurabilityMode,
    bogus: bool,
    pub(crate) db: Option<std::sync::Weak<crate::db::DbInner>>,
    pub(crate) inner: Mutex<TxnInner>,
}

impl Transaction {
    pub(crate) fn new(
        id: TxnId,
        lock_mode: LockMode,
        durability: DurabilityMode,
        db: std::sync::Weak<crate::db::DbInner>,
    ) -> Self {
        Self {
            id,
            lock_mode,
            durability,
            bogus: false,
            db: Some(db),
            inner: Mutex::new(TxnInner::default()),
        }
    }

    /// The no-isolation transaction: no locks, no redo, no undo.
    pub fn bogus() -> Self {
        Self {
            id: 0,
            lock_mode: LockMode::Unsafe,
            durability: DurabilityMode::NoRedo,
            bogus: true,
            db: None,
            inner: Mutex::new(TxnInner::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability
    }

    pub fn is_bogus(&self) -> bool {
        self.bogus
    }

    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    /// Registers a lock for release at transaction end.
    pub(crate) fn register_lock(&self, tree_id: u64, key: &[u8], hash: u32) {
        if self.bogus {
            return;
        }
        let mut inner = self.inner.lock();
        if inner
            .held_locks
            .iter()
            .any(|l| l.tree_id == tree_id && l.hash == hash && l.key == key)
        {
            return;
        }
        inner.held_locks.push(HeldLock {
            tree_id,
            key: key.to_vec(),
            hash,
        });
    }

    pub(crate) fn push_uninsert(&self, tree_id: u64, key: &[u8]) {
        if self.bogus {
            return;
        }
        self.inner.lock().undo.push(UndoEntry::Uninsert {
            tree_id,
            key: key.to_vec(),
        });
    }

    pub(crate) fn push_unupdate(&self, tree_id: u64, key: &[u8], value: Vec<u8>) {
        if self.bogus {
            return;
        }
        self.inner.lock().undo.push(UndoEntry::Unupdate {
            tree_id,
            key: key.to_vec(),
            value,
        });
    }

    pub(crate) fn push_undelete(&self, tree_id: u64, key: &[u8], value: Vec<u8>) {
        if self.bogus {
            return;
        }
        self.inner.lock().undo.push(UndoEntry::Undelete {
            tree_id,
            key: key.to_vec(),
            value,
        });
    }

    pub(crate) fn register_ghost(&self, tree_id: u64, key: &[u8], hash: u32) {
        if self.bogus {
            return;
        }
        self.inner.lock().ghosts.push(GhostRef {
            tree_id,
            key: key.to_vec(),
            hash,
        });
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.bogus && self.state() == TxnState::Active {
            // Best-effort rollback; errors are unreportable here.
            let _ = self.rollback();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("lock_mode", &self.lock_mode)
            .field("state", &self.state())
            .field("bogus", &self.bogus)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_mode_flags() {
        assert!(LockMode::ReadUncommitted.no_read_lock());
        assert!(LockMode::Unsafe.no_read_lock());
        assert!(!LockMode::ReadCommitted.no_read_lock());

        assert!(LockMode::RepeatableRead.repeatable());
        assert!(LockMode::Upgradable.repeatable());
        assert!(LockMode::Exclusive.repeatable());
        assert!(!LockMode::ReadCommitted.repeatable());

        assert_eq!(LockMode::Upgradable.read_lock_type(), LockType::Upgradable);
        assert_eq!(LockMode::Exclusive.read_lock_type(), LockType::Exclusive);
        assert_eq!(LockMode::RepeatableRead.read_lock_type(), LockType::Shared);
    }

    #[test]
    fn bogus_records_nothing() {
        let txn = Transaction::bogus();
        assert!(txn.is_bogus());
        txn.register_lock(1, b"k", 0);
        txn.push_uninsert(1, b"k");
        txn.register_ghost(1, b"k", 0);
        let inner = txn.inner.lock();
        assert!(inner.held_locks.is_empty());
        assert!(inner.undo.is_empty());
        assert!(inner.ghosts.is_empty());
    }

    #[test]
    fn lock_registration_dedupes() {
        let txn = Transaction::new(
            5,
            LockMode::RepeatableRead,
            DurabilityMode::Sync,
            std::sync::Weak::new(),
        );
        txn.register_lock(1, b"k", 42);
        txn.register_lock(1, b"k", 42);
        txn.register_lock(1, b"j", 43);
        assert_eq!(txn.inner.lock().held_locks.len(), 2);
        // Keep Drop from attempting a rollback against a dead database.
        txn.inner.lock().state = TxnState::Aborted;
    }
}
