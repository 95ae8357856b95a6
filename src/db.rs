//! # Database Facade
//!
//! Wires the store, node cache, lock manager, redo log, and tree together
//! and owns the lifecycle: open (with redo recovery), checkpoint, and
//! close. The database is a library object; everything is configured
//! programmatically through [`crate::config::DatabaseBuilder`].
//!
//! ## Checkpoint protocol
//!
//! 1. Take the commit lock exclusively: no structural change is in
//!    flight and no node carries an unfinished split.
//! 2. Flip the dirty generation and capture the page image of every node
//!    dirty in the old generation.
//! 3. Persist the free list and record the root id and durable redo
//!    position, then release the commit lock.
//! 4. Write and sync the captured pages outside the lock, then publish
//!    the header — the atomic commit point — and finally recycle the
//!    deferred free pages.
//!
//! Mutators run again as soon as the lock drops; shadow paging re-homes
//! anything they touch, so the captured images stay consistent.
//!
//! ## Fatal failures
//!
//! An unexpected error during a mutation under the commit lock is
//! treated as corrupting: the database closes with the cause recorded
//! and every subsequent operation fails with [`ClosedError`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

use crate::config::{DatabaseBuilder, DatabaseConfig};
use crate::error::ClosedError;
use crate::latch::CommitLock;
use crate::lock::LockManager;
use crate::redo::RedoLog;
use crate::store::{FreeList, NodeCache, PageFile};
use crate::tree::fragment::FragmentStore;
use crate::tree::Tree;
use crate::txn::{DurabilityMode, LockMode, Transaction, TxnState, UndoEntry};

/// Tree id of the single keyspace.
const MAIN_TREE_ID: u64 = 1;

pub(crate) struct DbInner {
    pub(crate) file: Arc<PageFile>,
    pub(crate) freelist: Arc<FreeList>,
    pub(crate) cache: NodeCache,
    pub(crate) frag: FragmentStore,
    pub(crate) locks: LockManager,
    pub(crate) redo: RedoLog,
    pub(crate) commit_lock: CommitLock,
    pub(crate) lock_timeout_nanos: i64,
    durability: DurabilityMode,
    next_txn_id: AtomicU64,
    closed: AtomicBool,
    close_cause: Mutex<Option<String>>,
    tree: OnceLock<Arc<Tree>>,
}

impl DbInner {
    pub(crate) fn next_locker_id(&self) -> u64 {
        self.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClosedError {
                cause: self.close_cause.lock().clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Records a corrupting failure and fails everything from here on.
    pub(crate) fn close_on_failure(&self, cause: &eyre::Report) {
        let mut recorded = self.close_cause.lock();
        if recorded.is_none() {
            *recorded = Some(cause.to_string());
        }
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn tree(&self) -> &Arc<Tree> {
        self.tree.get().expect("tree initialized at open")
    }
}

pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    pub fn open_with(config: DatabaseConfig) -> Result<Arc<Database>> {
        let redo_path = {
            let mut p = config.path.as_os_str().to_owned();
            p.push(".redo");
            std::path::PathBuf::from(p)
        };

        let fresh = !config.path.exists();
        let (file, header) = if fresh {
            let file = PageFile::create(&config.path, config.page_size)?;
            let header = file.read_header()?;
            (file, header)
        } else {
            let (file, header) = PageFile::open(&config.path)?;
            ensure!(
                header.page_size() as usize == config.page_size,
                "page size {} does not match the existing database ({})",
                config.page_size,
                header.page_size()
            );
            (file, header)
        };

        let file = Arc::new(file);
        let next_id = header.page_count().max(1);
        let freelist = Arc::new(if fresh {
            FreeList::new(1)
        } else {
            FreeList::load(&file, header.freelist_head(), next_id)?
        });

        let cache = NodeCache::new(
            config.cache_size,
            config.page_size,
            Arc::clone(&file),
            Arc::clone(&freelist),
            header.commit_state(),
        )?;
        let frag = FragmentStore::new(Arc::clone(&file), Arc::clone(&freelist));
        let redo = RedoLog::open(&redo_path, config.durability, config.replication.clone())?;

        let inner = Arc::new(DbInner {
            file,
            freelist,
            cache,
            frag,
            locks: LockManager::new(),
            redo,
            commit_lock: CommitLock::new(),
            lock_timeout_nanos: config.lock_timeout.as_nanos() as i64,
            durability: config.durability,
            next_txn_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            close_cause: Mutex::new(None),
            tree: OnceLock::new(),
        });

        let tree = if fresh || header.root_id() == 0 {
            Tree::create(Arc::clone(&inner), MAIN_TREE_ID)?
        } else {
            Tree::open(Arc::clone(&inner), MAIN_TREE_ID, header.root_id())?
        };
        inner
            .tree
            .set(Arc::clone(&tree))
            .map_err(|_| eyre::eyre!("tree already initialized"))?;

        let db = Arc::new(Database { inner });

        // Replay redo records appended after the last checkpoint, then
        // checkpoint so the replayed state is durable in the pages too.
        let replayed = db.recover(&redo_path, header.redo_position())?;
        if fresh || replayed {
            db.checkpoint()?;
        }

        Ok(db)
    }

    fn recover(&self, redo_path: &std::path::Path, from: u64) -> Result<bool> {
        let tree = Arc::clone(self.inner.tree());
        let mut replayed = false;
        RedoLog::recover(redo_path, from, |op| {
            ensure!(
                op.tree_id == MAIN_TREE_ID,
                "redo record for unknown tree {}",
                op.tree_id
            );
            let bogus = Arc::new(Transaction::bogus());
            let mut cursor = tree.cursor(Some(bogus));
            cursor.find_and_store(&op.key, op.value.as_deref())?;
            replayed = true;
            Ok(())
        })
        .wrap_err("redo recovery failed")?;
        Ok(replayed)
    }

    /// The single ordered keyspace.
    pub fn tree(&self) -> Arc<Tree> {
        Arc::clone(self.inner.tree())
    }

    pub fn begin(&self) -> Result<Arc<Transaction>> {
        self.begin_with(LockMode::RepeatableRead, self.inner.durability)
    }

    pub fn begin_with(
        &self,
        lock_mode: LockMode,
        durability: DurabilityMode,
    ) -> Result<Arc<Transaction>> {
        self.inner.check_closed()?;
        let id = self.inner.next_locker_id();
        Ok(Arc::new(Transaction::new(
            id,
            lock_mode,
            durability,
            Arc::downgrade(&self.inner),
        )))
    }

    /// The no-isolation transaction value.
    pub fn bogus_transaction(&self) -> Arc<Transaction> {
        Arc::new(Transaction::bogus())
    }

    /// Takes the commit lock exclusively, snapshots the dirty pages, and
    /// publishes a consistent on-disk image.
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.check_closed()?;
        let inner = &self.inner;

        inner.commit_lock.acquire_exclusive();
        let generation = inner.cache.flip_generation();
        let dirty = inner.cache.collect_dirty(generation);
        let root_id = inner.tree().root().id();
        let redo_position = inner.redo.durable_position();
        let freelist_head = match inner.freelist.persist(&inner.file) {
            Ok(head) => head,
            Err(e) => {
                inner.commit_lock.release_exclusive();
                return Err(e);
            }
        };
        let page_count = inner.freelist.end_of_region();
        inner.commit_lock.release_exclusive();

        for (_, id, buf) in &dirty {
            inner.file.write_page(*id, buf)?;
        }
        inner.file.sync()?;

        let mut header = inner.file.read_header()?;
        header.set_root_id(root_id);
        header.set_page_count(page_count);
        header.set_freelist_head(freelist_head);
        header.set_redo_position(redo_position);
        header.set_commit_state(generation ^ 1);
        inner.file.publish_header(&header)?;

        inner.cache.finish_flush(generation, &dirty);
        inner.freelist.checkpoint_completed();
        Ok(())
    }

    /// Checkpoints and closes. Subsequent operations fail.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.checkpoint()?;
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("closed", &self.is_closed())
            .finish()
    }
}

// Transaction completion needs the tree and lock manager, so it lives
// here rather than in the txn module.
impl Transaction {
    fn db(&self) -> Result<Arc<DbInner>> {
        self.db
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| ClosedError { cause: None }.into())
    }

    /// Commits: ghosts left by transactional deletes are physically
    /// removed, the commit record is appended, locks are released, and
    /// durability is awaited per the transaction's mode.
    pub fn commit(&self) -> Result<()> {
        if self.is_bogus() {
            return Ok(());
        }
        let db = self.db()?;
        db.check_closed()?;

        let (ghosts, held) = {
            let mut inner = self.inner.lock();
            ensure!(
                inner.state == TxnState::Active,
                "transaction is not active"
            );
            inner.undo.clear();
            (
                std::mem::take(&mut inner.ghosts),
                std::mem::take(&mut inner.held_locks),
            )
        };

        // The commit record must be durable before ghosts are physically
        // removed; a crash in between replays the transaction's deletes.
        let position = db.redo.txn_commit(self.id())?;
        if self.durability_mode() == DurabilityMode::Sync {
            db.redo.commit_sync(position)?;
        }

        let tree = Arc::clone(db.tree());
        for ghost in &ghosts {
            let mut cursor = tree.cursor(None);
            cursor.delete_ghost(&ghost.key)?;
        }

        for lock in &held {
            db.locks.unlock(self.id(), lock.tree_id, &lock.key, lock.hash);
        }
        self.inner.lock().state = TxnState::Committed;
        Ok(())
    }

    /// Rolls back: the undo log is applied in reverse through lock-free
    /// stores, then locks are released.
    pub fn rollback(&self) -> Result<()> {
        if self.is_bogus() {
            return Ok(());
        }
        let db = self.db()?;

        let (undo, held) = {
            let mut inner = self.inner.lock();
            if inner.state != TxnState::Active {
                return Ok(());
            }
            inner.ghosts.clear();
            (
                std::mem::take(&mut inner.undo),
                std::mem::take(&mut inner.held_locks),
            )
        };

        if db.check_closed().is_ok() {
            let tree = Arc::clone(db.tree());
            for entry in undo.iter().rev() {
                let bogus = Arc::new(Transaction::bogus());
                let mut cursor = tree.cursor(Some(bogus));
                match entry {
                    UndoEntry::Uninsert { key, .. } => {
                        cursor.find_and_store(key, None)?;
                    }
                    UndoEntry::Unupdate { key, value, .. }
                    | UndoEntry::Undelete { key, value, .. } => {
                        cursor.find_and_store(key, Some(value))?;
                    }
                }
            }
            db.redo.txn_rollback(self.id())?;
        }

        for lock in &held {
            db.locks.unlock(self.id(), lock.tree_id, &lock.key, lock.hash);
        }
        self.inner.lock().state = TxnState::Aborted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> Arc<Database> {
        Database::builder()
            .path(dir.join("db.burrow"))
            .page_size(256)
            .cache_size(64)
            .durability(DurabilityMode::Sync)
            .open()
            .unwrap()
    }

    #[test]
    fn store_and_reload_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = open(dir.path());
            let tree = db.tree();
            let mut cursor = tree.cursor(None);
            cursor.find_and_store(b"alpha", Some(b"1")).unwrap();
            cursor.find_and_store(b"bravo", Some(b"2")).unwrap();
            db.close().unwrap();
        }
        {
            let db = open(dir.path());
            let tree = db.tree();
            let mut cursor = tree.cursor(None);
            cursor.find(b"alpha").unwrap();
            assert_eq!(cursor.value(), Some(b"1" as &[u8]));
            cursor.find(b"bravo").unwrap();
            assert_eq!(cursor.value(), Some(b"2" as &[u8]));
        }
    }

    #[test]
    fn redo_replay_recovers_unflushed_stores() {
        let dir = tempdir().unwrap();
        {
            let db = open(dir.path());
            let tree = db.tree();
            let mut cursor = tree.cursor(None);
            cursor.find_and_store(b"k", Some(b"v")).unwrap();
            // No close, no checkpoint: only the redo log has the store.
        }
        {
            let db = open(dir.path());
            let tree = db.tree();
            let mut cursor = tree.cursor(None);
            cursor.find(b"k").unwrap();
            assert_eq!(cursor.value(), Some(b"v" as &[u8]));
        }
    }

    #[test]
    fn transaction_commit_and_rollback() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let tree = db.tree();

        let txn = db.begin().unwrap();
        {
            let mut cursor = tree.cursor(Some(Arc::clone(&txn)));
            cursor.find_and_store(b"a", Some(b"1")).unwrap();
        }
        txn.commit().unwrap();

        let txn = db.begin().unwrap();
        {
            let mut cursor = tree.cursor(Some(Arc::clone(&txn)));
            cursor.find_and_store(b"a", Some(b"2")).unwrap();
            cursor.find_and_store(b"b", Some(b"3")).unwrap();
        }
        txn.rollback().unwrap();

        let mut cursor = tree.cursor(None);
        cursor.find(b"a").unwrap();
        assert_eq!(cursor.value(), Some(b"1" as &[u8]));
        cursor.find(b"b").unwrap();
        assert_eq!(cursor.value(), None);
    }

    #[test]
    fn transactional_delete_leaves_ghost_until_commit() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let tree = db.tree();

        let mut cursor = tree.cursor(None);
        cursor.find_and_store(b"k", Some(b"v")).unwrap();

        let txn = db.begin().unwrap();
        {
            let mut c = tree.cursor(Some(Arc::clone(&txn)));
            c.find_and_store(b"k", None).unwrap();
        }

        // An uncommitted-read cursor sees the ghost as absent.
        let mut dirty_reader = tree.cursor(None);
        dirty_reader.link(Some(Arc::new(Transaction::bogus())));
        dirty_reader.find(b"k").unwrap();
        assert_eq!(dirty_reader.value(), None);

        txn.commit().unwrap();

        // After commit the entry is physically gone.
        let mut c = tree.cursor(None);
        c.find(b"k").unwrap();
        assert_eq!(c.value(), None);
        c.first().unwrap();
        assert!(c.key().is_none());
    }

    #[test]
    fn closed_database_rejects_operations() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        db.close().unwrap();
        let tree = db.tree();
        let mut cursor = tree.cursor(None);
        let err = cursor.find_and_store(b"x", Some(b"y")).unwrap_err();
        assert!(err.downcast_ref::<ClosedError>().is_some());
    }
}
