//! # Key-Level Lock Manager
//!
//! Logical isolation between transactions comes from locks keyed by
//! `(tree_id, key)`. The manager is sharded so lock acquisition for
//! unrelated keys never contends, and per-key entries are created on
//! demand and removed when the last holder and waiter leave.
//!
//! ## Modes and compatibility
//!
//! ```text
//!              held: Shared   Upgradable   Exclusive
//! want Shared        yes      yes          no
//! want Upgradable    yes      no           no
//! want Exclusive     no       no           no
//! ```
//!
//! An upgradable holder escalates to exclusive once every shared holder
//! drains; `unlock_to_upgradable` descends again without losing the slot.
//! Requesting an upgrade while holding a plain shared lock is refused —
//! that path deadlocks two upgraders against each other by construction.
//!
//! ## Timeouts and deadlocks
//!
//! Timeouts are nanoseconds; `-1` waits forever, `0` is a try-path that
//! never touches the waits-for graph and reports plain unavailability.
//! Blocking waiters record edges to the current holders; a cycle found
//! before parking is surfaced as [`DeadlockError`].

use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::error::{DeadlockError, LockTimeoutError};

const LOCK_SHARD_COUNT: usize = 64;

pub type TxnId = u64;

/// Requested lock strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Upgradable,
    Exclusive,
}

/// Outcome of a lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// No lock is held (no-lock modes, or the operation gave up).
    Unowned,
    /// The lock was newly acquired by this call.
    Acquired,
    OwnedShared,
    OwnedUpgradable,
    OwnedExclusive,
}

impl LockResult {
    pub fn is_held(self) -> bool {
        !matches!(self, LockResult::Unowned)
    }

    /// True when this call created the ownership, so the symmetric unlock
    /// belongs to the caller.
    pub fn is_acquired(self) -> bool {
        matches!(self, LockResult::Acquired)
    }
}

/// Hash of `(tree_id, key)`, precomputed by cursors and passed through the
/// manager so the key bytes are hashed once per operation.
pub fn key_hash(tree_id: u64, key: &[u8]) -> u32 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64 ^ tree_id.rotate_left(17);
    for &b in key {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
    (hash ^ (hash >> 32)) as u32
}

#[derive(Default)]
struct LockEntryState {
    shared: SmallVec<[TxnId; 4]>,
    upgradable: Option<TxnId>,
    exclusive: Option<TxnId>,
    waiters: u32,
}

impl LockEntryState {
    fn is_free(&self) -> bool {
        self.shared.is_empty()
            && self.upgradable.is_none()
            && self.exclusive.is_none()
            && self.waiters == 0
    }

    fn owners(&self) -> SmallVec<[TxnId; 4]> {
        let mut owners = self.shared.clone();
        if let Some(t) = self.upgradable {
            owners.push(t);
        }
        if let Some(t) = self.exclusive {
            owners.push(t);
        }
        owners
    }

    fn grantable(&self, txn: TxnId, lock_type: LockType) -> bool {
        match lock_type {
            LockType::Shared => self.exclusive.is_none(),
            LockType::Upgradable => {
                self.exclusive.is_none() && self.upgradable.is_none()
            }
            LockType::Exclusive => {
                let upgrading = self.upgradable == Some(txn);
                self.exclusive.is_none()
                    && (upgrading || self.upgradable.is_none())
                    && self.shared.is_empty()
            }
        }
    }
}

struct LockEntry {
    state: Mutex<LockEntryState>,
    cond: Condvar,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(LockEntryState::default()),
            cond: Condvar::new(),
        }
    }
}

type LockKey = (u64, Vec<u8>);

struct LockShard {
    locks: Mutex<HashMap<LockKey, Arc<LockEntry>>>,
}

/// Sharded key lock table with a global waits-for graph for deadlock
/// detection.
pub struct LockManager {
    shards: Vec<LockShard>,
    waits_for: Mutex<HashMap<TxnId, SmallVec<[TxnId; 4]>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            shards: (0..LOCK_SHARD_COUNT)
                .map(|_| LockShard {
                    locks: Mutex::new(HashMap::new()),
                })
                .collect(),
            waits_for: Mutex::new(HashMap::new()),
        }
    }

    fn shard(&self, hash: u32) -> &LockShard {
        &self.shards[hash as usize % LOCK_SHARD_COUNT]
    }

    fn entry(&self, tree_id: u64, key: &[u8], hash: u32) -> Arc<LockEntry> {
        let mut map = self.shard(hash).locks.lock();
        if let Some(entry) = map.get(&(tree_id, key.to_vec())) {
            return Arc::clone(entry);
        }
        let entry = Arc::new(LockEntry::new());
        map.insert((tree_id, key.to_vec()), Arc::clone(&entry));
        entry
    }

    fn cleanup(&self, tree_id: u64, key: &[u8], hash: u32, entry: &Arc<LockEntry>) {
        let mut map = self.shard(hash).locks.lock();
        if entry.state.lock().is_free() {
            map.remove(&(tree_id, key.to_vec()));
        }
    }

    /// Lock availability peek: would a shared request be granted right
    /// now without any acquisition?
    pub fn is_lock_available(&self, txn: TxnId, tree_id: u64, key: &[u8], hash: u32) -> bool {
        let map = self.shard(hash).locks.lock();
        match map.get(&(tree_id, key.to_vec())) {
            None => true,
            Some(entry) => {
                let state = entry.state.lock();
                state.grantable(txn, LockType::Shared)
                    || state.shared.contains(&txn)
                    || state.upgradable == Some(txn)
                    || state.exclusive == Some(txn)
            }
        }
    }

    /// Reports the strength of the lock `txn` already holds, if any.
    pub fn check_owned(&self, txn: TxnId, tree_id: u64, key: &[u8], hash: u32) -> LockResult {
        let map = self.shard(hash).locks.lock();
        match map.get(&(tree_id, key.to_vec())) {
            None => LockResult::Unowned,
            Some(entry) => {
                let state = entry.state.lock();
                if state.exclusive == Some(txn) {
                    LockResult::OwnedExclusive
                } else if state.upgradable == Some(txn) {
                    LockResult::OwnedUpgradable
                } else if state.shared.contains(&txn) {
                    LockResult::OwnedShared
                } else {
                    LockResult::Unowned
                }
            }
        }
    }

    fn already_owned(state: &LockEntryState, txn: TxnId, lock_type: LockType) -> Result<Option<LockResult>> {
        if state.exclusive == Some(txn) {
            return Ok(Some(LockResult::OwnedExclusive));
        }
        match lock_type {
            LockType::Shared => {
                if state.upgradable == Some(txn) {
                    return Ok(Some(LockResult::OwnedUpgradable));
                }
                if state.shared.contains(&txn) {
                    return Ok(Some(LockResult::OwnedShared));
                }
            }
            LockType::Upgradable => {
                if state.upgradable == Some(txn) {
                    return Ok(Some(LockResult::OwnedUpgradable));
                }
                if state.shared.contains(&txn) {
                    bail!("illegal upgrade from a shared lock");
                }
            }
            LockType::Exclusive => {
                if state.shared.contains(&txn) {
                    bail!("illegal upgrade from a shared lock");
                }
            }
        }
        Ok(None)
    }

    fn grant(state: &mut LockEntryState, txn: TxnId, lock_type: LockType) {
        match lock_type {
            LockType::Shared => state.shared.push(txn),
            LockType::Upgradable => state.upgradable = Some(txn),
            LockType::Exclusive => state.exclusive = Some(txn),
        }
    }

    /// Zero-timeout acquisition. `None` means unavailable; deadlock is
    /// never reported from a try-path.
    pub fn try_lock(
        &self,
        txn: TxnId,
        lock_type: LockType,
        tree_id: u64,
        key: &[u8],
        hash: u32,
    ) -> Result<Option<LockResult>> {
        let entry = self.entry(tree_id, key, hash);
        let result = {
            let mut state = entry.state.lock();
            match Self::already_owned(&state, txn, lock_type) {
                Ok(Some(owned)) => Ok(Some(owned)),
                Ok(None) => {
                    if state.grantable(txn, lock_type) {
                        Self::grant(&mut state, txn, lock_type);
                        Ok(Some(LockResult::Acquired))
                    } else {
                        Ok(None)
                    }
                }
                Err(e) => Err(e),
            }
        };
        if !matches!(result, Ok(Some(_))) {
            self.cleanup(tree_id, key, hash, &entry);
        }
        result
    }

    /// Blocking acquisition. `timeout_nanos` of -1 waits forever.
    pub fn lock(
        &self,
        txn: TxnId,
        lock_type: LockType,
        tree_id: u64,
        key: &[u8],
        hash: u32,
        timeout_nanos: i64,
    ) -> Result<LockResult> {
        if timeout_nanos == 0 {
            return match self.try_lock(txn, lock_type, tree_id, key, hash)? {
                Some(result) => Ok(result),
                None => Err(LockTimeoutError {
                    tree_id,
                    timeout: Duration::ZERO,
                }
                .into()),
            };
        }

        let entry = self.entry(tree_id, key, hash);
        let deadline = if timeout_nanos < 0 {
            None
        } else {
            Some(std::time::Instant::now() + Duration::from_nanos(timeout_nanos as u64))
        };

        let mut state = entry.state.lock();
        match Self::already_owned(&state, txn, lock_type) {
            Ok(Some(owned)) => return Ok(owned),
            Ok(None) => {}
            Err(e) => {
                drop(state);
                self.cleanup(tree_id, key, hash, &entry);
                return Err(e);
            }
        }
        if state.grantable(txn, lock_type) {
            Self::grant(&mut state, txn, lock_type);
            return Ok(LockResult::Acquired);
        }

        // About to block: publish the waits-for edges and scan for cycles.
        let owners = state.owners();
        if self.would_deadlock(txn, &owners) {
            drop(state);
            self.cleanup(tree_id, key, hash, &entry);
            return Err(DeadlockError { tree_id }.into());
        }
        self.waits_for.lock().insert(txn, owners);
        state.waiters += 1;

        let outcome = loop {
            let timed_out = match deadline {
                None => {
                    entry.cond.wait(&mut state);
                    false
                }
                Some(deadline) => entry.cond.wait_until(&mut state, deadline).timed_out(),
            };
            if state.grantable(txn, lock_type) {
                Self::grant(&mut state, txn, lock_type);
                break Ok(LockResult::Acquired);
            }
            if timed_out {
                break Err(LockTimeoutError {
                    tree_id,
                    timeout: Duration::from_nanos(timeout_nanos.max(0) as u64),
                }
                .into());
            }
            // Re-publish edges against the current holders.
            let owners = state.owners();
            self.waits_for.lock().insert(txn, owners);
        };

        state.waiters -= 1;
        drop(state);
        self.waits_for.lock().remove(&txn);
        self.cleanup(tree_id, key, hash, &entry);
        outcome
    }

    /// DFS over the waits-for graph: would `txn` waiting on `owners`
    /// close a cycle?
    fn would_deadlock(&self, txn: TxnId, owners: &[TxnId]) -> bool {
        let graph = self.waits_for.lock();
        let mut stack: Vec<TxnId> = owners.to_vec();
        let mut seen: SmallVec<[TxnId; 16]> = SmallVec::new();
        while let Some(current) = stack.pop() {
            if current == txn {
                return true;
            }
            if seen.contains(&current) {
                continue;
            }
            seen.push(current);
            if let Some(next) = graph.get(&current) {
                stack.extend_from_slice(next);
            }
        }
        false
    }

    /// Releases whatever `txn` holds on the key.
    pub fn unlock(&self, txn: TxnId, tree_id: u64, key: &[u8], hash: u32) {
        let entry = {
            let map = self.shard(hash).locks.lock();
            match map.get(&(tree_id, key.to_vec())) {
                Some(entry) => Arc::clone(entry),
                None => return,
            }
        };
        {
            let mut state = entry.state.lock();
            state.shared.retain(|t| *t != txn);
            if state.upgradable == Some(txn) {
                state.upgradable = None;
            }
            if state.exclusive == Some(txn) {
                state.exclusive = None;
            }
        }
        entry.cond.notify_all();
        self.cleanup(tree_id, key, hash, &entry);
    }

    /// Downgrades an exclusive lock back to upgradable.
    pub fn unlock_to_upgradable(&self, txn: TxnId, tree_id: u64, key: &[u8], hash: u32) {
        let entry = {
            let map = self.shard(hash).locks.lock();
            match map.get(&(tree_id, key.to_vec())) {
                Some(entry) => Arc::clone(entry),
                None => return,
            }
        };
        {
            let mut state = entry.state.lock();
            if state.exclusive == Some(txn) {
                state.exclusive = None;
                state.upgradable = Some(txn);
            }
        }
        entry.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const TREE: u64 = 1;

    fn h(key: &[u8]) -> u32 {
        key_hash(TREE, key)
    }

    #[test]
    fn shared_locks_coexist() {
        let mgr = LockManager::new();
        assert_eq!(
            mgr.try_lock(1, LockType::Shared, TREE, b"k", h(b"k")).unwrap(),
            Some(LockResult::Acquired)
        );
        assert_eq!(
            mgr.try_lock(2, LockType::Shared, TREE, b"k", h(b"k")).unwrap(),
            Some(LockResult::Acquired)
        );
        assert!(mgr
            .try_lock(3, LockType::Exclusive, TREE, b"k", h(b"k"))
            .unwrap()
            .is_none());
        mgr.unlock(1, TREE, b"k", h(b"k"));
        mgr.unlock(2, TREE, b"k", h(b"k"));
        assert_eq!(
            mgr.try_lock(3, LockType::Exclusive, TREE, b"k", h(b"k")).unwrap(),
            Some(LockResult::Acquired)
        );
        mgr.unlock(3, TREE, b"k", h(b"k"));
    }

    #[test]
    fn reentrant_ownership_reported() {
        let mgr = LockManager::new();
        mgr.lock(7, LockType::Exclusive, TREE, b"k", h(b"k"), -1).unwrap();
        assert_eq!(
            mgr.lock(7, LockType::Shared, TREE, b"k", h(b"k"), -1).unwrap(),
            LockResult::OwnedExclusive
        );
        assert_eq!(
            mgr.check_owned(7, TREE, b"k", h(b"k")),
            LockResult::OwnedExclusive
        );
        mgr.unlock(7, TREE, b"k", h(b"k"));
        assert_eq!(mgr.check_owned(7, TREE, b"k", h(b"k")), LockResult::Unowned);
    }

    #[test]
    fn upgradable_escalates_and_downgrades() {
        let mgr = LockManager::new();
        mgr.lock(1, LockType::Upgradable, TREE, b"k", h(b"k"), -1).unwrap();
        // Another upgradable is refused, shared is fine.
        assert!(mgr
            .try_lock(2, LockType::Upgradable, TREE, b"k", h(b"k"))
            .unwrap()
            .is_none());
        assert_eq!(
            mgr.try_lock(2, LockType::Shared, TREE, b"k", h(b"k")).unwrap(),
            Some(LockResult::Acquired)
        );
        // Escalation waits for the shared holder.
        assert!(mgr
            .try_lock(1, LockType::Exclusive, TREE, b"k", h(b"k"))
            .unwrap()
            .is_none());
        mgr.unlock(2, TREE, b"k", h(b"k"));
        assert_eq!(
            mgr.lock(1, LockType::Exclusive, TREE, b"k", h(b"k"), -1).unwrap(),
            LockResult::Acquired
        );
        mgr.unlock_to_upgradable(1, TREE, b"k", h(b"k"));
        assert_eq!(
            mgr.check_owned(1, TREE, b"k", h(b"k")),
            LockResult::OwnedUpgradable
        );
        mgr.unlock(1, TREE, b"k", h(b"k"));
    }

    #[test]
    fn illegal_upgrade_is_refused() {
        let mgr = LockManager::new();
        mgr.lock(1, LockType::Shared, TREE, b"k", h(b"k"), -1).unwrap();
        assert!(mgr.lock(1, LockType::Exclusive, TREE, b"k", h(b"k"), -1).is_err());
        mgr.unlock(1, TREE, b"k", h(b"k"));
    }

    #[test]
    fn timeout_surfaces_lock_timeout_error() {
        let mgr = LockManager::new();
        mgr.lock(1, LockType::Exclusive, TREE, b"k", h(b"k"), -1).unwrap();
        let err = mgr
            .lock(2, LockType::Exclusive, TREE, b"k", h(b"k"), 20_000_000)
            .unwrap_err();
        assert!(err.downcast_ref::<crate::error::LockTimeoutError>().is_some());
        mgr.unlock(1, TREE, b"k", h(b"k"));
    }

    #[test]
    fn deadlock_detected_between_two_lockers() {
        let mgr = Arc::new(LockManager::new());
        mgr.lock(1, LockType::Exclusive, TREE, b"a", h(b"a"), -1).unwrap();
        mgr.lock(2, LockType::Exclusive, TREE, b"b", h(b"b"), -1).unwrap();

        let mgr2 = Arc::clone(&mgr);
        let blocked = thread::spawn(move || {
            // Blocks until txn 1 releases "a".
            mgr2.lock(2, LockType::Exclusive, TREE, b"a", h(b"a"), -1)
        });
        thread::sleep(Duration::from_millis(50));

        // txn 1 waiting on "b" (held by txn 2, which waits on txn 1).
        let err = mgr
            .lock(1, LockType::Exclusive, TREE, b"b", h(b"b"), -1)
            .unwrap_err();
        assert!(err.downcast_ref::<crate::error::DeadlockError>().is_some());

        mgr.unlock(1, TREE, b"a", h(b"a"));
        blocked.join().unwrap().unwrap();
        mgr.unlock(2, TREE, b"a", h(b"a"));
        mgr.unlock(2, TREE, b"b", h(b"b"));
    }

    #[test]
    fn availability_peek_does_not_acquire() {
        let mgr = LockManager::new();
        assert!(mgr.is_lock_available(1, TREE, b"k", h(b"k")));
        mgr.lock(2, LockType::Exclusive, TREE, b"k", h(b"k"), -1).unwrap();
        assert!(!mgr.is_lock_available(1, TREE, b"k", h(b"k")));
        // The owner itself always sees the lock as available.
        assert!(mgr.is_lock_available(2, TREE, b"k", h(b"k")));
        mgr.unlock(2, TREE, b"k", h(b"k"));
    }

    #[test]
    fn entries_are_cleaned_up_when_free() {
        let mgr = LockManager::new();
        mgr.lock(1, LockType::Exclusive, TREE, b"k", h(b"k"), -1).unwrap();
        mgr.unlock(1, TREE, b"k", h(b"k"));
        let shard = mgr.shard(h(b"k"));
        assert!(shard.locks.lock().is_empty());
    }
}
