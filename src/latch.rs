//! # Node Latches and the Commit Lock
//!
//! Every tree node carries a short-duration latch supporting shared and
//! exclusive modes, try-variants of both, an atomic shared-to-exclusive
//! upgrade, and an exclusive-to-shared downgrade. The cursor machinery
//! couples these latches parent-to-child during descents and releases them
//! in well-defined orders during splits and merges, so the latch must
//! expose explicit acquire/release methods rather than RAII guards: a latch
//! acquired in one stack frame is routinely released in another.
//!
//! ## Why not parking_lot::RwLock directly?
//!
//! `parking_lot::RwLock` cannot upgrade a plain read lock to a write lock,
//! and its guards tie release to lexical scope. The latch here is a small
//! counting state machine behind a `parking_lot::Mutex` plus a `Condvar`:
//!
//! ```text
//! LatchState {
//!     shared: u32,       // number of shared holders
//!     exclusive: bool,   // one exclusive holder
//! }
//! ```
//!
//! `try_upgrade` succeeds only when the caller is the sole shared holder,
//! failing (never blocking) otherwise — the cursor protocol releases and
//! re-acquires on upgrade failure, re-validating whatever it saw.
//!
//! ## Commit lock
//!
//! The tree-wide commit lock is a readers-writer lock separating structural
//! mutations (shared) from checkpoint snapshots (exclusive). It reuses the
//! same state machine with writer preference so a checkpoint cannot be
//! starved by a stream of mutators.
//!
//! ## Fairness
//!
//! Waiting exclusive acquirers block new shared admissions once recorded in
//! `exclusive_waiters`, which is enough to avoid writer starvation for
//! short-duration latches. Latch acquisition is not cancelable.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LatchState {
    shared: u32,
    exclusive: bool,
    exclusive_waiters: u32,
}

/// Short-duration intra-node mutex with shared/exclusive modes, upgrade,
/// and try-variants. Release methods must pair with the acquire mode held.
#[derive(Debug, Default)]
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_shared(&self) {
        let mut state = self.state.lock();
        while state.exclusive || state.exclusive_waiters > 0 {
            self.cond.wait(&mut state);
        }
        state.shared += 1;
    }

    pub fn try_acquire_shared(&self) -> bool {
        let mut state = self.state.lock();
        if state.exclusive || state.exclusive_waiters > 0 {
            return false;
        }
        state.shared += 1;
        true
    }

    pub fn acquire_exclusive(&self) {
        let mut state = self.state.lock();
        state.exclusive_waiters += 1;
        while state.exclusive || state.shared > 0 {
            self.cond.wait(&mut state);
        }
        state.exclusive_waiters -= 1;
        state.exclusive = true;
    }

    pub fn try_acquire_exclusive(&self) -> bool {
        let mut state = self.state.lock();
        if state.exclusive || state.shared > 0 {
            return false;
        }
        state.exclusive = true;
        true
    }

    /// Attempts to convert a held shared latch into the exclusive latch.
    /// Fails without blocking if any other holder exists. On success the
    /// caller owns the exclusive latch and no longer holds a shared one.
    pub fn try_upgrade(&self) -> bool {
        let mut state = self.state.lock();
        debug_assert!(state.shared > 0, "try_upgrade without shared latch");
        if state.exclusive || state.shared != 1 {
            return false;
        }
        state.shared = 0;
        state.exclusive = true;
        true
    }

    /// Converts a held exclusive latch into a shared latch without letting
    /// another exclusive acquirer in between.
    pub fn downgrade(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.exclusive, "downgrade without exclusive latch");
        state.exclusive = false;
        state.shared = 1;
        drop(state);
        self.cond.notify_all();
    }

    pub fn release_shared(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.shared > 0, "release_shared without shared latch");
        state.shared -= 1;
        let wake = state.shared == 0;
        drop(state);
        if wake {
            self.cond.notify_all();
        }
    }

    pub fn release_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.exclusive, "release_exclusive without exclusive latch");
        state.exclusive = false;
        drop(state);
        self.cond.notify_all();
    }

    /// True if any holder is present, in either mode. Diagnostic only.
    pub fn is_held(&self) -> bool {
        let state = self.state.lock();
        state.exclusive || state.shared > 0
    }

    pub fn is_held_exclusive(&self) -> bool {
        self.state.lock().exclusive
    }
}

/// Tree-wide readers-writer lock separating structural mutations (shared)
/// from checkpoint snapshots (exclusive).
#[derive(Debug, Default)]
pub struct CommitLock {
    inner: Latch,
}

impl CommitLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_shared(&self) {
        self.inner.acquire_shared();
    }

    pub fn try_acquire_shared(&self) -> bool {
        self.inner.try_acquire_shared()
    }

    pub fn release_shared(&self) {
        self.inner.release_shared();
    }

    pub fn acquire_exclusive(&self) {
        self.inner.acquire_exclusive();
    }

    pub fn release_exclusive(&self) {
        self.inner.release_exclusive();
    }

    /// Runs `f` with the commit lock held in shared mode.
    pub fn with_shared<T>(&self, f: impl FnOnce() -> T) -> T {
        self.acquire_shared();
        let out = f();
        self.release_shared();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn shared_latches_coexist() {
        let latch = Latch::new();
        latch.acquire_shared();
        latch.acquire_shared();
        assert!(!latch.try_acquire_exclusive());
        latch.release_shared();
        latch.release_shared();
        assert!(latch.try_acquire_exclusive());
        latch.release_exclusive();
    }

    #[test]
    fn upgrade_fails_with_other_readers() {
        let latch = Latch::new();
        latch.acquire_shared();
        latch.acquire_shared();
        assert!(!latch.try_upgrade());
        latch.release_shared();
        assert!(latch.try_upgrade());
        latch.release_exclusive();
        assert!(!latch.is_held());
    }

    #[test]
    fn downgrade_keeps_readers_out_of_exclusive() {
        let latch = Latch::new();
        latch.acquire_exclusive();
        latch.downgrade();
        assert!(latch.try_acquire_shared());
        assert!(!latch.try_acquire_exclusive());
        latch.release_shared();
        latch.release_shared();
    }

    #[test]
    fn exclusive_waiter_blocks_new_readers() {
        let latch = Arc::new(Latch::new());
        latch.acquire_shared();

        let writer = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                latch.acquire_exclusive();
                latch.release_exclusive();
            })
        };

        // Give the writer a chance to register as a waiter.
        thread::sleep(Duration::from_millis(50));
        assert!(!latch.try_acquire_shared());

        latch.release_shared();
        writer.join().unwrap();
        assert!(latch.try_acquire_shared());
        latch.release_shared();
    }

    #[test]
    fn commit_lock_round_trip() {
        let lock = CommitLock::new();
        assert!(lock.try_acquire_shared());
        lock.release_shared();
        lock.acquire_exclusive();
        assert!(!lock.try_acquire_shared());
        lock.release_exclusive();
        let n = lock.with_shared(|| 41 + 1);
        assert_eq!(n, 42);
    }
}
