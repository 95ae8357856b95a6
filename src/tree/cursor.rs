//! # Cursors
//!
//! A cursor is the primary engine of the tree: it owns a stack of frames
//! from the root to a leaf position and drives every read, write, scan,
//! and maintenance operation through fine-grained latch coupling.
//!
//! ## Positioning
//!
//! A positioned cursor holds a key and a leaf frame. The frame's position
//! is non-negative for an existing entry or the complement of the
//! insertion point for a missed key, in which case the not-found key is
//! retained so concurrent inserts at the same slot can be classified.
//! Between operations the cursor holds no latches at all; frames are kept
//! correct by the structural-change fixups in the write paths.
//!
//! ## Reads and isolation
//!
//! `try_copy_current` runs under the shared leaf latch and consults the
//! lock manager per the transaction's mode: no-lock modes copy outright,
//! read-committed peeks availability, repeatable modes try-acquire with
//! zero timeout. When the lock is not immediately available the latch is
//! dropped and `lock_and_copy_if_exists` acquires the lock without it,
//! re-latches, and copies only if the entry still exists — releasing a
//! freshly acquired lock when the entry vanished, so iteration never
//! leaks locks.
//!
//! Ghosts (null value, key lock held by an uncommitted transaction) read
//! as absent and are skipped by iteration, but the lock attempt still
//! happens.
//!
//! ## Writes
//!
//! `store` runs with the exclusive key lock already held: take the shared
//! commit lock (with the release-and-relatch dance if contended), dirty
//! the leaf and its path via the tree, emit redo, mutate the page, fix
//! every bound cursor, then finish splits or merge underfull nodes.
//! Redo durability is awaited outside all locks.

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::{ensure, Result};
use rand::Rng;

use crate::error::CursorStateError;
use crate::lock::{key_hash, LockResult, LockType};
use crate::store::LatchRequest;
use crate::tree::fragment::FragmentStore;
use crate::tree::frame::CursorFrame;
use crate::tree::node::{Node, NodeInner};
use crate::tree::tree::{CompactionObserver, Tree};
use crate::txn::{LockMode, Transaction};

/// Cursor-visible value state. `NotLoaded` means the entry exists but the
/// value was deliberately not fetched (autoload off); `Absent` covers both
/// missing entries and ghosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorValue {
    Absent,
    NotLoaded,
    Value(Vec<u8>),
}

/// Precondition for [`Cursor::find_and_modify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueCondition {
    /// Entry must not exist (ghosts count as absent).
    Insert,
    /// Entry must exist.
    Replace,
    /// Current value must equal this (None = absent).
    Equals(Option<Vec<u8>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FindVariant {
    /// Full lock handling per the transaction's mode.
    Regular,
    /// Position only; the caller already holds whatever lock it needs.
    NoLock,
}

pub struct Cursor {
    tree: Arc<Tree>,
    txn: Option<Arc<Transaction>>,
    /// Lock-manager identity for autocommit operations.
    locker_id: u64,
    leaf: Option<Arc<CursorFrame>>,
    key: Option<Vec<u8>>,
    key_hash: u32,
    value: CursorValue,
    autoload: bool,
}

impl Cursor {
    pub(crate) fn new(tree: Arc<Tree>, txn: Option<Arc<Transaction>>) -> Self {
        let locker_id = tree.db.next_locker_id();
        Self {
            tree,
            txn,
            locker_id,
            leaf: None,
            key: None,
            key_hash: 0,
            value: CursorValue::Absent,
            autoload: true,
        }
    }

    // --- accessors ---

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> Option<&[u8]> {
        match &self.value {
            CursorValue::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn value_state(&self) -> &CursorValue {
        &self.value
    }

    /// Whether reads copy the value (true) or only verify existence.
    pub fn autoload(&mut self, mode: bool) -> bool {
        std::mem::replace(&mut self.autoload, mode)
    }

    pub fn link(&mut self, txn: Option<Arc<Transaction>>) -> Option<Arc<Transaction>> {
        std::mem::replace(&mut self.txn, txn)
    }

    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.txn.as_ref()
    }

    pub fn compare_key_to(&self, other: &[u8]) -> Option<Ordering> {
        self.key.as_deref().map(|k| k.cmp(other))
    }

    fn frag(&self) -> &FragmentStore {
        self.tree.frag()
    }

    fn lock_mode(&self) -> LockMode {
        match &self.txn {
            Some(txn) => txn.lock_mode(),
            None => LockMode::ReadCommitted,
        }
    }

    fn lock_id(&self) -> u64 {
        match &self.txn {
            Some(txn) if !txn.is_bogus() => txn.id(),
            _ => self.locker_id,
        }
    }

    fn lock_timeout(&self) -> i64 {
        self.tree.db.lock_timeout_nanos
    }

    fn current_key_hash(&mut self) -> u32 {
        if self.key_hash == 0 {
            if let Some(key) = &self.key {
                self.key_hash = key_hash(self.tree.id(), key);
            }
        }
        self.key_hash
    }

    /// Unbinds the whole frame stack and forgets the position. No latches
    /// may be held.
    pub fn reset(&mut self) {
        let mut frame = self.leaf.take();
        while let Some(f) = frame {
            if let Some(node) = f.node() {
                node.acquire_exclusive();
                f.unbind();
                node.release_exclusive();
            }
            frame = f.parent();
        }
        self.key = None;
        self.key_hash = 0;
        self.value = CursorValue::Absent;
    }

    // --- latch helpers ---

    fn leaf_frame(&self) -> Result<Arc<CursorFrame>> {
        self.leaf
            .clone()
            .ok_or_else(|| CursorStateError("cursor is not positioned").into())
    }

    /// Leaf frame latched shared with any pending split finished.
    fn leaf_shared_not_split(&mut self) -> Result<(Arc<CursorFrame>, Arc<Node>)> {
        let frame = self.leaf_frame()?;
        let mut node = frame.acquire_shared();
        if node.data().split.is_some() {
            node = self.finish_split_shared(&frame, node)?;
        }
        Ok((frame, node))
    }

    /// Leaf frame latched exclusively; splits are finished by the write
    /// paths via `not_split_dirty`.
    fn leaf_exclusive(&self) -> Result<(Arc<CursorFrame>, Arc<Node>)> {
        let frame = self.leaf_frame()?;
        let node = frame.acquire_exclusive();
        Ok((frame, node))
    }

    /// Leaf frame latched exclusively with any pending split finished, so
    /// positions address the page image directly.
    fn leaf_exclusive_not_split(&self) -> Result<(Arc<CursorFrame>, Arc<Node>)> {
        let (frame, node) = self.leaf_exclusive()?;
        if node.data().split.is_none() {
            return Ok((frame, node));
        }

        let commit = &self.tree.db.commit_lock;
        let mut node = node;
        if !commit.try_acquire_shared() {
            node.release_exclusive();
            commit.acquire_shared();
            node = frame.acquire_exclusive();
            if node.data().split.is_none() {
                commit.release_shared();
                return Ok((frame, node));
            }
        }
        let result = self.tree.finish_split(&frame, node);
        commit.release_shared();
        Ok((frame, result?))
    }

    /// Finishes the split observed on a shared-latched node: upgrade (or
    /// release and re-acquire), take the commit lock with the contended
    /// dance, finish, downgrade back to shared.
    fn finish_split_shared(
        &self,
        frame: &Arc<CursorFrame>,
        node: Arc<Node>,
    ) -> Result<Arc<Node>> {
        let mut node = node;
        if !node.try_upgrade() {
            node.release_shared();
            node = frame.acquire_exclusive();
            if node.data().split.is_none() {
                node.downgrade();
                return Ok(node);
            }
        }

        let commit = &self.tree.db.commit_lock;
        if !commit.try_acquire_shared() {
            node.release_exclusive();
            commit.acquire_shared();
            node = frame.acquire_exclusive();
            if node.data().split.is_none() {
                commit.release_shared();
                node.downgrade();
                return Ok(node);
            }
        }

        let result = self.tree.finish_split(frame, node);
        commit.release_shared();
        let node = result?;
        node.downgrade();
        Ok(node)
    }

    /// Couples from a latched parent into a child: cache lookup with id
    /// re-validation, falling back to a load under the parent latch.
    /// Parent latch is released once the child is secured.
    fn latch_to_child(&self, parent: &Arc<Node>, child_pos: i32) -> Result<Arc<Node>> {
        match self.latch_child_retain_parent(parent, child_pos) {
            Ok(child) => {
                parent.release_shared();
                Ok(child)
            }
            Err(e) => {
                parent.release_shared();
                Err(e)
            }
        }
    }

    /// Like `latch_to_child` but the parent stays latched.
    fn latch_child_retain_parent(&self, parent: &Arc<Node>, child_pos: i32) -> Result<Arc<Node>> {
        let child_id = parent.data().child_id_at(child_pos);
        if let Some(child) = self.tree.db.cache.node_map_get(child_id) {
            child.acquire_shared();
            if child.id() == child_id {
                return Ok(child);
            }
            child.release_shared();
        }
        self.tree.db.cache.load_node(child_id, LatchRequest::Shared)
    }

    /// Exclusive-mode child coupling used by merges. Parent (exclusively
    /// latched) is retained; released on error.
    fn latch_child_retain_parent_ex(
        &self,
        parent: &Arc<Node>,
        child_pos: i32,
    ) -> Result<Arc<Node>> {
        let child_id = parent.data().child_id_at(child_pos);
        if let Some(child) = self.tree.db.cache.node_map_get(child_id) {
            child.acquire_exclusive();
            if child.id() == child_id {
                return Ok(child);
            }
            child.release_exclusive();
        }
        match self.tree.db.cache.load_node(child_id, LatchRequest::Exclusive) {
            Ok(child) => Ok(child),
            Err(e) => {
                parent.release_exclusive();
                Err(e)
            }
        }
    }

    // --- first / last ---

    pub fn first(&mut self) -> Result<LockResult> {
        self.tree.db.check_closed()?;
        self.reset();
        let root = self.tree.latch_root_shared();
        let frame = CursorFrame::new(None);
        self.to_first_from(root, frame)?;
        self.copy_current_or_advance(true)
    }

    pub fn last(&mut self) -> Result<LockResult> {
        self.tree.db.check_closed()?;
        self.reset();
        let root = self.tree.latch_root_shared();
        let frame = CursorFrame::new(None);
        self.to_last_from(root, frame)?;
        self.copy_current_or_advance(false)
    }

    /// Descends to the leftmost leaf under `node`, finishing splits on the
    /// way. The leaf frame is left latched shared and becomes `self.leaf`.
    /// Returns false (leaf still latched, position before-first) when the
    /// leaf is empty.
    fn to_first_from(&mut self, node: Arc<Node>, frame: Arc<CursorFrame>) -> Result<bool> {
        let mut node = node;
        let mut frame = frame;
        loop {
            frame.bind(&node, 0);
            if node.data().split.is_some() {
                node = self.finish_split_shared(&frame, node)?;
            }
            if node.data().is_leaf() {
                self.leaf = Some(frame);
                return Ok(node.data().has_keys());
            }
            let child = match self.latch_to_child(&node, 0) {
                Ok(child) => child,
                Err(e) => {
                    node.release_shared();
                    self.cleanup_frames(frame);
                    return Err(e);
                }
            };
            frame = CursorFrame::new(Some(frame));
            node = child;
        }
    }

    fn to_last_from(&mut self, node: Arc<Node>, frame: Arc<CursorFrame>) -> Result<bool> {
        let mut node = node;
        let mut frame = frame;
        loop {
            frame.bind(&node, 0);
            if node.data().split.is_some() {
                node = self.finish_split_shared(&frame, node)?;
            }
            if node.data().is_leaf() {
                let pos = node.data().highest_leaf_pos();
                frame.set_pos(pos.max(0));
                self.leaf = Some(frame);
                return Ok(node.data().has_keys());
            }
            let pos = node.data().highest_internal_pos();
            frame.set_pos(pos);
            let child = match self.latch_to_child(&node, pos) {
                Ok(child) => child,
                Err(e) => {
                    node.release_shared();
                    self.cleanup_frames(frame);
                    return Err(e);
                }
            };
            frame = CursorFrame::new(Some(frame));
            node = child;
        }
    }

    /// Unwinds a partially built frame stack after a descent failure.
    fn cleanup_frames(&mut self, frame: Arc<CursorFrame>) {
        let mut frame = Some(frame);
        while let Some(f) = frame {
            if f.node().is_some() {
                let node = f.acquire_exclusive();
                f.unbind();
                node.release_exclusive();
            }
            frame = f.parent();
        }
        self.leaf = None;
    }

    // --- iteration ---

    pub fn next(&mut self) -> Result<LockResult> {
        let (frame, _node) = self.leaf_shared_not_split()?;
        self.next_loop(frame, None, false)
    }

    /// Advances while keys are <= the limit.
    pub fn next_le(&mut self, limit_key: &[u8]) -> Result<LockResult> {
        let (frame, _node) = self.leaf_shared_not_split()?;
        self.next_loop(frame, Some(limit_key.to_vec()), true)
    }

    /// Advances while keys are < the limit.
    pub fn next_lt(&mut self, limit_key: &[u8]) -> Result<LockResult> {
        let (frame, _node) = self.leaf_shared_not_split()?;
        self.next_loop(frame, Some(limit_key.to_vec()), false)
    }

    fn next_loop(
        &mut self,
        mut frame: Arc<CursorFrame>,
        limit: Option<Vec<u8>>,
        inclusive: bool,
    ) -> Result<LockResult> {
        loop {
            if !self.to_next(frame)? {
                return Ok(LockResult::Unowned);
            }
            // Leaf latched at the new position; check the limit before
            // locking.
            if let Some(limit) = &limit {
                let f = self.leaf_frame()?;
                let n = f.node().expect("leaf latched");
                let key = match n.data().key_at(f.pos(), self.frag()) {
                    Ok(key) => key,
                    Err(e) => {
                        n.release_shared();
                        return Err(e);
                    }
                };
                let out = if inclusive {
                    key.as_slice() > limit.as_slice()
                } else {
                    key.as_slice() >= limit.as_slice()
                };
                if out {
                    n.release_shared();
                    self.reset();
                    return Ok(LockResult::Unowned);
                }
            }
            if let Some(result) = self.try_copy_current()? {
                if self.key.is_none() || self.value != CursorValue::Absent {
                    return Ok(result);
                }
            } else if let Some(result) = self.lock_and_copy_if_exists()? {
                return Ok(result);
            }
            // Ghost or vanished entry: keep going.
            let (f, _n) = self.leaf_shared_not_split()?;
            frame = f;
        }
    }

    /// Moves the latched leaf frame to the next entry. Returns false when
    /// iteration is exhausted (cursor unpositioned, no latches held);
    /// returns true with the leaf frame latched shared.
    fn to_next(&mut self, frame: Arc<CursorFrame>) -> Result<bool> {
        let mut frame = frame;
        let mut node = frame.node().expect("frame latched");

        // Quick path within the leaf.
        {
            let pos = frame.pos();
            if pos < 0 {
                let target = !pos;
                if target <= node.data().highest_leaf_pos() {
                    frame.set_not_found_key(None);
                    frame.set_pos(target);
                    return Ok(true);
                }
            } else if pos < node.data().highest_leaf_pos() {
                frame.set_pos(pos + 2);
                return Ok(true);
            }
        }

        loop {
            let Some(parent_frame) = frame.parent() else {
                node.release_shared();
                let f = frame;
                let n = f.node().expect("still bound");
                n.acquire_exclusive();
                f.unbind();
                n.release_exclusive();
                self.leaf = None;
                self.key = None;
                self.key_hash = 0;
                self.value = CursorValue::Absent;
                return Ok(false);
            };

            // Latch coupling up the tree usually works, so give it a try.
            // If it works, there is no need to worry about a node merge.
            let mut parent_node;
            let mut relatch_child = false;
            match parent_frame.try_acquire_shared() {
                Some(p) => {
                    node.release_shared();
                    parent_node = p;
                    if parent_node.data().split.is_some() {
                        parent_node = self.finish_split_shared(&parent_frame, parent_node)?;
                        relatch_child = true;
                    }
                }
                None => {
                    // Coupling failed: release the child and block on the
                    // parent. The child may have changed meanwhile, so it
                    // must be checked again.
                    node.release_shared();
                    parent_node = parent_frame.acquire_shared();
                    if parent_node.data().split.is_some() {
                        parent_node = self.finish_split_shared(&parent_frame, parent_node)?;
                    }
                    relatch_child = true;
                }
            }

            let parent_pos;
            if relatch_child {
                // Re-acquire the child in case a merge changed its bounds.
                parent_pos = parent_frame.pos();
                node = match self.latch_child_retain_parent(&parent_node, parent_pos) {
                    Ok(node) => node,
                    Err(e) => {
                        parent_node.release_shared();
                        return Err(e);
                    }
                };

                let mut advanced = None;
                {
                    let pos = frame.pos();
                    if pos < 0 {
                        let target = !pos;
                        if target <= node.data().highest_leaf_pos() {
                            frame.set_not_found_key(None);
                            advanced = Some(target);
                        }
                    } else if pos < node.data().highest_pos() {
                        advanced = Some(pos + 2);
                    }
                }
                if let Some(pos) = advanced {
                    parent_node.release_shared();
                    frame.set_pos(pos);
                    if self
                        .leaf
                        .as_ref()
                        .map(|l| Arc::ptr_eq(l, &frame))
                        .unwrap_or(false)
                    {
                        return Ok(true);
                    }
                    // Internal frame grew back: dive into the child.
                    let child = self.latch_to_child(&node, pos)?;
                    return self.to_first_from(child, CursorFrame::new(Some(frame)));
                }

                node.release_shared();
                {
                    let n = frame.node().expect("still bound");
                    n.acquire_exclusive();
                    frame.unbind();
                    n.release_exclusive();
                }
            } else {
                parent_pos = parent_frame.pos();
                {
                    let n = frame.node().expect("still bound");
                    n.acquire_exclusive();
                    frame.unbind();
                    n.release_exclusive();
                }
            }

            // Only the shared parent latch is held; the child frame is no
            // longer valid.
            if parent_pos < parent_node.data().highest_internal_pos() {
                parent_frame.set_pos(parent_pos + 2);
                let child = self.latch_to_child(&parent_node, parent_pos + 2)?;
                return self.to_first_from(child, CursorFrame::new(Some(parent_frame)));
            }

            frame = parent_frame;
            node = parent_node;
        }
    }

    pub fn previous(&mut self) -> Result<LockResult> {
        let (frame, _node) = self.leaf_shared_not_split()?;
        self.previous_loop(frame, None, false)
    }

    /// Retreats while keys are >= the limit.
    pub fn previous_ge(&mut self, limit_key: &[u8]) -> Result<LockResult> {
        let (frame, _node) = self.leaf_shared_not_split()?;
        self.previous_loop(frame, Some(limit_key.to_vec()), true)
    }

    /// Retreats while keys are > the limit.
    pub fn previous_gt(&mut self, limit_key: &[u8]) -> Result<LockResult> {
        let (frame, _node) = self.leaf_shared_not_split()?;
        self.previous_loop(frame, Some(limit_key.to_vec()), false)
    }

    fn previous_loop(
        &mut self,
        mut frame: Arc<CursorFrame>,
        limit: Option<Vec<u8>>,
        inclusive: bool,
    ) -> Result<LockResult> {
        loop {
            if !self.to_previous(frame)? {
                return Ok(LockResult::Unowned);
            }
            if let Some(limit) = &limit {
                let f = self.leaf_frame()?;
                let n = f.node().expect("leaf latched");
                let key = match n.data().key_at(f.pos(), self.frag()) {
                    Ok(key) => key,
                    Err(e) => {
                        n.release_shared();
                        return Err(e);
                    }
                };
                let out = if inclusive {
                    key.as_slice() < limit.as_slice()
                } else {
                    key.as_slice() <= limit.as_slice()
                };
                if out {
                    n.release_shared();
                    self.reset();
                    return Ok(LockResult::Unowned);
                }
            }
            if let Some(result) = self.try_copy_current()? {
                if self.key.is_none() || self.value != CursorValue::Absent {
                    return Ok(result);
                }
            } else if let Some(result) = self.lock_and_copy_if_exists()? {
                return Ok(result);
            }
            let (f, _n) = self.leaf_shared_not_split()?;
            frame = f;
        }
    }

    fn to_previous(&mut self, frame: Arc<CursorFrame>) -> Result<bool> {
        let mut frame = frame;
        let mut node = frame.node().expect("frame latched");

        {
            let pos = frame.pos();
            if pos < 0 {
                let target = !pos - 2;
                if target >= 0 {
                    frame.set_not_found_key(None);
                    frame.set_pos(target);
                    return Ok(true);
                }
            } else if pos > 0 {
                frame.set_pos(pos - 2);
                return Ok(true);
            }
        }

        loop {
            let Some(parent_frame) = frame.parent() else {
                node.release_shared();
                let n = frame.node().expect("still bound");
                n.acquire_exclusive();
                frame.unbind();
                n.release_exclusive();
                self.leaf = None;
                self.key = None;
                self.key_hash = 0;
                self.value = CursorValue::Absent;
                return Ok(false);
            };

            let mut parent_node;
            let mut relatch_child = false;
            match parent_frame.try_acquire_shared() {
                Some(p) => {
                    node.release_shared();
                    parent_node = p;
                    if parent_node.data().split.is_some() {
                        parent_node = self.finish_split_shared(&parent_frame, parent_node)?;
                        relatch_child = true;
                    }
                }
                None => {
                    node.release_shared();
                    parent_node = parent_frame.acquire_shared();
                    if parent_node.data().split.is_some() {
                        parent_node = self.finish_split_shared(&parent_frame, parent_node)?;
                    }
                    relatch_child = true;
                }
            }

            let parent_pos;
            if relatch_child {
                parent_pos = parent_frame.pos();
                node = match self.latch_child_retain_parent(&parent_node, parent_pos) {
                    Ok(node) => node,
                    Err(e) => {
                        parent_node.release_shared();
                        return Err(e);
                    }
                };

                let mut retreated = None;
                {
                    let pos = frame.pos();
                    if pos < 0 {
                        let target = !pos - 2;
                        if target >= 0 {
                            frame.set_not_found_key(None);
                            retreated = Some(target);
                        }
                    } else if pos > 0 {
                        retreated = Some(pos - 2);
                    }
                }
                if let Some(pos) = retreated {
                    parent_node.release_shared();
                    frame.set_pos(pos);
                    if self
                        .leaf
                        .as_ref()
                        .map(|l| Arc::ptr_eq(l, &frame))
                        .unwrap_or(false)
                    {
                        return Ok(true);
                    }
                    let child = self.latch_to_child(&node, pos)?;
                    return self.to_last_from(child, CursorFrame::new(Some(frame)));
                }

                node.release_shared();
                {
                    let n = frame.node().expect("still bound");
                    n.acquire_exclusive();
                    frame.unbind();
                    n.release_exclusive();
                }
            } else {
                parent_pos = parent_frame.pos();
                let n = frame.node().expect("still bound");
                n.acquire_exclusive();
                frame.unbind();
                n.release_exclusive();
            }

            if parent_pos > 0 {
                parent_frame.set_pos(parent_pos - 2);
                let child = self.latch_to_child(&parent_node, parent_pos - 2)?;
                return self.to_last_from(child, CursorFrame::new(Some(parent_frame)));
            }

            frame = parent_frame;
            node = parent_node;
        }
    }

    /// Lock/copy at the freshly positioned leaf, advancing past ghosts.
    /// `forward` picks the direction for ghost skipping.
    fn copy_current_or_advance(&mut self, forward: bool) -> Result<LockResult> {
        loop {
            let frame = self.leaf_frame()?;
            let node = frame.node().expect("leaf latched");
            if !node.data().has_keys() {
                // Empty leaf: walk to a neighbor.
                if forward {
                    return self.next_loop(frame, None, false);
                }
                return self.previous_loop(frame, None, false);
            }
            if let Some(result) = self.try_copy_current()? {
                if self.key.is_none() || self.value != CursorValue::Absent {
                    return Ok(result);
                }
            } else if let Some(result) = self.lock_and_copy_if_exists()? {
                return Ok(result);
            }
            let (frame, _node) = self.leaf_shared_not_split()?;
            if forward {
                return self.next_loop(frame, None, false);
            }
            return self.previous_loop(frame, None, false);
        }
    }

    // --- read path ---

    /// Copies the current entry under the shared leaf latch if the lock
    /// situation allows it without blocking. The latch is released in
    /// every path. `None` means the caller must lock without the latch.
    fn try_copy_current(&mut self) -> Result<Option<LockResult>> {
        let frame = self.leaf_frame()?;
        let node = frame.node().expect("leaf latched");
        let pos = frame.pos();
        debug_assert!(pos >= 0);

        let frag = self.frag().clone();
        match node.data().key_at(pos, &frag) {
            Ok(key) => self.key = Some(key),
            Err(e) => {
                node.release_shared();
                return Err(e);
            }
        }
        self.key_hash = 0;

        let mode = self.lock_mode();
        if mode.no_read_lock() {
            let copied = self.copy_value_at(&node, pos);
            node.release_shared();
            copied?;
            return Ok(Some(LockResult::Unowned));
        }

        let hash = self.current_key_hash();
        let key = self.key.clone().expect("key copied above");
        let tree_id = self.tree.id();
        let db = Arc::clone(&self.tree.db);

        if !mode.repeatable() {
            // Read committed: peek availability and copy under the latch.
            if db.locks.is_lock_available(self.lock_id(), tree_id, &key, hash) {
                let copied = self.copy_value_at(&node, pos);
                node.release_shared();
                copied?;
                return Ok(Some(LockResult::Unowned));
            }
            node.release_shared();
            return Ok(None);
        }

        // Repeatable and stronger: zero-timeout acquisition under the
        // latch.
        let attempt = db
            .locks
            .try_lock(self.lock_id(), mode.read_lock_type(), tree_id, &key, hash);
        match attempt {
            Ok(Some(result)) => {
                if result.is_acquired() {
                    if let Some(txn) = &self.txn {
                        txn.register_lock(tree_id, &key, hash);
                    }
                }
                let copied = self.copy_value_at(&node, pos);
                node.release_shared();
                copied?;
                Ok(Some(result))
            }
            Ok(None) => {
                node.release_shared();
                Ok(None)
            }
            Err(e) => {
                node.release_shared();
                Err(e)
            }
        }
    }

    fn copy_value_at(&mut self, node: &Arc<Node>, pos: i32) -> Result<()> {
        let frag = self.frag().clone();
        self.value = if self.autoload {
            match node.data().leaf_value_at(pos, &frag)? {
                Some(v) => CursorValue::Value(v),
                None => CursorValue::Absent,
            }
        } else if node.data().is_ghost_at(pos)? {
            CursorValue::Absent
        } else {
            CursorValue::NotLoaded
        };
        Ok(())
    }

    /// Acquires the read lock without the latch, re-latches, and copies
    /// the value only if the entry still exists. A freshly acquired lock
    /// is released when the entry vanished, and `None` tells iteration to
    /// continue.
    fn lock_and_copy_if_exists(&mut self) -> Result<Option<LockResult>> {
        let mode = self.lock_mode();
        let hash = self.current_key_hash();
        let key = self.key.clone().expect("positioned with key");
        let tree_id = self.tree.id();
        let db = Arc::clone(&self.tree.db);
        let lock_id = self.lock_id();

        let result = db.locks.lock(
            lock_id,
            mode.read_lock_type(),
            tree_id,
            &key,
            hash,
            self.lock_timeout(),
        )?;

        let (frame, node) = self.leaf_shared_not_split()?;
        let pos = frame.pos();
        if pos >= 0 {
            self.copy_value_at(&node, pos)?;
            node.release_shared();
            if !mode.repeatable() {
                if result.is_acquired() {
                    db.locks.unlock(lock_id, tree_id, &key, hash);
                }
                return Ok(Some(LockResult::Unowned));
            }
            if result.is_acquired() {
                if let Some(txn) = &self.txn {
                    txn.register_lock(tree_id, &key, hash);
                }
            }
            return Ok(Some(result));
        }

        node.release_shared();
        self.value = CursorValue::Absent;
        if result.is_acquired() {
            db.locks.unlock(lock_id, tree_id, &key, hash);
        }
        Ok(None)
    }

    /// Re-reads the value at the current position with full lock handling.
    pub fn load(&mut self) -> Result<LockResult> {
        let key = self
            .key
            .clone()
            .ok_or(CursorStateError("cursor has no key"))?;
        let mode = self.lock_mode();

        if mode.no_read_lock() {
            let (frame, node) = self.leaf_shared_not_split()?;
            let pos = frame.pos();
            if pos >= 0 {
                self.copy_value_at(&node, pos)?;
            } else {
                self.value = CursorValue::Absent;
            }
            node.release_shared();
            return Ok(LockResult::Unowned);
        }

        let hash = self.current_key_hash();
        let tree_id = self.tree.id();
        let lock_id = self.lock_id();
        let result = self.tree.db.locks.lock(
            lock_id,
            mode.read_lock_type(),
            tree_id,
            &key,
            hash,
            self.lock_timeout(),
        )?;

        let (frame, node) = self.leaf_shared_not_split()?;
        let pos = frame.pos();
        if pos >= 0 {
            self.copy_value_at(&node, pos)?;
        } else {
            self.value = CursorValue::Absent;
        }
        node.release_shared();

        if !mode.repeatable() {
            if result.is_acquired() {
                self.tree.db.locks.unlock(lock_id, tree_id, &key, hash);
            }
            return Ok(LockResult::Unowned);
        }
        if result.is_acquired() {
            if let Some(txn) = &self.txn {
                txn.register_lock(tree_id, &key, hash);
            }
        }
        Ok(result)
    }

    // --- find ---

    pub fn find(&mut self, key: &[u8]) -> Result<LockResult> {
        self.find_internal(key, FindVariant::Regular)
    }

    pub fn find_ge(&mut self, key: &[u8]) -> Result<LockResult> {
        let result = self.find(key)?;
        if self.value != CursorValue::Absent || self.key.is_none() {
            return Ok(result);
        }
        self.next()
    }

    pub fn find_gt(&mut self, key: &[u8]) -> Result<LockResult> {
        // Never lock the probe key.
        self.find_internal(key, FindVariant::NoLock)?;
        self.next()
    }

    pub fn find_le(&mut self, key: &[u8]) -> Result<LockResult> {
        let result = self.find(key)?;
        if self.value != CursorValue::Absent || self.key.is_none() {
            return Ok(result);
        }
        self.previous()
    }

    pub fn find_lt(&mut self, key: &[u8]) -> Result<LockResult> {
        self.find_internal(key, FindVariant::NoLock)?;
        self.previous()
    }

    fn find_internal(&mut self, key: &[u8], variant: FindVariant) -> Result<LockResult> {
        self.tree.db.check_closed()?;
        self.reset();
        self.key = Some(key.to_vec());
        self.key_hash = 0;
        self.value = CursorValue::NotLoaded;

        let mut node = self.tree.latch_root_shared();
        let mut frame = CursorFrame::new(None);

        loop {
            frame.bind(&node, 0);
            if node.data().split.is_some() {
                node = match self.finish_split_shared(&frame, node) {
                    Ok(n) => n,
                    Err(e) => {
                        self.cleanup_frames(frame);
                        return Err(e);
                    }
                };
            }

            let search = match node.data().binary_search(key, self.frag()) {
                Ok(s) => s,
                Err(e) => {
                    node.release_shared();
                    self.cleanup_frames(frame);
                    return Err(e);
                }
            };

            if node.data().is_leaf() {
                self.leaf = Some(Arc::clone(&frame));
                if search >= 0 {
                    frame.set_pos(search);
                    return self.finish_find_found(variant);
                }
                frame.set_pos(search);
                frame.set_not_found_key(Some(key.to_vec()));
                self.value = CursorValue::Absent;
                return self.finish_find_missed(variant, &node);
            }

            let child_pos = NodeInner::internal_child_pos(search);
            frame.set_pos(child_pos);
            let child = match self.latch_to_child(&node, child_pos) {
                Ok(child) => child,
                Err(e) => {
                    node.release_shared();
                    self.cleanup_frames(frame);
                    return Err(e);
                }
            };
            frame = CursorFrame::new(Some(frame));
            node = child;
        }
    }

    fn finish_find_found(&mut self, variant: FindVariant) -> Result<LockResult> {
        if variant == FindVariant::NoLock {
            let frame = self.leaf_frame()?;
            let node = frame.node().expect("leaf latched");
            node.release_shared();
            return Ok(LockResult::Unowned);
        }
        if let Some(result) = self.try_copy_current()? {
            return Ok(result);
        }
        match self.lock_and_copy_if_exists()? {
            Some(result) => Ok(result),
            // The entry vanished while blocked; report the miss.
            None => Ok(LockResult::Unowned),
        }
    }

    /// Lock handling for a missed key: the key is still locked (except in
    /// no-lock paths) so phantom inserts are excluded per the mode.
    fn finish_find_missed(&mut self, variant: FindVariant, node: &Arc<Node>) -> Result<LockResult> {
        let mode = self.lock_mode();
        if variant == FindVariant::NoLock || mode.no_read_lock() {
            node.release_shared();
            return Ok(LockResult::Unowned);
        }

        let hash = self.current_key_hash();
        let key = self.key.clone().expect("find set the key");
        let tree_id = self.tree.id();
        let db = Arc::clone(&self.tree.db);
        let lock_id = self.lock_id();

        if !mode.repeatable() {
            // Read committed: a missed key needs no retained lock.
            if db.locks.is_lock_available(lock_id, tree_id, &key, hash) {
                node.release_shared();
                return Ok(LockResult::Unowned);
            }
            node.release_shared();
            // Wait out the owner, then release immediately.
            let result = db.locks.lock(
                lock_id,
                LockType::Shared,
                tree_id,
                &key,
                hash,
                self.lock_timeout(),
            )?;
            if result.is_acquired() {
                db.locks.unlock(lock_id, tree_id, &key, hash);
            }
            return Ok(LockResult::Unowned);
        }

        match db
            .locks
            .try_lock(lock_id, mode.read_lock_type(), tree_id, &key, hash)?
        {
            Some(result) => {
                if result.is_acquired() {
                    if let Some(txn) = &self.txn {
                        txn.register_lock(tree_id, &key, hash);
                    }
                }
                node.release_shared();
                Ok(result)
            }
            None => {
                node.release_shared();
                let result = db.locks.lock(
                    lock_id,
                    mode.read_lock_type(),
                    tree_id,
                    &key,
                    hash,
                    self.lock_timeout(),
                )?;
                if result.is_acquired() {
                    if let Some(txn) = &self.txn {
                        txn.register_lock(tree_id, &key, hash);
                    }
                }
                Ok(result)
            }
        }
    }

    /// Optimized find for keys near the current position: search the
    /// current leaf first, then pop up the stack while the target is
    /// outside each node's extremity-bounded range, descending again from
    /// the first level that covers it.
    pub fn find_nearby(&mut self, key: &[u8]) -> Result<LockResult> {
        let Some(leaf) = self.leaf.clone() else {
            return self.find(key);
        };

        self.key = Some(key.to_vec());
        self.key_hash = 0;
        self.value = CursorValue::NotLoaded;

        let mut frame = leaf;
        let mut node = frame.acquire_shared();

        // Current leaf fast path, split-aware.
        let frag = self.frag().clone();
        let in_leaf = {
            let search = if let Some(split) = node.data().split.as_ref() {
                split.binary_search_leaf(&node, key, &frag)?
            } else {
                node.data().binary_search(key, &frag)?
            };
            let highest = if let Some(split) = node.data().split.as_ref() {
                split.highest_pos(&node)
            } else {
                node.data().highest_leaf_pos()
            };
            if search >= 0 {
                true
            } else {
                let ins = !search;
                let interior = ins > 0 && ins <= highest;
                let low_ok = ins == 0 && node.data().has_low_extremity();
                let high_ok = ins == highest + 2 && node.data().has_high_extremity();
                interior || low_ok || high_ok
            }
        };

        if in_leaf {
            if node.data().split.is_some() {
                node = self.finish_split_shared(&frame, node)?;
            }
            let search = node.data().binary_search(key, &frag)?;
            if search >= 0 {
                frame.set_pos(search);
                frame.set_not_found_key(None);
                return self.finish_find_found(FindVariant::Regular);
            }
            frame.set_pos(search);
            frame.set_not_found_key(Some(key.to_vec()));
            self.value = CursorValue::Absent;
            return self.finish_find_missed(FindVariant::Regular, &node);
        }

        // Pop up until a covering level is found. The leaf pointer is
        // cleared first: the stack below the covering level is unwound as
        // the pops go.
        self.leaf = None;
        loop {
            let Some(parent_frame) = frame.parent() else {
                // frame is the root: descend from here.
                break;
            };
            node.release_shared();
            {
                let n = frame.node().expect("still bound");
                n.acquire_exclusive();
                frame.unbind();
                n.release_exclusive();
            }
            frame = parent_frame;
            node = frame.acquire_shared();
            if node.data().split.is_some() {
                node = self.finish_split_shared(&frame, node)?;
            }

            let search = node.data().binary_search(key, &frag)?;
            let child_pos = NodeInner::internal_child_pos(search);
            let low_edge = child_pos == 0 && !node.data().has_low_extremity();
            let high_edge = child_pos >= node.data().highest_internal_pos()
                && !node.data().has_high_extremity();
            if low_edge || high_edge {
                continue;
            }

            // Covered: descend from this level.
            frame.set_pos(child_pos);
            let child = self.latch_to_child(&node, child_pos)?;
            let child_frame = CursorFrame::new(Some(frame));
            return self.descend_to_key(child, child_frame, key);
        }

        // Reached the root frame.
        let search = node.data().binary_search(key, &frag)?;
        if node.data().is_leaf() {
            // Height-one tree.
            if search >= 0 {
                frame.set_pos(search);
                frame.set_not_found_key(None);
                self.leaf = Some(frame);
                return self.finish_find_found(FindVariant::Regular);
            }
            frame.set_pos(search);
            frame.set_not_found_key(Some(key.to_vec()));
            self.leaf = Some(frame);
            self.value = CursorValue::Absent;
            return self.finish_find_missed(FindVariant::Regular, &node);
        }
        let child_pos = NodeInner::internal_child_pos(search);
        frame.set_pos(child_pos);
        let child = self.latch_to_child(&node, child_pos)?;
        let child_frame = CursorFrame::new(Some(frame));
        self.descend_to_key(child, child_frame, key)
    }

    /// Continues a descent toward `key` from a mid-tree node, finishing
    /// with the regular lock handling.
    fn descend_to_key(
        &mut self,
        node: Arc<Node>,
        frame: Arc<CursorFrame>,
        key: &[u8],
    ) -> Result<LockResult> {
        let mut node = node;
        let mut frame = frame;
        loop {
            frame.bind(&node, 0);
            if node.data().split.is_some() {
                node = self.finish_split_shared(&frame, node)?;
            }
            let search = node.data().binary_search(key, self.frag())?;
            if node.data().is_leaf() {
                self.leaf = Some(Arc::clone(&frame));
                if search >= 0 {
                    frame.set_pos(search);
                    frame.set_not_found_key(None);
                    return self.finish_find_found(FindVariant::Regular);
                }
                frame.set_pos(search);
                frame.set_not_found_key(Some(key.to_vec()));
                self.value = CursorValue::Absent;
                return self.finish_find_missed(FindVariant::Regular, &node);
            }
            let child_pos = NodeInner::internal_child_pos(search);
            frame.set_pos(child_pos);
            let child = self.latch_to_child(&node, child_pos)?;
            frame = CursorFrame::new(Some(frame));
            node = child;
        }
    }

    // --- skip ---

    pub fn skip(&mut self, amount: i64) -> Result<LockResult> {
        self.skip_limit(amount, None, false)
    }

    /// Batched navigation. A positive amount moves forward, negative
    /// backward. When a limit key is given, the scan aborts (cursor
    /// reset, `Unowned`) as soon as the walk would pass it.
    pub fn skip_limit(
        &mut self,
        amount: i64,
        limit_key: Option<&[u8]>,
        inclusive: bool,
    ) -> Result<LockResult> {
        if amount == 0 {
            return self.load();
        }
        if amount > 0 {
            self.skip_next_gap(amount as u64, limit_key, inclusive)
        } else {
            self.skip_previous_gap(amount.unsigned_abs(), limit_key, inclusive)
        }
    }

    fn skip_next_gap(
        &mut self,
        mut amount: u64,
        limit: Option<&[u8]>,
        inclusive: bool,
    ) -> Result<LockResult> {
        let (mut frame, _node) = self.leaf_shared_not_split()?;
        let frag = self.frag().clone();

        'outer: loop {
            let node = frame.node().expect("leaf latched");
            let highest = node.data().highest_leaf_pos();
            let mut pos = frame.pos();
            if pos < 0 {
                pos = !pos - 2;
            }
            while amount > 0 && pos < highest {
                pos += 2;
                if !node.data().is_ghost_at(pos)? {
                    amount -= 1;
                }
            }
            if amount == 0 && pos >= 0 {
                frame.set_pos(pos);
                frame.set_not_found_key(None);
                if let Some(limit) = limit {
                    let key = node.data().key_at(pos, &frag)?;
                    let out = if inclusive {
                        key.as_slice() > limit
                    } else {
                        key.as_slice() >= limit
                    };
                    if out {
                        node.release_shared();
                        self.reset();
                        return Ok(LockResult::Unowned);
                    }
                }
                self.key = Some(node.data().key_at(pos, &frag)?);
                self.key_hash = 0;
                if let Some(result) = self.try_copy_current()? {
                    if self.value != CursorValue::Absent {
                        return Ok(result);
                    }
                } else if let Some(result) = self.lock_and_copy_if_exists()? {
                    return Ok(result);
                }
                // Landed on a ghost: one more step.
                amount = 1;
                let (f, _n) = self.leaf_shared_not_split()?;
                frame = f;
                continue 'outer;
            }

            // Leaf exhausted; ascend, skipping whole subtrees by entry
            // count where the bottom-internal cache allows it.
            frame.set_pos(highest.max(0));
            loop {
                let node = frame.node().expect("latched");
                let Some(parent_frame) = frame.parent() else {
                    node.release_shared();
                    let n = frame.node().expect("still bound");
                    n.acquire_exclusive();
                    frame.unbind();
                    n.release_exclusive();
                    self.leaf = None;
                    self.key = None;
                    self.key_hash = 0;
                    self.value = CursorValue::Absent;
                    return Ok(LockResult::Unowned);
                };

                let parent = match parent_frame.try_acquire_shared() {
                    Some(p) => {
                        node.release_shared();
                        if p.data().split.is_some() {
                            self.finish_split_shared(&parent_frame, p)?
                        } else {
                            p
                        }
                    }
                    None => {
                        node.release_shared();
                        let p = parent_frame.acquire_shared();
                        if p.data().split.is_some() {
                            self.finish_split_shared(&parent_frame, p)?
                        } else {
                            p
                        }
                    }
                };
                {
                    let n = frame.node().expect("still bound");
                    n.acquire_exclusive();
                    frame.unbind();
                    n.release_exclusive();
                }

                let mut child_pos = parent_frame.pos() + 2;
                while child_pos <= parent.data().highest_internal_pos() {
                    // Lower bound of this subtree is the separator to its
                    // left; abort before descending past the limit.
                    if let Some(limit) = limit {
                        if child_pos >= 2 {
                            let bound = parent.data().key_at(child_pos - 2, &frag)?;
                            let out = if inclusive {
                                bound.as_slice() > limit
                            } else {
                                bound.as_slice() >= limit
                            };
                            if out {
                                parent.release_shared();
                                self.reset();
                                return Ok(LockResult::Unowned);
                            }
                        }
                    }

                    if parent.data().is_bottom_internal() {
                        if let Some(count) = parent.data().cached_child_entry_count(child_pos) {
                            if count < amount {
                                amount -= count;
                                parent_frame.set_pos(child_pos);
                                child_pos += 2;
                                continue;
                            }
                        } else {
                            let child = self.latch_child_retain_parent(&parent, child_pos)?;
                            let count = child.data().count_non_ghost_keys()?;
                            self.maybe_cache_child_count(&parent, child_pos, count);
                            if count < amount {
                                child.release_shared();
                                amount -= count;
                                parent_frame.set_pos(child_pos);
                                child_pos += 2;
                                continue;
                            }
                            // Descend into this child and step within it.
                            parent_frame.set_pos(child_pos);
                            parent.release_shared();
                            let child_frame = CursorFrame::new(Some(parent_frame));
                            child_frame.bind(&child, !0);
                            self.leaf = Some(Arc::clone(&child_frame));
                            frame = child_frame;
                            continue 'outer;
                        }
                    }

                    // Descend into the subtree and continue stepping.
                    parent_frame.set_pos(child_pos);
                    let child = self.latch_to_child(&parent, child_pos)?;
                    let child_frame = CursorFrame::new(Some(parent_frame));
                    if child.data().is_leaf() {
                        child_frame.bind(&child, !0);
                        self.leaf = Some(Arc::clone(&child_frame));
                        frame = child_frame;
                    } else {
                        if !self.to_first_from(child, child_frame)? {
                            // Empty leaf; restart stepping from it.
                        }
                        let f = self.leaf_frame()?;
                        f.set_pos(!0);
                        frame = f;
                    }
                    continue 'outer;
                }

                // Parent exhausted too; keep ascending.
                frame = parent_frame;
                // The parent latch is held shared; loop with it as the
                // current node.
                frame.set_pos(parent.data().highest_internal_pos());
                drop(parent);
            }
        }
    }

    /// Best-effort caching of a computed child entry count: needs the
    /// commit lock, an uncontended upgrade, and a clean node.
    fn maybe_cache_child_count(&self, parent: &Arc<Node>, child_pos: i32, count: u64) {
        let commit = &self.tree.db.commit_lock;
        if !commit.try_acquire_shared() {
            return;
        }
        if parent.try_upgrade() {
            if !parent.is_dirty() {
                parent.data_mut().store_child_entry_count(child_pos, count);
            }
            parent.downgrade();
        }
        commit.release_shared();
    }

    fn skip_previous_gap(
        &mut self,
        mut amount: u64,
        limit: Option<&[u8]>,
        inclusive: bool,
    ) -> Result<LockResult> {
        let (mut frame, _node) = self.leaf_shared_not_split()?;
        let frag = self.frag().clone();

        'outer: loop {
            let node = frame.node().expect("leaf latched");
            let mut pos = frame.pos();
            if pos < 0 {
                pos = !pos;
            }
            while amount > 0 && pos > 0 {
                pos -= 2;
                if !node.data().is_ghost_at(pos)? {
                    amount -= 1;
                }
            }
            if amount == 0 {
                frame.set_pos(pos);
                frame.set_not_found_key(None);
                if let Some(limit) = limit {
                    let key = node.data().key_at(pos, &frag)?;
                    let out = if inclusive {
                        key.as_slice() < limit
                    } else {
                        key.as_slice() <= limit
                    };
                    if out {
                        node.release_shared();
                        self.reset();
                        return Ok(LockResult::Unowned);
                    }
                }
                self.key = Some(node.data().key_at(pos, &frag)?);
                self.key_hash = 0;
                if let Some(result) = self.try_copy_current()? {
                    if self.value != CursorValue::Absent {
                        return Ok(result);
                    }
                } else if let Some(result) = self.lock_and_copy_if_exists()? {
                    return Ok(result);
                }
                amount = 1;
                let (f, _n) = self.leaf_shared_not_split()?;
                frame = f;
                continue 'outer;
            }

            frame.set_pos(0);
            loop {
                let node = frame.node().expect("latched");
                let Some(parent_frame) = frame.parent() else {
                    node.release_shared();
                    let n = frame.node().expect("still bound");
                    n.acquire_exclusive();
                    frame.unbind();
                    n.release_exclusive();
                    self.leaf = None;
                    self.key = None;
                    self.key_hash = 0;
                    self.value = CursorValue::Absent;
                    return Ok(LockResult::Unowned);
                };

                let parent = match parent_frame.try_acquire_shared() {
                    Some(p) => {
                        node.release_shared();
                        if p.data().split.is_some() {
                            self.finish_split_shared(&parent_frame, p)?
                        } else {
                            p
                        }
                    }
                    None => {
                        node.release_shared();
                        let p = parent_frame.acquire_shared();
                        if p.data().split.is_some() {
                            self.finish_split_shared(&parent_frame, p)?
                        } else {
                            p
                        }
                    }
                };
                {
                    let n = frame.node().expect("still bound");
                    n.acquire_exclusive();
                    frame.unbind();
                    n.release_exclusive();
                }

                let mut child_pos = parent_frame.pos() - 2;
                while child_pos >= 0 {
                    if let Some(limit) = limit {
                        // Upper bound of this subtree is the separator to
                        // its right.
                        if child_pos + 2 <= parent.data().highest_internal_pos() {
                            let bound = parent.data().key_at(child_pos, &frag)?;
                            let out = if inclusive {
                                bound.as_slice() < limit
                            } else {
                                bound.as_slice() <= limit
                            };
                            if out {
                                parent.release_shared();
                                self.reset();
                                return Ok(LockResult::Unowned);
                            }
                        }
                    }

                    if parent.data().is_bottom_internal() {
                        if let Some(count) = parent.data().cached_child_entry_count(child_pos) {
                            if count < amount {
                                amount -= count;
                                parent_frame.set_pos(child_pos);
                                child_pos -= 2;
                                continue;
                            }
                        } else {
                            let child = self.latch_child_retain_parent(&parent, child_pos)?;
                            let count = child.data().count_non_ghost_keys()?;
                            self.maybe_cache_child_count(&parent, child_pos, count);
                            if count < amount {
                                child.release_shared();
                                amount -= count;
                                parent_frame.set_pos(child_pos);
                                child_pos -= 2;
                                continue;
                            }
                            parent_frame.set_pos(child_pos);
                            parent.release_shared();
                            let child_frame = CursorFrame::new(Some(parent_frame));
                            let end = child.data().highest_leaf_pos();
                            child_frame.bind(&child, !(end + 2));
                            self.leaf = Some(Arc::clone(&child_frame));
                            frame = child_frame;
                            continue 'outer;
                        }
                    }

                    parent_frame.set_pos(child_pos);
                    let child = self.latch_to_child(&parent, child_pos)?;
                    let child_frame = CursorFrame::new(Some(parent_frame));
                    if child.data().is_leaf() {
                        let end = child.data().highest_leaf_pos();
                        child_frame.bind(&child, !(end + 2));
                        self.leaf = Some(Arc::clone(&child_frame));
                        frame = child_frame;
                    } else {
                        self.to_last_from(child, child_frame)?;
                        let f = self.leaf_frame()?;
                        let n = f.node().expect("latched");
                        let end = n.data().highest_leaf_pos();
                        f.set_pos(!(end + 2));
                        frame = f;
                    }
                    continue 'outer;
                }

                frame = parent_frame;
                frame.set_pos(0);
                drop(parent);
            }
        }
    }

    // --- random ---

    /// Positions at a pseudo-random non-ghost entry within
    /// `[low_key, high_key)`. Unowned with a reset cursor when the range
    /// is empty or only ghosts remain.
    pub fn random(&mut self, low_key: Option<&[u8]>, high_key: Option<&[u8]>) -> Result<LockResult> {
        if let (Some(low), Some(high)) = (low_key, high_key) {
            ensure!(low < high, "random range is empty");
        }
        let frag = self.frag().clone();
        let mut rng = rand::thread_rng();

        for _ in 0..64 {
            self.reset();
            let mut node = self.tree.latch_root_shared();
            let mut frame = CursorFrame::new(None);

            loop {
                frame.bind(&node, 0);
                if node.data().split.is_some() {
                    node = self.finish_split_shared(&frame, node)?;
                }
                if node.data().is_leaf() {
                    break;
                }
                let child_pos = Self::random_position(&mut rng, node.data(), low_key, high_key, &frag)?;
                frame.set_pos(child_pos);
                let child = self.latch_to_child(&node, child_pos)?;
                frame = CursorFrame::new(Some(frame));
                node = child;
            }

            let low_pos = match low_key {
                None => 0,
                Some(k) => {
                    let p = node.data().binary_search(k, &frag)?;
                    if p < 0 {
                        !p
                    } else {
                        p
                    }
                }
            };
            let high_pos = match high_key {
                None => node.data().highest_leaf_pos(),
                Some(k) => {
                    let p = node.data().binary_search(k, &frag)?;
                    if p < 0 {
                        !p - 2
                    } else {
                        p - 2
                    }
                }
            };

            if !node.data().has_keys()
                || high_pos < low_pos
                || low_pos > node.data().highest_leaf_pos()
            {
                node.release_shared();
                self.cleanup_frames(frame);
                self.leaf = None;
                if self.is_range_empty(low_key, high_key)? {
                    self.reset();
                    return Ok(LockResult::Unowned);
                }
                continue;
            }

            let slots = ((high_pos - low_pos) >> 1) + 1;
            let pos = low_pos + 2 * rng.gen_range(0..slots);
            frame.set_pos(pos);
            self.leaf = Some(Arc::clone(&frame));
            self.key = Some(node.data().key_at(pos, &frag)?);
            self.key_hash = 0;

            if let Some(result) = self.try_copy_current()? {
                if self.value != CursorValue::Absent {
                    return Ok(result);
                }
            } else if let Some(result) = self.lock_and_copy_if_exists()? {
                return Ok(result);
            }

            // Ghost: advance or retreat with a coin flip, staying in the
            // range.
            let result = if rng.gen_bool(0.5) {
                self.next()?
            } else {
                self.previous()?
            };
            if result.is_held() || self.key.is_some() {
                let in_range = match (&self.key, low_key, high_key) {
                    (Some(k), low, high) => {
                        low.map_or(true, |l| k.as_slice() >= l)
                            && high.map_or(true, |h| k.as_slice() < h)
                    }
                    (None, _, _) => false,
                };
                if in_range && self.value != CursorValue::Absent {
                    return Ok(result);
                }
            }
        }

        self.reset();
        Ok(LockResult::Unowned)
    }

    fn random_position(
        rng: &mut impl Rng,
        node: &NodeInner,
        low_key: Option<&[u8]>,
        high_key: Option<&[u8]>,
        frag: &FragmentStore,
    ) -> Result<i32> {
        let low_pos = match low_key {
            None => 0,
            Some(k) => NodeInner::internal_child_pos(node.binary_search(k, frag)?),
        };
        let high_pos = match high_key {
            None => node.highest_internal_pos(),
            Some(k) => NodeInner::internal_child_pos(node.binary_search(k, frag)?),
        };
        if high_pos <= low_pos {
            return Ok(low_pos);
        }
        let slots = ((high_pos - low_pos) >> 1) + 1;
        Ok(low_pos + 2 * rng.gen_range(0..slots))
    }

    /// True when no key exists in `[low, high)`. Ghosts count as present;
    /// the sampling loop in `random` deals with them.
    fn is_range_empty(&self, low_key: Option<&[u8]>, high_key: Option<&[u8]>) -> Result<bool> {
        let mut probe = Cursor::new(Arc::clone(&self.tree), None);
        probe.autoload(false);

        // Position at the first key >= low, without any locking.
        match low_key {
            Some(low) => {
                probe.find_internal(low, FindVariant::NoLock)?;
            }
            None => {
                let root = probe.tree.latch_root_shared();
                let frame = CursorFrame::new(None);
                probe.to_first_from(root, frame)?;
                let frame = probe.leaf_frame()?;
                let node = frame.node().expect("leaf latched");
                node.release_shared();
            }
        }

        let (frame, node) = probe.leaf_shared_not_split()?;
        if frame.pos() < 0 || !node.data().has_keys() {
            if !probe.to_next(frame)? {
                probe.reset();
                return Ok(true);
            }
            let f = probe.leaf_frame()?;
            let n = f.node().expect("leaf latched");
            n.release_shared();
        } else {
            node.release_shared();
        }

        let (frame, node) = probe.leaf_shared_not_split()?;
        let pos = frame.pos();
        if pos < 0 {
            node.release_shared();
            probe.reset();
            return Ok(true);
        }
        let key = node.data().key_at(pos, probe.frag())?;
        node.release_shared();
        probe.reset();
        Ok(match high_key {
            Some(high) => key.as_slice() >= high,
            None => false,
        })
    }

    /// Samples a leaf biased toward cold (uncached) subtrees and returns
    /// its highest key. Used to drive cache-pressure experiments.
    pub fn random_node(
        &mut self,
        low_key: Option<&[u8]>,
        high_key: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        let frag = self.frag().clone();
        let mut rng = rand::thread_rng();
        self.reset();

        let mut node = self.tree.latch_root_shared();
        loop {
            if node.data().split.is_some() {
                // Sampling does not finish splits; give up quietly.
                node.release_shared();
                return Ok(None);
            }
            if node.data().is_leaf() {
                let highest = node.data().highest_leaf_pos();
                let key = if highest < 0 {
                    None
                } else {
                    Some(node.data().key_at(highest, &frag)?)
                };
                node.release_shared();
                return Ok(key);
            }

            // Re-roll up to twice when the chosen child is already cached,
            // biasing the walk toward cold subtrees. Only bottom-internal
            // nodes get a sequential third try over their leaves; higher
            // levels accept the second roll as-is.
            let bottom = node.data().is_bottom_internal();
            let attempts = if bottom { 3 } else { 2 };
            let mut chosen = None;
            for attempt in 0..attempts {
                let child_pos = if bottom && attempt == 2 {
                    // Final attempt: first uncached leaf, else slot 0.
                    let mut pick = 0;
                    let mut pos = 0;
                    while pos <= node.data().highest_internal_pos() {
                        if self
                            .tree
                            .db
                            .cache
                            .node_map_get(node.data().child_id_at(pos))
                            .is_none()
                        {
                            pick = pos;
                            break;
                        }
                        pos += 2;
                    }
                    pick
                } else {
                    Self::random_position(&mut rng, node.data(), low_key, high_key, &frag)?
                };
                let child_id = node.data().child_id_at(child_pos);
                let cached = self.tree.db.cache.node_map_get(child_id).is_some();
                if !cached || attempt == attempts - 1 {
                    chosen = Some(child_pos);
                    break;
                }
            }
            let child_pos = chosen.expect("a child is always chosen");
            let child = self.latch_to_child(&node, child_pos)?;
            node = child;
        }
    }

    // --- write path ---

    /// Stores a value at the current key; `None` deletes. The exclusive
    /// key lock is acquired per the transaction (or ephemerally for
    /// autocommit) before the leaf is latched.
    pub fn store(&mut self, value: Option<&[u8]>) -> Result<()> {
        self.tree.db.check_closed()?;
        let key = self
            .key
            .clone()
            .ok_or(CursorStateError("cursor has no key"))?;
        let hash = self.current_key_hash();
        let tree_id = self.tree.id();
        let lock_id = self.lock_id();
        let db = Arc::clone(&self.tree.db);

        let ephemeral = match &self.txn {
            Some(txn) if txn.lock_mode() == LockMode::Unsafe => false,
            Some(txn) => {
                db.locks.lock(
                    txn.id(),
                    LockType::Exclusive,
                    tree_id,
                    &key,
                    hash,
                    self.lock_timeout(),
                )?;
                txn.register_lock(tree_id, &key, hash);
                false
            }
            None => {
                db.locks.lock(
                    lock_id,
                    LockType::Exclusive,
                    tree_id,
                    &key,
                    hash,
                    self.lock_timeout(),
                )?;
                true
            }
        };

        let result = self.store_locked(&key, value);
        if ephemeral {
            db.locks.unlock(lock_id, tree_id, &key, hash);
        }
        result
    }

    /// Store with the key lock already held by the caller.
    fn store_locked(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let (frame, node) = self.leaf_exclusive()?;
        self.store_into_leaf(frame, node, key, value)
    }

    /// The core §store protocol: commit-lock dance, dirty path, redo,
    /// mutation, cursor fixups, split finishing or merging. The leaf is
    /// exclusively latched on entry; all latches are released on return.
    fn store_into_leaf(
        &mut self,
        leaf: Arc<CursorFrame>,
        node: Arc<Node>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        let db = Arc::clone(&self.tree.db);
        let commit = &db.commit_lock;
        let mut node = node;
        if !commit.try_acquire_shared() {
            node.release_exclusive();
            commit.acquire_shared();
            node = leaf.acquire_exclusive();
        }

        let result = self.store_under_commit_lock(&leaf, node, key, value);
        commit.release_shared();

        match result {
            Ok(commit_pos) => {
                self.value = match value {
                    Some(v) => CursorValue::Value(v.to_vec()),
                    None => CursorValue::Absent,
                };
                if commit_pos != 0 {
                    // Await durability outside the commit lock and latch.
                    self.tree.txn_commit_sync(commit_pos)?;
                }
                Ok(())
            }
            Err(e) => {
                // A mutation failure under the commit lock is corrupting.
                self.tree.db.close_on_failure(&e);
                Err(e)
            }
        }
    }

    fn store_under_commit_lock(
        &mut self,
        leaf: &Arc<CursorFrame>,
        node: Arc<Node>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<u64> {
        let frag = self.frag().clone();
        let tree = Arc::clone(&self.tree);
        let tree_id = tree.id();
        let hash = self.current_key_hash();

        let mut commit_pos = 0u64;

        // Re-check the found state: the world may have moved while the
        // commit lock was contended.
        if value.is_none() && leaf.pos() < 0 {
            node.release_exclusive();
            return Ok(0);
        }

        // Dirty the leaf and its path; finishes any pending split.
        let node = tree.not_split_dirty(leaf, node)?;
        let pos = leaf.pos();

        let txn = self.txn.clone();
        let no_redo = matches!(
            txn.as_ref().map(|t| t.durability_mode()),
            Some(crate::txn::DurabilityMode::NoRedo)
        ) || self.tree.db.redo.durability() == crate::txn::DurabilityMode::NoRedo;

        // From here on, an error releases the latch before propagating.
        macro_rules! try_latched {
            ($node:expr, $e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(e) => {
                        $node.release_exclusive();
                        return Err(e);
                    }
                }
            };
        }

        match (value, pos >= 0) {
            (None, false) => {
                // Deleting a missing entry: nothing to do.
                node.release_exclusive();
            }
            (None, true) => {
                match &txn {
                    None => {
                        commit_pos = try_latched!(node, tree.redo_store(key, None));
                    }
                    Some(t) if t.lock_mode() != LockMode::Unsafe => {
                        // Transactional delete leaves a ghost; the key
                        // lock is retained until commit.
                        if let Some(old) = try_latched!(node, node.data().leaf_value_at(pos, &frag))
                        {
                            t.push_undelete(tree_id, key, old);
                        }
                        try_latched!(node, node.data_mut().make_ghost_at(pos, &frag));
                        t.register_ghost(tree_id, key, hash);
                        if !no_redo {
                            try_latched!(
                                node,
                                self.tree.db.redo.txn_store(t.id(), tree_id, key, None)
                            );
                        }
                        // The ghost keeps the entry, so no cursors need
                        // fixing and no merge is attempted.
                        node.release_exclusive();
                        return Ok(0);
                    }
                    Some(_) => {
                        if !no_redo {
                            commit_pos = try_latched!(node, tree.redo_store_no_lock(key, None));
                        }
                    }
                }

                try_latched!(node, node.data_mut().delete_leaf_entry(pos, &frag));
                leaf.set_pos(!pos);
                leaf.set_not_found_key(Some(key.to_vec()));
                Self::fix_frames_after_delete(&node, leaf, pos, key);

                if node.data().should_leaf_merge() {
                    self.merge_leaf(leaf, node)?;
                } else {
                    node.release_exclusive();
                }
            }
            (Some(v), true) => {
                match &txn {
                    None => {
                        commit_pos = try_latched!(node, tree.redo_store(key, Some(v)));
                    }
                    Some(t) if t.lock_mode() != LockMode::Unsafe => {
                        if let Some(old) = try_latched!(node, node.data().leaf_value_at(pos, &frag))
                        {
                            t.push_unupdate(tree_id, key, old);
                        } else {
                            // Updating a ghost resurrects an insert.
                            t.push_uninsert(tree_id, key);
                        }
                        if !no_redo {
                            try_latched!(
                                node,
                                self.tree.db.redo.txn_store(t.id(), tree_id, key, Some(v))
                            );
                        }
                    }
                    Some(_) => {
                        if !no_redo {
                            commit_pos = try_latched!(node, tree.redo_store_no_lock(key, Some(v)));
                        }
                    }
                }

                let plan = try_latched!(node, node.data_mut().update_leaf_value(pos, v, &frag));
                if let Some(plan) = plan {
                    try_latched!(node, tree.install_split(&node, plan));
                }

                if node.data().split.is_some() {
                    let node = tree.finish_split(leaf, node)?;
                    node.release_exclusive();
                } else if node.data().should_leaf_merge() {
                    self.merge_leaf(leaf, node)?;
                } else {
                    node.release_exclusive();
                }
            }
            (Some(v), false) => {
                let ins = !pos;
                match &txn {
                    None => {
                        commit_pos = try_latched!(node, tree.redo_store(key, Some(v)));
                    }
                    Some(t) if t.lock_mode() != LockMode::Unsafe => {
                        t.push_uninsert(tree_id, key);
                        if !no_redo {
                            try_latched!(
                                node,
                                self.tree.db.redo.txn_store(t.id(), tree_id, key, Some(v))
                            );
                        }
                    }
                    Some(_) => {
                        if !no_redo {
                            commit_pos = try_latched!(node, tree.redo_store_no_lock(key, Some(v)));
                        }
                    }
                }

                let plan = try_latched!(node, node.data_mut().insert_leaf_entry(ins, key, v, &frag));
                if let Some(plan) = plan {
                    try_latched!(node, tree.install_split(&node, plan));
                }

                leaf.set_pos(ins);
                leaf.set_not_found_key(None);
                Self::fix_frames_after_insert(&node, leaf, ins, key);

                if node.data().split.is_some() {
                    let node = tree.finish_split(leaf, node)?;
                    node.release_exclusive();
                } else {
                    node.release_exclusive();
                }
            }
        }

        Ok(commit_pos)
    }

    /// Fixes every other frame bound to the node after deleting the entry
    /// at `pos`: same position becomes its complement with the key
    /// retained, higher positions shift down, complements past the slot
    /// shift too.
    fn fix_frames_after_delete(node: &Arc<Node>, own: &Arc<CursorFrame>, pos: i32, key: &[u8]) {
        let new_pos = !pos;
        for frame in node.bound_frames() {
            if Arc::ptr_eq(&frame, own) {
                continue;
            }
            let frame_pos = frame.pos();
            if frame_pos == pos {
                frame.set_pos(new_pos);
                frame.set_not_found_key(Some(key.to_vec()));
            } else if frame_pos > pos {
                frame.set_pos(frame_pos - 2);
            } else if frame_pos < new_pos {
                // Complement whose insertion point was past the entry.
                frame.set_pos(frame_pos + 2);
            }
        }
    }

    /// Fixes every other frame bound to the node after inserting at
    /// `pos`: not-found frames at the same slot promote to found when the
    /// keys match, or stay complements shifted by the insertion.
    fn fix_frames_after_insert(node: &Arc<Node>, own: &Arc<CursorFrame>, pos: i32, key: &[u8]) {
        for frame in node.bound_frames() {
            if Arc::ptr_eq(&frame, own) {
                continue;
            }
            let frame_pos = frame.pos();
            if frame_pos >= 0 {
                if frame_pos >= pos {
                    frame.set_pos(frame_pos + 2);
                }
            } else {
                let ins = !frame_pos;
                match ins.cmp(&pos) {
                    Ordering::Less => {}
                    Ordering::Greater => frame.set_pos(frame_pos - 2),
                    Ordering::Equal => match frame.not_found_key() {
                        Some(nfk) if nfk.as_slice() == key => {
                            frame.set_pos(pos);
                            frame.set_not_found_key(None);
                        }
                        Some(nfk) if nfk.as_slice() > key => frame.set_pos(frame_pos - 2),
                        _ => {}
                    },
                }
            }
        }
    }

    // --- merges ---

    /// Latches parent, left sibling, self, and right sibling in strict
    /// left-to-right order, finishing any sibling split and restarting.
    /// Returns None when the merge was abandoned (all latches released).
    #[allow(clippy::type_complexity)]
    fn latch_merge_trio(
        &mut self,
        frame: &Arc<CursorFrame>,
        parent_frame: &Arc<CursorFrame>,
        parent: Arc<Node>,
    ) -> Result<Option<(Arc<Node>, Option<Arc<Node>>, Arc<Node>, Option<Arc<Node>>, i32)>> {
        let tree = Arc::clone(&self.tree);
        let mut parent = parent;
        loop {
            if parent.data().split.is_some() {
                parent = tree.finish_split(parent_frame, parent)?;
            }
            if !parent.data().has_keys() {
                parent.release_exclusive();
                return Ok(None);
            }

            let pos = parent_frame.pos();
            let left = if pos == 0 {
                None
            } else {
                let left = self.latch_child_retain_parent_ex(&parent, pos - 2)?;
                if left.data().split.is_some() {
                    tree.insert_split_child_ref(&parent, pos - 2, &left)?;
                    left.release_exclusive();
                    continue;
                }
                Some(left)
            };

            let node = frame.acquire_exclusive();

            // Double check that the node still wants to merge.
            let avail = node.data().available_bytes();
            if !node.data().should_merge(avail) {
                if let Some(left) = left {
                    left.release_exclusive();
                }
                node.release_exclusive();
                parent.release_exclusive();
                return Ok(None);
            }

            let right = if pos >= parent.data().highest_internal_pos() {
                None
            } else {
                let right = match self.latch_child_retain_parent_ex(&parent, pos + 2) {
                    Ok(right) => right,
                    Err(e) => {
                        if let Some(left) = left {
                            left.release_exclusive();
                        }
                        node.release_exclusive();
                        return Err(e);
                    }
                };
                if right.data().split.is_some() {
                    if let Some(left) = left {
                        left.release_exclusive();
                    }
                    node.release_exclusive();
                    tree.insert_split_child_ref(&parent, pos + 2, &right)?;
                    right.release_exclusive();
                    continue;
                }
                Some(right)
            };

            return Ok(Some((parent, left, node, right, pos)));
        }
    }

    /// Merge protocol for an underfull leaf. Caller holds the exclusive
    /// leaf latch and the shared commit lock; everything is released.
    fn merge_leaf(&mut self, leaf: &Arc<CursorFrame>, node: Arc<Node>) -> Result<()> {
        let tree = Arc::clone(&self.tree);
        let frag = self.frag().clone();

        let Some(parent_frame) = leaf.parent() else {
            // Root node cannot merge into anything.
            node.release_exclusive();
            return Ok(());
        };
        node.release_exclusive();
        let parent = parent_frame.acquire_exclusive();

        let Some((parent, left, node, right, pos)) =
            self.latch_merge_trio(leaf, &parent_frame, parent)?
        else {
            return Ok(());
        };

        // Choose the adjacent pair with the most combined free space.
        let left_avail = left.as_ref().map(|n| n.data().available_bytes());
        let right_avail = right.as_ref().map(|n| n.data().available_bytes());

        let (left_node, right_node, left_pos) = match (left, right) {
            (None, None) => {
                node.release_exclusive();
                parent.release_exclusive();
                return Ok(());
            }
            (Some(l), None) => (l, node, pos - 2),
            (None, Some(r)) => (node, r, pos),
            (Some(l), Some(r)) => {
                if left_avail.unwrap_or(0) < right_avail.unwrap_or(0) {
                    l.release_exclusive();
                    (node, r, pos)
                } else {
                    r.release_exclusive();
                    (l, node, pos - 2)
                }
            }
        };

        // Merge when the right node's live content fits in the left.
        let right_live = right_node.data().live_entry_bytes();
        let merged = right_live <= left_node.data().available_bytes();
        if merged {
            if self.tree.db.cache.should_mark_dirty(&left_node) && self.tree.db.cache.mark_dirty(&left_node)? {
                parent.data_mut().update_child_ref_id(left_pos, left_node.id());
            }

            let left_high = left_node.data().highest_leaf_pos();
            left_node.data_mut().move_leaf_from_right(right_node.data())?;

            for frame in right_node.bound_frames() {
                let fp = frame.pos();
                if fp >= 0 {
                    frame.rebind(&left_node, left_high + 2 + fp);
                } else {
                    frame.rebind(&left_node, !(left_high + 2 + !fp));
                }
            }

            parent.data_mut().delete_right_child_ref(left_pos + 2, &frag)?;
            for frame in parent.bound_frames() {
                let fp = frame.pos();
                if fp == left_pos + 2 {
                    frame.set_pos(left_pos);
                } else if fp > left_pos + 2 {
                    frame.set_pos(fp - 2);
                }
            }

            tree.db.cache.delete_node(&right_node);
            right_node.release_exclusive();
        }

        let right_for_parent = if merged { None } else { Some(right_node) };
        self.merge_internal(&parent_frame, parent, left_node, right_for_parent)
    }

    /// Merge protocol one level up, iterated rather than recursed; bounded
    /// by tree height.
    fn merge_internal(
        &mut self,
        frame: &Arc<CursorFrame>,
        node: Arc<Node>,
        left_child: Arc<Node>,
        right_child: Option<Arc<Node>>,
    ) -> Result<()> {
        let tree = Arc::clone(&self.tree);
        let frag = self.frag().clone();

        let mut frame = Arc::clone(frame);
        let mut node = node;
        let mut left_child = left_child;
        let mut right_child = right_child;

        loop {
            if node.data().should_internal_merge()
                && !node.data().has_keys()
                && Arc::ptr_eq(&node, tree.root())
            {
                // Delete the empty root node, eliminating a tree level.
                debug_assert!(right_child.is_none());
                return tree.root_delete(left_child);
            }

            let continue_up =
                node.data().should_internal_merge() && !Arc::ptr_eq(&node, tree.root());

            if let Some(right) = right_child.take() {
                right.release_exclusive();
            }
            left_child.release_exclusive();

            if !continue_up {
                node.release_exclusive();
                return Ok(());
            }

            let Some(parent_frame) = frame.parent() else {
                node.release_exclusive();
                return Ok(());
            };
            node.release_exclusive();
            let parent = parent_frame.acquire_exclusive();

            let Some((parent, left, this, right, pos)) =
                self.latch_merge_trio(&frame, &parent_frame, parent)?
            else {
                return Ok(());
            };

            let left_avail = left.as_ref().map(|n| n.data().available_bytes());
            let right_avail = right.as_ref().map(|n| n.data().available_bytes());

            let (left_node, right_node, left_pos) = match (left, right) {
                (None, None) => {
                    this.release_exclusive();
                    parent.release_exclusive();
                    return Ok(());
                }
                (Some(l), None) => (l, this, pos - 2),
                (None, Some(r)) => (this, r, pos),
                (Some(l), Some(r)) => {
                    if left_avail.unwrap_or(0) < right_avail.unwrap_or(0) {
                        l.release_exclusive();
                        (this, r, pos)
                    } else {
                        r.release_exclusive();
                        (l, this, pos - 2)
                    }
                }
            };

            // The parent separator moves down between the merged halves,
            // so it counts toward the fit.
            let separator_full = parent.data().key_at(left_pos, &frag)?;
            let separator =
                crate::tree::split::SeparatorKey::for_parent(separator_full, self.tree.db.cache.page_size(), &frag)?;
            let right_live = right_node.data().live_entry_bytes();
            let sep_len = separator.encoded_len() + 8 + 2;
            let merged = right_live + sep_len <= left_node.data().available_bytes();

            if merged {
                if self.tree.db.cache.should_mark_dirty(&left_node)
                    && self.tree.db.cache.mark_dirty(&left_node)?
                {
                    parent.data_mut().update_child_ref_id(left_pos, left_node.id());
                }

                let left_high = left_node.data().highest_internal_pos();
                left_node
                    .data_mut()
                    .move_internal_from_right(right_node.data(), &separator)?;

                for f in right_node.bound_frames() {
                    let fp = f.pos();
                    f.rebind(&left_node, left_high + 2 + fp);
                }

                parent.data_mut().delete_right_child_ref(left_pos + 2, &frag)?;
                for f in parent.bound_frames() {
                    let fp = f.pos();
                    if fp == left_pos + 2 {
                        f.set_pos(left_pos);
                    } else if fp > left_pos + 2 {
                        f.set_pos(fp - 2);
                    }
                }

                tree.db.cache.delete_node(&right_node);
                right_node.release_exclusive();

                frame = parent_frame;
                node = parent;
                left_child = left_node;
                right_child = None;
            } else {
                frame = parent_frame;
                node = parent;
                left_child = left_node;
                right_child = Some(right_node);
            }
        }
    }

    // --- compound operations ---

    /// Atomically stores and returns the previous value. The exclusive
    /// lock is acquired before the descent.
    pub fn find_and_store(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        self.tree.db.check_closed()?;
        let tree_id = self.tree.id();
        let hash = key_hash(tree_id, key);
        let db = Arc::clone(&self.tree.db);
        let lock_id = match &self.txn {
            Some(txn) if !txn.is_bogus() => txn.id(),
            _ => self.locker_id,
        };
        let bogus = matches!(&self.txn, Some(t) if t.is_bogus());

        if !bogus {
            db.locks.lock(
                lock_id,
                LockType::Exclusive,
                tree_id,
                key,
                hash,
                self.lock_timeout(),
            )?;
            if let Some(txn) = &self.txn {
                txn.register_lock(tree_id, key, hash);
            }
        }

        let result = (|| {
            self.find_internal(key, FindVariant::NoLock)?;
            self.key_hash = hash;
            let (frame, node) = self.leaf_exclusive_not_split()?;
            let pos = frame.pos();
            let old = if pos >= 0 {
                node.data().leaf_value_at(pos, self.frag())?
            } else {
                None
            };
            self.store_into_leaf(frame, node, key, value)?;
            Ok(old)
        })();

        if self.txn.is_none() {
            db.locks.unlock(lock_id, tree_id, key, hash);
        }
        result
    }

    /// Conditional store: the condition is evaluated at the moment the
    /// lock is held. Returns whether the store was applied; on a failed
    /// precondition the lock acquired for this call is released and the
    /// cursor is reset.
    pub fn find_and_modify(
        &mut self,
        key: &[u8],
        condition: ValueCondition,
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.tree.db.check_closed()?;
        let tree_id = self.tree.id();
        let hash = key_hash(tree_id, key);
        let db = Arc::clone(&self.tree.db);
        let lock_id = match &self.txn {
            Some(txn) if !txn.is_bogus() => txn.id(),
            _ => self.locker_id,
        };
        let bogus = matches!(&self.txn, Some(t) if t.is_bogus());

        let pre_owned = if bogus {
            LockResult::OwnedExclusive
        } else {
            db.locks.check_owned(lock_id, tree_id, key, hash)
        };
        if !bogus {
            db.locks.lock(
                lock_id,
                LockType::Exclusive,
                tree_id,
                key,
                hash,
                self.lock_timeout(),
            )?;
        }

        self.find_internal(key, FindVariant::NoLock)?;
        self.key_hash = hash;
        let (frame, node) = self.leaf_exclusive_not_split()?;
        let pos = frame.pos();
        let current = if pos >= 0 {
            node.data().leaf_value_at(pos, self.frag())?
        } else {
            None
        };

        let satisfied = match &condition {
            ValueCondition::Insert => current.is_none(),
            ValueCondition::Replace => current.is_some(),
            ValueCondition::Equals(expected) => current == *expected,
        };

        if !satisfied {
            node.release_exclusive();
            if !bogus {
                if pre_owned == LockResult::Unowned {
                    db.locks.unlock(lock_id, tree_id, key, hash);
                } else if pre_owned == LockResult::OwnedUpgradable {
                    db.locks.unlock_to_upgradable(lock_id, tree_id, key, hash);
                }
            }
            self.reset();
            return Ok(false);
        }

        if let Some(txn) = &self.txn {
            if !bogus {
                txn.register_lock(tree_id, key, hash);
            }
        }

        self.store_into_leaf(frame, node, key, value)?;
        if self.txn.is_none() {
            db.locks.unlock(lock_id, tree_id, key, hash);
        }
        Ok(true)
    }

    /// Physically removes a ghost at commit time. The committing
    /// transaction still holds the key lock; no redo or undo is produced.
    pub(crate) fn delete_ghost(&mut self, key: &[u8]) -> Result<bool> {
        self.tree.db.check_closed()?;
        self.find_internal(key, FindVariant::NoLock)?;
        let (frame, node) = self.leaf_exclusive_not_split()?;
        let pos = frame.pos();
        if pos < 0 || !node.data().is_ghost_at(pos)? {
            node.release_exclusive();
            self.reset();
            return Ok(false);
        }

        let db = Arc::clone(&self.tree.db);
        let commit = &db.commit_lock;
        let mut node = node;
        if !commit.try_acquire_shared() {
            node.release_exclusive();
            commit.acquire_shared();
            node = frame.acquire_exclusive();
        }

        let result = (|| {
            let node = self.tree.not_split_dirty(&frame, node)?;
            let pos = frame.pos();
            if pos < 0 || !node.data().is_ghost_at(pos)? {
                node.release_exclusive();
                return Ok(false);
            }
            let frag = self.frag().clone();
            node.data_mut().delete_leaf_entry(pos, &frag)?;
            frame.set_pos(!pos);
            frame.set_not_found_key(Some(key.to_vec()));
            Self::fix_frames_after_delete(&node, &frame, pos, key);
            if node.data().should_leaf_merge() {
                self.merge_leaf(&frame, node)?;
            } else {
                node.release_exclusive();
            }
            Ok(true)
        })();
        commit.release_shared();
        self.reset();
        result
    }

    // --- bulk operations ---

    /// Non-transactional bulk clear: repeatedly deletes the first leaf
    /// entry, cascading node deletions up the left edge. The tree is left
    /// as an empty root leaf.
    pub fn delete_all(&mut self) -> Result<()> {
        self.tree.db.check_closed()?;
        self.autoload(false);
        let frag = self.frag().clone();
        let tree = Arc::clone(&self.tree);

        loop {
            if self.leaf.is_none() {
                let root = tree.latch_root_shared();
                let frame = CursorFrame::new(None);
                self.to_first_from(root, frame)?;
                let (_f, n) = {
                    let f = self.leaf_frame()?;
                    let n = f.node().expect("latched");
                    (f, n)
                };
                n.release_shared();
            }

            let frame = self.leaf_frame()?;
            let mut node = frame.acquire_exclusive();

            let commit = &tree.db.commit_lock;
            if !commit.try_acquire_shared() {
                node.release_exclusive();
                commit.acquire_shared();
                node = frame.acquire_exclusive();
            }

            let step = (|| -> Result<bool> {
                let node = tree.not_split_dirty(&frame, node)?;
                if node.data().has_keys() {
                    let deleted_key = node.data().key_at(0, &frag)?;
                    node.data_mut().delete_leaf_entry(0, &frag)?;
                    Self::fix_frames_after_delete(&node, &frame, 0, &deleted_key);
                    frame.set_pos(0);
                    frame.set_not_found_key(None);
                    node.release_exclusive();
                    return Ok(true);
                }
                // Empty node: remove it from the tree, or stop at the
                // root.
                self.delete_node_cascade(&frame, node)
            })();
            commit.release_shared();

            match step {
                Ok(true) => continue,
                Ok(false) => {
                    self.reset();
                    return Ok(());
                }
                Err(e) => {
                    self.tree.db.close_on_failure(&e);
                    return Err(e);
                }
            }
        }
    }

    /// Removes the empty node bound to `frame` from the tree, deleting
    /// childless ancestors. Returns false when the root was reached (the
    /// clear is complete). Caller holds the exclusive latch and the
    /// shared commit lock; the cursor is left unpositioned so the outer
    /// loop re-descends outside the commit lock.
    fn delete_node_cascade(&mut self, frame: &Arc<CursorFrame>, node: Arc<Node>) -> Result<bool> {
        let tree = Arc::clone(&self.tree);
        let frag = self.frag().clone();

        let Some(parent_frame) = frame.parent() else {
            // Root: leave it as an empty leaf, prepared for reuse.
            if node.data().is_internal() {
                node.data_mut().init_leaf(
                    crate::tree::node::LOW_EXTREMITY | crate::tree::node::HIGH_EXTREMITY,
                );
            }
            frame.unbind();
            node.release_exclusive();
            self.leaf = None;
            return Ok(false);
        };
        node.release_exclusive();

        let parent = parent_frame.acquire_exclusive();
        let parent = tree.not_split_dirty(&parent_frame, parent)?;
        let node = frame.acquire_exclusive();

        if node.data().has_keys() {
            // A concurrent insert revived it.
            node.release_exclusive();
            parent.release_exclusive();
            self.unwind_stack_from(Arc::clone(frame));
            return Ok(true);
        }

        // Strand any foreign frames on an orphan empty leaf; their next
        // operation re-validates through the parent.
        let orphan = Arc::new(Node::new(
            self.tree.db.cache.page_size(),
            0,
            crate::store::CachedState::Clean,
        ));
        orphan.acquire_exclusive();
        orphan.data_mut().init_leaf(0);
        for f in node.bound_frames() {
            if Arc::ptr_eq(&f, frame) {
                f.unbind();
            } else {
                let pos = f.pos();
                f.rebind(&orphan, pos);
            }
        }
        orphan.release_exclusive();

        tree.db.cache.delete_node(&node);
        node.release_exclusive();

        if parent.data().has_keys() {
            parent.data_mut().delete_leftmost_child_ref(&frag)?;
            for f in parent.bound_frames() {
                let fp = f.pos();
                if fp >= 2 {
                    f.set_pos(fp - 2);
                }
            }
            parent.release_exclusive();
            self.unwind_stack_from(parent_frame);
            Ok(true)
        } else {
            // Parent lost its only child: cascade.
            self.delete_node_cascade(&parent_frame, parent)
        }
    }

    /// Unbinds a frame chain starting at `from` and unpositions the
    /// cursor. No latches may be held on the chain's nodes.
    fn unwind_stack_from(&mut self, from: Arc<CursorFrame>) {
        let mut frame = Some(from);
        while let Some(f) = frame {
            frame = f.parent();
            if f.node().is_some() {
                let node = f.acquire_exclusive();
                f.unbind();
                node.release_exclusive();
            }
        }
        self.leaf = None;
    }

    /// Advances to the first entry of the next leaf node, without lock
    /// handling. Used by compaction.
    pub(crate) fn next_node(&mut self) -> Result<bool> {
        let (frame, node) = self.leaf_shared_not_split()?;
        frame.set_pos(node.data().highest_leaf_pos().max(0));
        if !self.to_next(frame)? {
            return Ok(false);
        }
        let f = self.leaf_frame()?;
        let n = f.node().expect("latched");
        n.release_shared();
        Ok(true)
    }

    /// Compaction scan: re-homes every path node and fragment page above
    /// `highest_node_id` so the file tail can be truncated. Returns false
    /// if aborted (observer veto or allocation contention).
    pub fn compact(
        &mut self,
        highest_node_id: u64,
        observer: &mut dyn CompactionObserver,
    ) -> Result<bool> {
        ensure!(highest_node_id > 0, "compaction threshold must be positive");
        self.tree.db.check_closed()?;
        let tree = Arc::clone(&self.tree);
        let frag = self.frag().clone();

        self.reset();
        let root = tree.latch_root_shared();
        let frame = CursorFrame::new(None);
        self.to_first_from(root, frame)?;
        {
            let f = self.leaf_frame()?;
            let n = f.node().expect("latched");
            n.release_shared();
        }

        loop {
            // Walk the frame stack, re-homing any node above the
            // threshold.
            let mut frames = Vec::new();
            let mut walk = Some(self.leaf_frame()?);
            while let Some(f) = walk {
                walk = f.parent();
                frames.push(f);
            }

            for f in frames.into_iter().rev() {
                let node = f.acquire_shared();
                let id = node.id();
                node.release_shared();
                if id <= highest_node_id {
                    continue;
                }

                let commit = &tree.db.commit_lock;
                commit.acquire_shared();
                let node = f.acquire_exclusive();
                let result = tree.not_split_dirty(&f, node);
                let new_id = match &result {
                    Ok(node) => {
                        let id = node.id();
                        node.release_exclusive();
                        id
                    }
                    Err(_) => 0,
                };
                commit.release_shared();
                result?;

                if new_id > highest_node_id {
                    // No lower ids available: compaction cannot make
                    // progress.
                    self.reset();
                    return Ok(false);
                }
                if !observer.node_visited(new_id) {
                    self.reset();
                    return Ok(false);
                }
            }

            // Rewrite fragment chains reaching above the threshold.
            let needs_touch = {
                let frame = self.leaf_frame()?;
                let node = frame.acquire_shared();
                let mut found = false;
                for i in 0..node.data().key_count() {
                    let pos = (i * 2) as i32;
                    if let Some((off, len)) = node.data().fragmented_value_range(pos)? {
                        let descriptor = &node.data().buf()[off..off + len];
                        if crate::tree::fragment::FragmentStore::highest_page_id(descriptor)?
                            > highest_node_id
                        {
                            found = true;
                            break;
                        }
                    }
                }
                node.release_shared();
                found
            };

            if needs_touch {
                let frame = self.leaf_frame()?;
                let commit = &tree.db.commit_lock;
                commit.acquire_shared();
                let node = frame.acquire_exclusive();
                // The leaf must be dirty so the patched descriptors reach
                // disk at the next checkpoint.
                let result = tree.not_split_dirty(&frame, node).and_then(|node| {
                    let touched = (|| -> Result<bool> {
                        for i in 0..node.data().key_count() {
                            let pos = (i * 2) as i32;
                            if let Some((off, len)) = node.data().fragmented_value_range(pos)? {
                                let buf = node.data_mut().buf_mut();
                                let mut region = buf[off..off + len].to_vec();
                                frag.touch_above(&mut region, highest_node_id)?;
                                buf[off..off + len].copy_from_slice(&region);
                                if crate::tree::fragment::FragmentStore::highest_page_id(&region)?
                                    > highest_node_id
                                {
                                    return Ok(false);
                                }
                            }
                        }
                        Ok(true)
                    })();
                    node.release_exclusive();
                    touched
                });
                commit.release_shared();
                if !result? {
                    self.reset();
                    return Ok(false);
                }
            }

            if !self.next_node()? {
                return Ok(true);
            }
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.reset();
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("key", &self.key)
            .field("positioned", &self.leaf.is_some())
            .finish()
    }
}
