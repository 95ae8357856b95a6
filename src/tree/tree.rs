//! # Tree Coordination
//!
//! The `Tree` owns the root node and coordinates structural changes:
//! finishing splits (promoting separators into parents, splitting the
//! root), collapsing the root when it empties, and keeping the dirty-path
//! invariant that makes shadow paging safe.
//!
//! ## Stable root identity
//!
//! The root `Node` object never changes for the life of the tree. A root
//! split moves the retained half into a fresh node and rewrites the root
//! page in place as an internal node over the two halves, pushing bound
//! cursor frames down one level; a root collapse copies the lone child
//! back into the root and splices child frames up. Cursor stacks therefore
//! always begin at the root and invariant checks never need to chase a
//! moving root pointer.
//!
//! ## Split finishing
//!
//! `finish_split` walks upward: latch the parent (finishing its own split
//! first), re-latch the child, and insert the separator plus new child
//! reference. The insert itself may overflow the parent, leaving a new
//! split to finish one level up; the loop runs until the path is clean,
//! bounded by tree height. All of it happens under the shared commit lock
//! so checkpointing observes no half-finished splits.

use std::sync::Arc;

use eyre::{bail, ensure, eyre, Result};

use crate::db::DbInner;
use crate::store::LatchRequest;
use crate::tree::cursor::Cursor;
use crate::tree::fragment::FragmentStore;
use crate::tree::frame::CursorFrame;
use crate::tree::node::{
    Node, SplitPlan, HIGH_EXTREMITY, LOW_EXTREMITY, TYPE_BOTTOM_INTERNAL,
};
use crate::tree::split::Split;
use crate::txn::Transaction;

/// Reports nodes visited (and re-homed) during compaction. Returning
/// false aborts the scan.
pub trait CompactionObserver {
    fn node_visited(&mut self, _id: u64) -> bool {
        true
    }
}

/// Receives verification results. `node_failed` returning false stops
/// the walk.
pub trait VerifyObserver {
    fn node_passed(&mut self, _id: u64, _height: usize, _key_count: usize) -> bool {
        true
    }

    fn node_failed(&mut self, id: u64, height: usize, message: &str) -> bool;
}

/// Collects failures; the default observer for [`Tree::verify`].
#[derive(Debug, Default)]
pub struct CollectingVerifyObserver {
    pub failures: Vec<(u64, usize, String)>,
}

impl VerifyObserver for CollectingVerifyObserver {
    fn node_failed(&mut self, id: u64, height: usize, message: &str) -> bool {
        self.failures.push((id, height, message.to_string()));
        true
    }
}

pub struct Tree {
    pub(crate) db: Arc<DbInner>,
    id: u64,
    root: Arc<Node>,
}

impl Tree {
    pub(crate) fn create(db: Arc<DbInner>, id: u64) -> Result<Arc<Tree>> {
        let root = db.cache.alloc_node()?;
        root.data_mut().init_leaf(LOW_EXTREMITY | HIGH_EXTREMITY);
        root.release_exclusive();
        Ok(Arc::new(Tree { db, id, root }))
    }

    pub(crate) fn open(db: Arc<DbInner>, id: u64, root_id: u64) -> Result<Arc<Tree>> {
        let root = db.cache.load_node(root_id, LatchRequest::Shared)?;
        root.release_shared();
        Ok(Arc::new(Tree { db, id, root }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn root(&self) -> &Arc<Node> {
        &self.root
    }

    pub(crate) fn frag(&self) -> &FragmentStore {
        &self.db.frag
    }

    /// Opens a cursor, optionally linked to a transaction. A cursor with
    /// no transaction runs in autocommit mode: writes take ephemeral
    /// exclusive locks, reads behave as read-committed.
    pub fn cursor(self: &Arc<Self>, txn: Option<Arc<Transaction>>) -> Cursor {
        Cursor::new(Arc::clone(self), txn)
    }

    pub(crate) fn latch_root_shared(&self) -> Arc<Node> {
        let root = Arc::clone(&self.root);
        root.acquire_shared();
        root
    }

    // --- redo hooks ---

    pub(crate) fn redo_store(&self, key: &[u8], value: Option<&[u8]>) -> Result<u64> {
        self.db.redo.store(self.id, key, value)
    }

    /// Redo append for lock-free (unsafe-mode) stores; same stream, no
    /// lock-manager interaction implied.
    pub(crate) fn redo_store_no_lock(&self, key: &[u8], value: Option<&[u8]>) -> Result<u64> {
        self.db.redo.store(self.id, key, value)
    }

    pub(crate) fn txn_commit_sync(&self, position: u64) -> Result<()> {
        self.db.redo.commit_sync(position)
    }

    // --- structural changes ---

    /// Attaches a split produced by a node mutator: allocates the sibling
    /// node, installs its page image, and records the split descriptor.
    /// Caller holds the node's exclusive latch and the shared commit lock.
    pub(crate) fn install_split(&self, node: &Arc<Node>, plan: SplitPlan) -> Result<()> {
        let sibling = self.db.cache.alloc_node()?;
        sibling.data_mut().install(plan.sibling_buf);
        sibling.release_exclusive();
        node.data_mut().split = Some(Split::new(plan.split_right, sibling, plan.separator));
        Ok(())
    }

    /// Finds the child position of `child_id` in the parent, trusting the
    /// frame's hint first.
    pub(crate) fn locate_child(parent: &Node, hint: i32, child_id: u64) -> Result<i32> {
        let data = parent.data();
        if hint >= 0 && hint <= data.highest_internal_pos() && data.child_id_at(hint) == child_id {
            return Ok(hint);
        }
        let mut pos = 0;
        while pos <= data.highest_internal_pos() {
            if data.child_id_at(pos) == child_id {
                return Ok(pos);
            }
            pos += 2;
        }
        bail!("child {} not referenced by parent {}", child_id, parent.id());
    }

    /// Promotes the separator of `child`'s pending split into the parent:
    /// rebinds the child's cursor frames across the two halves, inserts
    /// the separator and new child reference, and fixes frames bound to
    /// the parent. The parent may overflow and be left with its own split
    /// attached for the caller to finish.
    ///
    /// Caller holds exclusive latches on parent and child plus the shared
    /// commit lock; the parent must not itself be split.
    pub(crate) fn insert_split_child_ref(
        &self,
        parent: &Arc<Node>,
        child_pos: i32,
        child: &Arc<Node>,
    ) -> Result<()> {
        debug_assert!(parent.data().split.is_none());
        debug_assert!(
            !self.db.cache.should_mark_dirty(parent),
            "parent must be dirtied before a split is finished"
        );

        let split = child
            .data_mut()
            .split
            .take()
            .ok_or_else(|| eyre!("insert_split_child_ref on a node without a split"))?;
        let sibling = split.latch_sibling_ex();

        for frame in child.bound_frames() {
            split.rebind_frame(&frame, &sibling);
        }

        let frag = self.frag();
        if split.split_right {
            let plan =
                parent
                    .data_mut()
                    .insert_internal_entry(child_pos, &split.separator, sibling.id(), frag)?;
            if let Some(plan) = plan {
                self.install_split(parent, plan)?;
            }
            for frame in parent.bound_frames() {
                if frame.pos() > child_pos {
                    frame.adjust_pos(2);
                }
            }
            for frame in sibling.bound_frames() {
                if let Some(parent_frame) = frame.parent() {
                    parent_frame.set_pos(child_pos + 2);
                }
            }
        } else {
            // The sibling holds the lower half: it takes over this child
            // slot and the retained node moves one slot right.
            parent.data_mut().update_child_ref_id(child_pos, sibling.id());
            let plan =
                parent
                    .data_mut()
                    .insert_internal_entry(child_pos, &split.separator, child.id(), frag)?;
            if let Some(plan) = plan {
                self.install_split(parent, plan)?;
            }
            for frame in parent.bound_frames() {
                if frame.pos() > child_pos {
                    frame.adjust_pos(2);
                }
            }
            for frame in child.bound_frames() {
                if let Some(parent_frame) = frame.parent() {
                    parent_frame.set_pos(child_pos + 2);
                }
            }
        }

        sibling.release_exclusive();
        Ok(())
    }

    /// Finishes the split attached to `node`, recursing up the tree as
    /// parents overflow. `node` is exclusively latched on entry; on
    /// return, the node bound to `frame` is exclusively latched (it may be
    /// the sibling after rebinding). Caller holds the shared commit lock.
    pub(crate) fn finish_split(
        &self,
        frame: &Arc<CursorFrame>,
        node: Arc<Node>,
    ) -> Result<Arc<Node>> {
        let mut cur_frame = Arc::clone(frame);
        let mut cur_node = node;
        loop {
            debug_assert!(cur_node.data().split.is_some());

            if Arc::ptr_eq(&cur_node, &self.root) {
                self.finish_split_root(&cur_node)?;
                cur_node.release_exclusive();
                break;
            }

            let parent_frame = cur_frame
                .parent()
                .ok_or_else(|| eyre!("split non-root node has no parent frame"))?;
            cur_node.release_exclusive();
            let mut parent = parent_frame.acquire_exclusive();
            if parent.data().split.is_some() {
                parent = self.finish_split(&parent_frame, parent)?;
            }

            // Re-latch the child: another thread may have finished this
            // split while it was unlatched, and the frame may have been
            // rebound to the sibling.
            let is_original = Arc::ptr_eq(&cur_frame, frame);
            let child = cur_frame.acquire_exclusive();
            if child.data().split.is_none() {
                parent.release_exclusive();
                if is_original {
                    return Ok(child);
                }
                child.release_exclusive();
                break;
            }

            let child_pos = Self::locate_child(&parent, parent_frame.pos(), child.id())?;
            self.insert_split_child_ref(&parent, child_pos, &child)?;
            child.release_exclusive();

            if parent.data().split.is_some() {
                cur_frame = parent_frame;
                cur_node = parent;
                continue;
            }
            parent.release_exclusive();
            break;
        }
        Ok(frame.acquire_exclusive())
    }

    /// Splits the root in place: the retained half moves to a fresh node,
    /// the root page becomes an internal node over the two halves, and
    /// every frame bound to the root is pushed down one level under a new
    /// root frame. Root latch is held throughout and retained.
    fn finish_split_root(&self, root: &Arc<Node>) -> Result<()> {
        debug_assert!(
            !self.db.cache.should_mark_dirty(root),
            "root must be dirtied before its split is finished"
        );
        let split = root
            .data_mut()
            .split
            .take()
            .ok_or_else(|| eyre!("finish_split_root without a split"))?;
        let sibling = split.latch_sibling_ex();

        // Frames in the sibling half move over while the root still holds
        // the retained half's image.
        for frame in root.bound_frames() {
            split.rebind_frame(&frame, &sibling);
        }

        let page_size = self.db.cache.page_size();
        let child = self.db.cache.alloc_node()?;
        let fresh = vec![0u8; page_size].into_boxed_slice();
        let retained = root.data_mut().replace_buf(fresh);
        child.data_mut().install(retained);

        for frame in root.bound_frames() {
            let pos = frame.pos();
            frame.rebind(&child, pos);
        }

        let (left, right) = if split.split_right {
            (&child, &sibling)
        } else {
            (&sibling, &child)
        };

        let bottom = if left.data().is_leaf() {
            TYPE_BOTTOM_INTERNAL
        } else {
            0
        };
        root.data_mut()
            .init_internal(bottom | LOW_EXTREMITY | HIGH_EXTREMITY, left.id());
        let plan = root
            .data_mut()
            .insert_internal_entry(0, &split.separator, right.id(), self.frag())?;
        ensure!(plan.is_none(), "separator must fit an empty root");

        // Push-down: every frame that used to bottom out at the root gets
        // a fresh root frame above it.
        for (side, slot) in [(left, 0i32), (right, 2i32)] {
            for frame in side.bound_frames() {
                if frame.parent().is_none() {
                    let root_frame = CursorFrame::new(None);
                    root_frame.bind(root, slot);
                    frame.set_parent(Some(root_frame));
                }
            }
        }

        child.release_exclusive();
        sibling.release_exclusive();
        Ok(())
    }

    /// Collapses the root when it is an internal node with no keys and a
    /// single child: the child's image replaces the root page, child
    /// frames splice up, and the child node is deleted. Caller holds both
    /// exclusive latches and the shared commit lock; both are released.
    pub(crate) fn root_delete(&self, child: Arc<Node>) -> Result<()> {
        let root = &self.root;
        debug_assert!(root.data().is_internal() && !root.data().has_keys());
        debug_assert!(child.data().split.is_none());

        let page_size = self.db.cache.page_size();
        let fresh = vec![0u8; page_size].into_boxed_slice();
        let child_buf = child.data_mut().replace_buf(fresh);
        root.data_mut().install(child_buf);
        let flags = root.data().type_flags() | LOW_EXTREMITY | HIGH_EXTREMITY;
        root.data_mut().set_flags(flags);

        for frame in child.bound_frames() {
            let old_parent = frame.parent();
            let pos = frame.pos();
            frame.rebind(root, pos);
            if let Some(old_parent) = old_parent {
                old_parent.unbind();
                frame.set_parent(old_parent.parent());
            }
        }

        self.db.cache.delete_node(&child);
        child.release_exclusive();
        root.release_exclusive();
        Ok(())
    }

    /// Dirties the node bound to `frame` and every ancestor that needs it,
    /// finishing pending splits along the way. The frame's node is
    /// exclusively latched on entry and a (possibly different) exclusively
    /// latched replacement is returned; the latch is released on error.
    /// Caller holds the shared commit lock.
    pub(crate) fn not_split_dirty(
        &self,
        frame: &Arc<CursorFrame>,
        node: Arc<Node>,
    ) -> Result<Arc<Node>> {
        let mut node = node;
        loop {
            if node.data().split.is_some() {
                // Already dirty, but finish the split.
                return self.finish_split(frame, node);
            }

            let cache = &self.db.cache;
            if !cache.should_mark_dirty(&node) {
                return Ok(node);
            }

            let Some(parent_frame) = frame.parent() else {
                // The root has no parent reference to update.
                if let Err(e) = cache.mark_dirty(&node) {
                    node.release_exclusive();
                    return Err(e);
                }
                return Ok(node);
            };

            let parent = match parent_frame.try_acquire_exclusive() {
                Some(parent) => {
                    if parent.data().split.is_none() && !cache.should_mark_dirty(&parent) {
                        // Parent is ready; re-home the child and update
                        // its reference.
                        let result = (|| -> Result<()> {
                            let child_pos =
                                Self::locate_child(&parent, parent_frame.pos(), node.id())?;
                            if cache.mark_dirty(&node)? {
                                parent.data_mut().update_child_ref_id(child_pos, node.id());
                            }
                            Ok(())
                        })();
                        parent.release_exclusive();
                        return match result {
                            Ok(()) => Ok(node),
                            Err(e) => {
                                node.release_exclusive();
                                Err(e)
                            }
                        };
                    }
                    node.release_exclusive();
                    parent
                }
                None => {
                    node.release_exclusive();
                    parent_frame.acquire_exclusive()
                }
            };

            // Parent must be dirtied (or its split finished) first.
            self.not_split_dirty(&parent_frame, parent)?.release_exclusive();

            // The node latch was released; start over and re-check
            // everything.
            node = frame.acquire_exclusive();
        }
    }

    /// Tree height: 1 for a lone leaf root.
    pub fn height(&self) -> Result<usize> {
        let mut height = 1;
        let mut node = self.latch_root_shared();
        while !node.data().is_leaf() {
            let child_id = node.data().child_id_at(0);
            let child = match self.db.cache.node_map_get(child_id) {
                Some(child) => {
                    child.acquire_shared();
                    if child.id() == child_id {
                        child
                    } else {
                        child.release_shared();
                        self.db.cache.load_node(child_id, LatchRequest::Shared)?
                    }
                }
                None => self.db.cache.load_node(child_id, LatchRequest::Shared)?,
            };
            node.release_shared();
            node = child;
            height += 1;
        }
        node.release_shared();
        Ok(height)
    }

    /// Walks the tree verifying key order, child/parent bounds, node
    /// typing, and extremity inheritance. Returns false if the observer
    /// stopped the walk. Structural checks assume no concurrent writers.
    pub fn verify(&self, observer: &mut dyn VerifyObserver) -> Result<bool> {
        let root = self.latch_root_shared();
        let height = {
            // Compute height first so failures can report levels.
            root.release_shared();
            let h = self.height()?;
            self.root.acquire_shared();
            h
        };
        self.verify_node(&root, None, None, height, observer)
    }

    /// Verifies the subtree under `node` (shared latch held; released
    /// before return). `lower`/`upper` bound the keys allowed inside.
    fn verify_node(
        &self,
        node: &Arc<Node>,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        height: usize,
        observer: &mut dyn VerifyObserver,
    ) -> Result<bool> {
        let frag = self.frag();
        let id = node.id();

        let mut fail = |message: &str, observer: &mut dyn VerifyObserver| -> bool {
            observer.node_failed(id, height, message)
        };

        if node.data().split.is_some() {
            let keep_going = fail("unfinished split", observer);
            node.release_shared();
            return Ok(keep_going);
        }

        if let Err(e) = node.data().verify_structure(frag) {
            let keep_going = fail(&e.to_string(), observer);
            node.release_shared();
            return Ok(keep_going);
        }

        let key_count = node.data().key_count();
        for i in 0..key_count {
            let key = node.data().key_at((i * 2) as i32, frag)?;
            if let Some(lower) = lower {
                if key.as_slice() < lower {
                    let keep_going = fail("key below subtree lower bound", observer);
                    node.release_shared();
                    return Ok(keep_going);
                }
            }
            if let Some(upper) = upper {
                if key.as_slice() >= upper {
                    let keep_going = fail("key at or above subtree upper bound", observer);
                    node.release_shared();
                    return Ok(keep_going);
                }
            }
        }

        if node.data().is_leaf() {
            if height != 1 {
                let keep_going = fail("leaf above the bottom level", observer);
                node.release_shared();
                return Ok(keep_going);
            }
            let keep_going = observer.node_passed(id, height, key_count);
            node.release_shared();
            return Ok(keep_going);
        }

        // Gather separators and child ids, then release before recursing
        // so at most a parent/child latch pair is held at a time.
        let mut separators = Vec::with_capacity(key_count);
        for i in 0..key_count {
            separators.push(node.data().key_at((i * 2) as i32, frag)?);
        }
        let mut children = Vec::with_capacity(key_count + 1);
        let mut pos = 0;
        while pos <= node.data().highest_internal_pos() {
            children.push(node.data().child_id_at(pos));
            pos += 2;
        }
        let node_flags = (
            node.data().is_bottom_internal(),
            node.data().has_low_extremity(),
            node.data().has_high_extremity(),
        );
        if !observer.node_passed(id, height, key_count) {
            node.release_shared();
            return Ok(false);
        }
        node.release_shared();

        let (bottom, node_low, node_high) = node_flags;
        for (slot, child_id) in children.iter().enumerate() {
            let child = self.db.cache.load_node(*child_id, LatchRequest::Shared)?;

            let child_is_leaf = child.data().is_leaf();
            if bottom && !child_is_leaf {
                if !observer.node_failed(*child_id, height - 1, "bottom-internal child is not a leaf")
                {
                    child.release_shared();
                    return Ok(false);
                }
            }
            if !bottom && child_is_leaf {
                if !observer.node_failed(*child_id, height - 1, "leaf under a non-bottom internal") {
                    child.release_shared();
                    return Ok(false);
                }
            }
            if child.data().has_low_extremity() && !(node_low && slot == 0) {
                if !observer.node_failed(*child_id, height - 1, "low extremity not inherited") {
                    child.release_shared();
                    return Ok(false);
                }
            }
            if child.data().has_high_extremity() && !(node_high && slot == children.len() - 1) {
                if !observer.node_failed(*child_id, height - 1, "high extremity not inherited") {
                    child.release_shared();
                    return Ok(false);
                }
            }

            let child_lower = if slot == 0 {
                lower
            } else {
                Some(separators[slot - 1].as_slice())
            };
            let child_upper = if slot == children.len() - 1 {
                upper
            } else {
                Some(separators[slot].as_slice())
            };
            if !self.verify_node(&child, child_lower, child_upper, height - 1, observer)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.id)
            .field("root", &self.root.id())
            .finish()
    }
}
