//! # Cursor Frames
//!
//! A cursor frame binds one level of a cursor's position stack to a node.
//! The stack runs leaf-to-root through `parent` links; each node keeps a
//! registry of the frames currently bound to it so that structural changes
//! (entry inserts and deletes, splits, merges) can fix every affected
//! cursor in place.
//!
//! ## Position encoding
//!
//! `pos >= 0` points at an existing entry. A missed search stores the
//! complement of the insertion point (`!insert_pos`) plus the key that was
//! not found, so a concurrent insert at that slot can be classified: same
//! key promotes the frame to found, a greater key keeps the frame on its
//! complement as positions shift.
//!
//! ## Locking
//!
//! The binding (node, position, not-found key) sits behind a small mutex.
//! Writes happen only while the bound node's latch is held exclusively —
//! by the owning cursor or by another thread fixing frames during a
//! structural change — and the owning cursor reads while holding at least
//! the shared latch, so positions cannot shift under it. The mutex makes
//! the races that remain (frame teardown, registry sweeps) memory-safe.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::tree::node::Node;

#[derive(Default)]
struct Binding {
    node: Option<Arc<Node>>,
    pos: i32,
    not_found_key: Option<Vec<u8>>,
}

pub struct CursorFrame {
    parent: Mutex<Option<Arc<CursorFrame>>>,
    binding: Mutex<Binding>,
}

impl CursorFrame {
    pub fn new(parent: Option<Arc<CursorFrame>>) -> Arc<Self> {
        Arc::new(Self {
            parent: Mutex::new(parent),
            binding: Mutex::new(Binding::default()),
        })
    }

    pub fn parent(&self) -> Option<Arc<CursorFrame>> {
        self.parent.lock().clone()
    }

    pub fn set_parent(&self, parent: Option<Arc<CursorFrame>>) {
        *self.parent.lock() = parent;
    }

    /// Currently bound node, if any.
    pub fn node(&self) -> Option<Arc<Node>> {
        self.binding.lock().node.clone()
    }

    pub fn pos(&self) -> i32 {
        self.binding.lock().pos
    }

    pub fn set_pos(&self, pos: i32) {
        self.binding.lock().pos = pos;
    }

    pub fn adjust_pos(&self, delta: i32) {
        self.binding.lock().pos += delta;
    }

    pub fn not_found_key(&self) -> Option<Vec<u8>> {
        self.binding.lock().not_found_key.clone()
    }

    pub fn set_not_found_key(&self, key: Option<Vec<u8>>) {
        self.binding.lock().not_found_key = key;
    }

    /// Binds this frame to `node` at `pos`, registering it with the node.
    /// Caller holds the node latch in either mode.
    pub fn bind(self: &Arc<Self>, node: &Arc<Node>, pos: i32) {
        {
            let mut binding = self.binding.lock();
            debug_assert!(binding.node.is_none(), "frame already bound");
            binding.node = Some(Arc::clone(node));
            binding.pos = pos;
        }
        node.bind_frame(self);
    }

    /// Unbinds from the current node, if any. Caller holds the node latch.
    pub fn unbind(self: &Arc<Self>) {
        let node = self.binding.lock().node.take();
        if let Some(node) = node {
            node.unbind_frame(self);
        }
    }

    /// Moves this frame to a different node. Caller holds the exclusive
    /// latch on both nodes.
    pub fn rebind(self: &Arc<Self>, node: &Arc<Node>, pos: i32) {
        self.unbind();
        self.bind(node, pos);
    }

    /// Latches the bound node in shared mode, re-validating the binding
    /// after the wait: the frame may have been rebound while blocked.
    pub fn acquire_shared(self: &Arc<Self>) -> Arc<Node> {
        loop {
            let node = self.node().expect("frame is not bound");
            node.acquire_shared();
            match self.node() {
                Some(current) if Arc::ptr_eq(&current, &node) => return node,
                _ => node.release_shared(),
            }
        }
    }

    /// Non-blocking shared latch on the bound node; None if contended.
    pub fn try_acquire_shared(self: &Arc<Self>) -> Option<Arc<Node>> {
        let node = self.node().expect("frame is not bound");
        if !node.try_acquire_shared() {
            return None;
        }
        match self.node() {
            Some(current) if Arc::ptr_eq(&current, &node) => Some(node),
            _ => {
                node.release_shared();
                None
            }
        }
    }

    /// Latches the bound node exclusively, re-validating the binding.
    pub fn acquire_exclusive(self: &Arc<Self>) -> Arc<Node> {
        loop {
            let node = self.node().expect("frame is not bound");
            node.acquire_exclusive();
            match self.node() {
                Some(current) if Arc::ptr_eq(&current, &node) => return node,
                _ => node.release_exclusive(),
            }
        }
    }

    /// Non-blocking exclusive latch on the bound node; None if contended.
    pub fn try_acquire_exclusive(self: &Arc<Self>) -> Option<Arc<Node>> {
        let node = self.node().expect("frame is not bound");
        if !node.try_acquire_exclusive() {
            return None;
        }
        match self.node() {
            Some(current) if Arc::ptr_eq(&current, &node) => Some(node),
            _ => {
                node.release_exclusive();
                None
            }
        }
    }
}

impl std::fmt::Debug for CursorFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let binding = self.binding.lock();
        f.debug_struct("CursorFrame")
            .field("node", &binding.node.as_ref().map(|n| n.id()))
            .field("pos", &binding.pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CachedState;

    fn node() -> Arc<Node> {
        Arc::new(Node::new(256, 1, CachedState::Clean))
    }

    #[test]
    fn bind_and_unbind_maintain_registry() {
        let node = node();
        node.acquire_exclusive();
        let frame = CursorFrame::new(None);
        frame.bind(&node, 4);
        assert!(node.has_bound_frames());
        assert_eq!(frame.pos(), 4);

        frame.unbind();
        assert!(!node.has_bound_frames());
        assert!(frame.node().is_none());
        node.release_exclusive();
    }

    #[test]
    fn rebind_moves_between_nodes() {
        let a = node();
        let b = node();
        a.acquire_exclusive();
        b.acquire_exclusive();

        let frame = CursorFrame::new(None);
        frame.bind(&a, 0);
        frame.rebind(&b, 6);

        assert!(!a.has_bound_frames());
        assert!(b.has_bound_frames());
        assert_eq!(frame.pos(), 6);

        frame.unbind();
        a.release_exclusive();
        b.release_exclusive();
    }

    #[test]
    fn acquire_revalidates_binding() {
        let a = node();
        a.acquire_shared();
        let frame = CursorFrame::new(None);
        frame.bind(&a, 2);
        a.release_shared();

        let latched = frame.acquire_shared();
        assert!(Arc::ptr_eq(&latched, &a));
        latched.release_shared();

        let latched = frame.try_acquire_exclusive().unwrap();
        assert!(Arc::ptr_eq(&latched, &a));
        latched.release_exclusive();
        a.acquire_exclusive();
        frame.unbind();
        a.release_exclusive();
    }

    #[test]
    fn parent_links_form_a_stack() {
        let root = CursorFrame::new(None);
        let leaf = CursorFrame::new(Some(Arc::clone(&root)));
        assert!(leaf.parent().is_some());
        assert!(root.parent().is_none());
        leaf.set_parent(None);
        assert!(leaf.parent().is_none());
    }
}
