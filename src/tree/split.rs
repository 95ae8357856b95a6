//! # Split Descriptors
//!
//! A split descriptor captures the state of a half-finished node split: the
//! node has produced a sibling and redistributed its entries, but the
//! separator key has not yet been promoted into the parent. Any cursor that
//! observes a node with a split attached participates in finishing it
//! before relying on the node's contents.
//!
//! `split_right == true` means the sibling holds the upper half of the
//! entries and the original node retains the lower keys; `false` is the
//! mirror image.
//!
//! The separator is an explicit sum type: either the full key stored inline
//! in the parent, or a fragment descriptor paired with the full key bytes
//! so comparisons never touch the fragment store.

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::Result;

use crate::tree::fragment::FragmentStore;
use crate::tree::frame::CursorFrame;
use crate::tree::node::{max_internal_entry, Node};

/// Separator key as it will be encoded into the parent node.
#[derive(Debug, Clone)]
pub enum SeparatorKey {
    Inline(Vec<u8>),
    Fragmented { descriptor: Vec<u8>, full: Vec<u8> },
}

impl SeparatorKey {
    /// Chooses the encoding for a separator destined for a parent node:
    /// inline when the key fits the internal entry budget, otherwise a
    /// freshly written fragment chain.
    pub fn for_parent(full: Vec<u8>, page_size: usize, frag: &FragmentStore) -> Result<Self> {
        let budget = max_internal_entry(page_size).saturating_sub(8 + 2);
        if full.len() <= budget {
            Ok(SeparatorKey::Inline(full))
        } else {
            let descriptor = frag.write(&full)?;
            Ok(SeparatorKey::Fragmented { descriptor, full })
        }
    }

    /// The full logical key, regardless of encoding.
    pub fn full(&self) -> &[u8] {
        match self {
            SeparatorKey::Inline(full) => full,
            SeparatorKey::Fragmented { full, .. } => full,
        }
    }

    /// Encoded length of the key portion in a parent entry.
    pub fn encoded_len(&self) -> usize {
        match self {
            SeparatorKey::Inline(full) => full.len() + if full.len() <= 127 { 1 } else { 2 },
            SeparatorKey::Fragmented { descriptor, .. } => descriptor.len() + 2,
        }
    }
}

/// Transient state of a node that has split but whose separator is not yet
/// in the parent.
pub struct Split {
    pub split_right: bool,
    pub sibling: Arc<Node>,
    pub separator: SeparatorKey,
}

impl Split {
    pub fn new(split_right: bool, sibling: Arc<Node>, separator: SeparatorKey) -> Self {
        Self {
            split_right,
            sibling,
            separator,
        }
    }

    /// Sign of `key` relative to the split key.
    pub fn compare(&self, key: &[u8]) -> Ordering {
        key.cmp(self.separator.full())
    }

    /// Sibling with a shared latch held.
    pub fn latch_sibling(&self) -> Arc<Node> {
        let sibling = Arc::clone(&self.sibling);
        sibling.acquire_shared();
        sibling
    }

    /// Sibling with the exclusive latch held.
    pub fn latch_sibling_ex(&self) -> Arc<Node> {
        let sibling = Arc::clone(&self.sibling);
        sibling.acquire_exclusive();
        sibling
    }

    /// Allows a search to continue into a split node by selecting the
    /// original node or the sibling. The returned node holds a shared
    /// latch; the other side's latch is released.
    pub fn select_node(&self, node: Arc<Node>, key: &[u8]) -> Arc<Node> {
        let sibling = self.latch_sibling();
        let (left, right) = if self.split_right {
            (node, sibling)
        } else {
            (sibling, node)
        };
        if self.compare(key) == Ordering::Less {
            right.release_shared();
            left
        } else {
            left.release_shared();
            right
        }
    }

    /// Binary search across both halves, returning a position as if the
    /// node had not split. Caller holds a latch on `node`.
    pub fn binary_search_leaf(&self, node: &Node, key: &[u8], frag: &FragmentStore) -> Result<i32> {
        let sibling = self.latch_sibling();
        let result = (|| {
            let (left, right) = if self.split_right {
                (node, &*sibling)
            } else {
                (&*sibling, node)
            };
            if self.compare(key) == Ordering::Less {
                left.data().binary_search(key, frag)
            } else {
                let highest = left.data().highest_leaf_pos();
                let pos = right.data().binary_search(key, frag)?;
                Ok(if pos < 0 {
                    pos - highest - 2
                } else {
                    highest + 2 + pos
                })
            }
        })();
        sibling.release_shared();
        result
    }

    /// Highest position within the original node as if it had not split.
    pub fn highest_pos(&self, node: &Node) -> i32 {
        let sibling = self.latch_sibling();
        let pos = if node.data().is_leaf() {
            node.data().highest_leaf_pos() + 2 + sibling.data().highest_leaf_pos()
        } else {
            node.data().highest_internal_pos() + 2 + sibling.data().highest_internal_pos()
        };
        sibling.release_shared();
        pos
    }

    /// Fixes one frame bound to the split node, moving it to the sibling
    /// when its position landed in the sibling's half. Caller holds the
    /// exclusive latch on both the node and the sibling.
    pub fn rebind_frame(&self, frame: &Arc<CursorFrame>, sibling: &Arc<Node>) {
        let pos = frame.pos();

        if self.split_right {
            let node = match frame.node() {
                Some(node) => node,
                // Frame is being concurrently unbound.
                None => return,
            };
            let highest = node.data().highest_pos();

            if pos >= 0 {
                if pos > highest {
                    frame.rebind(sibling, pos - highest - 2);
                }
                return;
            }

            let pos = !pos;
            if pos <= highest {
                return;
            }
            if pos == highest + 2 {
                match frame.not_found_key() {
                    Some(key) if self.compare(&key) != Ordering::Less => {}
                    _ => return,
                }
            }
            frame.rebind(sibling, !(pos - highest - 2));
        } else {
            let highest = sibling.data().highest_pos();

            if pos >= 0 {
                if pos <= highest {
                    frame.rebind(sibling, pos);
                } else {
                    frame.set_pos(pos - highest - 2);
                }
                return;
            }

            let pos = !pos;
            if pos <= highest {
                frame.rebind(sibling, !pos);
                return;
            }
            if pos == highest + 2 {
                match frame.not_found_key() {
                    None => return,
                    Some(key) => {
                        if self.compare(&key) == Ordering::Less {
                            frame.rebind(sibling, !pos);
                            return;
                        }
                    }
                }
            }
            frame.set_pos(!(pos - highest - 2));
        }
    }
}

impl std::fmt::Debug for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Split")
            .field("split_right", &self.split_right)
            .field("sibling", &self.sibling.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CachedState, FreeList, PageFile};
    use crate::tree::node::{HIGH_EXTREMITY, LOW_EXTREMITY};
    use tempfile::tempdir;

    fn frag_store() -> (tempfile::TempDir, FragmentStore) {
        let dir = tempdir().unwrap();
        let file = Arc::new(PageFile::create(&dir.path().join("t.burrow"), 256).unwrap());
        (dir, FragmentStore::new(file, Arc::new(FreeList::new(1))))
    }

    fn leaf_node(id: u64, keys: &[&[u8]], frag: &FragmentStore) -> Arc<Node> {
        let node = Arc::new(Node::new(256, id, CachedState::Clean));
        node.acquire_exclusive();
        node.data_mut().init_leaf(LOW_EXTREMITY | HIGH_EXTREMITY);
        for key in keys {
            let pos = node.data().binary_search(key, frag).unwrap();
            node.data_mut()
                .insert_leaf_entry(!pos, key, b"v", frag)
                .unwrap();
        }
        node.release_exclusive();
        node
    }

    #[test]
    fn select_node_picks_the_correct_half() {
        let (_dir, frag) = frag_store();
        let node = leaf_node(1, &[b"a", b"b"], &frag);
        let sibling = leaf_node(2, &[b"m", b"z"], &frag);
        let split = Split::new(true, Arc::clone(&sibling), SeparatorKey::Inline(b"m".to_vec()));

        node.acquire_shared();
        let chosen = split.select_node(Arc::clone(&node), b"a");
        assert!(Arc::ptr_eq(&chosen, &node));
        chosen.release_shared();

        node.acquire_shared();
        let chosen = split.select_node(Arc::clone(&node), b"m");
        assert!(Arc::ptr_eq(&chosen, &sibling));
        chosen.release_shared();
    }

    #[test]
    fn binary_search_leaf_spans_both_halves() {
        let (_dir, frag) = frag_store();
        let node = leaf_node(1, &[b"a", b"b"], &frag);
        let sibling = leaf_node(2, &[b"m", b"z"], &frag);
        let split = Split::new(true, Arc::clone(&sibling), SeparatorKey::Inline(b"m".to_vec()));

        node.acquire_shared();
        assert_eq!(split.binary_search_leaf(&node, b"b", &frag).unwrap(), 2);
        assert_eq!(split.binary_search_leaf(&node, b"m", &frag).unwrap(), 4);
        assert_eq!(split.binary_search_leaf(&node, b"z", &frag).unwrap(), 6);
        // Missing keys complement across the logical whole.
        assert_eq!(split.binary_search_leaf(&node, b"c", &frag).unwrap(), !4);
        assert_eq!(split.binary_search_leaf(&node, b"zz", &frag).unwrap(), !8);
        assert_eq!(split.highest_pos(&node), 6);
        node.release_shared();
    }

    #[test]
    fn rebind_moves_frames_past_the_cut() {
        let (_dir, frag) = frag_store();
        let node = leaf_node(1, &[b"a", b"b"], &frag);
        let sibling = leaf_node(2, &[b"m", b"z"], &frag);
        let split = Split::new(true, Arc::clone(&sibling), SeparatorKey::Inline(b"m".to_vec()));

        node.acquire_exclusive();
        sibling.acquire_exclusive();

        // Frame on the retained half stays.
        let stay = CursorFrame::new(None);
        stay.bind(&node, 2);
        split.rebind_frame(&stay, &sibling);
        assert!(Arc::ptr_eq(&stay.node().unwrap(), &node));
        assert_eq!(stay.pos(), 2);

        // Frame past the cut moves, position rebased.
        let moved = CursorFrame::new(None);
        moved.bind(&node, 6);
        split.rebind_frame(&moved, &sibling);
        assert!(Arc::ptr_eq(&moved.node().unwrap(), &sibling));
        assert_eq!(moved.pos(), 2);

        // Not-found frame at the boundary follows its key.
        let boundary = CursorFrame::new(None);
        boundary.bind(&node, !4);
        boundary.set_not_found_key(Some(b"p".to_vec()));
        split.rebind_frame(&boundary, &sibling);
        assert!(Arc::ptr_eq(&boundary.node().unwrap(), &sibling));
        assert_eq!(boundary.pos(), !0);

        stay.unbind();
        moved.unbind();
        boundary.unbind();
        sibling.release_exclusive();
        node.release_exclusive();
    }

    #[test]
    fn separator_key_encodings() {
        let (_dir, frag) = frag_store();
        let short = SeparatorKey::for_parent(b"abc".to_vec(), 256, &frag).unwrap();
        assert!(matches!(short, SeparatorKey::Inline(_)));
        assert_eq!(short.full(), b"abc");
        assert_eq!(short.encoded_len(), 4);

        let long = SeparatorKey::for_parent(vec![7u8; 500], 256, &frag).unwrap();
        match &long {
            SeparatorKey::Fragmented { descriptor, full } => {
                assert_eq!(full.len(), 500);
                assert_eq!(frag.read(descriptor).unwrap(), vec![7u8; 500]);
            }
            _ => panic!("expected fragmented separator"),
        }
    }
}
