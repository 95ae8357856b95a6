//! # Node Cache
//!
//! Sharded map from page id to [`Node`], the buffer cache of the engine.
//! Lookup is non-blocking; loading couples with the caller's parent latch
//! per the descent protocol; eviction runs SIEVE-style per shard.
//!
//! ## Dirty states
//!
//! A node is clean or dirty in one of two generations (`Dirty0`/`Dirty1`).
//! The cache tracks the current generation; a checkpoint flips it while
//! holding the commit lock exclusively, captures every node dirty in the
//! old generation, and marks those nodes clean only after their images
//! reach disk. Eviction only considers clean nodes, so a node whose image
//! is still in flight can never be reloaded stale.
//!
//! ## Shadow paging
//!
//! `mark_dirty` re-homes a clean node to a freshly allocated page id and
//! defers the old id to the free list. The caller (holding the parent
//! exclusively) updates the parent's child reference. The previous
//! checkpoint's image stays intact on disk until the next checkpoint
//! completes.
//!
//! ## Eviction rules
//!
//! A node is evictable only when it is clean, carries no bound cursor
//! frames, is not referenced outside the cache (the tree root always is),
//! and its exclusive latch is free. Eviction zeroes the node id so racing
//! lookups that already hold the `Arc` re-validate and retry.

use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::CACHE_SHARD_COUNT;
use crate::store::freelist::FreeList;
use crate::store::pagefile::PageFile;
use crate::tree::node::Node;

/// Double-buffered dirtiness for checkpointing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CachedState {
    Clean = 0,
    Dirty0 = 1,
    Dirty1 = 2,
}

impl CachedState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => CachedState::Dirty0,
            2 => CachedState::Dirty1,
            _ => CachedState::Clean,
        }
    }

    pub fn dirty(generation: u8) -> Self {
        if generation == 0 {
            CachedState::Dirty0
        } else {
            CachedState::Dirty1
        }
    }
}

/// Latch mode requested from a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchRequest {
    Shared,
    Exclusive,
}

struct Shard {
    map: HashMap<u64, Arc<Node>>,
    ring: Vec<u64>,
    hand: usize,
}

impl Shard {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            ring: Vec::new(),
            hand: 0,
        }
    }
}

pub struct NodeCache {
    shards: Vec<Mutex<Shard>>,
    capacity_per_shard: usize,
    page_size: usize,
    file: Arc<PageFile>,
    freelist: Arc<FreeList>,
    commit_generation: AtomicU8,
}

impl NodeCache {
    pub fn new(
        capacity: usize,
        page_size: usize,
        file: Arc<PageFile>,
        freelist: Arc<FreeList>,
        commit_generation: u8,
    ) -> Result<Self> {
        ensure!(
            capacity >= CACHE_SHARD_COUNT,
            "cache capacity {} must be at least {} (one per shard)",
            capacity,
            CACHE_SHARD_COUNT
        );
        let shards = (0..CACHE_SHARD_COUNT).map(|_| Mutex::new(Shard::new())).collect();
        Ok(Self {
            shards,
            capacity_per_shard: capacity / CACHE_SHARD_COUNT,
            page_size,
            file,
            freelist,
            commit_generation: AtomicU8::new(commit_generation),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn freelist(&self) -> &Arc<FreeList> {
        &self.freelist
    }

    pub fn file(&self) -> &Arc<PageFile> {
        &self.file
    }

    fn shard_for(&self, id: u64) -> &Mutex<Shard> {
        let hash = (id as usize).wrapping_mul(31);
        &self.shards[hash % CACHE_SHARD_COUNT]
    }

    /// Non-blocking lookup. The returned node's id may already have raced
    /// with eviction; callers latch and re-check the id.
    pub fn node_map_get(&self, id: u64) -> Option<Arc<Node>> {
        let shard = self.shard_for(id).lock();
        let node = shard.map.get(&id)?;
        node.mark_visited();
        Some(Arc::clone(node))
    }

    /// Allocates a page id and a node born dirty in the current
    /// generation, exclusively latched and registered in the map.
    pub fn alloc_node(&self) -> Result<Arc<Node>> {
        let id = self.freelist.allocate();
        let state = CachedState::dirty(self.current_generation());
        let node = Arc::new(Node::new(self.page_size, id, state));
        node.acquire_exclusive();
        {
            let mut shard = self.shard_for(id).lock();
            shard.map.insert(id, Arc::clone(&node));
            shard.ring.push(id);
        }
        self.evict_overflow(id);
        Ok(node)
    }

    /// Returns the node for `id`, loading it from disk if absent. The node
    /// comes back latched per `latch`. Loading I/O happens under whatever
    /// latch the caller already holds on the parent, per the descent
    /// protocol.
    pub fn load_node(&self, id: u64, latch: LatchRequest) -> Result<Arc<Node>> {
        loop {
            if let Some(node) = self.node_map_get(id) {
                match latch {
                    LatchRequest::Shared => node.acquire_shared(),
                    LatchRequest::Exclusive => node.acquire_exclusive(),
                }
                if node.id() == id {
                    return Ok(node);
                }
                // Evicted while we waited; retry.
                match latch {
                    LatchRequest::Shared => node.release_shared(),
                    LatchRequest::Exclusive => node.release_exclusive(),
                }
                continue;
            }

            let node = Arc::new(Node::new(self.page_size, id, CachedState::Clean));
            node.acquire_exclusive();
            {
                let mut shard = self.shard_for(id).lock();
                if shard.map.contains_key(&id) {
                    // Raced with another loader; use theirs.
                    continue;
                }
                shard.map.insert(id, Arc::clone(&node));
                shard.ring.push(id);
            }

            if let Err(e) = self
                .file
                .read_page(id, node.data_mut().buf_mut())
                .wrap_err_with(|| format!("failed to load page {}", id))
            {
                self.shard_for(id).lock().map.remove(&id);
                node.set_id(0);
                node.release_exclusive();
                return Err(e);
            }

            if latch == LatchRequest::Shared {
                node.downgrade();
            }
            self.evict_overflow(id);
            return Ok(node);
        }
    }

    pub fn current_generation(&self) -> u8 {
        self.commit_generation.load(AtomicOrdering::Acquire)
    }

    /// True when a mutation of `node` must re-home it first.
    pub fn should_mark_dirty(&self, node: &Node) -> bool {
        node.cached_state() != CachedState::dirty(self.current_generation())
    }

    /// Re-homes the node to a fresh page id and marks it dirty in the
    /// current generation. Returns true when the id changed, in which case
    /// the caller updates the parent's child reference. Caller holds the
    /// node's exclusive latch and the commit lock in shared mode.
    pub fn mark_dirty(&self, node: &Arc<Node>) -> Result<bool> {
        let target = CachedState::dirty(self.current_generation());
        if node.cached_state() == target {
            return Ok(false);
        }

        let old_id = node.id();
        let new_id = self.freelist.allocate();

        self.shard_for(old_id).lock().map.remove(&old_id);
        node.set_id(new_id);
        {
            let mut shard = self.shard_for(new_id).lock();
            shard.map.insert(new_id, Arc::clone(node));
            shard.ring.push(new_id);
        }
        if old_id != 0 {
            self.freelist.release(old_id);
        }
        node.set_cached_state(target);
        Ok(true)
    }

    /// Removes an empty node from the tree: out of the map, id freed and
    /// zeroed. Caller holds the exclusive latch and releases it after.
    pub fn delete_node(&self, node: &Arc<Node>) {
        let id = node.id();
        if id != 0 {
            self.shard_for(id).lock().map.remove(&id);
            self.freelist.release(id);
        }
        node.set_id(0);
        node.set_cached_state(CachedState::Clean);
    }

    /// Flips the dirty generation, returning the generation to flush.
    /// Caller holds the commit lock exclusively.
    pub fn flip_generation(&self) -> u8 {
        let old = self.commit_generation.load(AtomicOrdering::Acquire);
        self.commit_generation.store(old ^ 1, AtomicOrdering::Release);
        old
    }

    /// Captures the page image of every node dirty in `generation`.
    /// Caller holds the commit lock exclusively, so no split is in
    /// progress and no mutator holds node latches.
    pub fn collect_dirty(&self, generation: u8) -> Vec<(Arc<Node>, u64, Box<[u8]>)> {
        let state = CachedState::dirty(generation);
        let mut out = Vec::new();
        for shard in &self.shards {
            let nodes: Vec<Arc<Node>> = shard.lock().map.values().cloned().collect();
            for node in nodes {
                if node.cached_state() != state {
                    continue;
                }
                node.acquire_shared();
                if node.cached_state() == state && node.id() != 0 {
                    debug_assert!(
                        node.data().split.is_none(),
                        "checkpoint observed an unfinished split"
                    );
                    let buf = node.data().buf().to_vec().into_boxed_slice();
                    out.push((Arc::clone(&node), node.id(), buf));
                }
                node.release_shared();
            }
        }
        out
    }

    /// Marks captured nodes clean once their images are durable, unless
    /// they were re-dirtied in the new generation meanwhile.
    pub fn finish_flush(&self, generation: u8, flushed: &[(Arc<Node>, u64, Box<[u8]>)]) {
        let from = CachedState::dirty(generation);
        for (node, _, _) in flushed {
            if node.cached_state() == from {
                node.set_cached_state(CachedState::Clean);
            }
        }
    }

    /// SIEVE sweep: evict clean, frame-free, externally unreferenced nodes
    /// while the shard is over capacity.
    fn evict_overflow(&self, touched_id: u64) {
        let mut shard = self.shard_for(touched_id).lock();
        let mut scanned = 0;
        let max_scan = shard.ring.len() * 2;

        while shard.map.len() > self.capacity_per_shard && scanned < max_scan {
            scanned += 1;
            if shard.ring.is_empty() {
                break;
            }
            let hand = shard.hand % shard.ring.len();
            let id = shard.ring[hand];

            let node = shard.map.get(&id).filter(|n| n.id() == id).cloned();
            let Some(node) = node else {
                // Stale ring slot: the node moved or was removed.
                shard.ring.swap_remove(hand);
                continue;
            };

            // Two references are ours: the map entry and this scan's
            // clone. Anything beyond that is the tree root or an active
            // descent.
            if node.clear_visited()
                || node.is_dirty()
                || node.has_bound_frames()
                || Arc::strong_count(&node) > 2
            {
                shard.hand = hand + 1;
                continue;
            }

            if !node.try_acquire_exclusive() {
                shard.hand = hand + 1;
                continue;
            }

            if node.is_dirty() || node.has_bound_frames() {
                node.release_exclusive();
                shard.hand = hand + 1;
                continue;
            }

            shard.map.remove(&id);
            shard.ring.swap_remove(hand);
            node.set_id(0);
            node.release_exclusive();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cache(capacity: usize) -> (tempfile::TempDir, NodeCache) {
        let dir = tempdir().unwrap();
        let file = Arc::new(PageFile::create(&dir.path().join("c.burrow"), 256).unwrap());
        let freelist = Arc::new(FreeList::new(1));
        let cache = NodeCache::new(capacity, 256, file, freelist, 0).unwrap();
        (dir, cache)
    }

    #[test]
    fn alloc_registers_and_latches() {
        let (_dir, cache) = cache(64);
        let node = cache.alloc_node().unwrap();
        assert!(node.is_dirty());
        let found = cache.node_map_get(node.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &node));
        node.release_exclusive();
    }

    #[test]
    fn load_round_trips_through_disk() {
        let (_dir, cache) = cache(64);
        let node = cache.alloc_node().unwrap();
        let id = node.id();
        node.data_mut().init_leaf(0);
        node.release_exclusive();

        // Persist and forget the node, then reload it.
        node.acquire_shared();
        let buf = node.data().buf().to_vec();
        node.release_shared();
        cache.file().write_page(id, &buf).unwrap();
        node.acquire_exclusive();
        node.set_cached_state(CachedState::Clean);
        cache.delete_node(&node);
        node.release_exclusive();

        let loaded = cache.load_node(id, LatchRequest::Shared).unwrap();
        assert!(loaded.data().is_leaf());
        assert_eq!(loaded.id(), id);
        loaded.release_shared();
    }

    #[test]
    fn mark_dirty_re_homes_the_node() {
        let (_dir, cache) = cache(64);
        let node = cache.alloc_node().unwrap();
        node.set_cached_state(CachedState::Clean);
        let old_id = node.id();

        assert!(cache.should_mark_dirty(&node));
        let changed = cache.mark_dirty(&node).unwrap();
        assert!(changed);
        assert_ne!(node.id(), old_id);
        assert!(cache.node_map_get(old_id).is_none());
        assert!(cache.node_map_get(node.id()).is_some());

        // Already dirty in this generation: no-op.
        assert!(!cache.should_mark_dirty(&node));
        assert!(!cache.mark_dirty(&node).unwrap());
        node.release_exclusive();
    }

    #[test]
    fn generation_flip_captures_dirty_nodes() {
        let (_dir, cache) = cache(64);
        let node = cache.alloc_node().unwrap();
        node.data_mut().init_leaf(0);
        node.release_exclusive();

        let generation = cache.flip_generation();
        let captured = cache.collect_dirty(generation);
        assert_eq!(captured.len(), 1);

        cache.finish_flush(generation, &captured);
        assert_eq!(node.cached_state(), CachedState::Clean);
    }

    #[test]
    fn eviction_spares_dirty_nodes() {
        let (_dir, cache) = cache(CACHE_SHARD_COUNT);
        let mut nodes = Vec::new();
        for _ in 0..CACHE_SHARD_COUNT * 3 {
            let node = cache.alloc_node().unwrap();
            node.data_mut().init_leaf(0);
            node.release_exclusive();
            nodes.push(node);
        }
        // Every node is dirty, so nothing could be evicted.
        assert_eq!(cache.len(), nodes.len());
    }
}
