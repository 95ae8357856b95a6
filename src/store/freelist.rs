//! # Free Page List
//!
//! Allocates page ids for the tree, preferring the lowest available id so
//! that compaction can migrate pages toward the front of the file. Freed
//! ids are recycled in two phases:
//!
//! - `release(id)` puts an id into the *deferred* set. The page still holds
//!   bytes the previous checkpoint depends on, so it must not be handed out
//!   again yet.
//! - `checkpoint_completed()` drains the deferred set into the allocatable
//!   set once a new checkpoint is durable.
//!
//! When no freed id is available, allocation extends the end of the file.
//!
//! ## Persistence
//!
//! At checkpoint the allocatable set is serialized into a chain of
//! dedicated freelist pages:
//!
//! ```text
//! +------------------+
//! | next_page (8B)   |  0 terminates the chain
//! | count (4B)       |
//! | ids (8B each)    |
//! +------------------+
//! ```
//!
//! The chain pages themselves are drawn from the set being persisted, so
//! the snapshot is self-contained; on load the chain pages are returned to
//! the allocatable set.

use std::collections::BinaryHeap;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use super::pagefile::PageFile;

const CHAIN_HEADER: usize = 12;

#[derive(Debug, Default)]
struct FreeListState {
    /// Min-heap of allocatable ids (lowest first).
    free: BinaryHeap<std::cmp::Reverse<u64>>,
    /// Ids freed since the last completed checkpoint.
    deferred: Vec<u64>,
    /// Chain pages holding the current on-disk snapshot; they free up
    /// only when the next snapshot supersedes them.
    chain: Vec<u64>,
    /// Next id past the end of the allocated region.
    next_id: u64,
}

#[derive(Debug)]
pub struct FreeList {
    state: Mutex<FreeListState>,
}

impl FreeList {
    /// A fresh list for a new database: page 0 is the header, allocation
    /// starts at 1.
    pub fn new(next_id: u64) -> Self {
        Self {
            state: Mutex::new(FreeListState {
                next_id,
                ..Default::default()
            }),
        }
    }

    /// Loads the persisted chain starting at `head` (0 for an empty list).
    pub fn load(file: &PageFile, head: u64, next_id: u64) -> Result<Self> {
        let list = Self::new(next_id);
        if head == 0 {
            return Ok(list);
        }

        let page_size = file.page_size();
        let mut buf = vec![0u8; page_size];
        let mut chain = head;
        {
            let mut state = list.state.lock();
            while chain != 0 {
                file.read_page(chain, &mut buf)?;
                let next = u64::from_le_bytes(buf[0..8].try_into().unwrap());
                let count = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
                ensure!(
                    CHAIN_HEADER + count * 8 <= page_size,
                    "corrupt freelist page {}: count {} exceeds page capacity",
                    chain,
                    count
                );
                for i in 0..count {
                    let off = CHAIN_HEADER + i * 8;
                    let id = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
                    state.free.push(std::cmp::Reverse(id));
                }
                // The chain page itself stays reserved until the next
                // checkpoint stops referencing it.
                state.chain.push(chain);
                chain = next;
            }
        }
        Ok(list)
    }

    /// Allocates the lowest available page id, extending the file region
    /// when the free set is empty.
    pub fn allocate(&self) -> u64 {
        let mut state = self.state.lock();
        if let Some(std::cmp::Reverse(id)) = state.free.pop() {
            return id;
        }
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    /// Releases an id into the deferred set; it becomes allocatable after
    /// the next completed checkpoint.
    pub fn release(&self, id: u64) {
        debug_assert!(id != 0, "page 0 is the header page");
        self.state.lock().deferred.push(id);
    }

    /// Makes every deferred id allocatable. Called once the checkpoint
    /// that stopped depending on those pages is durable.
    pub fn checkpoint_completed(&self) {
        let mut state = self.state.lock();
        let deferred = std::mem::take(&mut state.deferred);
        for id in deferred {
            state.free.push(std::cmp::Reverse(id));
        }
    }

    /// One past the highest id ever allocated.
    pub fn end_of_region(&self) -> u64 {
        self.state.lock().next_id
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Serializes the allocatable set into a page chain, returning the head
    /// id (0 when nothing to persist). The deferred set is intentionally
    /// not persisted: after a crash the deferred pages are still referenced
    /// by the checkpoint being recovered.
    pub fn persist(&self, file: &PageFile) -> Result<u64> {
        let page_size = file.page_size();
        let per_page = (page_size - CHAIN_HEADER) / 8;

        let mut state = self.state.lock();
        if state.free.is_empty() {
            // The new header records no chain, so the previous snapshot's
            // chain pages are superseded once it lands.
            let old_chain = std::mem::take(&mut state.chain);
            state.deferred.extend(old_chain);
            return Ok(0);
        }

        let mut ids: Vec<u64> = state.free.iter().map(|r| r.0).collect();
        ids.sort_unstable();

        // Chain pages come out of the set being persisted.
        let mut chain_pages = Vec::new();
        loop {
            let remaining = ids.len();
            if remaining == 0 {
                break;
            }
            let need = remaining.div_ceil(per_page);
            if chain_pages.len() >= need {
                break;
            }
            // Lowest ids become chain pages; they are no longer free.
            chain_pages.push(ids.remove(0));
        }

        if ids.is_empty() {
            // The extraction consumed every id (a lone freed page). Keep
            // exactly one page as an empty chain head so nothing is
            // stranded; the loader hands it back through the chain slot.
            while chain_pages.len() > 1 {
                ids.push(chain_pages.pop().expect("non-empty"));
            }
            ids.sort_unstable();
        }

        let mut buf = vec![0u8; page_size];
        let mut head = 0u64;
        let mut chunks: Vec<&[u64]> = ids.chunks(per_page).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        debug_assert_eq!(chunks.len(), chain_pages.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            let page_id = chain_pages[i];
            buf.fill(0);
            buf[0..8].copy_from_slice(&head.to_le_bytes());
            buf[8..12].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
            for (j, id) in chunk.iter().enumerate() {
                let off = CHAIN_HEADER + j * 8;
                buf[off..off + 8].copy_from_slice(&id.to_le_bytes());
            }
            file.write_page(page_id, &buf)?;
            head = page_id;
        }

        // Rebuild the in-memory set: listed ids stay free. The new chain
        // pages back the snapshot being published; the previous snapshot's
        // chain is superseded once the header lands, so it is deferred.
        state.free.clear();
        for id in &ids {
            state.free.push(std::cmp::Reverse(*id));
        }
        let old_chain = std::mem::replace(&mut state.chain, chain_pages);
        state.deferred.extend(old_chain);

        Ok(head)
    }
}
