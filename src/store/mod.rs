//! # Paged Store
//!
//! The store layer supplies the tree with durable fixed-size pages and an
//! in-memory node cache:
//!
//! - [`pagefile`]: memory-mapped page file with the database header on
//!   page 0. Pages are copied between the map and cached node buffers;
//!   the map itself is never handed out across latch boundaries.
//! - [`freelist`]: lowest-first page-id allocator with deferred recycling.
//!   Ids freed while a checkpoint interval is open become allocatable only
//!   after that checkpoint completes, which keeps the previous on-disk
//!   image intact until the new one is durable (shadow paging).
//! - [`cache`]: sharded map from page id to [`crate::tree::Node`] with
//!   SIEVE-style eviction and the dirty-state / shadow-paging protocol.
//!
//! ## Shadow paging
//!
//! A clean node that is about to be mutated is first re-homed to a freshly
//! allocated page id; its old id is released into the deferred free set.
//! The caller then updates the parent's child reference. Until the next
//! checkpoint completes, the old page keeps the pre-mutation image, so a
//! crash rolls back to the previous checkpoint plus redo replay.

pub mod cache;
pub mod freelist;
pub mod pagefile;

pub use cache::{CachedState, LatchRequest, NodeCache};
pub use freelist::FreeList;
pub use pagefile::{DbHeader, PageFile, HEADER_PAGE_ID};
