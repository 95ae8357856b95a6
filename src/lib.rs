//! # BurrowDB - Embedded Transactional Key/Value Storage
//!
//! BurrowDB is an embedded, transactional, ordered key/value storage engine
//! built around a concurrent B+tree over a paged store. Cursors traverse the
//! tree with fine-grained latch coupling, so readers and writers interleave
//! with structural changes (splits, merges) happening elsewhere in the tree.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrowdb::Database;
//!
//! let db = Database::builder()
//!     .path("./data.burrow")
//!     .page_size(4096)
//!     .cache_size(256)
//!     .open()?;
//!
//! let tree = db.tree();
//! let mut cursor = tree.cursor(None);
//! cursor.find_and_store(b"hello", Some(b"world"))?;
//!
//! cursor.first()?;
//! while let Some(key) = cursor.key() {
//!     println!("{:?} = {:?}", key, cursor.value());
//!     cursor.next()?;
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │        Public API (Database)         │
//! ├──────────────────────────────────────┤
//! │  Tree / Cursor (latch-coupled B+tree)│
//! ├───────────────────┬──────────────────┤
//! │   Lock Manager    │  Transactions    │
//! ├───────────────────┴──────────────────┤
//! │   Node Cache (shadow-paged, SIEVE)   │
//! ├──────────────────────────────────────┤
//! │   Redo Log │ Page File │ Free List   │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! - Each tree node carries a latch (shared/exclusive with try and
//!   upgrade/downgrade variants). Descents couple latches parent-to-child.
//! - Structural changes (finishing splits, merges, dirtying) hold the
//!   tree-wide commit lock in shared mode; checkpointing takes it
//!   exclusively to snapshot a consistent on-disk image.
//! - Logical isolation comes from the key-level lock manager; the latch
//!   layer only guarantees physical consistency of individual pages.
//!
//! ## Module Overview
//!
//! - [`tree`]: B+tree nodes, splits, cursor frames, and the cursor engine
//! - [`store`]: page file, free list, and the shadow-paging node cache
//! - [`lock`]: key-level lock manager with timeouts and deadlock detection
//! - [`txn`]: transactions, lock modes, durability modes, undo
//! - [`redo`]: append-only redo log with group commit and recovery
//! - [`repl`]: replication manager interface and loopback implementation

pub mod config;
pub mod db;
pub mod error;
pub mod latch;
pub mod lock;
pub mod redo;
pub mod repl;
pub mod store;
pub mod tree;
pub mod txn;

pub use config::{DatabaseBuilder, DatabaseConfig};
pub use db::Database;
pub use error::{ClosedError, CursorStateError, DeadlockError, LockTimeoutError};
pub use lock::LockResult;
pub use tree::{Cursor, Tree, ValueCondition, VerifyObserver};
pub use txn::{DurabilityMode, LockMode, Transaction};
