//! # B+Tree Access Layer
//!
//! The concurrent, latch-coupled B+tree at the heart of the engine.
//!
//! ## Components
//!
//! - [`node`]: one fixed-size page in memory — latch, dirty state, search
//!   vector, entry codecs, split/merge byte-level operations.
//! - [`split`]: the transient descriptor attached to a node that has
//!   produced a sibling whose separator is not yet in the parent.
//! - [`frame`]: one level of a cursor's position stack, registered with
//!   the node it binds so structural changes can fix cursors in place.
//! - [`fragment`]: out-of-line storage for keys and values that do not
//!   fit inline.
//! - [`tree`]: root holder and structural-change coordinator — finishing
//!   splits, root splits and collapses, dirty-path maintenance, verify.
//! - [`cursor`]: the primary engine — positioning, iteration, reads,
//!   writes, deletion cascades, compaction.
//!
//! ## Latch discipline
//!
//! Descents couple shared latches parent-to-child. Ascents try-acquire
//! the parent first and re-validate after blocking. Writers hold at most
//! one exclusive latch plus the left/this/right trio (in left-to-right
//! order) during merges and parent+child while finishing splits. All
//! structural changes run under the shared commit lock.

pub mod cursor;
pub mod fragment;
pub mod frame;
pub mod node;
pub mod split;
#[allow(clippy::module_inception)]
pub mod tree;

pub use cursor::{Cursor, CursorValue, ValueCondition};
pub use fragment::{FragmentStore, ValueStream};
pub use frame::CursorFrame;
pub use node::Node;
pub use split::{SeparatorKey, Split};
pub use tree::{CollectingVerifyObserver, CompactionObserver, Tree, VerifyObserver};
