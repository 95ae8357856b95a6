//! # Failure Kinds
//!
//! BurrowDB reports errors through `eyre::Result` like the rest of the
//! codebase, but a few failure kinds must be distinguishable by callers:
//! lock timeouts and deadlocks leave the cursor positioned with no
//! modification done, cursor-state errors indicate API misuse, and a closed
//! database fails everything hard. Those kinds are concrete types created
//! with `thiserror` and surfaced through `eyre::Report`, so call sites can
//! match them with `downcast_ref` without giving up `bail!`/`ensure!`
//! everywhere else.
//!
//! ## Recoverable vs Fatal
//!
//! Lock failures and cursor-state errors are recoverable: the tree is
//! untouched and the caller may retry. An unexpected error raised while a
//! mutation holds the commit lock is treated as corrupting; the database is
//! closed with the cause recorded and every subsequent operation returns
//! [`ClosedError`].

use std::time::Duration;

/// A lock could not be acquired within the requested timeout.
#[derive(Debug, Clone, thiserror::Error)]
#[error("lock acquisition timed out after {timeout:?} (tree {tree_id})")]
pub struct LockTimeoutError {
    pub tree_id: u64,
    pub timeout: Duration,
}

/// A lock wait would complete a cycle in the waits-for graph.
#[derive(Debug, Clone, thiserror::Error)]
#[error("deadlock detected while waiting for key lock (tree {tree_id})")]
pub struct DeadlockError {
    pub tree_id: u64,
}

/// An operation required a positioned cursor, or a key, and had none.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct CursorStateError(pub &'static str);

/// The database was closed, possibly due to an earlier fatal error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("database is closed: {}", .cause.as_deref().unwrap_or("closed by user"))]
pub struct ClosedError {
    pub cause: Option<String>,
}

/// True if the error is a lock timeout or deadlock, which leave the cursor
/// positioned and the tree unmodified.
pub fn is_lock_failure(err: &eyre::Report) -> bool {
    err.downcast_ref::<LockTimeoutError>().is_some() || err.downcast_ref::<DeadlockError>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_failures_downcast_through_eyre() {
        let report: eyre::Report = LockTimeoutError {
            tree_id: 7,
            timeout: Duration::from_millis(50),
        }
        .into();
        assert!(is_lock_failure(&report));
        assert_eq!(report.downcast_ref::<LockTimeoutError>().unwrap().tree_id, 7);

        let report: eyre::Report = DeadlockError { tree_id: 1 }.into();
        assert!(is_lock_failure(&report));

        let report = eyre::eyre!("plain failure");
        assert!(!is_lock_failure(&report));
    }

    #[test]
    fn closed_error_formats_cause() {
        let plain = ClosedError { cause: None };
        assert_eq!(plain.to_string(), "database is closed: closed by user");

        let caused = ClosedError {
            cause: Some("page checksum mismatch".into()),
        };
        assert!(caused.to_string().contains("page checksum mismatch"));
    }
}
