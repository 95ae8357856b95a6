//! # Database Configuration
//!
//! BurrowDB is a library: configuration is supplied programmatically
//! through [`DatabaseBuilder`], never from a CLI or environment variables.
//! The builder validates interdependent settings before any file is
//! touched.
//!
//! ## Constant Relationships
//!
//! ```text
//! page_size (default 4096, min 256, power of two)
//!       │
//!       ├─> PAGE_HEADER_SIZE (16 bytes, fixed)
//!       ├─> usable page body (page_size - 16)
//!       └─> max inline entry (~ body / 4, larger keys/values fragment)
//!
//! cache_size (pages, default 1024, min CACHE_SHARD_COUNT)
//!       │
//!       └─> CACHE_SHARD_COUNT (16) — at least one page per shard
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::{ensure, Result};

use crate::db::Database;
use crate::repl::ReplicationManager;
use crate::txn::DurabilityMode;

/// Number of independently locked shards in the node cache.
pub const CACHE_SHARD_COUNT: usize = 16;

/// Fixed per-page header size; see `tree::node` for the layout.
pub const PAGE_HEADER_SIZE: usize = 16;

pub const MIN_PAGE_SIZE: usize = 256;
pub const MAX_PAGE_SIZE: usize = 65536;
pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_CACHE_SIZE: usize = 1024;

/// Default timeout for key-lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub page_size: usize,
    pub cache_size: usize,
    pub lock_timeout: Duration,
    pub durability: DurabilityMode,
    pub replication: Option<Arc<dyn ReplicationManager>>,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("cache_size", &self.cache_size)
            .field("lock_timeout", &self.lock_timeout)
            .field("durability", &self.durability)
            .field("replication", &self.replication.is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct DatabaseBuilder {
    path: Option<PathBuf>,
    page_size: Option<usize>,
    cache_size: Option<usize>,
    lock_timeout: Option<Duration>,
    durability: Option<DurabilityMode>,
    replication: Option<Arc<dyn ReplicationManager>>,
}

impl DatabaseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = Some(bytes);
        self
    }

    /// Cache capacity in pages.
    pub fn cache_size(mut self, pages: usize) -> Self {
        self.cache_size = Some(pages);
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = Some(mode);
        self
    }

    pub fn replication(mut self, manager: Arc<dyn ReplicationManager>) -> Self {
        self.replication = Some(manager);
        self
    }

    pub fn build_config(self) -> Result<DatabaseConfig> {
        let path = self
            .path
            .ok_or_else(|| eyre::eyre!("database path is required"))?;

        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        ensure!(
            (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "page size {} out of range [{}, {}]",
            page_size,
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE
        );
        ensure!(
            page_size.is_power_of_two(),
            "page size {} must be a power of two",
            page_size
        );

        let cache_size = self.cache_size.unwrap_or(DEFAULT_CACHE_SIZE);
        ensure!(
            cache_size >= CACHE_SHARD_COUNT,
            "cache size {} must be at least {} (one page per shard)",
            cache_size,
            CACHE_SHARD_COUNT
        );

        Ok(DatabaseConfig {
            path,
            page_size,
            cache_size,
            lock_timeout: self.lock_timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT),
            durability: self.durability.unwrap_or(DurabilityMode::Sync),
            replication: self.replication,
        })
    }

    pub fn open(self) -> Result<Arc<Database>> {
        Database::open_with(self.build_config()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_missing_path() {
        assert!(DatabaseBuilder::new().build_config().is_err());
    }

    #[test]
    fn builder_rejects_bad_page_sizes() {
        let err = DatabaseBuilder::new()
            .path("/tmp/x")
            .page_size(100)
            .build_config();
        assert!(err.is_err());

        let err = DatabaseBuilder::new()
            .path("/tmp/x")
            .page_size(3000)
            .build_config();
        assert!(err.unwrap_err().to_string().contains("power of two"));
    }

    #[test]
    fn builder_applies_defaults() {
        let config = DatabaseBuilder::new().path("/tmp/x").build_config().unwrap();
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.cache_size, DEFAULT_CACHE_SIZE);
        assert_eq!(config.lock_timeout, DEFAULT_LOCK_TIMEOUT);
    }
}
