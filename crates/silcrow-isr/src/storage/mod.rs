//! Storage backends for ISR cache

use crate::cache::{AdapterStats, CacheEntry, CacheEntryMeta, MetaPatch};
use anyhow::Result;
use async_trait::async_trait;

pub mod kv;
pub mod memory;

#[cfg(feature = "dragonfly")]
pub mod dragonfly;

/// Trait for ISR storage backends
///
/// Every backend keeps a tag → path index next to the entries. After a
/// successful `set`, `delete`, `update_meta` or `clear`, a path is listed
/// under a tag exactly when that tag is in the entry's `meta.tags`.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    /// Get a cached page by path
    async fn get(&self, path: &str) -> Result<Option<CacheEntry>>;

    /// Store a page, replacing the tag associations of any previous entry
    async fn set(&self, path: &str, entry: CacheEntry) -> Result<()>;

    /// Delete a cached page, returning whether anything was removed
    async fn delete(&self, path: &str) -> Result<bool>;

    /// Check if a path is cached
    async fn has(&self, path: &str) -> Result<bool>;

    /// All cached paths
    async fn keys(&self) -> Result<Vec<String>>;

    /// Drop every entry and the tag index
    async fn clear(&self) -> Result<()>;

    /// Paths carrying `tag`
    async fn get_by_tag(&self, tag: &str) -> Result<Vec<String>>;

    /// Merge `patch` into the entry's metadata; `false` if the path is absent
    async fn update_meta(&self, path: &str, patch: MetaPatch) -> Result<bool>;

    /// Metadata without the page body
    async fn get_meta(&self, path: &str) -> Result<Option<CacheEntryMeta>>;

    /// Aggregate counts and sizes
    async fn stats(&self) -> Result<AdapterStats>;

    /// Release resources. Calling it twice is a no-op.
    async fn close(&self) -> Result<()>;

    /// Get storage backend name
    fn name(&self) -> &'static str;
}
