//! Freshness classification and response headers over a cache adapter

use crate::cache::{AdapterStats, CacheEntry, EntryStatus, MetaPatch};
use crate::clock::SharedClock;
use crate::config::CacheControlPolicy;
use crate::error::{IsrError, Result};
use crate::storage::CacheAdapter;
use std::sync::Arc;
use tracing::warn;

/// What the cache knows about a path at one instant
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheLookup {
    pub found: bool,
    /// Stale entries are still servable
    pub can_serve: bool,
    /// True whenever the effective status is not `Fresh`.
    ///
    /// That covers entries past their interval, and also entries still
    /// inside it whose stored status is `Stale` (invalidated), `Revalidating`
    /// or `Error`. Serving any of them queues a revalidation; the revalidator
    /// collapses duplicates and applies backoff.
    pub is_stale: bool,
    pub entry: Option<CacheEntry>,
    /// Stored status with the time-based check applied
    pub status: Option<EntryStatus>,
}

impl CacheLookup {
    fn miss() -> Self {
        Self::default()
    }
}

/// Runtime view of the page cache
#[derive(Clone)]
pub struct RuntimeCache {
    adapter: Arc<dyn CacheAdapter>,
    clock: SharedClock,
    policy: CacheControlPolicy,
}

impl RuntimeCache {
    pub fn new(adapter: Arc<dyn CacheAdapter>, clock: SharedClock, policy: CacheControlPolicy) -> Self {
        Self {
            adapter,
            clock,
            policy,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn CacheAdapter> {
        &self.adapter
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Look `path` up and classify it.
    ///
    /// A failing adapter read counts as a miss so the request falls through
    /// to regeneration.
    pub async fn lookup(&self, path: &str) -> CacheLookup {
        let entry = match self.adapter.get(path).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return CacheLookup::miss(),
            Err(e) => {
                warn!(%path, adapter = self.adapter.name(), error = %e, "cache read failed");
                return CacheLookup::miss();
            }
        };

        let status = entry.meta.effective_status(self.clock.now_ms());
        CacheLookup {
            found: true,
            can_serve: true,
            is_stale: status != EntryStatus::Fresh,
            entry: Some(entry),
            status: Some(status),
        }
    }

    /// `Cache-Control` value for serving `entry`.
    ///
    /// Entries without an interval only change through on-demand
    /// invalidation, so clients are told to revalidate every time.
    pub fn cache_control(&self, entry: &CacheEntry) -> String {
        match entry.meta.revalidate_interval {
            0 => "public, max-age=0, must-revalidate".to_string(),
            interval => format!(
                "public, max-age={}, stale-while-revalidate={}",
                interval,
                self.policy.stale_window(interval)
            ),
        }
    }

    /// Strong tag from the content hash, weak tag from `revalidatedAt` otherwise
    pub fn etag(&self, entry: &CacheEntry) -> String {
        match entry.meta.content_hash {
            Some(ref hash) => format!("\"{}\"", hash),
            None => format!("W/\"{:x}\"", entry.meta.revalidated_at),
        }
    }

    /// Mark one path stale; `false` when it isn't cached
    pub async fn invalidate_path(&self, path: &str) -> Result<bool> {
        self.adapter
            .update_meta(path, MetaPatch::status(EntryStatus::Stale))
            .await
            .map_err(|e| IsrError::adapter(&e))
    }

    /// Mark every path carrying `tag` stale, returning those paths
    pub async fn invalidate_tag(&self, tag: &str) -> Result<Vec<String>> {
        let paths = self
            .adapter
            .get_by_tag(tag)
            .await
            .map_err(|e| IsrError::adapter(&e))?;

        let mut invalidated = Vec::with_capacity(paths.len());
        for path in paths {
            if self.invalidate_path(&path).await? {
                invalidated.push(path);
            }
        }
        Ok(invalidated)
    }

    pub async fn stats(&self) -> Result<AdapterStats> {
        self.adapter.stats().await.map_err(|e| IsrError::adapter(&e))
    }
}
