//! Cached page types and utilities

use crate::error::{IsrError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Fixed per-entry overhead added to size estimates for the metadata block.
pub const META_OVERHEAD_BYTES: usize = 500;

/// Freshness classification stored with every entry.
///
/// The stored value is advisory: readers recompute `Stale` from timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Fresh,
    Stale,
    Revalidating,
    Error,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Fresh => "fresh",
            EntryStatus::Stale => "stale",
            EntryStatus::Revalidating => "revalidating",
            EntryStatus::Error => "error",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata kept alongside every cached page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryMeta {
    /// Milliseconds since epoch; never changes after creation
    pub created_at: i64,

    /// Milliseconds since epoch of the last successful (re)generation
    pub revalidated_at: i64,

    /// Seconds between automatic revalidations, `0` disables them
    #[serde(default)]
    pub revalidate_interval: u64,

    #[serde(default)]
    pub status: EntryStatus,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub regeneration_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl CacheEntryMeta {
    /// Metadata for a page generated at `now_ms`
    pub fn new(now_ms: i64, revalidate_interval: u64) -> Self {
        Self {
            created_at: now_ms,
            revalidated_at: now_ms,
            revalidate_interval,
            status: EntryStatus::Fresh,
            tags: BTreeSet::new(),
            regeneration_count: 0,
            content_hash: None,
        }
    }

    /// Age since the last successful generation, in milliseconds
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.revalidated_at).max(0)
    }

    /// Whether the revalidation interval has elapsed.
    ///
    /// Entries without an interval never expire by time.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.revalidate_interval > 0
            && self.age_ms(now_ms) > (self.revalidate_interval as i64).saturating_mul(1000)
    }

    /// Stored status with the time-based check applied on top.
    pub fn effective_status(&self, now_ms: i64) -> EntryStatus {
        match self.status {
            EntryStatus::Fresh if self.is_expired(now_ms) => EntryStatus::Stale,
            status => status,
        }
    }
}

/// A cached page with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// The rendered HTML
    pub html: String,

    /// Data the page was rendered from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<serde_json::Value>,

    /// Response headers replayed when serving the page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,

    pub meta: CacheEntryMeta,
}

impl CacheEntry {
    /// Create an entry and stamp its content hash
    pub fn new(html: impl Into<String>, mut meta: CacheEntryMeta) -> Self {
        let html = html.into();
        meta.content_hash = Some(content_hash(&html));
        Self {
            html,
            props: None,
            headers: None,
            meta,
        }
    }

    pub fn with_props(mut self, props: serde_json::Value) -> Self {
        self.props = Some(props);
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// Hex SHA-256 digest of the page body, truncated to 128 bits
pub fn content_hash(html: &str) -> String {
    let digest = Sha256::digest(html.as_bytes());
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Approximate memory footprint of an entry.
///
/// Strings are counted as UTF-16 (two bytes per code unit), plus a fixed
/// metadata overhead.
pub fn estimate_size(entry: &CacheEntry) -> usize {
    let utf16 = |s: &str| s.encode_utf16().count() * 2;

    let props = entry
        .props
        .as_ref()
        .and_then(|p| serde_json::to_string(p).ok())
        .map(|s| utf16(&s))
        .unwrap_or(0);

    let headers = entry
        .headers
        .as_ref()
        .and_then(|h| serde_json::to_string(h).ok())
        .map(|s| utf16(&s))
        .unwrap_or(0);

    utf16(&entry.html) + props + headers + META_OVERHEAD_BYTES
}

/// Partial metadata update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaPatch {
    pub revalidated_at: Option<i64>,
    pub revalidate_interval: Option<u64>,
    pub status: Option<EntryStatus>,
    pub tags: Option<BTreeSet<String>>,
    pub regeneration_count: Option<u64>,
    pub content_hash: Option<Option<String>>,
}

impl MetaPatch {
    pub fn status(status: EntryStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Merge into `meta`.
    ///
    /// Rejects a `revalidated_at` earlier than the entry's `created_at`.
    pub fn apply(&self, meta: &mut CacheEntryMeta) -> Result<()> {
        if let Some(revalidated_at) = self.revalidated_at {
            if revalidated_at < meta.created_at {
                return Err(IsrError::Validation(format!(
                    "revalidatedAt {} precedes createdAt {}",
                    revalidated_at, meta.created_at
                )));
            }
            meta.revalidated_at = revalidated_at;
        }
        if let Some(interval) = self.revalidate_interval {
            meta.revalidate_interval = interval;
        }
        if let Some(status) = self.status {
            meta.status = status;
        }
        if let Some(ref tags) = self.tags {
            meta.tags = tags.clone();
        }
        if let Some(count) = self.regeneration_count {
            meta.regeneration_count = count;
        }
        if let Some(ref hash) = self.content_hash {
            meta.content_hash = hash.clone();
        }
        Ok(())
    }
}

/// Entry counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub fresh: usize,
    pub stale: usize,
    pub revalidating: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: EntryStatus) {
        match status {
            EntryStatus::Fresh => self.fresh += 1,
            EntryStatus::Stale => self.stale += 1,
            EntryStatus::Revalidating => self.revalidating += 1,
            EntryStatus::Error => self.error += 1,
        }
    }
}

/// Path and creation time of the oldest or newest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryStamp {
    pub path: String,
    pub created_at: i64,
}

/// Snapshot reported by a storage adapter
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStats {
    pub entry_count: usize,
    pub size_bytes: usize,
    pub stale_count: usize,
    pub by_status: StatusCounts,
    pub oldest_entry: Option<EntryStamp>,
    pub newest_entry: Option<EntryStamp>,
}

impl AdapterStats {
    /// Fold one entry into the snapshot
    pub fn record(&mut self, path: &str, meta: &CacheEntryMeta, size: usize, now_ms: i64) {
        let status = meta.effective_status(now_ms);
        self.entry_count += 1;
        self.size_bytes += size;
        self.by_status.record(status);
        if status == EntryStatus::Stale {
            self.stale_count += 1;
        }

        let stamp = || EntryStamp {
            path: path.to_string(),
            created_at: meta.created_at,
        };
        if self
            .oldest_entry
            .as_ref()
            .map_or(true, |oldest| meta.created_at < oldest.created_at)
        {
            self.oldest_entry = Some(stamp());
        }
        if self
            .newest_entry
            .as_ref()
            .map_or(true, |newest| meta.created_at > newest.created_at)
        {
            self.newest_entry = Some(stamp());
        }
    }
}

/// Request-level statistics for the ISR handler
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Total number of cache hits
    pub hits: u64,

    /// Total number of cache misses
    pub misses: u64,

    /// Hits that were served stale
    pub stale_hits: u64,

    /// Total number of successful regenerations
    pub regenerations: u64,

    /// Total number of failed regenerations
    pub regeneration_failures: u64,
}

impl CacheStats {
    /// Calculate cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_hash_is_stable() {
        let a = CacheEntry::new("<p>hi</p>", CacheEntryMeta::new(0, 60));
        let b = CacheEntry::new("<p>hi</p>", CacheEntryMeta::new(5, 10));
        let c = CacheEntry::new("<p>bye</p>", CacheEntryMeta::new(0, 60));

        assert_eq!(a.meta.content_hash, b.meta.content_hash);
        assert_ne!(a.meta.content_hash, c.meta.content_hash);
        assert_eq!(a.meta.content_hash.as_deref().map(str::len), Some(32));
    }

    #[test]
    fn test_expiry_uses_revalidated_at() {
        let mut meta = CacheEntryMeta::new(0, 60);
        assert!(!meta.is_expired(60_000));
        assert!(meta.is_expired(60_001));

        meta.revalidated_at = 30_000;
        assert!(!meta.is_expired(60_001));
        assert_eq!(meta.effective_status(90_001), EntryStatus::Stale);
    }

    #[test]
    fn test_zero_interval_never_expires() {
        let meta = CacheEntryMeta::new(0, 0);
        assert!(!meta.is_expired(i64::MAX));
        assert_eq!(meta.effective_status(i64::MAX), EntryStatus::Fresh);
    }

    #[test]
    fn test_effective_status_keeps_non_fresh_flags() {
        let mut meta = CacheEntryMeta::new(0, 1);
        meta.status = EntryStatus::Error;
        assert_eq!(meta.effective_status(10_000), EntryStatus::Error);
    }

    #[test]
    fn test_estimate_size_counts_utf16() {
        let entry = CacheEntry::new("héllo", CacheEntryMeta::new(0, 0));
        assert_eq!(estimate_size(&entry), 10 + META_OVERHEAD_BYTES);

        let with_props = entry.clone().with_props(json!({"a": 1}));
        // {"a":1} is 7 code units
        assert_eq!(estimate_size(&with_props), 10 + 14 + META_OVERHEAD_BYTES);
    }

    #[test]
    fn test_meta_patch_rejects_time_travel() {
        let mut meta = CacheEntryMeta::new(1_000, 60);
        let patch = MetaPatch {
            revalidated_at: Some(999),
            ..MetaPatch::default()
        };
        assert!(matches!(patch.apply(&mut meta), Err(IsrError::Validation(_))));
        assert_eq!(meta.revalidated_at, 1_000);
    }

    #[test]
    fn test_meta_serializes_camel_case() {
        let meta = CacheEntryMeta::new(1, 2);
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["createdAt"], 1);
        assert_eq!(value["revalidateInterval"], 2);
        assert_eq!(value["status"], "fresh");
        assert!(value.get("contentHash").is_none());
    }

    #[test]
    fn test_adapter_stats_record() {
        let mut stats = AdapterStats::default();
        let old = CacheEntryMeta::new(0, 1);
        let new = CacheEntryMeta::new(5_000, 0);
        stats.record("/old", &old, 600, 5_000);
        stats.record("/new", &new, 700, 5_000);

        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.size_bytes, 1_300);
        assert_eq!(stats.stale_count, 1);
        assert_eq!(stats.by_status.fresh, 1);
        assert_eq!(stats.oldest_entry.unwrap().path, "/old");
        assert_eq!(stats.newest_entry.unwrap().path, "/new");
    }

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 2,
            misses: 1,
            ..CacheStats::default()
        };
        assert_eq!(stats.hit_rate(), 2.0 / 3.0);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
