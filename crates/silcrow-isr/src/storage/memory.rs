//! In-memory storage backend for ISR cache

use crate::cache::{estimate_size, AdapterStats, CacheEntry, CacheEntryMeta, MetaPatch};
use crate::clock::{system_clock, SharedClock};
use crate::config::MemoryConfig;
use crate::storage::CacheAdapter;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

type TagIndex = HashMap<String, HashSet<String>>;

struct Slot {
    entry: CacheEntry,
    size: usize,
    /// Logical access time, bumped by `get` and `set`
    last_accessed_at: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Slot>,
    tags: TagIndex,
    current_size: usize,
    tick: u64,
    closed: bool,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, path: &str) -> Option<Slot> {
        let slot = self.entries.remove(path)?;
        unindex(&mut self.tags, path, &slot.entry.meta.tags);
        self.current_size = self.current_size.saturating_sub(slot.size);
        Some(slot)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, slot)| slot.last_accessed_at)
            .map(|(path, _)| path.clone())?;
        self.remove(&victim);
        Some(victim)
    }
}

fn index(tags: &mut TagIndex, path: &str, entry_tags: &BTreeSet<String>) {
    for tag in entry_tags {
        tags.entry(tag.clone()).or_default().insert(path.to_string());
    }
}

fn unindex(tags: &mut TagIndex, path: &str, entry_tags: &BTreeSet<String>) {
    for tag in entry_tags {
        if let Some(bucket) = tags.get_mut(tag) {
            bucket.remove(path);
            if bucket.is_empty() {
                tags.remove(tag);
            }
        }
    }
}

/// In-memory storage backend
///
/// Bounded by entry count and by estimated size, evicting the least recently
/// used entry first. Entries and tag index live behind a single lock, so a
/// reader never sees one updated without the other.
///
/// Only suitable for a single-instance deployment: every process has its own
/// copy. Use a shared key-value backend when running several instances.
#[derive(Clone)]
pub struct MemoryAdapter {
    inner: Arc<RwLock<Inner>>,
    config: MemoryConfig,
    clock: SharedClock,
}

impl MemoryAdapter {
    /// Create a new memory storage backend
    pub fn new(config: MemoryConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: MemoryConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            config: MemoryConfig {
                max_entries: config.max_entries.max(1),
                max_size_bytes: config.max_size_bytes,
            },
            clock,
        }
    }

    /// Get cache size (number of entries)
    pub async fn size(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    /// Get the estimated bytes stored
    pub async fn total_bytes(&self) -> usize {
        self.inner.read().await.current_size
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

fn ensure_open(inner: &Inner) -> Result<()> {
    if inner.closed {
        bail!("memory adapter is closed");
    }
    Ok(())
}

#[async_trait]
impl CacheAdapter for MemoryAdapter {
    async fn get(&self, path: &str) -> Result<Option<CacheEntry>> {
        let mut inner = self.inner.write().await;
        ensure_open(&inner)?;

        let tick = inner.next_tick();
        Ok(inner.entries.get_mut(path).map(|slot| {
            slot.last_accessed_at = tick;
            slot.entry.clone()
        }))
    }

    async fn set(&self, path: &str, entry: CacheEntry) -> Result<()> {
        let size = estimate_size(&entry);
        if size > self.config.max_size_bytes {
            bail!(
                "entry for {} is {} bytes, above the {} byte cache limit",
                path,
                size,
                self.config.max_size_bytes
            );
        }

        let mut inner = self.inner.write().await;
        ensure_open(&inner)?;

        // Old tag associations go before the new ones are added.
        inner.remove(path);

        while inner.entries.len() + 1 > self.config.max_entries
            || inner.current_size + size > self.config.max_size_bytes
        {
            match inner.evict_lru() {
                Some(victim) => debug!(path = %victim, "evicted least recently used entry"),
                None => break,
            }
        }

        let tick = inner.next_tick();
        index(&mut inner.tags, path, &entry.meta.tags);
        inner.current_size += size;
        inner.entries.insert(
            path.to_string(),
            Slot {
                entry,
                size,
                last_accessed_at: tick,
            },
        );

        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        ensure_open(&inner)?;
        Ok(inner.remove(path).is_some())
    }

    async fn has(&self, path: &str) -> Result<bool> {
        let inner = self.inner.read().await;
        ensure_open(&inner)?;
        Ok(inner.entries.contains_key(path))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        ensure_open(&inner)?;
        Ok(inner.entries.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        ensure_open(&inner)?;
        inner.entries.clear();
        inner.tags.clear();
        inner.current_size = 0;
        Ok(())
    }

    async fn get_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        ensure_open(&inner)?;
        Ok(inner
            .tags
            .get(tag)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_meta(&self, path: &str, patch: MetaPatch) -> Result<bool> {
        let mut inner = self.inner.write().await;
        ensure_open(&inner)?;

        let Inner { entries, tags, .. } = &mut *inner;
        let Some(slot) = entries.get_mut(path) else {
            return Ok(false);
        };

        let old_tags = slot.entry.meta.tags.clone();
        patch.apply(&mut slot.entry.meta)?;

        if slot.entry.meta.tags != old_tags {
            unindex(tags, path, &old_tags);
            index(tags, path, &slot.entry.meta.tags);
        }

        Ok(true)
    }

    async fn get_meta(&self, path: &str) -> Result<Option<CacheEntryMeta>> {
        let inner = self.inner.read().await;
        ensure_open(&inner)?;
        Ok(inner.entries.get(path).map(|slot| slot.entry.meta.clone()))
    }

    async fn stats(&self) -> Result<AdapterStats> {
        let inner = self.inner.read().await;
        ensure_open(&inner)?;

        let now = self.clock.now_ms();
        let mut stats = AdapterStats::default();
        for (path, slot) in &inner.entries {
            stats.record(path, &slot.entry.meta, slot.size, now);
        }
        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.closed {
            inner.entries.clear();
            inner.tags.clear();
            inner.current_size = 0;
            inner.closed = true;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
