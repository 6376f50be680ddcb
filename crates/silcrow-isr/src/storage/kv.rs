//! Networked key-value storage backend for ISR cache
//!
//! Each cached path is split over separate keys so metadata can be read
//! without fetching the page body:
//!
//! - `{prefix}entry:{path}`: JSON body (`html`, `props`, `headers`)
//! - `{prefix}meta:{path}`: JSON [`CacheEntryMeta`]
//! - `{prefix}tag:{tag}`: set of paths carrying the tag
//!
//! Tag set updates are best-effort. A failed `SADD`/`SREM` is logged and the
//! operation carries on, so the tag index may briefly disagree with the
//! metadata after a network fault. `get_by_tag` drops members whose metadata
//! no longer exists.

use crate::cache::{AdapterStats, CacheEntry, CacheEntryMeta, MetaPatch};
use crate::clock::{system_clock, SharedClock};
use crate::config::KvConfig;
use crate::storage::CacheAdapter;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Minimal remote key-value protocol the adapter is written against.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value`, expiring after `ttl` when given
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Change or remove (`None`) the expiry of an existing key
    async fn expire(&self, key: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete keys, returning how many existed
    async fn del(&self, keys: &[String]) -> Result<usize>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// All keys starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredBody {
    html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    props: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    headers: Option<BTreeMap<String, String>>,
}

/// Cache adapter over a [`KvStore`]
///
/// This is the backend to use when several server instances share one
/// cache; the store is the source of truth.
#[derive(Clone)]
pub struct KvAdapter {
    store: Arc<dyn KvStore>,
    config: KvConfig,
    clock: SharedClock,
    closed: Arc<AtomicBool>,
}

impl KvAdapter {
    pub fn new(store: Arc<dyn KvStore>, config: KvConfig) -> Self {
        Self::with_clock(store, config, system_clock())
    }

    pub fn with_clock(store: Arc<dyn KvStore>, config: KvConfig, clock: SharedClock) -> Self {
        Self {
            store,
            config,
            clock,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn entry_key(&self, path: &str) -> String {
        format!("{}entry:{}", self.config.key_prefix, path)
    }

    fn meta_key(&self, path: &str) -> String {
        format!("{}meta:{}", self.config.key_prefix, path)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}tag:{}", self.config.key_prefix, tag)
    }

    /// Store TTL: the revalidation interval plus the grace window, or none
    /// when the entry never revalidates by time.
    pub fn ttl_for(&self, meta: &CacheEntryMeta) -> Option<Duration> {
        (meta.revalidate_interval > 0).then(|| {
            Duration::from_secs(meta.revalidate_interval) + Duration::from_secs(self.config.ttl_grace_secs)
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("kv adapter is closed");
        }
        Ok(())
    }

    async fn read_meta(&self, path: &str) -> Result<Option<CacheEntryMeta>> {
        match self.store.get(&self.meta_key(path)).await? {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("Failed to deserialize entry metadata")?,
            )),
            None => Ok(None),
        }
    }

    async fn write_meta(&self, path: &str, meta: &CacheEntryMeta) -> Result<()> {
        let json = serde_json::to_string(meta).context("Failed to serialize entry metadata")?;
        self.store
            .set(&self.meta_key(path), json, self.ttl_for(meta))
            .await
            .context("Failed to write entry metadata")
    }

    async fn tag_add(&self, path: &str, tags: impl Iterator<Item = &String>) {
        for tag in tags {
            if let Err(e) = self.store.sadd(&self.tag_key(tag), path).await {
                warn!(%path, %tag, error = %e, "failed to add path to tag index");
            }
        }
    }

    async fn tag_remove(&self, path: &str, tags: impl Iterator<Item = &String>) {
        for tag in tags {
            if let Err(e) = self.store.srem(&self.tag_key(tag), path).await {
                warn!(%path, %tag, error = %e, "failed to remove path from tag index");
            }
        }
    }

    /// SADD is idempotent, so every current tag is re-added. A membership
    /// lost to an earlier failed SADD is repaired by the next successful set.
    async fn reindex(&self, path: &str, old: &BTreeSet<String>, new: &BTreeSet<String>) {
        self.tag_remove(path, old.difference(new)).await;
        self.tag_add(path, new.iter()).await;
    }
}

#[async_trait]
impl CacheAdapter for KvAdapter {
    async fn get(&self, path: &str) -> Result<Option<CacheEntry>> {
        self.ensure_open()?;

        let entry_key = self.entry_key(path);
        let (body, meta) = match tokio::try_join!(
            self.store.get(&entry_key),
            self.read_meta(path)
        ) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(%path, error = %e, "kv read failed, treating as cache miss");
                return Ok(None);
            }
        };

        let (Some(body), Some(meta)) = (body, meta) else {
            return Ok(None);
        };

        let body: StoredBody = match serde_json::from_str(&body) {
            Ok(body) => body,
            Err(e) => {
                warn!(%path, error = %e, "corrupt kv entry, treating as cache miss");
                return Ok(None);
            }
        };

        Ok(Some(CacheEntry {
            html: body.html,
            props: body.props,
            headers: body.headers,
            meta,
        }))
    }

    async fn set(&self, path: &str, entry: CacheEntry) -> Result<()> {
        self.ensure_open()?;

        let old_tags = match self.read_meta(path).await {
            Ok(meta) => meta.map(|m| m.tags).unwrap_or_default(),
            Err(e) => {
                warn!(%path, error = %e, "could not read previous metadata before set");
                BTreeSet::new()
            }
        };

        let CacheEntry {
            html,
            props,
            headers,
            meta,
        } = entry;

        let body = serde_json::to_string(&StoredBody { html, props, headers })
            .context("Failed to serialize page")?;
        let ttl = self.ttl_for(&meta);

        self.store
            .set(&self.entry_key(path), body, ttl)
            .await
            .context("Failed to write entry body")?;
        self.write_meta(path, &meta).await?;

        self.reindex(path, &old_tags, &meta.tags).await;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        self.ensure_open()?;

        let tags = match self.read_meta(path).await {
            Ok(meta) => meta.map(|m| m.tags).unwrap_or_default(),
            Err(e) => {
                warn!(%path, error = %e, "could not read metadata before delete");
                BTreeSet::new()
            }
        };

        let removed = self
            .store
            .del(&[self.entry_key(path), self.meta_key(path)])
            .await
            .context("Failed to delete entry")?;

        self.tag_remove(path, tags.iter()).await;
        Ok(removed > 0)
    }

    async fn has(&self, path: &str) -> Result<bool> {
        self.ensure_open()?;
        self.store.exists(&self.meta_key(path)).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let prefix = self.meta_key("");
        let keys = self.store.keys_with_prefix(&prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        let keys = self.store.keys_with_prefix(&self.config.key_prefix).await?;
        if !keys.is_empty() {
            self.store.del(&keys).await.context("Failed to clear keys")?;
        }
        Ok(())
    }

    async fn get_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let members = self.store.smembers(&self.tag_key(tag)).await?;

        let mut live = Vec::with_capacity(members.len());
        for path in members {
            let still_tagged = match self.read_meta(&path).await {
                Ok(Some(meta)) => meta.tags.contains(tag),
                Ok(None) => false,
                Err(e) => {
                    warn!(%path, error = %e, "could not verify tag member");
                    true
                }
            };

            if still_tagged {
                live.push(path);
            } else if let Err(e) = self.store.srem(&self.tag_key(tag), &path).await {
                warn!(%path, %tag, error = %e, "failed to drop dangling tag member");
            }
        }
        Ok(live)
    }

    async fn update_meta(&self, path: &str, patch: MetaPatch) -> Result<bool> {
        self.ensure_open()?;
        let Some(mut meta) = self.read_meta(path).await? else {
            return Ok(false);
        };

        let old_tags = meta.tags.clone();
        let old_ttl = self.ttl_for(&meta);
        patch.apply(&mut meta)?;

        self.write_meta(path, &meta).await?;

        let new_ttl = self.ttl_for(&meta);
        if new_ttl != old_ttl {
            self.store
                .expire(&self.entry_key(path), new_ttl)
                .await
                .context("Failed to update entry expiry")?;
        }

        self.reindex(path, &old_tags, &meta.tags).await;
        Ok(true)
    }

    async fn get_meta(&self, path: &str) -> Result<Option<CacheEntryMeta>> {
        self.ensure_open()?;
        self.read_meta(path).await
    }

    async fn stats(&self) -> Result<AdapterStats> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        let mut stats = AdapterStats::default();

        for path in self.keys().await? {
            let Some(meta) = self.read_meta(&path).await? else {
                continue;
            };
            let size = self
                .store
                .get(&self.entry_key(&path))
                .await?
                .map(|body| body.len())
                .unwrap_or(0);
            stats.record(&path, &meta, size, now);
        }
        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.store.close().await
    }

    fn name(&self) -> &'static str {
        "kv"
    }
}
