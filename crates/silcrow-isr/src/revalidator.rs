//! Background regeneration with per-path request collapsing
//!
//! At most one regeneration per path runs at a time. The in-flight marker
//! is taken synchronously when a revalidation is queued, so two requests
//! racing on the same stale page produce exactly one render. Paths whose
//! regeneration keeps failing are retried with exponential backoff.

use crate::cache::{CacheEntry, CacheEntryMeta, EntryStatus, MetaPatch};
use crate::config::RetryPolicy;
use crate::error::{IsrError, Result};
use crate::events::{EventBus, IsrEvent};
use crate::render::{Generated, PagePipeline, RenderMode};
use crate::route::RouteResolver;
use crate::runtime::RuntimeCache;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a revalidation request did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// Another regeneration of the same path is running
    InFlight,
    /// The path failed recently and is waiting out its backoff
    Backoff { retry_in_ms: u64 },
}

/// Result of one revalidation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RevalidationOutcome {
    /// New content was written
    Regenerated,
    /// The render matched the cached content; only metadata was refreshed
    Unchanged,
    /// The page no longer exists (no route, not-found or redirect) and was dropped
    Removed,
    Skipped(SkipReason),
}

/// One finished revalidation, kept for inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevalidationRecord {
    pub path: String,
    pub started_at: i64,
    pub duration_ms: u64,
    /// `None` when the attempt failed
    pub outcome: Option<RevalidationOutcome>,
    pub error: Option<String>,
}

/// Counters since the revalidator was created
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevalidatorStats {
    pub regenerations: u64,
    pub unchanged: u64,
    pub failures: u64,
    /// Requests dropped because the path was already in flight
    pub collapsed: u64,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy)]
struct FailureState {
    count: u32,
    last_failure_ms: i64,
}

struct Shared {
    cache: RuntimeCache,
    pipeline: PagePipeline,
    resolver: Arc<dyn RouteResolver>,
    events: EventBus,
    retry: RetryPolicy,
    in_flight: DashSet<String>,
    failures: DashMap<String, FailureState>,
    history: Mutex<VecDeque<RevalidationRecord>>,
    history_capacity: usize,
    regenerations: AtomicU64,
    unchanged: AtomicU64,
    failed: AtomicU64,
    collapsed: AtomicU64,
}

/// Clears the in-flight marker for a path when dropped, including on panic.
struct InFlightGuard {
    shared: Arc<Shared>,
    path: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared.in_flight.remove(&self.path);
    }
}

/// Regenerates stale pages in the background
#[derive(Clone)]
pub struct Revalidator {
    shared: Arc<Shared>,
}

impl Revalidator {
    pub fn new(
        cache: RuntimeCache,
        pipeline: PagePipeline,
        resolver: Arc<dyn RouteResolver>,
        events: EventBus,
        retry: RetryPolicy,
        history_capacity: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache,
                pipeline,
                resolver,
                events,
                retry,
                in_flight: DashSet::new(),
                failures: DashMap::new(),
                history: Mutex::new(VecDeque::with_capacity(history_capacity)),
                history_capacity,
                regenerations: AtomicU64::new(0),
                unchanged: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                collapsed: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_in_flight(&self, path: &str) -> bool {
        self.shared.in_flight.contains(path)
    }

    /// Start regenerating `path` without waiting for it.
    ///
    /// Returns `None` when the request collapsed into a running regeneration
    /// or the path is backing off after failures.
    pub fn queue_revalidation(&self, path: &str) -> Option<JoinHandle<()>> {
        if let Some(reason) = self.backoff(path) {
            debug!(%path, ?reason, "revalidation skipped");
            return None;
        }
        let guard = self.try_acquire(path)?;

        let shared = self.shared.clone();
        Some(tokio::spawn(async move {
            let path = guard.path.clone();
            if let Err(e) = run(&shared, &path).await {
                debug!(%path, error = %e, "queued revalidation failed");
            }
            drop(guard);
        }))
    }

    /// Regenerate `path` and wait for the result.
    pub async fn revalidate(&self, path: &str) -> Result<RevalidationOutcome> {
        if let Some(reason) = self.backoff(path) {
            return Ok(RevalidationOutcome::Skipped(reason));
        }
        let Some(guard) = self.try_acquire(path) else {
            return Ok(RevalidationOutcome::Skipped(SkipReason::InFlight));
        };

        let result = run(&self.shared, path).await;
        drop(guard);
        result
    }

    /// Forget recorded failures so the next attempt runs immediately
    pub fn reset_backoff(&self, path: &str) {
        self.shared.failures.remove(path);
    }

    /// `index` 0 is the most recent record
    pub async fn history(&self, index: usize) -> Result<RevalidationRecord> {
        let history = self.shared.history.lock().await;
        history.get(index).cloned().ok_or_else(|| {
            IsrError::Validation(format!(
                "history index {} out of range (0..{})",
                index,
                history.len()
            ))
        })
    }

    pub async fn history_len(&self) -> usize {
        self.shared.history.lock().await.len()
    }

    pub fn stats(&self) -> RevalidatorStats {
        RevalidatorStats {
            regenerations: self.shared.regenerations.load(Ordering::Relaxed),
            unchanged: self.shared.unchanged.load(Ordering::Relaxed),
            failures: self.shared.failed.load(Ordering::Relaxed),
            collapsed: self.shared.collapsed.load(Ordering::Relaxed),
            in_flight: self.shared.in_flight.len(),
        }
    }

    fn try_acquire(&self, path: &str) -> Option<InFlightGuard> {
        if self.shared.in_flight.insert(path.to_string()) {
            Some(InFlightGuard {
                shared: self.shared.clone(),
                path: path.to_string(),
            })
        } else {
            self.shared.collapsed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    fn backoff(&self, path: &str) -> Option<SkipReason> {
        let state = *self.shared.failures.get(path)?;
        let delay = self.shared.retry.delay_for(state.count);
        let retry_at = state.last_failure_ms.saturating_add(delay.as_millis() as i64);
        let now = self.shared.cache.clock().now_ms();

        (now < retry_at).then(|| SkipReason::Backoff {
            retry_in_ms: (retry_at - now) as u64,
        })
    }
}

async fn run(shared: &Shared, path: &str) -> Result<RevalidationOutcome> {
    let clock = shared.cache.clock().clone();
    let started_at = clock.now_ms();
    let timer = tokio::time::Instant::now();

    shared.events.emit(IsrEvent::RevalidateStart {
        path: path.to_string(),
    });

    let result = regenerate(shared, path).await;
    let duration_ms = timer.elapsed().as_millis() as u64;

    let record = match result {
        Ok(ref outcome) => {
            shared.failures.remove(path);
            let unchanged = *outcome == RevalidationOutcome::Unchanged;
            let counter = if unchanged {
                &shared.unchanged
            } else {
                &shared.regenerations
            };
            counter.fetch_add(1, Ordering::Relaxed);

            info!(%path, ?outcome, duration_ms, "page revalidated");
            shared.events.emit(IsrEvent::RevalidateSuccess {
                path: path.to_string(),
                duration_ms,
                unchanged,
            });

            RevalidationRecord {
                path: path.to_string(),
                started_at,
                duration_ms,
                outcome: Some(outcome.clone()),
                error: None,
            }
        }
        Err(ref e) => {
            let now = clock.now_ms();
            let failures = {
                let mut state = shared.failures.entry(path.to_string()).or_insert(FailureState {
                    count: 0,
                    last_failure_ms: now,
                });
                state.count = state.count.saturating_add(1);
                state.last_failure_ms = now;
                state.count
            };

            shared.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                %path,
                error = %e,
                failures,
                retry_in = ?shared.retry.delay_for(failures),
                "page revalidation failed, keeping previous content"
            );
            shared.events.emit(IsrEvent::RevalidateError {
                path: path.to_string(),
                error: e.to_string(),
            });

            if let Err(e) = shared
                .cache
                .adapter()
                .update_meta(path, MetaPatch::status(EntryStatus::Error))
                .await
            {
                warn!(%path, error = %e, "could not flag entry as errored");
            }

            RevalidationRecord {
                path: path.to_string(),
                started_at,
                duration_ms,
                outcome: None,
                error: Some(e.to_string()),
            }
        }
    };

    let mut history = shared.history.lock().await;
    if shared.history_capacity > 0 {
        if history.len() == shared.history_capacity {
            history.pop_back();
        }
        history.push_front(record);
    }
    drop(history);

    result
}

async fn regenerate(shared: &Shared, path: &str) -> Result<RevalidationOutcome> {
    let adapter = shared.cache.adapter();

    let Some(route) = shared.resolver.resolve(path) else {
        adapter.delete(path).await.map_err(|e| IsrError::adapter(&e))?;
        return Ok(RevalidationOutcome::Removed);
    };

    let previous = match adapter.get_meta(path).await {
        Ok(meta) => meta,
        Err(e) => {
            warn!(%path, error = %e, "could not read previous metadata");
            None
        }
    };

    if previous.is_some() {
        if let Err(e) = adapter
            .update_meta(path, MetaPatch::status(EntryStatus::Revalidating))
            .await
        {
            warn!(%path, error = %e, "could not flag entry as revalidating");
        }
    }

    let entry = match shared
        .pipeline
        .generate(path, &route, RenderMode::Build, None)
        .await?
    {
        Generated::Page(entry) => entry,
        Generated::NotFound | Generated::Redirect(_) => {
            adapter.delete(path).await.map_err(|e| IsrError::adapter(&e))?;
            return Ok(RevalidationOutcome::Removed);
        }
    };

    match previous {
        Some(old) if old.content_hash.is_some() && old.content_hash == entry.meta.content_hash => {
            let patch = MetaPatch {
                revalidated_at: Some(entry.meta.revalidated_at.max(old.created_at)),
                revalidate_interval: Some(entry.meta.revalidate_interval),
                status: Some(EntryStatus::Fresh),
                tags: Some(entry.meta.tags.clone()),
                regeneration_count: Some(old.regeneration_count + 1),
                content_hash: None,
            };
            let updated = adapter
                .update_meta(path, patch)
                .await
                .map_err(|e| IsrError::adapter(&e))?;
            if updated {
                return Ok(RevalidationOutcome::Unchanged);
            }
            // Entry vanished while rendering; write the fresh one below.
            store(shared, path, entry, None).await
        }
        previous => store(shared, path, entry, previous).await,
    }
}

async fn store(
    shared: &Shared,
    path: &str,
    mut entry: CacheEntry,
    previous: Option<CacheEntryMeta>,
) -> Result<RevalidationOutcome> {
    if let Some(old) = previous {
        entry.meta.created_at = old.created_at.min(entry.meta.revalidated_at);
        entry.meta.regeneration_count = old.regeneration_count + 1;
    }
    entry.meta.status = EntryStatus::Fresh;

    shared
        .cache
        .adapter()
        .set(path, entry)
        .await
        .map_err(|e| IsrError::adapter(&e))?;
    Ok(RevalidationOutcome::Regenerated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::config::{CacheControlPolicy, MemoryConfig};
    use crate::render::render_fn;
    use crate::route::{PageModule, PageRegistry};
    use crate::storage::memory::MemoryAdapter;
    use crate::storage::CacheAdapter;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    struct Harness {
        clock: ManualClock,
        adapter: Arc<MemoryAdapter>,
        revalidator: Revalidator,
        renders: Arc<AtomicUsize>,
        failing: Arc<AtomicBool>,
        body: Arc<std::sync::Mutex<String>>,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(1_000);
        let shared_clock: SharedClock = Arc::new(clock.clone());
        let adapter = Arc::new(MemoryAdapter::with_clock(
            MemoryConfig::default(),
            shared_clock.clone(),
        ));
        let renders = Arc::new(AtomicUsize::new(0));
        let failing = Arc::new(AtomicBool::new(false));
        let body = Arc::new(std::sync::Mutex::new("v2".to_string()));

        let renderer = {
            let renders = renders.clone();
            let failing = failing.clone();
            let body = body.clone();
            render_fn(move |_path, _ctx| {
                let renders = renders.clone();
                let failing = failing.clone();
                let body = body.lock().unwrap().clone();
                async move {
                    renders.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    if failing.load(Ordering::SeqCst) {
                        anyhow::bail!("upstream down");
                    }
                    Ok(body)
                }
            })
        };

        let registry = PageRegistry::default()
            .with_page(PageModule::new("/posts/[id]").unwrap())
            .with_page(PageModule::new("/").unwrap());

        let cache = RuntimeCache::new(
            adapter.clone(),
            shared_clock.clone(),
            CacheControlPolicy::default(),
        );
        let pipeline = PagePipeline::new(
            renderer,
            shared_clock,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        let revalidator = Revalidator::new(
            cache,
            pipeline,
            Arc::new(registry),
            EventBus::default(),
            RetryPolicy {
                base: Duration::from_secs(10),
                max: Duration::from_secs(60),
            },
            3,
        );

        Harness {
            clock,
            adapter,
            revalidator,
            renders,
            failing,
            body,
        }
    }

    async fn seed(h: &Harness, path: &str, html: &str) {
        let entry = CacheEntry::new(html, CacheEntryMeta::new(0, 60));
        h.adapter.set(path, entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_regenerates_and_counts() {
        let h = harness();
        seed(&h, "/posts/1", "v1").await;
        h.clock.set(100_000);

        let outcome = h.revalidator.revalidate("/posts/1").await.unwrap();
        assert_eq!(outcome, RevalidationOutcome::Regenerated);

        let entry = h.adapter.get("/posts/1").await.unwrap().unwrap();
        assert_eq!(entry.html, "v2");
        assert_eq!(entry.meta.created_at, 0);
        assert_eq!(entry.meta.revalidated_at, 100_000);
        assert_eq!(entry.meta.regeneration_count, 1);
        assert_eq!(entry.meta.status, EntryStatus::Fresh);
        assert!(!h.revalidator.is_in_flight("/posts/1"));
    }

    #[tokio::test]
    async fn test_queue_collapses_duplicates() {
        let h = harness();
        seed(&h, "/posts/1", "v1").await;

        let first = h.revalidator.queue_revalidation("/posts/1");
        let second = h.revalidator.queue_revalidation("/posts/1");
        assert!(first.is_some());
        assert!(second.is_none());
        assert!(h.revalidator.is_in_flight("/posts/1"));

        first.unwrap().await.unwrap();
        assert_eq!(h.renders.load(Ordering::SeqCst), 1);
        assert_eq!(h.revalidator.stats().collapsed, 1);
        assert!(!h.revalidator.is_in_flight("/posts/1"));
    }

    #[tokio::test]
    async fn test_different_paths_run_concurrently() {
        let h = harness();
        let a = h.revalidator.queue_revalidation("/posts/1").unwrap();
        let b = h.revalidator.queue_revalidation("/posts/2").unwrap();
        assert_eq!(h.revalidator.stats().in_flight, 2);

        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(h.renders.load(Ordering::SeqCst), 2);
        assert_eq!(h.adapter.keys().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_content_and_flags_error() {
        let h = harness();
        seed(&h, "/posts/1", "v1").await;
        h.failing.store(true, Ordering::SeqCst);

        let err = h.revalidator.revalidate("/posts/1").await.unwrap_err();
        assert!(matches!(err, IsrError::Render { .. }));

        let entry = h.adapter.get("/posts/1").await.unwrap().unwrap();
        assert_eq!(entry.html, "v1");
        assert_eq!(entry.meta.status, EntryStatus::Error);
        assert!(!h.revalidator.is_in_flight("/posts/1"));

        let record = h.revalidator.history(0).await.unwrap();
        assert!(record.outcome.is_none());
        assert!(record.error.unwrap().contains("upstream down"));
    }

    #[tokio::test]
    async fn test_backoff_after_failures() {
        let h = harness();
        seed(&h, "/posts/1", "v1").await;
        h.failing.store(true, Ordering::SeqCst);

        assert!(h.revalidator.revalidate("/posts/1").await.is_err());
        assert_eq!(
            h.revalidator.revalidate("/posts/1").await.unwrap(),
            RevalidationOutcome::Skipped(SkipReason::Backoff { retry_in_ms: 10_000 })
        );
        assert!(h.revalidator.queue_revalidation("/posts/1").is_none());

        h.clock.advance(Duration::from_secs(10));
        assert!(h.revalidator.revalidate("/posts/1").await.is_err());

        // Second failure doubles the wait.
        h.clock.advance(Duration::from_secs(10));
        assert!(matches!(
            h.revalidator.revalidate("/posts/1").await.unwrap(),
            RevalidationOutcome::Skipped(SkipReason::Backoff { .. })
        ));

        h.failing.store(false, Ordering::SeqCst);
        h.clock.advance(Duration::from_secs(10));
        assert_eq!(
            h.revalidator.revalidate("/posts/1").await.unwrap(),
            RevalidationOutcome::Regenerated
        );
        assert_eq!(h.renders.load(Ordering::SeqCst), 3);
        assert_eq!(h.revalidator.stats().failures, 2);
    }

    #[tokio::test]
    async fn test_unchanged_content_only_touches_meta() {
        let h = harness();
        seed(&h, "/posts/1", "v2").await;
        h.clock.set(90_000);

        assert_eq!(
            h.revalidator.revalidate("/posts/1").await.unwrap(),
            RevalidationOutcome::Unchanged
        );

        let meta = h.adapter.get_meta("/posts/1").await.unwrap().unwrap();
        assert_eq!(meta.revalidated_at, 90_000);
        assert_eq!(meta.regeneration_count, 1);
        assert_eq!(h.revalidator.stats().unchanged, 1);

        *h.body.lock().unwrap() = "v3".to_string();
        assert_eq!(
            h.revalidator.revalidate("/posts/1").await.unwrap(),
            RevalidationOutcome::Regenerated
        );
    }

    #[tokio::test]
    async fn test_unrouted_path_is_removed() {
        let h = harness();
        seed(&h, "/gone/for/good", "old").await;

        assert_eq!(
            h.revalidator.revalidate("/gone/for/good").await.unwrap(),
            RevalidationOutcome::Removed
        );
        assert!(!h.adapter.has("/gone/for/good").await.unwrap());
        assert_eq!(h.renders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_indexed() {
        let h = harness();
        for id in 1..=4 {
            h.revalidator
                .revalidate(&format!("/posts/{}", id))
                .await
                .unwrap();
        }

        assert_eq!(h.revalidator.history_len().await, 3);
        assert_eq!(h.revalidator.history(0).await.unwrap().path, "/posts/4");
        assert_eq!(h.revalidator.history(2).await.unwrap().path, "/posts/2");
        assert!(matches!(
            h.revalidator.history(3).await,
            Err(IsrError::Validation(_))
        ));
    }
}
