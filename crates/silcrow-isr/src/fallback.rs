//! Cache-miss policy per fallback mode

use crate::cache::CacheEntry;
use crate::error::Result;
use crate::events::{EventBus, IsrEvent};
use crate::render::{Generated, PagePipeline, Redirect, RenderMode, RequestInfo};
use crate::revalidator::Revalidator;
use crate::route::{FallbackMode, ResolvedRoute};
use crate::runtime::RuntimeCache;
use tracing::{debug, error};

/// Document served while a `static` fallback page renders in the background
pub const DEFAULT_PLACEHOLDER: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="robots" content="noindex">
<meta http-equiv="refresh" content="2">
<title>Loading…</title>
</head>
<body>
<div data-silcrow-fallback aria-busy="true">Loading…</div>
</body>
</html>
"#;

/// What to answer for a path that wasn't cached
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackOutcome {
    /// Rendered during the request (and cached when possible)
    Rendered(CacheEntry),
    /// Placeholder sent while the real page renders in the background
    Placeholder { html: String },
    NotFound,
    Redirect(Redirect),
}

/// Decides what a cache miss turns into
#[derive(Clone)]
pub struct FallbackHandler {
    cache: RuntimeCache,
    pipeline: PagePipeline,
    revalidator: Revalidator,
    events: EventBus,
    placeholder: String,
}

impl FallbackHandler {
    pub fn new(
        cache: RuntimeCache,
        pipeline: PagePipeline,
        revalidator: Revalidator,
        events: EventBus,
    ) -> Self {
        Self {
            cache,
            pipeline,
            revalidator,
            events,
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
        }
    }

    pub fn with_placeholder(mut self, html: impl Into<String>) -> Self {
        self.placeholder = html.into();
        self
    }

    /// Handle a miss on `path`, which resolved to `route`.
    ///
    /// Render errors in blocking mode propagate; a failing cache write does
    /// not, the rendered page is still returned.
    pub async fn handle_miss(
        &self,
        path: &str,
        route: &ResolvedRoute,
        request: Option<RequestInfo>,
    ) -> Result<FallbackOutcome> {
        self.events.emit(IsrEvent::Fallback {
            path: path.to_string(),
            mode: route.fallback,
        });

        match route.fallback {
            FallbackMode::Disabled => {
                debug!(%path, "no fallback for path that was not prerendered");
                Ok(FallbackOutcome::NotFound)
            }
            FallbackMode::Static => {
                if self.revalidator.queue_revalidation(path).is_none() {
                    debug!(%path, "background render already running");
                }
                Ok(FallbackOutcome::Placeholder {
                    html: self.placeholder.clone(),
                })
            }
            FallbackMode::Blocking => {
                match self
                    .pipeline
                    .generate(path, route, RenderMode::Request, request)
                    .await?
                {
                    Generated::Page(entry) => {
                        if let Err(e) = self.cache.adapter().set(path, entry.clone()).await {
                            error!(%path, error = %e, "failed to cache page rendered on demand");
                        }
                        Ok(FallbackOutcome::Rendered(entry))
                    }
                    Generated::NotFound => Ok(FallbackOutcome::NotFound),
                    Generated::Redirect(redirect) => Ok(FallbackOutcome::Redirect(redirect)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::config::{CacheControlPolicy, MemoryConfig, RetryPolicy};
    use crate::error::IsrError;
    use crate::render::{props_fn, render_fn, StaticProps};
    use crate::route::{PageModule, PageRegistry};
    use crate::storage::memory::MemoryAdapter;
    use crate::storage::CacheAdapter;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryAdapter>, Arc<AtomicUsize>, FallbackHandler) {
        let clock: SharedClock = Arc::new(ManualClock::new(0));
        let adapter = Arc::new(MemoryAdapter::with_clock(MemoryConfig::default(), clock.clone()));
        let renders = Arc::new(AtomicUsize::new(0));

        let renderer = {
            let renders = renders.clone();
            render_fn(move |path, _ctx| {
                renders.fetch_add(1, Ordering::SeqCst);
                async move {
                    if path.ends_with("/broken") {
                        anyhow::bail!("no data");
                    }
                    Ok(format!("<h1>{}</h1>", path))
                }
            })
        };

        let cache = RuntimeCache::new(adapter.clone(), clock.clone(), CacheControlPolicy::default());
        let pipeline = PagePipeline::new(
            renderer,
            clock,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        let registry = PageRegistry::default().with_page(PageModule::new("/posts/[id]").unwrap());
        let events = EventBus::default();
        let revalidator = Revalidator::new(
            cache.clone(),
            pipeline.clone(),
            Arc::new(registry),
            events.clone(),
            RetryPolicy::default(),
            10,
        );

        let handler = FallbackHandler::new(cache, pipeline, revalidator, events)
            .with_placeholder("<p>loading</p>");
        (adapter, renders, handler)
    }

    fn route(mode: FallbackMode) -> ResolvedRoute {
        let mut route = ResolvedRoute::plain("/posts/[id]");
        route.fallback = mode;
        route
    }

    #[tokio::test]
    async fn test_blocking_renders_and_caches() {
        let (adapter, renders, handler) = setup();

        let outcome = handler
            .handle_miss("/posts/1", &route(FallbackMode::Blocking), None)
            .await
            .unwrap();

        let FallbackOutcome::Rendered(entry) = outcome else {
            panic!("expected a rendered page");
        };
        assert_eq!(entry.html, "<h1>/posts/1</h1>");
        assert_eq!(adapter.get("/posts/1").await.unwrap(), Some(entry));
        assert_eq!(renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blocking_render_error_propagates() {
        let (adapter, _, handler) = setup();
        let err = handler
            .handle_miss("/posts/broken", &route(FallbackMode::Blocking), None)
            .await
            .unwrap_err();

        assert!(matches!(err, IsrError::Render { .. }));
        assert!(!adapter.has("/posts/broken").await.unwrap());
    }

    #[tokio::test]
    async fn test_static_serves_placeholder_then_populates() {
        let (adapter, renders, handler) = setup();

        let outcome = handler
            .handle_miss("/posts/2", &route(FallbackMode::Static), None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FallbackOutcome::Placeholder {
                html: "<p>loading</p>".to_string()
            }
        );

        // Let the background render finish.
        for _ in 0..50 {
            if adapter.has("/posts/2").await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(renders.load(Ordering::SeqCst), 1);
        let entry = adapter.get("/posts/2").await.unwrap().unwrap();
        assert_eq!(entry.meta.regeneration_count, 0);
    }

    #[tokio::test]
    async fn test_disabled_is_not_found_without_render() {
        let (adapter, renders, handler) = setup();

        let outcome = handler
            .handle_miss("/posts/3", &route(FallbackMode::Disabled), None)
            .await
            .unwrap();

        assert_eq!(outcome, FallbackOutcome::NotFound);
        assert_eq!(renders.load(Ordering::SeqCst), 0);
        assert!(adapter.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_props_short_circuit_bypasses_cache() {
        let (adapter, renders, handler) = setup();
        let mut redirected = route(FallbackMode::Blocking);
        redirected.static_props = Some(props_fn(|_| async {
            Ok(StaticProps::redirect("/login", false))
        }));

        let outcome = handler.handle_miss("/posts/4", &redirected, None).await.unwrap();

        let FallbackOutcome::Redirect(redirect) = outcome else {
            panic!("expected a redirect");
        };
        assert_eq!(redirect.status(), 307);
        assert_eq!(renders.load(Ordering::SeqCst), 0);
        assert!(!adapter.has("/posts/4").await.unwrap());
    }
}
