//! ISR engine: wires storage, revalidation, fallback and the request handler

use crate::build::collector::PathCollector;
use crate::build::generator::StaticGenerator;
use crate::build::output::OutputWriter;
use crate::build::BuildReport;
use crate::clock::{system_clock, SharedClock};
use crate::config::{IsrConfig, StorageBackend};
use crate::error::Result as IsrResult;
use crate::events::EventBus;
use crate::fallback::FallbackHandler;
use crate::handler::{IsrHandler, PathFilter};
use crate::http::{webhook_router, with_isr};
use crate::render::{PagePipeline, Renderer};
use crate::revalidator::Revalidator;
use crate::route::{PageRegistry, RouteResolver};
use crate::runtime::RuntimeCache;
use crate::storage::memory::MemoryAdapter;
use crate::storage::CacheAdapter;
use anyhow::{bail, Result};
use axum::Router;
use std::sync::Arc;
use tracing::{info, warn};

/// ISR engine for serving and prerendering cached pages
#[derive(Clone)]
pub struct IsrEngine {
    config: IsrConfig,
    registry: Arc<PageRegistry>,
    adapter: Arc<dyn CacheAdapter>,
    pipeline: PagePipeline,
    handler: IsrHandler,
}

impl IsrEngine {
    pub fn builder(config: IsrConfig) -> IsrEngineBuilder {
        IsrEngineBuilder {
            config,
            renderer: None,
            registry: None,
            adapter: None,
            clock: None,
            wrap_documents: false,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    /// Create a storage backend from config
    pub async fn create_storage(backend: &StorageBackend, clock: SharedClock) -> Result<Arc<dyn CacheAdapter>> {
        match backend {
            StorageBackend::Memory(config) => Ok(Arc::new(MemoryAdapter::with_clock(config.clone(), clock))),
            #[cfg(feature = "dragonfly")]
            StorageBackend::Kv(config) => {
                use crate::storage::dragonfly::RedisKvStore;
                use crate::storage::kv::KvAdapter;
                let store = RedisKvStore::connect(&config.url).await?;
                Ok(Arc::new(KvAdapter::with_clock(Arc::new(store), config.clone(), clock)))
            }
            #[cfg(not(feature = "dragonfly"))]
            StorageBackend::Kv(_) => {
                bail!("KV storage requires the 'dragonfly' feature to be enabled")
            }
        }
    }

    pub fn config(&self) -> &IsrConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PageRegistry> {
        &self.registry
    }

    pub fn adapter(&self) -> &Arc<dyn CacheAdapter> {
        &self.adapter
    }

    pub fn handler(&self) -> &IsrHandler {
        &self.handler
    }

    pub fn revalidator(&self) -> &Revalidator {
        self.handler.revalidator()
    }

    pub fn events(&self) -> &EventBus {
        self.handler.events()
    }

    /// Collect, generate and (when configured) write every static page.
    ///
    /// Per-page failures are reported in the returned [`BuildReport`];
    /// only creating the output directory or writing the manifest aborts
    /// the build.
    pub async fn prerender(&self) -> IsrResult<BuildReport> {
        let collection = PathCollector::new(self.registry.locales().clone())
            .collect(self.registry.modules())
            .await;
        collection.apply(&self.registry);

        let generation = StaticGenerator::new(
            self.pipeline.clone(),
            self.adapter.clone(),
            self.config.build_concurrency,
        )
        .generate(&collection.paths)
        .await;

        let (manifest, output_errors) = match self.config.output {
            Some(ref output) => {
                let written = OutputWriter::new(output.clone()).write(&generation).await?;
                (Some(written.manifest), written.errors)
            }
            None => (None, Vec::new()),
        };

        let report = BuildReport {
            collected: collection.paths.len(),
            generation,
            collection_errors: collection.errors,
            manifest,
            output_errors,
        };

        for error in report.errors() {
            warn!(error = %error, "build error");
        }
        info!(
            collected = report.collected,
            generated = report.generation.pages.len(),
            errors = report.errors().count(),
            "build complete"
        );

        Ok(report)
    }

    /// `POST /api/revalidate`, guarded by the configured secret
    pub fn webhook_router(&self) -> Router {
        webhook_router(self.handler.clone(), self.config.revalidation_secret.clone())
    }

    /// `app` plus the revalidation webhook, with ISR pages served first
    pub fn into_router(&self, app: Router) -> Router {
        with_isr(app.merge(self.webhook_router()), self.handler.clone())
    }

    pub async fn close(&self) -> Result<()> {
        self.adapter.close().await
    }
}

pub struct IsrEngineBuilder {
    config: IsrConfig,
    renderer: Option<Arc<dyn Renderer>>,
    registry: Option<PageRegistry>,
    adapter: Option<Arc<dyn CacheAdapter>>,
    clock: Option<SharedClock>,
    wrap_documents: bool,
    include: Vec<PathFilter>,
    exclude: Vec<PathFilter>,
}

impl IsrEngineBuilder {
    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Pages to serve. Defaults to an empty registry with the configured locales.
    pub fn registry(mut self, registry: PageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use `adapter` instead of the configured storage backend
    pub fn adapter(mut self, adapter: Arc<dyn CacheAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Wrap rendered fragments in a full HTML document
    pub fn wrap_documents(mut self, enabled: bool) -> Self {
        self.wrap_documents = enabled;
        self
    }

    /// Only handle paths matching one of the include filters
    pub fn include(mut self, filter: PathFilter) -> Self {
        self.include.push(filter);
        self
    }

    /// Leave matching paths to the wrapped router
    pub fn exclude(mut self, filter: PathFilter) -> Self {
        self.exclude.push(filter);
        self
    }

    pub async fn build(self) -> Result<IsrEngine> {
        let Some(renderer) = self.renderer else {
            bail!("an ISR engine needs a renderer");
        };
        let config = self.config;
        let clock = self.clock.unwrap_or_else(system_clock);

        let adapter = match self.adapter {
            Some(adapter) => adapter,
            None => IsrEngine::create_storage(&config.storage, clock.clone()).await?,
        };
        let registry = Arc::new(
            self.registry
                .unwrap_or_else(|| PageRegistry::new(config.locales.clone())),
        );
        let resolver: Arc<dyn RouteResolver> = registry.clone();

        let events = EventBus::new(config.event_capacity);
        let cache = RuntimeCache::new(adapter.clone(), clock.clone(), config.cache_control);
        let pipeline = PagePipeline::new(
            renderer,
            clock,
            config.default_revalidate,
            config.render_timeout,
        )
        .wrap_documents(self.wrap_documents);

        let revalidator = Revalidator::new(
            cache.clone(),
            pipeline.clone(),
            resolver.clone(),
            events.clone(),
            config.retry,
            config.history_capacity,
        );

        let mut fallback = FallbackHandler::new(
            cache.clone(),
            pipeline.clone(),
            revalidator.clone(),
            events.clone(),
        );
        if let Some(ref placeholder) = config.placeholder_html {
            fallback = fallback.with_placeholder(placeholder.clone());
        }

        let mut handler = IsrHandler::new(cache, revalidator, fallback, resolver, events)
            .debug(config.debug)
            .debug_headers(config.debug_headers);
        for filter in self.include {
            handler = handler.include(filter);
        }
        for filter in self.exclude {
            handler = handler.exclude(filter);
        }

        info!(
            backend = adapter.name(),
            pages = registry.modules().len(),
            "ISR engine ready"
        );

        Ok(IsrEngine {
            config,
            registry,
            adapter,
            pipeline,
            handler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::render_fn;
    use crate::route::PageModule;

    fn renderer() -> Arc<dyn Renderer> {
        render_fn(|path, _ctx| async move { Ok(format!("<p>{}</p>", path)) })
    }

    #[tokio::test]
    async fn test_engine_memory_backend() {
        let engine = IsrEngine::builder(IsrConfig::default())
            .renderer(renderer())
            .registry(PageRegistry::default().with_page(PageModule::new("/about").unwrap()))
            .build()
            .await
            .unwrap();

        assert_eq!(engine.adapter().name(), "memory");

        let report = engine.prerender().await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.collected, 1);
        assert!(report.manifest.is_none());

        let entry = engine.adapter().get("/about").await.unwrap().unwrap();
        assert_eq!(entry.html, "<p>/about</p>");
        assert!(engine.registry().is_prerendered("/about"));

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_engine_requires_renderer() {
        let err = IsrEngine::builder(IsrConfig::default()).build().await.err().unwrap();
        assert!(err.to_string().contains("renderer"));
    }

    #[cfg(not(feature = "dragonfly"))]
    #[tokio::test]
    async fn test_kv_backend_needs_feature() {
        use crate::config::KvConfig;

        let backend = StorageBackend::Kv(KvConfig::default());
        let err = IsrEngine::create_storage(&backend, system_clock())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("dragonfly"));
    }
}
