//! # Silcrow ISR - Incremental Static Regeneration
//!
//! Stale-while-revalidate page cache for Silcrow applications.
//!
//! ## Features
//!
//! - **Pluggable storage**: in-memory LRU, or a networked key-value store
//!   (Dragonfly/Redis behind the `dragonfly` feature)
//! - **Stale-while-revalidate**: stale pages are served while a single
//!   background regeneration per path refreshes them
//! - **Tags**: invalidate every page carrying a tag at once
//! - **Fallback modes**: blocking render, placeholder plus background render,
//!   or 404 for paths that were not prerendered
//! - **Build**: collect paths, prerender them with bounded concurrency and
//!   optionally write HTML files plus a manifest
//! - **axum integration**: middleware and a revalidation webhook
//!
//! ## Example
//!
//! ```no_run
//! use silcrow_isr::{render_fn, IsrConfig, IsrEngine, PageModule, PageRegistry};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let registry = PageRegistry::default().with_page(PageModule::new("/about")?);
//! let engine = IsrEngine::builder(IsrConfig::default())
//!     .renderer(render_fn(|path, _ctx| async move { Ok(format!("<h1>{}</h1>", path)) }))
//!     .registry(registry)
//!     .build()
//!     .await?;
//!
//! engine.prerender().await?;
//! let app = engine.into_router(axum::Router::new());
//! # let _ = app;
//! # Ok(())
//! # }
//! ```

pub mod build;
pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fallback;
pub mod handler;
pub mod http;
pub mod render;
pub mod revalidator;
pub mod route;
pub mod runtime;
pub mod storage;

pub use build::collector::{paths_fn, PathEntry, PathsProvider, StaticPaths};
pub use build::BuildReport;
pub use cache::{CacheEntry, CacheEntryMeta, CacheStats, EntryStatus};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{IsrConfig, IsrTomlConfig, StorageBackend};
pub use engine::{IsrEngine, IsrEngineBuilder};
pub use error::{IsrError, Result};
pub use events::{EventBus, IsrEvent};
pub use handler::{HandlerOutcome, IsrHandler, IsrRequest, IsrResponse, PathFilter};
pub use http::{isr_middleware, webhook_router, with_isr};
pub use render::{props_fn, render_fn, RenderContext, Renderer, StaticProps, StaticPropsProvider};
pub use route::{FallbackMode, PageModule, PageRegistry, ResolvedRoute, RouteResolver};
pub use runtime::{CacheLookup, RuntimeCache};
pub use storage::CacheAdapter;
