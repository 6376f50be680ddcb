//! Build-time path collection
//!
//! Static pages contribute their own path. Dynamic pages ask their paths
//! provider; a page without one prerenders nothing and falls back to
//! blocking renders. A failing page is recorded and skipped, the rest of
//! the collection carries on.

use crate::config::LocaleConfig;
use crate::error::IsrError;
use crate::route::{FallbackMode, PageModule, PageRegistry, ResolvedRoute};
use async_trait::async_trait;
use serde::Deserialize;
use silcrow_router::{normalize_path, Params};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// One entry returned by a paths provider
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PathEntry {
    /// A concrete path such as `/posts/42`
    Path(String),
    /// Parameters to interpolate into the page's pattern
    Params {
        params: Params,
        #[serde(default)]
        locale: Option<String>,
    },
}

impl From<&str> for PathEntry {
    fn from(path: &str) -> Self {
        PathEntry::Path(path.to_string())
    }
}

/// Paths a dynamic page wants prerendered, and what to do for the others
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StaticPaths {
    pub paths: Vec<PathEntry>,
    #[serde(default)]
    pub fallback: FallbackMode,
}

impl StaticPaths {
    pub fn new<I, P>(paths: I, fallback: FallbackMode) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathEntry>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            fallback,
        }
    }
}

/// Enumerates the concrete paths of a dynamic page
#[async_trait]
pub trait PathsProvider: Send + Sync {
    async fn static_paths(&self, locales: &LocaleConfig) -> anyhow::Result<StaticPaths>;
}

struct FnPathsProvider<F>(F);

#[async_trait]
impl<F, Fut> PathsProvider for FnPathsProvider<F>
where
    F: Fn(LocaleConfig) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<StaticPaths>> + Send + 'static,
{
    async fn static_paths(&self, locales: &LocaleConfig) -> anyhow::Result<StaticPaths> {
        (self.0)(locales.clone()).await
    }
}

/// Wrap an async closure as a [`PathsProvider`]
pub fn paths_fn<F, Fut>(f: F) -> Arc<dyn PathsProvider>
where
    F: Fn(LocaleConfig) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<StaticPaths>> + Send + 'static,
{
    Arc::new(FnPathsProvider(f))
}

/// A concrete path ready for generation
#[derive(Debug, Clone)]
pub struct CollectedPath {
    pub path: String,
    pub route: ResolvedRoute,
}

/// Everything collection found
#[derive(Debug, Default)]
pub struct CollectionResult {
    pub paths: Vec<CollectedPath>,
    /// Fallback mode per dynamic pattern
    pub fallbacks: HashMap<String, FallbackMode>,
    /// One [`IsrError::Collection`] per failed page or rejected entry
    pub errors: Vec<IsrError>,
}

impl CollectionResult {
    /// Record fallback modes and prerendered paths on the registry
    pub fn apply(&self, registry: &PageRegistry) {
        for (pattern, mode) in &self.fallbacks {
            registry.set_fallback(pattern, *mode);
        }
        for collected in &self.paths {
            registry.mark_prerendered(&collected.path);
        }
    }
}

/// Walks page modules and expands them into concrete paths
#[derive(Debug, Clone, Default)]
pub struct PathCollector {
    locales: LocaleConfig,
}

impl PathCollector {
    pub fn new(locales: LocaleConfig) -> Self {
        Self { locales }
    }

    pub async fn collect(&self, modules: &[PageModule]) -> CollectionResult {
        let mut result = CollectionResult::default();
        let mut seen = HashSet::new();

        for module in modules {
            let pattern = module.pattern.as_str();

            if !module.pattern.is_dynamic() {
                self.push(&mut result, &mut seen, module, pattern, Params::new(), None);
                continue;
            }

            let Some(ref provider) = module.paths else {
                debug!(%pattern, "dynamic page without paths provider, rendering on demand");
                result
                    .fallbacks
                    .insert(pattern.to_string(), FallbackMode::Blocking);
                continue;
            };

            let static_paths = match provider.static_paths(&self.locales).await {
                Ok(static_paths) => static_paths,
                Err(e) => {
                    warn!(source_path = %module.source, error = %e, "path collection failed");
                    result.errors.push(collection_error(module, format!("{:#}", e)));
                    continue;
                }
            };

            result
                .fallbacks
                .insert(pattern.to_string(), static_paths.fallback);

            for entry in static_paths.paths {
                let resolved = match entry {
                    PathEntry::Path(path) => {
                        let path = normalize_path(&path).into_owned();
                        match module.pattern.matches(&path) {
                            Some(params) => Ok((params, None)),
                            None => Err(format!("{} does not match {}", path, pattern)),
                        }
                    }
                    PathEntry::Params { params, locale } => module
                        .pattern
                        .interpolate(&params)
                        .map(|_| (params, locale))
                        .map_err(|e| e.to_string()),
                };

                match resolved {
                    Ok((params, locale)) => {
                        self.push(&mut result, &mut seen, module, pattern, params, locale)
                    }
                    Err(message) => {
                        warn!(source_path = %module.source, %message, "rejected static path");
                        result.errors.push(collection_error(module, message));
                    }
                }
            }
        }

        result
    }

    fn push(
        &self,
        result: &mut CollectionResult,
        seen: &mut HashSet<String>,
        module: &PageModule,
        pattern: &str,
        params: Params,
        locale: Option<String>,
    ) {
        let bare = match module.pattern.interpolate(&params) {
            Ok(path) => path,
            Err(e) => {
                result.errors.push(collection_error(module, e.to_string()));
                return;
            }
        };

        let locales: Vec<Option<String>> = match locale {
            Some(locale) => vec![Some(locale)],
            None if self.locales.is_enabled() => {
                self.locales.locales.iter().cloned().map(Some).collect()
            }
            None => vec![None],
        };

        for locale in locales {
            let path = match locale {
                Some(ref locale) => self.locales.localize(&bare, locale),
                None => bare.clone(),
            };
            if !seen.insert(path.clone()) {
                continue;
            }

            result.paths.push(CollectedPath {
                path,
                route: ResolvedRoute {
                    pattern: pattern.to_string(),
                    params: params.clone(),
                    locale,
                    fallback: FallbackMode::Blocking,
                    revalidate: module.revalidate,
                    tags: module.tags.clone(),
                    static_props: module.static_props.clone(),
                },
            });
        }
    }
}

fn collection_error(module: &PageModule, message: String) -> IsrError {
    IsrError::Collection {
        source_path: module.source.clone(),
        message,
    }
}
