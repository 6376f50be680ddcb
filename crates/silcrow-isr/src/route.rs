//! Page modules and the route resolver consulted on cache misses

use crate::build::collector::PathsProvider;
use crate::config::LocaleConfig;
use crate::error::Result;
use crate::render::StaticPropsProvider;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use silcrow_router::{normalize_path, Params, RoutePattern};
use std::fmt;
use std::sync::Arc;

/// What to do when a generated-content path is not cached yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FallbackMode {
    /// Render while the request waits, then cache
    #[default]
    Blocking,
    /// Serve a placeholder now and render in the background
    Static,
    /// Only prerendered paths exist; anything else is a 404
    Disabled,
}

impl FallbackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackMode::Blocking => "blocking",
            FallbackMode::Static => "static",
            FallbackMode::Disabled => "false",
        }
    }
}

impl fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// `fallback` is written as "blocking", "static" or the literal `false`.
impl Serialize for FallbackMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            FallbackMode::Disabled => serializer.serialize_bool(false),
            mode => serializer.serialize_str(mode.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for FallbackMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Flag(bool),
            Name(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Flag(false) => Ok(FallbackMode::Disabled),
            Repr::Flag(true) => Ok(FallbackMode::Static),
            Repr::Name(name) => match name.as_str() {
                "blocking" => Ok(FallbackMode::Blocking),
                "static" | "true" => Ok(FallbackMode::Static),
                "false" => Ok(FallbackMode::Disabled),
                other => Err(serde::de::Error::custom(format!(
                    "unknown fallback mode: {}",
                    other
                ))),
            },
        }
    }
}

/// A path matched to its page module
#[derive(Clone)]
pub struct ResolvedRoute {
    /// Route pattern the path matched, e.g. `/posts/[id]`
    pub pattern: String,
    pub params: Params,
    pub locale: Option<String>,
    pub fallback: FallbackMode,
    /// Per-page revalidation in seconds, overriding the engine default
    pub revalidate: Option<u64>,
    pub tags: Vec<String>,
    pub static_props: Option<Arc<dyn StaticPropsProvider>>,
}

impl ResolvedRoute {
    /// Route for a path with no parameters and no static-props step
    pub fn plain(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            params: Params::new(),
            locale: None,
            fallback: FallbackMode::Blocking,
            revalidate: None,
            tags: Vec::new(),
            static_props: None,
        }
    }
}

impl fmt::Debug for ResolvedRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedRoute")
            .field("pattern", &self.pattern)
            .field("params", &self.params)
            .field("locale", &self.locale)
            .field("fallback", &self.fallback)
            .field("revalidate", &self.revalidate)
            .field("tags", &self.tags)
            .field("static_props", &self.static_props.is_some())
            .finish()
    }
}

/// Maps a request path to route params and fallback mode
pub trait RouteResolver: Send + Sync {
    /// `None` when no page serves `path`
    fn resolve(&self, path: &str) -> Option<ResolvedRoute>;
}

/// A page as registered with the engine
#[derive(Clone)]
pub struct PageModule {
    /// Where the page came from, reported with collection errors
    pub source: String,
    pub pattern: RoutePattern,
    pub paths: Option<Arc<dyn PathsProvider>>,
    pub static_props: Option<Arc<dyn StaticPropsProvider>>,
    pub revalidate: Option<u64>,
    pub tags: Vec<String>,
}

impl PageModule {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = RoutePattern::parse(pattern)?;
        Ok(Self {
            source: pattern.as_str().to_string(),
            pattern,
            paths: None,
            static_props: None,
            revalidate: None,
            tags: Vec::new(),
        })
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_paths(mut self, provider: Arc<dyn PathsProvider>) -> Self {
        self.paths = Some(provider);
        self
    }

    pub fn with_static_props(mut self, provider: Arc<dyn StaticPropsProvider>) -> Self {
        self.static_props = Some(provider);
        self
    }

    pub fn with_revalidate(mut self, seconds: u64) -> Self {
        self.revalidate = Some(seconds);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

impl fmt::Debug for PageModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageModule")
            .field("source", &self.source)
            .field("pattern", &self.pattern.as_str())
            .field("paths", &self.paths.is_some())
            .field("static_props", &self.static_props.is_some())
            .field("revalidate", &self.revalidate)
            .field("tags", &self.tags)
            .finish()
    }
}

/// Route resolver over registered page modules.
///
/// Static patterns win over dynamic ones; among dynamic patterns the first
/// registered match wins. Fallback modes and the set of prerendered paths
/// are filled in by path collection.
#[derive(Default)]
pub struct PageRegistry {
    modules: Vec<PageModule>,
    locales: LocaleConfig,
    fallbacks: DashMap<String, FallbackMode>,
    prerendered: DashSet<String>,
}

impl PageRegistry {
    pub fn new(locales: LocaleConfig) -> Self {
        Self {
            locales,
            ..Self::default()
        }
    }

    pub fn register(&mut self, module: PageModule) -> &mut Self {
        self.modules.push(module);
        self
    }

    pub fn with_page(mut self, module: PageModule) -> Self {
        self.modules.push(module);
        self
    }

    pub fn modules(&self) -> &[PageModule] {
        &self.modules
    }

    pub fn locales(&self) -> &LocaleConfig {
        &self.locales
    }

    /// Remember the fallback mode a paths provider declared for `pattern`
    pub fn set_fallback(&self, pattern: &str, mode: FallbackMode) {
        self.fallbacks.insert(pattern.to_string(), mode);
    }

    /// Remember that `path` was generated at build time
    pub fn mark_prerendered(&self, path: &str) {
        self.prerendered.insert(normalize_path(path).into_owned());
    }

    pub fn is_prerendered(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.prerendered.contains(&*path)
    }

    fn fallback_for(&self, module: &PageModule, path: &str) -> FallbackMode {
        if !module.pattern.is_dynamic() || self.is_prerendered(path) {
            return FallbackMode::Blocking;
        }
        self.fallbacks
            .get(module.pattern.as_str())
            .map(|mode| *mode)
            .unwrap_or_default()
    }
}

impl RouteResolver for PageRegistry {
    fn resolve(&self, path: &str) -> Option<ResolvedRoute> {
        let normalized = normalize_path(path);
        let (locale, bare) = self.locales.strip_locale(&normalized);
        let locale = locale
            .or_else(|| self.locales.default_locale())
            .map(str::to_string);

        let statics = self.modules.iter().filter(|m| !m.pattern.is_dynamic());
        let dynamics = self.modules.iter().filter(|m| m.pattern.is_dynamic());

        statics.chain(dynamics).find_map(|module| {
            let params = module.pattern.matches(bare)?;
            Some(ResolvedRoute {
                pattern: module.pattern.as_str().to_string(),
                params,
                locale: locale.clone(),
                fallback: self.fallback_for(module, &normalized),
                revalidate: module.revalidate,
                tags: module.tags.clone(),
                static_props: module.static_props.clone(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use silcrow_router::ParamValue;

    fn registry() -> PageRegistry {
        PageRegistry::new(LocaleConfig {
            locales: vec!["en".to_string(), "fr".to_string()],
            default_locale: Some("en".to_string()),
        })
        .with_page(PageModule::new("/posts/[id]").unwrap().with_tags(["posts"]))
        .with_page(PageModule::new("/posts/new").unwrap())
        .with_page(PageModule::new("/").unwrap().with_revalidate(10))
    }

    #[test]
    fn test_static_pattern_wins() {
        let route = registry().resolve("/posts/new").unwrap();
        assert_eq!(route.pattern, "/posts/new");
        assert!(route.params.is_empty());
    }

    #[test]
    fn test_dynamic_params_and_locale() {
        let route = registry().resolve("/fr/posts/7/").unwrap();
        assert_eq!(route.pattern, "/posts/[id]");
        assert_eq!(route.params.get("id"), Some(&ParamValue::from("7")));
        assert_eq!(route.locale.as_deref(), Some("fr"));
        assert_eq!(route.tags, vec!["posts"]);

        let root = registry().resolve("/").unwrap();
        assert_eq!(root.locale.as_deref(), Some("en"));
        assert_eq!(root.revalidate, Some(10));
    }

    #[test]
    fn test_unknown_path() {
        assert!(registry().resolve("/nope/deeper").is_none());
    }

    #[test]
    fn test_fallback_from_collection() {
        let registry = registry();
        assert_eq!(
            registry.resolve("/posts/1").unwrap().fallback,
            FallbackMode::Blocking
        );

        registry.set_fallback("/posts/[id]", FallbackMode::Disabled);
        registry.mark_prerendered("/posts/1");

        assert_eq!(
            registry.resolve("/posts/2").unwrap().fallback,
            FallbackMode::Disabled
        );
        assert_eq!(
            registry.resolve("/posts/1").unwrap().fallback,
            FallbackMode::Blocking
        );
    }

    #[test]
    fn test_fallback_mode_serde() {
        let modes: Vec<FallbackMode> =
            serde_json::from_str(r#"["blocking", "static", false, true]"#).unwrap();
        assert_eq!(
            modes,
            vec![
                FallbackMode::Blocking,
                FallbackMode::Static,
                FallbackMode::Disabled,
                FallbackMode::Static
            ]
        );

        assert_eq!(
            serde_json::to_string(&FallbackMode::Disabled).unwrap(),
            "false"
        );
        assert!(serde_json::from_str::<FallbackMode>(r#""sometimes""#).is_err());
    }
}
