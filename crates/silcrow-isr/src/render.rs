//! Render collaborator contracts and the shared page pipeline
//!
//! Every page generation (build, background regeneration, blocking
//! fallback) goes through [`PagePipeline::generate`]: static props first,
//! then the renderer, both bounded by the render timeout.

use crate::build::document::{wrap_document, DocumentParts};
use crate::cache::{CacheEntry, CacheEntryMeta};
use crate::clock::SharedClock;
use crate::error::{IsrError, Result};
use crate::route::ResolvedRoute;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use silcrow_router::Params;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Whether a render happens ahead of traffic or for a live request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    Build,
    Request,
}

/// Parts of the incoming request exposed to request-mode renders
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestInfo {
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
}

/// Everything a render call gets to see besides the path
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderContext {
    pub path: String,
    pub params: Params,
    pub locale: Option<String>,
    pub mode: RenderMode,
    /// Only set in [`RenderMode::Request`]
    pub request: Option<RequestInfo>,
    /// Output of the page's static-props step, if it has one
    pub props: Option<serde_json::Value>,
}

/// Produces page markup
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, path: &str, ctx: &RenderContext) -> anyhow::Result<String>;
}

struct FnRenderer<F>(F);

#[async_trait]
impl<F, Fut> Renderer for FnRenderer<F>
where
    F: Fn(String, RenderContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn render(&self, path: &str, ctx: &RenderContext) -> anyhow::Result<String> {
        (self.0)(path.to_string(), ctx.clone()).await
    }
}

/// Wrap an async closure as a [`Renderer`]
pub fn render_fn<F, Fut>(f: F) -> Arc<dyn Renderer>
where
    F: Fn(String, RenderContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    Arc::new(FnRenderer(f))
}

/// Redirect produced by a static-props step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub destination: String,
    #[serde(default)]
    pub permanent: bool,
}

impl Redirect {
    pub fn status(&self) -> u16 {
        if self.permanent {
            308
        } else {
            307
        }
    }
}

/// Result of a page's static-props step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticProps {
    #[serde(default)]
    pub props: Option<serde_json::Value>,

    /// Short-circuit to a 404 without caching
    #[serde(default)]
    pub not_found: bool,

    /// Short-circuit to a redirect without caching
    #[serde(default)]
    pub redirect: Option<Redirect>,

    /// Seconds, overriding the page and engine defaults
    #[serde(default)]
    pub revalidate: Option<u64>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// `<meta>` tags for the document shell
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl StaticProps {
    pub fn props(props: serde_json::Value) -> Self {
        Self {
            props: Some(props),
            ..Self::default()
        }
    }

    pub fn not_found() -> Self {
        Self {
            not_found: true,
            ..Self::default()
        }
    }

    pub fn redirect(destination: impl Into<String>, permanent: bool) -> Self {
        Self {
            redirect: Some(Redirect {
                destination: destination.into(),
                permanent,
            }),
            ..Self::default()
        }
    }
}

/// Per-page data step run before rendering
#[async_trait]
pub trait StaticPropsProvider: Send + Sync {
    async fn static_props(&self, ctx: &RenderContext) -> anyhow::Result<StaticProps>;
}

struct FnPropsProvider<F>(F);

#[async_trait]
impl<F, Fut> StaticPropsProvider for FnPropsProvider<F>
where
    F: Fn(RenderContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<StaticProps>> + Send + 'static,
{
    async fn static_props(&self, ctx: &RenderContext) -> anyhow::Result<StaticProps> {
        (self.0)(ctx.clone()).await
    }
}

/// Wrap an async closure as a [`StaticPropsProvider`]
pub fn props_fn<F, Fut>(f: F) -> Arc<dyn StaticPropsProvider>
where
    F: Fn(RenderContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<StaticProps>> + Send + 'static,
{
    Arc::new(FnPropsProvider(f))
}

/// Outcome of generating one page
#[derive(Debug, Clone, PartialEq)]
pub enum Generated {
    Page(CacheEntry),
    NotFound,
    Redirect(Redirect),
}

/// Static props, render and document wrapping for one path
#[derive(Clone)]
pub struct PagePipeline {
    renderer: Arc<dyn Renderer>,
    clock: SharedClock,
    default_revalidate: Duration,
    render_timeout: Duration,
    wrap_documents: bool,
}

impl PagePipeline {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        clock: SharedClock,
        default_revalidate: Duration,
        render_timeout: Duration,
    ) -> Self {
        Self {
            renderer,
            clock,
            default_revalidate,
            render_timeout,
            wrap_documents: false,
        }
    }

    /// Wrap rendered fragments in a full HTML document
    pub fn wrap_documents(mut self, enabled: bool) -> Self {
        self.wrap_documents = enabled;
        self
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    async fn bounded<T, F>(&self, path: &str, fut: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.render_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(IsrError::render(path, &e)),
            Err(_) => Err(IsrError::Timeout {
                path: path.to_string(),
                timeout: self.render_timeout,
            }),
        }
    }

    /// Generate `path` for `route`.
    ///
    /// Not-found and redirect results from the static-props step are
    /// returned before the renderer is called.
    pub async fn generate(
        &self,
        path: &str,
        route: &ResolvedRoute,
        mode: RenderMode,
        request: Option<RequestInfo>,
    ) -> Result<Generated> {
        let mut ctx = RenderContext {
            path: path.to_string(),
            params: route.params.clone(),
            locale: route.locale.clone(),
            mode,
            request: match mode {
                RenderMode::Request => request,
                RenderMode::Build => None,
            },
            props: None,
        };

        let static_props = match route.static_props {
            Some(ref provider) => self.bounded(path, provider.static_props(&ctx)).await?,
            None => StaticProps::default(),
        };

        if static_props.not_found {
            return Ok(Generated::NotFound);
        }
        if let Some(redirect) = static_props.redirect {
            return Ok(Generated::Redirect(redirect));
        }

        ctx.props = static_props.props.clone();
        let body = self.bounded(path, self.renderer.render(path, &ctx)).await?;

        let html = if self.wrap_documents {
            wrap_document(
                &body,
                &DocumentParts {
                    locale: ctx.locale.as_deref(),
                    meta: &static_props.meta,
                    props: ctx.props.as_ref(),
                },
            )
        } else {
            body
        };

        let revalidate = static_props
            .revalidate
            .or(route.revalidate)
            .unwrap_or(self.default_revalidate.as_secs());

        let meta = CacheEntryMeta::new(self.clock.now_ms(), revalidate);
        let mut entry = CacheEntry::new(html, meta)
            .with_tags(route.tags.iter().cloned())
            .with_tags(static_props.tags);
        entry.props = static_props.props;

        Ok(Generated::Page(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;
    use silcrow_router::ParamValue;

    fn pipeline(timeout: Duration) -> PagePipeline {
        let renderer = render_fn(|path, ctx| async move {
            if path == "/slow" {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if path == "/boom" {
                anyhow::bail!("template exploded");
            }
            let id = ctx
                .params
                .get("id")
                .and_then(|v| v.as_single())
                .unwrap_or("-")
                .to_string();
            Ok(format!("<p>{} {} {:?}</p>", path, id, ctx.props))
        });
        PagePipeline::new(
            renderer,
            Arc::new(ManualClock::new(5_000)),
            Duration::from_secs(60),
            timeout,
        )
    }

    fn route(pattern: &str) -> ResolvedRoute {
        let mut route = ResolvedRoute::plain(pattern);
        route.params.insert("id".to_string(), ParamValue::from("9"));
        route.tags = vec!["posts".to_string()];
        route
    }

    #[tokio::test]
    async fn test_generate_builds_entry() {
        let Generated::Page(entry) = pipeline(Duration::from_secs(1))
            .generate("/posts/9", &route("/posts/[id]"), RenderMode::Build, None)
            .await
            .unwrap()
        else {
            panic!("expected page");
        };

        assert_eq!(entry.html, "<p>/posts/9 9 None</p>");
        assert_eq!(entry.meta.created_at, 5_000);
        assert_eq!(entry.meta.revalidate_interval, 60);
        assert!(entry.meta.tags.contains("posts"));
        assert!(entry.meta.content_hash.is_some());
    }

    #[tokio::test]
    async fn test_static_props_feed_render_and_meta() {
        let mut route = route("/posts/[id]");
        route.revalidate = Some(30);
        route.static_props = Some(props_fn(|ctx| async move {
            let mut props = StaticProps::props(serde_json::json!({ "mode": ctx.mode }));
            props.revalidate = Some(5);
            props.tags = vec!["post:9".to_string()];
            Ok(props)
        }));

        let Generated::Page(entry) = pipeline(Duration::from_secs(1))
            .generate("/posts/9", &route, RenderMode::Request, None)
            .await
            .unwrap()
        else {
            panic!("expected page");
        };

        assert!(entry.html.contains("request"));
        assert_eq!(entry.meta.revalidate_interval, 5);
        assert_eq!(entry.meta.tags.len(), 2);
        assert_eq!(entry.props, Some(serde_json::json!({ "mode": "request" })));
    }

    #[tokio::test]
    async fn test_not_found_and_redirect_skip_render() {
        let mut missing = route("/posts/[id]");
        missing.static_props = Some(props_fn(|_| async { Ok(StaticProps::not_found()) }));

        let mut moved = route("/posts/[id]");
        moved.static_props = Some(props_fn(|_| async {
            Ok(StaticProps::redirect("/new", true))
        }));

        let pipeline = pipeline(Duration::from_secs(1));
        assert_eq!(
            pipeline.generate("/boom", &missing, RenderMode::Request, None).await.unwrap(),
            Generated::NotFound
        );

        let Generated::Redirect(redirect) = pipeline
            .generate("/boom", &moved, RenderMode::Request, None)
            .await
            .unwrap()
        else {
            panic!("expected redirect");
        };
        assert_eq!(redirect.destination, "/new");
        assert_eq!(redirect.status(), 308);
    }

    #[tokio::test]
    async fn test_render_failure_carries_path() {
        let err = pipeline(Duration::from_secs(1))
            .generate("/boom", &route("/boom"), RenderMode::Build, None)
            .await
            .unwrap_err();

        match err {
            IsrError::Render { path, message } => {
                assert_eq!(path, "/boom");
                assert!(message.contains("template exploded"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_timeout() {
        let err = pipeline(Duration::from_secs(2))
            .generate("/slow", &route("/slow"), RenderMode::Build, None)
            .await
            .unwrap_err();

        assert!(matches!(err, IsrError::Timeout { ref path, .. } if path == "/slow"));
    }

    #[tokio::test]
    async fn test_wrapped_document() {
        let Generated::Page(entry) = pipeline(Duration::from_secs(1))
            .wrap_documents(true)
            .generate("/posts/9", &route("/posts/[id]"), RenderMode::Build, None)
            .await
            .unwrap()
        else {
            panic!("expected page");
        };

        assert!(entry.html.starts_with("<!DOCTYPE html>"));
        assert!(entry.html.contains("<p>/posts/9 9 None</p>"));
    }
}
