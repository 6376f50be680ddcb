//! Per-request ISR orchestration
//!
//! `handle` runs filter → lookup → serve (queueing a background
//! regeneration when stale) or miss → resolve route → fallback. Every
//! failure past the filter step, panics included, becomes a 500 response.

use crate::cache::{CacheEntry, CacheStats, EntryStatus};
use crate::error::{IsrError, Result};
use crate::events::{EventBus, IsrEvent};
use crate::fallback::{FallbackHandler, FallbackOutcome};
use crate::render::{Redirect, RequestInfo};
use crate::revalidator::Revalidator;
use crate::route::RouteResolver;
use crate::runtime::RuntimeCache;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use chrono::{SecondsFormat, TimeZone, Utc};
use futures::FutureExt;
use regex::Regex;
use serde::Serialize;
use silcrow_router::normalize_path;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

const HEADER_CACHE: &str = "x-isr-cache";
const HEADER_STATUS: &str = "x-isr-status";
const HEADER_REVALIDATED_AT: &str = "x-isr-revalidated-at";
const HEADER_REGENERATIONS: &str = "x-isr-regeneration-count";
const HEADER_CONTENT_HASH: &str = "x-isr-content-hash";

/// Selects which request paths the handler takes
#[derive(Clone)]
pub enum PathFilter {
    Prefix(String),
    Pattern(Regex),
    Func(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl PathFilter {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        PathFilter::Prefix(prefix.into())
    }

    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(PathFilter::Pattern)
            .map_err(|e| IsrError::Validation(format!("invalid path filter {:?}: {}", pattern, e)))
    }

    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        PathFilter::Func(Arc::new(f))
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathFilter::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathFilter::Pattern(regex) => regex.is_match(path),
            PathFilter::Func(f) => f(path),
        }
    }
}

impl fmt::Debug for PathFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathFilter::Prefix(prefix) => f.debug_tuple("Prefix").field(prefix).finish(),
            PathFilter::Pattern(regex) => f.debug_tuple("Pattern").field(&regex.as_str()).finish(),
            PathFilter::Func(_) => f.write_str("Func(..)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Filters {
    include: Vec<PathFilter>,
    exclude: Vec<PathFilter>,
}

impl Filters {
    fn accepts(&self, path: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|f| f.matches(path));
        included && !self.exclude.iter().any(|f| f.matches(path))
    }
}

/// Transport-neutral request
#[derive(Debug, Clone)]
pub struct IsrRequest {
    pub method: Method,
    /// Path, optionally with a query string
    pub path: String,
    pub headers: HeaderMap,
}

impl IsrRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Headers and cookies handed to request-mode renders
    pub fn request_info(&self) -> RequestInfo {
        let mut info = RequestInfo::default();
        for (name, value) in &self.headers {
            let Ok(value) = value.to_str() else { continue };
            if name == header::COOKIE {
                for pair in value.split(';') {
                    if let Some((k, v)) = pair.trim().split_once('=') {
                        info.cookies.insert(k.to_string(), v.to_string());
                    }
                }
            } else {
                info.headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        info
    }
}

/// Transport-neutral response
#[derive(Debug, Clone, PartialEq)]
pub struct IsrResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl IsrResponse {
    fn html(status: StatusCode, body: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(HTML_CONTENT_TYPE));
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    fn not_found() -> Self {
        Self::html(StatusCode::NOT_FOUND, "Not Found")
    }

    fn redirect(redirect: &Redirect) -> Self {
        let status = StatusCode::from_u16(redirect.status()).unwrap_or(StatusCode::TEMPORARY_REDIRECT);
        let mut response = Self::html(status, "");
        if let Ok(location) = HeaderValue::from_str(&redirect.destination) {
            response.headers.insert(header::LOCATION, location);
        }
        response
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Whether the handler answered or left the request to the next layer
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    PassThrough,
    Response(IsrResponse),
}

/// Paths marked stale by an on-demand revalidation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OnDemandReport {
    pub paths: Vec<String>,
    /// Regenerations started; the rest were already running or backing off
    pub queued: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Options {
    debug: bool,
    debug_headers: bool,
}

/// The ISR request handler
#[derive(Clone)]
pub struct IsrHandler {
    cache: RuntimeCache,
    revalidator: Revalidator,
    fallback: FallbackHandler,
    resolver: Arc<dyn RouteResolver>,
    events: EventBus,
    filters: Arc<Filters>,
    options: Options,
    counters: Arc<Counters>,
}

impl IsrHandler {
    pub fn new(
        cache: RuntimeCache,
        revalidator: Revalidator,
        fallback: FallbackHandler,
        resolver: Arc<dyn RouteResolver>,
        events: EventBus,
    ) -> Self {
        Self {
            cache,
            revalidator,
            fallback,
            resolver,
            events,
            filters: Arc::new(Filters::default()),
            options: Options::default(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Only handle paths matching one of the include filters
    pub fn include(mut self, filter: PathFilter) -> Self {
        Arc::make_mut(&mut self.filters).include.push(filter);
        self
    }

    /// Never handle paths matching this filter
    pub fn exclude(mut self, filter: PathFilter) -> Self {
        Arc::make_mut(&mut self.filters).exclude.push(filter);
        self
    }

    /// Put error messages in 500 bodies
    pub fn debug(mut self, enabled: bool) -> Self {
        self.options.debug = enabled;
        self
    }

    pub fn debug_headers(mut self, enabled: bool) -> Self {
        self.options.debug_headers = enabled;
        self
    }

    pub fn cache(&self) -> &RuntimeCache {
        &self.cache
    }

    pub fn revalidator(&self) -> &Revalidator {
        &self.revalidator
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stats(&self) -> CacheStats {
        let revalidator = self.revalidator.stats();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_hits: self.counters.stale_hits.load(Ordering::Relaxed),
            regenerations: revalidator.regenerations + revalidator.unchanged,
            regeneration_failures: revalidator.failures,
        }
    }

    /// Handle one request. Never fails; errors become 500 responses.
    pub async fn handle(&self, request: &IsrRequest) -> HandlerOutcome {
        if request.method != Method::GET {
            return HandlerOutcome::PassThrough;
        }

        let path = normalize_path(&request.path).into_owned();
        if !self.filters.accepts(&path) {
            return HandlerOutcome::PassThrough;
        }

        let result = AssertUnwindSafe(self.serve(&path, request))
            .catch_unwind()
            .await;

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => self.internal_error(&path, &e.to_string()),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                self.internal_error(&path, &message)
            }
        };

        HandlerOutcome::Response(response)
    }

    async fn serve(&self, path: &str, request: &IsrRequest) -> Result<IsrResponse> {
        let lookup = self.cache.lookup(path).await;

        if let (true, Some(entry)) = (lookup.can_serve, lookup.entry) {
            let status = lookup.status.unwrap_or_default();

            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            if lookup.is_stale {
                self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
                if self.revalidator.queue_revalidation(path).is_some() {
                    debug!(%path, %status, "serving stale page, regeneration queued");
                }
            }
            self.events.emit(IsrEvent::CacheHit {
                path: path.to_string(),
                status,
            });

            let label = if lookup.is_stale { "STALE" } else { "HIT" };
            return Ok(self.entry_response(&entry, status, label, request));
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.events.emit(IsrEvent::CacheMiss {
            path: path.to_string(),
        });

        let Some(route) = self.resolver.resolve(path) else {
            return Ok(IsrResponse::not_found());
        };

        let outcome = self
            .fallback
            .handle_miss(path, &route, Some(request.request_info()))
            .await?;

        Ok(match outcome {
            FallbackOutcome::Rendered(entry) => {
                self.entry_response(&entry, EntryStatus::Fresh, "MISS", request)
            }
            FallbackOutcome::Placeholder { html } => {
                let mut response = IsrResponse::html(StatusCode::OK, html);
                response
                    .headers
                    .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
                if self.options.debug_headers {
                    response
                        .headers
                        .insert(HEADER_CACHE, HeaderValue::from_static("FALLBACK"));
                }
                response
            }
            FallbackOutcome::NotFound => IsrResponse::not_found(),
            FallbackOutcome::Redirect(redirect) => IsrResponse::redirect(&redirect),
        })
    }

    fn entry_response(
        &self,
        entry: &CacheEntry,
        status: EntryStatus,
        label: &'static str,
        request: &IsrRequest,
    ) -> IsrResponse {
        let etag = self.cache.etag(entry);
        let not_modified = request
            .headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| etag_matches(v, &etag));

        let mut response = if not_modified {
            IsrResponse {
                status: StatusCode::NOT_MODIFIED,
                headers: HeaderMap::new(),
                body: String::new(),
            }
        } else {
            let mut response = IsrResponse::html(StatusCode::OK, entry.html.clone());
            for (name, value) in entry.headers.iter().flatten() {
                match (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
                    (Ok(name), Ok(value)) => {
                        response.headers.insert(name, value);
                    }
                    _ => debug!(header = %name, "skipping invalid cached header"),
                }
            }
            response
        };

        let headers = &mut response.headers;
        insert(headers, header::CACHE_CONTROL, &self.cache.cache_control(entry));
        insert(headers, header::ETAG, &etag);

        if self.options.debug_headers {
            headers.insert(HEADER_CACHE, HeaderValue::from_static(label));
            headers.insert(HEADER_STATUS, HeaderValue::from_static(status.as_str()));
            if let Some(at) = Utc.timestamp_millis_opt(entry.meta.revalidated_at).single() {
                insert(
                    headers,
                    HeaderName::from_static(HEADER_REVALIDATED_AT),
                    &at.to_rfc3339_opts(SecondsFormat::Millis, true),
                );
            }
            insert(
                headers,
                HeaderName::from_static(HEADER_REGENERATIONS),
                &entry.meta.regeneration_count.to_string(),
            );
            if let Some(ref hash) = entry.meta.content_hash {
                insert(headers, HeaderName::from_static(HEADER_CONTENT_HASH), hash);
            }
        }

        response
    }

    fn internal_error(&self, path: &str, message: &str) -> IsrResponse {
        error!(%path, error = %message, "ISR handler failed");
        self.events.emit(IsrEvent::Error {
            path: path.to_string(),
            message: message.to_string(),
        });

        let body = if self.options.debug {
            format!("Internal Server Error: {}", message)
        } else {
            "Internal Server Error".to_string()
        };
        IsrResponse::html(StatusCode::INTERNAL_SERVER_ERROR, body)
    }

    /// Mark `paths` and everything tagged with `tags` stale and queue their
    /// regeneration. Explicit requests skip any failure backoff.
    pub async fn revalidate_on_demand(&self, paths: &[String], tags: &[String]) -> Result<OnDemandReport> {
        let mut stale = BTreeSet::new();

        for tag in tags {
            stale.extend(self.cache.invalidate_tag(tag).await?);
        }
        for path in paths {
            let path = normalize_path(path).into_owned();
            if self.cache.invalidate_path(&path).await? {
                stale.insert(path);
            }
        }

        let mut queued = 0;
        for path in &stale {
            self.revalidator.reset_backoff(path);
            if self.revalidator.queue_revalidation(path).is_some() {
                queued += 1;
            }
        }

        Ok(OnDemandReport {
            paths: stale.into_iter().collect(),
            queued,
        })
    }
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Weak comparison of an `If-None-Match` list against `etag`
fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let bare = |tag: &str| tag.trim().trim_start_matches("W/").to_string();
    let etag = bare(etag);
    if_none_match
        .split(',')
        .any(|candidate| candidate.trim() == "*" || bare(candidate) == etag)
}
