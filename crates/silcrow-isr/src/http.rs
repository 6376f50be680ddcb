//! axum adapters: middleware, fetch-style entry point, revalidation webhook

use crate::handler::{HandlerOutcome, IsrHandler, IsrRequest, IsrResponse};
use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Header carrying the webhook's shared secret
pub const REVALIDATION_TOKEN_HEADER: &str = "x-revalidation-token";

pub const WEBHOOK_PATH: &str = "/api/revalidate";

impl IntoResponse for IsrResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

fn to_isr_request<B>(request: &axum::http::Request<B>) -> IsrRequest {
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    IsrRequest {
        method: request.method().clone(),
        path,
        headers: request.headers().clone(),
    }
}

impl IsrHandler {
    /// Fetch-style entry point. `None` means the request isn't ISR's to answer.
    pub async fn fetch<B>(&self, request: &axum::http::Request<B>) -> Option<Response> {
        match self.handle(&to_isr_request(request)).await {
            HandlerOutcome::Response(response) => Some(response.into_response()),
            HandlerOutcome::PassThrough => None,
        }
    }
}

/// Middleware answering ISR pages and passing everything else to `next`
pub async fn isr_middleware(
    State(handler): State<IsrHandler>,
    request: Request,
    next: Next,
) -> Response {
    match handler.handle(&to_isr_request(&request)).await {
        HandlerOutcome::Response(response) => response.into_response(),
        HandlerOutcome::PassThrough => next.run(request).await,
    }
}

/// Wrap `router` so GET requests go through the ISR handler first.
///
/// `router` becomes the fallback of an outer router, so the middleware also
/// sees paths `router` has no route for.
pub fn with_isr(router: Router, handler: IsrHandler) -> Router {
    Router::new()
        .fallback_service(router)
        .layer(middleware::from_fn_with_state(handler, isr_middleware))
}

#[derive(Clone)]
struct WebhookState {
    handler: IsrHandler,
    secret: Option<Arc<str>>,
}

#[derive(Debug, Default, Deserialize)]
struct RevalidateBody {
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Router exposing `POST /api/revalidate`.
///
/// Without a configured secret every call is rejected.
pub fn webhook_router(handler: IsrHandler, secret: Option<String>) -> Router {
    let state = WebhookState {
        handler,
        secret: secret.filter(|s| !s.is_empty()).map(Arc::from),
    };
    Router::new()
        .route(WEBHOOK_PATH, post(revalidate_webhook))
        .with_state(state)
}

async fn revalidate_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = headers
        .get(REVALIDATION_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());

    let authorized = match (state.secret.as_deref(), token) {
        (Some(secret), Some(token)) => constant_time_eq(secret.as_bytes(), token.as_bytes()),
        _ => false,
    };
    if !authorized {
        warn!("rejected revalidation request with missing or invalid token");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Unauthorized" }))).into_response();
    }

    let request: RevalidateBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid body: {}", e) })),
            )
                .into_response()
        }
    };
    if request.paths.is_empty() && request.tags.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "expected `paths` and/or `tags`" })),
        )
            .into_response();
    }

    match state
        .handler
        .revalidate_on_demand(&request.paths, &request.tags)
        .await
    {
        Ok(report) => {
            info!(paths = report.paths.len(), queued = report.queued, "on-demand revalidation");
            Json(json!({
                "revalidated": true,
                "paths": report.paths,
                "queued": report.queued,
                "now": state.handler.cache().clock().now_ms(),
            }))
            .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
