//! axum integration: middleware and revalidation webhook

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use silcrow_isr::http::REVALIDATION_TOKEN_HEADER;
use silcrow_isr::{
    render_fn, CacheAdapter, IsrConfig, IsrEngine, PageModule, PageRegistry, PathFilter,
};
use tower::ServiceExt;

const SECRET: &str = "s3cret";

async fn engine(secret: Option<&str>) -> IsrEngine {
    let config = IsrConfig {
        revalidation_secret: secret.map(str::to_string),
        ..IsrConfig::default()
    };
    IsrEngine::builder(config)
        .renderer(render_fn(|path, _ctx| async move {
            Ok(format!("<h1>{}</h1>", path))
        }))
        .registry(
            PageRegistry::default()
                .with_page(PageModule::new("/").unwrap())
                .with_page(PageModule::new("/about").unwrap().with_tags(["pages"])),
        )
        .exclude(PathFilter::prefix("/api"))
        .build()
        .await
        .unwrap()
}

fn app(engine: &IsrEngine) -> Router {
    engine.into_router(
        Router::new()
            .route("/about", post(|| async { "posted" }))
            .route("/api/health", get(|| async { "ok" })),
    )
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn revalidate(token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/revalidate")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header(REVALIDATION_TOKEN_HEADER, token);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_middleware_serves_pages_and_passes_through() {
    let engine = engine(None).await;

    let (status, body) = send(app(&engine), get_request("/about?ref=home")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<h1>/about</h1>");
    assert!(engine.adapter().has("/about").await.unwrap());

    let post = Request::builder()
        .method(Method::POST)
        .uri("/about")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(&engine), post).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "posted");

    let (status, body) = send(app(&engine), get_request("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");

    let (status, _) = send(app(&engine), get_request("/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_fetch_entry_point() {
    let engine = engine(None).await;

    let response = engine.handler().fetch(&get_request("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let post = Request::builder()
        .method(Method::DELETE)
        .uri("/")
        .body(Body::empty())
        .unwrap();
    assert!(engine.handler().fetch(&post).await.is_none());
}

#[tokio::test]
async fn test_webhook_rejects_bad_tokens() {
    let engine = engine(Some(SECRET)).await;

    let (status, body) = send(app(&engine), revalidate(None, r#"{"paths":["/about"]}"#)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({ "error": "Unauthorized" }));

    let (status, _) = send(
        app(&engine),
        revalidate(Some("wrong"), r#"{"paths":["/about"]}"#),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_webhook_without_secret_rejects_everything() {
    let engine = engine(None).await;

    let (status, _) = send(
        app(&engine),
        revalidate(Some(SECRET), r#"{"paths":["/about"]}"#),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_webhook_rejects_malformed_bodies() {
    let engine = engine(Some(SECRET)).await;

    let (status, _) = send(app(&engine), revalidate(Some(SECRET), "not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(app(&engine), revalidate(Some(SECRET), "{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_revalidates_tagged_paths() {
    let engine = engine(Some(SECRET)).await;
    engine.prerender().await.unwrap();

    let (status, body) = send(
        app(&engine),
        revalidate(Some(SECRET), r#"{"tags":["pages"],"paths":["/","/unknown"]}"#),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["revalidated"], true);
    assert_eq!(body["paths"], json!(["/", "/about"]));
    assert_eq!(body["queued"], 2);
    assert!(body["now"].is_number());
}

#[tokio::test]
async fn test_webhook_reports_adapter_failure() {
    let engine = engine(Some(SECRET)).await;
    engine.close().await.unwrap();

    let (status, body) = send(
        app(&engine),
        revalidate(Some(SECRET), r#"{"tags":["pages"]}"#),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert!(body["error"].is_string());
}
