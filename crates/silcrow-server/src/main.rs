mod config;
mod pages;

use crate::config::{Settings, DEFAULT_CONFIG_PATH};
use anyhow::{Context, Result};
use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::json;
use silcrow_isr::{IsrEngine, IsrEvent, PathFilter};
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,silcrow_isr=debug")),
        )
        .init();

    let config_path =
        std::env::var("SILCROW_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let settings = Settings::load(&config_path, std::env::var("SILCROW_REVALIDATE_TOKEN").ok())
        .with_context(|| format!("Failed to load {}", config_path))?;

    if settings.isr.revalidation_secret.is_none() {
        warn!("no revalidation secret configured, the webhook will reject every request");
    }

    let registry = pages::registry(settings.isr.locales.clone())?;
    let engine = IsrEngine::builder(settings.isr.clone())
        .renderer(pages::renderer())
        .registry(registry)
        .exclude(PathFilter::prefix("/api"))
        .build()
        .await?;

    spawn_event_logger(&engine);

    if settings.server.prerender {
        let report = engine.prerender().await?;
        info!(
            pages = report.generation.pages.len(),
            errors = report.errors().count(),
            "prerender finished"
        );
    }

    let api = Router::new()
        .route("/api/stats", get(stats_handler))
        .with_state(engine.clone());
    let app = engine.into_router(api).layer(TraceLayer::new_for_http());

    let addr = settings.server.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server running at http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.close().await?;
    Ok(())
}

async fn stats_handler(State(engine): State<IsrEngine>) -> Json<serde_json::Value> {
    let stats = engine.handler().stats();
    Json(json!({
        "hits": stats.hits,
        "misses": stats.misses,
        "staleHits": stats.stale_hits,
        "regenerations": stats.regenerations,
        "regenerationFailures": stats.regeneration_failures,
        "hitRate": stats.hit_rate(),
    }))
}

fn spawn_event_logger(engine: &IsrEngine) {
    let mut events = engine.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(IsrEvent::RevalidateError { path, error }) => {
                    warn!(%path, %error, "revalidation failed")
                }
                Ok(event) => debug!(event = event.name(), path = event.path(), "isr event"),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}
