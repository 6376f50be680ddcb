//! Static generation: render collected paths into the cache

use crate::build::collector::CollectedPath;
use crate::cache::{CacheEntry, EntryStatus};
use crate::error::IsrError;
use crate::render::{Generated, PagePipeline, RenderMode};
use crate::storage::CacheAdapter;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};

/// A page written to the cache during the build
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltPage {
    pub path: String,
    pub pattern: String,
    pub entry: CacheEntry,
}

/// Why a collected path produced no page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipKind {
    NotFound,
    Redirect { destination: String },
}

#[derive(Debug, Default)]
pub struct GenerationReport {
    /// Timestamp stamped on every generated entry
    pub build_time: i64,
    /// In collection order
    pub pages: Vec<BuiltPage>,
    pub skipped: Vec<(String, SkipKind)>,
    /// Render and cache write failures, one per path
    pub errors: Vec<IsrError>,
}

/// Renders collected paths with bounded concurrency
#[derive(Clone)]
pub struct StaticGenerator {
    pipeline: PagePipeline,
    adapter: Arc<dyn CacheAdapter>,
    concurrency: usize,
}

enum PageResult {
    Built(BuiltPage),
    Skipped(String, SkipKind),
    Failed(IsrError),
}

impl StaticGenerator {
    pub fn new(pipeline: PagePipeline, adapter: Arc<dyn CacheAdapter>, concurrency: usize) -> Self {
        Self {
            pipeline,
            adapter,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn generate(&self, paths: &[CollectedPath]) -> GenerationReport {
        let build_time = self.pipeline.clock().now_ms();
        info!(paths = paths.len(), concurrency = self.concurrency, "generating static pages");

        let mut results: Vec<(usize, PageResult)> = stream::iter(paths.iter().enumerate())
            .map(|(index, collected)| async move {
                (index, self.generate_one(collected, build_time).await)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        let mut report = GenerationReport {
            build_time,
            ..GenerationReport::default()
        };
        for (_, result) in results {
            match result {
                PageResult::Built(page) => report.pages.push(page),
                PageResult::Skipped(path, kind) => report.skipped.push((path, kind)),
                PageResult::Failed(e) => report.errors.push(e),
            }
        }

        info!(
            generated = report.pages.len(),
            skipped = report.skipped.len(),
            failed = report.errors.len(),
            "static generation finished"
        );
        report
    }

    async fn generate_one(&self, collected: &CollectedPath, build_time: i64) -> PageResult {
        let path = &collected.path;

        let mut entry = match self
            .pipeline
            .generate(path, &collected.route, RenderMode::Build, None)
            .await
        {
            Ok(Generated::Page(entry)) => entry,
            Ok(Generated::NotFound) => return PageResult::Skipped(path.clone(), SkipKind::NotFound),
            Ok(Generated::Redirect(redirect)) => {
                return PageResult::Skipped(
                    path.clone(),
                    SkipKind::Redirect {
                        destination: redirect.destination,
                    },
                )
            }
            Err(e) => {
                warn!(%path, error = %e, "page generation failed");
                return PageResult::Failed(e);
            }
        };

        entry.meta.created_at = build_time;
        entry.meta.revalidated_at = build_time;
        entry.meta.regeneration_count = 0;
        entry.meta.status = EntryStatus::Fresh;

        if let Err(e) = self.adapter.set(path, entry.clone()).await {
            warn!(%path, error = %e, "failed to store generated page");
            return PageResult::Failed(IsrError::adapter(&e));
        }

        PageResult::Built(BuiltPage {
            path: path.clone(),
            pattern: collected.route.pattern.clone(),
            entry,
        })
    }
}
