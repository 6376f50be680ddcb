//! On-disk build output: one HTML file per page plus `manifest.json`

use crate::build::generator::{BuiltPage, GenerationReport};
use crate::config::OutputConfig;
use crate::error::{IsrError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub build_time: i64,
    pub version: String,
    pub routes: BTreeMap<String, ManifestRoute>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRoute {
    /// Relative to the output directory, `/`-separated
    pub file: String,
    pub pattern: String,
    pub content_hash: Option<String>,
    pub revalidate: u64,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<ShellMeta>,
}

/// Partial-prerendering shell metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellMeta {
    pub content_hash: Option<String>,
    pub boundary_count: usize,
}

/// What [`OutputWriter::write`] produced
#[derive(Debug, Clone, Default)]
pub struct WrittenOutput {
    pub manifest: Manifest,
    /// Pages that could not be written; they are left out of the manifest
    pub errors: Vec<IsrError>,
}

/// Writes generated pages under the configured output directory
#[derive(Debug, Clone)]
pub struct OutputWriter {
    config: OutputConfig,
}

impl OutputWriter {
    pub fn new(config: OutputConfig) -> Self {
        Self { config }
    }

    /// Relative file for a request path.
    ///
    /// `/` is always `index.html`. With trailing slashes `/about` becomes
    /// `about/index.html`, otherwise `about.html`.
    pub fn file_for(&self, path: &str) -> Result<String> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok("index.html".to_string());
        }

        if trimmed
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\'))
        {
            return Err(IsrError::Output(format!("refusing to write unsafe path {}", path)));
        }

        Ok(if self.config.trailing_slash {
            format!("{}/index.html", trimmed)
        } else {
            format!("{}.html", trimmed)
        })
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Write every page, then the manifest.
    ///
    /// A page that cannot be written is reported in
    /// [`WrittenOutput::errors`] and the rest are still written. Only a
    /// missing output directory or a failed manifest write is fatal.
    pub async fn write(&self, report: &GenerationReport) -> Result<WrittenOutput> {
        fs::create_dir_all(&self.config.dir)
            .await
            .map_err(|e| output_error(&self.config.dir, e))?;

        let mut routes = BTreeMap::new();
        let mut errors = Vec::new();
        for page in &report.pages {
            let file = match self.write_page(page).await {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %page.path, error = %e, "skipping page output");
                    errors.push(e);
                    continue;
                }
            };

            let meta = &page.entry.meta;
            let shell = self.config.ppr.then(|| ShellMeta {
                content_hash: meta.content_hash.clone(),
                boundary_count: page.entry.html.matches(self.config.boundary_marker.as_str()).count(),
            });

            routes.insert(
                page.path.clone(),
                ManifestRoute {
                    file,
                    pattern: page.pattern.clone(),
                    content_hash: meta.content_hash.clone(),
                    revalidate: meta.revalidate_interval,
                    tags: meta.tags.iter().cloned().collect(),
                    shell,
                },
            );
        }

        let manifest = Manifest {
            build_time: report.build_time,
            version: env!("CARGO_PKG_VERSION").to_string(),
            routes,
        };

        let manifest_path = self.config.dir.join(MANIFEST_FILE);
        fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
            .await
            .map_err(|e| output_error(&manifest_path, e))?;

        info!(
            dir = %self.config.dir.display(),
            pages = manifest.routes.len(),
            failed = errors.len(),
            "build output written"
        );
        Ok(WrittenOutput { manifest, errors })
    }

    async fn write_page(&self, page: &BuiltPage) -> Result<String> {
        let file = self.file_for(&page.path)?;
        let target = self.config.dir.join(&file);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| output_error(parent, e))?;
        }
        fs::write(&target, &page.entry.html)
            .await
            .map_err(|e| output_error(&target, e))?;
        debug!(path = %page.path, file = %file, "wrote page");
        Ok(file)
    }
}

fn output_error(path: &Path, err: std::io::Error) -> IsrError {
    IsrError::Output(format!("{}: {}", path.display(), err))
}
