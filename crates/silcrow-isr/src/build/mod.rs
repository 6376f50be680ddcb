//! Build-time prerendering
//!
//! - [`collector`]: expand page modules into concrete paths
//! - [`generator`]: render those paths into the cache
//! - [`output`]: optionally write them to disk with a manifest
//! - [`document`]: HTML document wrapper shared with request-time renders

pub mod collector;
pub mod document;
pub mod generator;
pub mod output;

use crate::error::IsrError;
use generator::GenerationReport;
use output::Manifest;

/// Result of a full build
#[derive(Debug, Default)]
pub struct BuildReport {
    /// Paths handed to the generator
    pub collected: usize,
    pub generation: GenerationReport,
    pub collection_errors: Vec<IsrError>,
    /// Present when build output is configured
    pub manifest: Option<Manifest>,
    /// Pages rendered into the cache but not written to disk
    pub output_errors: Vec<IsrError>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.errors().next().is_none()
    }

    /// Collection, then generation, then output errors
    pub fn errors(&self) -> impl Iterator<Item = &IsrError> {
        self.collection_errors
            .iter()
            .chain(&self.generation.errors)
            .chain(&self.output_errors)
    }
}
