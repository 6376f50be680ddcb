//! Error taxonomy for the ISR core

use std::time::Duration;

/// Errors surfaced by the ISR core.
///
/// Collaborators (renderers, props and paths providers, storage adapters)
/// report failures as `anyhow::Error`; the core records the message with the
/// path it was working on so errors can cross task boundaries and be logged
/// or shown in debug responses.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IsrError {
    /// A page module's path collection or paths provider failed.
    #[error("path collection failed for {source_path}: {message}")]
    Collection { source_path: String, message: String },

    /// The render collaborator (or the static-props step) failed.
    #[error("render failed for {path}: {message}")]
    Render { path: String, message: String },

    /// The render collaborator did not finish within the configured timeout.
    #[error("render timed out for {path} after {timeout:?}")]
    Timeout { path: String, timeout: Duration },

    /// A storage adapter operation failed.
    #[error("cache adapter error: {0}")]
    Adapter(String),

    /// Malformed input rejected before doing any work.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("build output error: {0}")]
    Output(String),
}

impl IsrError {
    pub fn render(path: &str, err: &anyhow::Error) -> Self {
        IsrError::Render {
            path: path.to_string(),
            message: format!("{:#}", err),
        }
    }

    pub fn adapter(err: &anyhow::Error) -> Self {
        IsrError::Adapter(format!("{:#}", err))
    }
}

impl From<silcrow_router::PatternError> for IsrError {
    fn from(err: silcrow_router::PatternError) -> Self {
        IsrError::Validation(err.to_string())
    }
}

impl From<std::io::Error> for IsrError {
    fn from(err: std::io::Error) -> Self {
        IsrError::Output(err.to_string())
    }
}

impl From<serde_json::Error> for IsrError {
    fn from(err: serde_json::Error) -> Self {
        IsrError::Output(err.to_string())
    }
}

pub type Result<T, E = IsrError> = std::result::Result<T, E>;
