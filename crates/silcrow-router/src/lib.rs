//! # Silcrow Router
//!
//! File-system style route patterns for keying prerendered pages:
//! - Static routes (`/about`)
//! - Dynamic parameters (`/posts/[id]`)
//! - Catch-all routes (`/docs/[...slug]`)
//! - Optional catch-all routes (`/opt/[[...slug]]`)
//!
//! Patterns compile to an anchored regular expression plus the ordered list
//! of parameter names, so a concrete request path can be matched back to its
//! route and a set of parameters can be expanded into a concrete path.
//!
//! ## Example
//!
//! ```
//! use silcrow_router::{ParamValue, RoutePattern};
//!
//! let pattern = RoutePattern::parse("/docs/[...slug]").unwrap();
//! let params = pattern.matches("/docs/a/b/c").unwrap();
//! assert_eq!(
//!     params.get("slug"),
//!     Some(&ParamValue::Multiple(vec!["a".into(), "b".into(), "c".into()]))
//! );
//! ```

use std::collections::HashMap;

// ============================================================================
// Module Declarations
// ============================================================================

mod error;
mod matcher;
pub mod path;
pub mod pattern;

pub use error::PatternError;
pub use matcher::{ParamKind, ParamSpec, RoutePattern};
pub use path::{is_valid_path, normalize_path};
pub use pattern::{classify_segment, is_dynamic_pattern, PatternSegmentType};

// ============================================================================
// Core Types
// ============================================================================

/// Value captured for a single route parameter.
///
/// Plain parameters capture one segment, catch-all parameters capture the
/// remainder of the path split on `/`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Single(String),
    Multiple(Vec<String>),
}

impl ParamValue {
    /// Returns the single segment value, if this is a plain parameter.
    pub fn as_single(&self) -> Option<&str> {
        match self {
            ParamValue::Single(value) => Some(value),
            ParamValue::Multiple(_) => None,
        }
    }

    /// Returns the captured segments, if this is a catch-all parameter.
    pub fn as_segments(&self) -> Option<&[String]> {
        match self {
            ParamValue::Single(_) => None,
            ParamValue::Multiple(values) => Some(values),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Single(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Single(value)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(values: Vec<String>) -> Self {
        ParamValue::Multiple(values)
    }
}

/// Route parameters keyed by parameter name.
pub type Params = HashMap<String, ParamValue>;
