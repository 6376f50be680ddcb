/// Pattern parsing for route segments
///
/// Pure parsing of bracket-syntax route patterns into typed segments.

/// Represents the kinds of route pattern segments
///
/// # Examples
///
/// ```
/// use silcrow_router::pattern::{classify_segment, PatternSegmentType};
///
/// assert!(matches!(classify_segment("about"), PatternSegmentType::Static(_)));
/// assert!(matches!(classify_segment("[id]"), PatternSegmentType::Required(_)));
/// assert!(matches!(classify_segment("[...slug]"), PatternSegmentType::CatchAll(_)));
/// assert!(matches!(classify_segment("[[...slug]]"), PatternSegmentType::OptionalCatchAll(_)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSegmentType {
    /// Catch-all segment: `[...slug]`, one or more path segments
    CatchAll(String),
    /// Optional catch-all segment: `[[...slug]]`, zero or more path segments
    OptionalCatchAll(String),
    /// Required parameter: `[id]`, exactly one path segment
    Required(String),
    /// Static text segment
    Static(String),
}

impl PatternSegmentType {
    /// Parameter name carried by a dynamic segment.
    pub fn param_name(&self) -> Option<&str> {
        match self {
            PatternSegmentType::CatchAll(name)
            | PatternSegmentType::OptionalCatchAll(name)
            | PatternSegmentType::Required(name) => Some(name),
            PatternSegmentType::Static(_) => None,
        }
    }

    pub fn is_catch_all(&self) -> bool {
        matches!(
            self,
            PatternSegmentType::CatchAll(_) | PatternSegmentType::OptionalCatchAll(_)
        )
    }
}

/// Classifies a segment into a pattern type
///
/// # Parsing Rules (evaluated in order)
///
/// 1. **Optional catch-all**: `[[...name]]`
/// 2. **Catch-all**: `[...name]`
/// 3. **Required param**: `[name]`
/// 4. **Static**: any other text
///
/// Names are returned verbatim; validation of the name happens when the
/// whole pattern is compiled.
pub fn classify_segment(segment: &str) -> PatternSegmentType {
    if let Some(inner) = segment
        .strip_prefix("[[")
        .and_then(|s| s.strip_suffix("]]"))
    {
        if let Some(name) = inner.strip_prefix("...") {
            return PatternSegmentType::OptionalCatchAll(name.to_string());
        }
    }

    match segment.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        Some(inner) => match inner.strip_prefix("...") {
            Some(name) => PatternSegmentType::CatchAll(name.to_string()),
            None => PatternSegmentType::Required(inner.to_string()),
        },
        None => PatternSegmentType::Static(segment.to_string()),
    }
}

/// Whether a route pattern has any bracketed parameter.
///
/// ```
/// use silcrow_router::is_dynamic_pattern;
///
/// assert!(!is_dynamic_pattern("/about"));
/// assert!(is_dynamic_pattern("/posts/[id]"));
/// ```
pub fn is_dynamic_pattern(pattern: &str) -> bool {
    pattern
        .split('/')
        .any(|segment| !matches!(classify_segment(segment), PatternSegmentType::Static(_)))
}
