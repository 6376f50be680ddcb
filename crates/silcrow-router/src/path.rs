//! Request path canonicalization
//!
//! Every cache key is a canonical path, so two spellings of the same page
//! (`/posts/1/`, `/posts/1?ref=feed`, `//posts//1`) share one entry.

use std::borrow::Cow;

/// True when `path` is already a canonical cache key.
///
/// Canonical means a leading `/`, no empty segments, no backslashes, and
/// no trailing `/` unless the path is the root.
///
/// ```
/// use silcrow_router::path::is_valid_path;
///
/// assert!(is_valid_path("/posts/42"));
/// assert!(!is_valid_path("posts/42"));
/// assert!(!is_valid_path("/posts/42/"));
/// ```
pub fn is_valid_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    !rest.contains('\\') && rest.split('/').all(|segment| !segment.is_empty())
}

/// Canonical cache key for a request path.
///
/// Query strings and fragments are dropped, separators are collapsed and
/// backslashes become `/`. Already canonical input is borrowed.
///
/// ```
/// use silcrow_router::path::normalize_path;
/// use std::borrow::Cow;
///
/// assert!(matches!(normalize_path("/about"), Cow::Borrowed("/about")));
/// assert_eq!(normalize_path("/posts/42/?ref=home"), "/posts/42");
/// ```
pub fn normalize_path(path: &str) -> Cow<'_, str> {
    let path = path.split(['?', '#']).next().unwrap_or_default();

    if is_valid_path(path) {
        return Cow::Borrowed(path);
    }

    let mut key = String::with_capacity(path.len() + 1);
    for segment in path.split(['/', '\\']).filter(|s| !s.is_empty()) {
        key.push('/');
        key.push_str(segment);
    }
    if key.is_empty() {
        key.push('/');
    }
    Cow::Owned(key)
}
