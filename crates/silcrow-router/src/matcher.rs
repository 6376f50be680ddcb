use crate::error::PatternError;
use crate::path::normalize_path;
use crate::pattern::{classify_segment, PatternSegmentType};
use crate::{ParamValue, Params};
use once_cell::sync::Lazy;
use regex::Regex;

static PARAM_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("param name regex is valid")
});

/// A named parameter of a compiled pattern, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// One non-slash segment
    Plain,
    /// One or more segments
    CatchAll,
    /// Zero or more segments
    OptionalCatchAll,
}

/// A compiled bracket-syntax route pattern.
///
/// Holds the anchored regex used for matching plus the ordered parameter
/// list used both for capture extraction and for interpolation.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    source: String,
    segments: Vec<PatternSegmentType>,
    params: Vec<ParamSpec>,
    regex: Regex,
}

impl RoutePattern {
    /// Parse and compile a pattern such as `/posts/[id]`.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if !pattern.starts_with('/') {
            return Err(PatternError::MissingLeadingSlash(pattern.to_string()));
        }

        let segments: Vec<PatternSegmentType> = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|raw| validate_segment(pattern, raw))
            .collect::<Result<_, _>>()?;

        let mut params: Vec<ParamSpec> = Vec::new();
        let mut body = String::new();

        for (idx, segment) in segments.iter().enumerate() {
            if segment.is_catch_all() && idx + 1 != segments.len() {
                return Err(PatternError::CatchAllNotLast {
                    pattern: pattern.to_string(),
                    name: segment.param_name().unwrap_or_default().to_string(),
                });
            }

            if let Some(name) = segment.param_name() {
                if params.iter().any(|p| p.name == name) {
                    return Err(PatternError::DuplicateParam {
                        pattern: pattern.to_string(),
                        name: name.to_string(),
                    });
                }
            }

            match segment {
                PatternSegmentType::Static(text) => {
                    body.push('/');
                    body.push_str(&regex::escape(text));
                }
                PatternSegmentType::Required(name) => {
                    body.push_str("/([^/]+)");
                    params.push(ParamSpec { name: name.clone(), kind: ParamKind::Plain });
                }
                PatternSegmentType::CatchAll(name) => {
                    body.push_str("/(.+)");
                    params.push(ParamSpec { name: name.clone(), kind: ParamKind::CatchAll });
                }
                PatternSegmentType::OptionalCatchAll(name) => {
                    body.push_str("(?:/(.+))?");
                    params.push(ParamSpec {
                        name: name.clone(),
                        kind: ParamKind::OptionalCatchAll,
                    });
                }
            }
        }

        let regex = if body.is_empty() {
            Regex::new("^/$")?
        } else {
            Regex::new(&format!("^{}/?$", body))?
        };

        Ok(Self {
            source: pattern.to_string(),
            segments,
            params,
            regex,
        })
    }

    /// The pattern text this was compiled from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The compiled matching expression.
    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// Parameters in declaration order.
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn param_names(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn is_dynamic(&self) -> bool {
        !self.params.is_empty()
    }

    /// Match a concrete request path, returning the captured parameters.
    ///
    /// The path is normalized first, so `/posts/42/` and `/posts/42?x=1`
    /// match the same way as `/posts/42`. An optional catch-all that captured
    /// nothing is left out of the result.
    pub fn matches(&self, path: &str) -> Option<Params> {
        let path = normalize_path(path);
        let captures = self.regex.captures(&path)?;

        let params = self
            .params
            .iter()
            .enumerate()
            .filter_map(|(idx, spec)| {
                let value = captures.get(idx + 1)?.as_str();
                let value = match spec.kind {
                    ParamKind::Plain => ParamValue::Single(value.to_string()),
                    ParamKind::CatchAll | ParamKind::OptionalCatchAll => ParamValue::Multiple(
                        value.split('/').map(str::to_string).collect(),
                    ),
                };
                Some((spec.name.clone(), value))
            })
            .collect();

        Some(params)
    }

    /// Expand the pattern into a concrete path using `params`.
    ///
    /// Plain parameters need a single non-empty segment, catch-alls need a
    /// non-empty list, optional catch-alls may be absent or empty.
    pub fn interpolate(&self, params: &Params) -> Result<String, PatternError> {
        let mut out = String::new();

        for segment in &self.segments {
            match segment {
                PatternSegmentType::Static(text) => {
                    out.push('/');
                    out.push_str(text);
                }
                PatternSegmentType::Required(name) => {
                    let value = params
                        .get(name)
                        .ok_or_else(|| self.missing(name))?
                        .as_single()
                        .ok_or_else(|| invalid(name, "expected a single segment, got a list"))?;
                    check_segment(name, value)?;
                    out.push('/');
                    out.push_str(value);
                }
                PatternSegmentType::CatchAll(name) => {
                    let values = params
                        .get(name)
                        .ok_or_else(|| self.missing(name))?
                        .as_segments()
                        .ok_or_else(|| invalid(name, "catch-all expects a list of segments"))?;
                    if values.is_empty() {
                        return Err(invalid(name, "catch-all needs at least one segment"));
                    }
                    push_segments(&mut out, name, values)?;
                }
                PatternSegmentType::OptionalCatchAll(name) => match params.get(name) {
                    None => {}
                    Some(value) => {
                        let values = value.as_segments().ok_or_else(|| {
                            invalid(name, "optional catch-all expects a list of segments")
                        })?;
                        push_segments(&mut out, name, values)?;
                    }
                },
            }
        }

        if out.is_empty() {
            out.push('/');
        }
        Ok(out)
    }

    fn missing(&self, name: &str) -> PatternError {
        PatternError::MissingParam {
            pattern: self.source.clone(),
            name: name.to_string(),
        }
    }
}

fn validate_segment(pattern: &str, raw: &str) -> Result<PatternSegmentType, PatternError> {
    let segment = classify_segment(raw);

    match segment.param_name() {
        Some(name) => {
            if !PARAM_NAME.is_match(name) {
                return Err(PatternError::InvalidParamName {
                    pattern: pattern.to_string(),
                    name: name.to_string(),
                });
            }
        }
        None => {
            if raw.contains('[') || raw.contains(']') {
                return Err(PatternError::UnbalancedBracket {
                    pattern: pattern.to_string(),
                    segment: raw.to_string(),
                });
            }
        }
    }

    Ok(segment)
}

fn push_segments(out: &mut String, name: &str, values: &[String]) -> Result<(), PatternError> {
    for value in values {
        check_segment(name, value)?;
        out.push('/');
        out.push_str(value);
    }
    Ok(())
}

fn check_segment(name: &str, value: &str) -> Result<(), PatternError> {
    if value.is_empty() {
        return Err(invalid(name, "segment is empty"));
    }
    if value.contains('/') {
        return Err(invalid(name, "segment contains '/'"));
    }
    Ok(())
}

fn invalid(name: &str, reason: &str) -> PatternError {
    PatternError::InvalidParamValue {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_pattern_regex() {
        let pattern = RoutePattern::parse("/blog/archive").unwrap();
        assert!(!pattern.is_dynamic());
        assert!(pattern.matches("/blog/archive").is_some());
        assert!(pattern.matches("/blog").is_none());
    }

    #[test]
    fn test_root_pattern() {
        let pattern = RoutePattern::parse("/").unwrap();
        assert!(pattern.matches("/").is_some());
        assert!(pattern.matches("/x").is_none());
        assert_eq!(pattern.interpolate(&Params::new()).unwrap(), "/");
    }

    #[test]
    fn test_static_text_is_escaped() {
        let pattern = RoutePattern::parse("/feed.xml").unwrap();
        assert!(pattern.matches("/feed.xml").is_some());
        assert!(pattern.matches("/feedxxml").is_none());
    }

    #[test]
    fn test_param_order() {
        let pattern = RoutePattern::parse("/[lang]/posts/[id]").unwrap();
        assert_eq!(pattern.param_names(), vec!["lang", "id"]);
    }

    #[test]
    fn test_catch_all_must_be_last() {
        let err = RoutePattern::parse("/docs/[...slug]/edit").unwrap_err();
        assert!(matches!(err, PatternError::CatchAllNotLast { .. }));
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(matches!(
            RoutePattern::parse("/posts/[]").unwrap_err(),
            PatternError::InvalidParamName { .. }
        ));
        assert!(matches!(
            RoutePattern::parse("/posts/[id").unwrap_err(),
            PatternError::UnbalancedBracket { .. }
        ));
        assert!(matches!(
            RoutePattern::parse("/[id]/[id]").unwrap_err(),
            PatternError::DuplicateParam { .. }
        ));
        assert!(matches!(
            RoutePattern::parse("posts").unwrap_err(),
            PatternError::MissingLeadingSlash(_)
        ));
    }
}
