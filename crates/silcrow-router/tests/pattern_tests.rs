//! Integration tests for silcrow-router
//!
//! Covers matching of the three dynamic segment kinds and the reverse
//! direction (interpolating params into concrete paths).

use pretty_assertions::assert_eq;
use rstest::rstest;
use silcrow_router::*;

fn segments(values: &[&str]) -> ParamValue {
    ParamValue::Multiple(values.iter().map(|s| s.to_string()).collect())
}

#[test]
fn test_plain_param_matches_single_segment() {
    let pattern = RoutePattern::parse("/posts/[id]").unwrap();
    let params = pattern.matches("/posts/42").unwrap();
    assert_eq!(params.len(), 1);
    assert_eq!(params.get("id"), Some(&ParamValue::Single("42".to_string())));

    assert!(pattern.matches("/posts/42/comments").is_none());
    assert!(pattern.matches("/posts").is_none());
}

#[test]
fn test_catch_all_captures_remainder() {
    let pattern = RoutePattern::parse("/docs/[...slug]").unwrap();
    let params = pattern.matches("/docs/a/b/c").unwrap();
    assert_eq!(params.get("slug"), Some(&segments(&["a", "b", "c"])));

    // One-or-more: the bare prefix does not match.
    assert!(pattern.matches("/docs").is_none());
}

#[test]
fn test_optional_catch_all_matches_zero_or_more() {
    let pattern = RoutePattern::parse("/opt/[[...slug]]").unwrap();

    let empty = pattern.matches("/opt").unwrap();
    assert!(empty.is_empty());

    let params = pattern.matches("/opt/x/y").unwrap();
    assert_eq!(params.get("slug"), Some(&segments(&["x", "y"])));
}

#[test]
fn test_root_optional_catch_all() {
    let pattern = RoutePattern::parse("/[[...slug]]").unwrap();
    assert!(pattern.matches("/").unwrap().is_empty());
    assert_eq!(
        pattern.matches("/a/b").unwrap().get("slug"),
        Some(&segments(&["a", "b"]))
    );
}

#[rstest]
#[case("/posts/42/", "42")]
#[case("/posts/42?preview=1", "42")]
#[case("/posts//42", "42")]
fn test_matching_normalizes_request_path(#[case] path: &str, #[case] id: &str) {
    let pattern = RoutePattern::parse("/posts/[id]").unwrap();
    let params = pattern.matches(path).unwrap();
    assert_eq!(params.get("id").and_then(ParamValue::as_single), Some(id));
}

#[test]
fn test_interpolate_plain_and_catch_all() {
    let pattern = RoutePattern::parse("/[lang]/docs/[...slug]").unwrap();
    let mut params = Params::new();
    params.insert("lang".into(), "en".into());
    params.insert("slug".into(), segments(&["guide", "intro"]));

    assert_eq!(pattern.interpolate(&params).unwrap(), "/en/docs/guide/intro");
}

#[test]
fn test_interpolate_optional_catch_all_absent() {
    let pattern = RoutePattern::parse("/opt/[[...slug]]").unwrap();
    assert_eq!(pattern.interpolate(&Params::new()).unwrap(), "/opt");

    let mut params = Params::new();
    params.insert("slug".into(), segments(&[]));
    assert_eq!(pattern.interpolate(&params).unwrap(), "/opt");
}

#[test]
fn test_interpolate_round_trips_through_matches() {
    let pattern = RoutePattern::parse("/shop/[category]/[...rest]").unwrap();
    let mut params = Params::new();
    params.insert("category".into(), "shoes".into());
    params.insert("rest".into(), segments(&["red", "42"]));

    let path = pattern.interpolate(&params).unwrap();
    assert_eq!(pattern.matches(&path).unwrap(), params);
}

#[test]
fn test_interpolate_missing_param() {
    let pattern = RoutePattern::parse("/posts/[id]").unwrap();
    let err = pattern.interpolate(&Params::new()).unwrap_err();
    assert!(matches!(err, PatternError::MissingParam { ref name, .. } if name == "id"));
}

#[rstest]
#[case("/posts/[id]", "id", segments(&["1", "2"]))]
#[case("/posts/[id]", "id", ParamValue::Single(String::new()))]
#[case("/posts/[id]", "id", ParamValue::Single("a/b".into()))]
#[case("/docs/[...slug]", "slug", ParamValue::Single("a".into()))]
#[case("/docs/[...slug]", "slug", segments(&[]))]
fn test_interpolate_rejects_malformed_values(
    #[case] pattern: &str,
    #[case] name: &str,
    #[case] value: ParamValue,
) {
    let pattern = RoutePattern::parse(pattern).unwrap();
    let mut params = Params::new();
    params.insert(name.to_string(), value);

    let err = pattern.interpolate(&params).unwrap_err();
    assert!(matches!(err, PatternError::InvalidParamValue { .. }), "{err}");
}

#[test]
fn test_params_deserialize_from_json() {
    let params: Params =
        serde_json::from_str(r#"{"id":"7","slug":["a","b"]}"#).unwrap();
    assert_eq!(params.get("id"), Some(&ParamValue::Single("7".into())));
    assert_eq!(params.get("slug"), Some(&segments(&["a", "b"])));
}
