use unimesh::matches;

#[test]
fn single_level_wildcard_matches_one_segment() {
    assert!(matches("a/+/c", "a/b/c"));
    assert!(!matches("a/+/c", "a/b/d"));
    assert!(!matches("a/+", "a"));
    assert!(!matches("+", ""));
}

#[test]
fn multi_level_wildcard_consumes_the_rest() {
    assert!(matches("a/#", "a"));
    assert!(matches("a/#", "a/b"));
    assert!(matches("a/#", "a/b/c"));
    assert!(matches("#", "anything/at/all"));
}

#[test]
fn literal_filters_require_exact_exhaustion() {
    assert!(matches("a/b", "a/b"));
    assert!(!matches("a/b", "a/b/c"));
    assert!(!matches("a/b/c", "a/b"));
    assert!(!matches("a/b", "a/x"));
}

#[test]
fn leading_and_trailing_separators_are_insignificant() {
    assert!(matches("/a/b/", "a/b"));
    assert!(matches("a/b", "/a/b/"));
    assert!(matches("/plant/+/temp", "plant/line-1/temp/"));
}

#[test]
fn wildcards_compose() {
    assert!(matches("uns-infra/pkg/+/+/active", "uns-infra/pkg/1.0.0/bridge/active"));
    assert!(!matches("uns-infra/pkg/+/+/active", "uns-infra/pkg/1.0.0/active"));
    assert!(matches("uns-infra/pkg/#", "uns-infra/pkg/1.0.0/bridge/handover"));
}
