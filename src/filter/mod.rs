//! Filter algebra over stored resources.
//!
//! Filters are immutable values built with `with_*` combinators. `test` is
//! the ground-truth predicate; `intersect` returns a filter whose `test`
//! equals the conjunction of both inputs, or signals [`EmptyIntersection`]
//! when the conjunction is provably unsatisfiable. Stores may push filter
//! fields down into index scans but always re-check `test` on candidates.

mod resource;
mod spatial;
mod temporal;

pub use resource::{DataStreamFilter, FeatureFilter, FoiFilter, ObsFilter, SystemFilter};
pub use spatial::{Bbox, Geometry, SpatialFilter};
pub use temporal::{MAX_INSTANT_MS, TemporalFilter};

use std::collections::BTreeSet;

use crate::error::StoreError;

/// Signalled by `intersect` when the combined filter can match nothing.
/// Callers convert this to an empty result set, never to an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyIntersection;

/// Intersection of two optional constraint sets. `None` = unconstrained.
pub(crate) fn intersect_sets<T: Ord + Clone>(
    a: &Option<BTreeSet<T>>,
    b: &Option<BTreeSet<T>>,
) -> Result<Option<BTreeSet<T>>, EmptyIntersection> {
    match (a, b) {
        (None, None) => Ok(None),
        (Some(a), None) => Ok(Some(a.clone())),
        (None, Some(b)) => Ok(Some(b.clone())),
        (Some(a), Some(b)) => {
            let out: BTreeSet<T> = a.intersection(b).cloned().collect();
            if out.is_empty() {
                Err(EmptyIntersection)
            } else {
                Ok(Some(out))
            }
        }
    }
}

/// Compiles a `*` / `?` wildcard pattern into an anchored regex.
pub fn wildcard_regex(pattern: &str) -> Result<regex::Regex, StoreError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re)
        .map_err(|e| StoreError::InvalidRequest(format!("bad pattern {pattern:?}: {e}")))
}

/// Predicate on a single property value: wildcard match against strings,
/// exact match against numbers.
#[derive(Debug, Clone)]
pub enum PropPredicate {
    Pattern { pattern: String, regex: regex::Regex },
    Number(f64),
}

impl PropPredicate {
    pub fn pattern(pattern: impl Into<String>) -> Result<Self, StoreError> {
        let pattern = pattern.into();
        let regex = wildcard_regex(&pattern)?;
        Ok(PropPredicate::Pattern { pattern, regex })
    }

    pub fn number(n: f64) -> Self {
        PropPredicate::Number(n)
    }

    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match (self, value) {
            (PropPredicate::Pattern { regex, .. }, serde_json::Value::String(s)) => {
                regex.is_match(s)
            }
            (PropPredicate::Pattern { regex, .. }, other) => {
                // Non-string properties match patterns by their textual form.
                regex.is_match(&other.to_string())
            }
            (PropPredicate::Number(n), serde_json::Value::Number(v)) => {
                v.as_f64().is_some_and(|v| v == *n)
            }
            (PropPredicate::Number(_), _) => false,
        }
    }
}

impl PartialEq for PropPredicate {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                PropPredicate::Pattern { pattern: a, .. },
                PropPredicate::Pattern { pattern: b, .. },
            ) => a == b,
            (PropPredicate::Number(a), PropPredicate::Number(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_patterns() {
        let p = PropPredicate::pattern("temp_*").unwrap();
        assert!(p.matches(&serde_json::json!("temp_outdoor")));
        assert!(!p.matches(&serde_json::json!("humidity")));

        let q = PropPredicate::pattern("ch?").unwrap();
        assert!(q.matches(&serde_json::json!("ch1")));
        assert!(!q.matches(&serde_json::json!("ch10")));
    }

    #[test]
    fn test_wildcard_escapes_regex_metacharacters() {
        let p = PropPredicate::pattern("a.b").unwrap();
        assert!(p.matches(&serde_json::json!("a.b")));
        assert!(!p.matches(&serde_json::json!("axb")));
    }

    #[test]
    fn test_numeric_predicate_exact_match() {
        let p = PropPredicate::number(42.0);
        assert!(p.matches(&serde_json::json!(42)));
        assert!(p.matches(&serde_json::json!(42.0)));
        assert!(!p.matches(&serde_json::json!(42.5)));
        assert!(!p.matches(&serde_json::json!("42")));
    }

    #[test]
    fn test_intersect_sets() {
        let a: Option<BTreeSet<i64>> = Some([1, 2, 3].into());
        let b: Option<BTreeSet<i64>> = Some([2, 3, 4].into());
        assert_eq!(intersect_sets(&a, &b).unwrap(), Some([2, 3].into()));
        assert_eq!(intersect_sets(&a, &None).unwrap(), Some([1, 2, 3].into()));

        let c: Option<BTreeSet<i64>> = Some([9].into());
        assert_eq!(intersect_sets(&a, &c), Err(EmptyIntersection));
    }
}
