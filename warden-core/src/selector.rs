//! Node and workload selectors.
//!
//! A selector is a `(type, value)` fact attributed to a node at attestation
//! time (e.g. `aws:tag:env=prod`) or required of a node by a registration
//! entry. Selector sets are unordered and duplicate-free.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A single `(type, value)` selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Selector {
    #[serde(rename = "type")]
    pub selector_type: String,
    pub value: String,
}

impl Selector {
    pub fn new(selector_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            selector_type: selector_type.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.selector_type, self.value)
    }
}

/// Match mode for selector-filtered list operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorMatch {
    /// The stored set equals the query set.
    Exact,
    /// The stored set is a subset of the query set.
    Subset,
    /// The stored set is a superset of the query set.
    Superset,
}

impl SelectorMatch {
    /// Apply this mode with `stored` as the candidate and `query` as the
    /// reference set.
    pub fn matches(&self, stored: &[Selector], query: &[Selector]) -> bool {
        let stored: BTreeSet<&Selector> = stored.iter().collect();
        let query: BTreeSet<&Selector> = query.iter().collect();
        match self {
            SelectorMatch::Exact => stored == query,
            SelectorMatch::Subset => stored.is_subset(&query),
            SelectorMatch::Superset => stored.is_superset(&query),
        }
    }
}

/// True when every selector in `needles` appears in `haystack`.
pub fn is_subset(needles: &[Selector], haystack: &[Selector]) -> bool {
    SelectorMatch::Subset.matches(needles, haystack)
}

/// Sort and de-duplicate a selector set in place.
pub fn normalize(selectors: &mut Vec<Selector>) {
    selectors.sort();
    selectors.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sel(t: &str, v: &str) -> Selector {
        Selector::new(t, v)
    }

    #[test]
    fn display_joins_with_colon() {
        assert_eq!(sel("unix", "uid:0").to_string(), "unix:uid:0");
    }

    #[test]
    fn exact_match() {
        let a = vec![sel("t", "a"), sel("t", "b")];
        let b = vec![sel("t", "b"), sel("t", "a")];
        assert!(SelectorMatch::Exact.matches(&a, &b));
        assert!(!SelectorMatch::Exact.matches(&a, &[sel("t", "a")]));
    }

    #[test]
    fn subset_match() {
        let stored = vec![sel("t", "a")];
        let query = vec![sel("t", "a"), sel("t", "b")];
        assert!(SelectorMatch::Subset.matches(&stored, &query));
        assert!(!SelectorMatch::Subset.matches(&query, &stored));
        // The empty set is a subset of everything.
        assert!(SelectorMatch::Subset.matches(&[], &stored));
    }

    #[test]
    fn superset_match() {
        let stored = vec![sel("t", "a"), sel("t", "b")];
        let query = vec![sel("t", "a")];
        assert!(SelectorMatch::Superset.matches(&stored, &query));
        assert!(!SelectorMatch::Superset.matches(&query, &stored));
    }

    #[test]
    fn normalize_sorts_and_dedups() {
        let mut set = vec![sel("b", "2"), sel("a", "1"), sel("b", "2")];
        normalize(&mut set);
        assert_eq!(set, vec![sel("a", "1"), sel("b", "2")]);
    }

    #[test]
    fn serde_field_names() {
        let json = serde_json::to_string(&sel("k8s", "ns:prod")).unwrap();
        assert_eq!(json, r#"{"type":"k8s","value":"ns:prod"}"#);
    }
}
