//! Approximate memory footprint of cached content.
//!
//! This is a heuristic, not an allocation count: every primitive leaf
//! contributes the byte length of its textual form, keys contribute their
//! UTF-8 length, and container overhead is ignored. Lists and maps are
//! walked recursively. Records only count their primitive fields. A
//! `Shared` subtree is walked the first time it is reached and contributes
//! nothing afterwards, across the whole estimate.

use super::content::Content;
use std::collections::HashSet;

/// Walks content and sums leaf sizes, remembering visited shared subtrees.
#[derive(Debug, Default)]
pub struct FootprintEstimator {
    seen: HashSet<*const Content>,
}

impl FootprintEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contribution of one cache entry (key plus value).
    pub fn entry(&mut self, key: &str, value: &Content) -> u64 {
        key.len() as u64 + self.content(value)
    }

    /// Contribution of a value.
    pub fn content(&mut self, value: &Content) -> u64 {
        match value {
            Content::List(items) => items.iter().map(|item| self.content(item)).sum(),
            Content::Map(pairs) => pairs
                .iter()
                .map(|(k, v)| self.content(k) + self.content(v))
                .sum(),
            Content::Record(fields) => fields
                .values()
                .filter(|v| v.is_primitive())
                .map(leaf_bytes)
                .sum(),
            Content::Shared(inner) => {
                if self.seen.insert(std::sync::Arc::as_ptr(inner)) {
                    self.content(inner)
                } else {
                    0
                }
            }
            leaf => leaf_bytes(leaf),
        }
    }
}

/// Byte length of a primitive's textual form; 0 for non-primitives.
fn leaf_bytes(value: &Content) -> u64 {
    match value {
        Content::Null => 0,
        Content::Bool(true) => 4,
        Content::Bool(false) => 5,
        Content::Number(n) => n.to_string().len() as u64,
        Content::Text(s) => s.len() as u64,
        Content::Binary(b) => b.len() as u64,
        _ => 0,
    }
}

/// Estimate the footprint of a set of entries.
pub fn estimate<'a, I>(entries: I) -> u64
where
    I: IntoIterator<Item = (&'a str, &'a Content)>,
{
    let mut estimator = FootprintEstimator::new();
    entries
        .into_iter()
        .map(|(key, value)| estimator.entry(key, value))
        .sum()
}
