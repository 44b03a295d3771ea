//! Cached content values and entries.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Opaque resolved content of a chunk.
///
/// A small structural value model: enough shape for the memory estimator to
/// walk, serializable for snapshots. `Shared` lets several places reference
/// the same subtree; the estimator counts a shared subtree once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Content {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Binary(Bytes),
    /// Ordered sequence (arrays and sets).
    List(Vec<Content>),
    /// Keyed collection with arbitrary keys.
    Map(Vec<(Content, Content)>),
    /// Plain structure with named fields.
    Record(BTreeMap<String, Content>),
    /// Reference to a subtree that may appear more than once.
    Shared(Arc<Content>),
}

impl Content {
    /// Build a record from `(field, value)` pairs.
    pub fn record<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Content)>,
    {
        Content::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Wrap a value so it can be referenced from several places.
    pub fn shared(value: Content) -> Self {
        Content::Shared(Arc::new(value))
    }

    /// Values the cache refuses to store: null, `false`, zero/NaN, and empty
    /// text or bytes.
    pub fn is_falsy(&self) -> bool {
        match self {
            Content::Null => true,
            Content::Bool(b) => !b,
            Content::Number(n) => *n == 0.0 || n.is_nan(),
            Content::Text(s) => s.is_empty(),
            Content::Binary(b) => b.is_empty(),
            Content::Shared(inner) => inner.is_falsy(),
            Content::List(_) | Content::Map(_) | Content::Record(_) => false,
        }
    }

    /// Whether this is a leaf value (not a container or reference).
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Content::Null
                | Content::Bool(_)
                | Content::Number(_)
                | Content::Text(_)
                | Content::Binary(_)
        )
    }

    /// Copy of this value that survives a JSON round trip: non-finite
    /// numbers, which JSON cannot represent, become `Null`.
    pub fn to_persistable(&self) -> Content {
        match self {
            Content::Number(n) if !n.is_finite() => Content::Null,
            Content::List(items) => Content::List(items.iter().map(Content::to_persistable).collect()),
            Content::Map(pairs) => Content::Map(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_persistable(), v.to_persistable()))
                    .collect(),
            ),
            Content::Record(fields) => Content::Record(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_persistable()))
                    .collect(),
            ),
            Content::Shared(inner) => Content::Shared(Arc::new(inner.to_persistable())),
            other => other.clone(),
        }
    }

    /// Text payload, if this is (or shares) a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            Content::Shared(inner) => inner.as_text(),
            _ => None,
        }
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<bool> for Content {
    fn from(b: bool) -> Self {
        Content::Bool(b)
    }
}

impl From<f64> for Content {
    fn from(n: f64) -> Self {
        Content::Number(n)
    }
}

impl From<i64> for Content {
    fn from(n: i64) -> Self {
        Content::Number(n as f64)
    }
}

impl From<Bytes> for Content {
    fn from(b: Bytes) -> Self {
        Content::Binary(b)
    }
}

impl From<Vec<Content>> for Content {
    fn from(items: Vec<Content>) -> Self {
        Content::List(items)
    }
}

/// A stored cache value with its timestamps (epoch milliseconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub value: Content,
    /// Readable only while `now < expiry`.
    pub expiry: u64,
    pub last_used: u64,
}

impl CacheEntry {
    pub fn new(value: Content, expiry: u64, last_used: u64) -> Self {
        Self {
            value,
            expiry,
            last_used,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expiry
    }
}
