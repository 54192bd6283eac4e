//! Cache identifiers and namespaced key derivation.
//!
//! Plain-text identifiers are used verbatim. Structured identifiers are
//! canonicalised (object fields sorted at every depth) and hashed with
//! SHA-256, so `{"a":1,"b":2}` and `{"b":2,"a":1}` address the same entry.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::{GovernorError, Result};

/// Identifies one cached value within a category.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheIdentifier {
    /// Used as-is in the key.
    Text(String),
    /// Canonicalised and hashed before use.
    Structured(Value),
}

impl CacheIdentifier {
    /// Build a structured identifier from `(field, value)` pairs.
    pub fn fields<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let map: Map<String, Value> = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        CacheIdentifier::Structured(Value::Object(map))
    }

    /// The key fragment for this identifier.
    ///
    /// Fails with [`GovernorError::InvalidInput`] on an empty text identifier.
    pub fn fragment(&self) -> Result<String> {
        match self {
            CacheIdentifier::Text(text) if text.is_empty() => Err(GovernorError::InvalidInput(
                "cache identifier must not be empty".to_string(),
            )),
            CacheIdentifier::Text(text) => Ok(text.clone()),
            CacheIdentifier::Structured(value) => Ok(digest(value)),
        }
    }
}

impl From<&str> for CacheIdentifier {
    fn from(text: &str) -> Self {
        CacheIdentifier::Text(text.to_string())
    }
}

impl From<String> for CacheIdentifier {
    fn from(text: String) -> Self {
        CacheIdentifier::Text(text)
    }
}

impl From<&String> for CacheIdentifier {
    fn from(text: &String) -> Self {
        CacheIdentifier::Text(text.clone())
    }
}

impl From<Value> for CacheIdentifier {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => CacheIdentifier::Text(text),
            other => CacheIdentifier::Structured(other),
        }
    }
}

/// Sort object fields recursively. Array order is significant and kept.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 hex digest of the canonical JSON form of `value`.
pub fn digest(value: &Value) -> String {
    let canonical = canonicalize(value).to_string();
    let hash = Sha256::digest(canonical.as_bytes());
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

/// Namespace segment holding tag sets; no data category may use it.
pub(crate) const TAG_NAMESPACE: &str = "tag";

/// `<prefix><category>:<fragment>`.
///
/// Categories that would land inside the tag namespace are rejected.
pub(crate) fn data_key(prefix: &str, category: &str, identifier: &CacheIdentifier) -> Result<String> {
    if category.is_empty() {
        return Err(GovernorError::InvalidInput(
            "cache category must not be empty".to_string(),
        ));
    }
    let reserved = category
        .strip_prefix(TAG_NAMESPACE)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(':'));
    if reserved {
        return Err(GovernorError::InvalidInput(format!(
            "cache category {category:?} is reserved for tag sets"
        )));
    }
    Ok(format!("{prefix}{category}:{}", identifier.fragment()?))
}

/// `<prefix>tag:<tag>`.
pub(crate) fn tag_key(prefix: &str, tag: &str) -> String {
    format!("{prefix}{TAG_NAMESPACE}:{tag}")
}
