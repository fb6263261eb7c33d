use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Deduplication key for a logical call.
///
/// Derived from a canonical JSON rendering of the call parameters: object keys
/// are sorted at every depth, so `{"a":1,"b":2}` and `{"b":2,"a":1}` produce the
/// same key. Array order is significant.
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
pub struct CallKey(String); // Hex encoded SHA-256 of the canonical parameters

impl CallKey {
    /// Generate a key from call parameters
    pub fn from_params<P>(params: &P) -> Result<Self, serde_json::Error>
    where
        P: Serialize + ?Sized,
    {
        Self::derive(None, params)
    }

    /// Generate a key from call parameters within a named scope.
    ///
    /// Equal parameters under different scopes never share a key.
    pub fn scoped<P>(scope: &str, params: &P) -> Result<Self, serde_json::Error>
    where
        P: Serialize + ?Sized,
    {
        Self::derive(Some(scope), params)
    }

    fn derive<P>(scope: Option<&str>, params: &P) -> Result<Self, serde_json::Error>
    where
        P: Serialize + ?Sized,
    {
        let canonical = canonicalize(serde_json::to_value(params)?);
        let rendered = serde_json::to_string(&canonical)?;

        let mut hasher = Sha256::new();
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart
        if let Some(scope) = scope {
            hasher.update((scope.len() as u64).to_be_bytes());
            hasher.update(scope.as_bytes());
        }
        hasher.update(rendered.as_bytes());

        Ok(CallKey(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rebuild objects with their keys in sorted order, recursively.
///
/// serde_json already sorts keys unless `preserve_order` is enabled somewhere in
/// the dependency graph, so this keeps keys stable under feature unification.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
