//! Opaque metadata value type shared by agent and cluster records.
//!
//! Per the design note on dynamic typing in metadata maps: a sum of
//! primitive + map + list, with typed accessors and explicit fallback
//! rather than a dependency on `serde_json::Value` for the in-memory
//! representation (callers still get `serde_json::Value` at the
//! serialization boundary via `Serialize`/`Deserialize`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<MetadataValue>),
    Map(HashMap<String, MetadataValue>),
}

impl MetadataValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MetadataValue]> {
        match self {
            MetadataValue::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, MetadataValue>> {
        match self {
            MetadataValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Capability inference helper: a metadata key is considered a truthy
    /// capability flag if it is `Bool(true)` or a non-empty string/list.
    /// Anything else, including a missing key, falls back to `false`.
    pub fn is_truthy(&self) -> bool {
        match self {
            MetadataValue::Null => false,
            MetadataValue::Bool(b) => *b,
            MetadataValue::Number(n) => *n != 0.0,
            MetadataValue::String(s) => !s.is_empty(),
            MetadataValue::List(items) => !items.is_empty(),
            MetadataValue::Map(m) => !m.is_empty(),
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Number(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

/// Looks up `key` in `metadata` and reports whether it is present and
/// truthy. Missing keys fall back to `false` rather than erroring, per
/// the "explicit fallback" requirement in the design notes.
pub fn capability_flag(metadata: &HashMap<String, MetadataValue>, key: &str) -> bool {
    metadata.get(key).map(MetadataValue::is_truthy).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_fallback_for_missing_key() {
        let metadata = HashMap::new();
        assert!(!capability_flag(&metadata, "gpu"));
    }

    #[test]
    fn truthy_flag_detection() {
        let mut metadata = HashMap::new();
        metadata.insert("gpu".to_string(), MetadataValue::Bool(true));
        metadata.insert("region".to_string(), MetadataValue::String(String::new()));
        assert!(capability_flag(&metadata, "gpu"));
        assert!(!capability_flag(&metadata, "region"));
    }

    #[test]
    fn accessors_return_none_for_mismatched_variant() {
        let value = MetadataValue::String("x".into());
        assert_eq!(value.as_bool(), None);
        assert_eq!(value.as_str(), Some("x"));
    }
}
