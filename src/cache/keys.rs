//! Query key definitions and the key codec.
//!
//! A [`QueryKey`] is an ordered list of JSON segments. Its [`QueryHash`] is a
//! canonical serialization with object keys sorted, so two deep-equal keys
//! always share one cache entry.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured identifier of a cached query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    pub fn new(segments: Vec<Value>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical hash of this key.
    pub fn hash(&self) -> QueryHash {
        canonicalize(self)
    }

    /// Returns true if `partial` selects this key.
    ///
    /// With `exact`, the keys must hash identically. Otherwise every segment
    /// of `partial` must partially match the segment at the same position:
    /// objects match on the subset of fields `partial` names, arrays match
    /// as prefixes and everything else must be equal.
    pub fn matches(&self, partial: &QueryKey, exact: bool) -> bool {
        matches(self, Some(partial), exact)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(segments: Vec<Value>) -> Self {
        Self(segments)
    }
}

impl From<&str> for QueryKey {
    fn from(segment: &str) -> Self {
        Self(vec![Value::String(segment.to_string())])
    }
}

impl From<String> for QueryKey {
    fn from(segment: String) -> Self {
        Self(vec![Value::String(segment)])
    }
}

impl From<Value> for QueryKey {
    /// An array becomes the segment list; any other value is a single segment.
    fn from(value: Value) -> Self {
        match value {
            Value::Array(segments) => Self(segments),
            other => Self(vec![other]),
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(canonicalize(self).as_str())
    }
}

/// Build a [`QueryKey`] from JSON-literal segments.
///
/// ```
/// use storefront_query::query_key;
///
/// let key = query_key!["products", { "page": 2, "category": "shoes" }];
/// assert_eq!(key.len(), 2);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:tt),* $(,)?) => {
        $crate::cache::QueryKey::new(vec![$($crate::__serde_json::json!($segment)),*])
    };
}

/// Canonical string identity of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct QueryHash(String);

impl QueryHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize a key deterministically: arrays keep their order, object fields
/// are emitted sorted by name.
pub fn canonicalize(key: &QueryKey) -> QueryHash {
    let mut out = String::new();
    out.push('[');
    for (index, segment) in key.0.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_canonical(segment, &mut out);
    }
    out.push(']');
    QueryHash(out)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (index, (name, field)) in fields.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                // A JSON string literal, escaped the same way serde_json does.
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Key matching used by bulk operations. An absent or empty `partial`
/// matches every key.
pub fn matches(key: &QueryKey, partial: Option<&QueryKey>, exact: bool) -> bool {
    let Some(partial) = partial.filter(|partial| !partial.is_empty()) else {
        return true;
    };

    if exact {
        return canonicalize(key) == canonicalize(partial);
    }

    if partial.0.len() > key.0.len() {
        return false;
    }

    key.0
        .iter()
        .zip(partial.0.iter())
        .all(|(segment, wanted)| partial_match(segment, wanted))
}

fn partial_match(value: &Value, wanted: &Value) -> bool {
    match (value, wanted) {
        (Value::Object(have), Value::Object(want)) => want.iter().all(|(name, field)| {
            have.get(name)
                .is_some_and(|present| partial_match(present, field))
        }),
        (Value::Array(have), Value::Array(want)) => {
            want.len() <= have.len()
                && have
                    .iter()
                    .zip(want.iter())
                    .all(|(present, field)| partial_match(present, field))
        }
        _ => value == wanted,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn object_field_order_does_not_change_hash() {
        let a = query_key![{"a": 1, "b": 2}];
        let b = query_key![{"b": 2, "a": 1}];
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn array_order_changes_hash() {
        let a = query_key![[1, 2]];
        let b = query_key![[2, 1]];
        assert_ne!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn nested_objects_are_sorted() {
        let key = query_key!["cart", {"z": {"y": 1, "x": [true, null]}, "a": "s"}];
        assert_eq!(
            canonicalize(&key).as_str(),
            r#"["cart",{"a":"s","z":{"x":[true,null],"y":1}}]"#
        );
    }

    #[test]
    fn string_escaping_is_preserved() {
        let key = query_key!["say \"hi\""];
        assert_eq!(canonicalize(&key).as_str(), r#"["say \"hi\""]"#);
    }

    #[test]
    fn distinct_segment_types_do_not_collide() {
        assert_ne!(
            canonicalize(&query_key!["1"]),
            canonicalize(&query_key![1])
        );
        assert_ne!(
            canonicalize(&query_key![["a", "b"]]),
            canonicalize(&query_key!["a", "b"])
        );
    }

    #[test]
    fn absent_or_empty_partial_matches_everything() {
        let key = query_key!["products", 7];
        assert!(matches(&key, None, false));
        assert!(matches(&key, Some(&QueryKey::default()), false));
    }

    #[test]
    fn prefix_matching() {
        let key = query_key!["products", {"page": 2, "category": "shoes"}];

        assert!(key.matches(&query_key!["products"], false));
        assert!(key.matches(&query_key!["products", {"category": "shoes"}], false));
        assert!(!key.matches(&query_key!["products", {"category": "hats"}], false));
        assert!(!key.matches(&query_key!["orders"], false));
        assert!(!key.matches(&query_key!["products", {"page": 2}, "extra"], false));
    }

    #[test]
    fn array_segments_match_as_prefix() {
        let key = query_key![["a", "b", "c"]];
        assert!(key.matches(&query_key![["a", "b"]], false));
        assert!(!key.matches(&query_key![["b"]], false));
    }

    #[test]
    fn exact_matching_requires_equal_keys() {
        let key = query_key!["products", {"page": 2, "category": "shoes"}];

        assert!(!key.matches(&query_key!["products"], true));
        assert!(key.matches(&query_key!["products", {"category": "shoes", "page": 2}], true));
    }

    #[test]
    fn from_json_value() {
        let key = QueryKey::from(json!(["orders", 42]));
        assert_eq!(key.len(), 2);
        assert_eq!(QueryKey::from(json!("orders")), QueryKey::from("orders"));
    }
}
