//! Data-model values and the per-instance data store.
//!
//! Statechart guards, assignments, and done-data all operate on
//! [`DataModelValue`], a tagged union that keeps `Undefined` distinct from
//! `Null` across serialization boundaries. The actual expression language that
//! produces these values is an external capability (see
//! [`crate::capability::Evaluator`]); this module only defines the value
//! space and the dotted-path store the interpreter mutates.
//!
//! # Examples
//!
//! ```rust
//! use harelite::datamodel::{DataModelValue, DataStore};
//!
//! let mut store = DataStore::default();
//! store.set_path("order.total", DataModelValue::Number(42.0));
//!
//! assert_eq!(
//!     store.get_path("order.total"),
//!     DataModelValue::Number(42.0),
//! );
//! // Missing locations read as Undefined, never Null.
//! assert_eq!(store.get_path("order.missing"), DataModelValue::Undefined);
//! ```

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A value in the statechart data model.
///
/// The union is deliberately wider than JSON: `Undefined` is a first-class
/// member distinct from `Null`, and `DateTime` carries a real timestamp rather
/// than a string. Serde round-trips preserve every variant exactly; the lossy
/// conversion to plain JSON is explicit via [`to_json`](Self::to_json).
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub enum DataModelValue {
    /// Absent value. Reads of unknown locations produce `Undefined`; it is
    /// never silently coerced to `Null`.
    #[default]
    Undefined,
    Null,
    String(String),
    Number(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    /// Ordered string-keyed map. Insertion order is preserved, which keeps
    /// done-data aggregation and persisted snapshots deterministic.
    Object(Vec<(String, DataModelValue)>),
    Array(Vec<DataModelValue>),
}

impl DataModelValue {
    /// Build an object value from key/value pairs, preserving order.
    pub fn object<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, DataModelValue)>,
        K: Into<String>,
    {
        Self::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Look up a key on an object value. Non-objects and missing keys read as
    /// `Undefined`.
    #[must_use]
    pub fn get(&self, key: &str) -> &DataModelValue {
        const UNDEFINED: &DataModelValue = &DataModelValue::Undefined;
        match self {
            Self::Object(pairs) => pairs
                .iter()
                .find(|(k, _)| k == key)
                .map_or(UNDEFINED, |(_, v)| v),
            _ => UNDEFINED,
        }
    }

    /// Truthiness used by the built-in evaluator: `Undefined`, `Null`,
    /// `false`, `0`, `NaN`, and the empty string are falsy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Boolean(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::String(s) => !s.is_empty(),
            Self::DateTime(_) | Self::Object(_) | Self::Array(_) => true,
        }
    }

    /// Returns `true` for the `Undefined` variant.
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Human-readable type name, used in error-event payloads.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::String(_) => "string",
            Self::Number(_) => "number",
            Self::Boolean(_) => "boolean",
            Self::DateTime(_) => "datetime",
            Self::Object(_) => "object",
            Self::Array(_) => "array",
        }
    }

    /// Replace non-finite numbers with `Null`, recursively.
    ///
    /// JSON has no spelling for `NaN` or infinities; serializing them would
    /// produce `null` bodies that no longer decode. Every value entering the
    /// logged mutation path is normalized first so the in-memory state, the
    /// transaction log, and snapshots all agree.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Number(n) if !n.is_finite() => Self::Null,
            Self::Object(pairs) => Self::Object(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k, v.normalized()))
                    .collect(),
            ),
            Self::Array(items) => {
                Self::Array(items.into_iter().map(Self::normalized).collect())
            }
            other => other,
        }
    }

    /// Convert a plain JSON value into a data-model value.
    ///
    /// JSON has no `Undefined`, so this conversion never produces one;
    /// `Value::Null` maps to `Null`.
    #[must_use]
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Boolean(b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to a plain JSON value.
    ///
    /// `Undefined` has no JSON spelling: a top-level `Undefined` converts to
    /// `None`, object entries whose value is `Undefined` are omitted, and
    /// `Undefined` array elements become JSON `null` (arrays cannot drop
    /// positions without shifting indices).
    #[must_use]
    pub fn to_json(&self) -> Option<Value> {
        match self {
            Self::Undefined => None,
            Self::Null => Some(Value::Null),
            Self::String(s) => Some(Value::String(s.clone())),
            Self::Number(n) => Some(serde_json::json!(n)),
            Self::Boolean(b) => Some(Value::Bool(*b)),
            Self::DateTime(dt) => Some(Value::String(dt.to_rfc3339())),
            Self::Object(pairs) => {
                let mut map = serde_json::Map::new();
                for (k, v) in pairs {
                    if let Some(json) = v.to_json() {
                        map.insert(k.clone(), json);
                    }
                }
                Some(Value::Object(map))
            }
            Self::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|v| v.to_json().unwrap_or(Value::Null))
                    .collect(),
            )),
        }
    }
}

impl From<&str> for DataModelValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<f64> for DataModelValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for DataModelValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

/// Per-instance mutable data store addressed by dotted location paths.
///
/// The interpreter writes to the store exclusively through
/// [`crate::context::EvaluationContext`] so every mutation is captured in the
/// transaction log before it takes effect.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataStore {
    entries: FxHashMap<String, DataModelValue>,
}

impl DataStore {
    /// Read a dotted location. Missing segments read as `Undefined`.
    #[must_use]
    pub fn get_path(&self, location: &str) -> DataModelValue {
        let mut segments = location.split('.');
        let Some(root) = segments.next() else {
            return DataModelValue::Undefined;
        };
        let mut current = match self.entries.get(root) {
            Some(v) => v,
            None => return DataModelValue::Undefined,
        };
        for segment in segments {
            current = current.get(segment);
        }
        current.clone()
    }

    /// Write a dotted location, creating intermediate objects as needed.
    ///
    /// Writing through a non-object intermediate replaces it with an object;
    /// this mirrors how assignments behave in loosely typed datamodels.
    pub fn set_path(&mut self, location: &str, value: DataModelValue) {
        let mut segments: Vec<&str> = location.split('.').collect();
        let root = segments.remove(0);
        if segments.is_empty() {
            self.entries.insert(root.to_string(), value);
            return;
        }
        let slot = self
            .entries
            .entry(root.to_string())
            .or_insert(DataModelValue::Object(Vec::new()));
        Self::set_nested(slot, &segments, value);
    }

    fn set_nested(slot: &mut DataModelValue, segments: &[&str], value: DataModelValue) {
        if !matches!(slot, DataModelValue::Object(_)) {
            *slot = DataModelValue::Object(Vec::new());
        }
        let DataModelValue::Object(pairs) = slot else {
            unreachable!("slot was just normalized to an object");
        };
        let key = segments[0];
        let position = pairs.iter().position(|(k, _)| k == key);
        if segments.len() == 1 {
            match position {
                Some(i) => pairs[i].1 = value,
                None => pairs.push((key.to_string(), value)),
            }
            return;
        }
        let index = position.unwrap_or_else(|| {
            pairs.push((key.to_string(), DataModelValue::Object(Vec::new())));
            pairs.len() - 1
        });
        Self::set_nested(&mut pairs[index].1, &segments[1..], value);
    }

    /// Iterate the top-level entries (unordered).
    pub fn iter(&self) -> impl Iterator<Item = (&String, &DataModelValue)> {
        self.entries.iter()
    }

    /// Number of top-level entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no top-level entries exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_survives_serde_round_trip() {
        let value = DataModelValue::object([
            ("present", DataModelValue::Null),
            ("absent", DataModelValue::Undefined),
        ]);
        let bytes = serde_json::to_vec(&value).unwrap();
        let back: DataModelValue = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, value);
        assert!(back.get("absent").is_undefined());
        assert_eq!(back.get("present"), &DataModelValue::Null);
    }

    #[test]
    fn to_json_drops_undefined_object_entries() {
        let value = DataModelValue::object([
            ("kept", DataModelValue::Number(1.0)),
            ("dropped", DataModelValue::Undefined),
        ]);
        let json = value.to_json().unwrap();
        assert_eq!(json, serde_json::json!({"kept": 1.0}));
    }

    #[test]
    fn normalization_nulls_non_finite_numbers_recursively() {
        let value = DataModelValue::object([
            ("ok", DataModelValue::Number(1.5)),
            ("bad", DataModelValue::Number(f64::NAN)),
            (
                "nested",
                DataModelValue::Array(vec![
                    DataModelValue::Number(f64::INFINITY),
                    DataModelValue::String("kept".to_string()),
                ]),
            ),
        ]);
        let normalized = value.normalized();
        assert_eq!(normalized.get("ok"), &DataModelValue::Number(1.5));
        assert_eq!(normalized.get("bad"), &DataModelValue::Null);
        assert_eq!(
            normalized.get("nested"),
            &DataModelValue::Array(vec![
                DataModelValue::Null,
                DataModelValue::String("kept".to_string()),
            ]),
        );
    }

    #[test]
    fn nested_path_writes_create_intermediates() {
        let mut store = DataStore::default();
        store.set_path("a.b.c", DataModelValue::Boolean(true));
        assert_eq!(store.get_path("a.b.c"), DataModelValue::Boolean(true));
        assert_eq!(store.get_path("a.b.missing"), DataModelValue::Undefined);
        store.set_path("a.b.c", DataModelValue::Number(2.0));
        assert_eq!(store.get_path("a.b.c"), DataModelValue::Number(2.0));
    }
}
