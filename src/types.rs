//! Shared record and filter primitives.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A stored row: a JSON object keyed by field name.
pub type Record = Map<String, Value>;

/// Name of a resource collection (analogous to a table).
pub type CollectionName = String;

/// Default identifier field used to address single records.
pub const DEFAULT_ID_FIELD: &str = "id";

/// Equality filter selecting records whose fields match every pair.
///
/// An empty filter matches every record in the collection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(BTreeMap<String, Value>);

impl Filter {
    /// Creates an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on a single field.
    pub fn by(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().and(field, value)
    }

    /// Adds one more equality pair.
    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Builds a filter from every field of `record`.
    pub fn from_record(record: &Record) -> Self {
        Self(record.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Returns true when all pairs are present and equal in `record`.
    pub fn matches(&self, record: &Record) -> bool {
        self.0
            .iter()
            .all(|(field, expected)| record.get(field).unwrap_or(&Value::Null) == expected)
    }

    /// Iterates the equality pairs in field order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// True when no pairs are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Looks up the value a field must equal.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }
}

/// Overwrites fields of `target` with those in `patch`.
///
/// Fields absent from `patch` are left untouched; explicit nulls are written.
pub fn merge_into(target: &mut Record, patch: &Record) {
    for (field, value) in patch {
        target.insert(field.clone(), value.clone());
    }
}
