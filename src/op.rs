//! Mutation operation model and batch result types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{CollectionName, Filter, Record};

/// Create a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertOp {
    /// Target collection.
    pub collection: CollectionName,
    /// Record body to insert.
    pub payload: Record,
    /// Optional filter used to look up a pre-existing record before insert.
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
}

/// Overwrite fields of every record matched by `filter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOp {
    /// Target collection.
    pub collection: CollectionName,
    /// Fields to overwrite.
    pub payload: Record,
    /// Records to touch.
    #[serde(rename = "match")]
    pub filter: Filter,
}

/// Remove every record matched by `filter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteOp {
    /// Target collection.
    pub collection: CollectionName,
    /// Records to remove.
    #[serde(rename = "match")]
    pub filter: Filter,
}

/// One requested mutation within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Operation {
    /// Insert a record.
    Insert(InsertOp),
    /// Update matching records.
    Update(UpdateOp),
    /// Delete matching records.
    Delete(DeleteOp),
}

/// Discriminant of [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// See [`Operation::Insert`].
    Insert,
    /// See [`Operation::Update`].
    Update,
    /// See [`Operation::Delete`].
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Ordered operations submitted together.
pub type OperationBatch = Vec<Operation>;

impl Operation {
    /// Insert without a lookup filter.
    pub fn insert(collection: impl Into<CollectionName>, payload: Record) -> Self {
        Self::Insert(InsertOp {
            collection: collection.into(),
            payload,
            filter: None,
        })
    }

    /// Update records matching `filter`.
    pub fn update(collection: impl Into<CollectionName>, payload: Record, filter: Filter) -> Self {
        Self::Update(UpdateOp {
            collection: collection.into(),
            payload,
            filter,
        })
    }

    /// Delete records matching `filter`.
    pub fn delete(collection: impl Into<CollectionName>, filter: Filter) -> Self {
        Self::Delete(DeleteOp {
            collection: collection.into(),
            filter,
        })
    }

    /// Target collection.
    pub fn collection(&self) -> &str {
        match self {
            Self::Insert(op) => &op.collection,
            Self::Update(op) => &op.collection,
            Self::Delete(op) => &op.collection,
        }
    }

    /// Insert, update or delete.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Insert(_) => OperationKind::Insert,
            Self::Update(_) => OperationKind::Update,
            Self::Delete(_) => OperationKind::Delete,
        }
    }

    /// Explicit filter, if any. Inserts usually carry none.
    pub fn filter(&self) -> Option<&Filter> {
        match self {
            Self::Insert(op) => op.filter.as_ref(),
            Self::Update(op) => Some(&op.filter),
            Self::Delete(op) => Some(&op.filter),
        }
    }

    /// Fields written; `None` for deletes.
    pub fn payload(&self) -> Option<&Record> {
        match self {
            Self::Insert(op) => Some(&op.payload),
            Self::Update(op) => Some(&op.payload),
            Self::Delete(_) => None,
        }
    }
}

/// Outcome reported to callers. All-or-nothing, no partial success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    /// True when every operation was applied.
    pub success: bool,
    /// First error encountered, when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchResult {
    /// Successful batch.
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// Failed batch carrying a human-readable reason.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }

    /// Same as reading `success`.
    pub fn is_success(&self) -> bool {
        self.success
    }
}
