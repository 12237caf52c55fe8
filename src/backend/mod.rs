/// In-process backend for tests and benches.
pub mod memory;
/// SQLite-backed backend.
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    op::Operation,
    types::{Filter, Record},
};

/// Errors reported by a backend. The display text is surfaced verbatim as
/// the batch error.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend refused the request (constraint violation, missing RPC, ...).
    #[error("{0}")]
    Rejected(String),
    /// SQLite reported an error.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    /// A stored record could not be (de)serialized.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// The blocking task running the call panicked or was cancelled.
    #[error("join error: {0}")]
    Join(String),
}

impl BackendError {
    /// Shorthand for [`BackendError::Rejected`].
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }
}

/// Result alias for [`Backend`] calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// How a backend treats the begin/commit/rollback markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerMode {
    /// Markers are accepted and ignored; every write is visible immediately
    /// and nothing is undone by the rollback marker.
    #[default]
    Advisory,
    /// Markers bracket a real transaction.
    Native,
}

/// Data layer the coordinator drives.
///
/// Markers are best-effort signals. Whether writes issued between
/// [`begin_marker`](Backend::begin_marker) and
/// [`commit_marker`](Backend::commit_marker) are isolated depends entirely
/// on the implementation.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Signals that a logical batch is starting.
    async fn begin_marker(&self) -> BackendResult<()>;
    /// Signals that a logical batch completed.
    async fn commit_marker(&self) -> BackendResult<()>;
    /// Signals that a logical batch is being abandoned.
    async fn rollback_marker(&self) -> BackendResult<()>;
    /// Fetches the first record in `collection` matching `filter`.
    async fn read(&self, collection: &str, filter: &Filter) -> BackendResult<Option<Record>>;
    /// Performs one insert, update or delete.
    async fn write(&self, op: &Operation) -> BackendResult<()>;
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Arc<B> {
    async fn begin_marker(&self) -> BackendResult<()> {
        (**self).begin_marker().await
    }

    async fn commit_marker(&self) -> BackendResult<()> {
        (**self).commit_marker().await
    }

    async fn rollback_marker(&self) -> BackendResult<()> {
        (**self).rollback_marker().await
    }

    async fn read(&self, collection: &str, filter: &Filter) -> BackendResult<Option<Record>> {
        (**self).read(collection, filter).await
    }

    async fn write(&self, op: &Operation) -> BackendResult<()> {
        (**self).write(op).await
    }
}
