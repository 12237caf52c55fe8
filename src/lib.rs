//! Ordered mutation batches with compensating rollback over backends that
//! lack client-driven transactions.
//!
//! A [`coordinator::Coordinator`] brackets a batch with best-effort
//! begin/commit markers, captures the pre-image of every record it is about
//! to touch, and on the first failed write replays those pre-images in
//! reverse. Nothing here adds isolation: whether the markers mean anything is
//! up to the [`backend::Backend`].
//!
//! # Examples
//!
//! ```
//! use serde_json::json;
//! use txbatch::{
//!     backend::memory::MemoryBackend,
//!     coordinator::Coordinator,
//!     op::Operation,
//!     types::{Filter, Record},
//! };
//!
//! fn record(value: serde_json::Value) -> Record {
//!     value.as_object().cloned().expect("object")
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let backend = MemoryBackend::advisory();
//! backend.seed("wallets", [
//!     record(json!({"id": "a", "balance": 500})),
//!     record(json!({"id": "b", "balance": 0})),
//! ]);
//!
//! let coordinator = Coordinator::new(backend);
//! let result = coordinator
//!     .execute(vec![
//!         Operation::update("wallets", record(json!({"balance": 400})), Filter::by("id", "a")),
//!         Operation::update("wallets", record(json!({"balance": 100})), Filter::by("id", "b")),
//!         Operation::insert("transactions", record(json!({"amount_minor": 100}))),
//!     ])
//!     .await;
//! assert!(result.success);
//! # }
//! ```
//!
//! SQLite with real `BEGIN`/`COMMIT`/`ROLLBACK` markers:
//! ```no_run
//! use txbatch::{
//!     backend::{MarkerMode, sqlite::{SqliteBackend, SqliteConfig}},
//!     coordinator::Coordinator,
//! };
//!
//! let backend = SqliteBackend::open(
//!     "ledger.db",
//!     SqliteConfig { marker_mode: MarkerMode::Native, ..SqliteConfig::default() },
//! )
//! .expect("open sqlite");
//! let _coordinator = Coordinator::new(backend);
//! ```
#![deny(missing_docs)]

/// Backend trait plus in-memory and SQLite implementations.
pub mod backend;
/// Batch executor and compensation log.
pub mod coordinator;
/// Wallet service that pre-checks requests and builds batches.
pub mod ledger;
/// Operation sum type and batch results.
pub mod op;
/// Record and filter primitives.
pub mod types;
