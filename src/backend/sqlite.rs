//! SQLite-backed record store.
//!
//! Every collection lives in one `records` table as JSON bodies keyed by
//! `(collection, doc_id)`. Each write runs inside its own savepoint so a
//! failing update leaves no half-applied rows, whatever the marker mode.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::trace;

use crate::{
    op::Operation,
    types::{DEFAULT_ID_FIELD, Filter, Record, merge_into},
};

use super::{Backend, BackendError, BackendResult, MarkerMode};

/// Connection settings for [`SqliteBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Whether markers map to `BEGIN`/`COMMIT`/`ROLLBACK`.
    pub marker_mode: MarkerMode,
    /// Field holding each record's identifier.
    pub id_field: String,
    /// How long a statement waits on a locked database.
    pub busy_timeout_ms: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            marker_mode: MarkerMode::Advisory,
            id_field: DEFAULT_ID_FIELD.to_string(),
            busy_timeout_ms: 5_000,
        }
    }
}

/// SQLite implementation of [`Backend`].
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    config: SqliteConfig,
}

impl SqliteBackend {
    /// Opens or creates a database at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>, config: SqliteConfig) -> BackendResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init_connection(conn, config)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory(config: SqliteConfig) -> BackendResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn, config)
    }

    fn init_connection(conn: Connection, config: SqliteConfig) -> BackendResult<Self> {
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// Settings this backend was opened with.
    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    /// Installs triggers rejecting rows whose `field` is negative.
    ///
    /// Both names must be plain identifiers (`[A-Za-z0-9_]`).
    pub async fn require_non_negative(&self, collection: &str, field: &str) -> BackendResult<()> {
        for name in [collection, field] {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(BackendError::rejected(format!("invalid identifier: {name}")));
            }
        }
        let sql = ["INSERT", "UPDATE"]
            .iter()
            .map(|event| {
                format!(
                    "CREATE TRIGGER IF NOT EXISTS {collection}_{field}_non_negative_{ev}
                     BEFORE {event} ON records
                     WHEN NEW.collection = '{collection}' AND json_extract(NEW.body, '$.{field}') < 0
                     BEGIN
                         SELECT RAISE(ABORT, 'new row for relation \"{collection}\" violates check constraint \"{field}_non_negative\"');
                     END;",
                    ev = event.to_ascii_lowercase(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        self.with_conn(move |conn| Ok(conn.execute_batch(&sql)?)).await
    }

    /// All records in `collection`, in insertion order.
    pub async fn records(&self, collection: &str) -> BackendResult<Vec<Record>> {
        let collection = collection.to_string();
        self.with_conn(move |conn| {
            Ok(load_collection(conn, &collection)?
                .into_iter()
                .map(|(_, body)| body)
                .collect())
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> BackendResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> BackendResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut *conn)
        })
        .await
        .map_err(|e| BackendError::Join(e.to_string()))?
    }

    async fn marker(&self, sql: &'static str) -> BackendResult<()> {
        if self.config.marker_mode == MarkerMode::Advisory {
            trace!(marker = sql, "advisory marker ignored");
            return Ok(());
        }
        self.with_conn(move |conn| Ok(conn.execute_batch(sql)?)).await
    }
}

fn load_collection(conn: &Connection, collection: &str) -> BackendResult<Vec<(i64, Record)>> {
    let mut stmt =
        conn.prepare("SELECT seq, body FROM records WHERE collection = ?1 ORDER BY seq ASC")?;
    let rows = stmt.query_map(params![collection], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (seq, body) = row?;
        out.push((seq, serde_json::from_str::<Record>(&body)?));
    }
    Ok(out)
}

fn doc_id(record: &Record, id_field: &str) -> BackendResult<Option<String>> {
    match record.get(id_field) {
        None | Some(Value::Null) => Ok(None),
        Some(id) => Ok(Some(serde_json::to_string(id)?)),
    }
}

fn map_constraint(err: rusqlite::Error, collection: &str) -> BackendError {
    if let rusqlite::Error::SqliteFailure(e, msg) = &err {
        if e.code == ErrorCode::ConstraintViolation {
            let text = msg.clone().unwrap_or_default();
            if text.starts_with("UNIQUE") {
                return BackendError::rejected(format!(
                    "duplicate key value violates unique constraint \"{collection}_pkey\""
                ));
            }
            return BackendError::rejected(text);
        }
    }
    BackendError::Sqlite(err)
}

/// One past the largest integer id already stored in `collection`.
fn next_free_id(conn: &Connection, collection: &str, id_field: &str) -> BackendResult<i64> {
    let max = load_collection(conn, collection)?
        .iter()
        .filter_map(|(_, body)| body.get(id_field).and_then(Value::as_i64))
        .max()
        .unwrap_or(0);
    max.checked_add(1)
        .ok_or_else(|| BackendError::rejected(format!("no free id left in \"{collection}\"")))
}

fn apply_write(conn: &mut Connection, op: &Operation, id_field: &str) -> BackendResult<()> {
    let sp = conn.savepoint()?;
    match op {
        Operation::Insert(insert) => {
            let mut row = insert.payload.clone();
            if doc_id(&row, id_field)?.is_none() {
                let id = next_free_id(&sp, &insert.collection, id_field)?;
                row.insert(id_field.to_string(), Value::from(id));
            }
            sp.execute(
                "INSERT INTO records(collection, doc_id, body) VALUES (?1, ?2, ?3)",
                params![insert.collection, doc_id(&row, id_field)?, serde_json::to_string(&row)?],
            )
            .map_err(|e| map_constraint(e, &insert.collection))?;
        }
        Operation::Update(update) => {
            for (seq, mut row) in load_collection(&sp, &update.collection)? {
                if !update.filter.matches(&row) {
                    continue;
                }
                merge_into(&mut row, &update.payload);
                sp.execute(
                    "UPDATE records SET doc_id = ?1, body = ?2 WHERE seq = ?3",
                    params![doc_id(&row, id_field)?, serde_json::to_string(&row)?, seq],
                )
                .map_err(|e| map_constraint(e, &update.collection))?;
            }
        }
        Operation::Delete(delete) => {
            for (seq, row) in load_collection(&sp, &delete.collection)? {
                if delete.filter.matches(&row) {
                    sp.execute("DELETE FROM records WHERE seq = ?1", params![seq])?;
                }
            }
        }
    }
    sp.commit()?;
    Ok(())
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn begin_marker(&self) -> BackendResult<()> {
        self.marker("BEGIN").await
    }

    async fn commit_marker(&self) -> BackendResult<()> {
        self.marker("COMMIT").await
    }

    async fn rollback_marker(&self) -> BackendResult<()> {
        self.marker("ROLLBACK").await
    }

    async fn read(&self, collection: &str, filter: &Filter) -> BackendResult<Option<Record>> {
        let collection = collection.to_string();
        let filter = filter.clone();
        self.with_conn(move |conn| {
            Ok(load_collection(conn, &collection)?
                .into_iter()
                .map(|(_, body)| body)
                .find(|body| filter.matches(body)))
        })
        .await
    }

    async fn write(&self, op: &Operation) -> BackendResult<()> {
        let op = op.clone();
        let id_field = self.config.id_field.clone();
        self.with_conn(move |conn| apply_write(conn, &op, &id_field))
            .await
    }
}
