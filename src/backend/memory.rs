//! In-process backend with observable calls and injectable faults.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use hashbrown::HashMap;
use serde_json::Value;

use crate::{
    op::{Operation, OperationKind},
    types::{DEFAULT_ID_FIELD, Filter, Record, merge_into},
};

use super::{Backend, BackendError, BackendResult, MarkerMode};

/// One call observed by [`MemoryBackend`], recorded before it is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    /// The begin marker.
    Begin,
    /// The commit marker.
    Commit,
    /// The rollback marker.
    Rollback,
    /// A read of a collection.
    Read {
        /// Collection read from.
        collection: String,
        /// Filter used.
        filter: Filter,
    },
    /// A write attempt, successful or not.
    Write(Operation),
}

impl BackendCall {
    /// True for begin/commit/rollback.
    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Begin | Self::Commit | Self::Rollback)
    }
}

/// Which calls a [`Fault`] intercepts.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultTarget {
    /// Writes of the given kind, or of any kind when `None`.
    Write(Option<OperationKind>),
    /// Reads of the fault's collection.
    Read,
    /// The begin marker.
    Begin,
    /// The commit marker.
    Commit,
    /// The rollback marker.
    Rollback,
}

/// Injected failure returned instead of performing a call.
#[derive(Debug, Clone)]
pub struct Fault {
    target: FaultTarget,
    collection: Option<String>,
    filter: Option<Filter>,
    message: String,
    skip: usize,
}

impl Fault {
    /// Fails writes of `kind` against `collection`.
    pub fn on_write(collection: impl Into<String>, kind: OperationKind) -> Self {
        Self::new(FaultTarget::Write(Some(kind)), Some(collection.into()))
    }

    /// Fails every write against `collection`.
    pub fn on_any_write(collection: impl Into<String>) -> Self {
        Self::new(FaultTarget::Write(None), Some(collection.into()))
    }

    /// Fails reads against `collection`.
    pub fn on_read(collection: impl Into<String>) -> Self {
        Self::new(FaultTarget::Read, Some(collection.into()))
    }

    /// Fails a marker call. Only marker targets make sense here.
    pub fn on_marker(target: FaultTarget) -> Self {
        Self::new(target, None)
    }

    fn new(target: FaultTarget, collection: Option<String>) -> Self {
        let message = match &target {
            FaultTarget::Begin => "function begin_transaction() does not exist".to_string(),
            FaultTarget::Commit => "function commit_transaction() does not exist".to_string(),
            FaultTarget::Rollback => "function rollback_transaction() does not exist".to_string(),
            _ => "injected fault".to_string(),
        };
        Self {
            target,
            collection,
            filter: None,
            message,
            skip: 0,
        }
    }

    /// Overrides the error message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Only fires for calls whose filter equals `filter`.
    pub fn when_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Lets the first `n` matching calls through before failing.
    pub fn after(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    fn hits(&self, target: &FaultTarget, collection: Option<&str>, filter: Option<&Filter>) -> bool {
        let target_hit = match (&self.target, target) {
            (FaultTarget::Write(None), FaultTarget::Write(_)) => true,
            (a, b) => a == b,
        };
        target_hit
            && (self.collection.is_none() || self.collection.as_deref() == collection)
            && (self.filter.is_none() || self.filter.as_ref() == filter)
    }
}

#[derive(Debug, Default)]
struct Inner {
    collections: HashMap<String, Vec<Record>>,
    snapshot: Option<HashMap<String, Vec<Record>>>,
    journal: Vec<BackendCall>,
    faults: Vec<Fault>,
    non_negative: Vec<(String, String)>,
    next_id: i64,
}

/// Backend keeping every collection in memory.
///
/// In [`MarkerMode::Native`] the begin marker snapshots all collections,
/// the rollback marker restores that snapshot and the commit marker drops it.
/// In [`MarkerMode::Advisory`] markers only land in the journal.
#[derive(Debug)]
pub struct MemoryBackend {
    mode: MarkerMode,
    id_field: String,
    inner: Mutex<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(MarkerMode::Advisory)
    }
}

impl MemoryBackend {
    /// Empty backend treating markers per `mode`.
    pub fn new(mode: MarkerMode) -> Self {
        Self {
            mode,
            id_field: DEFAULT_ID_FIELD.to_string(),
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Inner::default()
            }),
        }
    }

    /// Shorthand for [`MarkerMode::Advisory`].
    pub fn advisory() -> Self {
        Self::new(MarkerMode::Advisory)
    }

    /// Shorthand for [`MarkerMode::Native`].
    pub fn transactional() -> Self {
        Self::new(MarkerMode::Native)
    }

    /// Marker handling chosen at construction.
    pub fn mode(&self) -> MarkerMode {
        self.mode
    }

    /// Loads records without journaling or constraint checks.
    pub fn seed(&self, collection: &str, records: impl IntoIterator<Item = Record>) {
        let mut inner = self.lock();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .extend(records);
    }

    /// Registers a fault; faults are checked in registration order.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Removes every registered fault.
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Rejects writes leaving `field` below zero in `collection`.
    pub fn require_non_negative(&self, collection: &str, field: &str) {
        self.lock()
            .non_negative
            .push((collection.to_string(), field.to_string()));
    }

    /// All records currently stored in `collection`, in insertion order.
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// First record matching `filter`, without journaling.
    pub fn find(&self, collection: &str, filter: &Filter) -> Option<Record> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|rows| rows.iter().find(|r| filter.matches(r)).cloned())
    }

    /// Every call observed so far, oldest first.
    pub fn journal(&self) -> Vec<BackendCall> {
        self.lock().journal.clone()
    }

    /// Only the marker entries of the journal.
    pub fn markers(&self) -> Vec<BackendCall> {
        self.lock()
            .journal
            .iter()
            .filter(|c| c.is_marker())
            .cloned()
            .collect()
    }

    /// Only the write attempts of the journal.
    pub fn writes(&self) -> Vec<Operation> {
        self.lock()
            .journal
            .iter()
            .filter_map(|c| match c {
                BackendCall::Write(op) => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    /// Forgets observed calls; stored records are untouched.
    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_write(&self, inner: &mut Inner, op: &Operation) -> BackendResult<()> {
        match op {
            Operation::Insert(insert) => {
                let mut row = insert.payload.clone();
                if !row.contains_key(&self.id_field) {
                    let id = inner.next_id;
                    inner.next_id += 1;
                    row.insert(self.id_field.clone(), Value::from(id));
                }
                check_constraints(&inner.non_negative, &insert.collection, &row)?;

                let id = row.get(&self.id_field).cloned().unwrap_or(Value::Null);
                if let Value::Number(n) = &id {
                    if let Some(n) = n.as_i64() {
                        inner.next_id = inner.next_id.max(n.saturating_add(1));
                    }
                }
                let rows = inner
                    .collections
                    .entry(insert.collection.clone())
                    .or_default();
                if rows.iter().any(|r| r.get(&self.id_field) == Some(&id)) {
                    return Err(BackendError::rejected(format!(
                        "duplicate key value violates unique constraint \"{}_pkey\"",
                        insert.collection
                    )));
                }
                rows.push(row);
            }
            Operation::Update(update) => {
                let Some(rows) = inner.collections.get_mut(&update.collection) else {
                    return Ok(());
                };
                let mut changed = Vec::new();
                for (idx, row) in rows.iter().enumerate() {
                    if update.filter.matches(row) {
                        let mut next = row.clone();
                        merge_into(&mut next, &update.payload);
                        check_constraints(&inner.non_negative, &update.collection, &next)?;
                        changed.push((idx, next));
                    }
                }
                for (idx, next) in changed {
                    rows[idx] = next;
                }
            }
            Operation::Delete(delete) => {
                if let Some(rows) = inner.collections.get_mut(&delete.collection) {
                    rows.retain(|r| !delete.filter.matches(r));
                }
            }
        }
        Ok(())
    }
}

fn check_constraints(rules: &[(String, String)], collection: &str, row: &Record) -> BackendResult<()> {
    for (rule_collection, field) in rules {
        if rule_collection != collection {
            continue;
        }
        let negative = row
            .get(field)
            .and_then(Value::as_f64)
            .is_some_and(|v| v < 0.0);
        if negative {
            return Err(BackendError::rejected(format!(
                "new row for relation \"{collection}\" violates check constraint \"{field}_non_negative\""
            )));
        }
    }
    Ok(())
}

fn trip(
    inner: &mut Inner,
    target: &FaultTarget,
    collection: Option<&str>,
    filter: Option<&Filter>,
) -> BackendResult<()> {
    for fault in inner.faults.iter_mut() {
        if !fault.hits(target, collection, filter) {
            continue;
        }
        if fault.skip > 0 {
            fault.skip -= 1;
            continue;
        }
        return Err(BackendError::rejected(fault.message.clone()));
    }
    Ok(())
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn begin_marker(&self) -> BackendResult<()> {
        let mut inner = self.lock();
        inner.journal.push(BackendCall::Begin);
        trip(&mut inner, &FaultTarget::Begin, None, None)?;
        if self.mode == MarkerMode::Native {
            inner.snapshot = Some(inner.collections.clone());
        }
        Ok(())
    }

    async fn commit_marker(&self) -> BackendResult<()> {
        let mut inner = self.lock();
        inner.journal.push(BackendCall::Commit);
        trip(&mut inner, &FaultTarget::Commit, None, None)?;
        inner.snapshot = None;
        Ok(())
    }

    async fn rollback_marker(&self) -> BackendResult<()> {
        let mut inner = self.lock();
        inner.journal.push(BackendCall::Rollback);
        trip(&mut inner, &FaultTarget::Rollback, None, None)?;
        if let Some(snapshot) = inner.snapshot.take() {
            inner.collections = snapshot;
        }
        Ok(())
    }

    async fn read(&self, collection: &str, filter: &Filter) -> BackendResult<Option<Record>> {
        let mut inner = self.lock();
        inner.journal.push(BackendCall::Read {
            collection: collection.to_string(),
            filter: filter.clone(),
        });
        trip(&mut inner, &FaultTarget::Read, Some(collection), Some(filter))?;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|rows| rows.iter().find(|r| filter.matches(r)).cloned()))
    }

    async fn write(&self, op: &Operation) -> BackendResult<()> {
        let mut inner = self.lock();
        inner.journal.push(BackendCall::Write(op.clone()));
        trip(
            &mut inner,
            &FaultTarget::Write(Some(op.kind())),
            Some(op.collection()),
            op.filter(),
        )?;
        self.apply_write(&mut inner, op)
    }
}
