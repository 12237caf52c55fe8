//! Sequential batch executor with compensating rollback.
//!
//! Atomicity is only as strong as the backend's markers. Against a backend
//! in [`MarkerMode::Advisory`](crate::backend::MarkerMode::Advisory) other
//! readers observe every intermediate write, rows inserted by a failed batch
//! are left in place, and two concurrent batches may interleave freely.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{
    backend::{Backend, BackendResult},
    op::{BatchResult, Operation, OperationBatch, UpdateOp},
    types::{DEFAULT_ID_FIELD, Filter, Record},
};

/// Error reported for a batch with no operations.
pub const EMPTY_BATCH: &str = "operation batch is empty";

/// Marker fired once every compensation has been replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMarker {
    /// Fire the commit marker.
    #[default]
    Commit,
    /// Fire the rollback marker instead.
    Rollback,
}

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Field used to address a captured pre-image when restoring it.
    pub id_field: String,
    /// Marker fired after a complete replay.
    pub recovery_marker: RecoveryMarker,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            id_field: DEFAULT_ID_FIELD.to_string(),
            recovery_marker: RecoveryMarker::Commit,
        }
    }
}

/// Pre-image captured before step `step` ran, as a restoring update.
#[derive(Debug, Clone, PartialEq)]
pub struct Compensation {
    /// Index of the forward operation in its batch.
    pub step: usize,
    /// Update writing the pre-image back.
    pub restore: UpdateOp,
}

impl Compensation {
    fn capture(step: usize, op: &Operation, pre_image: Record, id_field: &str) -> Self {
        let filter = match record_id(&pre_image, id_field) {
            Some(id) => Filter::by(id_field, id.clone()),
            None => op
                .filter()
                .cloned()
                .unwrap_or_else(|| Filter::from_record(&pre_image)),
        };
        Self {
            step,
            restore: UpdateOp {
                collection: op.collection().to_string(),
                payload: pre_image,
                filter,
            },
        }
    }
}

/// Compensations of one `execute` call, in capture order.
#[derive(Debug, Default)]
pub struct CompensationLog {
    entries: Vec<Compensation>,
}

impl CompensationLog {
    /// Appends a compensation for a step whose write succeeded.
    pub fn push(&mut self, entry: Compensation) {
        self.entries.push(entry);
    }

    /// Number of captured compensations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumes the log, last captured first.
    pub fn into_replay_order(self) -> impl Iterator<Item = Compensation> {
        self.entries.into_iter().rev()
    }
}

/// How a failed batch was unwound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Every compensation was replayed, then this marker fired.
    Restored(RecoveryMarker),
    /// A restore write failed; replay stopped and the rollback marker fired.
    ReplayFailed {
        /// Step whose compensation could not be written.
        step: usize,
        /// Backend message for the failed restore.
        error: String,
    },
}

/// Full account of one `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// What callers see.
    pub result: BatchResult,
    /// Operations that completed their write.
    pub steps_applied: usize,
    /// Index of the operation that failed, if any.
    pub failed_step: Option<usize>,
    /// Pre-images captured before the batch stopped.
    pub compensations_captured: usize,
    /// Restores written during rollback.
    pub compensations_replayed: usize,
    /// `None` when no rollback was attempted.
    pub recovery: Option<RecoveryOutcome>,
}

impl BatchReport {
    fn rejected(message: &str) -> Self {
        Self {
            result: BatchResult::failure(message),
            steps_applied: 0,
            failed_step: None,
            compensations_captured: 0,
            compensations_replayed: 0,
            recovery: None,
        }
    }
}

/// Runs operation batches against `B`, restoring pre-images on failure.
#[derive(Debug)]
pub struct Coordinator<B> {
    backend: B,
    config: CoordinatorConfig,
}

impl<B: Backend> Coordinator<B> {
    /// Coordinator with [`CoordinatorConfig::default`].
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, CoordinatorConfig::default())
    }

    /// Uses `config` in place of the defaults.
    pub fn with_config(backend: B, config: CoordinatorConfig) -> Self {
        Self { backend, config }
    }

    /// Backend batches run against.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Active settings.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Executes `operations` in order; never fails past this call.
    pub async fn execute(&self, operations: OperationBatch) -> BatchResult {
        self.execute_detailed(operations).await.result
    }

    /// Like [`execute`](Self::execute), also reporting how far the batch got
    /// and how it was unwound.
    #[tracing::instrument(name = "batch", skip_all, fields(ops = operations.len()))]
    pub async fn execute_detailed(&self, operations: OperationBatch) -> BatchReport {
        if operations.is_empty() {
            warn!("{EMPTY_BATCH}");
            return BatchReport::rejected(EMPTY_BATCH);
        }

        if let Err(err) = self.backend.begin_marker().await {
            warn!(error = %err, "begin marker failed; writes are not isolated");
        }

        let mut log = CompensationLog::default();
        for (step, op) in operations.iter().enumerate() {
            if let Err(err) = self.run_step(step, op, &mut log).await {
                let message = err.to_string();
                debug!(step, kind = %op.kind(), collection = op.collection(), error = %message, "operation failed");

                let compensations_captured = log.len();
                let (compensations_replayed, outcome) = self.rollback(log).await;
                return BatchReport {
                    result: BatchResult::failure(message),
                    steps_applied: step,
                    failed_step: Some(step),
                    compensations_captured,
                    compensations_replayed,
                    recovery: Some(outcome),
                };
            }
        }

        if let Err(err) = self.backend.commit_marker().await {
            warn!(error = %err, "commit marker failed after all writes applied");
        }
        debug!(captured = log.len(), "batch committed");

        BatchReport {
            result: BatchResult::ok(),
            steps_applied: operations.len(),
            failed_step: None,
            compensations_captured: log.len(),
            compensations_replayed: 0,
            recovery: None,
        }
    }

    async fn run_step(&self, step: usize, op: &Operation, log: &mut CompensationLog) -> BackendResult<()> {
        let lookup = match op.filter() {
            Some(filter) => Some(filter.clone()),
            // Inserts look for an existing row shaped like the payload.
            None => op
                .payload()
                .map(Filter::from_record)
                .filter(|f| !f.is_empty()),
        };

        let captured = match lookup {
            Some(lookup) => self
                .backend
                .read(op.collection(), &lookup)
                .await?
                .map(|pre_image| Compensation::capture(step, op, pre_image, &self.config.id_field)),
            None => None,
        };

        debug!(step, kind = %op.kind(), collection = op.collection(), "applying operation");
        self.backend.write(op).await?;

        // Failed writes leave nothing to restore.
        if let Some(compensation) = captured {
            log.push(compensation);
        }
        Ok(())
    }

    async fn rollback(&self, log: CompensationLog) -> (usize, RecoveryOutcome) {
        let mut replayed = 0;
        for compensation in log.into_replay_order() {
            let step = compensation.step;
            let restore = Operation::Update(compensation.restore);
            if let Err(err) = self.backend.write(&restore).await {
                error!(step, error = %err, "compensation replay failed; batch left partially applied");
                if let Err(marker_err) = self.backend.rollback_marker().await {
                    error!(error = %marker_err, "rollback marker failed");
                }
                return (
                    replayed,
                    RecoveryOutcome::ReplayFailed {
                        step,
                        error: err.to_string(),
                    },
                );
            }
            replayed += 1;
        }

        let marker = self.config.recovery_marker;
        let fired = match marker {
            RecoveryMarker::Commit => self.backend.commit_marker().await,
            RecoveryMarker::Rollback => self.backend.rollback_marker().await,
        };
        if let Err(err) = fired {
            warn!(error = %err, ?marker, "recovery marker failed");
        }
        (replayed, RecoveryOutcome::Restored(marker))
    }
}

/// Identifier of `record` under `id_field`, when present and non-null.
pub fn record_id<'a>(record: &'a Record, id_field: &str) -> Option<&'a Value> {
    record.get(id_field).filter(|v| !v.is_null())
}
