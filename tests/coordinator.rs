use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use txbatch::{
    backend::{
        Backend, BackendResult,
        memory::{BackendCall, Fault, FaultTarget, MemoryBackend},
    },
    coordinator::{Coordinator, CoordinatorConfig, EMPTY_BATCH, RecoveryMarker, RecoveryOutcome},
    op::{BatchResult, Operation, OperationKind},
    types::{Filter, Record},
};

fn record(value: Value) -> Record {
    value.as_object().cloned().expect("object")
}

fn seeded(backend: MemoryBackend) -> MemoryBackend {
    backend.seed(
        "wallets",
        [
            record(json!({"id": "a", "owner": "ann", "balance": 500})),
            record(json!({"id": "b", "owner": "bob", "balance": 0})),
        ],
    );
    backend
}

fn set_balance(wallet: &str, balance: i64) -> Operation {
    Operation::update("wallets", record(json!({"balance": balance})), Filter::by("id", wallet))
}

fn transfer_batch() -> Vec<Operation> {
    vec![
        set_balance("a", 400),
        set_balance("b", 100),
        Operation::insert(
            "transactions",
            record(json!({"from": "a", "to": "b", "amount_minor": 100})),
        ),
    ]
}

fn balance(backend: &MemoryBackend, wallet: &str) -> Value {
    backend
        .find("wallets", &Filter::by("id", wallet))
        .expect("wallet")["balance"]
        .clone()
}

#[tokio::test]
async fn successful_transfer_brackets_writes_with_begin_and_commit() {
    let coordinator = Coordinator::new(seeded(MemoryBackend::advisory()));

    let report = coordinator.execute_detailed(transfer_batch()).await;

    assert_eq!(report.result, BatchResult::ok());
    assert_eq!(report.steps_applied, 3);
    assert_eq!(report.compensations_captured, 2);
    assert_eq!(report.recovery, None);

    let backend = coordinator.backend();
    assert_eq!(backend.markers(), vec![BackendCall::Begin, BackendCall::Commit]);
    assert_eq!(balance(backend, "a"), json!(400));
    assert_eq!(balance(backend, "b"), json!(100));
    assert_eq!(backend.records("transactions").len(), 1);
}

#[tokio::test]
async fn mid_batch_failure_restores_prior_steps_and_stops() {
    let backend = seeded(MemoryBackend::advisory());
    backend.inject(
        Fault::on_write("wallets", OperationKind::Update)
            .when_filter(Filter::by("id", "b"))
            .message("new row for relation \"wallets\" violates check constraint \"wallets_balance_check\""),
    );
    let coordinator = Coordinator::new(backend);

    let report = coordinator.execute_detailed(transfer_batch()).await;

    assert_eq!(
        report.result,
        BatchResult::failure(
            "new row for relation \"wallets\" violates check constraint \"wallets_balance_check\""
        )
    );
    assert_eq!(report.failed_step, Some(1));
    assert_eq!(report.steps_applied, 1);
    assert_eq!(report.compensations_captured, 1);
    assert_eq!(report.compensations_replayed, 1);
    assert_eq!(report.recovery, Some(RecoveryOutcome::Restored(RecoveryMarker::Commit)));

    let backend = coordinator.backend();
    assert_eq!(balance(backend, "a"), json!(500));
    assert!(backend.records("transactions").is_empty());
    assert!(
        backend
            .writes()
            .iter()
            .all(|op| op.collection() == "wallets"),
        "insert after the failing step must never be attempted"
    );
    // Restores are followed by the commit marker, not the rollback marker.
    assert_eq!(backend.markers(), vec![BackendCall::Begin, BackendCall::Commit]);
}

#[tokio::test]
async fn rollback_recovery_marker_is_opt_in() {
    let backend = seeded(MemoryBackend::advisory());
    backend.inject(Fault::on_any_write("transactions").message("connection reset"));
    let coordinator = Coordinator::with_config(
        backend,
        CoordinatorConfig {
            recovery_marker: RecoveryMarker::Rollback,
            ..CoordinatorConfig::default()
        },
    );

    let result = coordinator.execute(transfer_batch()).await;

    assert_eq!(result, BatchResult::failure("connection reset"));
    assert_eq!(
        coordinator.backend().markers(),
        vec![BackendCall::Begin, BackendCall::Rollback]
    );
}

#[tokio::test]
async fn compensations_replay_last_applied_first() {
    let backend = MemoryBackend::advisory();
    backend.seed(
        "wallets",
        ["a", "b", "c"].map(|id| record(json!({"id": id, "balance": 10}))),
    );
    backend.inject(Fault::on_any_write("ledger_locks").message("lock not available"));
    let coordinator = Coordinator::new(backend);

    let report = coordinator
        .execute_detailed(vec![
            set_balance("a", 1),
            set_balance("b", 2),
            set_balance("c", 3),
            Operation::delete("ledger_locks", Filter::by("wallet_id", "a")),
        ])
        .await;
    assert_eq!(report.compensations_replayed, 3);

    let restored: Vec<_> = coordinator
        .backend()
        .writes()
        .into_iter()
        .skip(4)
        .map(|op| op.filter().and_then(|f| f.get("id")).cloned())
        .collect();
    assert_eq!(
        restored,
        vec![Some(json!("c")), Some(json!("b")), Some(json!("a"))]
    );
    for id in ["a", "b", "c"] {
        assert_eq!(balance(coordinator.backend(), id), json!(10));
    }
}

#[tokio::test]
async fn failed_replay_fires_rollback_marker_and_reports_original_error() {
    let backend = seeded(MemoryBackend::advisory());
    backend.inject(
        Fault::on_write("wallets", OperationKind::Update)
            .when_filter(Filter::by("id", "a"))
            .after(1)
            .message("permission denied for table wallets"),
    );
    backend.inject(Fault::on_any_write("transactions").message("connection reset"));
    let coordinator = Coordinator::new(backend);

    let report = coordinator.execute_detailed(transfer_batch()).await;

    assert_eq!(report.result, BatchResult::failure("connection reset"));
    assert_eq!(report.compensations_captured, 2);
    assert_eq!(report.compensations_replayed, 1);
    assert_eq!(
        report.recovery,
        Some(RecoveryOutcome::ReplayFailed {
            step: 0,
            error: "permission denied for table wallets".to_string(),
        })
    );

    let backend = coordinator.backend();
    assert_eq!(backend.markers(), vec![BackendCall::Begin, BackendCall::Rollback]);
    // Advisory markers undo nothing: the debit stays applied.
    assert_eq!(balance(backend, "a"), json!(400));
    assert_eq!(balance(backend, "b"), json!(0));
}

#[tokio::test]
async fn transactional_backend_rollback_marker_restores_everything() {
    let backend = seeded(MemoryBackend::transactional());
    backend.inject(
        Fault::on_write("wallets", OperationKind::Update)
            .when_filter(Filter::by("id", "a"))
            .after(1),
    );
    backend.inject(Fault::on_any_write("transactions"));
    let coordinator = Coordinator::new(backend);

    let result = coordinator.execute(transfer_batch()).await;

    assert!(!result.success);
    assert_eq!(balance(coordinator.backend(), "a"), json!(500));
    assert_eq!(balance(coordinator.backend(), "b"), json!(0));
}

#[tokio::test]
async fn inserted_rows_survive_a_failed_batch() {
    let backend = seeded(MemoryBackend::advisory());
    backend.inject(
        Fault::on_write("wallets", OperationKind::Update).message("wallet is frozen"),
    );
    let coordinator = Coordinator::new(backend);

    let report = coordinator
        .execute_detailed(vec![
            Operation::insert("transactions", record(json!({"id": "t1", "status": "pending"}))),
            set_balance("a", 0),
        ])
        .await;

    assert_eq!(report.result, BatchResult::failure("wallet is frozen"));
    assert_eq!(report.compensations_captured, 0);
    assert_eq!(coordinator.backend().records("transactions").len(), 1);
}

#[tokio::test]
async fn deleted_rows_are_not_recreated_by_restore() {
    let backend = seeded(MemoryBackend::advisory());
    backend.inject(Fault::on_any_write("transactions"));
    let coordinator = Coordinator::new(backend);

    let report = coordinator
        .execute_detailed(vec![
            Operation::delete("wallets", Filter::by("id", "b")),
            Operation::insert("transactions", record(json!({"kind": "close", "wallet_id": "b"}))),
        ])
        .await;

    assert_eq!(report.compensations_replayed, 1);
    assert!(coordinator.backend().find("wallets", &Filter::by("id", "b")).is_none());
}

#[tokio::test]
async fn single_failing_update_reports_its_message() {
    let backend = seeded(MemoryBackend::advisory());
    backend.inject(Fault::on_write("wallets", OperationKind::Update).message("insufficient funds"));
    let coordinator = Coordinator::new(backend);

    let report = coordinator.execute_detailed(vec![set_balance("a", -9_500)]).await;

    assert_eq!(report.result, BatchResult::failure("insufficient funds"));
    assert_eq!(report.compensations_replayed, 0);
    assert_eq!(balance(coordinator.backend(), "a"), json!(500));
}

#[tokio::test]
async fn executing_twice_doubles_side_effects() {
    let coordinator = Coordinator::new(MemoryBackend::advisory());
    let batch = vec![Operation::insert(
        "transactions",
        record(json!({"kind": "deposit", "amount_minor": 100})),
    )];

    assert!(coordinator.execute(batch.clone()).await.success);
    assert!(coordinator.execute(batch).await.success);

    assert_eq!(coordinator.backend().records("transactions").len(), 2);
    assert_eq!(
        coordinator.backend().markers(),
        vec![
            BackendCall::Begin,
            BackendCall::Commit,
            BackendCall::Begin,
            BackendCall::Commit
        ]
    );
}

#[tokio::test]
async fn empty_batch_never_reaches_backend() {
    let coordinator = Coordinator::new(MemoryBackend::advisory());

    let result = coordinator.execute(Vec::new()).await;

    assert_eq!(result, BatchResult::failure(EMPTY_BATCH));
    assert!(coordinator.backend().journal().is_empty());
}

#[tokio::test]
async fn missing_marker_rpcs_do_not_block_writes() {
    let backend = seeded(MemoryBackend::advisory());
    backend.inject(Fault::on_marker(FaultTarget::Begin));
    backend.inject(Fault::on_marker(FaultTarget::Commit));
    let coordinator = Coordinator::new(backend);

    let result = coordinator.execute(transfer_batch()).await;

    assert_eq!(result, BatchResult::ok());
    assert_eq!(balance(coordinator.backend(), "b"), json!(100));
}

#[tokio::test]
async fn read_failure_aborts_before_the_write() {
    let backend = seeded(MemoryBackend::advisory());
    backend.inject(
        Fault::on_read("wallets")
            .when_filter(Filter::by("id", "b"))
            .message("statement timeout"),
    );
    let coordinator = Coordinator::new(backend);

    let report = coordinator.execute_detailed(transfer_batch()).await;

    assert_eq!(report.result, BatchResult::failure("statement timeout"));
    assert_eq!(report.failed_step, Some(1));
    let writes = coordinator.backend().writes();
    // Forward write of step 0 and its restore, nothing for step 1.
    assert_eq!(writes.len(), 2);
    assert_eq!(balance(coordinator.backend(), "a"), json!(500));
}

/// Records what an outside reader sees while the batch is in flight.
struct Peeking {
    inner: MemoryBackend,
    seen: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl Backend for Peeking {
    async fn begin_marker(&self) -> BackendResult<()> {
        self.inner.begin_marker().await
    }

    async fn commit_marker(&self) -> BackendResult<()> {
        self.inner.commit_marker().await
    }

    async fn rollback_marker(&self) -> BackendResult<()> {
        self.inner.rollback_marker().await
    }

    async fn read(&self, collection: &str, filter: &Filter) -> BackendResult<Option<Record>> {
        self.inner.read(collection, filter).await
    }

    async fn write(&self, op: &Operation) -> BackendResult<()> {
        if op.collection() == "transactions" {
            self.seen.lock().expect("lock").push(balance(&self.inner, "a"));
        }
        self.inner.write(op).await
    }
}

#[tokio::test]
async fn intermediate_state_is_visible_to_other_readers() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let coordinator = Coordinator::new(Peeking {
        inner: seeded(MemoryBackend::transactional()),
        seen: Arc::clone(&seen),
    });

    assert!(coordinator.execute(transfer_batch()).await.success);

    assert_eq!(*seen.lock().expect("lock"), vec![json!(400)]);
}

#[tokio::test]
async fn shared_backend_serves_concurrent_batches_without_isolation() {
    let backend = Arc::new(seeded(MemoryBackend::advisory()));
    let first = Coordinator::new(Arc::clone(&backend));
    let second = Coordinator::new(Arc::clone(&backend));

    let (r1, r2) = tokio::join!(
        first.execute(vec![set_balance("a", 400)]),
        second.execute(vec![set_balance("a", 300)]),
    );

    assert!(r1.success && r2.success);
    // Both batches wrote; last writer wins, no conflict is detected.
    assert_eq!(backend.writes().len(), 2);
    assert_eq!(backend.markers().len(), 4);
}
