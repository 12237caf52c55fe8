//! Wallet operations built on top of [`Coordinator`].
//!
//! Business checks (positive amounts, distinct wallets, sufficient funds)
//! happen here, before any batch is built. The coordinator only sequences
//! and compensates the writes it is handed.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::{
    backend::{Backend, BackendError},
    coordinator::Coordinator,
    op::{BatchResult, Operation, OperationBatch},
    types::{Filter, Record},
};

/// Pre-check failures. Display text is what callers receive as the batch error.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Amount is zero or negative.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),
    /// Transfer to the source wallet itself.
    #[error("source and destination wallets must differ")]
    SameWallet,
    /// No wallet with this id.
    #[error("wallet not found: {0}")]
    WalletNotFound(String),
    /// Stored balance is missing or not an integer.
    #[error("wallet {0} has no integer balance")]
    InvalidBalance(String),
    /// Debit would take the balance below zero.
    #[error("insufficient funds")]
    InsufficientFunds,
    /// Credit would overflow the balance.
    #[error("balance overflow on wallet {0}")]
    Overflow(String),
    /// Reading a wallet failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Collection and field names the ledger writes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Collection holding wallets.
    pub wallets: String,
    /// Collection receiving one row per movement.
    pub transactions: String,
    /// Integer balance field on each wallet, in minor units.
    pub balance_field: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            wallets: "wallets".to_string(),
            transactions: "transactions".to_string(),
            balance_field: "balance".to_string(),
        }
    }
}

/// Move funds between two wallets.
#[derive(Debug, Clone)]
pub struct TransferCmd {
    /// Wallet debited.
    pub from_wallet: String,
    /// Wallet credited.
    pub to_wallet: String,
    /// Positive amount in minor units.
    pub amount_minor: i64,
    /// Free text stored on the transaction row.
    pub note: Option<String>,
}

/// Credit one wallet.
#[derive(Debug, Clone)]
pub struct DepositCmd {
    /// Target wallet id.
    pub wallet: String,
    /// Positive amount in minor units.
    pub amount_minor: i64,
    /// Free text stored on the transaction row.
    pub note: Option<String>,
}

/// Debit one wallet.
#[derive(Debug, Clone)]
pub struct WithdrawCmd {
    /// Target wallet id.
    pub wallet: String,
    /// Positive amount in minor units.
    pub amount_minor: i64,
    /// Free text stored on the transaction row.
    pub note: Option<String>,
}

/// Wallet service issuing one batch per request.
#[derive(Debug)]
pub struct Ledger<B> {
    coordinator: Coordinator<B>,
    config: LedgerConfig,
}

impl<B: Backend> Ledger<B> {
    /// Ledger with [`LedgerConfig::default`].
    pub fn new(coordinator: Coordinator<B>) -> Self {
        Self::with_config(coordinator, LedgerConfig::default())
    }

    /// Uses `config` in place of the defaults.
    pub fn with_config(coordinator: Coordinator<B>, config: LedgerConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// Coordinator running the ledger's batches.
    pub fn coordinator(&self) -> &Coordinator<B> {
        &self.coordinator
    }

    /// Plans and runs a transfer; pre-check failures skip the backend.
    pub async fn transfer(&self, cmd: TransferCmd) -> BatchResult {
        self.submit(self.plan_transfer(cmd).await).await
    }

    /// Plans and runs a deposit.
    pub async fn deposit(&self, cmd: DepositCmd) -> BatchResult {
        self.submit(self.plan_deposit(cmd).await).await
    }

    /// Plans and runs a withdrawal.
    pub async fn withdraw(&self, cmd: WithdrawCmd) -> BatchResult {
        self.submit(self.plan_withdraw(cmd).await).await
    }

    /// Debit source, credit destination, record the transfer.
    pub async fn plan_transfer(&self, cmd: TransferCmd) -> Result<OperationBatch, LedgerError> {
        check_amount(cmd.amount_minor)?;
        if cmd.from_wallet == cmd.to_wallet {
            return Err(LedgerError::SameWallet);
        }
        let from_balance = self.balance(&cmd.from_wallet).await?;
        let to_balance = self.balance(&cmd.to_wallet).await?;
        if from_balance < cmd.amount_minor {
            return Err(LedgerError::InsufficientFunds);
        }
        let credited = to_balance
            .checked_add(cmd.amount_minor)
            .ok_or_else(|| LedgerError::Overflow(cmd.to_wallet.clone()))?;

        Ok(vec![
            self.set_balance(&cmd.from_wallet, from_balance - cmd.amount_minor),
            self.set_balance(&cmd.to_wallet, credited),
            self.entry(json!({
                "kind": "transfer",
                "from_wallet_id": cmd.from_wallet,
                "to_wallet_id": cmd.to_wallet,
                "amount_minor": cmd.amount_minor,
                "status": "completed",
                "note": cmd.note,
            })),
        ])
    }

    /// Credit the wallet, record the deposit.
    pub async fn plan_deposit(&self, cmd: DepositCmd) -> Result<OperationBatch, LedgerError> {
        check_amount(cmd.amount_minor)?;
        let balance = self.balance(&cmd.wallet).await?;
        let credited = balance
            .checked_add(cmd.amount_minor)
            .ok_or_else(|| LedgerError::Overflow(cmd.wallet.clone()))?;

        Ok(vec![
            self.set_balance(&cmd.wallet, credited),
            self.entry(json!({
                "kind": "deposit",
                "wallet_id": cmd.wallet,
                "amount_minor": cmd.amount_minor,
                "status": "completed",
                "note": cmd.note,
            })),
        ])
    }

    /// Debit the wallet after a funds check, record the withdrawal.
    pub async fn plan_withdraw(&self, cmd: WithdrawCmd) -> Result<OperationBatch, LedgerError> {
        check_amount(cmd.amount_minor)?;
        let balance = self.balance(&cmd.wallet).await?;
        if balance < cmd.amount_minor {
            return Err(LedgerError::InsufficientFunds);
        }

        Ok(vec![
            self.set_balance(&cmd.wallet, balance - cmd.amount_minor),
            self.entry(json!({
                "kind": "withdrawal",
                "wallet_id": cmd.wallet,
                "amount_minor": cmd.amount_minor,
                "status": "completed",
                "note": cmd.note,
            })),
        ])
    }

    async fn submit(&self, plan: Result<OperationBatch, LedgerError>) -> BatchResult {
        match plan {
            Ok(batch) => self.coordinator.execute(batch).await,
            Err(err) => {
                debug!(error = %err, "ledger request rejected before execution");
                BatchResult::failure(err.to_string())
            }
        }
    }

    async fn balance(&self, wallet: &str) -> Result<i64, LedgerError> {
        let record = self
            .coordinator
            .backend()
            .read(&self.config.wallets, &self.wallet_filter(wallet))
            .await?
            .ok_or_else(|| LedgerError::WalletNotFound(wallet.to_string()))?;
        record
            .get(&self.config.balance_field)
            .and_then(Value::as_i64)
            .ok_or_else(|| LedgerError::InvalidBalance(wallet.to_string()))
    }

    fn wallet_filter(&self, wallet: &str) -> Filter {
        Filter::by(self.coordinator.config().id_field.as_str(), wallet)
    }

    fn set_balance(&self, wallet: &str, balance: i64) -> Operation {
        let mut payload = Record::new();
        payload.insert(self.config.balance_field.clone(), Value::from(balance));
        Operation::update(&self.config.wallets, payload, self.wallet_filter(wallet))
    }

    fn entry(&self, row: Value) -> Operation {
        let payload = match row {
            Value::Object(map) => map,
            _ => Record::new(),
        };
        Operation::insert(&self.config.transactions, payload)
    }
}

fn check_amount(amount_minor: i64) -> Result<(), LedgerError> {
    if amount_minor <= 0 {
        return Err(LedgerError::InvalidAmount(amount_minor));
    }
    Ok(())
}
