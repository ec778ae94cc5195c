use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    account::{Account, AccountId},
    entry::{EntryRecord, LedgerEntry},
};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Constraint violated: {0}")]
    Constraint(String),
    #[error("Injected failure at {0:?}")]
    Injected(memory::FailPoint),
}

/// Isolation level requested for every read-write transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Combined with row locks (`FOR UPDATE`) on the accounts a transaction touches.
    #[default]
    ReadCommitted,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Gateway to the transactional store holding accounts and ledger entries.
///
/// Methods on the gateway itself run as single statements outside any transaction and
/// always observe the latest committed state.
#[async_trait]
pub trait Storage: Send + Sync {
    type Tx: StorageTx;

    async fn begin(&self) -> Result<Self::Tx, StorageError>;

    async fn account_exists(&self, account: AccountId) -> Result<bool, StorageError>;

    async fn insert_account(&self, account: &Account) -> Result<(), StorageError>;

    /// `None` when the account does not exist.
    async fn balance(&self, account: AccountId) -> Result<Option<i64>, StorageError>;

    /// Every entry debiting or crediting `account`, newest first.
    async fn entries_for(&self, account: AccountId) -> Result<Vec<EntryRecord>, StorageError>;
}

/// Open read-write transaction.
///
/// Dropping the handle without calling [`StorageTx::commit`] rolls the transaction back.
#[async_trait]
pub trait StorageTx: Send {
    /// Reads the balance and holds a write lock on the account row until the transaction
    /// ends. `None` when the account does not exist.
    async fn lock_balance(&mut self, account: AccountId) -> Result<Option<i64>, StorageError>;

    /// Adds `delta` to the balance. Returns `false` when no such account exists.
    async fn adjust_balance(&mut self, account: AccountId, delta: i64)
    -> Result<bool, StorageError>;

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<(), StorageError>;

    async fn commit(self) -> Result<(), StorageError>;

    async fn rollback(self) -> Result<(), StorageError>;
}
