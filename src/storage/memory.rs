use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex as SyncMutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;
use uuid::Uuid;

use crate::{
    account::{Account, AccountId},
    entry::{EntryRecord, LedgerEntry},
};

use super::{Storage, StorageError, StorageTx};

/// Gateway call that a [`MemoryStorage`] can be told to break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Begin,
    AccountExists,
    InsertAccount,
    ReadBalance,
    ReadEntries,
    LockBalance,
    AdjustBalance,
    InsertEntry,
    Commit,
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Fail,
    Stall,
}

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<AccountId, Account>,
    entries: Vec<EntryRecord>,
    entry_ids: HashSet<Uuid>,
}

#[derive(Debug, Default)]
struct Probes {
    faults: SyncMutex<HashMap<FailPoint, Fault>>,
    calls: AtomicUsize,
}

impl Probes {
    async fn hit(&self, point: FailPoint) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fault = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&point)
            .copied();
        match fault {
            None => Ok(()),
            Some(Fault::Fail) => Err(StorageError::Injected(point)),
            Some(Fault::Stall) => {
                trace!(?point, "stalling storage call");
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn set(&self, point: FailPoint, fault: Option<Fault>) {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        match fault {
            Some(fault) => faults.insert(point, fault),
            None => faults.remove(&point),
        };
    }
}

/// In-process store with the same transactional contract as the database gateway.
///
/// A transaction holds the store exclusively from `begin` until it commits or is dropped,
/// so transactions are serializable. Writes are staged in the transaction and only reach
/// the shared state on commit.
///
/// Faults can be injected per [`FailPoint`] to exercise rollback paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    probes: Arc<Probes>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call at `point` fail with [`StorageError::Injected`].
    pub fn fail_at(&self, point: FailPoint) {
        self.probes.set(point, Some(Fault::Fail));
    }

    /// Makes every call at `point` hang forever.
    pub fn stall_at(&self, point: FailPoint) {
        self.probes.set(point, Some(Fault::Stall));
    }

    pub fn clear_fault(&self, point: FailPoint) {
        self.probes.set(point, None);
    }

    /// Number of gateway calls made so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.probes.calls.load(Ordering::SeqCst)
    }

    pub async fn entry_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Stores a raw entry row as is, bypassing every check.
    pub async fn insert_record(&self, record: EntryRecord) {
        let mut state = self.state.lock().await;
        if let Some(id) = record.id {
            state.entry_ids.insert(id);
        }
        state.entries.push(record);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StorageError> {
        self.probes.hit(FailPoint::Begin).await?;
        let state = self.state.clone().lock_owned().await;
        Ok(MemoryTx {
            state,
            balances: HashMap::new(),
            entries: Vec::new(),
            probes: self.probes.clone(),
        })
    }

    async fn account_exists(&self, account: AccountId) -> Result<bool, StorageError> {
        self.probes.hit(FailPoint::AccountExists).await?;
        Ok(self.state.lock().await.accounts.contains_key(&account))
    }

    async fn insert_account(&self, account: &Account) -> Result<(), StorageError> {
        self.probes.hit(FailPoint::InsertAccount).await?;
        let mut state = self.state.lock().await;
        if state.accounts.contains_key(&account.id) {
            return Err(StorageError::Constraint(format!(
                "account {} already exists",
                account.id
            )));
        }
        state.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn balance(&self, account: AccountId) -> Result<Option<i64>, StorageError> {
        self.probes.hit(FailPoint::ReadBalance).await?;
        let state = self.state.lock().await;
        Ok(state.accounts.get(&account).map(|acc| acc.balance))
    }

    async fn entries_for(&self, account: AccountId) -> Result<Vec<EntryRecord>, StorageError> {
        self.probes.hit(FailPoint::ReadEntries).await?;
        let id = Some(account.as_uuid());
        let state = self.state.lock().await;
        // newest insert first, so the stable sort leaves equal timestamps in that order
        let mut records: Vec<EntryRecord> = state
            .entries
            .iter()
            .rev()
            .filter(|record| record.source == id || record.destination == id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

pub struct MemoryTx {
    state: OwnedMutexGuard<MemoryState>,
    balances: HashMap<AccountId, i64>,
    entries: Vec<EntryRecord>,
    probes: Arc<Probes>,
}

impl MemoryTx {
    fn current_balance(&self, account: AccountId) -> Option<i64> {
        self.balances
            .get(&account)
            .copied()
            .or_else(|| self.state.accounts.get(&account).map(|acc| acc.balance))
    }
}

#[async_trait]
impl StorageTx for MemoryTx {
    async fn lock_balance(&mut self, account: AccountId) -> Result<Option<i64>, StorageError> {
        self.probes.hit(FailPoint::LockBalance).await?;
        Ok(self.current_balance(account))
    }

    async fn adjust_balance(
        &mut self,
        account: AccountId,
        delta: i64,
    ) -> Result<bool, StorageError> {
        self.probes.hit(FailPoint::AdjustBalance).await?;
        let Some(current) = self.current_balance(account) else {
            return Ok(false);
        };
        let next = current.checked_add(delta).ok_or_else(|| {
            StorageError::Constraint(format!("balance of account {account} overflows"))
        })?;
        if next < 0 {
            return Err(StorageError::Constraint(format!(
                "balance of account {account} would become negative"
            )));
        }
        self.balances.insert(account, next);
        Ok(true)
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<(), StorageError> {
        self.probes.hit(FailPoint::InsertEntry).await?;
        let id = entry.id.as_uuid();
        let staged = self.entries.iter().any(|record| record.id == Some(id));
        if staged || self.state.entry_ids.contains(&id) {
            return Err(StorageError::Constraint(format!(
                "ledger entry {id} already exists"
            )));
        }
        self.entries.push(EntryRecord::from(entry));
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.probes.hit(FailPoint::Commit).await?;
        let MemoryTx {
            mut state,
            balances,
            entries,
            ..
        } = self;
        for (account, balance) in balances {
            if let Some(acc) = state.accounts.get_mut(&account) {
                acc.balance = balance;
            }
        }
        for record in entries {
            if let Some(id) = record.id {
                state.entry_ids.insert(id);
            }
            state.entries.push(record);
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        trace!(
            staged_entries = self.entries.len(),
            "discarding memory transaction"
        );
        Ok(())
    }
}
