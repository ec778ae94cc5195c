use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    account::{Account, AccountId, OwnerId},
    amount::Amount,
    clock::{Clock, SystemClock},
    directory::AccountDirectory,
    entry::{EntryDecodeError, EntryId, LedgerEntry},
    storage::{Storage, StorageError, StorageTx},
};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Amount must be greater than zero, got {0}")]
    InvalidAmount(i64),
    #[error("Account {0} not found")]
    AccountNotFound(AccountId),
    #[error("Source account {0} does not exist")]
    SourceInvalid(AccountId),
    #[error("Destination account {0} does not exist")]
    DestinationInvalid(AccountId),
    #[error("Cannot transfer to the same account")]
    SameAccountTransfer,
    #[error("Insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },
    #[error(transparent)]
    StorageFailure(#[from] StorageError),
    #[error("Corrupted ledger entry: {0}")]
    DataIntegrityFailure(#[from] EntryDecodeError),
}

impl LedgerError {
    /// `true` when the request itself was at fault, `false` when the store was.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            LedgerError::StorageFailure(_) | LedgerError::DataIntegrityFailure(_)
        )
    }
}

/// Transaction engine over a [`Storage`] gateway.
///
/// Holds no mutable state of its own: clones share the gateway and may run operations
/// concurrently. A storage failure is reported once and never retried.
#[derive(Clone)]
pub struct Ledger<S> {
    storage: S,
    clock: Arc<dyn Clock>,
}

impl<S: Storage> Ledger<S> {
    pub fn new(storage: S) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: S, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn directory(&self) -> AccountDirectory<'_, S> {
        AccountDirectory::new(&self.storage)
    }

    #[instrument(skip_all, fields(%owner))]
    pub async fn create_account(&self, owner: OwnerId) -> Result<Account, LedgerError> {
        let account = Account::open(owner);
        self.storage
            .insert_account(&account)
            .await
            .map_err(storage_failure("insert account"))?;
        info!(account = %account.id, "account created");
        Ok(account)
    }

    #[instrument(skip_all, fields(%account, %amount))]
    pub async fn deposit(&self, account: AccountId, amount: i64) -> Result<EntryId, LedgerError> {
        let amount = validate_amount(amount)?;
        if !self.exists(account).await? {
            return Err(LedgerError::AccountNotFound(account));
        }

        let mut tx = self.storage.begin().await.map_err(storage_failure("begin"))?;
        let credited = tx
            .adjust_balance(account, amount.get())
            .await
            .map_err(storage_failure("credit"))?;
        if !credited {
            return Err(abort(tx, LedgerError::AccountNotFound(account)).await);
        }
        let entry = LedgerEntry::deposit(account, amount, self.clock.now());
        tx.insert_entry(&entry)
            .await
            .map_err(storage_failure("insert entry"))?;
        tx.commit().await.map_err(storage_failure("commit"))?;

        debug!(entry = %entry.id, "deposit committed");
        Ok(entry.id)
    }

    #[instrument(skip_all, fields(%account, %amount))]
    pub async fn withdraw(&self, account: AccountId, amount: i64) -> Result<EntryId, LedgerError> {
        let amount = validate_amount(amount)?;
        if !self.exists(account).await? {
            return Err(LedgerError::AccountNotFound(account));
        }

        let mut tx = self.storage.begin().await.map_err(storage_failure("begin"))?;
        let locked = tx
            .lock_balance(account)
            .await
            .map_err(storage_failure("lock balance"))?;
        let Some(balance) = locked else {
            return Err(abort(tx, LedgerError::AccountNotFound(account)).await);
        };
        if balance < amount.get() {
            let err = LedgerError::InsufficientFunds {
                balance,
                requested: amount.get(),
            };
            return Err(abort(tx, err).await);
        }
        let debited = tx
            .adjust_balance(account, -amount.get())
            .await
            .map_err(storage_failure("debit"))?;
        if !debited {
            return Err(abort(tx, LedgerError::AccountNotFound(account)).await);
        }
        let entry = LedgerEntry::withdrawal(account, amount, self.clock.now());
        tx.insert_entry(&entry)
            .await
            .map_err(storage_failure("insert entry"))?;
        tx.commit().await.map_err(storage_failure("commit"))?;

        debug!(entry = %entry.id, "withdrawal committed");
        Ok(entry.id)
    }

    /// Moves `amount` from `from` to `to` as one entry.
    ///
    /// Rejections are checked in a fixed order: amount, same account, source existence,
    /// destination existence, then funds inside the transaction.
    #[instrument(skip_all, fields(%from, %to, %amount))]
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: i64,
    ) -> Result<EntryId, LedgerError> {
        let amount = validate_amount(amount)?;
        if from == to {
            return Err(LedgerError::SameAccountTransfer);
        }
        if !self.exists(from).await? {
            return Err(LedgerError::SourceInvalid(from));
        }
        if !self.exists(to).await? {
            return Err(LedgerError::DestinationInvalid(to));
        }

        let mut tx = self.storage.begin().await.map_err(storage_failure("begin"))?;
        // rows are always locked lowest id first, so opposite transfers cannot deadlock
        let (source, destination) = if from < to {
            let source = tx
                .lock_balance(from)
                .await
                .map_err(storage_failure("lock source"))?;
            let destination = tx
                .lock_balance(to)
                .await
                .map_err(storage_failure("lock destination"))?;
            (source, destination)
        } else {
            let destination = tx
                .lock_balance(to)
                .await
                .map_err(storage_failure("lock destination"))?;
            let source = tx
                .lock_balance(from)
                .await
                .map_err(storage_failure("lock source"))?;
            (source, destination)
        };
        let Some(balance) = source else {
            return Err(abort(tx, LedgerError::SourceInvalid(from)).await);
        };
        if destination.is_none() {
            return Err(abort(tx, LedgerError::DestinationInvalid(to)).await);
        }
        if balance < amount.get() {
            let err = LedgerError::InsufficientFunds {
                balance,
                requested: amount.get(),
            };
            return Err(abort(tx, err).await);
        }

        let debited = tx
            .adjust_balance(from, -amount.get())
            .await
            .map_err(storage_failure("debit"))?;
        if !debited {
            return Err(abort(tx, LedgerError::SourceInvalid(from)).await);
        }
        let credited = tx
            .adjust_balance(to, amount.get())
            .await
            .map_err(storage_failure("credit"))?;
        if !credited {
            return Err(abort(tx, LedgerError::DestinationInvalid(to)).await);
        }
        let entry = LedgerEntry::transfer(from, to, amount, self.clock.now());
        tx.insert_entry(&entry)
            .await
            .map_err(storage_failure("insert entry"))?;
        tx.commit().await.map_err(storage_failure("commit"))?;

        debug!(entry = %entry.id, "transfer committed");
        Ok(entry.id)
    }

    #[instrument(skip_all, fields(%account))]
    pub async fn balance(&self, account: AccountId) -> Result<i64, LedgerError> {
        self.storage
            .balance(account)
            .await
            .map_err(storage_failure("read balance"))?
            .ok_or(LedgerError::AccountNotFound(account))
    }

    /// Entries touching `account`, newest first.
    ///
    /// Entries with equal timestamps come back in whatever order the store yields them.
    /// A single undecodable row fails the whole call.
    #[instrument(skip_all, fields(%account))]
    pub async fn history(&self, account: AccountId) -> Result<Vec<LedgerEntry>, LedgerError> {
        if !self.exists(account).await? {
            return Err(LedgerError::AccountNotFound(account));
        }
        let records = self
            .storage
            .entries_for(account)
            .await
            .map_err(storage_failure("read entries"))?;
        records
            .into_iter()
            .map(LedgerEntry::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                warn!(error = %err, "undecodable ledger entry");
                LedgerError::DataIntegrityFailure(err)
            })
    }

    async fn exists(&self, account: AccountId) -> Result<bool, LedgerError> {
        self.directory()
            .exists(account)
            .await
            .map_err(storage_failure("account lookup"))
    }
}

fn validate_amount(amount: i64) -> Result<Amount, LedgerError> {
    Amount::try_from(amount).map_err(|_| LedgerError::InvalidAmount(amount))
}

fn storage_failure(step: &'static str) -> impl FnOnce(StorageError) -> LedgerError {
    move |err| {
        warn!(step, error = %err, "storage call failed");
        LedgerError::StorageFailure(err)
    }
}

/// Rolls `tx` back explicitly and hands back `err`.
///
/// A failing rollback is logged only: the handle is gone either way and `err` is what the
/// caller needs to see.
async fn abort<T: StorageTx>(tx: T, err: LedgerError) -> LedgerError {
    if let Err(rollback_err) = tx.rollback().await {
        warn!(error = %rollback_err, "rollback failed");
    }
    debug!(reason = %err, "transaction rolled back");
    err
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use chrono::Utc;

    use crate::{
        clock::ManualClock,
        entry::{EntryKind, EntryRecord},
        storage::memory::{FailPoint, MemoryStorage},
    };

    use super::*;

    fn ledger() -> Ledger<MemoryStorage> {
        Ledger::new(MemoryStorage::new())
    }

    async fn funded(ledger: &Ledger<MemoryStorage>, balance: i64) -> AccountId {
        let account = ledger.create_account(OwnerId::new()).await.unwrap();
        if balance > 0 {
            ledger.deposit(account.id, balance).await.unwrap();
        }
        account.id
    }

    #[tokio::test]
    async fn deposit_into_new_account() {
        let ledger = ledger();
        let owner = OwnerId::new();
        let account = ledger.create_account(owner).await.unwrap();
        assert_eq!(account.owner, owner);
        assert_eq!(ledger.balance(account.id).await.unwrap(), 0);

        ledger.deposit(account.id, 200).await.unwrap();
        assert_eq!(ledger.balance(account.id).await.unwrap(), 200);

        let history = ledger.history(account.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, EntryKind::Deposit);
        assert_eq!(history[0].source, None);
        assert_eq!(history[0].destination, Some(account.id));
    }

    #[tokio::test]
    async fn overdraft_is_refused() {
        let ledger = ledger();
        let account = funded(&ledger, 200).await;

        let err = ledger.withdraw(account, 250).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds {
                balance: 200,
                requested: 250
            }
        ));
        assert_eq!(ledger.balance(account).await.unwrap(), 200);
        assert_eq!(ledger.history(account).await.unwrap().len(), 1);

        ledger.withdraw(account, 200).await.unwrap();
        assert_eq!(ledger.balance(account).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transfer_moves_exactly_the_amount() {
        let ledger = ledger();
        let a = funded(&ledger, 1000).await;
        let b = funded(&ledger, 0).await;
        let bystander = funded(&ledger, 50).await;

        let entry_id = ledger.transfer(a, b, 100).await.unwrap();

        assert_eq!(ledger.balance(a).await.unwrap(), 900);
        assert_eq!(ledger.balance(b).await.unwrap(), 100);
        assert_eq!(ledger.balance(bystander).await.unwrap(), 50);
        for account in [a, b] {
            let history = ledger.history(account).await.unwrap();
            let entry = history.iter().find(|e| e.id == entry_id).unwrap();
            assert_eq!(entry.kind, EntryKind::Transfer);
            assert_eq!(entry.source, Some(a));
            assert_eq!(entry.destination, Some(b));
            assert_eq!(entry.amount.get(), 100);
        }
        assert!(
            ledger
                .history(bystander)
                .await
                .unwrap()
                .iter()
                .all(|e| e.id != entry_id)
        );
    }

    #[tokio::test]
    async fn transfer_beyond_balance_is_refused() {
        let ledger = ledger();
        let a = funded(&ledger, 100).await;
        let b = funded(&ledger, 0).await;

        let err = ledger.transfer(a, b, 101).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(ledger.balance(a).await.unwrap(), 100);
        assert_eq!(ledger.balance(b).await.unwrap(), 0);
        assert!(ledger.history(b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_accounts_are_reported() {
        let ledger = ledger();
        let unknown = AccountId::new();

        assert!(matches!(
            ledger.deposit(unknown, 50).await,
            Err(LedgerError::AccountNotFound(id)) if id == unknown
        ));
        assert!(matches!(
            ledger.withdraw(unknown, 50).await,
            Err(LedgerError::AccountNotFound(_))
        ));
        assert!(matches!(
            ledger.balance(unknown).await,
            Err(LedgerError::AccountNotFound(_))
        ));
        assert!(matches!(
            ledger.history(unknown).await,
            Err(LedgerError::AccountNotFound(_))
        ));
        assert_eq!(ledger.storage().entry_count().await, 0);
    }

    #[tokio::test]
    async fn non_positive_amounts_never_reach_storage() {
        let ledger = ledger();
        let account = funded(&ledger, 10).await;
        let other = funded(&ledger, 0).await;
        let calls = ledger.storage().calls();

        for amount in [0, -5] {
            assert!(matches!(
                ledger.deposit(account, amount).await,
                Err(LedgerError::InvalidAmount(a)) if a == amount
            ));
            assert!(matches!(
                ledger.withdraw(account, amount).await,
                Err(LedgerError::InvalidAmount(_))
            ));
            assert!(matches!(
                ledger.transfer(account, other, amount).await,
                Err(LedgerError::InvalidAmount(_))
            ));
        }
        // amount is validated before the same-account check
        assert!(matches!(
            ledger.transfer(account, account, 0).await,
            Err(LedgerError::InvalidAmount(0))
        ));
        assert_eq!(ledger.storage().calls(), calls);
    }

    #[tokio::test]
    async fn transfer_rejections_follow_check_order() {
        let ledger = ledger();
        let missing_a = AccountId::new();
        let missing_b = AccountId::new();
        let calls = ledger.storage().calls();

        assert!(matches!(
            ledger.transfer(missing_a, missing_a, 100).await,
            Err(LedgerError::SameAccountTransfer)
        ));
        assert_eq!(ledger.storage().calls(), calls);

        assert!(matches!(
            ledger.transfer(missing_a, missing_b, 100).await,
            Err(LedgerError::SourceInvalid(id)) if id == missing_a
        ));

        let existing = funded(&ledger, 500).await;
        assert!(matches!(
            ledger.transfer(existing, existing, 100).await,
            Err(LedgerError::SameAccountTransfer)
        ));
        assert!(matches!(
            ledger.transfer(existing, missing_b, 100).await,
            Err(LedgerError::DestinationInvalid(id)) if id == missing_b
        ));
        assert!(matches!(
            ledger.transfer(missing_a, existing, 100).await,
            Err(LedgerError::SourceInvalid(_))
        ));
        assert_eq!(ledger.balance(existing).await.unwrap(), 500);
    }

    #[tokio::test]
    async fn failed_transfer_step_rolls_back_everything() {
        for point in [
            FailPoint::Begin,
            FailPoint::LockBalance,
            FailPoint::AdjustBalance,
            FailPoint::InsertEntry,
            FailPoint::Commit,
        ] {
            let ledger = ledger();
            let a = funded(&ledger, 1000).await;
            let b = funded(&ledger, 10).await;
            let entries = ledger.storage().entry_count().await;

            ledger.storage().fail_at(point);
            let err = ledger.transfer(a, b, 100).await.unwrap_err();
            assert!(
                matches!(err, LedgerError::StorageFailure(StorageError::Injected(p)) if p == point),
                "{point:?}: {err}"
            );
            assert!(!err.is_client_error());
            ledger.storage().clear_fault(point);

            assert_eq!(ledger.balance(a).await.unwrap(), 1000, "{point:?}");
            assert_eq!(ledger.balance(b).await.unwrap(), 10, "{point:?}");
            assert_eq!(ledger.storage().entry_count().await, entries, "{point:?}");
        }
    }

    #[tokio::test]
    async fn failed_deposit_and_withdrawal_roll_back() {
        for point in [
            FailPoint::AdjustBalance,
            FailPoint::InsertEntry,
            FailPoint::Commit,
        ] {
            let ledger = ledger();
            let account = funded(&ledger, 100).await;
            let entries = ledger.storage().entry_count().await;

            ledger.storage().fail_at(point);
            assert!(matches!(
                ledger.deposit(account, 5).await,
                Err(LedgerError::StorageFailure(_))
            ));
            assert!(matches!(
                ledger.withdraw(account, 5).await,
                Err(LedgerError::StorageFailure(_))
            ));
            ledger.storage().clear_fault(point);

            assert_eq!(ledger.balance(account).await.unwrap(), 100, "{point:?}");
            assert_eq!(ledger.storage().entry_count().await, entries, "{point:?}");
        }
    }

    #[tokio::test]
    async fn failed_lookup_is_not_a_missing_account() {
        let ledger = ledger();
        let account = funded(&ledger, 0).await;
        ledger.storage().fail_at(FailPoint::AccountExists);

        assert!(matches!(
            ledger.deposit(account, 1).await,
            Err(LedgerError::StorageFailure(_))
        ));
        assert!(matches!(
            ledger.history(account).await,
            Err(LedgerError::StorageFailure(_))
        ));
    }

    #[tokio::test]
    async fn failed_account_insert_returns_nothing() {
        let ledger = ledger();
        ledger.storage().fail_at(FailPoint::InsertAccount);
        assert!(matches!(
            ledger.create_account(OwnerId::new()).await,
            Err(LedgerError::StorageFailure(_))
        ));
    }

    #[tokio::test]
    async fn every_entry_id_is_fresh() {
        let ledger = ledger();
        let a = funded(&ledger, 0).await;
        let b = funded(&ledger, 0).await;

        let mut ids = HashSet::new();
        for _ in 0..10 {
            assert!(ids.insert(ledger.deposit(a, 10).await.unwrap()));
            assert!(ids.insert(ledger.withdraw(a, 3).await.unwrap()));
            assert!(ids.insert(ledger.transfer(a, b, 2).await.unwrap()));
        }
        assert_eq!(ids.len(), 30);
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let clock = ManualClock::new(Utc::now(), chrono::Duration::seconds(1));
        let ledger = Ledger::with_clock(MemoryStorage::new(), Arc::new(clock));
        let a = funded(&ledger, 100).await;
        let b = funded(&ledger, 0).await;
        ledger.withdraw(a, 10).await.unwrap();
        ledger.transfer(a, b, 20).await.unwrap();

        let history = ledger.history(a).await.unwrap();
        let kinds: Vec<_> = history.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [EntryKind::Transfer, EntryKind::Withdrawal, EntryKind::Deposit]
        );
        assert!(history.windows(2).all(|w| w[0].created_at > w[1].created_at));
        let balance: i64 = history.iter().map(|e| e.delta_for(a)).sum();
        assert_eq!(balance, ledger.balance(a).await.unwrap());
    }

    #[tokio::test]
    async fn history_ties_come_back_newest_insert_first() {
        let at = Utc::now();
        let ledger = Ledger::with_clock(MemoryStorage::new(), Arc::new(ManualClock::frozen(at)));
        let account = funded(&ledger, 0).await;
        let first = ledger.deposit(account, 10).await.unwrap();
        let second = ledger.deposit(account, 20).await.unwrap();
        let third = ledger.withdraw(account, 5).await.unwrap();

        let history = ledger.history(account).await.unwrap();
        assert!(history.iter().all(|e| e.created_at == at));
        let ids: Vec<_> = history.iter().map(|e| e.id).collect();
        assert_eq!(ids, [third, second, first]);
        assert_eq!(ledger.balance(account).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn corrupted_row_fails_the_whole_history() {
        let ledger = ledger();
        let account = funded(&ledger, 100).await;
        ledger
            .storage()
            .insert_record(EntryRecord {
                id: Some(uuid::Uuid::new_v4()),
                destination: Some(account.as_uuid()),
                amount: Some(5),
                created_at: Some(Utc::now()),
                ..EntryRecord::default()
            })
            .await;

        let err = ledger.history(account).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::DataIntegrityFailure(EntryDecodeError::MissingField { column: "kind" })
        ));
        assert!(!err.is_client_error());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_withdrawals_never_overdraw() {
        let ledger = ledger();
        let account = funded(&ledger, 100).await;

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.withdraw(account, 30).await })
            })
            .collect();
        let mut succeeded = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(err) => assert!(matches!(err, LedgerError::InsufficientFunds { .. })),
            }
        }

        assert_eq!(succeeded, 3);
        assert_eq!(ledger.balance(account).await.unwrap(), 10);
        assert_eq!(ledger.history(account).await.unwrap().len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn opposite_transfers_complete() {
        let ledger = ledger();
        let a = funded(&ledger, 1000).await;
        let b = funded(&ledger, 1000).await;

        let tasks: Vec<_> = (0..50)
            .flat_map(|_| [(a, b), (b, a)])
            .map(|(from, to)| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.transfer(from, to, 10).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(ledger.balance(a).await.unwrap(), 1000);
        assert_eq!(ledger.balance(b).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn cancelled_deposit_commits_nothing() {
        let ledger = ledger();
        let account = funded(&ledger, 0).await;

        ledger.storage().stall_at(FailPoint::Commit);
        let outcome =
            tokio::time::timeout(Duration::from_millis(50), ledger.deposit(account, 10)).await;
        assert!(outcome.is_err());
        ledger.storage().clear_fault(FailPoint::Commit);

        assert_eq!(ledger.balance(account).await.unwrap(), 0);
        assert_eq!(ledger.storage().entry_count().await, 0);
        // the dropped transaction released the store
        ledger.deposit(account, 10).await.unwrap();
        assert_eq!(ledger.balance(account).await.unwrap(), 10);
    }

    #[test]
    fn client_errors_are_classified() {
        assert!(LedgerError::InvalidAmount(0).is_client_error());
        assert!(LedgerError::SameAccountTransfer.is_client_error());
        assert!(
            LedgerError::InsufficientFunds {
                balance: 1,
                requested: 2
            }
            .is_client_error()
        );
        assert!(!LedgerError::StorageFailure(StorageError::Constraint("x".into())).is_client_error());
    }
}
