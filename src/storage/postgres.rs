use std::time::Duration;

use async_trait::async_trait;
use sqlx::{
    PgPool, Postgres, Row, Transaction,
    postgres::{PgPoolOptions, PgRow},
};
use tracing::{debug, info, warn};

use crate::{
    account::{Account, AccountId},
    config::StorageConfig,
    entry::{EntryRecord, LedgerEntry},
};

use super::{IsolationLevel, Storage, StorageError, StorageTx};

const SCHEMA: &str = include_str!("../../schema/ledger.sql");

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Backend(Box::new(err))
    }
}

/// Gateway over a Postgres connection pool.
///
/// Every transaction pins its isolation level explicitly, and balance reads inside a
/// transaction take `FOR UPDATE` row locks.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    isolation: IsolationLevel,
}

impl PostgresStorage {
    pub async fn connect(config: &StorageConfig) -> Result<Self, StorageError> {
        let url = config.database_url.as_deref().ok_or_else(|| {
            StorageError::Constraint("storage.database_url is not set".to_string())
        })?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(url)
            .await?;
        info!(
            max_connections = config.max_connections,
            isolation = config.isolation.as_sql(),
            "connected to postgres"
        );
        Ok(Self::from_pool(pool, config.isolation))
    }

    pub fn from_pool(pool: PgPool, isolation: IsolationLevel) -> Self {
        Self { pool, isolation }
    }

    /// Creates the ledger tables and indexes when missing.
    pub async fn apply_schema(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("ledger schema applied");
        Ok(())
    }
}

/// Maps a ledger_entries row, leaving undecodable columns empty so that validation of the
/// record reports them as corrupted data.
fn entry_record(row: &PgRow) -> Result<EntryRecord, sqlx::Error> {
    Ok(EntryRecord {
        id: column(row, "id")?,
        source: column(row, "source_account")?,
        destination: column(row, "destination_account")?,
        amount: column(row, "amount")?,
        kind: column(row, "kind")?,
        created_at: column(row, "created_at")?,
    })
}

fn column<'r, T>(row: &'r PgRow, name: &'static str) -> Result<Option<T>, sqlx::Error>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    match row.try_get::<Option<T>, _>(name) {
        Ok(value) => Ok(value),
        Err(sqlx::Error::ColumnDecode { source, .. }) => {
            warn!(column = name, error = %source, "undecodable ledger entry column");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    type Tx = PostgresTx;

    async fn begin(&self) -> Result<PostgresTx, StorageError> {
        let mut tx = self.pool.begin().await?;
        let statement = format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            self.isolation.as_sql()
        );
        sqlx::query(&statement).execute(&mut *tx).await?;
        Ok(PostgresTx { tx })
    }

    async fn account_exists(&self, account: AccountId) -> Result<bool, StorageError> {
        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM accounts WHERE id = $1)")
                .bind(account.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn insert_account(&self, account: &Account) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO accounts (id, owner_id, balance) VALUES ($1, $2, $3)")
            .bind(account.id.as_uuid())
            .bind(account.owner.as_uuid())
            .bind(account.balance)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn balance(&self, account: AccountId) -> Result<Option<i64>, StorageError> {
        let balance = sqlx::query_scalar::<_, i64>("SELECT balance FROM accounts WHERE id = $1")
            .bind(account.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(balance)
    }

    async fn entries_for(&self, account: AccountId) -> Result<Vec<EntryRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_account, destination_account, amount, kind, created_at
            FROM ledger_entries
            WHERE source_account = $1 OR destination_account = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(account.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .iter()
            .map(entry_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StorageTx for PostgresTx {
    async fn lock_balance(&mut self, account: AccountId) -> Result<Option<i64>, StorageError> {
        let balance =
            sqlx::query_scalar::<_, i64>("SELECT balance FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(account.as_uuid())
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(balance)
    }

    async fn adjust_balance(
        &mut self,
        account: AccountId,
        delta: i64,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE accounts SET balance = balance + $1 WHERE id = $2")
            .bind(delta)
            .bind(account.as_uuid())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (id, source_account, destination_account, amount, kind, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.source.map(|id| id.as_uuid()))
        .bind(entry.destination.map(|id| id.as_uuid()))
        .bind(entry.amount.get())
        .bind(entry.kind.as_str())
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
