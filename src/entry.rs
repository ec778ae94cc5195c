use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    account::{AccountId, uuid_id},
    amount::Amount,
};

uuid_id!(
    /// Identifier of a ledger entry, issued once per committed operation.
    EntryId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Deposit,
    Withdrawal,
    Transfer,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Deposit => "deposit",
            EntryKind::Withdrawal => "withdrawal",
            EntryKind::Transfer => "transfer",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown entry kind `{0}`")]
pub struct UnknownEntryKind(pub String);

impl FromStr for EntryKind {
    type Err = UnknownEntryKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(EntryKind::Deposit),
            "withdrawal" => Ok(EntryKind::Withdrawal),
            "transfer" => Ok(EntryKind::Transfer),
            other => Err(UnknownEntryKind(other.to_string())),
        }
    }
}

/// Immutable history record of one balance-affecting operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    /// Debited account; `None` for deposits.
    pub source: Option<AccountId>,
    /// Credited account; `None` for withdrawals.
    pub destination: Option<AccountId>,
    pub amount: Amount,
    pub kind: EntryKind,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn deposit(destination: AccountId, amount: Amount, created_at: DateTime<Utc>) -> Self {
        Self {
            id: EntryId::new(),
            source: None,
            destination: Some(destination),
            amount,
            kind: EntryKind::Deposit,
            created_at,
        }
    }

    pub fn withdrawal(source: AccountId, amount: Amount, created_at: DateTime<Utc>) -> Self {
        Self {
            id: EntryId::new(),
            source: Some(source),
            destination: None,
            amount,
            kind: EntryKind::Withdrawal,
            created_at,
        }
    }

    pub fn transfer(
        source: AccountId,
        destination: AccountId,
        amount: Amount,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntryId::new(),
            source: Some(source),
            destination: Some(destination),
            amount,
            kind: EntryKind::Transfer,
            created_at,
        }
    }

    /// Balance change this entry implies for `account`.
    pub fn delta_for(&self, account: AccountId) -> i64 {
        let mut delta = 0;
        if self.source == Some(account) {
            delta -= self.amount.get();
        }
        if self.destination == Some(account) {
            delta += self.amount.get();
        }
        delta
    }
}

/// Entry row as it comes out of storage, before any validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryRecord {
    pub id: Option<Uuid>,
    pub source: Option<Uuid>,
    pub destination: Option<Uuid>,
    pub amount: Option<i64>,
    pub kind: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntryDecodeError {
    #[error("Ledger entry is missing `{column}`")]
    MissingField { column: &'static str },
    #[error("Ledger entry {id} has unknown kind `{kind}`")]
    UnknownKind { id: Uuid, kind: String },
    #[error("Ledger entry {id} has non-positive amount {amount}")]
    InvalidAmount { id: Uuid, amount: i64 },
    #[error("Ledger entry {id} of kind {kind} has inconsistent source and destination")]
    InconsistentAccounts { id: Uuid, kind: EntryKind },
}

impl From<&LedgerEntry> for EntryRecord {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            id: Some(entry.id.as_uuid()),
            source: entry.source.map(|id| id.as_uuid()),
            destination: entry.destination.map(|id| id.as_uuid()),
            amount: Some(entry.amount.get()),
            kind: Some(entry.kind.as_str().to_string()),
            created_at: Some(entry.created_at),
        }
    }
}

impl TryFrom<EntryRecord> for LedgerEntry {
    type Error = EntryDecodeError;

    fn try_from(record: EntryRecord) -> Result<Self, Self::Error> {
        let missing = |column| EntryDecodeError::MissingField { column };
        let id = record.id.ok_or_else(|| missing("id"))?;
        let raw_kind = record.kind.ok_or_else(|| missing("kind"))?;
        let kind = raw_kind
            .parse::<EntryKind>()
            .map_err(|UnknownEntryKind(kind)| EntryDecodeError::UnknownKind { id, kind })?;
        let raw_amount = record.amount.ok_or_else(|| missing("amount"))?;
        let amount = Amount::try_from(raw_amount).map_err(|_| EntryDecodeError::InvalidAmount {
            id,
            amount: raw_amount,
        })?;
        let created_at = record.created_at.ok_or_else(|| missing("created_at"))?;

        let source = record.source.map(AccountId::from);
        let destination = record.destination.map(AccountId::from);
        let consistent = match kind {
            EntryKind::Deposit => source.is_none() && destination.is_some(),
            EntryKind::Withdrawal => source.is_some() && destination.is_none(),
            EntryKind::Transfer => {
                source.is_some() && destination.is_some() && source != destination
            }
        };
        if !consistent {
            return Err(EntryDecodeError::InconsistentAccounts { id, kind });
        }

        Ok(Self {
            id: EntryId::from(id),
            source,
            destination,
            amount,
            kind,
            created_at,
        })
    }
}
