use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::Writer;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::{
    account::{AccountId, OwnerId},
    entry::{EntryId, EntryKind},
};

#[derive(Debug, Serialize)]
pub struct AccountRow {
    pub account: String,
    pub id: AccountId,
    pub owner: OwnerId,
    pub balance: Decimal,
}

#[derive(Debug, Serialize)]
pub struct HistoryRow {
    pub account: String,
    pub entry: EntryId,
    pub kind: EntryKind,
    pub source: Option<AccountId>,
    pub destination: Option<AccountId>,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Writes `rows` as CSV with a header taken from the first row's field names.
pub fn print_rows<W, T>(output: &mut W, rows: impl Iterator<Item = T>) -> Result<()>
where
    W: Write,
    T: Serialize,
{
    let mut writer = Writer::from_writer(output);
    for row in rows {
        writer.serialize(row).context("Failed to write CSV row")?;
    }
    writer.flush().context("Failed to flush CSV output")
}
