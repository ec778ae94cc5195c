//! Batch transport: reads ledger commands from CSV, runs them against a [`Ledger`] and prints
//! the resulting accounts. Kept in the library so integration tests can drive it.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    io::{Read, Write},
};

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::{
    account::{Account, AccountId},
    amount::to_major_units,
    command::{CommandError, LedgerCommand},
    ledger::{Ledger, LedgerError},
    storage::Storage,
};
use csv_parser::CsvCommandParser;
use csv_printer::{AccountRow, HistoryRow, print_rows};

pub mod csv_parser;
pub mod csv_printer;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Malformed row: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub struct Service<'w, S, R, W: 'w> {
    pub ledger: Ledger<S>,
    pub input: R,
    pub output: &'w mut W,
    /// Minor-unit exponent of the CSV amounts.
    pub exponent: u32,
    pub with_history: bool,
    pub error_printer: Box<dyn FnMut(u64, BatchError)>,
}

impl<'w, S, R, W> Service<'w, S, R, W>
where
    S: Storage,
    R: Read,
    W: Write + 'w,
{
    pub async fn run(mut self) -> Result<()> {
        let parser = CsvCommandParser::new(self.input);
        let mut accounts: BTreeMap<String, Account> = BTreeMap::new();
        let mut processed = 0usize;

        for (line, row) in parser {
            let outcome = match row {
                Ok(row) => {
                    let command = LedgerCommand::parse_command(
                        row.kind,
                        &row.account,
                        row.counterparty.as_deref(),
                        row.amount,
                        row.owner,
                        self.exponent,
                    );
                    match command {
                        Ok(command) => apply(&self.ledger, &mut accounts, command).await,
                        Err(err) => Err(err.into()),
                    }
                }
                Err(err) => Err(err.into()),
            };
            match outcome {
                Ok(()) => processed += 1,
                Err(err) => (self.error_printer)(line, err),
            }
        }
        info!(processed, accounts = accounts.len(), "batch applied");

        let mut rows = Vec::with_capacity(accounts.len());
        for (label, account) in &accounts {
            let balance = self.ledger.balance(account.id).await?;
            rows.push(AccountRow {
                account: label.clone(),
                id: account.id,
                owner: account.owner,
                balance: to_major_units(balance, self.exponent),
            });
        }
        print_rows(self.output, rows.into_iter())?;

        if self.with_history {
            let mut rows = Vec::new();
            for (label, account) in &accounts {
                for entry in self.ledger.history(account.id).await? {
                    rows.push(HistoryRow {
                        account: label.clone(),
                        entry: entry.id,
                        kind: entry.kind,
                        source: entry.source,
                        destination: entry.destination,
                        amount: to_major_units(entry.amount.get(), self.exponent),
                        created_at: entry.created_at,
                    });
                }
            }
            // blank line between the two tables
            writeln!(self.output)?;
            print_rows(self.output, rows.into_iter())?;
        }
        Ok(())
    }
}

async fn apply<S: Storage>(
    ledger: &Ledger<S>,
    accounts: &mut BTreeMap<String, Account>,
    command: LedgerCommand,
) -> Result<(), BatchError> {
    // labels never created resolve to fresh ids so the ledger reports them as missing
    let resolve = |accounts: &BTreeMap<String, Account>, label: &str| {
        accounts
            .get(label)
            .map_or_else(AccountId::new, |account| account.id)
    };

    match command {
        LedgerCommand::Create { label, owner } => {
            let slot = match accounts.entry(label) {
                Entry::Vacant(slot) => slot,
                Entry::Occupied(taken) => {
                    return Err(CommandError::DuplicateAccount {
                        label: taken.key().clone(),
                    }
                    .into());
                }
            };
            let account = ledger.create_account(owner).await?;
            slot.insert(account);
        }
        LedgerCommand::Deposit { label, amount } => {
            let entry = ledger.deposit(resolve(accounts, &label), amount).await?;
            debug!(%label, %entry, "deposit applied");
        }
        LedgerCommand::Withdraw { label, amount } => {
            let entry = ledger.withdraw(resolve(accounts, &label), amount).await?;
            debug!(%label, %entry, "withdrawal applied");
        }
        LedgerCommand::Transfer { from, to, amount } => {
            // one id per distinct label, so a self-transfer stays one even when unknown
            let source = resolve(accounts, &from);
            let destination = if to == from {
                source
            } else {
                resolve(accounts, &to)
            };
            let entry = ledger.transfer(source, destination, amount).await?;
            debug!(%from, %to, %entry, "transfer applied");
        }
    }
    Ok(())
}

/// Installs the global tracing subscriber, writing to stderr.
///
/// `RUST_LOG` takes precedence over `default_filter`.
pub fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))
}
