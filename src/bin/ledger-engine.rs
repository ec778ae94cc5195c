use std::{fs::File, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use ledger_engine::{
    bin_utils::{BatchError, Service, init_tracing},
    config::{Backend, LedgerConfig},
    ledger::Ledger,
    storage::{Storage, memory::MemoryStorage},
};
use tracing::info;

/// Applies a CSV batch of ledger commands and prints the resulting balances.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file, layered over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Also print every account's entries, newest first.
    #[arg(long)]
    history: bool,
    /// CSV file with `type,account,counterparty,amount,owner` columns.
    file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = LedgerConfig::load(args.config.as_deref()).context("Failed to load config")?;
    config.validate().context("Invalid config")?;
    init_tracing(&config.log.filter)?;

    let file = File::open(&args.file)
        .with_context(|| format!("Failed to open `{}`", args.file.display()))?;
    info!(backend = ?config.storage.backend, file = %args.file.display(), "starting batch");

    match config.storage.backend {
        Backend::Memory => run(Ledger::new(MemoryStorage::new()), file, &config, args.history).await,
        #[cfg(feature = "postgres")]
        Backend::Postgres => {
            let storage =
                ledger_engine::storage::postgres::PostgresStorage::connect(&config.storage)
                    .await
                    .context("Failed to connect to postgres")?;
            if config.storage.apply_schema {
                storage.apply_schema().await.context("Failed to apply schema")?;
            }
            run(Ledger::new(storage), file, &config, args.history).await
        }
        #[cfg(not(feature = "postgres"))]
        Backend::Postgres => {
            anyhow::bail!("postgres backend requested but the `postgres` feature is not enabled")
        }
    }
}

async fn run<S: Storage>(
    ledger: Ledger<S>,
    input: File,
    config: &LedgerConfig,
    with_history: bool,
) -> Result<()> {
    let service = Service {
        ledger,
        input,
        output: &mut std::io::stdout(),
        exponent: config.currency.exponent,
        with_history,
        error_printer: Box::new(|line, err| match err {
            BatchError::Ledger(err) if err.is_client_error() => {
                eprintln!("Rejected at line {line}: {err}")
            }
            err => eprintln!("Error at line {line}: {err}"),
        }),
    };
    service.run().await
}
