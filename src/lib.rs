/// Account identity and the account record owned by one holder.
pub mod account;

/// Positive minor-unit amounts and decimal conversion for the outer surfaces.
pub mod amount;

/// Immutable ledger entries, and decoding of raw stored rows into them.
pub mod entry;

/// Time source for entry timestamps, swappable in tests.
pub mod clock;

/// Storage gateway traits, plus an in-memory store and an optional Postgres one.
/// All atomicity and locking is delegated to the store's transactions.
pub mod storage;

/// Existence checks on accounts.
pub mod directory;

/// The transaction engine: deposits, withdrawals, transfers and their queries.
pub mod ledger;

/// Layered runtime configuration.
pub mod config;

/// Batch commands that are later executed by [`ledger`].
pub mod command;

/// Ideally, this module should exist in its own crate, as a way to bootstrap
/// the core logic. However, integration tests drive it too, so it lives here.
pub mod bin_utils;
