use std::{env, path::Path};

use config::{
    Config, ConfigError, Environment, File, FileFormat,
    builder::{ConfigBuilder, DefaultState},
};
use serde::Deserialize;

use crate::{amount::MAX_EXPONENT, storage::IsolationLevel};

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub storage: StorageConfig,
    pub currency: CurrencyConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: Backend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub isolation: IsolationLevel,
    /// Create missing tables on startup.
    pub apply_schema: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyConfig {
    /// Number of minor units per major unit, as a power of ten.
    pub exponent: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Default tracing filter, used when `RUST_LOG` is not set.
    pub filter: String,
}

impl LedgerConfig {
    /// Layers defaults, an optional TOML file and `LEDGER__*` environment variables.
    ///
    /// Without an explicit `path`, `LEDGER_CONFIG` may name the file. `DATABASE_URL`
    /// overrides `storage.database_url`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        } else if let Ok(path) = env::var("LEDGER_CONFIG") {
            builder = builder.add_source(File::with_name(&path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("LEDGER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        if let Ok(url) = env::var("DATABASE_URL") {
            builder = builder.set_override("storage.database_url", url)?;
        }

        builder.build()?.try_deserialize()
    }

    /// Defaults overlaid with an inline TOML document, ignoring the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.backend == Backend::Postgres
            && self.storage.database_url.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::Message(
                "storage.database_url is required for the postgres backend".to_string(),
            ));
        }
        if self.storage.max_connections == 0 {
            return Err(ConfigError::Message(
                "storage.max_connections must be at least 1".to_string(),
            ));
        }
        if self.currency.exponent > MAX_EXPONENT {
            return Err(ConfigError::Message(format!(
                "currency.exponent must not exceed {MAX_EXPONENT}"
            )));
        }
        Ok(())
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("storage.backend", "memory")?
            .set_default("storage.max_connections", 10)?
            .set_default("storage.acquire_timeout_secs", 5)?
            .set_default("storage.isolation", "read_committed")?
            .set_default("storage.apply_schema", true)?
            .set_default("currency.exponent", 2)?
            .set_default("log.filter", "info")
    }
}
