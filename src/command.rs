use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    account::OwnerId,
    amount::{AmountError, to_minor_units},
};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Create,
    Deposit,
    Withdraw,
    Transfer,
}

/// Ledger operation addressed by batch-local account labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCommand {
    Create {
        label: String,
        owner: OwnerId,
    },
    Deposit {
        label: String,
        amount: i64,
    },
    Withdraw {
        label: String,
        amount: i64,
    },
    Transfer {
        from: String,
        to: String,
        amount: i64,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Account label is required for {kind:?}")]
    LabelRequired { kind: CommandKind },
    #[error("Amount is required for {kind:?}")]
    AmountRequired { kind: CommandKind },
    #[error("Counterparty is required for {kind:?}")]
    CounterpartyRequired { kind: CommandKind },
    #[error("Account `{label}` was already created")]
    DuplicateAccount { label: String },
    #[error(transparent)]
    Amount(#[from] AmountError),
}

impl LedgerCommand {
    /// Builds a command from raw row fields, converting decimal amounts with `exponent`.
    ///
    /// Only the shape of the row is checked here; non-positive amounts are left for the
    /// ledger to reject.
    pub fn parse_command(
        kind: CommandKind,
        account: &str,
        counterparty: Option<&str>,
        amount: Option<Decimal>,
        owner: Option<OwnerId>,
        exponent: u32,
    ) -> Result<Self, CommandError> {
        let label = account.trim();
        if label.is_empty() {
            return Err(CommandError::LabelRequired { kind });
        }
        let label = label.to_string();
        let minor_units = || -> Result<i64, CommandError> {
            let value = amount.ok_or(CommandError::AmountRequired { kind })?;
            Ok(to_minor_units(value, exponent)?)
        };

        match kind {
            CommandKind::Create => Ok(Self::Create {
                label,
                owner: owner.unwrap_or_default(),
            }),
            CommandKind::Deposit => Ok(Self::Deposit {
                label,
                amount: minor_units()?,
            }),
            CommandKind::Withdraw => Ok(Self::Withdraw {
                label,
                amount: minor_units()?,
            }),
            CommandKind::Transfer => {
                let to = counterparty
                    .map(str::trim)
                    .filter(|to| !to.is_empty())
                    .ok_or(CommandError::CounterpartyRequired { kind })?;
                Ok(Self::Transfer {
                    from: label,
                    to: to.to_string(),
                    amount: minor_units()?,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn dec(s: &str) -> Option<Decimal> {
        Some(Decimal::from_str(s).unwrap())
    }

    #[test]
    fn parses_each_kind() {
        let owner = OwnerId::new();
        assert_eq!(
            LedgerCommand::parse_command(CommandKind::Create, "alice", None, None, Some(owner), 2),
            Ok(LedgerCommand::Create {
                label: "alice".to_string(),
                owner
            })
        );
        assert_eq!(
            LedgerCommand::parse_command(CommandKind::Deposit, " alice ", None, dec("1.5"), None, 2),
            Ok(LedgerCommand::Deposit {
                label: "alice".to_string(),
                amount: 150
            })
        );
        assert_eq!(
            LedgerCommand::parse_command(
                CommandKind::Transfer,
                "alice",
                Some("bob"),
                dec("2"),
                None,
                2
            ),
            Ok(LedgerCommand::Transfer {
                from: "alice".to_string(),
                to: "bob".to_string(),
                amount: 200
            })
        );
    }

    #[test]
    fn negative_amounts_pass_through() {
        assert_eq!(
            LedgerCommand::parse_command(CommandKind::Withdraw, "a", None, dec("-1"), None, 2),
            Ok(LedgerCommand::Withdraw {
                label: "a".to_string(),
                amount: -100
            })
        );
    }

    #[test]
    fn incomplete_rows_are_rejected() {
        assert_eq!(
            LedgerCommand::parse_command(CommandKind::Deposit, "a", None, None, None, 2),
            Err(CommandError::AmountRequired {
                kind: CommandKind::Deposit
            })
        );
        assert_eq!(
            LedgerCommand::parse_command(CommandKind::Transfer, "a", Some(" "), dec("1"), None, 2),
            Err(CommandError::CounterpartyRequired {
                kind: CommandKind::Transfer
            })
        );
        assert_eq!(
            LedgerCommand::parse_command(CommandKind::Create, "", None, None, None, 2),
            Err(CommandError::LabelRequired {
                kind: CommandKind::Create
            })
        );
        assert!(matches!(
            LedgerCommand::parse_command(CommandKind::Deposit, "a", None, dec("0.001"), None, 2),
            Err(CommandError::Amount(AmountError::TooPrecise { .. }))
        ));
    }
}
