use std::io::Read;

use crate::{account::OwnerId, command::CommandKind};
use csv::{DeserializeRecordsIntoIter, ReaderBuilder, Trim};
use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct CommandRow {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub account: String,
    pub counterparty: Option<String>,
    pub amount: Option<Decimal>,
    pub owner: Option<OwnerId>,
}

/// Reads ledger commands in CSV format, yielding each row with its line number.
pub struct CsvCommandParser<R> {
    iter: DeserializeRecordsIntoIter<R, CommandRow>,
}

impl<R> CsvCommandParser<R>
where
    R: Read,
{
    /// Fields are trimmed and trailing empty columns may be left out.
    pub fn new(source: R) -> Self {
        let iter = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(source)
            .into_deserialize();
        Self { iter }
    }
}

impl<R> Iterator for CsvCommandParser<R>
where
    R: Read,
{
    type Item = (u64, Result<CommandRow, csv::Error>);

    fn next(&mut self) -> Option<Self::Item> {
        let curr_line = self.iter.reader().position().line();
        let row = self.iter.next()?;
        let line = match &row {
            Err(err) => err.position().map_or(curr_line, |pos| pos.line()),
            Ok(_) => curr_line,
        };
        Some((line, row))
    }
}
