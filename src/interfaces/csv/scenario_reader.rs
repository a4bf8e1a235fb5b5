use crate::domain::money::Currency;
use crate::error::{PaymentError, Result};
use crate::infrastructure::simulated::SimulatedOutcome;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;
use std::io::Read;

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioAction {
    /// Issues a committed invoice; not an operation of its own.
    Invoice,
    Purchase,
    Refund,
    Chargeback,
    Credit,
}

impl fmt::Display for ScenarioAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invoice => "invoice",
            Self::Purchase => "purchase",
            Self::Refund => "refund",
            Self::Chargeback => "chargeback",
            Self::Credit => "credit",
        };
        f.write_str(name)
    }
}

/// One line of a scenario file. Accounts and invoices are referred to by
/// small numeric aliases.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ScenarioRow {
    #[serde(rename = "type")]
    pub action: ScenarioAction,
    pub account: u32,
    pub invoice: Option<u32>,
    pub amount: Option<Decimal>,
    pub currency: Option<Currency>,
    pub outcome: Option<SimulatedOutcome>,
}

/// Reads scenario rows from a CSV source.
///
/// Whitespace is trimmed and trailing columns may be omitted.
pub struct ScenarioReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ScenarioReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily reads and deserializes rows.
    pub fn rows(self) -> impl Iterator<Item = Result<ScenarioRow>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(PaymentError::from))
    }
}
