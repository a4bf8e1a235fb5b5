use crate::error::{PaymentError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

/// One output line per executed operation.
#[derive(Debug, Serialize, PartialEq, Clone)]
pub struct OutcomeRecord {
    pub account: u32,
    pub invoice: Option<u32>,
    #[serde(rename = "type")]
    pub operation: String,
    pub state: String,
    pub status: Option<String>,
    pub amount: Option<Decimal>,
    #[serde(serialize_with = "serialize_retry")]
    pub retry: Option<DateTime<Utc>>,
}

fn serialize_retry<S: serde::Serializer>(
    retry: &Option<DateTime<Utc>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match retry {
        Some(when) => serializer.serialize_str(&when.to_rfc3339_opts(SecondsFormat::Secs, true)),
        None => serializer.serialize_none(),
    }
}

/// Writes outcome records as CSV with a header line.
pub struct OutcomeWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> OutcomeWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write(&mut self, record: &OutcomeRecord) -> Result<()> {
        self.writer.serialize(record)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(PaymentError::from)
    }
}
