use super::money::Currency;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Authorize,
    Capture,
    Purchase,
    Void,
    Credit,
    Refund,
    Chargeback,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Authorize => "AUTHORIZE",
            Self::Capture => "CAPTURE",
            Self::Purchase => "PURCHASE",
            Self::Void => "VOID",
            Self::Credit => "CREDIT",
            Self::Refund => "REFUND",
            Self::Chargeback => "CHARGEBACK",
        };
        f.write_str(name)
    }
}

/// Outcome of a gateway-facing transaction.
///
/// `Pending` and `Unknown` are transient. `Unknown` is only ever closed by an
/// external reconciliation pass, never by an automated retry.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Success,
    Pending,
    PaymentFailure,
    PluginFailure,
    Unknown,
}

impl TransactionStatus {
    /// Statuses the control layer treats as a successful operation.
    pub fn is_success_or_pending(&self) -> bool {
        matches!(self, Self::Success | Self::Pending)
    }

    /// Statuses an interrupted attempt may resume from.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Pending | Self::Unknown)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::Pending => "PENDING",
            Self::PaymentFailure => "PAYMENT_FAILURE",
            Self::PluginFailure => "PLUGIN_FAILURE",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// A payment aggregates every transaction (purchase, refund, ...) made
/// against the same external key.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Payment {
    pub id: Uuid,
    pub account_id: Uuid,
    pub payment_method_id: Option<Uuid>,
    pub external_key: String,
    pub state_name: Option<String>,
    pub last_success_state_name: Option<String>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub payment_id: Uuid,
    /// `None` for transactions recorded outside of the control layer.
    pub attempt_id: Option<Uuid>,
    pub external_key: String,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: Option<Decimal>,
    pub currency: Option<Currency>,
    pub processed_amount: Option<Decimal>,
    pub processed_currency: Option<Currency>,
    pub gateway_error_code: Option<String>,
    pub gateway_error_msg: Option<String>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
}

/// Fields written when a gateway call completes.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionCompletion {
    pub payment_state_name: String,
    pub last_success_state_name: Option<String>,
    pub status: TransactionStatus,
    pub processed_amount: Option<Decimal>,
    pub processed_currency: Option<Currency>,
    pub gateway_error_code: Option<String>,
    pub gateway_error_msg: Option<String>,
    pub updated_date: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(TransactionStatus::Success.is_success_or_pending());
        assert!(TransactionStatus::Pending.is_success_or_pending());
        assert!(!TransactionStatus::Unknown.is_success_or_pending());
        assert!(TransactionStatus::Unknown.is_resumable());
        assert!(!TransactionStatus::PaymentFailure.is_resumable());
    }

    #[test]
    fn test_transaction_type_serde_matches_display() {
        let json = serde_json::to_string(&TransactionType::Chargeback).unwrap();
        assert_eq!(json, format!("\"{}\"", TransactionType::Chargeback));
        let status: TransactionStatus = serde_json::from_str("\"PLUGIN_FAILURE\"").unwrap();
        assert_eq!(status, TransactionStatus::PluginFailure);
    }
}
