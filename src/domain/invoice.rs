use super::money::Currency;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Committed,
    Void,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Invoice {
    pub id: Uuid,
    pub account_id: Uuid,
    pub status: InvoiceStatus,
    pub currency: Currency,
    pub balance: Decimal,
}

impl Invoice {
    /// A committed invoice with a fresh id.
    pub fn committed(account_id: Uuid, currency: Currency, balance: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            status: InvoiceStatus::Committed,
            currency,
            balance,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoicePaymentKind {
    Attempt,
    Refund,
    Chargeback,
    ChargebackReversal,
}

/// Status of an invoice-payment link.
///
/// `Init` rows are the two-phase commit guard: written before the gateway
/// call and completed once the outcome is known.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoicePaymentStatus {
    Init,
    Pending,
    Success,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct InvoicePayment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub transaction_external_key: String,
    pub kind: InvoicePaymentKind,
    pub amount: Decimal,
    pub currency: Currency,
    pub processed_currency: Option<Currency>,
    pub status: InvoicePaymentStatus,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
}

impl InvoicePayment {
    pub fn is_success(&self) -> bool {
        self.status == InvoicePaymentStatus::Success
    }
}

/// Completion notice sent to the invoice subsystem once a purchase outcome
/// is known (or to unblock waiters with a zero amount on failure).
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentCompletion {
    pub invoice_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub transaction_external_key: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub processed_currency: Option<Currency>,
    pub status: InvoicePaymentStatus,
    pub payment_date: DateTime<Utc>,
}

/// A purchase parked because the account had payment collection suspended.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct AutoPayOffEntry {
    pub account_id: Uuid,
    pub attempt_id: Uuid,
    pub payment_external_key: String,
    pub transaction_external_key: String,
    pub payment_method_id: Option<Uuid>,
    pub amount: Option<Decimal>,
    pub currency: Option<Currency>,
    pub plugin_name: String,
    pub created_date: DateTime<Utc>,
}
