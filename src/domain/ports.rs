use super::account::{Account, ControlTag};
use super::attempt::{AttemptState, PaymentAttempt, PluginProperty};
use super::invoice::{AutoPayOffEntry, Invoice, InvoicePayment, PaymentCompletion};
use super::money::Currency;
use super::payment::{Payment, PaymentTransaction, TransactionCompletion, TransactionType};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Data-access contract of the attempt ledger.
///
/// Implementations must make a row visible to reads issued later in the
/// same call chain, and serialize writes per row.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert_attempt(&self, attempt: PaymentAttempt) -> Result<()>;
    async fn update_attempt_state(
        &self,
        attempt_id: Uuid,
        state: AttemptState,
        transaction_id: Option<Uuid>,
        plugin_properties: Vec<u8>,
        updated_date: DateTime<Utc>,
    ) -> Result<()>;
    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<PaymentAttempt>>;
    async fn get_attempts_by_transaction_external_key(
        &self,
        transaction_external_key: &str,
    ) -> Result<Vec<PaymentAttempt>>;

    async fn insert_payment(&self, payment: Payment) -> Result<()>;
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>>;
    async fn get_payment_by_external_key(&self, external_key: &str) -> Result<Option<Payment>>;

    async fn insert_transaction(&self, transaction: PaymentTransaction) -> Result<()>;
    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<PaymentTransaction>>;
    /// Transactions sharing an external key, oldest first.
    async fn get_transactions_by_external_key(
        &self,
        external_key: &str,
    ) -> Result<Vec<PaymentTransaction>>;
    /// Transactions of a payment, oldest first.
    async fn get_transactions_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentTransaction>>;
    async fn update_payment_and_transaction_on_completion(
        &self,
        payment_id: Uuid,
        transaction_id: Uuid,
        completion: TransactionCompletion,
    ) -> Result<()>;

    async fn insert_auto_pay_off(&self, entry: AutoPayOffEntry) -> Result<()>;
    async fn get_auto_pay_off_entries(&self, account_id: Uuid) -> Result<Vec<AutoPayOffEntry>>;
}

/// Held for as long as the account is locked; dropping it releases the lock.
pub struct AccountLockGuard {
    account_id: Uuid,
    _handle: Box<dyn Send>,
}

impl AccountLockGuard {
    pub fn new(account_id: Uuid, handle: impl Send + 'static) -> Self {
        Self {
            account_id,
            _handle: Box::new(handle),
        }
    }

    pub fn account_id(&self) -> Uuid {
        self.account_id
    }
}

#[async_trait]
pub trait AccountLocker: Send + Sync {
    /// Fails with `PaymentError::LockTimeout` when not acquired in time.
    async fn lock(&self, account_id: Uuid, timeout: Duration) -> Result<AccountLockGuard>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryRequest {
    pub object_type: String,
    pub object_id: Uuid,
    pub attempt_id: Uuid,
    pub tenant_id: Uuid,
    pub plugin_names: Vec<String>,
    pub when: DateTime<Utc>,
}

/// Fire-and-forget retry scheduling; delivery is best effort.
#[async_trait]
pub trait RetryScheduler: Send + Sync {
    async fn schedule_retry(&self, request: RetryRequest) -> Result<()>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessorError {
    /// The gateway rejected the call in a way it reported cleanly.
    #[error("gateway declined the operation: {0}")]
    Declined(String),
    /// Anything the processor did not anticipate.
    #[error("unexpected gateway error: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorRequest {
    pub account_id: Uuid,
    pub attempt_id: Uuid,
    pub payment_method_id: Option<Uuid>,
    pub payment_id: Option<Uuid>,
    pub payment_external_key: String,
    pub transaction_id: Option<Uuid>,
    pub transaction_external_key: String,
    pub transaction_type: TransactionType,
    pub amount: Option<Decimal>,
    pub currency: Option<Currency>,
    pub properties: Vec<PluginProperty>,
    pub is_api_payment: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorResponse {
    pub payment: Payment,
    pub transaction: PaymentTransaction,
}

/// Executes the gateway-facing operation and records its transaction.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn purchase(&self, request: &ProcessorRequest)
    -> std::result::Result<ProcessorResponse, ProcessorError>;
    async fn refund(&self, request: &ProcessorRequest)
    -> std::result::Result<ProcessorResponse, ProcessorError>;
    async fn chargeback(&self, request: &ProcessorRequest)
    -> std::result::Result<ProcessorResponse, ProcessorError>;
    async fn credit(&self, request: &ProcessorRequest)
    -> std::result::Result<ProcessorResponse, ProcessorError>;
}

#[async_trait]
pub trait InvoiceApi: Send + Sync {
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>>;
    async fn get_invoice_payments(&self, invoice_id: Uuid) -> Result<Vec<InvoicePayment>>;
    async fn get_invoice_payments_by_payment(&self, payment_id: Uuid)
    -> Result<Vec<InvoicePayment>>;
    /// Writes the non-terminal two-phase commit row for a purchase.
    async fn record_payment_attempt_init(
        &self,
        invoice_id: Uuid,
        amount: Decimal,
        currency: Currency,
        payment_id: Option<Uuid>,
        transaction_external_key: &str,
        date: DateTime<Utc>,
    ) -> Result<()>;
    async fn record_payment_attempt_completion(&self, completion: PaymentCompletion) -> Result<()>;
    /// Records a refund, chargeback or chargeback reversal link.
    async fn insert_invoice_payment(&self, invoice_payment: InvoicePayment) -> Result<()>;
}

#[async_trait]
pub trait AccountApi: Send + Sync {
    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>>;
}

#[async_trait]
pub trait TagApi: Send + Sync {
    async fn get_control_tags(&self, account_id: Uuid) -> Result<Vec<ControlTag>>;
}

pub type PaymentStoreRef = Arc<dyn PaymentStore>;
pub type AccountLockerRef = Arc<dyn AccountLocker>;
pub type RetrySchedulerRef = Arc<dyn RetryScheduler>;
pub type PaymentProcessorRef = Arc<dyn PaymentProcessor>;
pub type InvoiceApiRef = Arc<dyn InvoiceApi>;
pub type AccountApiRef = Arc<dyn AccountApi>;
pub type TagApiRef = Arc<dyn TagApi>;
