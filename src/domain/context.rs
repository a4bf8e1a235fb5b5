use super::attempt::{PluginProperty, find_property};
use super::money::Currency;
use super::payment::{Payment, PaymentTransaction, TransactionType};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Request and response state threaded through the control plugin pipeline.
///
/// The context is an immutable value: every phase receives it by reference
/// and the runner derives the next context from the adjustments a plugin
/// returns. It is owned by a single in-flight operation and dropped when the
/// state machine returns.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentControlContext {
    pub account_id: Uuid,
    pub payment_method_id: Option<Uuid>,
    pub attempt_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub payment_external_key: String,
    pub transaction_id: Option<Uuid>,
    pub transaction_external_key: String,
    pub transaction_type: TransactionType,
    pub amount: Option<Decimal>,
    pub currency: Option<Currency>,
    pub processed_amount: Option<Decimal>,
    pub processed_currency: Option<Currency>,
    pub properties: Vec<PluginProperty>,
    pub is_api_payment: bool,
}

impl PaymentControlContext {
    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        find_property(&self.properties, key)
    }

    /// Returns the context as seen after the processor answered: ids are
    /// bound and processed amounts reflect what the gateway charged.
    pub fn with_processor_result(
        &self,
        payment: &Payment,
        transaction: &PaymentTransaction,
    ) -> Self {
        Self {
            payment_id: Some(payment.id),
            payment_external_key: payment.external_key.clone(),
            payment_method_id: payment.payment_method_id.or(self.payment_method_id),
            transaction_id: Some(transaction.id),
            transaction_external_key: transaction.external_key.clone(),
            processed_amount: transaction.processed_amount,
            processed_currency: transaction.processed_currency,
            ..self.clone()
        }
    }
}
