//! Control plugins: named hooks that may veto, adjust or react to a payment
//! operation, the registry that resolves them, and the runner that folds
//! their results.

pub mod registry;
pub mod runner;

use crate::domain::attempt::PluginProperty;
use crate::domain::context::PaymentControlContext;
use crate::domain::money::Currency;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// What a plugin asks for before the payment operation runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorCallResult {
    pub is_aborted: bool,
    pub adjusted_amount: Option<Decimal>,
    pub adjusted_currency: Option<Currency>,
    pub adjusted_payment_method_id: Option<Uuid>,
    pub adjusted_properties: Option<Vec<PluginProperty>>,
}

impl PriorCallResult {
    pub fn proceed() -> Self {
        Self::default()
    }

    pub fn abort() -> Self {
        Self {
            is_aborted: true,
            ..Self::default()
        }
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.adjusted_amount = Some(amount);
        self
    }

    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.adjusted_currency = Some(currency);
        self
    }

    pub fn with_payment_method(mut self, payment_method_id: Uuid) -> Self {
        self.adjusted_payment_method_id = Some(payment_method_id);
        self
    }

    pub fn with_properties(mut self, properties: Vec<PluginProperty>) -> Self {
        self.adjusted_properties = Some(properties);
        self
    }

    /// Derives the context the next plugin in the chain receives.
    pub fn apply(&self, context: PaymentControlContext) -> PaymentControlContext {
        PaymentControlContext {
            amount: self.adjusted_amount.or(context.amount),
            currency: self.adjusted_currency.or(context.currency),
            payment_method_id: self.adjusted_payment_method_id.or(context.payment_method_id),
            properties: self
                .adjusted_properties
                .clone()
                .unwrap_or(context.properties.clone()),
            ..context
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OnSuccessResult {
    pub adjusted_properties: Option<Vec<PluginProperty>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OnFailureResult {
    pub next_retry_date: Option<DateTime<Utc>>,
    pub adjusted_properties: Option<Vec<PluginProperty>>,
}

impl OnFailureResult {
    pub fn retry_at(when: DateTime<Utc>) -> Self {
        Self {
            next_retry_date: Some(when),
            adjusted_properties: None,
        }
    }
}

/// The fixed capability set of a control plugin.
///
/// Every hook defaults to a no-op so plugins only implement the phases they
/// care about.
#[async_trait]
pub trait PaymentControlPlugin: Send + Sync {
    async fn prior_call(&self, _context: &PaymentControlContext) -> Result<PriorCallResult> {
        Ok(PriorCallResult::proceed())
    }

    async fn on_success_call(&self, _context: &PaymentControlContext) -> Result<OnSuccessResult> {
        Ok(OnSuccessResult::default())
    }

    async fn on_failure_call(&self, _context: &PaymentControlContext) -> Result<OnFailureResult> {
        Ok(OnFailureResult::default())
    }
}
