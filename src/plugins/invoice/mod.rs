//! The invoice payment control plugin.
//!
//! Links purchases to the invoice they pay, guards every gateway call with a
//! two-phase commit row on the invoice side, repairs links left incomplete
//! by a crash, and decides when failed invoice payments are retried.

pub mod repair;
pub mod retry;

use crate::application::control::{
    OnFailureResult, OnSuccessResult, PaymentControlPlugin, PriorCallResult,
};
use crate::config::InvoicePluginConfig;
use crate::domain::account::ControlTag;
use crate::domain::clock::ClockBox;
use crate::domain::context::PaymentControlContext;
use crate::domain::invoice::{
    AutoPayOffEntry, Invoice, InvoicePayment, InvoicePaymentKind, InvoicePaymentStatus,
    InvoiceStatus, PaymentCompletion,
};
use crate::domain::money::Currency;
use crate::domain::payment::{TransactionStatus, TransactionType};
use crate::domain::ports::{AccountApiRef, InvoiceApiRef, PaymentStoreRef, TagApiRef};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use repair::{RepairOutcome, repair_incomplete_payments};
use retry::RetryPolicy;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const INVOICE_PLUGIN_NAME: &str = "__INVOICE_PAYMENT_CONTROL_PLUGIN__";
/// Property carrying the id of the invoice a purchase pays.
pub const INVOICE_ID_PROPERTY: &str = "IPCD_INVOICE_ID";
/// Property letting an API-initiated purchase opt into automatic retries.
pub const RETRY_API_PAYMENT_PROPERTY: &str = "IPCD_RETRY_API_PAYMENT";

pub struct InvoicePaymentControlPlugin {
    config: InvoicePluginConfig,
    retry_policy: RetryPolicy,
    invoice_api: InvoiceApiRef,
    account_api: AccountApiRef,
    tag_api: TagApiRef,
    store: PaymentStoreRef,
    clock: ClockBox,
}

impl InvoicePaymentControlPlugin {
    pub fn new(
        config: InvoicePluginConfig,
        invoice_api: InvoiceApiRef,
        account_api: AccountApiRef,
        tag_api: TagApiRef,
        store: PaymentStoreRef,
        clock: ClockBox,
    ) -> Self {
        Self {
            retry_policy: RetryPolicy::new(&config),
            config,
            invoice_api,
            account_api,
            tag_api,
            store,
            clock,
        }
    }

    async fn prior_call_purchase(
        &self,
        context: &PaymentControlContext,
    ) -> Result<PriorCallResult> {
        let invoice_id = invoice_id(context)?;
        let Some(invoice) = self.invoice_api.get_invoice(invoice_id).await? else {
            warn!(invoice_id = %invoice_id, "Invoice not found, aborting payment");
            return Ok(PriorCallResult::abort());
        };
        if invoice.status != InvoiceStatus::Committed {
            info!(
                invoice_id = %invoice_id,
                status = ?invoice.status,
                "Invoice is not committed, aborting payment"
            );
            return Ok(PriorCallResult::abort());
        }

        let account = self
            .account_api
            .get_account(context.account_id)
            .await?
            .ok_or_else(|| {
                PaymentError::ValidationError(format!("account {} not found", context.account_id))
            })?;
        if account.delegates_payment() {
            info!(
                account_id = %account.id,
                "Account delegates payment to its parent, aborting payment"
            );
            return Ok(PriorCallResult::abort());
        }

        let now = self.clock.now();
        let invoice = match repair_incomplete_payments(
            self.invoice_api.as_ref(),
            self.store.as_ref(),
            &invoice,
            now,
        )
        .await?
        {
            RepairOutcome::Clean => invoice,
            RepairOutcome::UnknownTransaction => return Ok(PriorCallResult::abort()),
            RepairOutcome::Repaired(_) => match self.invoice_api.get_invoice(invoice_id).await? {
                Some(invoice) => invoice,
                None => return Ok(PriorCallResult::abort()),
            },
        };

        let Some(amount) = self.payment_amount(context, &invoice)? else {
            info!(
                invoice_id = %invoice.id,
                balance = %invoice.balance,
                "Nothing to pay, aborting payment"
            );
            return Ok(PriorCallResult::abort());
        };

        if !context.is_api_payment
            && self
                .tag_api
                .get_control_tags(context.account_id)
                .await?
                .contains(&ControlTag::AutoPayOff)
        {
            self.store
                .insert_auto_pay_off(AutoPayOffEntry {
                    account_id: context.account_id,
                    attempt_id: context.attempt_id,
                    payment_external_key: context.payment_external_key.clone(),
                    transaction_external_key: context.transaction_external_key.clone(),
                    payment_method_id: context.payment_method_id,
                    amount: Some(amount),
                    currency: Some(invoice.currency),
                    plugin_name: INVOICE_PLUGIN_NAME.to_string(),
                    created_date: now,
                })
                .await?;
            info!(account_id = %context.account_id, "Account is AUTO_PAY_OFF, parking payment");
            return Ok(PriorCallResult::abort());
        }

        let Some(payment_method_id) = context.payment_method_id.or(account.payment_method_id) else {
            info!(account_id = %context.account_id, "No payment method, aborting payment");
            self.invoice_api
                .record_payment_attempt_completion(PaymentCompletion {
                    invoice_id: invoice.id,
                    payment_id: context.payment_id,
                    transaction_external_key: context.transaction_external_key.clone(),
                    amount: Decimal::ZERO,
                    currency: invoice.currency,
                    processed_currency: None,
                    status: InvoicePaymentStatus::Init,
                    payment_date: now,
                })
                .await?;
            return Ok(PriorCallResult::abort());
        };

        self.invoice_api
            .record_payment_attempt_init(
                invoice.id,
                amount,
                invoice.currency,
                context.payment_id,
                &context.transaction_external_key,
                now,
            )
            .await?;

        Ok(PriorCallResult::proceed()
            .with_amount(amount)
            .with_currency(invoice.currency)
            .with_payment_method(payment_method_id))
    }

    /// `None` when there is nothing to pay.
    fn payment_amount(
        &self,
        context: &PaymentControlContext,
        invoice: &Invoice,
    ) -> Result<Option<Decimal>> {
        if let Some(currency) = context.currency
            && currency != invoice.currency
        {
            return Err(PaymentError::ValidationError(format!(
                "payment currency {} does not match invoice currency {}",
                currency, invoice.currency
            )));
        }

        if invoice.balance <= Decimal::ZERO {
            return Ok(self.config.allow_empty_invoice.then_some(Decimal::ZERO));
        }

        let amount = match context.amount {
            None => invoice.balance,
            Some(requested) if context.is_api_payment && requested > invoice.balance => {
                return Err(PaymentError::ValidationError(format!(
                    "payment amount {} exceeds invoice balance {}",
                    requested, invoice.balance
                )));
            }
            Some(requested) => requested.min(invoice.balance),
        };

        if amount.is_zero() && !self.config.allow_empty_invoice {
            return Ok(None);
        }
        Ok(Some(amount))
    }

    async fn prior_call_refund(&self, context: &PaymentControlContext) -> Result<PriorCallResult> {
        let payment_id = context.payment_id.ok_or_else(|| {
            PaymentError::ValidationError("refund requires a payment id".to_string())
        })?;
        let links = self.invoice_api.get_invoice_payments_by_payment(payment_id).await?;
        if !links
            .iter()
            .any(|l| l.kind == InvoicePaymentKind::Attempt && l.is_success())
        {
            info!(payment_id = %payment_id, "Payment did not pay an invoice, aborting refund");
            return Ok(PriorCallResult::abort());
        }

        let refundable = paid_amount(&links) - total(&links, InvoicePaymentKind::Refund);
        let amount = match context.amount {
            Some(requested) if requested > refundable => {
                return Err(PaymentError::ValidationError(format!(
                    "refund amount {} exceeds refundable amount {}",
                    requested, refundable
                )));
            }
            Some(requested) => requested,
            None => refundable,
        };
        Ok(PriorCallResult::proceed().with_amount(amount))
    }

    /// A chargeback is a fact reported by the gateway and is never vetoed.
    /// The CHARGEBACK link is written up front and reversed on failure.
    async fn prior_call_chargeback(
        &self,
        context: &PaymentControlContext,
    ) -> Result<PriorCallResult> {
        let payment_id = context.payment_id.ok_or_else(|| {
            PaymentError::ValidationError("chargeback requires a payment id".to_string())
        })?;
        let links = self.invoice_api.get_invoice_payments_by_payment(payment_id).await?;
        let amount = context.amount.unwrap_or_else(|| paid_amount(&links));

        if let Some(paid) = successful_attempt(&links) {
            let now = self.clock.now();
            self.invoice_api
                .insert_invoice_payment(InvoicePayment {
                    id: Uuid::new_v4(),
                    invoice_id: paid.invoice_id,
                    payment_id: Some(payment_id),
                    transaction_external_key: context.transaction_external_key.clone(),
                    kind: InvoicePaymentKind::Chargeback,
                    amount,
                    currency: context.currency.unwrap_or(paid.currency),
                    processed_currency: None,
                    status: InvoicePaymentStatus::Success,
                    created_date: now,
                    updated_date: now,
                })
                .await?;
        }
        Ok(PriorCallResult::proceed().with_amount(amount))
    }

    async fn on_success_purchase(&self, context: &PaymentControlContext) -> Result<()> {
        let invoice_id = invoice_id(context)?;
        let Some(payment_id) = context.payment_id else {
            return Ok(());
        };

        let links = self.invoice_api.get_invoice_payments_by_payment(payment_id).await?;
        if successful_attempt(&links).is_some() {
            debug!(payment_id = %payment_id, "Invoice payment already completed");
            return Ok(());
        }

        let status = match context.transaction_id {
            Some(id) => self.store.get_transaction(id).await?.map(|t| t.status),
            None => None,
        };
        let status = match status {
            Some(TransactionStatus::Success) => InvoicePaymentStatus::Success,
            Some(TransactionStatus::Pending) => InvoicePaymentStatus::Pending,
            _ => InvoicePaymentStatus::Init,
        };

        let amount = context
            .amount
            .or(context.processed_amount)
            .unwrap_or(Decimal::ZERO);
        self.invoice_api
            .record_payment_attempt_completion(PaymentCompletion {
                invoice_id,
                payment_id: Some(payment_id),
                transaction_external_key: context.transaction_external_key.clone(),
                amount,
                currency: self.completion_currency(context, invoice_id).await?,
                processed_currency: context.processed_currency,
                status,
                payment_date: self.clock.now(),
            })
            .await
    }

    async fn on_success_refund(&self, context: &PaymentControlContext) -> Result<()> {
        let Some(payment_id) = context.payment_id else {
            return Ok(());
        };
        let links = self.invoice_api.get_invoice_payments_by_payment(payment_id).await?;
        let Some(paid) = successful_attempt(&links) else {
            return Ok(());
        };

        let now = self.clock.now();
        self.invoice_api
            .insert_invoice_payment(InvoicePayment {
                id: Uuid::new_v4(),
                invoice_id: paid.invoice_id,
                payment_id: Some(payment_id),
                transaction_external_key: context.transaction_external_key.clone(),
                kind: InvoicePaymentKind::Refund,
                amount: context.amount.unwrap_or(Decimal::ZERO),
                currency: context.currency.unwrap_or(paid.currency),
                processed_currency: context.processed_currency,
                status: InvoicePaymentStatus::Success,
                created_date: now,
                updated_date: now,
            })
            .await
    }

    async fn on_failure_purchase(
        &self,
        context: &PaymentControlContext,
    ) -> Result<OnFailureResult> {
        let invoice_id = invoice_id(context)?;
        let now = self.clock.now();

        // Unblocks anyone waiting on the INIT row.
        let completion = match self.completion_currency(context, invoice_id).await {
            Ok(currency) => {
                self.invoice_api
                    .record_payment_attempt_completion(PaymentCompletion {
                        invoice_id,
                        payment_id: context.payment_id,
                        transaction_external_key: context.transaction_external_key.clone(),
                        amount: Decimal::ZERO,
                        currency,
                        processed_currency: context.processed_currency,
                        status: InvoicePaymentStatus::Init,
                        payment_date: now,
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = completion {
            warn!(invoice_id = %invoice_id, error = %e, "Failed to record failed invoice payment");
        }

        if context.is_api_payment && !retry_api_payment_requested(context) {
            return Ok(OnFailureResult::default());
        }

        let statuses = self.purchase_statuses(context).await?;
        let next_retry_date = self.retry_policy.next_retry_date(&statuses, now);
        match next_retry_date {
            Some(when) => info!(
                attempt_id = %context.attempt_id,
                retry_at = %when,
                "Invoice payment will be retried"
            ),
            None => info!(attempt_id = %context.attempt_id, "No more retries for invoice payment"),
        }
        Ok(OnFailureResult {
            next_retry_date,
            adjusted_properties: None,
        })
    }

    async fn on_failure_chargeback(&self, context: &PaymentControlContext) -> Result<()> {
        let Some(payment_id) = context.payment_id else {
            return Ok(());
        };
        let links = self.invoice_api.get_invoice_payments_by_payment(payment_id).await?;
        let Some(chargeback) = links.iter().find(|l| {
            l.kind == InvoicePaymentKind::Chargeback
                && l.transaction_external_key == context.transaction_external_key
        }) else {
            return Ok(());
        };

        info!(payment_id = %payment_id, "Chargeback failed, recording reversal");
        let now = self.clock.now();
        self.invoice_api
            .insert_invoice_payment(InvoicePayment {
                id: Uuid::new_v4(),
                invoice_id: chargeback.invoice_id,
                payment_id: Some(payment_id),
                transaction_external_key: context.transaction_external_key.clone(),
                kind: InvoicePaymentKind::ChargebackReversal,
                amount: chargeback.amount,
                currency: chargeback.currency,
                processed_currency: None,
                status: InvoicePaymentStatus::Success,
                created_date: now,
                updated_date: now,
            })
            .await
    }

    /// Statuses of the payment's PURCHASE transactions, oldest first.
    async fn purchase_statuses(
        &self,
        context: &PaymentControlContext,
    ) -> Result<Vec<TransactionStatus>> {
        let payment_id = match context.payment_id {
            Some(id) => Some(id),
            None => self
                .store
                .get_payment_by_external_key(&context.payment_external_key)
                .await?
                .map(|p| p.id),
        };
        let Some(payment_id) = payment_id else {
            return Ok(Vec::new());
        };

        Ok(self
            .store
            .get_transactions_for_payment(payment_id)
            .await?
            .into_iter()
            .filter(|t| t.transaction_type == TransactionType::Purchase)
            .map(|t| t.status)
            .collect())
    }

    async fn completion_currency(
        &self,
        context: &PaymentControlContext,
        invoice_id: Uuid,
    ) -> Result<Currency> {
        if let Some(currency) = context.currency {
            return Ok(currency);
        }
        self.invoice_api
            .get_invoice(invoice_id)
            .await?
            .map(|invoice| invoice.currency)
            .ok_or_else(|| {
                PaymentError::ValidationError(format!("invoice {} not found", invoice_id))
            })
    }
}

#[async_trait]
impl PaymentControlPlugin for InvoicePaymentControlPlugin {
    async fn prior_call(&self, context: &PaymentControlContext) -> Result<PriorCallResult> {
        match context.transaction_type {
            TransactionType::Purchase => self.prior_call_purchase(context).await,
            TransactionType::Refund => self.prior_call_refund(context).await,
            TransactionType::Chargeback => self.prior_call_chargeback(context).await,
            _ => Ok(PriorCallResult::proceed()),
        }
    }

    async fn on_success_call(&self, context: &PaymentControlContext) -> Result<OnSuccessResult> {
        match context.transaction_type {
            TransactionType::Purchase => self.on_success_purchase(context).await?,
            TransactionType::Refund => self.on_success_refund(context).await?,
            _ => {}
        }
        Ok(OnSuccessResult::default())
    }

    async fn on_failure_call(&self, context: &PaymentControlContext) -> Result<OnFailureResult> {
        match context.transaction_type {
            TransactionType::Purchase => self.on_failure_purchase(context).await,
            TransactionType::Chargeback => {
                self.on_failure_chargeback(context).await?;
                Ok(OnFailureResult::default())
            }
            _ => Ok(OnFailureResult::default()),
        }
    }
}

fn invoice_id(context: &PaymentControlContext) -> Result<Uuid> {
    let value = context
        .property(INVOICE_ID_PROPERTY)
        .ok_or(PaymentError::MissingProperty(INVOICE_ID_PROPERTY))?;
    serde_json::from_value(value.clone()).map_err(|_| {
        PaymentError::ValidationError(format!(
            "{} is not a valid invoice id: {}",
            INVOICE_ID_PROPERTY, value
        ))
    })
}

fn retry_api_payment_requested(context: &PaymentControlContext) -> bool {
    match context.property(RETRY_API_PAYMENT_PROPERTY) {
        Some(serde_json::Value::Bool(flag)) => *flag,
        Some(serde_json::Value::String(flag)) => flag.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn successful_attempt(links: &[InvoicePayment]) -> Option<&InvoicePayment> {
    links
        .iter()
        .find(|l| l.kind == InvoicePaymentKind::Attempt && l.is_success())
}

fn total(links: &[InvoicePayment], kind: InvoicePaymentKind) -> Decimal {
    links
        .iter()
        .filter(|l| l.kind == kind)
        .map(|l| l.amount)
        .sum()
}

fn paid_amount(links: &[InvoicePayment]) -> Decimal {
    links
        .iter()
        .filter(|l| l.kind == InvoicePaymentKind::Attempt && l.is_success())
        .map(|l| l.amount)
        .sum()
}
