use super::callback::{OperationControlCallback, OperationStep};
use super::control::registry::ControlPluginRegistry;
use super::control::runner::ControlPluginRunner;
use super::dispatch::{OperationDispatcher, with_account_lock};
use super::state_machine::{RETRIED_STATE, SUPERSEDED_STATE, next_state};
use crate::config::OrchestratorConfig;
use crate::domain::attempt::{AttemptState, PaymentAttempt, PluginProperty, serialize_properties};
use crate::domain::clock::ClockBox;
use crate::domain::money::{Amount, Currency};
use crate::domain::payment::{Payment, PaymentTransaction, TransactionStatus, TransactionType};
use crate::domain::ports::{
    AccountLockerRef, PaymentProcessorRef, PaymentStoreRef, RetryRequest, RetrySchedulerRef,
};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Object type recorded on retry notifications.
pub const RETRY_OBJECT_TYPE: &str = "PAYMENT_ATTEMPT";

/// A payment operation as submitted by the payment API layer.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequest {
    pub account_id: Uuid,
    pub transaction_type: TransactionType,
    pub payment_method_id: Option<Uuid>,
    pub payment_id: Option<Uuid>,
    pub payment_external_key: Option<String>,
    pub transaction_id: Option<Uuid>,
    pub transaction_external_key: Option<String>,
    pub amount: Option<Amount>,
    pub currency: Option<Currency>,
    pub plugin_names: Vec<String>,
    pub properties: Vec<PluginProperty>,
    pub is_api_payment: bool,
}

impl PaymentRequest {
    pub fn new(account_id: Uuid, transaction_type: TransactionType) -> Self {
        Self {
            account_id,
            transaction_type,
            payment_method_id: None,
            payment_id: None,
            payment_external_key: None,
            transaction_id: None,
            transaction_external_key: None,
            amount: None,
            currency: None,
            plugin_names: Vec::new(),
            properties: Vec::new(),
            is_api_payment: true,
        }
    }

    pub fn purchase(account_id: Uuid) -> Self {
        Self::new(account_id, TransactionType::Purchase)
    }

    pub fn refund(account_id: Uuid, payment_id: Uuid) -> Self {
        Self::new(account_id, TransactionType::Refund).for_payment(payment_id)
    }

    pub fn chargeback(account_id: Uuid, payment_id: Uuid) -> Self {
        Self::new(account_id, TransactionType::Chargeback).for_payment(payment_id)
    }

    pub fn credit(account_id: Uuid) -> Self {
        Self::new(account_id, TransactionType::Credit)
    }

    pub fn for_payment(mut self, payment_id: Uuid) -> Self {
        self.payment_id = Some(payment_id);
        self
    }

    pub fn with_amount(mut self, amount: Amount, currency: Currency) -> Self {
        self.amount = Some(amount);
        self.currency = Some(currency);
        self
    }

    pub fn with_payment_method(mut self, payment_method_id: Uuid) -> Self {
        self.payment_method_id = Some(payment_method_id);
        self
    }

    pub fn with_external_keys(
        mut self,
        payment_external_key: impl Into<String>,
        transaction_external_key: impl Into<String>,
    ) -> Self {
        self.payment_external_key = Some(payment_external_key.into());
        self.transaction_external_key = Some(transaction_external_key.into());
        self
    }

    pub fn with_plugin(mut self, name: impl Into<String>) -> Self {
        self.plugin_names.push(name.into());
        self
    }

    pub fn with_property(mut self, property: PluginProperty) -> Self {
        self.properties.push(property);
        self
    }

    /// Marks the request as initiated by the system rather than an API caller.
    pub fn internal(mut self) -> Self {
        self.is_api_payment = false;
        self
    }

    /// Rebuilds the request a RETRIED attempt was made for.
    fn from_attempt(attempt: &PaymentAttempt) -> Result<Self> {
        Ok(Self {
            account_id: attempt.account_id,
            transaction_type: attempt.transaction_type,
            payment_method_id: attempt.payment_method_id,
            payment_id: None,
            payment_external_key: Some(attempt.payment_external_key.clone()),
            transaction_id: None,
            transaction_external_key: Some(attempt.transaction_external_key.clone()),
            amount: attempt.amount.map(Amount::new).transpose()?,
            currency: attempt.currency,
            plugin_names: attempt.plugin_names.clone(),
            properties: attempt.properties()?,
            is_api_payment: false,
        })
    }
}

/// What one traversal of the attempt state machine produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub attempt_id: Uuid,
    pub state: AttemptState,
    pub payment_external_key: String,
    pub transaction_external_key: String,
    pub payment: Option<Payment>,
    pub transaction: Option<PaymentTransaction>,
    /// Set only when a retry was actually scheduled.
    pub retry_at: Option<DateTime<Utc>>,
}

/// Drives payment operations through the attempt state machine.
///
/// Each operation runs on the bounded dispatcher, under the account lock:
/// attempt bookkeeping on leaving the entry state, the operation control
/// callback, then terminal-state bookkeeping and retry scheduling.
pub struct PaymentAttemptOrchestrator {
    config: OrchestratorConfig,
    store: PaymentStoreRef,
    locker: AccountLockerRef,
    scheduler: RetrySchedulerRef,
    callback: OperationControlCallback,
    dispatcher: OperationDispatcher,
    clock: ClockBox,
}

impl PaymentAttemptOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<ControlPluginRegistry>,
        store: PaymentStoreRef,
        locker: AccountLockerRef,
        scheduler: RetrySchedulerRef,
        processor: PaymentProcessorRef,
        clock: ClockBox,
    ) -> Self {
        let runner = ControlPluginRunner::new(registry);
        let dispatcher =
            OperationDispatcher::new(config.worker_pool_size, config.operation_timeout);
        Self {
            callback: OperationControlCallback::new(runner, processor),
            dispatcher,
            config,
            store,
            locker,
            scheduler,
            clock,
        }
    }

    /// Runs a new purchase, refund, chargeback or credit.
    pub async fn execute(&self, request: PaymentRequest) -> Result<AttemptReport> {
        ensure_supported(request.transaction_type)?;
        let account_id = request.account_id;
        self.dispatcher
            .dispatch(with_account_lock(
                self.locker.as_ref(),
                account_id,
                self.config.lock_timeout,
                self.run_state_machine(AttemptState::Initiated, request),
            ))
            .await
    }

    /// Re-runs a RETRIED attempt as a new traversal from the RETRIED state.
    ///
    /// The retried attempt is closed before the new traversal starts, so a
    /// second delivery of the same retry fails with `NotRetryable`.
    pub async fn retry(&self, attempt_id: Uuid) -> Result<AttemptReport> {
        let attempt = self.retried_attempt(attempt_id).await?;
        info!(
            attempt_id = %attempt_id,
            account_id = %attempt.account_id,
            "Retrying payment attempt"
        );
        self.dispatcher
            .dispatch(with_account_lock(
                self.locker.as_ref(),
                attempt.account_id,
                self.config.lock_timeout,
                self.run_retry(attempt_id),
            ))
            .await
    }

    /// Runs the retries a scheduler handed back, in order.
    pub async fn run_due_retries(&self, due: Vec<RetryRequest>) -> Vec<Result<AttemptReport>> {
        let mut reports = Vec::with_capacity(due.len());
        for request in due {
            let result = self.retry(request.attempt_id).await;
            if let Err(e) = &result
                && e.is_infrastructure()
            {
                warn!(
                    attempt_id = %request.attempt_id,
                    error = %e,
                    "Retry did not complete and is not rescheduled"
                );
            }
            reports.push(result);
        }
        reports
    }

    async fn retried_attempt(&self, attempt_id: Uuid) -> Result<PaymentAttempt> {
        let attempt = self
            .store
            .get_attempt(attempt_id)
            .await?
            .ok_or(PaymentError::AttemptNotFound(attempt_id))?;
        if attempt.state_name != RETRIED_STATE {
            return Err(PaymentError::NotRetryable {
                attempt_id,
                state: attempt.state_name,
            });
        }
        Ok(attempt)
    }

    async fn run_retry(&self, attempt_id: Uuid) -> Result<AttemptReport> {
        // re-read under the account lock, another delivery may have won
        let attempt = self.retried_attempt(attempt_id).await?;
        let request = PaymentRequest::from_attempt(&attempt)?;
        self.store
            .update_attempt_state(
                attempt.id,
                SUPERSEDED_STATE,
                attempt.transaction_id,
                attempt.plugin_properties.clone(),
                self.clock.now(),
            )
            .await?;
        debug!(attempt_id = %attempt.id, state = %SUPERSEDED_STATE, "Closed retried attempt");
        self.run_state_machine(AttemptState::Retried, request).await
    }

    async fn run_state_machine(
        &self,
        entry: AttemptState,
        request: PaymentRequest,
    ) -> Result<AttemptReport> {
        let (attempt, payment_id) = self.leave_entry_state(entry, &request).await?;
        let context = OperationControlCallback::build_context(
            &attempt,
            payment_id,
            request.properties.clone(),
            request.is_api_payment,
        );

        let step = self
            .callback
            .do_operation(&attempt.plugin_names, context)
            .await;
        let target = next_state(entry, step.result)?;
        let report = self.enter_terminal_state(&attempt, target, &step).await?;

        match step.error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Resolves or creates the attempt row before any plugin runs.
    async fn leave_entry_state(
        &self,
        entry: AttemptState,
        request: &PaymentRequest,
    ) -> Result<(PaymentAttempt, Option<Uuid>)> {
        let resumable = self.find_resumable_transaction(request).await?;

        let (payment_id, transaction_id, payment_external_key, transaction_external_key) =
            match &resumable {
                Some(transaction) => {
                    info!(
                        transaction_id = %transaction.id,
                        status = %transaction.status,
                        "Resuming interrupted transaction"
                    );
                    let payment_key = match self.store.get_payment(transaction.payment_id).await? {
                        Some(payment) => payment.external_key,
                        None => self.payment_external_key(request).await?,
                    };
                    (
                        Some(transaction.payment_id),
                        Some(transaction.id),
                        payment_key,
                        transaction.external_key.clone(),
                    )
                }
                None => (
                    request.payment_id,
                    None,
                    self.payment_external_key(request).await?,
                    request
                        .transaction_external_key
                        .clone()
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                ),
            };

        if entry == AttemptState::Initiated
            && let Some(mut in_flight) = self
                .store
                .get_attempts_by_transaction_external_key(&transaction_external_key)
                .await?
                .into_iter()
                .filter(|a| {
                    a.payment_external_key == payment_external_key && a.state_name.is_in_flight()
                })
                .last()
        {
            info!(attempt_id = %in_flight.id, "Resuming in-flight attempt");
            in_flight.transaction_id = transaction_id.or(in_flight.transaction_id);
            return Ok((in_flight, payment_id));
        }

        let now = self.clock.now();
        let attempt = PaymentAttempt {
            id: Uuid::new_v4(),
            account_id: request.account_id,
            payment_method_id: request.payment_method_id,
            created_date: now,
            updated_date: now,
            payment_external_key,
            transaction_id,
            transaction_external_key,
            transaction_type: request.transaction_type,
            state_name: entry,
            amount: request.amount.map(Into::into),
            currency: request.currency,
            plugin_names: request.plugin_names.clone(),
            plugin_properties: serialize_properties(&request.properties)?,
        };
        self.store.insert_attempt(attempt.clone()).await?;
        info!(
            attempt_id = %attempt.id,
            account_id = %attempt.account_id,
            transaction_type = %attempt.transaction_type,
            state = %entry,
            "Inserted payment attempt"
        );
        Ok((attempt, payment_id))
    }

    async fn find_resumable_transaction(
        &self,
        request: &PaymentRequest,
    ) -> Result<Option<PaymentTransaction>> {
        let candidate = if let Some(transaction_id) = request.transaction_id {
            self.store.get_transaction(transaction_id).await?
        } else if let Some(key) = &request.transaction_external_key {
            self.store
                .get_transactions_by_external_key(key)
                .await?
                .into_iter()
                .filter(|t| t.transaction_type == request.transaction_type)
                .last()
        } else {
            None
        };
        Ok(candidate.filter(|t| t.status.is_resumable()))
    }

    async fn payment_external_key(&self, request: &PaymentRequest) -> Result<String> {
        if let Some(key) = &request.payment_external_key {
            return Ok(key.clone());
        }
        if let Some(payment_id) = request.payment_id
            && let Some(payment) = self.store.get_payment(payment_id).await?
        {
            return Ok(payment.external_key);
        }
        Ok(Uuid::new_v4().to_string())
    }

    async fn enter_terminal_state(
        &self,
        attempt: &PaymentAttempt,
        target: AttemptState,
        step: &OperationStep,
    ) -> Result<AttemptReport> {
        let (payment, transaction) = match &step.response {
            Some(response) => (
                Some(response.payment.clone()),
                Some(response.transaction.clone()),
            ),
            None => self.recorded_transaction(attempt).await?,
        };

        let transaction_id = transaction
            .as_ref()
            .map(|t| t.id)
            .or(attempt.transaction_id);
        let properties = serialize_properties(&step.context.properties)?;
        self.store
            .update_attempt_state(attempt.id, target, transaction_id, properties, self.clock.now())
            .await?;
        info!(
            attempt_id = %attempt.id,
            result = %step.result,
            state = %target,
            "Payment attempt reached terminal state"
        );

        let mut retry_at = None;
        if target == RETRIED_STATE
            && let Some(when) = step.retry_at
        {
            let unknown = transaction
                .as_ref()
                .is_some_and(|t| t.status == TransactionStatus::Unknown);
            if unknown {
                warn!(
                    attempt_id = %attempt.id,
                    "Transaction status is UNKNOWN, leaving it to reconciliation"
                );
            } else {
                let request = RetryRequest {
                    object_type: RETRY_OBJECT_TYPE.to_string(),
                    object_id: attempt.id,
                    attempt_id: attempt.id,
                    tenant_id: self.config.tenant_id,
                    plugin_names: attempt.plugin_names.clone(),
                    when,
                };
                match self.scheduler.schedule_retry(request).await {
                    Ok(()) => {
                        info!(
                            attempt_id = %attempt.id,
                            retry_at = %when,
                            "Scheduled payment retry"
                        );
                        retry_at = Some(when);
                    }
                    Err(e) => {
                        error!(
                            attempt_id = %attempt.id,
                            error = %e,
                            "Failed to schedule payment retry"
                        );
                    }
                }
            }
        }

        Ok(AttemptReport {
            attempt_id: attempt.id,
            state: target,
            payment_external_key: attempt.payment_external_key.clone(),
            transaction_external_key: attempt.transaction_external_key.clone(),
            payment,
            transaction,
            retry_at,
        })
    }

    /// Finds what the processor recorded for this attempt when it returned
    /// an error instead of a response.
    async fn recorded_transaction(
        &self,
        attempt: &PaymentAttempt,
    ) -> Result<(Option<Payment>, Option<PaymentTransaction>)> {
        let transaction = self
            .store
            .get_transactions_by_external_key(&attempt.transaction_external_key)
            .await?
            .into_iter()
            .filter(|t| t.attempt_id == Some(attempt.id))
            .last();
        let payment = match &transaction {
            Some(t) => self.store.get_payment(t.payment_id).await?,
            None => None,
        };
        Ok((payment, transaction))
    }
}

fn ensure_supported(transaction_type: TransactionType) -> Result<()> {
    match transaction_type {
        TransactionType::Purchase
        | TransactionType::Refund
        | TransactionType::Chargeback
        | TransactionType::Credit => Ok(()),
        other => Err(PaymentError::UnsupportedTransactionType(other)),
    }
}
