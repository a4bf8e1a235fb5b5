use crate::domain::clock::ClockBox;
use crate::domain::payment::{Payment, PaymentTransaction, TransactionCompletion, TransactionStatus};
use crate::domain::ports::{
    PaymentProcessor, PaymentStoreRef, ProcessorError, ProcessorRequest, ProcessorResponse,
};
use crate::error::PaymentError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Property selecting the outcome of a simulated gateway call.
pub const SIMULATED_OUTCOME_PROPERTY: &str = "SIMULATED_OUTCOME";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatedOutcome {
    Success,
    Pending,
    PaymentFailure,
    PluginFailure,
    Unknown,
    /// The gateway call itself fails: a PLUGIN_FAILURE transaction is
    /// recorded and the processor returns an error.
    Error,
}

impl SimulatedOutcome {
    fn status(self) -> TransactionStatus {
        match self {
            Self::Success => TransactionStatus::Success,
            Self::Pending => TransactionStatus::Pending,
            Self::PaymentFailure => TransactionStatus::PaymentFailure,
            Self::PluginFailure | Self::Error => TransactionStatus::PluginFailure,
            Self::Unknown => TransactionStatus::Unknown,
        }
    }
}

impl fmt::Display for SimulatedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Pending => "pending",
            Self::PaymentFailure => "payment_failure",
            Self::PluginFailure => "plugin_failure",
            Self::Unknown => "unknown",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

impl FromStr for SimulatedOutcome {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(Self::Success),
            "pending" => Ok(Self::Pending),
            "payment_failure" => Ok(Self::PaymentFailure),
            "plugin_failure" => Ok(Self::PluginFailure),
            "unknown" => Ok(Self::Unknown),
            "error" => Ok(Self::Error),
            other => Err(PaymentError::ValidationError(format!(
                "unknown simulated outcome '{}'",
                other
            ))),
        }
    }
}

/// Gateway stand-in that records payments and transactions in the ledger.
///
/// The outcome of each call comes from the scripted queue first, then from
/// the `SIMULATED_OUTCOME` property, and defaults to success.
#[derive(Clone)]
pub struct SimulatedPaymentProcessor {
    store: PaymentStoreRef,
    clock: ClockBox,
    script: Arc<Mutex<VecDeque<SimulatedOutcome>>>,
}

impl SimulatedPaymentProcessor {
    pub fn new(store: PaymentStoreRef, clock: ClockBox) -> Self {
        Self {
            store,
            clock,
            script: Arc::default(),
        }
    }

    /// Queues the outcome of a future call.
    pub async fn script(&self, outcome: SimulatedOutcome) {
        self.script.lock().await.push_back(outcome);
    }

    /// Drops outcomes no gateway call consumed.
    pub async fn clear_script(&self) {
        self.script.lock().await.clear();
    }

    async fn next_outcome(
        &self,
        request: &ProcessorRequest,
    ) -> Result<SimulatedOutcome, ProcessorError> {
        if let Some(outcome) = self.script.lock().await.pop_front() {
            return Ok(outcome);
        }
        let property = request
            .properties
            .iter()
            .rev()
            .find(|p| p.key == SIMULATED_OUTCOME_PROPERTY);
        match property.map(|p| &p.value) {
            Some(serde_json::Value::String(value)) => value.parse().map_err(unexpected),
            Some(other) => Err(ProcessorError::Unexpected(format!(
                "{} must be a string, got {}",
                SIMULATED_OUTCOME_PROPERTY, other
            ))),
            None => Ok(SimulatedOutcome::Success),
        }
    }

    async fn process(
        &self,
        request: &ProcessorRequest,
    ) -> Result<ProcessorResponse, ProcessorError> {
        let outcome = self.next_outcome(request).await?;
        let payment = self.resolve_payment(request).await?;
        let transaction = self.resolve_transaction(request, &payment).await?;

        let status = outcome.status();
        let succeeded = status.is_success_or_pending();
        let state_name = format!(
            "{}_{}",
            request.transaction_type,
            match status {
                TransactionStatus::Success => "SUCCESS",
                TransactionStatus::Pending => "PENDING",
                TransactionStatus::PaymentFailure => "FAILED",
                TransactionStatus::PluginFailure | TransactionStatus::Unknown => "ERRORED",
            }
        );
        let (error_code, error_msg) = match outcome {
            SimulatedOutcome::PaymentFailure => (
                Some("DECLINED".to_string()),
                Some("card declined".to_string()),
            ),
            SimulatedOutcome::PluginFailure | SimulatedOutcome::Error => {
                (Some("GATEWAY_ERROR".to_string()), Some("gateway unavailable".to_string()))
            }
            _ => (None, None),
        };

        self.store
            .update_payment_and_transaction_on_completion(
                payment.id,
                transaction.id,
                TransactionCompletion {
                    last_success_state_name: (status == TransactionStatus::Success)
                        .then(|| state_name.clone()),
                    payment_state_name: state_name,
                    status,
                    processed_amount: if succeeded { request.amount } else { None },
                    processed_currency: request.currency,
                    gateway_error_code: error_code,
                    gateway_error_msg: error_msg,
                    updated_date: self.clock.now(),
                },
            )
            .await
            .map_err(unexpected)?;
        debug!(
            transaction_id = %transaction.id,
            transaction_type = %request.transaction_type,
            %outcome,
            "Simulated gateway call completed"
        );

        if outcome == SimulatedOutcome::Error {
            return Err(ProcessorError::Declined("simulated gateway error".to_string()));
        }

        let payment = self
            .store
            .get_payment(payment.id)
            .await
            .map_err(unexpected)?
            .unwrap_or(payment);
        let transaction = self
            .store
            .get_transaction(transaction.id)
            .await
            .map_err(unexpected)?
            .unwrap_or(transaction);
        Ok(ProcessorResponse {
            payment,
            transaction,
        })
    }

    async fn resolve_payment(&self, request: &ProcessorRequest) -> Result<Payment, ProcessorError> {
        if let Some(payment_id) = request.payment_id {
            return self
                .store
                .get_payment(payment_id)
                .await
                .map_err(unexpected)?
                .ok_or_else(|| {
                    ProcessorError::Declined(format!("payment {} not found", payment_id))
                });
        }
        if let Some(payment) = self
            .store
            .get_payment_by_external_key(&request.payment_external_key)
            .await
            .map_err(unexpected)?
        {
            return Ok(payment);
        }

        let now = self.clock.now();
        let payment = Payment {
            id: Uuid::new_v4(),
            account_id: request.account_id,
            payment_method_id: request.payment_method_id,
            external_key: request.payment_external_key.clone(),
            state_name: None,
            last_success_state_name: None,
            created_date: now,
            updated_date: now,
        };
        self.store
            .insert_payment(payment.clone())
            .await
            .map_err(unexpected)?;
        Ok(payment)
    }

    /// Reuses the transaction an interrupted attempt left behind, otherwise
    /// records a new one in UNKNOWN until the outcome is written.
    async fn resolve_transaction(
        &self,
        request: &ProcessorRequest,
        payment: &Payment,
    ) -> Result<PaymentTransaction, ProcessorError> {
        if let Some(transaction_id) = request.transaction_id
            && let Some(existing) = self
                .store
                .get_transaction(transaction_id)
                .await
                .map_err(unexpected)?
        {
            return Ok(existing);
        }

        let now = self.clock.now();
        let transaction = PaymentTransaction {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            attempt_id: Some(request.attempt_id),
            external_key: request.transaction_external_key.clone(),
            transaction_type: request.transaction_type,
            status: TransactionStatus::Unknown,
            amount: request.amount,
            currency: request.currency,
            processed_amount: None,
            processed_currency: None,
            gateway_error_code: None,
            gateway_error_msg: None,
            created_date: now,
            updated_date: now,
        };
        self.store
            .insert_transaction(transaction.clone())
            .await
            .map_err(unexpected)?;
        Ok(transaction)
    }
}

fn unexpected(e: PaymentError) -> ProcessorError {
    ProcessorError::Unexpected(e.to_string())
}

#[async_trait]
impl PaymentProcessor for SimulatedPaymentProcessor {
    async fn purchase(
        &self,
        request: &ProcessorRequest,
    ) -> Result<ProcessorResponse, ProcessorError> {
        self.process(request).await
    }

    async fn refund(
        &self,
        request: &ProcessorRequest,
    ) -> Result<ProcessorResponse, ProcessorError> {
        self.process(request).await
    }

    async fn chargeback(
        &self,
        request: &ProcessorRequest,
    ) -> Result<ProcessorResponse, ProcessorError> {
        self.process(request).await
    }

    async fn credit(
        &self,
        request: &ProcessorRequest,
    ) -> Result<ProcessorResponse, ProcessorError> {
        self.process(request).await
    }
}
