use super::control::runner::ControlPluginRunner;
use super::state_machine::OperationResult;
use crate::domain::attempt::{PaymentAttempt, PluginProperty};
use crate::domain::context::PaymentControlContext;
use crate::domain::payment::TransactionType;
use crate::domain::ports::{
    PaymentProcessorRef, ProcessorError, ProcessorRequest, ProcessorResponse,
};
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Everything the state machine needs to know after the operation ran.
#[derive(Debug)]
pub struct OperationStep {
    pub result: OperationResult,
    /// Final context, carrying whatever properties the plugins left behind.
    pub context: PaymentControlContext,
    pub response: Option<ProcessorResponse>,
    pub retry_at: Option<DateTime<Utc>>,
    /// Error to hand back to the caller once the terminal state is recorded.
    pub error: Option<PaymentError>,
}

impl OperationStep {
    fn exception(context: PaymentControlContext, error: PaymentError) -> Self {
        Self {
            result: OperationResult::Exception,
            context,
            response: None,
            retry_at: None,
            error: Some(error),
        }
    }
}

/// The operation executed while the account lock is held: prior-call hooks,
/// the payment operation itself, outcome classification, then the success or
/// failure hooks.
#[derive(Clone)]
pub struct OperationControlCallback {
    runner: ControlPluginRunner,
    processor: PaymentProcessorRef,
}

impl OperationControlCallback {
    pub fn new(runner: ControlPluginRunner, processor: PaymentProcessorRef) -> Self {
        Self { runner, processor }
    }

    /// Snapshot of the attempt handed to the first plugin.
    pub fn build_context(
        attempt: &PaymentAttempt,
        payment_id: Option<Uuid>,
        properties: Vec<PluginProperty>,
        is_api_payment: bool,
    ) -> PaymentControlContext {
        PaymentControlContext {
            account_id: attempt.account_id,
            payment_method_id: attempt.payment_method_id,
            attempt_id: attempt.id,
            payment_id,
            payment_external_key: attempt.payment_external_key.clone(),
            transaction_id: attempt.transaction_id,
            transaction_external_key: attempt.transaction_external_key.clone(),
            transaction_type: attempt.transaction_type,
            amount: attempt.amount,
            currency: attempt.currency,
            processed_amount: None,
            processed_currency: None,
            properties,
            is_api_payment,
        }
    }

    pub async fn do_operation(
        &self,
        plugin_names: &[String],
        context: PaymentControlContext,
    ) -> OperationStep {
        let prior = match self.runner.execute_prior_call(plugin_names, &context).await {
            Ok(prior) => prior,
            Err(e) => {
                warn!(attempt_id = %context.attempt_id, error = %e, "Prior call failed");
                return OperationStep::exception(context, e);
            }
        };

        if prior.is_aborted {
            return OperationStep {
                result: OperationResult::Aborted,
                context: prior.context,
                response: None,
                retry_at: None,
                error: None,
            };
        }

        let context = prior.context;
        let request = processor_request(&context);
        let outcome = match context.transaction_type {
            TransactionType::Purchase => self.processor.purchase(&request).await,
            TransactionType::Refund => self.processor.refund(&request).await,
            TransactionType::Chargeback => self.processor.chargeback(&request).await,
            TransactionType::Credit => self.processor.credit(&request).await,
            other => {
                return OperationStep::exception(
                    context,
                    PaymentError::UnsupportedTransactionType(other),
                );
            }
        };

        match outcome {
            Ok(response) if response.transaction.status.is_success_or_pending() => {
                let context =
                    context.with_processor_result(&response.payment, &response.transaction);
                let context = self
                    .runner
                    .execute_on_success_call(plugin_names, &context)
                    .await;
                OperationStep {
                    result: OperationResult::Success,
                    context,
                    response: Some(response),
                    retry_at: None,
                    error: None,
                }
            }
            Ok(response) => {
                info!(
                    attempt_id = %context.attempt_id,
                    status = %response.transaction.status,
                    "Payment operation failed"
                );
                let context =
                    context.with_processor_result(&response.payment, &response.transaction);
                self.on_failure(plugin_names, context, Some(response), None)
                    .await
            }
            Err(e) => {
                match &e {
                    ProcessorError::Declined(_) => {
                        warn!(
                            attempt_id = %context.attempt_id,
                            error = %e,
                            "Payment processor declined"
                        );
                    }
                    ProcessorError::Unexpected(_) => {
                        error!(
                            attempt_id = %context.attempt_id,
                            error = %e,
                            "Payment processor failed unexpectedly"
                        );
                    }
                }
                self.on_failure(plugin_names, context, None, Some(e.into()))
                    .await
            }
        }
    }

    async fn on_failure(
        &self,
        plugin_names: &[String],
        context: PaymentControlContext,
        response: Option<ProcessorResponse>,
        error: Option<PaymentError>,
    ) -> OperationStep {
        let failure = self
            .runner
            .execute_on_failure_call(plugin_names, &context)
            .await;
        let result = if failure.next_retry_date.is_some() {
            OperationResult::Failure
        } else {
            OperationResult::Exception
        };
        OperationStep {
            result,
            context: failure.context,
            response,
            retry_at: failure.next_retry_date,
            error,
        }
    }
}

fn processor_request(context: &PaymentControlContext) -> ProcessorRequest {
    ProcessorRequest {
        account_id: context.account_id,
        attempt_id: context.attempt_id,
        payment_method_id: context.payment_method_id,
        payment_id: context.payment_id,
        payment_external_key: context.payment_external_key.clone(),
        transaction_id: context.transaction_id,
        transaction_external_key: context.transaction_external_key.clone(),
        transaction_type: context.transaction_type,
        amount: context.amount,
        currency: context.currency,
        properties: context.properties.clone(),
        is_api_payment: context.is_api_payment,
    }
}
