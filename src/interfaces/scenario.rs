//! Drives a CSV scenario through the orchestrator with in-memory billing
//! collaborators and the simulated gateway.

use super::csv::outcome_writer::OutcomeRecord;
use super::csv::scenario_reader::{ScenarioAction, ScenarioRow};
use crate::application::control::registry::ControlPluginRegistry;
use crate::application::orchestrator::{AttemptReport, PaymentAttemptOrchestrator, PaymentRequest};
use crate::config::{InvoicePluginConfig, OrchestratorConfig};
use crate::domain::account::Account;
use crate::domain::attempt::PluginProperty;
use crate::domain::clock::{Clock, ClockBox, FixedClock};
use crate::domain::invoice::Invoice;
use crate::domain::money::{Amount, Currency};
use crate::domain::payment::{TransactionStatus, TransactionType};
use crate::domain::ports::PaymentStoreRef;
use crate::error::{PaymentError, Result};
use crate::infrastructure::billing::{InMemoryAccountApi, InMemoryInvoiceApi, InMemoryTagApi};
use crate::infrastructure::in_memory::{InMemoryAccountLocker, InMemoryRetryScheduler};
use crate::infrastructure::simulated::SimulatedPaymentProcessor;
use crate::plugins::invoice::{
    INVOICE_ID_PROPERTY, INVOICE_PLUGIN_NAME, InvoicePaymentControlPlugin,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct ScenarioRunner {
    orchestrator: PaymentAttemptOrchestrator,
    invoices: InMemoryInvoiceApi,
    accounts: InMemoryAccountApi,
    scheduler: InMemoryRetryScheduler,
    processor: SimulatedPaymentProcessor,
    clock: FixedClock,
    account_ids: HashMap<u32, Uuid>,
    invoice_ids: HashMap<u32, Uuid>,
    /// Latest successful purchase per invoice alias, target of refunds and chargebacks.
    paid_by_invoice: HashMap<u32, Uuid>,
    /// Aliases of the operation each scheduled attempt was made for.
    retry_targets: HashMap<Uuid, (u32, Option<u32>)>,
}

impl ScenarioRunner {
    pub fn new(
        config: OrchestratorConfig,
        plugin_config: InvoicePluginConfig,
        store: PaymentStoreRef,
        now: DateTime<Utc>,
    ) -> Self {
        let clock = FixedClock::new(now);
        let clock_box: ClockBox = Arc::new(clock.clone());
        let invoices = InMemoryInvoiceApi::new();
        let accounts = InMemoryAccountApi::new();
        let scheduler = InMemoryRetryScheduler::new();
        let processor = SimulatedPaymentProcessor::new(store.clone(), clock_box.clone());

        let registry = Arc::new(ControlPluginRegistry::new());
        registry.register(
            INVOICE_PLUGIN_NAME,
            Arc::new(InvoicePaymentControlPlugin::new(
                plugin_config,
                Arc::new(invoices.clone()),
                Arc::new(accounts.clone()),
                Arc::new(InMemoryTagApi::new()),
                store.clone(),
                clock_box.clone(),
            )),
        );

        let orchestrator = PaymentAttemptOrchestrator::new(
            config,
            registry,
            store.clone(),
            Arc::new(InMemoryAccountLocker::new()),
            Arc::new(scheduler.clone()),
            Arc::new(processor.clone()),
            clock_box,
        );

        Self {
            orchestrator,
            invoices,
            accounts,
            scheduler,
            processor,
            clock,
            account_ids: HashMap::new(),
            invoice_ids: HashMap::new(),
            paid_by_invoice: HashMap::new(),
            retry_targets: HashMap::new(),
        }
    }

    /// Applies one row. Invoice rows produce no record.
    pub async fn apply(&mut self, row: ScenarioRow) -> Result<Option<OutcomeRecord>> {
        let currency = row.currency.unwrap_or(Currency::Usd);
        let account_id = self.ensure_account(row.account, currency).await;

        if row.action == ScenarioAction::Invoice {
            self.issue_invoice(&row, account_id, currency).await?;
            return Ok(None);
        }

        let request = self.request_for(&row, account_id, currency)?;
        // The outcome only applies to this first gateway call; retries succeed.
        if let Some(outcome) = row.outcome {
            self.processor.script(outcome).await;
        }
        let result = self.orchestrator.execute(request).await;
        self.processor.clear_script().await;
        let report = result?;
        Ok(Some(self.record(row.account, row.invoice, row.action.to_string(), report)))
    }

    /// Moves the clock to the earliest scheduled retry and runs everything
    /// due by then. Returns `None` when nothing is scheduled.
    pub async fn run_next_retries(&mut self) -> Option<Vec<Result<OutcomeRecord>>> {
        let next = self.scheduler.scheduled().await.into_iter().map(|r| r.when).min()?;
        if next > self.clock.now() {
            self.clock.set(next);
        }

        let due = self.scheduler.take_due(self.clock.now()).await;
        let targets: Vec<Uuid> = due.iter().map(|r| r.attempt_id).collect();
        let results = self.orchestrator.run_due_retries(due).await;

        let mut records = Vec::with_capacity(results.len());
        for (attempt_id, result) in targets.into_iter().zip(results) {
            let (account, invoice) = self
                .retry_targets
                .get(&attempt_id)
                .copied()
                .unwrap_or_default();
            records.push(
                result.map(|report| self.record(account, invoice, "retry".to_string(), report)),
            );
        }
        Some(records)
    }

    async fn ensure_account(&mut self, alias: u32, currency: Currency) -> Uuid {
        if let Some(id) = self.account_ids.get(&alias) {
            return *id;
        }
        let account = Account::new(Uuid::new_v4(), currency).with_payment_method(Uuid::new_v4());
        let id = account.id;
        self.accounts.add_account(account).await;
        self.account_ids.insert(alias, id);
        info!(alias, account_id = %id, "Created scenario account");
        id
    }

    async fn issue_invoice(
        &mut self,
        row: &ScenarioRow,
        account_id: Uuid,
        currency: Currency,
    ) -> Result<()> {
        let alias = row
            .invoice
            .ok_or_else(|| {
                PaymentError::ValidationError("invoice row without an invoice alias".to_string())
            })?;
        let balance = row
            .amount
            .ok_or_else(|| {
                PaymentError::ValidationError("invoice row without an amount".to_string())
            })?;
        let invoice = Invoice::committed(account_id, currency, Amount::new(balance)?.value());
        self.invoice_ids.insert(alias, invoice.id);
        self.invoices.add_invoice(invoice).await;
        Ok(())
    }

    fn request_for(
        &self,
        row: &ScenarioRow,
        account_id: Uuid,
        currency: Currency,
    ) -> Result<PaymentRequest> {
        let mut request = match row.action {
            ScenarioAction::Purchase => PaymentRequest::purchase(account_id).internal(),
            ScenarioAction::Refund | ScenarioAction::Chargeback => {
                let alias = self.invoice_alias(row)?;
                let payment_id = *self.paid_by_invoice.get(&alias).ok_or_else(|| {
                    PaymentError::ValidationError(format!(
                        "invoice {} has no successful payment",
                        alias
                    ))
                })?;
                if row.action == ScenarioAction::Refund {
                    PaymentRequest::refund(account_id, payment_id)
                } else {
                    PaymentRequest::chargeback(account_id, payment_id)
                }
            }
            ScenarioAction::Credit => {
                if row.amount.is_none() {
                    return Err(PaymentError::ValidationError(
                        "credit row without an amount".to_string(),
                    ));
                }
                PaymentRequest::credit(account_id)
            }
            ScenarioAction::Invoice => {
                return Err(PaymentError::ValidationError(
                    "invoice rows are not operations".to_string(),
                ));
            }
        };

        if let Some(amount) = row.amount {
            request = request.with_amount(Amount::new(amount)?, currency);
        }
        if row.action != ScenarioAction::Credit {
            let invoice_id = self
                .invoice_ids
                .get(&self.invoice_alias(row)?)
                .copied()
                .ok_or_else(|| PaymentError::ValidationError("unknown invoice alias".to_string()))?;
            request = request
                .with_plugin(INVOICE_PLUGIN_NAME)
                .with_property(PluginProperty::new(INVOICE_ID_PROPERTY, invoice_id.to_string()));
        }
        Ok(request)
    }

    fn invoice_alias(&self, row: &ScenarioRow) -> Result<u32> {
        row.invoice.ok_or_else(|| {
            PaymentError::ValidationError(format!("{} row without an invoice alias", row.action))
        })
    }

    fn record(
        &mut self,
        account: u32,
        invoice: Option<u32>,
        operation: String,
        report: AttemptReport,
    ) -> OutcomeRecord {
        if let Some(when) = report.retry_at {
            self.retry_targets.insert(report.attempt_id, (account, invoice));
            info!(attempt_id = %report.attempt_id, retry_at = %when, "Retry scheduled");
        }
        if let (Some(alias), Some(transaction)) = (invoice, &report.transaction)
            && transaction.transaction_type == TransactionType::Purchase
            && transaction.status == TransactionStatus::Success
        {
            self.paid_by_invoice.insert(alias, transaction.payment_id);
        }

        OutcomeRecord {
            account,
            invoice,
            operation,
            state: report.state.to_string(),
            status: report.transaction.as_ref().map(|t| t.status.to_string()),
            amount: report
                .transaction
                .as_ref()
                .and_then(|t| t.processed_amount.or(t.amount)),
            retry: report.retry_at,
        }
    }
}
