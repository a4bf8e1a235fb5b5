#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use paycontrol::application::control::registry::ControlPluginRegistry;
use paycontrol::application::orchestrator::{PaymentAttemptOrchestrator, PaymentRequest};
use paycontrol::config::{InvoicePluginConfig, OrchestratorConfig};
use paycontrol::domain::account::Account;
use paycontrol::domain::attempt::PluginProperty;
use paycontrol::domain::clock::FixedClock;
use paycontrol::domain::invoice::{Invoice, InvoicePayment};
use paycontrol::domain::money::Currency;
use paycontrol::domain::ports::{InvoiceApi, PaymentProcessorRef};
use paycontrol::infrastructure::billing::{InMemoryAccountApi, InMemoryInvoiceApi, InMemoryTagApi};
use paycontrol::infrastructure::in_memory::{
    InMemoryAccountLocker, InMemoryPaymentStore, InMemoryRetryScheduler,
};
use paycontrol::infrastructure::simulated::SimulatedPaymentProcessor;
use paycontrol::plugins::invoice::{
    INVOICE_ID_PROPERTY, INVOICE_PLUGIN_NAME, InvoicePaymentControlPlugin,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Orchestrator wired to in-memory collaborators, a fixed clock and the
/// simulated gateway, with the invoice plugin registered.
pub struct Harness {
    pub orchestrator: Arc<PaymentAttemptOrchestrator>,
    pub registry: Arc<ControlPluginRegistry>,
    pub store: InMemoryPaymentStore,
    pub locker: InMemoryAccountLocker,
    pub scheduler: InMemoryRetryScheduler,
    pub processor: SimulatedPaymentProcessor,
    pub invoices: InMemoryInvoiceApi,
    pub accounts: InMemoryAccountApi,
    pub tags: InMemoryTagApi,
    pub clock: FixedClock,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::default(), InvoicePluginConfig::default())
    }

    pub fn with_config(config: OrchestratorConfig, plugin_config: InvoicePluginConfig) -> Self {
        Self::build(config, plugin_config, |processor| {
            Arc::new(processor) as PaymentProcessorRef
        })
    }

    /// `wrap` may decorate the simulated gateway before it is handed over.
    pub fn build(
        config: OrchestratorConfig,
        plugin_config: InvoicePluginConfig,
        wrap: impl FnOnce(SimulatedPaymentProcessor) -> PaymentProcessorRef,
    ) -> Self {
        let clock = FixedClock::new(start());
        let store = InMemoryPaymentStore::new();
        let locker = InMemoryAccountLocker::new();
        let scheduler = InMemoryRetryScheduler::new();
        let invoices = InMemoryInvoiceApi::new();
        let accounts = InMemoryAccountApi::new();
        let tags = InMemoryTagApi::new();
        let processor =
            SimulatedPaymentProcessor::new(Arc::new(store.clone()), Arc::new(clock.clone()));

        let registry = Arc::new(ControlPluginRegistry::new());
        registry.register(
            INVOICE_PLUGIN_NAME,
            Arc::new(InvoicePaymentControlPlugin::new(
                plugin_config,
                Arc::new(invoices.clone()),
                Arc::new(accounts.clone()),
                Arc::new(tags.clone()),
                Arc::new(store.clone()),
                Arc::new(clock.clone()),
            )),
        );

        let orchestrator = PaymentAttemptOrchestrator::new(
            config,
            registry.clone(),
            Arc::new(store.clone()),
            Arc::new(locker.clone()),
            Arc::new(scheduler.clone()),
            wrap(processor.clone()),
            Arc::new(clock.clone()),
        );

        Self {
            orchestrator: Arc::new(orchestrator),
            registry,
            store,
            locker,
            scheduler,
            processor,
            invoices,
            accounts,
            tags,
            clock,
        }
    }

    /// A USD account with a default payment method.
    pub async fn account(&self) -> Account {
        let account =
            Account::new(Uuid::new_v4(), Currency::Usd).with_payment_method(Uuid::new_v4());
        self.accounts.add_account(account.clone()).await;
        account
    }

    pub async fn invoice(&self, account: &Account, balance: Decimal) -> Invoice {
        let invoice = Invoice::committed(account.id, Currency::Usd, balance);
        self.invoices.add_invoice(invoice.clone()).await;
        invoice
    }

    pub async fn balance(&self, invoice: &Invoice) -> Decimal {
        self.invoices
            .get_invoice(invoice.id)
            .await
            .unwrap()
            .unwrap()
            .balance
    }

    pub async fn links(&self, invoice: &Invoice) -> Vec<InvoicePayment> {
        self.invoices.get_invoice_payments(invoice.id).await.unwrap()
    }
}

/// An API purchase of `invoice` through the invoice plugin.
pub fn invoice_purchase(account: &Account, invoice: &Invoice) -> PaymentRequest {
    PaymentRequest::purchase(account.id)
        .with_plugin(INVOICE_PLUGIN_NAME)
        .with_property(PluginProperty::new(INVOICE_ID_PROPERTY, invoice.id.to_string()))
}
