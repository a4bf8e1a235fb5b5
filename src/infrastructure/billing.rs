//! In-memory stand-ins for the billing collaborators of the invoice control
//! plugin: invoices and their payment links, accounts, and control tags.

use crate::domain::account::{Account, ControlTag};
use crate::domain::invoice::{
    Invoice, InvoicePayment, InvoicePaymentKind, InvoicePaymentStatus, PaymentCompletion,
};
use crate::domain::money::Currency;
use crate::domain::ports::{AccountApi, InvoiceApi, TagApi};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct InvoiceBook {
    invoices: HashMap<Uuid, Invoice>,
    payments: Vec<InvoicePayment>,
}

impl InvoiceBook {
    fn adjust_balance(&mut self, invoice_id: Uuid, delta: Decimal) -> Result<()> {
        let invoice = self.invoices.get_mut(&invoice_id).ok_or_else(|| {
            PaymentError::ValidationError(format!("invoice {} not found", invoice_id))
        })?;
        invoice.balance += delta;
        Ok(())
    }

    fn attempt_link_mut(&mut self, invoice_id: Uuid, key: &str) -> Option<&mut InvoicePayment> {
        self.payments.iter_mut().find(|p| {
            p.invoice_id == invoice_id
                && p.kind == InvoicePaymentKind::Attempt
                && p.transaction_external_key == key
        })
    }
}

/// Invoice subsystem double.
///
/// Completing an ATTEMPT link with SUCCESS lowers the invoice balance;
/// refunds and chargebacks raise it again, chargeback reversals lower it.
#[derive(Default, Clone)]
pub struct InMemoryInvoiceApi {
    book: Arc<RwLock<InvoiceBook>>,
}

impl InMemoryInvoiceApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_invoice(&self, invoice: Invoice) {
        self.book.write().await.invoices.insert(invoice.id, invoice);
    }

    /// Every invoice-payment link, in recording order.
    pub async fn invoice_payments(&self) -> Vec<InvoicePayment> {
        self.book.read().await.payments.clone()
    }
}

#[async_trait]
impl InvoiceApi for InMemoryInvoiceApi {
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>> {
        Ok(self.book.read().await.invoices.get(&invoice_id).cloned())
    }

    async fn get_invoice_payments(&self, invoice_id: Uuid) -> Result<Vec<InvoicePayment>> {
        let book = self.book.read().await;
        Ok(book
            .payments
            .iter()
            .filter(|p| p.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    async fn get_invoice_payments_by_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<InvoicePayment>> {
        let book = self.book.read().await;
        Ok(book
            .payments
            .iter()
            .filter(|p| p.payment_id == Some(payment_id))
            .cloned()
            .collect())
    }

    async fn record_payment_attempt_init(
        &self,
        invoice_id: Uuid,
        amount: Decimal,
        currency: Currency,
        payment_id: Option<Uuid>,
        transaction_external_key: &str,
        date: DateTime<Utc>,
    ) -> Result<()> {
        let mut book = self.book.write().await;
        if !book.invoices.contains_key(&invoice_id) {
            return Err(PaymentError::ValidationError(format!(
                "invoice {} not found",
                invoice_id
            )));
        }

        match book.attempt_link_mut(invoice_id, transaction_external_key) {
            Some(link) if link.is_success() => {}
            Some(link) => {
                link.amount = amount;
                link.currency = currency;
                link.payment_id = payment_id.or(link.payment_id);
                link.status = InvoicePaymentStatus::Init;
                link.updated_date = date;
            }
            None => book.payments.push(InvoicePayment {
                id: Uuid::new_v4(),
                invoice_id,
                payment_id,
                transaction_external_key: transaction_external_key.to_string(),
                kind: InvoicePaymentKind::Attempt,
                amount,
                currency,
                processed_currency: None,
                status: InvoicePaymentStatus::Init,
                created_date: date,
                updated_date: date,
            }),
        }
        Ok(())
    }

    async fn record_payment_attempt_completion(&self, completion: PaymentCompletion) -> Result<()> {
        let mut book = self.book.write().await;
        let success = completion.status == InvoicePaymentStatus::Success;

        match book.attempt_link_mut(completion.invoice_id, &completion.transaction_external_key) {
            Some(link) if link.is_success() => return Ok(()),
            Some(link) => {
                link.payment_id = completion.payment_id.or(link.payment_id);
                link.amount = completion.amount;
                link.currency = completion.currency;
                link.processed_currency = completion.processed_currency;
                link.status = completion.status;
                link.updated_date = completion.payment_date;
            }
            None => book.payments.push(InvoicePayment {
                id: Uuid::new_v4(),
                invoice_id: completion.invoice_id,
                payment_id: completion.payment_id,
                transaction_external_key: completion.transaction_external_key.clone(),
                kind: InvoicePaymentKind::Attempt,
                amount: completion.amount,
                currency: completion.currency,
                processed_currency: completion.processed_currency,
                status: completion.status,
                created_date: completion.payment_date,
                updated_date: completion.payment_date,
            }),
        }

        if success {
            book.adjust_balance(completion.invoice_id, -completion.amount)?;
        }
        Ok(())
    }

    async fn insert_invoice_payment(&self, invoice_payment: InvoicePayment) -> Result<()> {
        let mut book = self.book.write().await;
        let duplicate = book.payments.iter().any(|p| {
            p.kind == invoice_payment.kind
                && p.transaction_external_key == invoice_payment.transaction_external_key
        });
        if duplicate {
            return Ok(());
        }

        let delta = match invoice_payment.kind {
            InvoicePaymentKind::Refund | InvoicePaymentKind::Chargeback => invoice_payment.amount,
            InvoicePaymentKind::ChargebackReversal => -invoice_payment.amount,
            InvoicePaymentKind::Attempt => Decimal::ZERO,
        };
        book.adjust_balance(invoice_payment.invoice_id, delta)?;
        book.payments.push(invoice_payment);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryAccountApi {
    accounts: Arc<RwLock<HashMap<Uuid, Account>>>,
}

impl InMemoryAccountApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_account(&self, account: Account) {
        self.accounts.write().await.insert(account.id, account);
    }
}

#[async_trait]
impl AccountApi for InMemoryAccountApi {
    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>> {
        Ok(self.accounts.read().await.get(&account_id).cloned())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryTagApi {
    tags: Arc<RwLock<HashMap<Uuid, Vec<ControlTag>>>>,
}

impl InMemoryTagApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_tag(&self, account_id: Uuid, tag: ControlTag) {
        let mut tags = self.tags.write().await;
        let account_tags = tags.entry(account_id).or_default();
        if !account_tags.contains(&tag) {
            account_tags.push(tag);
        }
    }

    pub async fn remove_tag(&self, account_id: Uuid, tag: ControlTag) {
        if let Some(account_tags) = self.tags.write().await.get_mut(&account_id) {
            account_tags.retain(|t| *t != tag);
        }
    }
}

#[async_trait]
impl TagApi for InMemoryTagApi {
    async fn get_control_tags(&self, account_id: Uuid) -> Result<Vec<ControlTag>> {
        Ok(self
            .tags
            .read()
            .await
            .get(&account_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn completion(invoice_id: Uuid, key: &str, amount: Decimal) -> PaymentCompletion {
        PaymentCompletion {
            invoice_id,
            payment_id: Some(Uuid::new_v4()),
            transaction_external_key: key.to_string(),
            amount,
            currency: Currency::Usd,
            processed_currency: Some(Currency::Usd),
            status: InvoicePaymentStatus::Success,
            payment_date: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_init_then_success_completion() {
        let api = InMemoryInvoiceApi::new();
        let invoice = Invoice::committed(Uuid::new_v4(), Currency::Usd, dec!(100));
        api.add_invoice(invoice.clone()).await;

        api.record_payment_attempt_init(
            invoice.id,
            dec!(100),
            Currency::Usd,
            None,
            "tx-1",
            Utc::now(),
        )
        .await
        .unwrap();
        let links = api.get_invoice_payments(invoice.id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].status, InvoicePaymentStatus::Init);

        api.record_payment_attempt_completion(completion(invoice.id, "tx-1", dec!(100)))
            .await
            .unwrap();
        // a second notice for the same key is a no-op
        api.record_payment_attempt_completion(completion(invoice.id, "tx-1", dec!(100)))
            .await
            .unwrap();

        let links = api.get_invoice_payments(invoice.id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert!(links[0].is_success());
        let stored = api.get_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, dec!(0));
    }

    #[tokio::test]
    async fn test_refund_link_is_idempotent_and_restores_balance() {
        let api = InMemoryInvoiceApi::new();
        let invoice = Invoice::committed(Uuid::new_v4(), Currency::Usd, dec!(0));
        api.add_invoice(invoice.clone()).await;

        let refund = InvoicePayment {
            id: Uuid::new_v4(),
            invoice_id: invoice.id,
            payment_id: Some(Uuid::new_v4()),
            transaction_external_key: "refund-1".to_string(),
            kind: InvoicePaymentKind::Refund,
            amount: dec!(25),
            currency: Currency::Usd,
            processed_currency: None,
            status: InvoicePaymentStatus::Success,
            created_date: Utc::now(),
            updated_date: Utc::now(),
        };
        api.insert_invoice_payment(refund.clone()).await.unwrap();
        api.insert_invoice_payment(refund).await.unwrap();

        assert_eq!(api.invoice_payments().await.len(), 1);
        let stored = api.get_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, dec!(25));
    }

    #[tokio::test]
    async fn test_init_for_unknown_invoice_fails() {
        let api = InMemoryInvoiceApi::new();
        let result = api
            .record_payment_attempt_init(
                Uuid::new_v4(),
                dec!(1),
                Currency::Usd,
                None,
                "tx",
                Utc::now(),
            )
            .await;
        assert!(matches!(result, Err(PaymentError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_tags_and_accounts() {
        let tags = InMemoryTagApi::new();
        let account = Account::new(Uuid::new_v4(), Currency::Eur);
        tags.add_tag(account.id, ControlTag::AutoPayOff).await;
        tags.add_tag(account.id, ControlTag::AutoPayOff).await;
        assert_eq!(
            tags.get_control_tags(account.id).await.unwrap(),
            vec![ControlTag::AutoPayOff]
        );
        tags.remove_tag(account.id, ControlTag::AutoPayOff).await;
        assert!(tags.get_control_tags(account.id).await.unwrap().is_empty());

        let accounts = InMemoryAccountApi::new();
        accounts.add_account(account.clone()).await;
        assert_eq!(accounts.get_account(account.id).await.unwrap(), Some(account));
    }
}
