use crate::domain::invoice::{Invoice, InvoicePaymentKind, InvoicePaymentStatus, PaymentCompletion};
use crate::domain::payment::{TransactionStatus, TransactionType};
use crate::domain::ports::{InvoiceApi, PaymentStore};
use crate::error::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Every invoice-payment link matches the ledger.
    Clean,
    /// Links whose gateway call succeeded were completed.
    Repaired(usize),
    /// A linked transaction is UNKNOWN; paying again could double charge.
    UnknownTransaction,
}

/// Completes invoice-payment links left in INIT by a crash between the
/// gateway call and the completion notice.
///
/// Each non-successful ATTEMPT link is matched against the purchase
/// transactions sharing its transaction external key.
pub async fn repair_incomplete_payments(
    invoice_api: &dyn InvoiceApi,
    store: &dyn PaymentStore,
    invoice: &Invoice,
    now: DateTime<Utc>,
) -> Result<RepairOutcome> {
    let links = invoice_api.get_invoice_payments(invoice.id).await?;
    let mut repaired = 0;

    for link in links
        .iter()
        .filter(|l| l.kind == InvoicePaymentKind::Attempt && !l.is_success())
    {
        let purchases: Vec<_> = store
            .get_transactions_by_external_key(&link.transaction_external_key)
            .await?
            .into_iter()
            .filter(|t| t.transaction_type == TransactionType::Purchase)
            .collect();

        if purchases.iter().any(|t| t.status == TransactionStatus::Unknown) {
            warn!(
                invoice_id = %invoice.id,
                transaction_external_key = %link.transaction_external_key,
                "Invoice payment has an UNKNOWN transaction"
            );
            return Ok(RepairOutcome::UnknownTransaction);
        }

        if let Some(succeeded) = purchases
            .iter()
            .find(|t| t.status == TransactionStatus::Success)
        {
            info!(
                invoice_id = %invoice.id,
                payment_id = %succeeded.payment_id,
                transaction_external_key = %link.transaction_external_key,
                "Repairing incomplete invoice payment"
            );
            invoice_api
                .record_payment_attempt_completion(PaymentCompletion {
                    invoice_id: invoice.id,
                    payment_id: Some(succeeded.payment_id),
                    transaction_external_key: link.transaction_external_key.clone(),
                    amount: succeeded.amount.unwrap_or(link.amount),
                    currency: link.currency,
                    processed_currency: succeeded.processed_currency,
                    status: InvoicePaymentStatus::Success,
                    payment_date: now,
                })
                .await?;
            repaired += 1;
        }
    }

    Ok(if repaired > 0 {
        RepairOutcome::Repaired(repaired)
    } else {
        RepairOutcome::Clean
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Currency;
    use crate::domain::payment::PaymentTransaction;
    use crate::infrastructure::billing::InMemoryInvoiceApi;
    use crate::infrastructure::in_memory::InMemoryPaymentStore;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn purchase(key: &str, status: TransactionStatus) -> PaymentTransaction {
        let now = Utc::now();
        PaymentTransaction {
            id: Uuid::new_v4(),
            payment_id: Uuid::new_v4(),
            attempt_id: None,
            external_key: key.to_string(),
            transaction_type: TransactionType::Purchase,
            status,
            amount: Some(dec!(30)),
            currency: Some(Currency::Usd),
            processed_amount: Some(dec!(30)),
            processed_currency: Some(Currency::Usd),
            gateway_error_code: None,
            gateway_error_msg: None,
            created_date: now,
            updated_date: now,
        }
    }

    async fn invoice_with_init_row(api: &InMemoryInvoiceApi, key: &str) -> Invoice {
        let invoice = Invoice::committed(Uuid::new_v4(), Currency::Usd, dec!(30));
        api.add_invoice(invoice.clone()).await;
        api.record_payment_attempt_init(invoice.id, dec!(30), Currency::Usd, None, key, Utc::now())
            .await
            .unwrap();
        invoice
    }

    #[tokio::test]
    async fn test_successful_gateway_call_is_completed_once() {
        let api = InMemoryInvoiceApi::new();
        let store = InMemoryPaymentStore::new();
        let invoice = invoice_with_init_row(&api, "tx-1").await;
        let charged = purchase("tx-1", TransactionStatus::Success);
        store.insert_transaction(charged.clone()).await.unwrap();

        let outcome = repair_incomplete_payments(&api, &store, &invoice, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, RepairOutcome::Repaired(1));

        let again = repair_incomplete_payments(&api, &store, &invoice, Utc::now())
            .await
            .unwrap();
        assert_eq!(again, RepairOutcome::Clean);

        let links = api.get_invoice_payments(invoice.id).await.unwrap();
        assert_eq!(links.iter().filter(|l| l.is_success()).count(), 1);
        assert_eq!(links[0].payment_id, Some(charged.payment_id));
        let repaired = api.get_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(repaired.balance, dec!(0));
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_reported() {
        let api = InMemoryInvoiceApi::new();
        let store = InMemoryPaymentStore::new();
        let invoice = invoice_with_init_row(&api, "tx-1").await;
        store
            .insert_transaction(purchase("tx-1", TransactionStatus::Unknown))
            .await
            .unwrap();

        let outcome = repair_incomplete_payments(&api, &store, &invoice, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, RepairOutcome::UnknownTransaction);
    }

    #[tokio::test]
    async fn test_failed_gateway_call_needs_no_repair() {
        let api = InMemoryInvoiceApi::new();
        let store = InMemoryPaymentStore::new();
        let invoice = invoice_with_init_row(&api, "tx-1").await;
        store
            .insert_transaction(purchase("tx-1", TransactionStatus::PaymentFailure))
            .await
            .unwrap();

        let outcome = repair_incomplete_payments(&api, &store, &invoice, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, RepairOutcome::Clean);
        let stored = api.get_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, dec!(30));
    }
}
