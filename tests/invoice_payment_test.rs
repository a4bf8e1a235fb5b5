mod common;

use common::{Harness, invoice_purchase};
use paycontrol::application::orchestrator::PaymentRequest;
use paycontrol::domain::account::ControlTag;
use paycontrol::domain::attempt::{AttemptState, PluginProperty};
use paycontrol::domain::clock::Clock;
use paycontrol::domain::invoice::{InvoicePaymentKind, InvoicePaymentStatus};
use paycontrol::domain::money::{Amount, Currency};
use paycontrol::domain::payment::{PaymentTransaction, TransactionStatus, TransactionType};
use paycontrol::domain::ports::{InvoiceApi, PaymentStore};
use paycontrol::error::PaymentError;
use paycontrol::infrastructure::simulated::SimulatedOutcome;
use paycontrol::plugins::invoice::{INVOICE_ID_PROPERTY, INVOICE_PLUGIN_NAME};
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn test_purchase_pays_invoice() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(40)).await;

    let report = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice))
        .await
        .unwrap();

    assert_eq!(report.state, AttemptState::Success);
    let transaction = report.transaction.unwrap();
    assert_eq!(transaction.status, TransactionStatus::Success);
    assert_eq!(transaction.amount, Some(dec!(40)));
    assert_eq!(h.balance(&invoice).await, dec!(0));

    let links = h.links(&invoice).await;
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].kind, InvoicePaymentKind::Attempt);
    assert_eq!(links[0].status, InvoicePaymentStatus::Success);
    assert_eq!(links[0].payment_id, Some(transaction.payment_id));
}

#[tokio::test]
async fn test_paid_invoice_is_not_charged_twice() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(40)).await;
    h.orchestrator
        .execute(invoice_purchase(&account, &invoice))
        .await
        .unwrap();

    let second = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice))
        .await
        .unwrap();

    assert_eq!(second.state, AttemptState::Aborted);
    assert!(second.transaction.is_none());
    assert_eq!(h.store.transactions().await.len(), 1);
    assert_eq!(h.balance(&invoice).await, dec!(0));
}

#[tokio::test]
async fn test_crashed_payment_is_repaired_instead_of_charged_again() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(40)).await;

    // The gateway charged the card, but the process died before the
    // invoice side heard about it.
    let now = h.clock.now();
    h.invoices
        .record_payment_attempt_init(invoice.id, dec!(40), Currency::Usd, None, "tx-crashed", now)
        .await
        .unwrap();
    h.store
        .insert_transaction(PaymentTransaction {
            id: Uuid::new_v4(),
            payment_id: Uuid::new_v4(),
            attempt_id: None,
            external_key: "tx-crashed".to_string(),
            transaction_type: TransactionType::Purchase,
            status: TransactionStatus::Success,
            amount: Some(dec!(40)),
            currency: Some(Currency::Usd),
            processed_amount: Some(dec!(40)),
            processed_currency: Some(Currency::Usd),
            gateway_error_code: None,
            gateway_error_msg: None,
            created_date: now,
            updated_date: now,
        })
        .await
        .unwrap();

    let report = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice))
        .await
        .unwrap();

    assert_eq!(report.state, AttemptState::Aborted);
    assert_eq!(h.store.transactions().await.len(), 1);
    assert_eq!(h.balance(&invoice).await, dec!(0));
    let successes: Vec<_> = h
        .links(&invoice)
        .await
        .into_iter()
        .filter(|l| l.is_success())
        .collect();
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].transaction_external_key, "tx-crashed");
}

#[tokio::test]
async fn test_unknown_outcome_is_left_to_reconciliation() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(40)).await;
    h.processor.script(SimulatedOutcome::Unknown).await;

    let report = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice).internal())
        .await
        .unwrap();

    assert_eq!(report.state, AttemptState::Retried);
    assert_eq!(report.retry_at, None);
    assert!(h.scheduler.scheduled().await.is_empty());

    // Another purchase could double charge while the first is unresolved.
    let blocked = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice))
        .await
        .unwrap();
    assert_eq!(blocked.state, AttemptState::Aborted);
    assert_eq!(h.store.transactions().await.len(), 1);
    assert_eq!(h.balance(&invoice).await, dec!(40));
}

#[tokio::test]
async fn test_auto_pay_off_parks_system_purchases() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(25)).await;
    h.tags.add_tag(account.id, ControlTag::AutoPayOff).await;

    let report = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice).internal())
        .await
        .unwrap();

    assert_eq!(report.state, AttemptState::Aborted);
    assert!(h.store.transactions().await.is_empty());
    let parked = h.store.get_auto_pay_off_entries(account.id).await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].attempt_id, report.attempt_id);
    assert_eq!(parked[0].amount, Some(dec!(25)));
    assert_eq!(parked[0].plugin_name, INVOICE_PLUGIN_NAME);
}

#[tokio::test]
async fn test_partial_refund_reopens_invoice_balance() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(20)).await;
    let paid = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice))
        .await
        .unwrap();
    let payment_id = paid.transaction.unwrap().payment_id;

    let refund = PaymentRequest::refund(account.id, payment_id)
        .with_amount(Amount::new(dec!(10)).unwrap(), Currency::Usd)
        .with_plugin(INVOICE_PLUGIN_NAME)
        .with_property(PluginProperty::new(INVOICE_ID_PROPERTY, invoice.id.to_string()));
    let report = h.orchestrator.execute(refund).await.unwrap();

    assert_eq!(report.state, AttemptState::Success);
    assert_eq!(report.payment.unwrap().id, payment_id);
    assert_eq!(h.balance(&invoice).await, dec!(10));
    let refunds: Vec<_> = h
        .links(&invoice)
        .await
        .into_iter()
        .filter(|l| l.kind == InvoicePaymentKind::Refund)
        .collect();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, dec!(10));
}

#[tokio::test]
async fn test_refund_over_paid_amount_is_rejected() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(20)).await;
    let paid = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice))
        .await
        .unwrap();
    let payment_id = paid.transaction.unwrap().payment_id;

    let refund = PaymentRequest::refund(account.id, payment_id)
        .with_amount(Amount::new(dec!(21)).unwrap(), Currency::Usd)
        .with_plugin(INVOICE_PLUGIN_NAME);
    let result = h.orchestrator.execute(refund).await;

    assert!(matches!(result, Err(PaymentError::ValidationError(_))));
    assert_eq!(h.balance(&invoice).await, dec!(0));
}

#[tokio::test]
async fn test_failed_chargeback_is_reversed() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(30)).await;
    let paid = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice))
        .await
        .unwrap();
    let payment_id = paid.transaction.unwrap().payment_id;

    h.processor.script(SimulatedOutcome::PaymentFailure).await;
    let chargeback = PaymentRequest::chargeback(account.id, payment_id)
        .with_plugin(INVOICE_PLUGIN_NAME)
        .with_property(PluginProperty::new(INVOICE_ID_PROPERTY, invoice.id.to_string()));
    let report = h.orchestrator.execute(chargeback).await.unwrap();

    assert_eq!(report.state, AttemptState::Failure);
    assert_eq!(h.balance(&invoice).await, dec!(0));
    let kinds: Vec<_> = h.links(&invoice).await.into_iter().map(|l| l.kind).collect();
    assert_eq!(
        kinds,
        vec![
            InvoicePaymentKind::Attempt,
            InvoicePaymentKind::Chargeback,
            InvoicePaymentKind::ChargebackReversal,
        ]
    );
}

#[tokio::test]
async fn test_successful_chargeback_reopens_invoice() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(30)).await;
    let paid = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice))
        .await
        .unwrap();
    let payment_id = paid.transaction.unwrap().payment_id;

    let chargeback =
        PaymentRequest::chargeback(account.id, payment_id).with_plugin(INVOICE_PLUGIN_NAME);
    let report = h.orchestrator.execute(chargeback).await.unwrap();

    assert_eq!(report.state, AttemptState::Success);
    assert_eq!(report.transaction.unwrap().amount, Some(dec!(30)));
    assert_eq!(h.balance(&invoice).await, dec!(30));
}

#[tokio::test]
async fn test_api_purchase_over_balance_fails_validation() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(40)).await;

    let request = invoice_purchase(&account, &invoice)
        .with_amount(Amount::new(dec!(55)).unwrap(), Currency::Usd);
    let result = h.orchestrator.execute(request).await;

    assert!(matches!(result, Err(PaymentError::ValidationError(_))));
    let attempts = h.store.attempts().await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].state_name, AttemptState::Failure);
    assert!(h.store.transactions().await.is_empty());
}

#[tokio::test]
async fn test_purchase_without_payment_method_aborts() {
    let h = Harness::new();
    let account = paycontrol::domain::account::Account::new(Uuid::new_v4(), Currency::Usd);
    h.accounts.add_account(account.clone()).await;
    let invoice = h.invoice(&account, dec!(15)).await;

    let report = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice))
        .await
        .unwrap();

    assert_eq!(report.state, AttemptState::Aborted);
    assert!(h.store.transactions().await.is_empty());
    let links = h.links(&invoice).await;
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].amount, dec!(0));
    assert_eq!(links[0].status, InvoicePaymentStatus::Init);
}
