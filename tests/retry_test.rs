mod common;

use chrono::Duration;
use common::{Harness, invoice_purchase, start};
use paycontrol::config::{InvoicePluginConfig, OrchestratorConfig};
use paycontrol::domain::attempt::{AttemptState, PluginProperty};
use paycontrol::domain::clock::Clock;
use paycontrol::domain::payment::TransactionStatus;
use paycontrol::domain::ports::{PaymentStore, ProcessorError};
use paycontrol::error::PaymentError;
use paycontrol::infrastructure::simulated::SimulatedOutcome;
use paycontrol::plugins::invoice::RETRY_API_PAYMENT_PROPERTY;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn plugin_config(days: Vec<u32>) -> InvoicePluginConfig {
    InvoicePluginConfig {
        payment_failure_retry_days: days,
        plugin_failure_initial_retry_secs: 30,
        plugin_failure_retry_multiplier: 2,
        plugin_failure_max_attempts: 3,
        allow_empty_invoice: false,
    }
}

#[tokio::test]
async fn test_declined_payment_follows_day_schedule() {
    let h = Harness::with_config(OrchestratorConfig::default(), plugin_config(vec![1, 3, 7]));
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(40)).await;
    for _ in 0..4 {
        h.processor.script(SimulatedOutcome::PaymentFailure).await;
    }

    let first = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice).internal())
        .await
        .unwrap();
    assert_eq!(first.state, AttemptState::Retried);
    assert_eq!(first.retry_at, Some(start() + Duration::days(1)));

    let mut previous = first;
    for expected in [Some(start() + Duration::days(4)), Some(start() + Duration::days(11))] {
        h.clock.set(previous.retry_at.unwrap());
        let report = h.orchestrator.retry(previous.attempt_id).await.unwrap();
        assert_eq!(report.state, AttemptState::Retried);
        assert_eq!(report.retry_at, expected);
        // every traversal shares the keys of the first one
        assert_eq!(report.transaction_external_key, previous.transaction_external_key);
        assert_ne!(report.attempt_id, previous.attempt_id);
        previous = report;
    }

    h.clock.set(previous.retry_at.unwrap());
    let last = h.orchestrator.retry(previous.attempt_id).await.unwrap();
    assert_eq!(last.state, AttemptState::Failure);
    assert_eq!(last.retry_at, None);
    assert_eq!(h.scheduler.scheduled().await.len(), 3);
    assert_eq!(h.store.attempts().await.len(), 4);
    assert_eq!(h.balance(&invoice).await, dec!(40));
}

#[tokio::test]
async fn test_plugin_failures_back_off_exponentially() {
    let h = Harness::with_config(OrchestratorConfig::default(), plugin_config(vec![1]));
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(40)).await;
    for _ in 0..3 {
        h.processor.script(SimulatedOutcome::PluginFailure).await;
    }

    let first = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice).internal())
        .await
        .unwrap();
    assert_eq!(first.retry_at, Some(start() + Duration::seconds(30)));

    h.clock.set(first.retry_at.unwrap());
    let second = h.orchestrator.retry(first.attempt_id).await.unwrap();
    assert_eq!(
        second.retry_at,
        Some(start() + Duration::seconds(30) + Duration::seconds(60))
    );

    h.clock.set(second.retry_at.unwrap());
    let third = h.orchestrator.retry(second.attempt_id).await.unwrap();
    assert_eq!(third.state, AttemptState::Failure);
    assert_eq!(third.retry_at, None);
}

#[tokio::test]
async fn test_api_payment_needs_opt_in_to_be_retried() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(40)).await;

    h.processor.script(SimulatedOutcome::PaymentFailure).await;
    let report = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice))
        .await
        .unwrap();
    assert_eq!(report.state, AttemptState::Failure);
    assert!(h.scheduler.scheduled().await.is_empty());

    h.processor.script(SimulatedOutcome::PaymentFailure).await;
    let opted_in = h
        .orchestrator
        .execute(
            invoice_purchase(&account, &invoice)
                .with_property(PluginProperty::new(RETRY_API_PAYMENT_PROPERTY, true)),
        )
        .await
        .unwrap();
    assert_eq!(opted_in.state, AttemptState::Retried);
    assert_eq!(opted_in.retry_at, Some(h.clock.now() + Duration::days(8)));
    assert_eq!(h.scheduler.scheduled().await.len(), 1);
}

#[tokio::test]
async fn test_due_retry_pays_invoice() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(40)).await;
    h.processor.script(SimulatedOutcome::PaymentFailure).await;

    let failed = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice).internal())
        .await
        .unwrap();
    let when = failed.retry_at.unwrap();

    // nothing is due before the retry date
    assert!(h.scheduler.take_due(when - Duration::seconds(1)).await.is_empty());

    h.clock.set(when);
    let due = h.scheduler.take_due(h.clock.now()).await;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].attempt_id, failed.attempt_id);

    let reports = h.orchestrator.run_due_retries(due).await;
    let report = reports.into_iter().next().unwrap().unwrap();
    assert_eq!(report.state, AttemptState::Success);
    assert_eq!(report.transaction.unwrap().status, TransactionStatus::Success);
    assert_eq!(h.balance(&invoice).await, dec!(0));

    let successes = h
        .links(&invoice)
        .await
        .into_iter()
        .filter(|l| l.is_success())
        .count();
    assert_eq!(successes, 1);
    assert_eq!(
        h.store
            .get_attempt(failed.attempt_id)
            .await
            .unwrap()
            .map(|a| a.state_name),
        Some(AttemptState::Failure)
    );
}

#[tokio::test]
async fn test_retry_delivered_twice_runs_once() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(40)).await;
    for _ in 0..2 {
        h.processor.script(SimulatedOutcome::PaymentFailure).await;
    }

    let first = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice).internal())
        .await
        .unwrap();
    h.clock.set(first.retry_at.unwrap());
    let second = h.orchestrator.retry(first.attempt_id).await.unwrap();
    assert_eq!(second.state, AttemptState::Retried);

    let again = h.orchestrator.retry(first.attempt_id).await;
    assert!(matches!(
        again,
        Err(PaymentError::NotRetryable {
            state: AttemptState::Failure,
            ..
        })
    ));
    assert_eq!(h.store.transactions().await.len(), 2);
    assert_eq!(h.scheduler.scheduled().await.len(), 2);

    // only the latest traversal still owns the key pair
    let open: Vec<_> = h
        .store
        .attempts()
        .await
        .into_iter()
        .filter(|a| a.state_name == AttemptState::Retried)
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, second.attempt_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_deliveries_of_one_retry() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(40)).await;
    h.processor.script(SimulatedOutcome::PaymentFailure).await;

    let failed = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice).internal())
        .await
        .unwrap();
    h.clock.set(failed.retry_at.unwrap());

    let (left, right) = tokio::join!(
        h.orchestrator.retry(failed.attempt_id),
        h.orchestrator.retry(failed.attempt_id),
    );

    let (won, lost): (Vec<_>, Vec<_>) = [left, right].into_iter().partition(|r| r.is_ok());
    assert_eq!(won.len(), 1);
    assert_eq!(won[0].as_ref().unwrap().state, AttemptState::Success);
    assert!(matches!(lost[0], Err(PaymentError::NotRetryable { .. })));
    assert_eq!(h.store.transactions().await.len(), 2);
    assert_eq!(h.balance(&invoice).await, dec!(0));
}

#[tokio::test]
async fn test_only_retried_attempts_can_be_retried() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(40)).await;
    let paid = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice))
        .await
        .unwrap();

    let result = h.orchestrator.retry(paid.attempt_id).await;
    assert!(matches!(
        result,
        Err(PaymentError::NotRetryable {
            state: AttemptState::Success,
            ..
        })
    ));

    let missing = Uuid::new_v4();
    let result = h.orchestrator.retry(missing).await;
    assert!(matches!(result, Err(PaymentError::AttemptNotFound(id)) if id == missing));
}

#[tokio::test]
async fn test_gateway_error_is_returned_after_retry_is_scheduled() {
    let h = Harness::new();
    let account = h.account().await;
    let invoice = h.invoice(&account, dec!(40)).await;
    h.processor.script(SimulatedOutcome::Error).await;

    let result = h
        .orchestrator
        .execute(invoice_purchase(&account, &invoice).internal())
        .await;

    assert!(matches!(
        result,
        Err(PaymentError::ProcessorError(ProcessorError::Declined(_)))
    ));
    let attempts = h.store.attempts().await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].state_name, AttemptState::Retried);
    assert_eq!(
        attempts[0].transaction_id,
        h.store.transactions().await.first().map(|t| t.id)
    );

    let scheduled = h.scheduler.scheduled().await;
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].when, start() + Duration::hours(1));
}
