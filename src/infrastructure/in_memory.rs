use crate::domain::attempt::{AttemptState, PaymentAttempt};
use crate::domain::invoice::AutoPayOffEntry;
use crate::domain::payment::{Payment, PaymentTransaction, TransactionCompletion};
use crate::domain::ports::{
    AccountLockGuard, AccountLocker, PaymentStore, RetryRequest, RetryScheduler,
};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::warn;
use uuid::Uuid;

#[derive(Default)]
struct Ledger {
    attempts: Vec<PaymentAttempt>,
    payments: HashMap<Uuid, Payment>,
    transactions: Vec<PaymentTransaction>,
    auto_pay_off: Vec<AutoPayOffEntry>,
}

/// A thread-safe in-memory attempt ledger.
///
/// Rows are kept in insertion order so "oldest first" reads need no sort.
/// Ideal for testing and for the scenario CLI.
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    ledger: Arc<RwLock<Ledger>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt recorded so far, oldest first.
    pub async fn attempts(&self) -> Vec<PaymentAttempt> {
        self.ledger.read().await.attempts.clone()
    }

    /// Every transaction recorded so far, oldest first.
    pub async fn transactions(&self) -> Vec<PaymentTransaction> {
        self.ledger.read().await.transactions.clone()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert_attempt(&self, attempt: PaymentAttempt) -> Result<()> {
        self.ledger.write().await.attempts.push(attempt);
        Ok(())
    }

    async fn update_attempt_state(
        &self,
        attempt_id: Uuid,
        state: AttemptState,
        transaction_id: Option<Uuid>,
        plugin_properties: Vec<u8>,
        updated_date: DateTime<Utc>,
    ) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        let attempt = ledger
            .attempts
            .iter_mut()
            .find(|a| a.id == attempt_id)
            .ok_or(PaymentError::AttemptNotFound(attempt_id))?;
        attempt.state_name = state;
        attempt.transaction_id = transaction_id.or(attempt.transaction_id);
        attempt.plugin_properties = plugin_properties;
        attempt.updated_date = updated_date;
        Ok(())
    }

    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<PaymentAttempt>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.attempts.iter().find(|a| a.id == attempt_id).cloned())
    }

    async fn get_attempts_by_transaction_external_key(
        &self,
        transaction_external_key: &str,
    ) -> Result<Vec<PaymentAttempt>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .attempts
            .iter()
            .filter(|a| a.transaction_external_key == transaction_external_key)
            .cloned()
            .collect())
    }

    async fn insert_payment(&self, payment: Payment) -> Result<()> {
        self.ledger
            .write()
            .await
            .payments
            .insert(payment.id, payment);
        Ok(())
    }

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.payments.get(&payment_id).cloned())
    }

    async fn get_payment_by_external_key(&self, external_key: &str) -> Result<Option<Payment>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .payments
            .values()
            .find(|p| p.external_key == external_key)
            .cloned())
    }

    async fn insert_transaction(&self, transaction: PaymentTransaction) -> Result<()> {
        self.ledger.write().await.transactions.push(transaction);
        Ok(())
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<PaymentTransaction>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .transactions
            .iter()
            .find(|t| t.id == transaction_id)
            .cloned())
    }

    async fn get_transactions_by_external_key(
        &self,
        external_key: &str,
    ) -> Result<Vec<PaymentTransaction>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .transactions
            .iter()
            .filter(|t| t.external_key == external_key)
            .cloned()
            .collect())
    }

    async fn get_transactions_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentTransaction>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .transactions
            .iter()
            .filter(|t| t.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn update_payment_and_transaction_on_completion(
        &self,
        payment_id: Uuid,
        transaction_id: Uuid,
        completion: TransactionCompletion,
    ) -> Result<()> {
        let mut ledger = self.ledger.write().await;

        let payment = ledger.payments.get_mut(&payment_id).ok_or_else(|| {
            PaymentError::ValidationError(format!("payment {} not found", payment_id))
        })?;
        payment.state_name = Some(completion.payment_state_name);
        if completion.last_success_state_name.is_some() {
            payment.last_success_state_name = completion.last_success_state_name;
        }
        payment.updated_date = completion.updated_date;

        let transaction = ledger
            .transactions
            .iter_mut()
            .find(|t| t.id == transaction_id)
            .ok_or_else(|| {
                PaymentError::ValidationError(format!("transaction {} not found", transaction_id))
            })?;
        transaction.status = completion.status;
        transaction.processed_amount = completion.processed_amount;
        transaction.processed_currency = completion.processed_currency;
        transaction.gateway_error_code = completion.gateway_error_code;
        transaction.gateway_error_msg = completion.gateway_error_msg;
        transaction.updated_date = completion.updated_date;
        Ok(())
    }

    async fn insert_auto_pay_off(&self, entry: AutoPayOffEntry) -> Result<()> {
        self.ledger.write().await.auto_pay_off.push(entry);
        Ok(())
    }

    async fn get_auto_pay_off_entries(&self, account_id: Uuid) -> Result<Vec<AutoPayOffEntry>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .auto_pay_off
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect())
    }
}

type LockMap = Arc<StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>>;

/// Process-local account lock: one async mutex per account id.
///
/// An account's mutex is dropped from the map once nobody holds or waits
/// for it.
#[derive(Default, Clone)]
pub struct InMemoryAccountLocker {
    locks: LockMap,
}

impl InMemoryAccountLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_map(locks: &LockMap) -> MutexGuard<'_, HashMap<Uuid, Arc<Mutex<()>>>> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases the account mutex, then forgets it if it is idle.
struct HeldAccount {
    account_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl Drop for HeldAccount {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock_map(&self.locks);
        if locks
            .get(&self.account_id)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&self.account_id);
        }
    }
}

#[async_trait]
impl AccountLocker for InMemoryAccountLocker {
    async fn lock(&self, account_id: Uuid, timeout: Duration) -> Result<AccountLockGuard> {
        let mutex = lock_map(&self.locks)
            .entry(account_id)
            .or_default()
            .clone();

        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(AccountLockGuard::new(
                account_id,
                HeldAccount {
                    account_id,
                    guard: Some(guard),
                    locks: self.locks.clone(),
                },
            )),
            Err(_) => {
                warn!(account_id = %account_id, ?timeout, "Timed out waiting for account lock");
                Err(PaymentError::LockTimeout(account_id))
            }
        }
    }
}

/// Keeps scheduled retries in memory until a caller drains the due ones.
#[derive(Default, Clone)]
pub struct InMemoryRetryScheduler {
    queue: Arc<RwLock<Vec<RetryRequest>>>,
}

impl InMemoryRetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything still waiting, in scheduling order.
    pub async fn scheduled(&self) -> Vec<RetryRequest> {
        self.queue.read().await.clone()
    }

    /// Removes and returns the requests due at `now`, earliest first.
    pub async fn take_due(&self, now: DateTime<Utc>) -> Vec<RetryRequest> {
        let mut queue = self.queue.write().await;
        let (mut due, pending): (Vec<_>, Vec<_>) =
            queue.drain(..).partition(|r| r.when <= now);
        *queue = pending;
        due.sort_by_key(|r| r.when);
        due
    }
}

#[async_trait]
impl RetryScheduler for InMemoryRetryScheduler {
    async fn schedule_retry(&self, request: RetryRequest) -> Result<()> {
        self.queue.write().await.push(request);
        Ok(())
    }
}
