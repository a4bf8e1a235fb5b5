use crate::domain::attempt::{AttemptState, PaymentAttempt};
use crate::domain::invoice::AutoPayOffEntry;
use crate::domain::payment::{Payment, PaymentTransaction, TransactionCompletion};
use crate::domain::ports::PaymentStore;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Column Family for payment attempts, keyed by attempt id.
pub const CF_ATTEMPTS: &str = "attempts";
/// Column Family for payments, keyed by payment id.
pub const CF_PAYMENTS: &str = "payments";
/// Column Family for payment transactions, keyed by transaction id.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family for parked AUTO_PAY_OFF purchases, keyed by account id then attempt id.
pub const CF_AUTO_PAY_OFF: &str = "auto_pay_off";

/// A persistent attempt ledger using RocksDB.
///
/// Rows are JSON values in one Column Family per entity. Lookups by external
/// key scan the family and order by creation date.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBPaymentStore {
    db: Arc<DB>,
    /// Serializes read-modify-write updates.
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBPaymentStore {
    /// Opens or creates a RocksDB instance at `path`, creating
    /// missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [CF_ATTEMPTS, CF_PAYMENTS, CF_TRANSACTIONS, CF_AUTO_PAY_OFF]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::default(),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            PaymentError::InternalError(Box::new(std::io::Error::other(format!(
                "{} column family not found",
                name
            ))))
        })
    }

    fn put<T: Serialize>(&self, family: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(family)?;
        self.db.put_cf(cf, key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, family: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(family)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, family: &str, keep: impl Fn(&T) -> bool) -> Result<Vec<T>> {
        let cf = self.cf(family)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            let row: T = serde_json::from_slice(&value)?;
            if keep(&row) {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

fn auto_pay_off_key(entry: &AutoPayOffEntry) -> Vec<u8> {
    let mut key = entry.account_id.as_bytes().to_vec();
    key.extend_from_slice(entry.attempt_id.as_bytes());
    key
}

#[async_trait]
impl PaymentStore for RocksDBPaymentStore {
    async fn insert_attempt(&self, attempt: PaymentAttempt) -> Result<()> {
        self.put(CF_ATTEMPTS, attempt.id.as_bytes(), &attempt)
    }

    async fn update_attempt_state(
        &self,
        attempt_id: Uuid,
        state: AttemptState,
        transaction_id: Option<Uuid>,
        plugin_properties: Vec<u8>,
        updated_date: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut attempt: PaymentAttempt = self
            .get(CF_ATTEMPTS, attempt_id.as_bytes())?
            .ok_or(PaymentError::AttemptNotFound(attempt_id))?;
        attempt.state_name = state;
        attempt.transaction_id = transaction_id.or(attempt.transaction_id);
        attempt.plugin_properties = plugin_properties;
        attempt.updated_date = updated_date;
        self.put(CF_ATTEMPTS, attempt_id.as_bytes(), &attempt)
    }

    async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<PaymentAttempt>> {
        self.get(CF_ATTEMPTS, attempt_id.as_bytes())
    }

    async fn get_attempts_by_transaction_external_key(
        &self,
        transaction_external_key: &str,
    ) -> Result<Vec<PaymentAttempt>> {
        let mut attempts = self.scan(CF_ATTEMPTS, |a: &PaymentAttempt| {
            a.transaction_external_key == transaction_external_key
        })?;
        attempts.sort_by_key(|a| a.created_date);
        Ok(attempts)
    }

    async fn insert_payment(&self, payment: Payment) -> Result<()> {
        self.put(CF_PAYMENTS, payment.id.as_bytes(), &payment)
    }

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>> {
        self.get(CF_PAYMENTS, payment_id.as_bytes())
    }

    async fn get_payment_by_external_key(&self, external_key: &str) -> Result<Option<Payment>> {
        Ok(self
            .scan(CF_PAYMENTS, |p: &Payment| p.external_key == external_key)?
            .into_iter()
            .next())
    }

    async fn insert_transaction(&self, transaction: PaymentTransaction) -> Result<()> {
        self.put(CF_TRANSACTIONS, transaction.id.as_bytes(), &transaction)
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<PaymentTransaction>> {
        self.get(CF_TRANSACTIONS, transaction_id.as_bytes())
    }

    async fn get_transactions_by_external_key(
        &self,
        external_key: &str,
    ) -> Result<Vec<PaymentTransaction>> {
        let mut transactions = self.scan(CF_TRANSACTIONS, |t: &PaymentTransaction| {
            t.external_key == external_key
        })?;
        transactions.sort_by_key(|t| t.created_date);
        Ok(transactions)
    }

    async fn get_transactions_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentTransaction>> {
        let mut transactions =
            self.scan(CF_TRANSACTIONS, |t: &PaymentTransaction| t.payment_id == payment_id)?;
        transactions.sort_by_key(|t| t.created_date);
        Ok(transactions)
    }

    async fn update_payment_and_transaction_on_completion(
        &self,
        payment_id: Uuid,
        transaction_id: Uuid,
        completion: TransactionCompletion,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut payment: Payment = self.get(CF_PAYMENTS, payment_id.as_bytes())?.ok_or_else(|| {
            PaymentError::ValidationError(format!("payment {} not found", payment_id))
        })?;
        let mut transaction: PaymentTransaction = self
            .get(CF_TRANSACTIONS, transaction_id.as_bytes())?
            .ok_or_else(|| {
                PaymentError::ValidationError(format!("transaction {} not found", transaction_id))
            })?;

        payment.state_name = Some(completion.payment_state_name);
        if completion.last_success_state_name.is_some() {
            payment.last_success_state_name = completion.last_success_state_name;
        }
        payment.updated_date = completion.updated_date;
        transaction.status = completion.status;
        transaction.processed_amount = completion.processed_amount;
        transaction.processed_currency = completion.processed_currency;
        transaction.gateway_error_code = completion.gateway_error_code;
        transaction.gateway_error_msg = completion.gateway_error_msg;
        transaction.updated_date = completion.updated_date;

        self.put(CF_PAYMENTS, payment_id.as_bytes(), &payment)?;
        self.put(CF_TRANSACTIONS, transaction_id.as_bytes(), &transaction)
    }

    async fn insert_auto_pay_off(&self, entry: AutoPayOffEntry) -> Result<()> {
        self.put(CF_AUTO_PAY_OFF, &auto_pay_off_key(&entry), &entry)
    }

    async fn get_auto_pay_off_entries(&self, account_id: Uuid) -> Result<Vec<AutoPayOffEntry>> {
        let cf = self.cf(CF_AUTO_PAY_OFF)?;
        let mut entries = Vec::new();
        for item in self.db.prefix_iterator_cf(cf, account_id.as_bytes()) {
            let (key, value) = item?;
            if !key.starts_with(account_id.as_bytes()) {
                break;
            }
            entries.push(serde_json::from_slice(&value)?);
        }
        Ok(entries)
    }
}
