use crate::config::InvoicePluginConfig;
use crate::domain::payment::TransactionStatus;
use chrono::{DateTime, Duration, Utc};

/// Retry schedule for failed invoice purchases.
///
/// Gateway declines (PAYMENT_FAILURE) follow a fixed list of day offsets.
/// Plugin failures and unknown outcomes back off exponentially from an
/// initial delay until the attempt cap is reached.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    payment_failure_retry_days: Vec<u32>,
    plugin_failure_initial_retry_secs: u64,
    plugin_failure_retry_multiplier: u32,
    plugin_failure_max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(config: &InvoicePluginConfig) -> Self {
        Self {
            payment_failure_retry_days: config.payment_failure_retry_days.clone(),
            plugin_failure_initial_retry_secs: config.plugin_failure_initial_retry_secs,
            plugin_failure_retry_multiplier: config.plugin_failure_retry_multiplier,
            plugin_failure_max_attempts: config.plugin_failure_max_attempts,
        }
    }

    /// `purchase_statuses` are the statuses of every PURCHASE transaction of
    /// the payment, oldest first. The latest one decides which schedule
    /// applies.
    pub fn next_retry_date(
        &self,
        purchase_statuses: &[TransactionStatus],
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match purchase_statuses.last()? {
            TransactionStatus::PaymentFailure => {
                let attempts = count(purchase_statuses, |s| s == TransactionStatus::PaymentFailure);
                self.payment_failure_retry(attempts, now)
            }
            TransactionStatus::PluginFailure | TransactionStatus::Unknown => {
                let attempts = count(purchase_statuses, |s| {
                    matches!(s, TransactionStatus::PluginFailure | TransactionStatus::Unknown)
                });
                self.plugin_failure_retry(attempts, now)
            }
            TransactionStatus::Success | TransactionStatus::Pending => None,
        }
    }

    fn payment_failure_retry(&self, attempts: usize, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let days = *self.payment_failure_retry_days.get(attempts.checked_sub(1)?)?;
        now.checked_add_signed(Duration::try_days(i64::from(days))?)
    }

    fn plugin_failure_retry(&self, attempts: usize, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempts == 0 || attempts >= self.plugin_failure_max_attempts as usize {
            return None;
        }
        let exponent = u32::try_from(attempts - 1).ok()?;
        let factor = u64::from(self.plugin_failure_retry_multiplier).checked_pow(exponent)?;
        let delay = self.plugin_failure_initial_retry_secs.checked_mul(factor)?;
        now.checked_add_signed(Duration::try_seconds(i64::try_from(delay).ok()?)?)
    }
}

fn count(statuses: &[TransactionStatus], pred: impl Fn(TransactionStatus) -> bool) -> usize {
    statuses.iter().copied().filter(|s| pred(*s)).count()
}
