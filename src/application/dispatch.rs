use crate::domain::ports::AccountLocker;
use crate::error::{PaymentError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, warn};
use uuid::Uuid;

/// Runs `operation` while holding the lock of `account_id`.
///
/// The guard is dropped on every exit path of `operation`, including errors.
pub async fn with_account_lock<F, T>(
    locker: &dyn AccountLocker,
    account_id: Uuid,
    timeout: Duration,
    operation: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let guard = locker
        .lock(account_id, timeout)
        .await
        .inspect_err(|e| warn!(account_id = %account_id, error = %e, "Failed to lock account"))?;
    let result = operation.await;
    drop(guard);
    result
}

/// Bounded pool every orchestrated operation runs through.
///
/// At most `pool_size` operations are in flight at once, and each one
/// (including the wait for a slot) is bounded by `timeout`.
#[derive(Clone)]
pub struct OperationDispatcher {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl OperationDispatcher {
    pub fn new(pool_size: usize, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            timeout,
        }
    }

    pub async fn dispatch<F, T>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let run = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| PaymentError::InternalError(Box::new(e)))?;
            operation.await
        };

        match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                error!(timeout = ?self.timeout, "Payment operation timed out");
                Err(PaymentError::Timeout(self.timeout))
            }
        }
    }

    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }
}
