use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Runtime limits of the orchestration core. Env vars: `PAYCONTROL_*`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// How long to wait for the account lock (default 5s).
    pub lock_timeout: Duration,
    /// Upper bound for one dispatched operation, pool wait included (default 30s).
    pub operation_timeout: Duration,
    /// Maximum number of operations in flight (default 16).
    pub worker_pool_size: usize,
    /// Tenant attached to scheduled retries.
    pub tenant_id: Uuid,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
            worker_pool_size: 16,
            tenant_id: Uuid::nil(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            lock_timeout: env_or("PAYCONTROL_LOCK_TIMEOUT_MS", None)
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            operation_timeout: env_or("PAYCONTROL_OPERATION_TIMEOUT_MS", None)
                .map(Duration::from_millis)
                .unwrap_or(defaults.operation_timeout),
            worker_pool_size: env_or("PAYCONTROL_WORKER_POOL_SIZE", Some(defaults.worker_pool_size))
                .unwrap_or(defaults.worker_pool_size),
            tenant_id: env_or("PAYCONTROL_TENANT_ID", Some(defaults.tenant_id))
                .unwrap_or(defaults.tenant_id),
        }
    }
}

/// Settings of the invoice payment control plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoicePluginConfig {
    /// Day offsets for consecutive PAYMENT_FAILURE retries (default 8, 8, 8).
    pub payment_failure_retry_days: Vec<u32>,
    /// First PLUGIN_FAILURE/UNKNOWN retry delay in seconds (default 3600).
    pub plugin_failure_initial_retry_secs: u64,
    /// Growth factor between plugin-failure retries (default 2).
    pub plugin_failure_retry_multiplier: u32,
    /// Attempt count after which plugin failures stop being retried (default 8).
    pub plugin_failure_max_attempts: u32,
    /// Pay zero-balance invoices with a zero amount instead of aborting.
    pub allow_empty_invoice: bool,
}

impl Default for InvoicePluginConfig {
    fn default() -> Self {
        Self {
            payment_failure_retry_days: vec![8, 8, 8],
            plugin_failure_initial_retry_secs: 3600,
            plugin_failure_retry_multiplier: 2,
            plugin_failure_max_attempts: 8,
            allow_empty_invoice: false,
        }
    }
}

impl InvoicePluginConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            payment_failure_retry_days: std::env::var("PAYCONTROL_PAYMENT_FAILURE_RETRY_DAYS")
                .ok()
                .and_then(|v| parse_day_list(&v))
                .unwrap_or(defaults.payment_failure_retry_days),
            plugin_failure_initial_retry_secs: env_or(
                "PAYCONTROL_PLUGIN_FAILURE_INITIAL_RETRY_SECS",
                Some(defaults.plugin_failure_initial_retry_secs),
            )
            .unwrap_or(defaults.plugin_failure_initial_retry_secs),
            plugin_failure_retry_multiplier: env_or(
                "PAYCONTROL_PLUGIN_FAILURE_RETRY_MULTIPLIER",
                Some(defaults.plugin_failure_retry_multiplier),
            )
            .unwrap_or(defaults.plugin_failure_retry_multiplier),
            plugin_failure_max_attempts: env_or(
                "PAYCONTROL_PLUGIN_FAILURE_MAX_ATTEMPTS",
                Some(defaults.plugin_failure_max_attempts),
            )
            .unwrap_or(defaults.plugin_failure_max_attempts),
            allow_empty_invoice: env_or("PAYCONTROL_ALLOW_EMPTY_INVOICE", Some(false))
                .unwrap_or(defaults.allow_empty_invoice),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: Option<T>) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .or(default)
}

/// Parses `"1,3,7"`; any malformed entry rejects the whole list.
fn parse_day_list(value: &str) -> Option<Vec<u32>> {
    value
        .split(',')
        .map(|day| day.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_day_list() {
        assert_eq!(parse_day_list("1,3,7"), Some(vec![1, 3, 7]));
        assert_eq!(parse_day_list(" 2 , 4 "), Some(vec![2, 4]));
        assert_eq!(parse_day_list("1,x"), None);
    }

    #[test]
    fn test_defaults() {
        let config = InvoicePluginConfig::default();
        assert_eq!(config.payment_failure_retry_days, vec![8, 8, 8]);
        assert!(!config.allow_empty_invoice);

        let orchestrator = OrchestratorConfig::default();
        assert_eq!(orchestrator.worker_pool_size, 16);
        assert_eq!(orchestrator.lock_timeout, Duration::from_secs(5));
    }
}
