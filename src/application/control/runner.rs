use super::registry::ControlPluginRegistry;
use crate::domain::context::PaymentControlContext;
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of the prior-call phase: whether a plugin vetoed the operation and
/// the context with every adjustment folded in.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorCallOutcome {
    pub is_aborted: bool,
    pub context: PaymentControlContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnFailureOutcome {
    pub next_retry_date: Option<DateTime<Utc>>,
    pub context: PaymentControlContext,
}

/// Runs the registered control plugins for one pipeline phase.
///
/// Plugins are invoked in the order the caller lists them. Names missing
/// from the registry are skipped.
#[derive(Clone)]
pub struct ControlPluginRunner {
    registry: Arc<ControlPluginRegistry>,
}

impl ControlPluginRunner {
    pub fn new(registry: Arc<ControlPluginRegistry>) -> Self {
        Self { registry }
    }

    /// Stops at the first abort. A plugin error aborts the whole operation
    /// and is returned to the caller.
    pub async fn execute_prior_call(
        &self,
        plugin_names: &[String],
        context: &PaymentControlContext,
    ) -> Result<PriorCallOutcome> {
        let mut current = context.clone();
        for name in plugin_names {
            let Some(plugin) = self.registry.get_service_for_name(name) else {
                warn!(plugin = %name, "Skipping unknown control plugin");
                continue;
            };

            debug!(plugin = %name, attempt_id = %current.attempt_id, "Executing prior call");
            let result = plugin.prior_call(&current).await?;
            current = result.apply(current);

            if result.is_aborted {
                info!(
                    plugin = %name,
                    attempt_id = %current.attempt_id,
                    "Control plugin aborted the payment"
                );
                return Ok(PriorCallOutcome {
                    is_aborted: true,
                    context: current,
                });
            }
        }

        Ok(PriorCallOutcome {
            is_aborted: false,
            context: current,
        })
    }

    /// Every plugin runs; failures are logged and never stop the loop.
    pub async fn execute_on_success_call(
        &self,
        plugin_names: &[String],
        context: &PaymentControlContext,
    ) -> PaymentControlContext {
        let mut current = context.clone();
        for name in plugin_names {
            let Some(plugin) = self.registry.get_service_for_name(name) else {
                warn!(plugin = %name, "Skipping unknown control plugin");
                continue;
            };

            debug!(plugin = %name, attempt_id = %current.attempt_id, "Executing on success call");
            match plugin.on_success_call(&current).await {
                Ok(result) => {
                    if let Some(properties) = result.adjusted_properties {
                        current.properties = properties;
                    }
                }
                Err(e) => {
                    error!(
                        plugin = %name,
                        attempt_id = %current.attempt_id,
                        error = %e,
                        "Control plugin failed on success call"
                    );
                }
            }
        }
        current
    }

    /// Every plugin runs; failures are logged and never stop the loop. The
    /// soonest retry date proposed by any plugin wins.
    pub async fn execute_on_failure_call(
        &self,
        plugin_names: &[String],
        context: &PaymentControlContext,
    ) -> OnFailureOutcome {
        let mut current = context.clone();
        let mut candidate: Option<DateTime<Utc>> = None;
        for name in plugin_names {
            let Some(plugin) = self.registry.get_service_for_name(name) else {
                warn!(plugin = %name, "Skipping unknown control plugin");
                continue;
            };

            debug!(plugin = %name, attempt_id = %current.attempt_id, "Executing on failure call");
            match plugin.on_failure_call(&current).await {
                Ok(result) => {
                    candidate = earliest_retry_date(candidate, result.next_retry_date);
                    if let Some(properties) = result.adjusted_properties {
                        current.properties = properties;
                    }
                }
                Err(e) => {
                    error!(
                        plugin = %name,
                        attempt_id = %current.attempt_id,
                        error = %e,
                        "Control plugin failed on failure call"
                    );
                }
            }
        }

        OnFailureOutcome {
            next_retry_date: candidate,
            context: current,
        }
    }
}

/// The first proposed date seeds the candidate; later ones replace it only
/// when strictly earlier.
fn earliest_retry_date(
    candidate: Option<DateTime<Utc>>,
    next: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (candidate, next) {
        (None, next) => next,
        (Some(current), Some(next)) if next < current => Some(next),
        (current, _) => current,
    }
}
