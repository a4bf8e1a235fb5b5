use super::PaymentControlPlugin;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Name → plugin lookup handed to the runner at construction.
///
/// Plugins may be registered or replaced while operations are running;
/// lookups clone the `Arc` so no lock is held across a plugin call.
#[derive(Default)]
pub struct ControlPluginRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn PaymentControlPlugin>>>,
}

impl ControlPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `plugin` under `name`, returning the plugin it replaced.
    pub fn register(
        &self,
        name: impl Into<String>,
        plugin: Arc<dyn PaymentControlPlugin>,
    ) -> Option<Arc<dyn PaymentControlPlugin>> {
        let name = name.into();
        info!(plugin = %name, "Registering control plugin");
        self.plugins
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, plugin)
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn PaymentControlPlugin>> {
        self.plugins
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    pub fn get_service_for_name(&self, name: &str) -> Option<Arc<dyn PaymentControlPlugin>> {
        self.plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
