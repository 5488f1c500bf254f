use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Disabler, Instance, Registry, Rotator, Storage};
use crate::config::PluginConfig;
use crate::error::{Capability, PluginError};

/// Resolves configured plugin names to instances, building each at most once.
///
/// Names are case-insensitive. The instance cache lock is held across a
/// build, so concurrent lookups never construct the same plugin twice. Failed
/// builds are not cached and will be retried on the next lookup.
pub struct PluginManager {
    registry: Arc<Registry>,
    plugins: HashMap<String, PluginConfig>,
    instances: Mutex<HashMap<String, Arc<dyn Instance>>>,
}

impl PluginManager {
    pub fn new(registry: Arc<Registry>, plugins: BTreeMap<String, PluginConfig>) -> Self {
        let plugins = plugins
            .into_iter()
            .map(|(name, mut config)| {
                let name = name.to_lowercase();
                config.name = name.clone();
                (name, config)
            })
            .collect();

        Self {
            registry,
            plugins,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// The instance configured under `name`, building it on first use.
    pub async fn instance(&self, name: &str) -> Result<Arc<dyn Instance>, PluginError> {
        let key = name.to_lowercase();
        let mut instances = self.instances.lock().await;

        if let Some(instance) = instances.get(&key) {
            return Ok(Arc::clone(instance));
        }

        let config = self
            .plugins
            .get(&key)
            .ok_or_else(|| PluginError::ConfigNotFound {
                name: name.to_string(),
            })?;

        debug!("Building plugin {} from package {}", key, config.package);
        let instance = self.registry.build(&config.package, config).await?;
        info!("Initialized plugin {} ({})", key, instance.name());

        instances.insert(key, Arc::clone(&instance));
        Ok(instance)
    }

    pub async fn rotator(&self, name: &str) -> Result<Arc<dyn Rotator>, PluginError> {
        let instance = self.instance(name).await?;
        let description = instance.name().to_string();
        instance
            .into_rotator()
            .ok_or_else(|| unsatisfied(name, description, Capability::Rotation))
    }

    pub async fn disabler(&self, name: &str) -> Result<Arc<dyn Disabler>, PluginError> {
        let instance = self.instance(name).await?;
        let description = instance.name().to_string();
        instance
            .into_disabler()
            .ok_or_else(|| unsatisfied(name, description, Capability::Disable))
    }

    pub async fn storage(&self, name: &str) -> Result<Arc<dyn Storage>, PluginError> {
        let instance = self.instance(name).await?;
        let description = instance.name().to_string();
        instance
            .into_storage()
            .ok_or_else(|| unsatisfied(name, description, Capability::Storage))
    }
}

fn unsatisfied(name: &str, description: String, capability: Capability) -> PluginError {
    PluginError::CapabilityNotSatisfied {
        name: name.to_string(),
        description,
        capability,
    }
}
