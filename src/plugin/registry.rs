use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{Instance, PluginFactory};
use crate::config::PluginConfig;
use crate::error::PluginError;

/// Package identifier -> factory.
#[derive(Default)]
pub struct Registry {
    factories: HashMap<String, Arc<dyn PluginFactory>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every plugin shipped with this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::targets::register(&mut registry);
        crate::backends::register(&mut registry);
        registry
    }

    /// Add a factory under `package`.
    ///
    /// # Panics
    ///
    /// Panics if `package` is already registered. Two plugins claiming the same
    /// identifier is a build mistake, not something to recover from.
    pub fn register<F>(&mut self, package: impl Into<String>, factory: F)
    where
        F: PluginFactory + 'static,
    {
        let package = package.into();
        if self.factories.contains_key(&package) {
            panic!("plugin package {:?} is already registered", package);
        }
        debug!("Registered plugin package {}", package);
        self.factories.insert(package, Arc::new(factory));
    }

    pub fn lookup(&self, package: &str) -> Option<Arc<dyn PluginFactory>> {
        self.factories.get(package).cloned()
    }

    /// Registered package identifiers, sorted.
    pub fn packages(&self) -> Vec<String> {
        let mut packages: Vec<String> = self.factories.keys().cloned().collect();
        packages.sort();
        packages
    }

    /// Build an instance with the factory registered under `package`.
    pub async fn build(
        &self,
        package: &str,
        config: &PluginConfig,
    ) -> Result<Arc<dyn Instance>, PluginError> {
        let factory = self.lookup(package).ok_or_else(|| PluginError::NotFound {
            package: package.to_string(),
        })?;

        factory
            .build(config)
            .await
            .map_err(|source| PluginError::ConstructionFailed {
                name: config.name.clone(),
                package: package.to_string(),
                source,
            })
    }
}
