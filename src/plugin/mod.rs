//! Plugin abstraction
//!
//! A plugin is built by a [`PluginFactory`] registered in a [`Registry`] under
//! a package identifier. The resulting [`Instance`] may provide any of three
//! capabilities:
//! - [`Rotator`]: mints new credential values for a secret
//! - [`Disabler`]: deactivates a superseded credential
//! - [`Storage`]: records rotated values somewhere consumers read them

mod manager;
mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::PluginManager;
pub use registry::Registry;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{PluginConfig, Secret, StorageMap};

/// Field name -> freshly minted value, as returned by a rotation.
pub type SecretValues = BTreeMap<String, String>;

/// A constructed plugin.
pub trait Instance: Send + Sync {
    /// Descriptive name used in logs and errors.
    fn name(&self) -> &str;

    /// This instance as a [`Rotator`], if it is one.
    fn into_rotator(self: Arc<Self>) -> Option<Arc<dyn Rotator>> {
        None
    }

    /// This instance as a [`Disabler`], if it is one.
    fn into_disabler(self: Arc<Self>) -> Option<Arc<dyn Disabler>> {
        None
    }

    /// This instance as a [`Storage`], if it is one.
    fn into_storage(self: Arc<Self>) -> Option<Arc<dyn Storage>> {
        None
    }
}

/// Performs rotation of a server-side credential.
#[async_trait]
pub trait Rotator: Instance {
    /// When the secret was most recently rotated, as known server-side.
    async fn last_rotated(&self, secret: &Secret) -> Result<DateTime<Utc>>;

    /// Rotate immediately and return every new value.
    ///
    /// Keys of the returned map should be stable for the plugin so operators
    /// can remap them per store.
    async fn rotate_secret(&self, secret: &Secret) -> Result<SecretValues>;
}

/// Deactivates credentials that a rotation has superseded.
#[async_trait]
pub trait Disabler: Instance {
    /// When the still-active older credential was superseded, or `None` if
    /// there is no such credential.
    async fn last_updated(&self, secret: &Secret) -> Result<Option<DateTime<Utc>>>;

    /// Disable every superseded credential of the secret.
    async fn disable_secret(&self, secret: &Secret) -> Result<()>;
}

/// Holds copies of rotated values for consumers.
#[async_trait]
pub trait Storage: Instance {
    /// When `key` was last written to the store.
    ///
    /// Must fail with [`KeyNotFound`](crate::error::KeyNotFound) if the key
    /// has never been stored.
    async fn last_saved(&self, store: &StorageMap, key: &str) -> Result<DateTime<Utc>>;

    /// Write already remapped values to the store.
    async fn save_keys(&self, store: &StorageMap, values: &SecretValues) -> Result<()>;
}

/// Builds plugin instances from their configuration.
#[async_trait]
pub trait PluginFactory: Send + Sync {
    async fn build(&self, config: &PluginConfig) -> Result<Arc<dyn Instance>>;
}
