//! Scripted plugins shared by the unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{Disabler, Instance, PluginFactory, PluginManager, Registry, Rotator, SecretValues, Storage};
use crate::config::{PluginConfig, Secret, StorageMap};
use crate::error::KeyNotFound;

/// A capability call recorded by a fake plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub subject: String,
}

impl Call {
    pub fn new(op: &'static str, subject: &str) -> Self {
        Self {
            op,
            subject: subject.to_string(),
        }
    }
}

pub struct NopInstance;

impl Instance for NopInstance {
    fn name(&self) -> &str {
        "nop"
    }
}

/// Builds a fresh [`NopInstance`] each time and counts the builds.
#[derive(Default, Clone)]
pub struct NopFactory {
    pub builds: Arc<AtomicUsize>,
}

#[async_trait]
impl PluginFactory for NopFactory {
    async fn build(&self, _config: &PluginConfig) -> Result<Arc<dyn Instance>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(NopInstance))
    }
}

pub struct ErrorFactory;

#[async_trait]
impl PluginFactory for ErrorFactory {
    async fn build(&self, _config: &PluginConfig) -> Result<Arc<dyn Instance>> {
        Err(anyhow!("bad stuff"))
    }
}

/// Fails until `failures` builds have been attempted, then succeeds.
#[derive(Clone)]
pub struct FlakyFactory {
    pub failures: usize,
    pub attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl PluginFactory for FlakyFactory {
    async fn build(&self, _config: &PluginConfig) -> Result<Arc<dyn Instance>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            Err(anyhow!("transient failure"))
        } else {
            Ok(Arc::new(NopInstance))
        }
    }
}

/// Hands out the same prebuilt instance, counting the builds.
pub struct SharedFactory {
    instance: Arc<dyn Instance>,
    pub builds: Arc<AtomicUsize>,
}

impl SharedFactory {
    pub fn new(instance: Arc<dyn Instance>) -> Self {
        Self {
            instance,
            builds: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl PluginFactory for SharedFactory {
    async fn build(&self, _config: &PluginConfig) -> Result<Arc<dyn Instance>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.instance))
    }
}

/// Rotation and disable client with scripted answers.
pub struct FakeRotator {
    pub last_rotated: DateTime<Utc>,
    pub fail_last_rotated: bool,
    pub fail_rotate: bool,
    pub superseded_at: Option<DateTime<Utc>>,
    pub fail_last_updated: bool,
    pub fail_disable: bool,
    calls: Mutex<Vec<Call>>,
}

impl FakeRotator {
    pub fn new(last_rotated: DateTime<Utc>) -> Self {
        Self {
            last_rotated,
            fail_last_rotated: false,
            fail_rotate: false,
            superseded_at: None,
            fail_last_updated: false,
            fail_disable: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, op: &'static str, secret: &Secret) {
        self.calls.lock().unwrap().push(Call::new(op, secret.name()));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls that change backend state.
    pub fn mutations(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.op == "rotate_secret" || call.op == "disable_secret")
            .count()
    }
}

impl Instance for FakeRotator {
    fn name(&self) -> &str {
        "test"
    }

    fn into_rotator(self: Arc<Self>) -> Option<Arc<dyn Rotator>> {
        Some(self)
    }

    fn into_disabler(self: Arc<Self>) -> Option<Arc<dyn Disabler>> {
        Some(self)
    }
}

#[async_trait]
impl Rotator for FakeRotator {
    async fn last_rotated(&self, secret: &Secret) -> Result<DateTime<Utc>> {
        self.record("last_rotated", secret);
        if self.fail_last_rotated {
            return Err(anyhow!("last rotated bad stuff"));
        }
        Ok(self.last_rotated)
    }

    async fn rotate_secret(&self, secret: &Secret) -> Result<SecretValues> {
        self.record("rotate_secret", secret);
        if self.fail_rotate {
            return Err(anyhow!("rotate bad stuff"));
        }
        Ok(BTreeMap::from([
            ("alpha".to_string(), "one".to_string()),
            ("beta".to_string(), "two".to_string()),
        ]))
    }
}

#[async_trait]
impl Disabler for FakeRotator {
    async fn last_updated(&self, secret: &Secret) -> Result<Option<DateTime<Utc>>> {
        self.record("last_updated", secret);
        if self.fail_last_updated {
            return Err(anyhow!("last updated bad stuff"));
        }
        Ok(self.superseded_at)
    }

    async fn disable_secret(&self, secret: &Secret) -> Result<()> {
        self.record("disable_secret", secret);
        if self.fail_disable {
            return Err(anyhow!("disable bad stuff"));
        }
        Ok(())
    }
}

/// In-memory store keyed by store name.
pub struct FakeStorage {
    pub last_saved: DateTime<Utc>,
    pub fail_last_saved: bool,
    pub fail_save_for: Option<String>,
    /// Cancelled after every successful save.
    pub cancel_on_save: Option<CancellationToken>,
    stored: Mutex<HashMap<String, SecretValues>>,
    saves: Mutex<Vec<(String, SecretValues)>>,
    queried: Mutex<Vec<(String, String)>>,
}

impl FakeStorage {
    pub fn new(last_saved: DateTime<Utc>) -> Self {
        Self {
            last_saved,
            fail_last_saved: false,
            fail_save_for: None,
            cancel_on_save: None,
            stored: Mutex::new(HashMap::new()),
            saves: Mutex::new(Vec::new()),
            queried: Mutex::new(Vec::new()),
        }
    }

    pub fn with_stored(self, store: &str, key: &str, value: &str) -> Self {
        self.stored
            .lock()
            .unwrap()
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn stored(&self, store: &str) -> SecretValues {
        self.stored
            .lock()
            .unwrap()
            .get(store)
            .cloned()
            .unwrap_or_default()
    }

    pub fn saves(&self) -> Vec<(String, SecretValues)> {
        self.saves.lock().unwrap().clone()
    }

    pub fn queried(&self) -> Vec<(String, String)> {
        self.queried.lock().unwrap().clone()
    }
}

impl Instance for FakeStorage {
    fn name(&self) -> &str {
        "test storage"
    }

    fn into_storage(self: Arc<Self>) -> Option<Arc<dyn Storage>> {
        Some(self)
    }
}

#[async_trait]
impl Storage for FakeStorage {
    async fn last_saved(&self, store: &StorageMap, key: &str) -> Result<DateTime<Utc>> {
        self.queried
            .lock()
            .unwrap()
            .push((store.name().to_string(), key.to_string()));
        if self.fail_last_saved {
            return Err(anyhow!("last saved bad stuff"));
        }
        let found = self
            .stored
            .lock()
            .unwrap()
            .get(store.name())
            .is_some_and(|values| values.contains_key(key));
        if !found {
            return Err(KeyNotFound::new(store.name(), key).into());
        }
        Ok(self.last_saved)
    }

    async fn save_keys(&self, store: &StorageMap, values: &SecretValues) -> Result<()> {
        if self.fail_save_for.as_deref() == Some(store.name()) {
            return Err(anyhow!("save bad stuff"));
        }
        self.saves
            .lock()
            .unwrap()
            .push((store.name().to_string(), values.clone()));
        self.stored
            .lock()
            .unwrap()
            .entry(store.name().to_string())
            .or_default()
            .extend(values.clone());
        if let Some(ref cancel) = self.cancel_on_save {
            cancel.cancel();
        }
        Ok(())
    }
}

/// A manager over `registry` with one plugin config per `(name, package)`.
pub fn manager(registry: Registry, plugins: &[(&str, &str)]) -> Arc<PluginManager> {
    let configs = plugins
        .iter()
        .map(|(name, package)| (name.to_string(), PluginConfig::new(*name, *package)))
        .collect();
    Arc::new(PluginManager::new(Arc::new(registry), configs))
}
