//! Rotation engine
//!
//! Decides whether each secret of a set is due for rotation, asks the rotation
//! client to mint new values, and propagates those values to every store the
//! secret is mapped to.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{KeyMap, Secret, SecretSet, StorageMap};
use crate::error::{is_key_not_found, Error};
use crate::plugin::{PluginManager, Rotator, SecretValues};

/// What happened to one secret during a rotation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Rotation was not due.
    Current,
    /// Rotation was due but the engine is in dry-run mode.
    DryRun,
    /// The secret was rotated. Lists the stores that could not be updated.
    Rotated { failed_stores: Vec<String> },
}

/// Counts for one batch over a secret set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub dry_run: usize,
}

impl BatchSummary {
    /// `Ok(self)` when nothing failed, otherwise a batch error led by the first
    /// failure.
    pub(crate) fn finish(self, failures: Vec<Error>) -> Result<Self, Error> {
        let failed = failures.len();
        match failures.into_iter().next() {
            None => Ok(self),
            Some(first) => Err(Error::Batch {
                failed,
                total: self.total,
                first: Box::new(first),
            }),
        }
    }
}

/// True when more than `limit` has passed since `ts`. A timestamp in the
/// future is never older.
pub(crate) fn older_than(ts: DateTime<Utc>, limit: Duration) -> bool {
    (Utc::now() - ts)
        .to_std()
        .map(|age| age > limit)
        .unwrap_or(false)
}

/// Rename rotation output keys according to a store's key map.
///
/// Keys without a mapping pass through unchanged. A mapped key is replaced by
/// its target name, and a mapped entry wins over a passthrough entry that
/// happens to carry the same name.
pub fn remap_keys(keys: &KeyMap, values: &SecretValues) -> SecretValues {
    let mut remapped = SecretValues::new();
    for (key, value) in values {
        if !keys.contains_key(key) {
            remapped.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in values {
        if let Some(target) = keys.get(key) {
            remapped.insert(target.clone(), value.clone());
        }
    }
    remapped
}

fn store_names(stores: &[StorageMap]) -> String {
    stores
        .iter()
        .map(StorageMap::name)
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct RotationEngine {
    plugins: Arc<PluginManager>,
    dry_run: bool,
    cancel: CancellationToken,
}

impl RotationEngine {
    pub fn new(plugins: Arc<PluginManager>, dry_run: bool) -> Self {
        Self {
            plugins,
            dry_run,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Decide whether `secret` is due for rotation, surfacing every error.
    ///
    /// Due when the last rotation is older than the rotate-after interval, or
    /// when any mapped key in any store was saved before the last rotation (or
    /// was never saved at all).
    pub async fn check_rotation(&self, set: &SecretSet, secret: &Secret) -> Result<bool, Error> {
        let rotator = self.plugins.rotator(set.rotation_client_for(secret)).await?;
        self.rotation_due(set, secret, rotator.as_ref()).await
    }

    /// Like [`check_rotation`](Self::check_rotation), but any error means "not
    /// due". A store that cannot be read holds back the rotation rather than
    /// risk leaving that store with a dead credential.
    pub async fn needs_rotation(&self, set: &SecretSet, secret: &Secret) -> bool {
        match self.check_rotation(set, secret).await {
            Ok(due) => due,
            Err(err) => {
                warn!("Skipping rotation check for {}: {}", secret.name(), err);
                false
            }
        }
    }

    async fn rotation_due(
        &self,
        set: &SecretSet,
        secret: &Secret,
        rotator: &dyn Rotator,
    ) -> Result<bool, Error> {
        let last_rotated = rotator
            .last_rotated(secret)
            .await
            .map_err(|err| Error::query("last_rotated", secret.name(), err))?;

        let rotate_after = set.rotate_after_for(secret);
        if older_than(last_rotated, rotate_after) {
            debug!(
                "Secret {} was last rotated at {} which is more than {:?} ago",
                secret.name(),
                last_rotated,
                rotate_after
            );
            return Ok(true);
        }

        for store in &secret.storages {
            let storage = self.plugins.storage(&store.storage_client).await?;

            for key in store.keys.values() {
                match storage.last_saved(store, key).await {
                    Ok(saved) if saved < last_rotated => {
                        debug!(
                            "Key {} in {} ({}) was saved at {}, before the last rotation at {}",
                            key,
                            store.name(),
                            storage.name(),
                            saved,
                            last_rotated
                        );
                        return Ok(true);
                    }
                    Ok(_) => {}
                    Err(err) if is_key_not_found(&err) => {
                        debug!(
                            "Key {} has never been saved to {} ({})",
                            key,
                            store.name(),
                            storage.name()
                        );
                        return Ok(true);
                    }
                    Err(err) => return Err(Error::query("last_saved", store.name(), err)),
                }
            }
        }

        Ok(false)
    }

    /// Rotate one secret if it is due and push the new values to its stores.
    ///
    /// A store that fails to resolve or save does not stop the remaining
    /// stores; it is reported in [`RotationOutcome::Rotated`].
    pub async fn rotate_secret(
        &self,
        set: &SecretSet,
        secret: &Secret,
    ) -> Result<RotationOutcome, Error> {
        let rotator = self.plugins.rotator(set.rotation_client_for(secret)).await?;

        let due = match self.rotation_due(set, secret, rotator.as_ref()).await {
            Ok(due) => due,
            Err(err) => {
                warn!("Skipping rotation of {}: {}", secret.name(), err);
                false
            }
        };
        if !due {
            debug!("Secret {} does not need rotation", secret.name());
            return Ok(RotationOutcome::Current);
        }

        if self.dry_run {
            info!(
                "Dry run: secret {} would be rotated by {}",
                secret.name(),
                rotator.name()
            );
            for store in &secret.storages {
                info!(
                    "Dry run: secret {} would be saved to {} via {}",
                    secret.name(),
                    store.name(),
                    store.storage_client
                );
            }
            return Ok(RotationOutcome::DryRun);
        }

        info!("Rotating secret {} with {}", secret.name(), rotator.name());
        let values = rotator
            .rotate_secret(secret)
            .await
            .map_err(|err| Error::mutation("rotate_secret", secret.name(), err))?;

        let mut failed_stores = Vec::new();
        for (index, store) in secret.storages.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(
                    "Cancelled while propagating {}; stores still holding the old value: {}",
                    secret.name(),
                    store_names(&secret.storages[index..])
                );
                return Err(Error::Cancelled);
            }

            if let Err(err) = self.save_to(secret, store, &values).await {
                error!(
                    "Failed to update {} with rotated secret {}: {}",
                    store.name(),
                    secret.name(),
                    err
                );
                failed_stores.push(store.name().to_string());
            }
        }

        Ok(RotationOutcome::Rotated { failed_stores })
    }

    async fn save_to(
        &self,
        secret: &Secret,
        store: &StorageMap,
        values: &SecretValues,
    ) -> Result<(), Error> {
        let storage = self.plugins.storage(&store.storage_client).await?;
        let remapped = remap_keys(&store.keys, values);

        storage
            .save_keys(store, &remapped)
            .await
            .map_err(|err| Error::mutation("save_keys", store.name(), err))?;

        info!(
            "Saved {} key(s) of {} to {} ({})",
            remapped.len(),
            secret.name(),
            store.name(),
            storage.name()
        );
        Ok(())
    }

    /// Rotate every secret of `set` in order.
    ///
    /// A failing secret is logged and the batch moves on; the result is an
    /// [`Error::Batch`] when anything failed.
    pub async fn rotate_all(&self, set: &SecretSet) -> Result<BatchSummary, Error> {
        info!("Rotating secret set {}", set.name);

        let mut summary = BatchSummary::default();
        let mut failures = Vec::new();

        for secret in &set.secrets {
            if self.cancel.is_cancelled() {
                warn!("Rotation of {} cancelled", set.name);
                return Err(Error::Cancelled);
            }

            summary.total += 1;
            debug!("Examining secret {} for rotation", secret.name());

            match self.rotate_secret(set, secret).await {
                Ok(RotationOutcome::Current) => summary.unchanged += 1,
                Ok(RotationOutcome::DryRun) => summary.dry_run += 1,
                Ok(RotationOutcome::Rotated { failed_stores }) if failed_stores.is_empty() => {
                    summary.changed += 1
                }
                Ok(RotationOutcome::Rotated { failed_stores }) => {
                    failures.push(Error::mutation(
                        "save_keys",
                        secret.name(),
                        anyhow!(
                            "rotated, but {} store(s) were not updated: {}",
                            failed_stores.len(),
                            failed_stores.join(", ")
                        ),
                    ));
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    error!("Failed to rotate secret {}: {}", secret.name(), err);
                    failures.push(err);
                }
            }
        }

        summary.finish(failures)
    }
}
