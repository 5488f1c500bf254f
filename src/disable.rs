//! Disablement engine
//!
//! After a rotation the previous credential stays active for a grace period so
//! consumers holding it keep working. Once that period has passed, the engine
//! asks the disable client to deactivate it.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Secret, SecretSet};
use crate::error::Error;
use crate::plugin::{Disabler, PluginManager};
use crate::rotation::{older_than, BatchSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableOutcome {
    /// Nothing superseded, or the grace period has not passed.
    Current,
    DryRun,
    Disabled,
}

pub struct DisablementEngine {
    plugins: Arc<PluginManager>,
    dry_run: bool,
    cancel: CancellationToken,
}

impl DisablementEngine {
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

    /// Decide whether the superseded credential of `secret` should be
    /// disabled, surfacing every error.
    pub async fn check_disablement(&self, set: &SecretSet, secret: &Secret) -> Result<bool, Error> {
        let disabler = self.plugins.disabler(set.disable_client_for(secret)).await?;
        self.disablement_due(set, secret, disabler.as_ref()).await
    }

    /// Like [`check_disablement`](Self::check_disablement), but any error
    /// means "not due".
    pub async fn needs_disablement(&self, set: &SecretSet, secret: &Secret) -> bool {
        match self.check_disablement(set, secret).await {
            Ok(due) => due,
            Err(err) => {
                warn!("Skipping disablement check for {}: {}", secret.name(), err);
                false
            }
        }
    }

    async fn disablement_due(
        &self,
        set: &SecretSet,
        secret: &Secret,
        disabler: &dyn Disabler,
    ) -> Result<bool, Error> {
        let updated = disabler
            .last_updated(secret)
            .await
            .map_err(|err| Error::query("last_updated", secret.name(), err))?;

        let Some(updated) = updated else {
            debug!("Secret {} has no superseded credential", secret.name());
            return Ok(false);
        };

        let disable_after = set.disable_after_for(secret);
        let due = older_than(updated, disable_after);
        if due {
            debug!(
                "Secret {} was superseded at {}, more than {:?} ago",
                secret.name(),
                updated,
                disable_after
            );
        }
        Ok(due)
    }

    /// Disable the superseded credential of one secret if it is due.
    pub async fn disable_secret(
        &self,
        set: &SecretSet,
        secret: &Secret,
    ) -> Result<DisableOutcome, Error> {
        let disabler = self.plugins.disabler(set.disable_client_for(secret)).await?;

        let due = match self.disablement_due(set, secret, disabler.as_ref()).await {
            Ok(due) => due,
            Err(err) => {
                warn!("Skipping disablement of {}: {}", secret.name(), err);
                false
            }
        };
        if !due {
            return Ok(DisableOutcome::Current);
        }

        if self.dry_run {
            info!(
                "Dry run: superseded credential of {} would be disabled by {}",
                secret.name(),
                disabler.name()
            );
            return Ok(DisableOutcome::DryRun);
        }

        info!(
            "Disabling superseded credential of {} with {}",
            secret.name(),
            disabler.name()
        );
        disabler
            .disable_secret(secret)
            .await
            .map_err(|err| Error::mutation("disable_secret", secret.name(), err))?;

        Ok(DisableOutcome::Disabled)
    }

    /// Disable superseded credentials for every secret of `set` in order.
    pub async fn disable_all(&self, set: &SecretSet) -> Result<BatchSummary, Error> {
        info!("Disabling superseded credentials in secret set {}", set.name);

        let mut summary = BatchSummary::default();
        let mut failures = Vec::new();

        for secret in &set.secrets {
            if self.cancel.is_cancelled() {
                warn!("Disablement of {} cancelled", set.name);
                return Err(Error::Cancelled);
            }

            summary.total += 1;
            debug!("Examining secret {} for disablement", secret.name());

            match self.disable_secret(set, secret).await {
                Ok(DisableOutcome::Current) => summary.unchanged += 1,
                Ok(DisableOutcome::DryRun) => summary.dry_run += 1,
                Ok(DisableOutcome::Disabled) => summary.changed += 1,
                Err(err) => {
                    error!("Failed to disable secret {}: {}", secret.name(), err);
                    failures.push(err);
                }
            }
        }

        summary.finish(failures)
    }
}
