//! Secret store implementations
//!
//! Stores receive rotated values so that consumers can read them:
//! - GitHub Actions repository secrets (`github-actions`)
//! - CircleCI project environment variables (`circleci-env`)
//! - HashiCorp Vault KV v2 (`vault-kv`)
//! - AWS Secrets Manager (`aws-secrets-manager`)
//! - Shell profile exports (`shell-profile`)

mod aws_secrets;
mod circleci;
mod github;
mod shell_profile;
mod vault;

pub use aws_secrets::{AwsSecretsManager, AwsSecretsManagerFactory};
pub use circleci::{CircleCiEnv, CircleCiEnvFactory};
pub use github::{GitHubActions, GitHubActionsFactory};
pub use shell_profile::{ShellProfile, ShellProfileFactory};
pub use vault::{VaultClient, VaultKv, VaultKvFactory};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::cache::{CacheKey, ObjectCache};
use crate::plugin::Registry;

/// Register every built-in store under its package identifier.
pub fn register(registry: &mut Registry) {
    registry.register("github-actions", GitHubActionsFactory);
    registry.register("circleci-env", CircleCiEnvFactory);
    registry.register("vault-kv", VaultKvFactory);
    registry.register("aws-secrets-manager", AwsSecretsManagerFactory);
    registry.register("shell-profile", ShellProfileFactory);
}

/// Store key -> when it was last written, cached under [`CacheKey::StoredKeys`].
pub(crate) type SavedAt = BTreeMap<String, DateTime<Utc>>;

/// Mark `keys` as written just now in an already cached listing.
///
/// Nothing is cached when no listing was made yet: a partial listing would
/// report the other keys as missing.
pub(crate) fn touch_saved<'a>(cache: &ObjectCache, keys: impl IntoIterator<Item = &'a String>) {
    if let Some(mut saved) = cache.get::<SavedAt>(&CacheKey::StoredKeys) {
        let now = Utc::now();
        for key in keys {
            saved.insert(key.clone(), now);
        }
        cache.set(CacheKey::StoredKeys, saved);
    }
}

pub(crate) fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("key-rotator/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")
}

pub(crate) fn token_from_env(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| format!("{} environment variable not set", var))
}

/// Fail with the response body when the status is not a success.
pub(crate) async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("{} failed with status {}: {}", what, status, body);
    }
    Ok(response)
}
