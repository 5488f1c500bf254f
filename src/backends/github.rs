use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use crypto_box::aead::OsRng;
use crypto_box::PublicKey;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{default_timeout, ensure_success, http_client, token_from_env, touch_saved, SavedAt};
use crate::cache::CacheKey;
use crate::config::{PluginConfig, StorageMap};
use crate::error::KeyNotFound;
use crate::plugin::{Instance, PluginFactory, SecretValues, Storage};

const PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct SecretListing {
    total_count: usize,
    secrets: Vec<RepoSecret>,
}

#[derive(Debug, Deserialize)]
struct RepoSecret {
    name: String,
    updated_at: DateTime<Utc>,
}

/// Repository key used to seal secret values, cached under
/// [`CacheKey::PublicKey`].
#[derive(Debug, Clone, Deserialize)]
struct RepoPublicKey {
    key_id: String,
    key: String,
}

#[derive(Debug, Serialize)]
struct EncryptedSecret<'a> {
    encrypted_value: String,
    key_id: &'a str,
}

/// Seal `value` for the repository public key `key` (base64), returning the
/// base64 ciphertext GitHub expects.
fn seal(key: &str, value: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(key)
        .context("Failed to decode repository public key")?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("repository public key is {} bytes, expected 32", bytes.len()))?;

    let sealed = PublicKey::from(bytes)
        .seal(&mut OsRng, value.as_bytes())
        .map_err(|_| anyhow!("Failed to seal secret value"))?;
    Ok(STANDARD.encode(sealed))
}

fn repo_path(store: &StorageMap) -> Result<String> {
    match store.name().split_once('/') {
        Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
            Ok(format!("/repos/{}/{}", owner, repo))
        }
        _ => Err(anyhow!(
            "GitHub store name {:?} is not of the form owner/repo",
            store.name()
        )),
    }
}

/// GitHub Actions repository secrets.
pub struct GitHubActions {
    client: Client,
    api_url: String,
    token: String,
}

impl GitHubActions {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn saved_keys(&self, store: &StorageMap) -> Result<SavedAt> {
        if let Some(saved) = store.cache().get::<SavedAt>(&CacheKey::StoredKeys) {
            return Ok(saved);
        }

        let path = format!("{}/actions/secrets", repo_path(store)?);
        let mut saved = SavedAt::new();
        let mut page = 1;
        loop {
            debug!("Listing action secrets of {} (page {})", store.name(), page);
            let response = self
                .request(Method::GET, &path)
                .query(&[("per_page", PAGE_SIZE), ("page", page)])
                .send()
                .await
                .with_context(|| format!("Failed to list action secrets of {}", store.name()))?;
            let listing: SecretListing = ensure_success(response, "GitHub secret listing")
                .await?
                .json()
                .await
                .context("Failed to parse GitHub secret listing")?;

            let count = listing.secrets.len();
            saved.extend(
                listing
                    .secrets
                    .into_iter()
                    .map(|secret| (secret.name, secret.updated_at)),
            );
            if count < PAGE_SIZE || saved.len() >= listing.total_count {
                break;
            }
            page += 1;
        }

        store.cache().set(CacheKey::StoredKeys, saved.clone());
        Ok(saved)
    }

    async fn public_key(&self, store: &StorageMap) -> Result<RepoPublicKey> {
        if let Some(key) = store.cache().get::<RepoPublicKey>(&CacheKey::PublicKey) {
            return Ok(key);
        }

        let path = format!("{}/actions/secrets/public-key", repo_path(store)?);
        let response = self
            .request(Method::GET, &path)
            .send()
            .await
            .with_context(|| format!("Failed to fetch public key of {}", store.name()))?;
        let key: RepoPublicKey = ensure_success(response, "GitHub public key request")
            .await?
            .json()
            .await
            .context("Failed to parse GitHub public key")?;

        store.cache().set(CacheKey::PublicKey, key.clone());
        Ok(key)
    }
}

impl Instance for GitHubActions {
    fn name(&self) -> &str {
        "GitHub action secrets"
    }

    fn into_storage(self: Arc<Self>) -> Option<Arc<dyn Storage>> {
        Some(self)
    }
}

#[async_trait]
impl Storage for GitHubActions {
    async fn last_saved(&self, store: &StorageMap, key: &str) -> Result<DateTime<Utc>> {
        self.saved_keys(store)
            .await?
            .get(key)
            .copied()
            .ok_or_else(|| KeyNotFound::new(store.name(), key).into())
    }

    async fn save_keys(&self, store: &StorageMap, values: &SecretValues) -> Result<()> {
        let repo = repo_path(store)?;
        let public_key = self.public_key(store).await?;

        for (key, value) in values {
            debug!("Updating action secret {} of {}", key, store.name());
            let body = EncryptedSecret {
                encrypted_value: seal(&public_key.key, value)?,
                key_id: &public_key.key_id,
            };
            let response = self
                .request(Method::PUT, &format!("{}/actions/secrets/{}", repo, key))
                .json(&body)
                .send()
                .await
                .with_context(|| {
                    format!("Failed to update action secret {} of {}", key, store.name())
                })?;
            ensure_success(response, "GitHub secret update").await?;

            touch_saved(store.cache(), [key]);
        }

        info!("Updated {} action secret(s) of {}", values.len(), store.name());
        Ok(())
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GitHubOptions {
    #[serde(default = "default_api_url")]
    api_url: String,
    #[serde(default = "default_token_env")]
    token_env: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    timeout: Duration,
}

pub struct GitHubActionsFactory;

#[async_trait]
impl PluginFactory for GitHubActionsFactory {
    async fn build(&self, config: &PluginConfig) -> Result<Arc<dyn Instance>> {
        let options: GitHubOptions = config.options()?;
        let token = token_from_env(&options.token_env)?;
        Ok(Arc::new(GitHubActions::new(
            options.api_url,
            token,
            options.timeout,
        )?))
    }
}
