use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
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

#[derive(Debug, Deserialize)]
struct EnvVarPage {
    items: Vec<EnvVar>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnvVar {
    name: String,
}

#[derive(Debug, Serialize)]
struct NewEnvVar<'a> {
    name: &'a str,
    value: &'a str,
}

/// CircleCI project environment variables. The store name is the project
/// slug, e.g. `gh/acme/website`.
///
/// CircleCI keeps no modification times, so a variable that exists is
/// reported as saved when the project was listed.
pub struct CircleCiEnv {
    client: Client,
    host: String,
    token: String,
}

impl CircleCiEnv {
    pub fn new(host: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            host: host.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn request(&self, method: Method, store: &StorageMap) -> RequestBuilder {
        self.client
            .request(
                method,
                format!("{}/api/v2/project/{}/envvar", self.host, store.name()),
            )
            .header("Circle-Token", &self.token)
    }

    async fn saved_keys(&self, store: &StorageMap) -> Result<SavedAt> {
        if let Some(saved) = store.cache().get::<SavedAt>(&CacheKey::StoredKeys) {
            return Ok(saved);
        }

        let listed_at = Utc::now();
        let mut saved = SavedAt::new();
        let mut page_token: Option<String> = None;
        loop {
            debug!("Listing environment variables of {}", store.name());
            let mut request = self.request(Method::GET, store);
            if let Some(ref token) = page_token {
                request = request.query(&[("page-token", token)]);
            }

            let response = request.send().await.with_context(|| {
                format!("Failed to list environment variables of {}", store.name())
            })?;
            let page: EnvVarPage = ensure_success(response, "CircleCI envvar listing")
                .await?
                .json()
                .await
                .context("Failed to parse CircleCI envvar listing")?;

            saved.extend(page.items.into_iter().map(|var| (var.name, listed_at)));

            page_token = page.next_page_token.filter(|token| !token.is_empty());
            if page_token.is_none() {
                break;
            }
        }

        store.cache().set(CacheKey::StoredKeys, saved.clone());
        Ok(saved)
    }
}

impl Instance for CircleCiEnv {
    fn name(&self) -> &str {
        "CircleCI environment variables"
    }

    fn into_storage(self: Arc<Self>) -> Option<Arc<dyn Storage>> {
        Some(self)
    }
}

#[async_trait]
impl Storage for CircleCiEnv {
    async fn last_saved(&self, store: &StorageMap, key: &str) -> Result<DateTime<Utc>> {
        self.saved_keys(store)
            .await?
            .get(key)
            .copied()
            .ok_or_else(|| KeyNotFound::new(store.name(), key).into())
    }

    async fn save_keys(&self, store: &StorageMap, values: &SecretValues) -> Result<()> {
        for (key, value) in values {
            debug!("Setting environment variable {} of {}", key, store.name());
            let response = self
                .request(Method::POST, store)
                .json(&NewEnvVar { name: key, value })
                .send()
                .await
                .with_context(|| {
                    format!("Failed to set environment variable {} of {}", key, store.name())
                })?;
            ensure_success(response, "CircleCI envvar update").await?;
        }

        touch_saved(store.cache(), values.keys());

        info!(
            "Updated {} environment variable(s) of {}",
            values.len(),
            store.name()
        );
        Ok(())
    }
}

fn default_host() -> String {
    "https://circleci.com".to_string()
}

fn default_token_env() -> String {
    "CIRCLECI_TOKEN".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CircleCiOptions {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_token_env")]
    token_env: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    timeout: Duration,
}

pub struct CircleCiEnvFactory;

#[async_trait]
impl PluginFactory for CircleCiEnvFactory {
    async fn build(&self, config: &PluginConfig) -> Result<Arc<dyn Instance>> {
        let options: CircleCiOptions = config.options()?;
        let token = token_from_env(&options.token_env)?;
        Ok(Arc::new(CircleCiEnv::new(
            options.host,
            token,
            options.timeout,
        )?))
    }
}
