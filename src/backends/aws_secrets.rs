use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_secretsmanager::Client as SecretsManagerClient;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::{touch_saved, SavedAt};
use crate::cache::CacheKey;
use crate::config::{PluginConfig, StorageMap};
use crate::error::KeyNotFound;
use crate::plugin::{Instance, PluginFactory, SecretValues, Storage};

/// Current version of a JSON key/value secret.
#[derive(Debug, Clone, Default, PartialEq)]
struct StoredSecret {
    /// Secret fields; values need not be strings.
    values: Map<String, Value>,
    /// When the current version was written.
    changed: Option<DateTime<Utc>>,
}

impl StoredSecret {
    fn saved_at(self) -> SavedAt {
        let changed = self.changed.unwrap_or_default();
        self.values.into_iter().map(|(key, _)| (key, changed)).collect()
    }
}

fn parse_secret_string(id: &str, secret_string: &str) -> Result<Map<String, Value>> {
    serde_json::from_str(secret_string)
        .with_context(|| format!("Failed to parse secret '{}' as a JSON object", id))
}

fn to_chrono(date: &aws_sdk_secretsmanager::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(date.secs(), date.subsec_nanos())
}

/// The Secrets Manager calls the plugin needs.
#[async_trait]
trait SecretsApi: Send + Sync {
    /// The current version, or `None` when no secret has that id.
    async fn read(&self, id: &str) -> Result<Option<StoredSecret>>;
    async fn update(&self, id: &str, secret_string: &str) -> Result<()>;
    async fn create(&self, id: &str, secret_string: &str) -> Result<()>;
}

struct SdkSecrets {
    client: SecretsManagerClient,
}

#[async_trait]
impl SecretsApi for SdkSecrets {
    async fn read(&self, id: &str) -> Result<Option<StoredSecret>> {
        debug!("Reading secret from AWS Secrets Manager: {}", id);

        let response = match self.client.get_secret_value().secret_id(id).send().await {
            Ok(response) => response,
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_resource_not_found_exception())
                    .unwrap_or(false) =>
            {
                return Ok(None);
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to read secret '{}' from AWS Secrets Manager", id)
                })
            }
        };

        let secret_string = response
            .secret_string()
            .ok_or_else(|| anyhow!("Secret '{}' has no string value", id))?;

        Ok(Some(StoredSecret {
            values: parse_secret_string(id, secret_string)?,
            changed: response.created_date().and_then(to_chrono),
        }))
    }

    async fn update(&self, id: &str, secret_string: &str) -> Result<()> {
        self.client
            .update_secret()
            .secret_id(id)
            .secret_string(secret_string)
            .send()
            .await
            .with_context(|| format!("Failed to update secret '{}' in AWS Secrets Manager", id))?;
        Ok(())
    }

    async fn create(&self, id: &str, secret_string: &str) -> Result<()> {
        self.client
            .create_secret()
            .name(id)
            .secret_string(secret_string)
            .send()
            .await
            .with_context(|| format!("Failed to create secret '{}' in AWS Secrets Manager", id))?;
        Ok(())
    }
}

/// AWS Secrets Manager used as a store. The store name is the secret id;
/// the secret holds a JSON object and rotated keys are merged into it.
pub struct AwsSecretsManager {
    api: Box<dyn SecretsApi>,
}

impl AwsSecretsManager {
    fn new(api: impl SecretsApi + 'static) -> Self {
        Self { api: Box::new(api) }
    }

    /// Create a client for `region`, falling back to `AWS_REGION` and then
    /// `us-east-1`.
    pub async fn connect(region: Option<String>) -> Self {
        let region = region.unwrap_or_else(|| {
            std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string())
        });

        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region))
            .load()
            .await;
        Self::new(SdkSecrets {
            client: SecretsManagerClient::new(&config),
        })
    }

    async fn saved_keys(&self, store: &StorageMap) -> Result<SavedAt> {
        if let Some(saved) = store.cache().get::<SavedAt>(&CacheKey::StoredKeys) {
            return Ok(saved);
        }

        let saved = self
            .api
            .read(store.name())
            .await?
            .map(StoredSecret::saved_at)
            .unwrap_or_default();
        store.cache().set(CacheKey::StoredKeys, saved.clone());
        Ok(saved)
    }
}

impl Instance for AwsSecretsManager {
    fn name(&self) -> &str {
        "AWS Secrets Manager"
    }

    fn into_storage(self: Arc<Self>) -> Option<Arc<dyn Storage>> {
        Some(self)
    }
}

#[async_trait]
impl Storage for AwsSecretsManager {
    async fn last_saved(&self, store: &StorageMap, key: &str) -> Result<DateTime<Utc>> {
        self.saved_keys(store)
            .await?
            .get(key)
            .copied()
            .ok_or_else(|| KeyNotFound::new(store.name(), key).into())
    }

    async fn save_keys(&self, store: &StorageMap, values: &SecretValues) -> Result<()> {
        let id = store.name();
        let existing = self.api.read(id).await?;
        let exists = existing.is_some();

        let mut data = existing.map(|secret| secret.values).unwrap_or_default();
        data.extend(
            values
                .iter()
                .map(|(key, value)| (key.clone(), Value::String(value.clone()))),
        );
        let secret_string =
            serde_json::to_string(&data).context("Failed to serialize secret data to JSON")?;

        if exists {
            self.api.update(id, &secret_string).await?;
            info!("Successfully updated secret '{}' in AWS Secrets Manager", id);
        } else {
            self.api.create(id, &secret_string).await?;
            info!("Successfully created secret '{}' in AWS Secrets Manager", id);
        }

        touch_saved(store.cache(), values.keys());
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AwsSecretsOptions {
    region: Option<String>,
}

pub struct AwsSecretsManagerFactory;

#[async_trait]
impl PluginFactory for AwsSecretsManagerFactory {
    async fn build(&self, config: &PluginConfig) -> Result<Arc<dyn Instance>> {
        let options: AwsSecretsOptions = config.options()?;
        Ok(Arc::new(AwsSecretsManager::connect(options.region).await))
    }
}
