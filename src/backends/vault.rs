use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{default_timeout, ensure_success, http_client, token_from_env, touch_saved, SavedAt};
use crate::cache::CacheKey;
use crate::config::{PluginConfig, StorageMap};
use crate::error::KeyNotFound;
use crate::plugin::{Instance, PluginFactory, SecretValues, Storage};

/// HashiCorp Vault client
#[derive(Clone)]
pub struct VaultClient {
    client: Client,
    address: String,
    token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionMetadata {
    /// When this version was written.
    pub created_time: DateTime<Utc>,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSecretData {
    /// Secret fields; values need not be strings.
    pub data: Map<String, Value>,
    pub metadata: VersionMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
struct VaultResponse<T> {
    data: T,
}

#[derive(Debug, Serialize)]
struct VaultWriteRequest<'a> {
    data: &'a Map<String, Value>,
}

impl VaultClient {
    /// Create a new Vault client
    pub fn new(address: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            address: address.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn data_url(&self, mount: &str, path: &str) -> String {
        format!("{}/v1/{}/data/{}", self.address, mount, path)
    }

    /// Read the current version of a KV v2 secret, or `None` if the path
    /// holds no secret.
    pub async fn read_secret(&self, mount: &str, path: &str) -> Result<Option<VaultSecretData>> {
        let url = self.data_url(mount, path);
        debug!("Reading secret from: {}", url);

        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .context("Failed to read secret from Vault")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let vault_response: VaultResponse<VaultSecretData> = ensure_success(response, "Vault read")
            .await?
            .json()
            .await
            .context("Failed to parse Vault response")?;

        Ok(Some(vault_response.data))
    }

    /// Write a new version of a KV v2 secret.
    pub async fn write_secret(
        &self,
        mount: &str,
        path: &str,
        data: &Map<String, Value>,
    ) -> Result<()> {
        let url = self.data_url(mount, path);
        debug!("Writing secret to: {}", url);

        let response = self
            .client
            .post(&url)
            .header("X-Vault-Token", &self.token)
            .json(&VaultWriteRequest { data })
            .send()
            .await
            .context("Failed to write secret to Vault")?;
        ensure_success(response, "Vault write").await?;

        info!("Successfully wrote secret to {}/{}", mount, path);
        Ok(())
    }
}

/// A Vault KV v2 mount used as a store. The store name is the secret path
/// within the mount; rotated keys are merged into the secret's current data.
pub struct VaultKv {
    client: VaultClient,
    mount: String,
}

impl VaultKv {
    pub fn new(client: VaultClient, mount: impl Into<String>) -> Self {
        Self {
            client,
            mount: mount.into(),
        }
    }

    async fn saved_keys(&self, store: &StorageMap) -> Result<SavedAt> {
        if let Some(saved) = store.cache().get::<SavedAt>(&CacheKey::StoredKeys) {
            return Ok(saved);
        }

        let saved: SavedAt = match self.client.read_secret(&self.mount, store.name()).await? {
            Some(secret) => secret
                .data
                .into_iter()
                .map(|(key, _)| (key, secret.metadata.created_time))
                .collect(),
            None => SavedAt::new(),
        };

        store.cache().set(CacheKey::StoredKeys, saved.clone());
        Ok(saved)
    }
}

impl Instance for VaultKv {
    fn name(&self) -> &str {
        "HashiCorp Vault"
    }

    fn into_storage(self: Arc<Self>) -> Option<Arc<dyn Storage>> {
        Some(self)
    }
}

#[async_trait]
impl Storage for VaultKv {
    async fn last_saved(&self, store: &StorageMap, key: &str) -> Result<DateTime<Utc>> {
        self.saved_keys(store)
            .await?
            .get(key)
            .copied()
            .ok_or_else(|| KeyNotFound::new(store.name(), key).into())
    }

    async fn save_keys(&self, store: &StorageMap, values: &SecretValues) -> Result<()> {
        let mut data = self
            .client
            .read_secret(&self.mount, store.name())
            .await?
            .map(|secret| secret.data)
            .unwrap_or_default();
        data.extend(
            values
                .iter()
                .map(|(key, value)| (key.clone(), Value::String(value.clone()))),
        );

        self.client
            .write_secret(&self.mount, store.name(), &data)
            .await?;

        touch_saved(store.cache(), values.keys());
        Ok(())
    }
}

fn default_token_env() -> String {
    "VAULT_TOKEN".to_string()
}

fn default_mount() -> String {
    "secret".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VaultOptions {
    address: Option<String>,
    #[serde(default = "default_token_env")]
    token_env: String,
    #[serde(default = "default_mount")]
    mount: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    timeout: Duration,
}

pub struct VaultKvFactory;

#[async_trait]
impl PluginFactory for VaultKvFactory {
    async fn build(&self, config: &PluginConfig) -> Result<Arc<dyn Instance>> {
        let options: VaultOptions = config.options()?;
        let address = match options.address {
            Some(address) => address,
            None => std::env::var("VAULT_ADDR")
                .context("No Vault address configured and VAULT_ADDR not set")?,
        };
        let token = token_from_env(&options.token_env)?;

        let client = VaultClient::new(address, token, options.timeout)?;
        Ok(Arc::new(VaultKv::new(client, options.mount)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_key_not_found;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn read_body() -> String {
        json!({
            "data": {
                "data": {"DB_PASSWORD": "hunter2", "DB_USER": "admin"},
                "metadata": {
                    "created_time": "2022-04-01T12:30:00.123456Z",
                    "deletion_time": "",
                    "destroyed": false,
                    "version": 3
                }
            }
        })
        .to_string()
    }

    fn vault(server: &Server) -> VaultKv {
        let client = VaultClient::new(server.url(), "test-token", default_timeout()).unwrap();
        VaultKv::new(client, "secret")
    }

    #[test]
    fn test_vault_url_construction() {
        let client =
            VaultClient::new("http://localhost:8200/", "test-token", default_timeout()).unwrap();
        assert_eq!(
            client.data_url("secret", "myapp/db"),
            "http://localhost:8200/v1/secret/data/myapp/db"
        );
    }

    #[tokio::test]
    async fn test_last_saved_uses_version_time() {
        let mut server = Server::new_async().await;
        let read = server
            .mock("GET", "/v1/secret/data/myapp/db")
            .match_header("x-vault-token", "test-token")
            .with_status(200)
            .with_body(read_body())
            .expect(1)
            .create_async()
            .await;

        let vault = vault(&server);
        let store = StorageMap::new("vault", "myapp/db");

        let saved = vault.last_saved(&store, "DB_PASSWORD").await.unwrap();
        assert_eq!(saved.to_rfc3339(), "2022-04-01T12:30:00.123456+00:00");

        let err = vault.last_saved(&store, "API_KEY").await.unwrap_err();
        assert!(is_key_not_found(&err));
        read.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_secret_is_key_not_found() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/secret/data/myapp/new")
            .with_status(404)
            .with_body(json!({"errors": []}).to_string())
            .create_async()
            .await;

        let vault = vault(&server);
        let err = vault
            .last_saved(&StorageMap::new("vault", "myapp/new"), "DB_PASSWORD")
            .await
            .unwrap_err();
        assert!(is_key_not_found(&err));
    }

    #[tokio::test]
    async fn test_forbidden_is_an_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/secret/data/myapp/db")
            .with_status(403)
            .with_body(json!({"errors": ["permission denied"]}).to_string())
            .create_async()
            .await;

        let vault = vault(&server);
        let err = vault
            .last_saved(&StorageMap::new("vault", "myapp/db"), "DB_PASSWORD")
            .await
            .unwrap_err();
        assert!(!is_key_not_found(&err));
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test]
    async fn test_save_keys_merges() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/secret/data/myapp/db")
            .with_status(200)
            .with_body(read_body())
            .create_async()
            .await;
        let write = server
            .mock("POST", "/v1/secret/data/myapp/db")
            .match_body(Matcher::Json(json!({
                "data": {"DB_PASSWORD": "newpass", "DB_USER": "admin"}
            })))
            .with_status(200)
            .with_body(json!({"data": {"version": 4}}).to_string())
            .expect(1)
            .create_async()
            .await;

        let vault = vault(&server);
        let store = StorageMap::new("vault", "myapp/db");
        let values = SecretValues::from([("DB_PASSWORD".to_string(), "newpass".to_string())]);

        vault.save_keys(&store, &values).await.unwrap();
        write.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_string_fields_survive_rotation() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/secret/data/rds/main")
            .with_status(200)
            .with_body(
                json!({
                    "data": {
                        "data": {"username": "admin", "password": "old", "port": 5432},
                        "metadata": {"created_time": "2022-04-01T12:30:00Z", "version": 7}
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;
        let write = server
            .mock("POST", "/v1/secret/data/rds/main")
            .match_body(Matcher::Json(json!({
                "data": {"username": "admin", "password": "new", "port": 5432}
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let vault = vault(&server);
        let store = StorageMap::new("vault", "rds/main");
        assert!(vault.last_saved(&store, "password").await.is_ok());
        assert!(vault.last_saved(&store, "port").await.is_ok());

        let values = SecretValues::from([("password".to_string(), "new".to_string())]);
        vault.save_keys(&store, &values).await.unwrap();
        write.assert_async().await;
    }

    #[tokio::test]
    async fn test_save_keys_creates_missing_secret() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/secret/data/myapp/new")
            .with_status(404)
            .create_async()
            .await;
        let write = server
            .mock("POST", "/v1/secret/data/myapp/new")
            .match_body(Matcher::Json(json!({"data": {"API_KEY": "abc"}})))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let vault = vault(&server);
        let store = StorageMap::new("vault", "myapp/new");
        let values = SecretValues::from([("API_KEY".to_string(), "abc".to_string())]);

        vault.save_keys(&store, &values).await.unwrap();
        write.assert_async().await;
    }
}
