use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_iam::types::{AccessKeyMetadata, StatusType};
use aws_sdk_iam::Client as IamClient;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::CacheKey;
use crate::config::{PluginConfig, Secret};
use crate::plugin::{Disabler, Instance, PluginFactory, Rotator, SecretValues};

/// Output key holding the new access key id.
pub const ACCESS_KEY_NAME: &str = "AWS_ACCESS_KEY_ID";
/// Output key holding the new secret access key.
pub const SECRET_KEY_NAME: &str = "AWS_SECRET_ACCESS_KEY";

/// Metadata of one IAM access key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKey {
    pub id: String,
    pub created: DateTime<Utc>,
    pub active: bool,
}

impl AccessKey {
    fn from_metadata(metadata: &AccessKeyMetadata) -> Option<Self> {
        let id = metadata.access_key_id()?.to_string();
        let created = metadata.create_date()?;
        let created = DateTime::from_timestamp(created.secs(), created.subsec_nanos())?;
        let active = !matches!(metadata.status(), Some(StatusType::Inactive));
        Some(Self {
            id,
            created,
            active,
        })
    }
}

/// The oldest and newest keys of a user. With a single key both are the
/// same key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessKeys {
    pub oldest: Option<AccessKey>,
    pub newest: Option<AccessKey>,
}

impl AccessKeys {
    /// The older key, when it is distinct from the newest one.
    fn superseded(&self) -> Option<&AccessKey> {
        match (&self.oldest, &self.newest) {
            (Some(oldest), Some(newest)) if oldest.id != newest.id => Some(oldest),
            _ => None,
        }
    }
}

/// Pick out the oldest and newest keys by creation date.
pub fn examine_keys(keys: &[AccessKey]) -> AccessKeys {
    AccessKeys {
        oldest: keys.iter().min_by_key(|key| key.created).cloned(),
        newest: keys.iter().max_by_key(|key| key.created).cloned(),
    }
}

/// The IAM calls the plugin needs.
#[async_trait]
trait AccessKeyApi: Send + Sync {
    async fn list_keys(&self, user: &str) -> Result<Vec<AccessKey>>;
    async fn delete_key(&self, user: &str, key_id: &str) -> Result<()>;
    /// Returns the new key id and secret.
    async fn create_key(&self, user: &str) -> Result<(String, String)>;
    async fn deactivate_key(&self, user: &str, key_id: &str) -> Result<()>;
}

struct SdkAccessKeys {
    client: IamClient,
}

#[async_trait]
impl AccessKeyApi for SdkAccessKeys {
    async fn list_keys(&self, user: &str) -> Result<Vec<AccessKey>> {
        let response = self
            .client
            .list_access_keys()
            .user_name(user)
            .send()
            .await
            .with_context(|| format!("Failed to list IAM access key metadata for user {:?}", user))?;

        Ok(response
            .access_key_metadata()
            .iter()
            .filter_map(AccessKey::from_metadata)
            .collect())
    }

    async fn delete_key(&self, user: &str, key_id: &str) -> Result<()> {
        self.client
            .delete_access_key()
            .user_name(user)
            .access_key_id(key_id)
            .send()
            .await
            .with_context(|| format!("Failed to delete old access key for IAM user {:?}", user))?;
        Ok(())
    }

    async fn create_key(&self, user: &str) -> Result<(String, String)> {
        let response = self
            .client
            .create_access_key()
            .user_name(user)
            .send()
            .await
            .with_context(|| format!("Failed to create new access key for IAM user {:?}", user))?;

        let key = response
            .access_key()
            .ok_or_else(|| anyhow!("IAM returned no access key for user {:?}", user))?;
        Ok((
            key.access_key_id().to_string(),
            key.secret_access_key().to_string(),
        ))
    }

    async fn deactivate_key(&self, user: &str, key_id: &str) -> Result<()> {
        self.client
            .update_access_key()
            .user_name(user)
            .access_key_id(key_id)
            .status(StatusType::Inactive)
            .send()
            .await
            .with_context(|| {
                format!("Failed to mark old access key of IAM user {:?} inactive", user)
            })?;
        Ok(())
    }
}

/// Rotates and disables IAM user access keys. The secret name is the IAM
/// user name.
pub struct AwsIam {
    api: Box<dyn AccessKeyApi>,
}

impl AwsIam {
    fn new(api: impl AccessKeyApi + 'static) -> Self {
        Self { api: Box::new(api) }
    }

    async fn access_keys(&self, secret: &Secret) -> Result<AccessKeys> {
        if let Some(keys) = secret.cache().get::<AccessKeys>(&CacheKey::AccessKeys) {
            return Ok(keys);
        }

        debug!("Listing access keys of IAM user {}", secret.name());
        let keys = examine_keys(&self.api.list_keys(secret.name()).await?);
        secret.cache().set(CacheKey::AccessKeys, keys.clone());
        Ok(keys)
    }
}

impl Instance for AwsIam {
    fn name(&self) -> &str {
        "AWS IAM"
    }

    fn into_rotator(self: Arc<Self>) -> Option<Arc<dyn Rotator>> {
        Some(self)
    }

    fn into_disabler(self: Arc<Self>) -> Option<Arc<dyn Disabler>> {
        Some(self)
    }
}

#[async_trait]
impl Rotator for AwsIam {
    async fn last_rotated(&self, secret: &Secret) -> Result<DateTime<Utc>> {
        let keys = self.access_keys(secret).await?;
        keys.newest
            .map(|key| key.created)
            .ok_or_else(|| anyhow!("IAM user {:?} has no access keys", secret.name()))
    }

    async fn rotate_secret(&self, secret: &Secret) -> Result<SecretValues> {
        let user = secret.name();
        info!("Rotating access key of IAM user {}", user);

        let keys = self.access_keys(secret).await?;

        // IAM allows two keys per user; make room for the new one.
        if let Some(oldest) = keys.superseded() {
            secret.cache().clear(&CacheKey::AccessKeys);
            self.api.delete_key(user, &oldest.id).await?;
            debug!("Deleted access key {} of IAM user {}", oldest.id, user);
        }

        secret.cache().clear(&CacheKey::AccessKeys);
        let (access_key, secret_key) = self.api.create_key(user).await?;
        info!("Created access key {} for IAM user {}", access_key, user);

        Ok(SecretValues::from([
            (ACCESS_KEY_NAME.to_string(), access_key),
            (SECRET_KEY_NAME.to_string(), secret_key),
        ]))
    }
}

#[async_trait]
impl Disabler for AwsIam {
    async fn last_updated(&self, secret: &Secret) -> Result<Option<DateTime<Utc>>> {
        let keys = self.access_keys(secret).await?;
        let superseded_at = match (keys.superseded(), &keys.newest) {
            (Some(oldest), Some(newest)) if oldest.active => Some(newest.created),
            _ => None,
        };
        Ok(superseded_at)
    }

    async fn disable_secret(&self, secret: &Secret) -> Result<()> {
        let user = secret.name();
        let keys = self.access_keys(secret).await?;

        let Some(oldest) = keys.superseded().filter(|key| key.active) else {
            debug!("IAM user {} has no active superseded key", user);
            return Ok(());
        };

        info!("Disabling old access key {} of IAM user {}", oldest.id, user);
        secret.cache().clear(&CacheKey::AccessKeys);
        self.api.deactivate_key(user, &oldest.id).await
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AwsIamOptions {
    region: Option<String>,
}

pub struct AwsIamFactory;

#[async_trait]
impl PluginFactory for AwsIamFactory {
    async fn build(&self, config: &PluginConfig) -> Result<Arc<dyn Instance>> {
        let options: AwsIamOptions = config.options()?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = options.region {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;

        Ok(Arc::new(AwsIam::new(SdkAccessKeys {
            client: IamClient::new(&sdk_config),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn key(id: &str, day: u32, active: bool) -> AccessKey {
        AccessKey {
            id: id.to_string(),
            created: Utc.with_ymd_and_hms(2022, 4, day, 0, 0, 0).unwrap(),
            active,
        }
    }

    #[derive(Default)]
    struct FakeIam {
        keys: Mutex<Vec<AccessKey>>,
        calls: Mutex<Vec<String>>,
        created: Mutex<u32>,
    }

    impl FakeIam {
        fn with_keys(keys: Vec<AccessKey>) -> Arc<Self> {
            Arc::new(Self {
                keys: Mutex::new(keys),
                ..Self::default()
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AccessKeyApi for Arc<FakeIam> {
        async fn list_keys(&self, user: &str) -> Result<Vec<AccessKey>> {
            self.calls.lock().unwrap().push(format!("list {user}"));
            Ok(self.keys.lock().unwrap().clone())
        }

        async fn delete_key(&self, user: &str, key_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("delete {user} {key_id}"));
            self.keys.lock().unwrap().retain(|key| key.id != key_id);
            Ok(())
        }

        async fn create_key(&self, user: &str) -> Result<(String, String)> {
            self.calls.lock().unwrap().push(format!("create {user}"));
            let mut created = self.created.lock().unwrap();
            *created += 1;
            let id = format!("AKIANEW{}", created);
            self.keys.lock().unwrap().push(AccessKey {
                id: id.clone(),
                created: Utc::now(),
                active: true,
            });
            Ok((id, format!("secret{}", created)))
        }

        async fn deactivate_key(&self, user: &str, key_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("deactivate {user} {key_id}"));
            for key in self.keys.lock().unwrap().iter_mut() {
                if key.id == key_id {
                    key.active = false;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_examine_keys() {
        assert_eq!(examine_keys(&[]), AccessKeys::default());

        let only = key("AKIA1", 1, true);
        let keys = examine_keys(&[only.clone()]);
        assert_eq!(keys.oldest, Some(only.clone()));
        assert_eq!(keys.newest, Some(only));
        assert!(keys.superseded().is_none());

        let keys = examine_keys(&[key("AKIA2", 9, true), key("AKIA1", 1, true)]);
        assert_eq!(keys.oldest.unwrap().id, "AKIA1");
        assert_eq!(keys.newest.unwrap().id, "AKIA2");
    }

    #[tokio::test]
    async fn test_last_rotated_is_cached() {
        let api = FakeIam::with_keys(vec![key("AKIA1", 1, true), key("AKIA2", 9, true)]);
        let iam = AwsIam::new(api.clone());
        let secret = Secret::new("deployer");

        let rotated = iam.last_rotated(&secret).await.unwrap();
        assert_eq!(rotated, key("AKIA2", 9, true).created);
        iam.last_rotated(&secret).await.unwrap();

        assert_eq!(api.calls(), vec!["list deployer"]);
    }

    #[tokio::test]
    async fn test_last_rotated_without_keys() {
        let iam = AwsIam::new(FakeIam::with_keys(vec![]));
        let err = iam.last_rotated(&Secret::new("deployer")).await.unwrap_err();
        assert!(err.to_string().contains("has no access keys"));
    }

    #[tokio::test]
    async fn test_rotate_replaces_oldest_key() {
        let api = FakeIam::with_keys(vec![key("AKIA1", 1, false), key("AKIA2", 9, true)]);
        let iam = AwsIam::new(api.clone());
        let secret = Secret::new("deployer");

        let values = iam.rotate_secret(&secret).await.unwrap();
        assert_eq!(values[ACCESS_KEY_NAME], "AKIANEW1");
        assert_eq!(values[SECRET_KEY_NAME], "secret1");
        assert_eq!(
            api.calls(),
            vec!["list deployer", "delete deployer AKIA1", "create deployer"]
        );

        // cache was cleared, so the next read sees the new key
        let rotated = iam.last_rotated(&secret).await.unwrap();
        assert!(rotated > key("AKIA2", 9, true).created);
        assert_eq!(api.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_rotate_single_key_keeps_it() {
        let api = FakeIam::with_keys(vec![key("AKIA1", 1, true)]);
        let iam = AwsIam::new(api.clone());

        iam.rotate_secret(&Secret::new("deployer")).await.unwrap();
        assert_eq!(api.calls(), vec!["list deployer", "create deployer"]);
        assert_eq!(api.keys.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_last_updated() {
        let secret = Secret::new("deployer");

        let iam = AwsIam::new(FakeIam::with_keys(vec![key("AKIA1", 1, true)]));
        assert_eq!(iam.last_updated(&secret).await.unwrap(), None);

        let secret = Secret::new("deployer");
        let iam = AwsIam::new(FakeIam::with_keys(vec![
            key("AKIA1", 1, true),
            key("AKIA2", 9, true),
        ]));
        assert_eq!(
            iam.last_updated(&secret).await.unwrap(),
            Some(key("AKIA2", 9, true).created)
        );

        let secret = Secret::new("deployer");
        let iam = AwsIam::new(FakeIam::with_keys(vec![
            key("AKIA1", 1, false),
            key("AKIA2", 9, true),
        ]));
        assert_eq!(iam.last_updated(&secret).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_disable_old_key() {
        let api = FakeIam::with_keys(vec![key("AKIA1", 1, true), key("AKIA2", 9, true)]);
        let iam = AwsIam::new(api.clone());
        let secret = Secret::new("deployer");

        iam.disable_secret(&secret).await.unwrap();
        assert_eq!(api.calls(), vec!["list deployer", "deactivate deployer AKIA1"]);

        // already inactive: nothing left to do
        assert_eq!(iam.last_updated(&secret).await.unwrap(), None);
        iam.disable_secret(&secret).await.unwrap();
        assert_eq!(
            api.calls(),
            vec!["list deployer", "deactivate deployer AKIA1", "list deployer"]
        );
    }
}
