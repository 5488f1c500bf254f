use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::cache::ObjectCache;
use crate::plugin::Registry;

/// Rotation output key -> key name used by a particular store.
pub type KeyMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Plugin configurations keyed by their (case-insensitive) name.
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginConfig>,
    #[serde(default)]
    pub secret_sets: Vec<SecretSet>,
}

/// How to build one named plugin instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Filled in from the key under `[plugins]` by [`Config::prepare`].
    #[serde(skip)]
    pub name: String,
    /// Identifier of the registered factory.
    pub package: String,
    #[serde(default, skip_serializing_if = "toml::Table::is_empty")]
    pub options: toml::Table,
}

impl PluginConfig {
    pub fn new(name: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            package: package.into(),
            options: toml::Table::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Deserialize the free-form options table into a plugin's own options type.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T> {
        toml::Value::Table(self.options.clone())
            .try_into()
            .with_context(|| format!("Invalid options for plugin {:?}", self.name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretSet {
    pub name: String,
    /// Plugin performing rotation for every secret in the set.
    pub rotation_client: String,
    /// Plugin performing disablement; defaults to the rotation client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_client: Option<String>,
    #[serde(default = "default_rotate_after", with = "humantime_serde")]
    pub rotate_after: Duration,
    #[serde(default = "default_disable_after", with = "humantime_serde")]
    pub disable_after: Duration,
    #[serde(default)]
    pub secrets: Vec<Secret>,
}

fn default_rotate_after() -> Duration {
    Duration::from_secs(168 * 60 * 60)
}

fn default_disable_after() -> Duration {
    Duration::from_secs(48 * 60 * 60)
}

impl SecretSet {
    pub fn new(name: impl Into<String>, rotation_client: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rotation_client: rotation_client.into(),
            disable_client: None,
            rotate_after: default_rotate_after(),
            disable_after: default_disable_after(),
            secrets: Vec::new(),
        }
    }

    pub fn rotation_client_for<'a>(&'a self, secret: &'a Secret) -> &'a str {
        secret
            .rotation_client
            .as_deref()
            .unwrap_or(&self.rotation_client)
    }

    pub fn disable_client_for<'a>(&'a self, secret: &'a Secret) -> &'a str {
        self.disable_client
            .as_deref()
            .unwrap_or_else(|| self.rotation_client_for(secret))
    }

    pub fn rotate_after_for(&self, secret: &Secret) -> Duration {
        secret.rotate_after.unwrap_or(self.rotate_after)
    }

    pub fn disable_after_for(&self, secret: &Secret) -> Duration {
        secret.disable_after.unwrap_or(self.disable_after)
    }
}

/// One credential to rotate: the server-side identity plus the stores that
/// receive its values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub secret_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_client: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub rotate_after: Option<Duration>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub disable_after: Option<Duration>,
    #[serde(default)]
    pub storages: Vec<StorageMap>,
    #[serde(skip)]
    cache: ObjectCache,
}

impl Secret {
    pub fn new(secret_name: impl Into<String>) -> Self {
        Self {
            secret_name: secret_name.into(),
            rotation_client: None,
            rotate_after: None,
            disable_after: None,
            storages: Vec::new(),
            cache: ObjectCache::new(),
        }
    }

    pub fn with_storage(mut self, storage: StorageMap) -> Self {
        self.storages.push(storage);
        self
    }

    pub fn name(&self) -> &str {
        &self.secret_name
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }
}

/// One destination for a secret's rotated values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageMap {
    pub storage_client: String,
    /// Store-specific identifier, e.g. `owner/repo` or a KV path.
    pub storage_name: String,
    #[serde(default)]
    pub keys: KeyMap,
    #[serde(skip)]
    cache: ObjectCache,
}

impl StorageMap {
    pub fn new(storage_client: impl Into<String>, storage_name: impl Into<String>) -> Self {
        Self {
            storage_client: storage_client.into(),
            storage_name: storage_name.into(),
            keys: KeyMap::new(),
            cache: ObjectCache::new(),
        }
    }

    pub fn with_key(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.keys.insert(from.into(), to.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.storage_name
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(contents).context("Failed to parse config file")?;
        config
            .prepare()
            .context("Unable to finish processing configuration")?;
        Ok(config)
    }

    /// Normalize plugin names and validate cross references.
    pub fn prepare(&mut self) -> Result<()> {
        let plugins = std::mem::take(&mut self.plugins);
        for (name, mut plugin) in plugins {
            let normalized = name.to_lowercase();
            if self.plugins.contains_key(&normalized) {
                bail!(
                    "plugin name {:?} is duplicated (plugin names are case-insensitive)",
                    name
                );
            }
            plugin.name = normalized.clone();
            self.plugins.insert(normalized, plugin);
        }

        let mut set_names = HashSet::new();
        for set in &self.secret_sets {
            if !set_names.insert(set.name.as_str()) {
                bail!("secret set {:?} is duplicated", set.name);
            }

            let context = format!("secret set {:?}", set.name);
            self.check_client(&context, &set.rotation_client)?;
            if let Some(ref client) = set.disable_client {
                self.check_client(&context, client)?;
            }

            let mut secret_names = HashSet::new();
            for secret in &set.secrets {
                if !secret_names.insert(secret.name()) {
                    bail!(
                        "secret {:?} is repeated twice in secret set {:?}",
                        secret.name(),
                        set.name
                    );
                }

                let context = format!("secret {:?}", secret.name());
                if let Some(ref client) = secret.rotation_client {
                    self.check_client(&context, client)?;
                }

                for storage in &secret.storages {
                    self.check_client(&context, &storage.storage_client)?;

                    let mut targets = HashSet::new();
                    for target in storage.keys.values() {
                        if !targets.insert(target.as_str()) {
                            bail!(
                                "key map for store {:?} of secret {:?} maps more than one key to {:?}",
                                storage.name(),
                                secret.name(),
                                target
                            );
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn check_client(&self, context: &str, name: &str) -> Result<()> {
        if self.plugins.contains_key(&name.to_lowercase()) {
            Ok(())
        } else {
            bail!("{} refers to plugin {:?}, which is not configured", context, name)
        }
    }

    /// Fail when a configured plugin names a package nothing registered.
    pub fn check_packages(&self, registry: &Registry) -> Result<()> {
        for plugin in self.plugins.values() {
            if registry.lookup(&plugin.package).is_none() {
                bail!(
                    "plugin {:?} uses package {:?}, which is not available (known packages: {})",
                    plugin.name,
                    plugin.package,
                    registry.packages().join(", ")
                );
            }
        }
        Ok(())
    }

    pub fn find_secret_set(&self, name: &str) -> Result<&SecretSet> {
        self.secret_sets
            .iter()
            .find(|set| set.name == name)
            .ok_or_else(|| anyhow::anyhow!("no secret set named {:?} found in configuration", name))
    }

    /// The named set, or every set when no name is given.
    pub fn select_sets(&self, name: Option<&str>) -> Result<Vec<&SecretSet>> {
        match name {
            Some(name) => Ok(vec![self.find_secret_set(name)?]),
            None => Ok(self.secret_sets.iter().collect()),
        }
    }

    /// Create a sample configuration file
    pub fn create_sample<P: AsRef<Path>>(path: P) -> Result<()> {
        let mut plugins = BTreeMap::new();
        plugins.insert(
            "iam".to_string(),
            PluginConfig::new("iam", "aws-iam").with_option("region", "us-east-1"),
        );
        plugins.insert(
            "github".to_string(),
            PluginConfig::new("github", "github-actions"),
        );
        plugins.insert(
            "circleci".to_string(),
            PluginConfig::new("circleci", "circleci-env"),
        );

        let mut set = SecretSet::new("ci", "iam");
        set.secrets.push(
            Secret::new("ci-deployer")
                .with_storage(
                    StorageMap::new("github", "example/website")
                        .with_key("AWS_ACCESS_KEY_ID", "DEPLOY_AWS_ACCESS_KEY_ID")
                        .with_key("AWS_SECRET_ACCESS_KEY", "DEPLOY_AWS_SECRET_ACCESS_KEY"),
                )
                .with_storage(StorageMap::new("circleci", "gh/example/website")),
        );

        let sample = Self {
            plugins,
            secret_sets: vec![set],
        };

        let toml_string =
            toml::to_string_pretty(&sample).context("Failed to serialize sample config")?;
        fs::write(path.as_ref(), toml_string)
            .with_context(|| format!("Failed to write sample config to {:?}", path.as_ref()))?;

        Ok(())
    }
}
