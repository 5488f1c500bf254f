use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::{touch_saved, SavedAt};
use crate::cache::CacheKey;
use crate::config::{PluginConfig, StorageMap};
use crate::error::KeyNotFound;
use crate::plugin::{Instance, PluginFactory, SecretValues, Storage};

const MARKER: &str = "# Auto-updated by key rotator";

/// `export NAME="value"` lines in a shell configuration file. The store name
/// is the file path, relative to the home directory unless absolute.
///
/// Shell files keep no per-line history, so a key that is exported reports
/// the file's modification time.
pub struct ShellProfile {
    /// Home directory of the user
    home_dir: PathBuf,
}

impl ShellProfile {
    /// Create a ShellProfile for the current user
    pub fn new() -> Result<Self> {
        let home_dir = std::env::var("HOME")
            .context("HOME environment variable not set")?
            .into();
        Ok(Self { home_dir })
    }

    /// Create a ShellProfile for a specific home directory
    pub fn with_home_dir(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    fn profile_path(&self, store: &StorageMap) -> PathBuf {
        self.home_dir.join(store.name())
    }

    /// Every exported variable, stamped with the file's modification time.
    fn saved_keys(&self, store: &StorageMap) -> Result<SavedAt> {
        if let Some(saved) = store.cache().get::<SavedAt>(&CacheKey::StoredKeys) {
            return Ok(saved);
        }

        let path = self.profile_path(store);
        let saved = match read_profile(&path)? {
            Some(content) => {
                let modified = fs::metadata(&path)
                    .and_then(|metadata| metadata.modified())
                    .with_context(|| {
                        format!("Failed to read modification time of {}", path.display())
                    })?;
                let modified = DateTime::<Utc>::from(modified);
                content
                    .lines()
                    .filter_map(exported_name)
                    .map(|name| (name.to_string(), modified))
                    .collect()
            }
            None => SavedAt::new(),
        };

        store.cache().set(CacheKey::StoredKeys, saved.clone());
        Ok(saved)
    }
}

/// The variable assigned by an `export NAME=...` or `NAME=...` line.
fn exported_name(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let assignment = trimmed.strip_prefix("export ").unwrap_or(trimmed).trim_start();
    let (name, _) = assignment.split_once('=')?;
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some(name)
}

fn is_export_of(line: &str, var_name: &str) -> bool {
    exported_name(line) == Some(var_name)
}

fn export_line(var_name: &str, value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    format!("export {}=\"{}\"", var_name, escaped)
}

/// Replace existing exports of each variable and append the ones not found.
fn apply_exports(content: &str, values: &SecretValues) -> String {
    let mut new_content = String::with_capacity(content.len());
    let mut found = Vec::new();

    for line in content.lines() {
        match values.iter().find(|(name, _)| is_export_of(line, name)) {
            Some((name, value)) => {
                new_content.push_str(&export_line(name, value));
                found.push(name.as_str());
            }
            None => new_content.push_str(line),
        }
        new_content.push('\n');
    }

    let missing: Vec<_> = values
        .iter()
        .filter(|(name, _)| !found.contains(&name.as_str()))
        .collect();
    if !missing.is_empty() {
        if !new_content.is_empty() {
            new_content.push('\n');
        }
        new_content.push_str(MARKER);
        new_content.push('\n');
        for (name, value) in missing {
            debug!("{} not found, appending", name);
            new_content.push_str(&export_line(name, value));
            new_content.push('\n');
        }
    }

    new_content
}

fn read_profile(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

impl Instance for ShellProfile {
    fn name(&self) -> &str {
        "shell profile"
    }

    fn into_storage(self: Arc<Self>) -> Option<Arc<dyn Storage>> {
        Some(self)
    }
}

#[async_trait]
impl Storage for ShellProfile {
    async fn last_saved(&self, store: &StorageMap, key: &str) -> Result<DateTime<Utc>> {
        self.saved_keys(store)?
            .get(key)
            .copied()
            .ok_or_else(|| KeyNotFound::new(store.name(), key).into())
    }

    async fn save_keys(&self, store: &StorageMap, values: &SecretValues) -> Result<()> {
        let path = self.profile_path(store);
        let content = read_profile(&path)?.unwrap_or_default();

        fs::write(&path, apply_exports(&content, values))
            .with_context(|| format!("Failed to write to {}", path.display()))?;
        touch_saved(store.cache(), values.keys());

        info!(
            "Updated {} environment variable(s) in {}",
            values.len(),
            path.display()
        );
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShellProfileOptions {
    home: Option<PathBuf>,
}

pub struct ShellProfileFactory;

#[async_trait]
impl PluginFactory for ShellProfileFactory {
    async fn build(&self, config: &PluginConfig) -> Result<Arc<dyn Instance>> {
        let options: ShellProfileOptions = config.options()?;
        let profile = match options.home {
            Some(home) => ShellProfile::with_home_dir(home),
            None => ShellProfile::new()?,
        };
        Ok(Arc::new(profile))
    }
}
