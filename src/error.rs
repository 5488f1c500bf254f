//! Error types shared by the plugin layer and the rotation/disablement engines.

use std::fmt;
use thiserror::Error;

/// The capability facets an instance may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Rotation,
    Disable,
    Storage,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Rotation => f.write_str("rotation"),
            Capability::Disable => f.write_str("disable"),
            Capability::Storage => f.write_str("storage"),
        }
    }
}

/// Failures while resolving or constructing a plugin instance.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("no plugin found for package {package:?}")]
    NotFound { package: String },

    #[error("no plugin configuration found for name {name:?}")]
    ConfigNotFound { name: String },

    #[error("error while building plugin {name:?} in package {package:?}: {source:#}")]
    ConstructionFailed {
        name: String,
        package: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("expected a {capability} plugin for client named {name:?}, but {description:?} does not provide it")]
    CapabilityNotSatisfied {
        name: String,
        description: String,
        capability: Capability,
    },
}

/// Returned by a storage plugin when the requested key has never been stored.
///
/// Storage plugins return this inside an `anyhow::Error`; callers recover it
/// with `downcast_ref::<KeyNotFound>()`.
#[derive(Debug, Clone, Error)]
#[error("key {key:?} has never been saved to {store:?}")]
pub struct KeyNotFound {
    pub store: String,
    pub key: String,
}

impl KeyNotFound {
    pub fn new(store: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            key: key.into(),
        }
    }
}

/// Returns true when the error chain carries a [`KeyNotFound`].
pub fn is_key_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<KeyNotFound>().is_some()
}

/// Engine-level failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("{operation} failed for {subject:?}: {source:#}")]
    BackendQuery {
        operation: &'static str,
        subject: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{operation} failed for {subject:?}: {source:#}")]
    BackendMutation {
        operation: &'static str,
        subject: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{failed} of {total} secret(s) failed; first failure: {first}")]
    Batch {
        failed: usize,
        total: usize,
        first: Box<Error>,
    },
}

impl Error {
    pub(crate) fn query(operation: &'static str, subject: &str, source: anyhow::Error) -> Self {
        Error::BackendQuery {
            operation,
            subject: subject.to_string(),
            source,
        }
    }

    pub(crate) fn mutation(operation: &'static str, subject: &str, source: anyhow::Error) -> Self {
        Error::BackendMutation {
            operation,
            subject: subject.to_string(),
            source,
        }
    }
}
