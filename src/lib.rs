//! Key rotator
//!
//! Rotates machine credentials on a schedule, propagates the new values to
//! the stores their consumers read from, and disables superseded credentials
//! once a grace period has passed.

pub mod backends;
pub mod cache;
pub mod cli;
pub mod config;
pub mod disable;
pub mod error;
pub mod plugin;
pub mod rotation;
pub mod targets;

pub use config::Config;
pub use disable::DisablementEngine;
pub use error::{Error, KeyNotFound, PluginError};
pub use plugin::{PluginManager, Registry};
pub use rotation::RotationEngine;
