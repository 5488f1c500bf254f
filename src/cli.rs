//! CLI parsing and command execution
//!
//! This module handles command-line argument parsing and routes commands to
//! the rotation and disablement engines.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, SecretSet};
use crate::disable::DisablementEngine;
use crate::error::Error;
use crate::plugin::{PluginManager, Registry};
use crate::rotation::{BatchSummary, RotationEngine};

#[derive(Parser)]
#[command(name = "krot")]
#[command(about = "Time-driven rotation of machine credentials with propagation to CI/CD secret stores", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "KEY_ROTATOR_CONFIG", default_value = "key-rotator.toml", global = true)]
    pub config: PathBuf,

    /// Only report what would change
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a sample configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "key-rotator.toml")]
        output: PathBuf,
    },

    /// Rotate every secret of a set that is due (all sets if omitted)
    Rotate {
        /// Name of the secret set
        set: Option<String>,
    },

    /// Disable credentials superseded by an earlier rotation
    Disable {
        /// Name of the secret set
        set: Option<String>,
    },

    /// Report which secrets are due for rotation or disablement
    Check {
        /// Name of the secret set
        set: Option<String>,
    },

    /// List available plugin packages
    Plugins,
}

/// Execute a CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    let registry = Registry::with_builtins();

    let set_name = match cli.command {
        Commands::Init { ref output } => {
            Config::create_sample(output)
                .with_context(|| format!("Failed to create sample config at {:?}", output))?;
            info!("Sample configuration created at {:?}", output);
            return Ok(());
        }
        Commands::Plugins => {
            for package in registry.packages() {
                println!("{}", package);
            }
            return Ok(());
        }
        Commands::Rotate { ref set } | Commands::Disable { ref set } | Commands::Check { ref set } => {
            set.clone()
        }
    };

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
    config.check_packages(&registry)?;
    let sets = config.select_sets(set_name.as_deref())?;

    let plugins = Arc::new(PluginManager::new(
        Arc::new(registry),
        config.plugins.clone(),
    ));
    let cancel = cancel_on_ctrl_c();

    if cli.dry_run {
        info!("Dry run: no credential or store will be modified");
    }

    match cli.command {
        Commands::Rotate { .. } => {
            let engine = RotationEngine::new(plugins, cli.dry_run).with_cancellation(cancel);
            let mut failed = 0;
            for set in sets {
                let result = engine.rotate_all(set).await;
                if !report("Rotation", set, result)? {
                    failed += 1;
                }
            }
            finish("rotation", failed)
        }
        Commands::Disable { .. } => {
            let engine = DisablementEngine::new(plugins, cli.dry_run).with_cancellation(cancel);
            let mut failed = 0;
            for set in sets {
                let result = engine.disable_all(set).await;
                if !report("Disablement", set, result)? {
                    failed += 1;
                }
            }
            finish("disablement", failed)
        }
        Commands::Check { .. } => {
            let rotation = RotationEngine::new(Arc::clone(&plugins), true);
            let disablement = DisablementEngine::new(plugins, true);
            let mut errors = 0;
            for set in sets {
                println!("Secret set {}:", set.name);
                for secret in &set.secrets {
                    if cancel.is_cancelled() {
                        bail!(Error::Cancelled);
                    }
                    let rotate = rotation.check_rotation(set, secret).await;
                    let disable = disablement.check_disablement(set, secret).await;
                    errors += rotate.is_err() as usize + disable.is_err() as usize;
                    println!(
                        "  {}: rotation {}, disablement {}",
                        secret.name(),
                        describe(rotate),
                        describe(disable)
                    );
                }
            }
            if errors > 0 {
                bail!("{} check(s) could not be completed", errors);
            }
            Ok(())
        }
        Commands::Init { .. } | Commands::Plugins => Ok(()),
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current operation");
            token.cancel();
        }
    });
    cancel
}

/// Print the outcome of one batch. Returns whether it succeeded; a cancelled
/// batch stops the run.
fn report(action: &str, set: &SecretSet, result: Result<BatchSummary, Error>) -> Result<bool> {
    match result {
        Ok(summary) => {
            println!(
                "{} of secret set {}: {} secret(s), {} changed, {} unchanged, {} dry run",
                action, set.name, summary.total, summary.changed, summary.unchanged, summary.dry_run
            );
            Ok(true)
        }
        Err(Error::Cancelled) => bail!(Error::Cancelled),
        Err(e) => {
            error!("{} of secret set {} failed: {}", action, set.name, e);
            Ok(false)
        }
    }
}

fn finish(action: &str, failed: usize) -> Result<()> {
    if failed > 0 {
        bail!("{} failed for {} secret set(s)", action, failed);
    }
    Ok(())
}

fn describe(due: Result<bool, Error>) -> String {
    match due {
        Ok(true) => "due".to_string(),
        Ok(false) => "current".to_string(),
        Err(e) => format!("unknown ({})", e),
    }
}
