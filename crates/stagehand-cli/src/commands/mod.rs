//! CLI commands

use std::path::PathBuf;

use clap::{Args, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stagehand_common::config::{ResolvedConfig, StagehandConfig};
use stagehand_common::kube_utils::create_client;
use stagehand_common::DEFAULT_CONFIG_FILE;
use stagehand_deploy::{RotationRequest, RunContext};

use crate::Result;

pub mod deploy;
pub mod recover;
pub mod rotate;

/// Which configuration, environment and cluster a command works against
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Path to the Stagehand configuration file
    #[arg(
        short = 'f',
        long = "config",
        env = "STAGEHAND_CONFIG",
        default_value = DEFAULT_CONFIG_FILE
    )]
    pub config: PathBuf,

    /// Environment whose overrides apply
    #[arg(short, long, env = "STAGEHAND_ENVIRONMENT", default_value = "default")]
    pub environment: String,

    /// Kubeconfig to use instead of the inferred one
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,
}

impl TargetArgs {
    /// Load, resolve and validate the configuration
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let config = StagehandConfig::load(&self.config)?;
        let resolved = config.resolve(&self.environment)?;
        info!(
            config = %self.config.display(),
            environment = %resolved.environment,
            namespace = %resolved.namespace,
            targets = resolved.targets.len(),
            "configuration loaded"
        );
        Ok(resolved)
    }

    /// Connect to the cluster
    pub async fn client(&self) -> Result<kube::Client> {
        Ok(create_client(self.kubeconfig.as_deref()).await?)
    }
}

/// Report output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary
    #[default]
    Text,
    /// The full report as JSON
    Json,
}

/// Print `report` as JSON or as the given text rendering
pub fn emit<T: Serialize>(
    report: &T,
    format: OutputFormat,
    text: impl FnOnce(&T) -> String,
) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{}", text(report)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

/// Build the run context, cancelled on Ctrl-C
pub fn run_context(config: &ResolvedConfig, dry_run: bool) -> RunContext {
    RunContext::new(&config.environment, &config.namespace)
        .with_dry_run(dry_run)
        .with_timings(config.timings.clone())
        .with_cancel(cancel_on_interrupt())
}

fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping before the next step");
            child.cancel();
        }
    });
    token
}

/// clap value parser for `<secret>` or `<secret>/<field>`
pub fn parse_rotation(s: &str) -> std::result::Result<RotationRequest, String> {
    s.parse::<RotationRequest>().map_err(|e| e.to_string())
}
