//! Stagehand CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand, ValueEnum};
use stagehand_common::telemetry::LogFormat;

/// Stagehand - ordered deployment of a namespaced application
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable lines
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scale down, reconfigure and bring the application back up in order
    Deploy(commands::deploy::DeployArgs),
    /// Detect stuck workloads and reset them once
    Recover(commands::recover::RecoverArgs),
    /// Regenerate credentials and restart their consumers
    Rotate(commands::rotate::RotateArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Deploy(args) => commands::deploy::run(args).await,
            Commands::Recover(args) => commands::recover::run(args).await,
            Commands::Rotate(args) => commands::rotate::run(args).await,
        }
    }
}
