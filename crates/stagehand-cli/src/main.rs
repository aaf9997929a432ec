//! Stagehand CLI
//!
//! Ordered deployment, credential rotation and stuck-workload recovery for a
//! namespaced application.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use stagehand_cli::Cli;
use stagehand_common::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig {
        format: cli.log_format.into(),
        ..TelemetryConfig::default()
    };
    if let Err(e) = init_telemetry(telemetry) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "stagehand failed");
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
