//! Rotate command: regenerate credentials outside a full deployment

use std::collections::HashSet;
use std::fmt::Write as _;

use clap::Args;
use serde::Serialize;
use tracing::info;

use stagehand_common::config::ComponentRef;
use stagehand_deploy::secrets::{discharge_obligations, FieldOutcome};
use stagehand_deploy::{CredentialProvisioner, KubeClusterClient, ProvisionReport, RotationRequest};

use super::{emit, parse_rotation, run_context, OutputFormat, TargetArgs};
use crate::Result;

#[derive(Args, Debug)]
pub struct RotateArgs {
    /// Secrets (`name`) or fields (`name/field`) to regenerate
    #[arg(required = true, value_parser = parse_rotation)]
    pub requests: Vec<RotationRequest>,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Show the decisions without writing
    #[arg(long)]
    pub dry_run: bool,

    /// Report format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// What a rotation did
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateReport {
    /// Provisioning decisions
    #[serde(flatten)]
    pub provision: ProvisionReport,
    /// Consumers given a rolling restart
    pub restarted: Vec<String>,
}

pub async fn run(args: RotateArgs) -> Result<()> {
    let config = args.target.resolve()?;
    let client = args.target.client().await?;
    let cluster = KubeClusterClient::new(client, &config.namespace);
    let ctx = run_context(&config, args.dry_run);

    let provision = CredentialProvisioner::new(&cluster)
        .provision(&ctx, &config.secrets, &args.requests)
        .await?;

    let components: Vec<ComponentRef> = config
        .monitored_components()
        .into_iter()
        .map(|(c, _)| c)
        .collect();
    let restarted = discharge_obligations(
        &cluster,
        &ctx,
        &provision.obligations,
        &components,
        &HashSet::new(),
    )
    .await;
    info!(restarted = restarted.len(), "rotation complete");

    emit(
        &RotateReport {
            provision,
            restarted,
        },
        args.output,
        render,
    )
}

/// Human-readable summary of a rotation
pub fn render(report: &RotateReport) -> String {
    let mut out = String::new();
    for secret in &report.provision.secrets {
        let rotated: Vec<&str> = secret
            .fields
            .iter()
            .filter(|f| f.outcome == FieldOutcome::Rotated)
            .map(|f| f.field.as_str())
            .collect();
        if !rotated.is_empty() {
            let _ = writeln!(out, "{}: rotated {}", secret.name, rotated.join(", "));
        }
    }
    if report.restarted.is_empty() {
        let _ = writeln!(out, "No consumers restarted");
    } else {
        let _ = writeln!(out, "Restarted: {}", report.restarted.join(", "));
    }
    out
}
