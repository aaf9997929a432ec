//! Deploy command

use std::fmt::Write as _;

use clap::Args;
use tracing::info;

use stagehand_common::kube_utils::load_manifest_dir;
use stagehand_deploy::recovery::DetectorAction;
use stagehand_deploy::sequencer::TargetStatus;
use stagehand_deploy::{
    KubeClusterClient, OpenShiftIdentityProvider, PsProcessProbe, RotationRequest, RunReport,
    Sequencer,
};

use super::{emit, parse_rotation, run_context, OutputFormat, TargetArgs};
use crate::Result;

#[derive(Args, Debug)]
pub struct DeployArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Only diff and plan; no mutating call is made
    #[arg(long)]
    pub dry_run: bool,

    /// Regenerate a secret (`name`) or one field (`name/field`); repeatable
    #[arg(long, value_parser = parse_rotation)]
    pub rotate: Vec<RotationRequest>,

    /// Report format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

pub async fn run(args: DeployArgs) -> Result<()> {
    let config = args.target.resolve()?;
    let manifests = load_manifest_dir(&config.manifests)?;
    info!(count = manifests.len(), dir = %config.manifests.display(), "manifests loaded");

    let client = args.target.client().await?;
    let cluster = KubeClusterClient::new(client.clone(), &config.namespace);
    let identity = OpenShiftIdentityProvider::new(client);
    let probe = PsProcessProbe::new(&cluster);
    let ctx = run_context(&config, args.dry_run);

    let sequencer = Sequencer::new(&cluster, &identity, &probe, &config)?;
    let report = sequencer.deploy(&ctx, &manifests, &args.rotate).await?;
    emit(&report, args.output, render)
}

/// One-line description of a detector action
pub fn describe(action: &DetectorAction) -> String {
    match action {
        DetectorAction::Recovered { reason, replicas } => {
            format!("recovered to {} replica(s) ({})", replicas, reason)
        }
        DetectorAction::StillProblematic { observed, .. } => {
            format!("still problematic after one reset: {}", observed)
        }
        DetectorAction::DeletedFailedPods { pods } => {
            format!("deleted failed pods {}", pods.join(", "))
        }
        DetectorAction::WouldRecover { reason } => format!("would recover ({})", reason),
    }
}

fn status_label(status: TargetStatus) -> &'static str {
    match status {
        TargetStatus::Planned => "planned",
        TargetStatus::Ready => "ready",
        TargetStatus::Recovered => "recovered",
    }
}

/// Human-readable summary of a run
pub fn render(report: &RunReport) -> String {
    let mut out = String::new();
    let verb = if report.dry_run { "Planned" } else { "Deployed" };
    let _ = writeln!(
        out,
        "{} {} (environment {})",
        verb, report.namespace, report.environment
    );

    if report.dry_run {
        if !report.diff.is_empty() {
            let _ = writeln!(out, "\nChanges:");
            for diff in &report.diff {
                let _ = writeln!(out, "  {:<10} {}", diff.action, diff.resource);
            }
        }
        let _ = writeln!(out, "\nSteps:");
        for step in &report.plan {
            let _ = writeln!(out, "  {}", step);
        }
    }

    let _ = writeln!(out, "\nTargets:");
    for target in &report.targets {
        let _ = writeln!(
            out,
            "  {:<24} {:<10} replicas={}",
            target.name,
            status_label(target.status),
            target.replicas
        );
    }

    if !report.secrets.secrets.is_empty() {
        let _ = writeln!(out, "\nSecrets:");
        for secret in &report.secrets.secrets {
            let changed = secret.fields.iter().filter(|f| f.changed).count();
            let _ = writeln!(
                out,
                "  {:<32} {} field(s), {} changed",
                secret.name,
                secret.fields.len(),
                changed
            );
        }
    }
    if !report.restarted.is_empty() {
        let _ = writeln!(out, "Restarted: {}", report.restarted.join(", "));
    }
    if !report.force_deleted.is_empty() {
        let _ = writeln!(out, "Force deleted: {}", report.force_deleted.join(", "));
    }

    match (&report.handshake, &report.handshake_error) {
        (Some(h), _) if h.succeeded() => {
            let _ = writeln!(out, "OAuth: proxy restarted after {} lookup(s)", h.attempts);
        }
        (Some(h), _) => {
            let _ = writeln!(
                out,
                "OAuth: {} after {} lookup(s), running without SSO",
                h.state, h.attempts
            );
        }
        (None, Some(e)) => {
            let _ = writeln!(out, "OAuth: {}, running without SSO", e);
        }
        (None, None) => {}
    }
    if let Some(detector) = &report.detector {
        for record in &detector.actions {
            let _ = writeln!(out, "Detector: {} {}", record.target, describe(&record.action));
        }
    }
    if !report.dry_run {
        let _ = writeln!(
            out,
            "Forced recovery: {}",
            if report.forced_recovery { "yes" } else { "no" }
        );
    }
    out
}
