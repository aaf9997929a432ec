//! Recover command: one detector pass on demand

use std::fmt::Write as _;

use clap::Args;

use stagehand_deploy::{DetectorReport, KubeClusterClient, MonitoredComponent, StuckDetector};

use super::deploy::describe;
use super::{emit, run_context, OutputFormat, TargetArgs};
use crate::Result;

#[derive(Args, Debug)]
pub struct RecoverArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Report what would be reset without touching anything
    #[arg(long)]
    pub dry_run: bool,

    /// Report format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

pub async fn run(args: RecoverArgs) -> Result<()> {
    let config = args.target.resolve()?;
    let client = args.target.client().await?;
    let cluster = KubeClusterClient::new(client, &config.namespace);
    let ctx = run_context(&config, args.dry_run);

    let components: Vec<MonitoredComponent> = config
        .monitored_components()
        .into_iter()
        .map(MonitoredComponent::from)
        .collect();
    let report = StuckDetector::new(&cluster, &config.detector, &ctx)
        .run_pass(&ctx, &components)
        .await?;
    emit(&report, args.output, render)
}

/// Human-readable summary of a detector pass
pub fn render(report: &DetectorReport) -> String {
    let mut out = String::new();
    for snapshot in &report.snapshots {
        let _ = writeln!(
            out,
            "{:<24} {:<10} restarts={}{}",
            snapshot.target,
            snapshot.phase.as_deref().unwrap_or("no pods"),
            snapshot.restart_count,
            if snapshot.is_crash_looping { " crash-looping" } else { "" }
        );
    }
    if report.actions.is_empty() {
        let _ = writeln!(out, "\nNothing to recover");
    } else {
        let _ = writeln!(out);
        for record in &report.actions {
            let _ = writeln!(out, "{}: {}", record.target, describe(&record.action));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_deploy::model::HealthSnapshot;
    use stagehand_deploy::recovery::{DetectorAction, RecoveryRecord};

    #[test]
    fn summary_lists_snapshots_and_actions() {
        let report = DetectorReport {
            snapshots: vec![
                HealthSnapshot {
                    target: "redis".to_string(),
                    restart_count: 0,
                    phase: Some("Running".to_string()),
                    is_crash_looping: false,
                },
                HealthSnapshot {
                    target: "cost-data-service".to_string(),
                    restart_count: 5,
                    phase: Some("Running".to_string()),
                    is_crash_looping: true,
                },
            ],
            actions: vec![RecoveryRecord {
                target: "cost-data-service".to_string(),
                action: DetectorAction::Recovered {
                    reason: "problematic pods".to_string(),
                    replicas: 2,
                },
            }],
        };
        let text = render(&report);
        assert!(text.contains("restarts=5 crash-looping"));
        assert!(text.contains("cost-data-service: recovered to 2 replica(s)"));

        let healthy = render(&DetectorReport::default());
        assert!(healthy.contains("Nothing to recover"));
    }
}
