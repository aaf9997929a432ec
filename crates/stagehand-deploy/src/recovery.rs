//! Stuck-deployment detector and recovery
//!
//! One pass inspects every monitored component once. A component with a
//! problematic pod, or whose rollout is still waiting after a short probe,
//! gets a single reset cycle: scale to 0, wait for its pods to go, scale back
//! to the prior replica count. Whatever is observed after that is reported,
//! not retried; the pass never loops.
//!
//! Auxiliary components whose only problem is pods in the terminal `Failed`
//! phase have those pods deleted instead; their controller recreates them.

use serde::Serialize;
use tracing::{info, instrument, warn};

use stagehand_common::config::{ComponentRef, DetectorConfig};
use stagehand_common::{Error, Result};

use crate::cluster::ClusterClient;
use crate::context::RunContext;
use crate::model::{HealthSnapshot, PodInfo, RolloutStatus};
use crate::readiness::{PodsGone, Readiness, ReadinessWaiter};

/// Pod phases and container reasons treated as a crash or error
pub const PROBLEM_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "Error",
    "Failed",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
];

const FAILED_PHASE: &str = "Failed";

/// A component the detector inspects
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitoredComponent {
    /// The workload
    pub component: ComponentRef,
    /// Stateless helper whose failed pods may be deleted directly
    pub auxiliary: bool,
}

impl From<(ComponentRef, bool)> for MonitoredComponent {
    fn from((component, auxiliary): (ComponentRef, bool)) -> Self {
        Self {
            component,
            auxiliary,
        }
    }
}

/// What the detector did about one component
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum DetectorAction {
    /// Scale cycle completed and the component looked healthy afterwards
    Recovered {
        /// Why recovery ran
        reason: String,
        /// Replica count restored
        replicas: i32,
    },
    /// Scale cycle completed but the problem was still observed
    StillProblematic {
        /// Why recovery ran
        reason: String,
        /// What was observed afterwards
        observed: String,
    },
    /// Failed auxiliary pods were deleted
    DeletedFailedPods {
        /// Pods deleted
        pods: Vec<String>,
    },
    /// Dry run: recovery would have run
    WouldRecover {
        /// Why
        reason: String,
    },
}

/// Action taken for one component
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryRecord {
    /// Component name
    pub target: String,
    /// What was done
    #[serde(flatten)]
    pub action: DetectorAction,
}

/// Result of one detector pass
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorReport {
    /// Health of every monitored component before any action
    pub snapshots: Vec<HealthSnapshot>,
    /// Actions taken, at most one per component
    pub actions: Vec<RecoveryRecord>,
}

impl DetectorReport {
    /// Names of components that went through a scale cycle
    pub fn cycled(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter(|r| {
                matches!(
                    r.action,
                    DetectorAction::Recovered { .. } | DetectorAction::StillProblematic { .. }
                )
            })
            .map(|r| r.target.as_str())
            .collect()
    }

    /// Whether any forced action (cycle or pod deletion) ran
    pub fn forced_recovery(&self) -> bool {
        self.actions
            .iter()
            .any(|r| !matches!(r.action, DetectorAction::WouldRecover { .. }))
    }
}

/// Whether a pod counts as problematic under `threshold`
pub fn is_problematic(pod: &PodInfo, restart_threshold: i32) -> bool {
    !pod.terminating
        && (pod.restart_count > restart_threshold
            || PROBLEM_REASONS.contains(&pod.phase.as_str())
            || pod.reasons.iter().any(|r| PROBLEM_REASONS.contains(&r.as_str())))
}

/// Summarize a component's pods
pub fn health_snapshot(target: &str, pods: &[PodInfo], restart_threshold: i32) -> HealthSnapshot {
    let worst = pods
        .iter()
        .find(|p| is_problematic(p, restart_threshold))
        .or_else(|| pods.first());
    HealthSnapshot {
        target: target.to_string(),
        restart_count: pods.iter().map(|p| p.restart_count).max().unwrap_or(0),
        phase: worst.map(|p| p.phase.clone()),
        is_crash_looping: pods.iter().any(|p| is_problematic(p, restart_threshold)),
    }
}

fn describe(pod: &PodInfo) -> String {
    let mut desc = format!("{} {} restarts={}", pod.name, pod.phase, pod.restart_count);
    if !pod.reasons.is_empty() {
        desc.push_str(&format!(" ({})", pod.reasons.join(", ")));
    }
    desc
}

/// Runs detector passes over a set of components
pub struct StuckDetector<'a> {
    cluster: &'a dyn ClusterClient,
    config: &'a DetectorConfig,
    waiter: ReadinessWaiter<'a>,
    grace_seconds: u32,
}

impl<'a> StuckDetector<'a> {
    /// Create a detector; `ctx` supplies the poll interval and drain grace
    pub fn new(
        cluster: &'a dyn ClusterClient,
        config: &'a DetectorConfig,
        ctx: &RunContext,
    ) -> Self {
        Self {
            cluster,
            config,
            waiter: ReadinessWaiter::new(cluster, ctx.timings.poll_interval),
            grace_seconds: ctx.timings.drain_grace_seconds,
        }
    }

    /// Inspect every component once and recover the stuck ones
    #[instrument(skip_all, fields(components = components.len(), dry_run = ctx.dry_run))]
    pub async fn run_pass(
        &self,
        ctx: &RunContext,
        components: &[MonitoredComponent],
    ) -> Result<DetectorReport> {
        let mut report = DetectorReport::default();

        for monitored in components {
            ctx.checkpoint("detector")?;
            let component = &monitored.component;
            let selector = component.selector();

            let pods = self.cluster.pods(&selector).await?;
            let snapshot = health_snapshot(&component.name, &pods, self.config.restart_threshold);
            report.snapshots.push(snapshot);

            let problematic: Vec<&PodInfo> = pods
                .iter()
                .filter(|p| is_problematic(p, self.config.restart_threshold))
                .collect();

            let reason = if !problematic.is_empty() {
                if monitored.auxiliary && problematic.iter().all(|p| p.phase == FAILED_PHASE) {
                    let action = self.delete_failed(ctx, &problematic).await?;
                    report.actions.push(RecoveryRecord {
                        target: component.name.clone(),
                        action,
                    });
                    continue;
                }
                format!(
                    "problematic pods: {}",
                    problematic
                        .iter()
                        .map(|p| describe(p))
                        .collect::<Vec<_>>()
                        .join("; ")
                )
            } else {
                match self.probe_rollout(ctx, component).await? {
                    Some(reason) => reason,
                    None => continue,
                }
            };

            warn!(workload = %component.name, %reason, "stuck deployment detected");
            let action = if ctx.dry_run {
                DetectorAction::WouldRecover { reason }
            } else {
                self.recover(ctx, component, reason).await?
            };
            report.actions.push(RecoveryRecord {
                target: component.name.clone(),
                action,
            });
        }

        Ok(report)
    }

    /// `Some(reason)` when the rollout is still waiting after the probe timeout
    async fn probe_rollout(
        &self,
        ctx: &RunContext,
        component: &ComponentRef,
    ) -> Result<Option<String>> {
        match self.cluster.rollout_status(component).await? {
            RolloutStatus::Complete | RolloutStatus::NotFound => return Ok(None),
            RolloutStatus::Progressing(_) | RolloutStatus::Failed(_) => {}
        }
        match self
            .waiter
            .wait_ready(ctx, component, self.config.probe_timeout)
            .await
        {
            Readiness::Ready => Ok(None),
            Readiness::TimedOut { last_status } => Ok(Some(format!(
                "rollout still waiting after {}s: {}",
                self.config.probe_timeout.as_secs(),
                last_status
            ))),
            Readiness::Cancelled => Err(Error::cancelled("detector")),
        }
    }

    async fn delete_failed(&self, ctx: &RunContext, pods: &[&PodInfo]) -> Result<DetectorAction> {
        let names: Vec<String> = pods.iter().map(|p| p.name.clone()).collect();
        if ctx.dry_run {
            return Ok(DetectorAction::WouldRecover {
                reason: format!("failed pods: {}", names.join(", ")),
            });
        }
        for name in &names {
            self.cluster.delete_pod(name, self.grace_seconds).await?;
            info!(pod = %name, "deleted failed auxiliary pod");
        }
        Ok(DetectorAction::DeletedFailedPods { pods: names })
    }

    /// One bounded reset cycle
    async fn recover(
        &self,
        ctx: &RunContext,
        component: &ComponentRef,
        reason: String,
    ) -> Result<DetectorAction> {
        let prior = self.cluster.replicas(component).await?;
        let replicas = prior.filter(|n| *n > 0).unwrap_or(1);
        let selector = component.selector();

        self.cluster.scale(component, 0).await?;
        match self
            .waiter
            .wait_for_pods_gone(ctx, &selector, self.config.deletion_timeout)
            .await
        {
            PodsGone::Gone => {}
            PodsGone::Remaining(pods) => {
                warn!(
                    workload = %component.name,
                    remaining = pods.len(),
                    "pods survived scale-down, force deleting"
                );
                for pod in &pods {
                    self.cluster.delete_pod(&pod.name, 0).await?;
                }
            }
            PodsGone::Cancelled => return Err(Error::cancelled("detector")),
        }
        self.cluster.scale(component, replicas).await?;
        info!(workload = %component.name, replicas, "recovery cycle complete");

        let after = self.cluster.pods(&selector).await?;
        let still: Vec<String> = after
            .iter()
            .filter(|p| is_problematic(p, self.config.restart_threshold))
            .map(describe)
            .collect();
        if still.is_empty() {
            Ok(DetectorAction::Recovered { reason, replicas })
        } else {
            let observed = still.join("; ");
            warn!(workload = %component.name, %observed, "still problematic after recovery, not retrying");
            Ok(DetectorAction::StillProblematic { reason, observed })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{Call, FakeCluster};
    use stagehand_common::config::Timings;

    fn ctx() -> RunContext {
        RunContext::new("test", "cost-monitor").with_timings(Timings::immediate())
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            probe_timeout: Duration::from_millis(10),
            deletion_timeout: Duration::from_millis(10),
            ..DetectorConfig::default()
        }
    }

    fn target(name: &str) -> MonitoredComponent {
        (ComponentRef::deployment(name), false).into()
    }

    fn crashing(name: &str, restarts: i32) -> PodInfo {
        PodInfo {
            name: name.to_string(),
            phase: "Running".to_string(),
            restart_count: restarts,
            reasons: vec!["CrashLoopBackOff".to_string()],
            terminating: false,
        }
    }

    #[test]
    fn problematic_classification() {
        let mut pod = PodInfo::running("api-0");
        assert!(!is_problematic(&pod, 3));

        pod.restart_count = 3;
        assert!(!is_problematic(&pod, 3), "threshold is exclusive");
        pod.restart_count = 4;
        assert!(is_problematic(&pod, 3));

        let mut pulling = PodInfo::running("api-1");
        pulling.phase = "Pending".to_string();
        pulling.reasons = vec!["ImagePullBackOff".to_string()];
        assert!(is_problematic(&pulling, 3));

        let mut leaving = crashing("api-2", 9);
        leaving.terminating = true;
        assert!(!is_problematic(&leaving, 3));
    }

    #[test]
    fn snapshot_reports_worst_pod() {
        let pods = vec![PodInfo::running("api-0"), crashing("api-1", 5)];
        let snapshot = health_snapshot("api", &pods, 3);
        assert_eq!(snapshot.restart_count, 5);
        assert!(snapshot.is_crash_looping);
        assert_eq!(snapshot.phase.as_deref(), Some("Running"));

        let empty = health_snapshot("api", &[], 3);
        assert_eq!(empty.phase, None);
        assert!(!empty.is_crash_looping);
    }

    /// Story: a crash-looping target gets exactly one reset cycle, even when the
    /// problem is still visible right after recovery.
    #[tokio::test]
    async fn story_restart_count_five_triggers_exactly_one_cycle() {
        let cluster = FakeCluster::new();
        cluster.add_workload("api", 2);
        cluster.script_pods(
            "app=api",
            vec![
                vec![crashing("api-0", 5)],
                vec![],
                vec![crashing("api-0", 5)],
            ],
        );
        let config = config();
        let ctx = ctx();
        let detector = StuckDetector::new(&cluster, &config, &ctx);

        let report = detector.run_pass(&ctx, &[target("api")]).await.expect("pass");

        let scales: Vec<Call> = cluster
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Scale(..)))
            .collect();
        assert_eq!(
            scales,
            vec![
                Call::Scale("api".to_string(), 0),
                Call::Scale("api".to_string(), 2)
            ]
        );
        assert!(matches!(
            report.actions[0].action,
            DetectorAction::StillProblematic { .. }
        ));
        assert_eq!(report.cycled(), vec!["api"]);
        assert!(report.forced_recovery());
    }

    #[tokio::test]
    async fn healthy_components_are_left_alone() {
        let cluster = FakeCluster::new();
        cluster.add_workload("redis", 1);
        let config = config();
        let ctx = ctx();
        let detector = StuckDetector::new(&cluster, &config, &ctx);

        let report = detector.run_pass(&ctx, &[target("redis")]).await.expect("pass");
        assert!(report.actions.is_empty());
        assert!(!report.forced_recovery());
        assert_eq!(report.snapshots.len(), 1);
    }

    #[tokio::test]
    async fn stalled_rollout_is_recovered_to_one_when_prior_unknown() {
        let cluster = FakeCluster::new();
        cluster.never_ready("cost-dashboard");
        let config = config();
        let ctx = ctx();
        let detector = StuckDetector::new(&cluster, &config, &ctx);

        let report = detector
            .run_pass(&ctx, &[target("cost-dashboard")])
            .await
            .expect("pass");

        assert!(matches!(
            &report.actions[0].action,
            DetectorAction::Recovered { replicas: 1, reason } if reason.contains("still waiting")
        ));
        assert_eq!(cluster.replicas_of("cost-dashboard"), Some(1));
    }

    #[tokio::test]
    async fn failed_auxiliary_pods_are_deleted_directly() {
        let cluster = FakeCluster::new();
        let mut failed = PodInfo::running("oauth-proxy-7f9");
        failed.phase = "Failed".to_string();
        failed.reasons = vec!["Evicted".to_string()];
        cluster.set_pods("app=oauth-proxy", vec![failed, PodInfo::running("oauth-proxy-8a1")]);
        let config = config();
        let ctx = ctx();
        let detector = StuckDetector::new(&cluster, &config, &ctx);

        let report = detector
            .run_pass(&ctx, &[(ComponentRef::deployment("oauth-proxy"), true).into()])
            .await
            .expect("pass");

        assert_eq!(
            report.actions[0].action,
            DetectorAction::DeletedFailedPods {
                pods: vec!["oauth-proxy-7f9".to_string()]
            }
        );
        assert!(!cluster.calls().iter().any(|c| matches!(c, Call::Scale(..))));
        assert_eq!(cluster.pod_names("app=oauth-proxy"), vec!["oauth-proxy-8a1"]);
    }

    #[tokio::test]
    async fn stuck_pods_are_force_deleted_once_during_recovery() {
        let cluster = FakeCluster::new();
        cluster.add_pod("app=api", crashing("api-0", 7));
        cluster.mark_stuck("api-0");
        let config = config();
        let ctx = ctx();
        let detector = StuckDetector::new(&cluster, &config, &ctx);

        detector.run_pass(&ctx, &[target("api")]).await.expect("pass");

        let force_deletes: Vec<Call> = cluster
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::DeletePod(_, 0)))
            .collect();
        assert_eq!(force_deletes, vec![Call::DeletePod("api-0".to_string(), 0)]);
    }

    #[tokio::test]
    async fn dry_run_only_reports() {
        let cluster = FakeCluster::new();
        cluster.add_pod("app=api", crashing("api-0", 5));
        let config = config();
        let ctx = ctx().with_dry_run(true);
        let detector = StuckDetector::new(&cluster, &config, &ctx);

        let report = detector.run_pass(&ctx, &[target("api")]).await.expect("pass");
        assert!(matches!(report.actions[0].action, DetectorAction::WouldRecover { .. }));
        assert!(!report.forced_recovery());
        assert!(!cluster
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Scale(..) | Call::DeletePod(..))));
    }
}
