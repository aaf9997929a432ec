//! Duplicate-process integrity check
//!
//! An unclean shutdown can leave a second copy of a target's primary process
//! running in the same pod. After rollout, each target that declares a
//! `processCheck` is probed; a violation is cleared with one rolling restart
//! followed by one readiness wait.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tracing::{debug, info, warn};

use stagehand_common::config::{DeploymentTarget, ProcessCheck};
use stagehand_common::{Error, Result, RESTARTED_AT_ANNOTATION};

use crate::cluster::ClusterClient;
use crate::context::RunContext;
use crate::readiness::{Readiness, ReadinessWaiter};

/// Counts running instances of a process inside a pod
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    /// Number of processes in `pod` matching `check.pattern`
    async fn count(&self, pod: &str, check: &ProcessCheck) -> Result<usize>;
}

/// Probe that lists processes with `ps` through pod exec
pub struct PsProcessProbe<'a> {
    cluster: &'a dyn ClusterClient,
}

impl<'a> PsProcessProbe<'a> {
    /// Create a probe using the given cluster client
    pub fn new(cluster: &'a dyn ClusterClient) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl ProcessProbe for PsProcessProbe<'_> {
    async fn count(&self, pod: &str, check: &ProcessCheck) -> Result<usize> {
        let argv = vec!["ps".to_string(), "-eo".to_string(), "args".to_string()];
        let output = self
            .cluster
            .exec_in_pod(pod, check.container.clone(), argv)
            .await?;
        Ok(count_matches(&output, &check.pattern))
    }
}

/// Count process listing lines containing `pattern`, ignoring the header
/// and the listing command itself
pub fn count_matches(ps_output: &str, pattern: &str) -> usize {
    ps_output
        .lines()
        .skip(1)
        .filter(|line| !line.trim_start().starts_with("ps "))
        .filter(|line| line.contains(pattern))
        .count()
}

/// Result of checking one target
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum IntegrityOutcome {
    /// No pod had extra instances
    Clean,
    /// A duplicate was found and a restart cleared it
    Restarted {
        /// Pod where the duplicate was seen
        pod: String,
        /// Instances counted
        instances: usize,
    },
    /// The probe could not run
    Skipped {
        /// Why
        reason: String,
    },
}

/// Probe a target's pods and restart it once if a duplicate is found.
///
/// Fails with `IntegrityViolation` only when the restart itself fails or
/// does not become ready.
pub async fn verify_target(
    cluster: &dyn ClusterClient,
    probe: &dyn ProcessProbe,
    waiter: &ReadinessWaiter<'_>,
    ctx: &RunContext,
    target: &DeploymentTarget,
) -> Result<IntegrityOutcome> {
    let Some(check) = target.process_check.as_ref() else {
        return Ok(IntegrityOutcome::Clean);
    };

    let pods = cluster.pods(&target.selector()).await?;
    let mut violation = None;
    for pod in pods.iter().filter(|p| !p.terminating && p.phase == "Running") {
        match probe.count(&pod.name, check).await {
            Ok(instances) if instances > check.max_instances => {
                violation = Some((pod.name.clone(), instances));
                break;
            }
            Ok(instances) => {
                debug!(workload = %target.name, pod = %pod.name, instances, "process count ok");
            }
            Err(e) => {
                warn!(workload = %target.name, pod = %pod.name, error = %e, "process probe failed, skipping");
                return Ok(IntegrityOutcome::Skipped {
                    reason: e.to_string(),
                });
            }
        }
    }

    let Some((pod, instances)) = violation else {
        return Ok(IntegrityOutcome::Clean);
    };

    warn!(
        workload = %target.name,
        pod = %pod,
        instances,
        expected = check.max_instances,
        "duplicate process detected, restarting"
    );

    let now = chrono::Utc::now().to_rfc3339();
    cluster
        .annotate_pod_template(&target.component(), RESTARTED_AT_ANNOTATION, &now)
        .await
        .map_err(|e| Error::IntegrityViolation {
            target: target.name.clone(),
            message: format!("{} instances in {}, restart failed: {}", instances, pod, e),
        })?;

    match waiter
        .wait_ready(ctx, &target.component(), target.readiness_timeout)
        .await
    {
        Readiness::Ready => {
            info!(workload = %target.name, "restart cleared duplicate process");
            Ok(IntegrityOutcome::Restarted { pod, instances })
        }
        Readiness::TimedOut { last_status } => Err(Error::IntegrityViolation {
            target: target.name.clone(),
            message: format!(
                "{} instances in {}, not ready after restart: {}",
                instances, pod, last_status
            ),
        }),
        Readiness::Cancelled => Err(Error::cancelled("integrity-check")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{Call, FakeCluster};

    const PS_TWO_MASTERS: &str = "ARGS\n\
        gunicorn: master [cost_dashboard.app:server]\n\
        gunicorn: worker [cost_dashboard.app:server]\n\
        gunicorn: master [cost_dashboard.app:server]\n\
        ps -eo args\n";

    fn dashboard() -> DeploymentTarget {
        DeploymentTarget::new("cost-dashboard")
            .with_readiness_timeout(Duration::from_millis(50))
            .with_process_check(ProcessCheck {
                pattern: "gunicorn: master".to_string(),
                container: None,
                max_instances: 1,
            })
    }

    #[test]
    fn count_ignores_header_and_ps_itself() {
        assert_eq!(count_matches(PS_TWO_MASTERS, "gunicorn: master"), 2);
        assert_eq!(count_matches(PS_TWO_MASTERS, "ps"), 0);
        assert_eq!(count_matches("", "gunicorn"), 0);
    }

    #[tokio::test]
    async fn ps_probe_counts_through_exec() {
        let cluster = FakeCluster::new();
        cluster.script_exec("cost-dashboard-0", vec![PS_TWO_MASTERS]);
        let probe = PsProcessProbe::new(&cluster);

        let check = dashboard().process_check.expect("check configured");
        let count = probe.count("cost-dashboard-0", &check).await.expect("exec");
        assert_eq!(count, 2);
        assert_eq!(cluster.calls(), vec![Call::Exec("cost-dashboard-0".to_string())]);
    }

    #[tokio::test]
    async fn duplicate_triggers_one_restart_and_rewait() {
        let cluster = FakeCluster::new();
        cluster.add_workload("cost-dashboard", 1);
        let mut probe = MockProcessProbe::new();
        probe.expect_count().times(1).returning(|_, _| Ok(2));

        let ctx = RunContext::new("test", "cost-monitor");
        let waiter = ReadinessWaiter::new(&cluster, Duration::from_millis(1));
        let outcome = verify_target(&cluster, &probe, &waiter, &ctx, &dashboard())
            .await
            .expect("recovered");

        assert_eq!(
            outcome,
            IntegrityOutcome::Restarted {
                pod: "cost-dashboard-0".to_string(),
                instances: 2
            }
        );
        let calls = cluster.calls();
        let restarts = calls.iter().filter(|c| matches!(c, Call::Annotate(..))).count();
        assert_eq!(restarts, 1);
        assert!(calls.ends_with(&[Call::RolloutStatus("cost-dashboard".to_string())]));
    }

    #[tokio::test]
    async fn failed_restart_is_an_integrity_violation() {
        let cluster = FakeCluster::new();
        cluster.add_workload("cost-dashboard", 1);
        cluster.never_ready("cost-dashboard");
        let mut probe = MockProcessProbe::new();
        probe.expect_count().returning(|_, _| Ok(3));

        let ctx = RunContext::new("test", "cost-monitor");
        let waiter = ReadinessWaiter::new(&cluster, Duration::from_millis(1));
        let err = verify_target(&cluster, &probe, &waiter, &ctx, &dashboard())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation { ref target, .. } if target == "cost-dashboard"));
    }

    #[tokio::test]
    async fn clean_and_unprobed_targets() {
        let cluster = FakeCluster::new();
        cluster.add_workload("cost-dashboard", 2);
        let mut probe = MockProcessProbe::new();
        probe.expect_count().times(2).returning(|_, _| Ok(1));

        let ctx = RunContext::new("test", "cost-monitor");
        let waiter = ReadinessWaiter::new(&cluster, Duration::from_millis(1));
        let outcome = verify_target(&cluster, &probe, &waiter, &ctx, &dashboard())
            .await
            .expect("clean");
        assert_eq!(outcome, IntegrityOutcome::Clean);

        let plain = DeploymentTarget::new("redis");
        let outcome = verify_target(&cluster, &probe, &waiter, &ctx, &plain)
            .await
            .expect("nothing to probe");
        assert_eq!(outcome, IntegrityOutcome::Clean);
    }

    #[tokio::test]
    async fn probe_failure_skips() {
        let cluster = FakeCluster::new();
        cluster.add_workload("cost-dashboard", 1);
        let mut probe = MockProcessProbe::new();
        probe
            .expect_count()
            .returning(|_, _| Err(Error::cluster_for("exec", "cost-dashboard-0", "ps: not found")));

        let ctx = RunContext::new("test", "cost-monitor");
        let waiter = ReadinessWaiter::new(&cluster, Duration::from_millis(1));
        let outcome = verify_target(&cluster, &probe, &waiter, &ctx, &dashboard())
            .await
            .expect("skipped, not failed");
        assert!(matches!(outcome, IntegrityOutcome::Skipped { .. }));
    }
}
