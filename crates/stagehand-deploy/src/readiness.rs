//! Readiness waiter
//!
//! Bounded polling of rollout status and pod listings. Timing out is an
//! ordinary outcome returned as a value; callers decide whether it is fatal.
//! A failed query counts as "not yet" and is retried on the next tick.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use stagehand_common::config::ComponentRef;

use crate::cluster::ClusterClient;
use crate::context::RunContext;
use crate::model::PodInfo;

/// Outcome of waiting for a rollout
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Readiness {
    /// Rollout completed
    Ready,
    /// The budget elapsed first
    TimedOut {
        /// Last status (or query error) observed
        last_status: String,
    },
    /// The run was cancelled while waiting
    Cancelled,
}

/// Outcome of waiting for pods to disappear
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodsGone {
    /// No pods match the selector
    Gone,
    /// Pods still present when the budget elapsed
    Remaining(Vec<PodInfo>),
    /// The run was cancelled while waiting
    Cancelled,
}

/// Polls the cluster at a fixed interval
pub struct ReadinessWaiter<'a> {
    cluster: &'a dyn ClusterClient,
    interval: Duration,
}

impl<'a> ReadinessWaiter<'a> {
    /// Create a waiter polling at `interval`
    pub fn new(cluster: &'a dyn ClusterClient, interval: Duration) -> Self {
        Self { cluster, interval }
    }

    /// Poll rollout status until complete, timed out or cancelled
    pub async fn wait_ready(
        &self,
        ctx: &RunContext,
        workload: &ComponentRef,
        timeout: Duration,
    ) -> Readiness {
        let deadline = Instant::now() + timeout;
        let mut last_status;

        loop {
            if ctx.cancel.is_cancelled() {
                return Readiness::Cancelled;
            }

            match self.cluster.rollout_status(workload).await {
                Ok(status) if status.is_complete() => {
                    debug!(workload = %workload.name, "rollout complete");
                    return Readiness::Ready;
                }
                Ok(status) => {
                    trace!(workload = %workload.name, %status, "not ready yet");
                    last_status = status.to_string();
                }
                Err(e) => {
                    trace!(workload = %workload.name, error = %e, "status query failed, retrying");
                    last_status = format!("status query failed: {}", e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Readiness::TimedOut { last_status };
            }
            if !ctx.sleep(self.interval.min(deadline - now)).await {
                return Readiness::Cancelled;
            }
        }
    }

    /// Poll pod listings until no pod matches `selector`
    pub async fn wait_for_pods_gone(
        &self,
        ctx: &RunContext,
        selector: &str,
        timeout: Duration,
    ) -> PodsGone {
        let deadline = Instant::now() + timeout;
        let mut remaining = Vec::new();

        loop {
            if ctx.cancel.is_cancelled() {
                return PodsGone::Cancelled;
            }

            match self.cluster.pods(selector).await {
                Ok(pods) if pods.is_empty() => return PodsGone::Gone,
                Ok(pods) => {
                    trace!(selector, count = pods.len(), "pods still present");
                    remaining = pods;
                }
                Err(e) => {
                    trace!(selector, error = %e, "pod listing failed, retrying");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return PodsGone::Remaining(remaining);
            }
            if !ctx.sleep(self.interval.min(deadline - now)).await {
                return PodsGone::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::model::RolloutStatus;
    use crate::testing::{Call, FakeCluster};
    use stagehand_common::Error;

    const TICK: Duration = Duration::from_millis(1);

    fn ctx() -> RunContext {
        RunContext::new("test", "cost-monitor")
    }

    #[tokio::test]
    async fn ready_on_first_complete_status() {
        let cluster = FakeCluster::new();
        cluster.add_workload("redis", 1);
        let waiter = ReadinessWaiter::new(&cluster, TICK);

        let outcome = waiter
            .wait_ready(&ctx(), &ComponentRef::deployment("redis"), Duration::from_secs(5))
            .await;
        assert_eq!(outcome, Readiness::Ready);
        assert_eq!(cluster.calls(), vec![Call::RolloutStatus("redis".to_string())]);
    }

    #[tokio::test]
    async fn transient_errors_are_not_fatal() {
        let cluster = FakeCluster::new();
        cluster.add_workload("redis", 1);
        cluster.status_errors("redis", 3);
        let waiter = ReadinessWaiter::new(&cluster, TICK);

        let outcome = waiter
            .wait_ready(&ctx(), &ComponentRef::deployment("redis"), Duration::from_secs(5))
            .await;
        assert_eq!(outcome, Readiness::Ready);
        assert_eq!(cluster.calls().len(), 4);
    }

    #[tokio::test]
    async fn timeout_is_a_value_with_last_status() {
        let mut mock = MockClusterClient::new();
        mock.expect_rollout_status()
            .returning(|_| Ok(RolloutStatus::Progressing("1 of 2 updated replicas are available".to_string())));
        let waiter = ReadinessWaiter::new(&mock, TICK);

        let outcome = waiter
            .wait_ready(
                &ctx(),
                &ComponentRef::deployment("cost-data-service"),
                Duration::from_millis(20),
            )
            .await;
        assert_eq!(
            outcome,
            Readiness::TimedOut {
                last_status: "progressing: 1 of 2 updated replicas are available".to_string()
            }
        );
    }

    #[tokio::test]
    async fn errors_until_timeout_report_the_error() {
        let mut mock = MockClusterClient::new();
        mock.expect_rollout_status()
            .returning(|_| Err(Error::cluster("rollout-status", "connection refused")));
        let waiter = ReadinessWaiter::new(&mock, TICK);

        let outcome = waiter
            .wait_ready(&ctx(), &ComponentRef::deployment("redis"), Duration::from_millis(10))
            .await;
        assert!(matches!(
            outcome,
            Readiness::TimedOut { last_status } if last_status.contains("connection refused")
        ));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let cluster = FakeCluster::new();
        cluster.never_ready("redis");
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let waiter = ReadinessWaiter::new(&cluster, TICK);
        let outcome = waiter
            .wait_ready(&ctx, &ComponentRef::deployment("redis"), Duration::from_secs(60))
            .await;
        assert_eq!(outcome, Readiness::Cancelled);
    }

    #[tokio::test]
    async fn pods_gone_and_remaining() {
        let cluster = FakeCluster::new();
        let waiter = ReadinessWaiter::new(&cluster, TICK);
        assert_eq!(
            waiter
                .wait_for_pods_gone(&ctx(), "app=redis", Duration::from_millis(10))
                .await,
            PodsGone::Gone
        );

        cluster.add_pod("app=redis", PodInfo::running("redis-0"));
        match waiter
            .wait_for_pods_gone(&ctx(), "app=redis", Duration::from_millis(10))
            .await
        {
            PodsGone::Remaining(pods) => assert_eq!(pods[0].name, "redis-0"),
            other => panic!("expected remaining pods, got {other:?}"),
        }
    }
}
