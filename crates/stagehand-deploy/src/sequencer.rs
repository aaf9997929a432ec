//! Ordered rollout sequencer
//!
//! Drives one deployment run: scale every target down in reverse dependency
//! order, drain and verify, re-apply configuration and credentials, scale
//! back up in dependency order waiting for each target, then run the
//! integrity check, the OAuth handshake and a detector safety-net pass.
//!
//! Any failure after pre-flight is wrapped in `RolloutAborted` naming the
//! step, the target and whether forced recovery ran. Partial progress is
//! left in place; a rerun starts from whatever the cluster looks like.

use std::collections::HashSet;
use std::fmt;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use stagehand_common::config::{ComponentRef, DeploymentTarget, ResolvedConfig};
use stagehand_common::kube_utils::ManifestMetadata;
use stagehand_common::{Error, Result};

use crate::cluster::ClusterClient;
use crate::context::RunContext;
use crate::graph::TargetGraph;
use crate::identity::IdentityProvider;
use crate::integrity::{verify_target, IntegrityOutcome, ProcessProbe};
use crate::model::{ResourceDiff, RolloutAction, RolloutStep};
use crate::oauth::{HandshakeOutcome, OAuthCoordinator};
use crate::readiness::{PodsGone, Readiness, ReadinessWaiter};
use crate::recovery::{DetectorReport, MonitoredComponent, StuckDetector};
use crate::secrets::{discharge_obligations, CredentialProvisioner, ProvisionReport, RotationRequest};

/// Where the sequence is
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SequencerState {
    /// Nothing done yet
    Idle,
    /// Scaling targets to zero, reverse order
    ScalingDown,
    /// Deleting remaining pods
    Draining,
    /// Waiting for drained pods to disappear
    VerifyingDrained,
    /// Manifests applied and secrets provisioned
    ConfigApplied,
    /// Scaling up the named targets
    ScalingUp(Vec<String>),
    /// Waiting for the named targets
    Verifying(Vec<String>),
    /// Probing for duplicate processes
    IntegrityCheck,
    /// Running the OAuth handshake
    Handshake,
    /// Detector pass over every monitored component
    SafetyNet,
    /// Every target ready
    Complete,
    /// Stopped by a failure or cancellation
    Aborted,
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequencerState::Idle => write!(f, "idle"),
            SequencerState::ScalingDown => write!(f, "scaling-down"),
            SequencerState::Draining => write!(f, "draining"),
            SequencerState::VerifyingDrained => write!(f, "verifying-drained"),
            SequencerState::ConfigApplied => write!(f, "config-applied"),
            SequencerState::ScalingUp(targets) => write!(f, "scaling-up({})", targets.join(",")),
            SequencerState::Verifying(targets) => write!(f, "verifying({})", targets.join(",")),
            SequencerState::IntegrityCheck => write!(f, "integrity-check"),
            SequencerState::Handshake => write!(f, "handshake"),
            SequencerState::SafetyNet => write!(f, "safety-net"),
            SequencerState::Complete => write!(f, "complete"),
            SequencerState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Final status of one target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetStatus {
    /// Dry run: steps planned only
    Planned,
    /// Rollout complete
    Ready,
    /// Recovered by the safety-net pass and ready again
    Recovered,
}

/// Per-target entry of the run report
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetReport {
    /// Target name
    pub name: String,
    /// Desired replicas
    pub replicas: i32,
    /// Final status
    pub status: TargetStatus,
    /// Duplicate-process check result, for targets that declare one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityOutcome>,
}

/// Everything a completed run did
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Environment deployed
    pub environment: String,
    /// Namespace deployed into
    pub namespace: String,
    /// Whether mutating calls were skipped
    pub dry_run: bool,
    /// States entered, in order
    pub transitions: Vec<SequencerState>,
    /// Final status per target, in scale-up order
    pub targets: Vec<TargetReport>,
    /// Planned steps
    pub plan: Vec<RolloutStep>,
    /// Server-side dry-run diff (dry run only)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diff: Vec<ResourceDiff>,
    /// Credential decisions and restart obligations
    pub secrets: ProvisionReport,
    /// Components given a rolling restart for changed credentials
    pub restarted: Vec<String>,
    /// Pods force-deleted after the drain timeout
    pub force_deleted: Vec<String>,
    /// OAuth handshake result, `None` when disabled or skipped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake: Option<HandshakeOutcome>,
    /// Why a non-mandatory handshake could not complete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_error: Option<String>,
    /// Safety-net detector pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detector: Option<DetectorReport>,
    /// Whether forced deletion or a recovery cycle ran
    pub forced_recovery: bool,
}

impl RunReport {
    /// Whether the run finished with SSO in place (or OAuth disabled)
    pub fn sso_ready(&self) -> bool {
        self.handshake.as_ref().map_or(true, HandshakeOutcome::succeeded)
    }
}

/// Transitions recorded while the sequence runs
struct Journal {
    transitions: Vec<SequencerState>,
    forced_recovery: bool,
}

impl Journal {
    fn new() -> Self {
        Self {
            transitions: vec![SequencerState::Idle],
            forced_recovery: false,
        }
    }

    fn enter(&mut self, state: SequencerState) {
        info!(state = %state, "sequencer transition");
        self.transitions.push(state);
    }

    fn abort(&mut self, step: &str, target: Option<&str>, source: Error) -> Error {
        warn!(step, target = ?target, error = %source, "rollout aborted");
        self.enter(SequencerState::Aborted);
        Error::aborted(step, target.map(String::from), self.forced_recovery, source)
    }
}

/// Runs the ordered rollout for one resolved configuration
pub struct Sequencer<'a> {
    cluster: &'a dyn ClusterClient,
    identity: &'a dyn IdentityProvider,
    probe: &'a dyn ProcessProbe,
    config: &'a ResolvedConfig,
    graph: TargetGraph,
}

impl<'a> Sequencer<'a> {
    /// Validate the configuration and order its targets
    pub fn new(
        cluster: &'a dyn ClusterClient,
        identity: &'a dyn IdentityProvider,
        probe: &'a dyn ProcessProbe,
        config: &'a ResolvedConfig,
    ) -> Result<Self> {
        config.validate()?;
        let graph = TargetGraph::new(config.targets.clone())?;
        Ok(Self {
            cluster,
            identity,
            probe,
            config,
            graph,
        })
    }

    /// The step plan, as printed in dry-run mode
    pub fn plan(&self) -> Vec<RolloutStep> {
        let mut plan = Vec::with_capacity(self.graph.len() * 4);
        for target in self.graph.reverse() {
            plan.push(RolloutStep::new(&target.name, RolloutAction::ScaleDown).replicas(0));
        }
        for target in self.graph.reverse() {
            plan.push(RolloutStep::new(&target.name, RolloutAction::Drain));
        }
        for target in self.graph.forward() {
            plan.push(RolloutStep::new(&target.name, RolloutAction::ScaleUp).replicas(target.replicas));
            plan.push(
                RolloutStep::new(&target.name, RolloutAction::WaitReady)
                    .timeout(target.readiness_timeout),
            );
        }
        plan
    }

    fn monitored(&self) -> Vec<MonitoredComponent> {
        self.config
            .monitored_components()
            .into_iter()
            .map(MonitoredComponent::from)
            .collect()
    }

    fn report(&self, ctx: &RunContext, status: TargetStatus) -> RunReport {
        RunReport {
            environment: ctx.environment.clone(),
            namespace: ctx.namespace.clone(),
            dry_run: ctx.dry_run,
            transitions: Vec::new(),
            targets: self
                .graph
                .forward()
                .map(|t| TargetReport {
                    name: t.name.clone(),
                    replicas: t.replicas,
                    status,
                    integrity: None,
                })
                .collect(),
            plan: self.plan(),
            diff: Vec::new(),
            secrets: ProvisionReport::default(),
            restarted: Vec::new(),
            force_deleted: Vec::new(),
            handshake: None,
            handshake_error: None,
            detector: None,
            forced_recovery: false,
        }
    }

    /// Run the full sequence; in dry-run mode only read-only steps run
    #[instrument(skip_all, fields(environment = %ctx.environment, namespace = %ctx.namespace, dry_run = ctx.dry_run))]
    pub async fn deploy(
        &self,
        ctx: &RunContext,
        manifests: &[ManifestMetadata],
        rotate: &[RotationRequest],
    ) -> Result<RunReport> {
        if ctx.dry_run {
            return self.dry_run(ctx, manifests, rotate).await;
        }

        let mut journal = Journal::new();
        let mut report = self.report(ctx, TargetStatus::Ready);
        let waiter = ReadinessWaiter::new(self.cluster, ctx.timings.poll_interval);

        // Scale down, reverse order
        self.step(&mut journal, ctx, "scale-down")?;
        journal.enter(SequencerState::ScalingDown);
        for target in self.graph.reverse() {
            if let Err(e) = self.cluster.scale(&target.component(), 0).await {
                return Err(journal.abort("scale-down", Some(&target.name), e));
            }
            info!(workload = %target.name, "scaled down");
        }

        // Drain
        self.step(&mut journal, ctx, "drain")?;
        journal.enter(SequencerState::Draining);
        for target in self.graph.reverse() {
            if let Err(e) = self
                .cluster
                .delete_pods(&target.selector(), ctx.timings.drain_grace_seconds)
                .await
            {
                return Err(journal.abort("drain", Some(&target.name), e));
            }
        }

        // Verify drained, force-deleting survivors once each
        self.step(&mut journal, ctx, "verify-drained")?;
        journal.enter(SequencerState::VerifyingDrained);
        let deadline = Instant::now() + ctx.timings.drain_timeout;
        for target in self.graph.reverse() {
            let budget = deadline.saturating_duration_since(Instant::now());
            match waiter.wait_for_pods_gone(ctx, &target.selector(), budget).await {
                PodsGone::Gone => {}
                PodsGone::Remaining(pods) => {
                    warn!(
                        workload = %target.name,
                        remaining = pods.len(),
                        "drain timeout, force deleting remaining pods"
                    );
                    journal.forced_recovery = true;
                    for pod in pods {
                        if let Err(e) = self.cluster.delete_pod(&pod.name, 0).await {
                            return Err(journal.abort("verify-drained", Some(&target.name), e));
                        }
                        report.force_deleted.push(pod.name);
                    }
                }
                PodsGone::Cancelled => {
                    return Err(journal.abort(
                        "verify-drained",
                        Some(&target.name),
                        Error::cancelled("verify-drained"),
                    ));
                }
            }
        }

        // Re-apply configuration and credentials
        self.step(&mut journal, ctx, "apply")?;
        if let Err(e) = self.cluster.apply(manifests).await {
            return Err(journal.abort("apply", None, e));
        }
        info!(resources = manifests.len(), "configuration applied");
        report.secrets = match CredentialProvisioner::new(self.cluster)
            .provision(ctx, &self.config.secrets, rotate)
            .await
        {
            Ok(secrets) => secrets,
            Err(e) => return Err(journal.abort("provision-secrets", None, e)),
        };
        journal.enter(SequencerState::ConfigApplied);

        // Scale up, forward order
        for level in self.graph.levels() {
            let batches: Vec<Vec<&DeploymentTarget>> = if ctx.timings.max_parallel_waits > 1 {
                vec![level]
            } else {
                level.into_iter().map(|t| vec![t]).collect()
            };
            for batch in batches {
                self.scale_up(&mut journal, &waiter, ctx, &batch).await?;
            }
        }

        // Integrity check
        self.step(&mut journal, ctx, "integrity-check")?;
        journal.enter(SequencerState::IntegrityCheck);
        if !ctx.timings.settle_delay.is_zero() && !ctx.sleep(ctx.timings.settle_delay).await {
            return Err(journal.abort(
                "integrity-check",
                None,
                Error::cancelled("integrity-check"),
            ));
        }
        for (target, entry) in self.graph.forward().zip(report.targets.iter_mut()) {
            if target.process_check.is_none() {
                continue;
            }
            match verify_target(self.cluster, self.probe, &waiter, ctx, target).await {
                Ok(outcome) => entry.integrity = Some(outcome),
                Err(e) => return Err(journal.abort("integrity-check", Some(&target.name), e)),
            }
        }

        // Restart consumers not already cycled by the scale-up
        let cycled: HashSet<String> = self.graph.forward().map(|t| t.name.clone()).collect();
        let components: Vec<ComponentRef> = self
            .config
            .monitored_components()
            .into_iter()
            .map(|(c, _)| c)
            .collect();
        report.restarted = discharge_obligations(
            self.cluster,
            ctx,
            &report.secrets.obligations,
            &components,
            &cycled,
        )
        .await;

        // OAuth handshake
        if let Some(oauth) = &self.config.oauth {
            self.step(&mut journal, ctx, "oauth-handshake")?;
            journal.enter(SequencerState::Handshake);
            let result = OAuthCoordinator::new(self.cluster, self.identity, oauth)
                .run(ctx)
                .await
                .and_then(|outcome| outcome.into_result(oauth.client_object_name()));
            match result {
                Ok(outcome) => {
                    if !outcome.succeeded() {
                        warn!(client = %oauth.client_id, "continuing without SSO");
                    }
                    report.handshake = Some(outcome);
                }
                Err(e) if oauth.mandatory || matches!(e, Error::Cancelled { .. }) => {
                    return Err(journal.abort("oauth-handshake", Some(&oauth.proxy.name), e));
                }
                Err(e) => {
                    warn!(client = %oauth.client_id, error = %e, "handshake failed, continuing without SSO");
                    report.handshake_error = Some(e.to_string());
                }
            }
        }

        // Safety net
        self.step(&mut journal, ctx, "safety-net")?;
        journal.enter(SequencerState::SafetyNet);
        let detector = StuckDetector::new(self.cluster, &self.config.detector, ctx);
        let pass = match detector.run_pass(ctx, &self.monitored()).await {
            Ok(pass) => pass,
            Err(e) => return Err(journal.abort("safety-net", None, e)),
        };
        if pass.forced_recovery() {
            journal.forced_recovery = true;
        }
        for name in pass.cycled() {
            let Some((target, entry)) = self
                .graph
                .forward()
                .zip(report.targets.iter_mut())
                .find(|(t, _)| t.name == name)
            else {
                continue;
            };
            match waiter
                .wait_ready(ctx, &target.component(), target.readiness_timeout)
                .await
            {
                Readiness::Ready => entry.status = TargetStatus::Recovered,
                Readiness::TimedOut { last_status } => {
                    let cause = Error::ReadinessTimeout {
                        target: target.name.clone(),
                        timeout_secs: target.readiness_timeout.as_secs(),
                        last_status,
                    };
                    return Err(journal.abort("safety-net", Some(&target.name), cause));
                }
                Readiness::Cancelled => {
                    return Err(journal.abort(
                        "safety-net",
                        Some(&target.name),
                        Error::cancelled("safety-net"),
                    ));
                }
            }
        }
        report.detector = Some(pass);

        journal.enter(SequencerState::Complete);
        report.forced_recovery = journal.forced_recovery;
        report.transitions = journal.transitions;
        info!(
            targets = report.targets.len(),
            forced_recovery = report.forced_recovery,
            sso = report.sso_ready(),
            "deployment complete"
        );
        Ok(report)
    }

    fn step(&self, journal: &mut Journal, ctx: &RunContext, step: &str) -> Result<()> {
        ctx.checkpoint(step)
            .map_err(|e| journal.abort(step, None, e))
    }

    /// Scale a batch of same-depth targets and wait for all of them
    async fn scale_up(
        &self,
        journal: &mut Journal,
        waiter: &ReadinessWaiter<'_>,
        ctx: &RunContext,
        batch: &[&DeploymentTarget],
    ) -> Result<()> {
        let names: Vec<String> = batch.iter().map(|t| t.name.clone()).collect();

        self.step(journal, ctx, "scale-up")?;
        journal.enter(SequencerState::ScalingUp(names.clone()));
        for target in batch {
            if let Err(e) = self.cluster.scale(&target.component(), target.replicas).await {
                return Err(journal.abort("scale-up", Some(&target.name), e));
            }
            info!(workload = %target.name, replicas = target.replicas, "scaled up");
        }

        journal.enter(SequencerState::Verifying(names));
        let outcomes: Vec<(&DeploymentTarget, Readiness)> = stream::iter(batch.iter().copied())
            .map(|target| async move {
                let outcome = waiter
                    .wait_ready(ctx, &target.component(), target.readiness_timeout)
                    .await;
                (target, outcome)
            })
            .buffered(ctx.timings.max_parallel_waits.max(1))
            .collect()
            .await;

        for (target, outcome) in outcomes {
            match outcome {
                Readiness::Ready => info!(workload = %target.name, "ready"),
                Readiness::TimedOut { last_status } => {
                    let cause = Error::ReadinessTimeout {
                        target: target.name.clone(),
                        timeout_secs: target.readiness_timeout.as_secs(),
                        last_status,
                    };
                    return Err(journal.abort("scale-up", Some(&target.name), cause));
                }
                Readiness::Cancelled => {
                    return Err(journal.abort(
                        "scale-up",
                        Some(&target.name),
                        Error::cancelled("scale-up"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Diff, plan and credential plan without mutating anything
    async fn dry_run(
        &self,
        ctx: &RunContext,
        manifests: &[ManifestMetadata],
        rotate: &[RotationRequest],
    ) -> Result<RunReport> {
        let mut report = self.report(ctx, TargetStatus::Planned);
        report.diff = self.cluster.diff(manifests).await?;
        report.secrets = CredentialProvisioner::new(self.cluster)
            .provision(ctx, &self.config.secrets, rotate)
            .await?;
        for step in &report.plan {
            info!(step = %step, "dry run: planned");
        }
        report.transitions = vec![SequencerState::Idle, SequencerState::Complete];
        Ok(report)
    }
}
