//! Runtime types shared by the orchestrator components
//!
//! Configuration types (targets, secrets) live in `stagehand_common::config`;
//! these are the values that flow between the cluster client and the
//! components during a run.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Rollout status of a single workload, as reported by one status query
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum RolloutStatus {
    /// All desired replicas are updated and available
    Complete,
    /// Still rolling out
    Progressing(String),
    /// The controller gave up (e.g. progress deadline exceeded)
    Failed(String),
    /// The workload does not exist
    NotFound,
}

impl RolloutStatus {
    /// Whether the rollout is finished
    pub fn is_complete(&self) -> bool {
        matches!(self, RolloutStatus::Complete)
    }
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RolloutStatus::Complete => write!(f, "rollout complete"),
            RolloutStatus::Progressing(reason) => write!(f, "progressing: {}", reason),
            RolloutStatus::Failed(reason) => write!(f, "failed: {}", reason),
            RolloutStatus::NotFound => write!(f, "not found"),
        }
    }
}

/// The parts of a pod the detector and drain logic look at
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    /// Pod name
    pub name: String,
    /// Pod phase (Pending, Running, Succeeded, Failed, Unknown)
    pub phase: String,
    /// Sum of container restart counts
    pub restart_count: i32,
    /// Waiting or terminated reasons reported by containers
    pub reasons: Vec<String>,
    /// Whether the pod is already marked for deletion
    pub terminating: bool,
}

impl PodInfo {
    /// A running pod with no restarts
    pub fn running(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: "Running".to_string(),
            ..Default::default()
        }
    }
}

/// Contents of a secret plus the annotations Stagehand keeps on it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretData {
    /// Decoded field values
    pub data: BTreeMap<String, String>,
    /// Object annotations
    pub annotations: BTreeMap<String, String>,
}

/// What a dry-run apply would do to one manifest
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DiffAction {
    /// The object does not exist yet
    Create,
    /// The object exists and would change
    Update,
    /// Applying would not change the object
    Unchanged,
}

impl fmt::Display for DiffAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiffAction::Create => "create",
            DiffAction::Update => "update",
            DiffAction::Unchanged => "unchanged",
        };
        f.pad(s)
    }
}

/// Dry-run result for one manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDiff {
    /// `Kind/name`
    pub resource: String,
    /// What would happen
    pub action: DiffAction,
}

/// Per-pass health of one monitored workload
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// Workload name
    pub target: String,
    /// Highest restart count among its pods
    pub restart_count: i32,
    /// Phase of the worst pod, `None` when no pods exist
    pub phase: Option<String>,
    /// Whether any pod matches a crash/error pattern
    pub is_crash_looping: bool,
}

/// What a rollout step does to its target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RolloutAction {
    /// Scale to zero replicas
    ScaleDown,
    /// Delete remaining pods
    Drain,
    /// Scale to the desired replica count
    ScaleUp,
    /// Wait for the rollout to complete
    WaitReady,
}

impl fmt::Display for RolloutAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RolloutAction::ScaleDown => write!(f, "scale-down"),
            RolloutAction::Drain => write!(f, "drain"),
            RolloutAction::ScaleUp => write!(f, "scale-up"),
            RolloutAction::WaitReady => write!(f, "wait-ready"),
        }
    }
}

/// One planned step of a rollout
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStep {
    /// Target name
    pub target: String,
    /// Action
    pub action: RolloutAction,
    /// Replica count for scale actions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Time budget in seconds, where the action blocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl RolloutStep {
    pub(crate) fn new(target: &str, action: RolloutAction) -> Self {
        Self {
            target: target.to_string(),
            action,
            replicas: None,
            timeout_seconds: None,
        }
    }

    pub(crate) fn replicas(mut self, replicas: i32) -> Self {
        self.replicas = Some(replicas);
        self
    }

    pub(crate) fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = Some(timeout.as_secs());
        self
    }
}

impl fmt::Display for RolloutStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.target)?;
        if let Some(replicas) = self.replicas {
            write!(f, " -> {}", replicas)?;
        }
        if let Some(timeout) = self.timeout_seconds {
            write!(f, " (timeout {}s)", timeout)?;
        }
        Ok(())
    }
}
