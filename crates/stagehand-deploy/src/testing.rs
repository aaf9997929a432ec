//! In-memory cluster that records every call, for call-order assertions
//!
//! Scaling a workload up creates running pods for it; scaling to zero or
//! deleting removes them, except pods marked stuck, which only disappear on
//! a grace-0 delete of that pod.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use stagehand_common::config::ComponentRef;
use stagehand_common::kube_utils::ManifestMetadata;
use stagehand_common::{Error, Result};

use crate::cluster::ClusterClient;
use crate::model::{PodInfo, ResourceDiff, RolloutStatus, SecretData};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Apply(usize),
    Diff(usize),
    Scale(String, i32),
    Replicas(String),
    RolloutStatus(String),
    Pods(String),
    DeletePods(String, u32),
    DeletePod(String, u32),
    Secret(String),
    UpsertSecret(String),
    PatchSecret(String, Vec<String>),
    Annotate(String, String),
    Exec(String),
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    replicas: HashMap<String, i32>,
    pods: BTreeMap<String, Vec<PodInfo>>,
    scripted_pods: HashMap<String, VecDeque<Vec<PodInfo>>>,
    stuck: HashSet<String>,
    never_ready: HashSet<String>,
    scripted_status: HashMap<String, VecDeque<RolloutStatus>>,
    status_errors: HashMap<String, usize>,
    secrets: HashMap<String, SecretData>,
    exec_output: HashMap<String, VecDeque<String>>,
    fail_annotate: HashSet<String>,
    fail_scale: HashSet<String>,
    diffs: Vec<ResourceDiff>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().expect("fake cluster lock");
        f(&mut state)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    /// Only the calls that change or wait on workloads, for order assertions
    pub fn scale_and_status_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Scale(..) | Call::RolloutStatus(_)))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.with(|s| s.calls.clear());
    }

    pub fn add_workload(&self, name: &str, replicas: i32) {
        self.with(|s| {
            s.replicas.insert(name.to_string(), replicas);
            let pods = s.pods.entry(format!("app={}", name)).or_default();
            for i in 0..replicas {
                pods.push(PodInfo::running(format!("{}-{}", name, i)));
            }
        });
    }

    pub fn add_pod(&self, selector: &str, pod: PodInfo) {
        self.with(|s| s.pods.entry(selector.to_string()).or_default().push(pod));
    }

    pub fn set_pods(&self, selector: &str, pods: Vec<PodInfo>) {
        self.with(|s| {
            s.pods.insert(selector.to_string(), pods);
        });
    }

    /// Listings returned by the next `pods` calls for the selector, before
    /// falling back to the simulated state
    pub fn script_pods(&self, selector: &str, listings: Vec<Vec<PodInfo>>) {
        self.with(|s| {
            s.scripted_pods.insert(selector.to_string(), listings.into());
        });
    }

    /// The pod survives scale-down and graceful deletes
    pub fn mark_stuck(&self, pod: &str) {
        self.with(|s| {
            s.stuck.insert(pod.to_string());
        });
    }

    pub fn never_ready(&self, workload: &str) {
        self.with(|s| {
            s.never_ready.insert(workload.to_string());
        });
    }

    pub fn script_status(&self, workload: &str, statuses: Vec<RolloutStatus>) {
        self.with(|s| {
            s.scripted_status
                .insert(workload.to_string(), statuses.into());
        });
    }

    /// The next `count` status queries for the workload fail
    pub fn status_errors(&self, workload: &str, count: usize) {
        self.with(|s| {
            s.status_errors.insert(workload.to_string(), count);
        });
    }

    pub fn script_exec(&self, pod: &str, outputs: Vec<&str>) {
        self.with(|s| {
            s.exec_output.insert(
                pod.to_string(),
                outputs.into_iter().map(String::from).collect(),
            );
        });
    }

    pub fn fail_annotate(&self, workload: &str) {
        self.with(|s| {
            s.fail_annotate.insert(workload.to_string());
        });
    }

    pub fn fail_scale(&self, workload: &str) {
        self.with(|s| {
            s.fail_scale.insert(workload.to_string());
        });
    }

    pub fn set_diffs(&self, diffs: Vec<ResourceDiff>) {
        self.with(|s| s.diffs = diffs);
    }

    pub fn seed_secret(&self, name: &str, secret: SecretData) {
        self.with(|s| {
            s.secrets.insert(name.to_string(), secret);
        });
    }

    pub fn stored_secret(&self, name: &str) -> Option<SecretData> {
        self.with(|s| s.secrets.get(name).cloned())
    }

    pub fn replicas_of(&self, workload: &str) -> Option<i32> {
        self.with(|s| s.replicas.get(workload).copied())
    }

    pub fn pod_names(&self, selector: &str) -> Vec<String> {
        self.with(|s| {
            s.pods
                .get(selector)
                .map(|pods| pods.iter().map(|p| p.name.clone()).collect())
                .unwrap_or_default()
        })
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn apply(&self, manifests: &[ManifestMetadata]) -> Result<()> {
        self.with(|s| s.calls.push(Call::Apply(manifests.len())));
        Ok(())
    }

    async fn diff(&self, manifests: &[ManifestMetadata]) -> Result<Vec<ResourceDiff>> {
        self.with(|s| {
            s.calls.push(Call::Diff(manifests.len()));
            Ok(s.diffs.clone())
        })
    }

    async fn scale(&self, workload: &ComponentRef, replicas: i32) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::Scale(workload.name.clone(), replicas));
            if s.fail_scale.contains(&workload.name) {
                return Err(Error::cluster_for("scale", &workload.name, "connection refused"));
            }
            s.replicas.insert(workload.name.clone(), replicas);

            let stuck = s.stuck.clone();
            let pods = s.pods.entry(workload.selector()).or_default();
            if replicas == 0 {
                pods.retain(|p| stuck.contains(&p.name));
            } else if pods.iter().all(|p| stuck.contains(&p.name)) {
                for i in 0..replicas {
                    pods.push(PodInfo::running(format!("{}-{}", workload.name, i)));
                }
            }
            Ok(())
        })
    }

    async fn replicas(&self, workload: &ComponentRef) -> Result<Option<i32>> {
        self.with(|s| {
            s.calls.push(Call::Replicas(workload.name.clone()));
            Ok(s.replicas.get(&workload.name).copied())
        })
    }

    async fn rollout_status(&self, workload: &ComponentRef) -> Result<RolloutStatus> {
        self.with(|s| {
            s.calls.push(Call::RolloutStatus(workload.name.clone()));
            if let Some(remaining) = s.status_errors.get_mut(&workload.name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::cluster_for(
                        "rollout-status",
                        &workload.name,
                        "timeout talking to api server",
                    ));
                }
            }
            if let Some(status) = s
                .scripted_status
                .get_mut(&workload.name)
                .and_then(VecDeque::pop_front)
            {
                return Ok(status);
            }
            if s.never_ready.contains(&workload.name) {
                return Ok(RolloutStatus::Progressing(
                    "0 of 1 updated replicas are available".to_string(),
                ));
            }
            Ok(if s.replicas.contains_key(&workload.name) {
                RolloutStatus::Complete
            } else {
                RolloutStatus::NotFound
            })
        })
    }

    async fn pods(&self, selector: &str) -> Result<Vec<PodInfo>> {
        self.with(|s| {
            s.calls.push(Call::Pods(selector.to_string()));
            if let Some(listing) = s
                .scripted_pods
                .get_mut(selector)
                .and_then(VecDeque::pop_front)
            {
                return Ok(listing);
            }
            Ok(s.pods.get(selector).cloned().unwrap_or_default())
        })
    }

    async fn delete_pods(&self, selector: &str, grace_seconds: u32) -> Result<()> {
        self.with(|s| {
            s.calls
                .push(Call::DeletePods(selector.to_string(), grace_seconds));
            let stuck = s.stuck.clone();
            if let Some(pods) = s.pods.get_mut(selector) {
                pods.retain(|p| grace_seconds > 0 && stuck.contains(&p.name));
            }
            Ok(())
        })
    }

    async fn delete_pod(&self, name: &str, grace_seconds: u32) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::DeletePod(name.to_string(), grace_seconds));
            let keep = grace_seconds > 0 && s.stuck.contains(name);
            if !keep {
                for pods in s.pods.values_mut() {
                    pods.retain(|p| p.name != name);
                }
            }
            Ok(())
        })
    }

    async fn secret(&self, name: &str) -> Result<Option<SecretData>> {
        self.with(|s| {
            s.calls.push(Call::Secret(name.to_string()));
            Ok(s.secrets.get(name).cloned())
        })
    }

    async fn upsert_secret(&self, name: &str, secret: &SecretData) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::UpsertSecret(name.to_string()));
            s.secrets.insert(name.to_string(), secret.clone());
            Ok(())
        })
    }

    async fn patch_secret(&self, name: &str, fields: &BTreeMap<String, String>) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::PatchSecret(
                name.to_string(),
                fields.keys().cloned().collect(),
            ));
            let secret = s
                .secrets
                .get_mut(name)
                .ok_or_else(|| Error::cluster_for("patch-secret", name, "not found"))?;
            secret.data.extend(fields.clone());
            Ok(())
        })
    }

    async fn annotate_pod_template(
        &self,
        workload: &ComponentRef,
        key: &str,
        _value: &str,
    ) -> Result<()> {
        self.with(|s| {
            s.calls
                .push(Call::Annotate(workload.name.clone(), key.to_string()));
            if s.fail_annotate.contains(&workload.name) {
                Err(Error::cluster_for("annotate", &workload.name, "not found"))
            } else {
                Ok(())
            }
        })
    }

    async fn exec_in_pod(
        &self,
        pod: &str,
        _container: Option<String>,
        _argv: Vec<String>,
    ) -> Result<String> {
        self.with(|s| {
            s.calls.push(Call::Exec(pod.to_string()));
            Ok(s
                .exec_output
                .get_mut(pod)
                .and_then(VecDeque::pop_front)
                .unwrap_or_default())
        })
    }
}
