//! Cluster client: one method per platform operation
//!
//! The trait is the seam every component talks through, so tests can swap
//! in a mock or the recording fake. [`KubeClusterClient`] implements it
//! directly against the Kubernetes API; nothing shells out to kubectl.
//!
//! Each method issues single requests. Blocking waits (readiness, drain,
//! handshake polling) live in the callers, which pass their own timeouts.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use stagehand_common::config::{ComponentRef, TargetKind};
use stagehand_common::kube_utils::{self, comparable, ManifestMetadata};
use stagehand_common::{
    Error, Result, FIELD_MANAGER, LABEL_MANAGED_BY, LABEL_MANAGED_BY_STAGEHAND,
};

use crate::model::{DiffAction, PodInfo, ResourceDiff, RolloutStatus, SecretData};

/// Trait abstracting the cluster operations the orchestrator needs
///
/// All methods operate in the namespace the client was created for.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Server-side apply every manifest, in the given order
    async fn apply(&self, manifests: &[ManifestMetadata]) -> Result<()>;

    /// Server-side dry-run apply and compare against the live objects
    async fn diff(&self, manifests: &[ManifestMetadata]) -> Result<Vec<ResourceDiff>>;

    /// Set a workload's replica count through the scale subresource
    async fn scale(&self, workload: &ComponentRef, replicas: i32) -> Result<()>;

    /// Current replica count, `None` if the workload does not exist
    async fn replicas(&self, workload: &ComponentRef) -> Result<Option<i32>>;

    /// One rollout status query
    async fn rollout_status(&self, workload: &ComponentRef) -> Result<RolloutStatus>;

    /// Pods matching a label selector
    async fn pods(&self, selector: &str) -> Result<Vec<PodInfo>>;

    /// Delete every pod matching a label selector
    async fn delete_pods(&self, selector: &str, grace_seconds: u32) -> Result<()>;

    /// Delete one pod; a pod that is already gone is not an error
    async fn delete_pod(&self, name: &str, grace_seconds: u32) -> Result<()>;

    /// Read a secret, `None` if it does not exist
    async fn secret(&self, name: &str) -> Result<Option<SecretData>>;

    /// Create or update a secret with exactly these fields and annotations
    async fn upsert_secret(&self, name: &str, secret: &SecretData) -> Result<()>;

    /// Merge new values into some fields of an existing secret
    async fn patch_secret(&self, name: &str, fields: &BTreeMap<String, String>) -> Result<()>;

    /// Set an annotation on a workload's pod template (triggers a rolling restart)
    async fn annotate_pod_template(
        &self,
        workload: &ComponentRef,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Run a command in a pod and return its stdout
    async fn exec_in_pod(
        &self,
        pod: &str,
        container: Option<String>,
        argv: Vec<String>,
    ) -> Result<String>;
}

/// Real cluster client backed by kube-rs
pub struct KubeClusterClient {
    client: Client,
    namespace: String,
}

impl KubeClusterClient {
    /// Create a client bound to one namespace
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn failed<'a>(operation: &'static str, target: &'a str) -> impl FnOnce(kube::Error) -> Error + 'a {
    move |e| Error::cluster_for(operation, target, e.to_string())
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

async fn patch_scale<K>(api: Api<K>, name: &str, replicas: i32) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    let patch = serde_json::json!({ "spec": { "replicas": replicas } });
    api.patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(failed("scale", name))?;
    Ok(())
}

async fn get_replicas<K>(api: Api<K>, name: &str) -> Result<Option<i32>>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.get_scale(name).await {
        Ok(scale) => Ok(Some(scale.spec.and_then(|s| s.replicas).unwrap_or(0))),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(failed("get-scale", name)(e)),
    }
}

async fn annotate_template<K>(api: Api<K>, name: &str, key: &str, value: &str) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    let patch = serde_json::json!({
        "spec": { "template": { "metadata": { "annotations": { key: value } } } }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(failed("annotate", name))?;
    Ok(())
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn apply(&self, manifests: &[ManifestMetadata]) -> Result<()> {
        for manifest in manifests {
            kube_utils::apply_manifest(&self.client, manifest, &self.namespace, false).await?;
            debug!(resource = %manifest.display_name(), "applied");
        }
        Ok(())
    }

    async fn diff(&self, manifests: &[ManifestMetadata]) -> Result<Vec<ResourceDiff>> {
        let mut diffs = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            let live = kube_utils::get_live_object(&self.client, manifest, &self.namespace).await?;
            let action = match live {
                None => DiffAction::Create,
                Some(live) => {
                    let dry =
                        kube_utils::apply_manifest(&self.client, manifest, &self.namespace, true)
                            .await?;
                    let before = serde_json::to_value(&live)
                        .map_err(|e| Error::serialization(e.to_string()))?;
                    let after = serde_json::to_value(&dry)
                        .map_err(|e| Error::serialization(e.to_string()))?;
                    if comparable(&before) == comparable(&after) {
                        DiffAction::Unchanged
                    } else {
                        DiffAction::Update
                    }
                }
            };
            diffs.push(ResourceDiff {
                resource: manifest.display_name(),
                action,
            });
        }
        Ok(diffs)
    }

    async fn scale(&self, workload: &ComponentRef, replicas: i32) -> Result<()> {
        match workload.kind {
            TargetKind::Deployment => {
                patch_scale(self.api::<Deployment>(), &workload.name, replicas).await
            }
            TargetKind::StatefulSet => {
                patch_scale(self.api::<StatefulSet>(), &workload.name, replicas).await
            }
        }
    }

    async fn replicas(&self, workload: &ComponentRef) -> Result<Option<i32>> {
        match workload.kind {
            TargetKind::Deployment => get_replicas(self.api::<Deployment>(), &workload.name).await,
            TargetKind::StatefulSet => {
                get_replicas(self.api::<StatefulSet>(), &workload.name).await
            }
        }
    }

    async fn rollout_status(&self, workload: &ComponentRef) -> Result<RolloutStatus> {
        let status = match workload.kind {
            TargetKind::Deployment => self
                .api::<Deployment>()
                .get_opt(&workload.name)
                .await
                .map_err(failed("rollout-status", &workload.name))?
                .map(|d| deployment_rollout_status(&d)),
            TargetKind::StatefulSet => self
                .api::<StatefulSet>()
                .get_opt(&workload.name)
                .await
                .map_err(failed("rollout-status", &workload.name))?
                .map(|s| statefulset_rollout_status(&s)),
        };
        let status = status.unwrap_or(RolloutStatus::NotFound);
        trace!(workload = %workload.name, %status, "rollout status");
        Ok(status)
    }

    async fn pods(&self, selector: &str) -> Result<Vec<PodInfo>> {
        let pods = self
            .api::<Pod>()
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(failed("list-pods", selector))?;
        Ok(pods.items.iter().map(pod_info).collect())
    }

    async fn delete_pods(&self, selector: &str, grace_seconds: u32) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(grace_seconds),
            ..Default::default()
        };
        self.api::<Pod>()
            .delete_collection(&params, &ListParams::default().labels(selector))
            .await
            .map_err(failed("delete-pods", selector))?;
        Ok(())
    }

    async fn delete_pod(&self, name: &str, grace_seconds: u32) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(grace_seconds),
            ..Default::default()
        };
        match self.api::<Pod>().delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(failed("delete-pod", name)(e)),
        }
    }

    async fn secret(&self, name: &str) -> Result<Option<SecretData>> {
        let secret = self
            .api::<Secret>()
            .get_opt(name)
            .await
            .map_err(failed("get-secret", name))?;
        Ok(secret.map(|s| SecretData {
            data: s
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
                .collect(),
            annotations: s.metadata.annotations.unwrap_or_default(),
        }))
    }

    async fn upsert_secret(&self, name: &str, secret: &SecretData) -> Result<()> {
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": name,
                "namespace": self.namespace,
                "labels": { LABEL_MANAGED_BY: LABEL_MANAGED_BY_STAGEHAND },
                "annotations": secret.annotations,
            },
            "type": "Opaque",
            "stringData": secret.data,
        });
        self.api::<Secret>()
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&body),
            )
            .await
            .map_err(failed("upsert-secret", name))?;
        Ok(())
    }

    async fn patch_secret(&self, name: &str, fields: &BTreeMap<String, String>) -> Result<()> {
        let patch = serde_json::json!({ "stringData": fields });
        self.api::<Secret>()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(failed("patch-secret", name))?;
        Ok(())
    }

    async fn annotate_pod_template(
        &self,
        workload: &ComponentRef,
        key: &str,
        value: &str,
    ) -> Result<()> {
        match workload.kind {
            TargetKind::Deployment => {
                annotate_template(self.api::<Deployment>(), &workload.name, key, value).await
            }
            TargetKind::StatefulSet => {
                annotate_template(self.api::<StatefulSet>(), &workload.name, key, value).await
            }
        }
    }

    async fn exec_in_pod(
        &self,
        pod: &str,
        container: Option<String>,
        argv: Vec<String>,
    ) -> Result<String> {
        let mut params = AttachParams::default().stdout(true).stderr(false);
        if let Some(container) = container {
            params = params.container(container);
        }

        let mut process = self
            .api::<Pod>()
            .exec(pod, argv, &params)
            .await
            .map_err(failed("exec", pod))?;

        let mut output = String::new();
        if let Some(mut stdout) = process.stdout() {
            stdout
                .read_to_string(&mut output)
                .await
                .map_err(|e| Error::cluster_for("exec", pod, e.to_string()))?;
        }
        process
            .join()
            .await
            .map_err(|e| Error::cluster_for("exec", pod, e.to_string()))?;
        Ok(output)
    }
}

/// Convert a pod into the fields the orchestrator inspects
pub fn pod_info(pod: &Pod) -> PodInfo {
    let status = pod.status.as_ref();
    let mut reasons = Vec::new();
    let mut restart_count = 0;

    if let Some(reason) = status.and_then(|s| s.reason.clone()) {
        reasons.push(reason);
    }

    let statuses = status
        .into_iter()
        .flat_map(|s| {
            s.init_container_statuses
                .iter()
                .flatten()
                .chain(s.container_statuses.iter().flatten())
        });
    for cs in statuses {
        restart_count += cs.restart_count;
        let state = cs.state.as_ref();
        if let Some(reason) = state
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.clone())
        {
            reasons.push(reason);
        }
        if let Some(reason) = state
            .and_then(|s| s.terminated.as_ref())
            .and_then(|t| t.reason.clone())
        {
            reasons.push(reason);
        }
    }

    PodInfo {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase: status
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        restart_count,
        reasons,
        terminating: pod.metadata.deletion_timestamp.is_some(),
    }
}

/// Rollout status of a Deployment, following `kubectl rollout status`
pub fn deployment_rollout_status(deployment: &Deployment) -> RolloutStatus {
    let Some(status) = deployment.status.as_ref() else {
        return RolloutStatus::Progressing("no status reported yet".to_string());
    };

    if deployment.metadata.generation > status.observed_generation {
        return RolloutStatus::Progressing(format!(
            "generation {:?} not yet observed, last seen was {:?}",
            deployment.metadata.generation, status.observed_generation
        ));
    }

    let deadline_exceeded = status.conditions.iter().flatten().any(|c| {
        c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
    });
    if deadline_exceeded {
        return RolloutStatus::Failed("progress deadline exceeded".to_string());
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    if updated < desired {
        return RolloutStatus::Progressing(format!(
            "{} out of {} new replicas have been updated",
            updated, desired
        ));
    }
    if total > updated {
        return RolloutStatus::Progressing(format!(
            "{} old replicas are pending termination",
            total - updated
        ));
    }
    if available < updated {
        return RolloutStatus::Progressing(format!(
            "{} of {} updated replicas are available",
            available, updated
        ));
    }
    RolloutStatus::Complete
}

/// Rollout status of a StatefulSet
pub fn statefulset_rollout_status(sts: &StatefulSet) -> RolloutStatus {
    let Some(status) = sts.status.as_ref() else {
        return RolloutStatus::Progressing("no status reported yet".to_string());
    };

    if sts.metadata.generation != status.observed_generation {
        return RolloutStatus::Progressing(format!(
            "generation {:?} not yet observed, last seen was {:?}",
            sts.metadata.generation, status.observed_generation
        ));
    }

    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = status.ready_replicas.unwrap_or(0);
    if ready < desired {
        return RolloutStatus::Progressing(format!(
            "{} of {} replicas are ready",
            ready, desired
        ));
    }

    let updated = status.updated_replicas.unwrap_or(0);
    if status.replicas != updated {
        return RolloutStatus::Progressing(format!(
            "only {} out of {} replicas are updated",
            updated, status.replicas
        ));
    }

    if status.update_revision.is_some() && status.current_revision != status.update_revision {
        return RolloutStatus::Progressing("waiting for the update revision".to_string());
    }

    RolloutStatus::Complete
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(value: serde_json::Value) -> Deployment {
        serde_json::from_value(value).expect("valid deployment")
    }

    fn statefulset(value: serde_json::Value) -> StatefulSet {
        serde_json::from_value(value).expect("valid statefulset")
    }

    #[test]
    fn deployment_complete_when_all_updated_available() {
        let d = deployment(serde_json::json!({
            "metadata": {"name": "api", "generation": 3},
            "spec": {"replicas": 2, "selector": {}, "template": {}},
            "status": {"observedGeneration": 3, "replicas": 2, "updatedReplicas": 2, "availableReplicas": 2}
        }));
        assert_eq!(deployment_rollout_status(&d), RolloutStatus::Complete);
    }

    #[test]
    fn deployment_progressing_when_generation_unobserved() {
        let d = deployment(serde_json::json!({
            "metadata": {"name": "api", "generation": 4},
            "spec": {"replicas": 1, "selector": {}, "template": {}},
            "status": {"observedGeneration": 3, "replicas": 1, "updatedReplicas": 1, "availableReplicas": 1}
        }));
        assert!(matches!(
            deployment_rollout_status(&d),
            RolloutStatus::Progressing(reason) if reason.contains("not yet observed")
        ));
    }

    #[test]
    fn deployment_progressing_while_replicas_unavailable() {
        let d = deployment(serde_json::json!({
            "metadata": {"name": "api", "generation": 1},
            "spec": {"replicas": 2, "selector": {}, "template": {}},
            "status": {"observedGeneration": 1, "replicas": 2, "updatedReplicas": 2, "availableReplicas": 1}
        }));
        assert_eq!(
            deployment_rollout_status(&d),
            RolloutStatus::Progressing("1 of 2 updated replicas are available".to_string())
        );
    }

    #[test]
    fn deployment_failed_on_progress_deadline() {
        let d = deployment(serde_json::json!({
            "metadata": {"name": "api", "generation": 1},
            "spec": {"replicas": 1, "selector": {}, "template": {}},
            "status": {
                "observedGeneration": 1,
                "conditions": [{"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}]
            }
        }));
        assert!(matches!(deployment_rollout_status(&d), RolloutStatus::Failed(_)));
    }

    #[test]
    fn deployment_scaled_to_zero_is_complete() {
        let d = deployment(serde_json::json!({
            "metadata": {"name": "api", "generation": 2},
            "spec": {"replicas": 0, "selector": {}, "template": {}},
            "status": {"observedGeneration": 2}
        }));
        assert_eq!(deployment_rollout_status(&d), RolloutStatus::Complete);
    }

    #[test]
    fn statefulset_waits_for_ready_replicas() {
        let s = statefulset(serde_json::json!({
            "metadata": {"name": "postgresql", "generation": 1},
            "spec": {"replicas": 1, "selector": {}, "serviceName": "postgresql", "template": {}},
            "status": {"observedGeneration": 1, "replicas": 1, "readyReplicas": 0, "updatedReplicas": 1}
        }));
        assert!(matches!(
            statefulset_rollout_status(&s),
            RolloutStatus::Progressing(_)
        ));
    }

    #[test]
    fn statefulset_complete_on_current_revision() {
        let s = statefulset(serde_json::json!({
            "metadata": {"name": "postgresql", "generation": 1},
            "spec": {"replicas": 1, "selector": {}, "serviceName": "postgresql", "template": {}},
            "status": {
                "observedGeneration": 1, "replicas": 1, "readyReplicas": 1, "updatedReplicas": 1,
                "currentRevision": "postgresql-7d9", "updateRevision": "postgresql-7d9"
            }
        }));
        assert_eq!(statefulset_rollout_status(&s), RolloutStatus::Complete);
    }

    #[test]
    fn pod_info_collects_restarts_and_reasons() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "cost-data-service-abc"},
            "status": {
                "phase": "Running",
                "containerStatuses": [{
                    "name": "api", "image": "api", "imageID": "", "ready": false,
                    "restartCount": 5,
                    "state": {"waiting": {"reason": "CrashLoopBackOff"}}
                }]
            }
        }))
        .expect("valid pod");

        let info = pod_info(&pod);
        assert_eq!(info.name, "cost-data-service-abc");
        assert_eq!(info.phase, "Running");
        assert_eq!(info.restart_count, 5);
        assert_eq!(info.reasons, vec!["CrashLoopBackOff"]);
        assert!(!info.terminating);
    }

    #[test]
    fn api_errors_name_the_operation_and_target() {
        let not_found = || {
            kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "deployments.apps \"api\" not found".to_string(),
                reason: "NotFound".to_string(),
                code: 404,
            })
        };
        assert!(is_not_found(&not_found()));

        let name = format!("{}-{}", "cost", "dashboard");
        let err = failed("scale", &name)(not_found());
        match err {
            Error::ClusterCommunication { ref operation, ref target, .. } => {
                assert_eq!(operation, "scale");
                assert_eq!(target, "cost-dashboard");
            }
            other => panic!("expected cluster error, got {other:?}"),
        }
    }
}
