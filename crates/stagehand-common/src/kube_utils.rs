//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction, manifest parsing and ordering, and server-side apply
//! of untyped manifests. No kubectl binary is needed.

use std::path::Path;
use std::time::Duration;

use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde::Deserialize;
use tracing::debug;

use crate::{Error, FIELD_MANAGER};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::cluster_for(
                    "create-client",
                    path.display().to_string(),
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::cluster("create-client", format!("failed to load kubeconfig: {}", e))
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::cluster("create-client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config)
        .map_err(|e| Error::cluster("create-client", format!("failed to create client: {}", e)))
}

// =============================================================================
// Manifests
// =============================================================================

/// Parsed manifest metadata for applying to Kubernetes
#[derive(Debug, Clone)]
pub struct ManifestMetadata {
    /// The parsed JSON value
    pub value: serde_json::Value,
    /// Resource name
    pub name: String,
    /// Namespace from the manifest, if any
    pub namespace: Option<String>,
    /// API resource definition
    pub api_resource: ApiResource,
}

impl ManifestMetadata {
    /// `Kind/name` for logs and reports
    pub fn display_name(&self) -> String {
        format!("{}/{}", self.api_resource.kind, self.name)
    }

    /// The namespace to apply into, or `None` for cluster-scoped kinds
    pub fn target_namespace<'a>(&'a self, default_namespace: &'a str) -> Option<&'a str> {
        if is_cluster_scoped(&self.api_resource.kind) {
            None
        } else {
            Some(self.namespace.as_deref().unwrap_or(default_namespace))
        }
    }
}

/// Parse a single manifest value and extract its metadata
pub fn parse_manifest(value: serde_json::Value) -> Result<ManifestMetadata, Error> {
    let api_version = value
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::serialization("manifest missing apiVersion"))?
        .to_string();

    let kind = value
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::serialization("manifest missing kind"))?
        .to_string();

    let name = value
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::serialization_for_kind(&kind, "manifest missing metadata.name"))?
        .to_string();

    let namespace = value
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let api_resource = build_api_resource(&api_version, &kind);

    Ok(ManifestMetadata {
        value,
        name,
        namespace,
        api_resource,
    })
}

/// Parse a YAML or JSON string that may hold several documents.
///
/// Empty documents are skipped and `kind: List` objects are flattened into
/// their items.
pub fn parse_manifests(content: &str) -> Result<Vec<ManifestMetadata>, Error> {
    let values: Vec<serde_json::Value> = if content.trim_start().starts_with('{') {
        vec![serde_json::from_str(content)
            .map_err(|e| Error::serialization(format!("invalid JSON manifest: {}", e)))?]
    } else {
        serde_yaml::Deserializer::from_str(content)
            .map(|doc| {
                serde_json::Value::deserialize(doc)
                    .map_err(|e| Error::serialization(format!("invalid YAML manifest: {}", e)))
            })
            .collect::<Result<_, _>>()?
    };

    let mut manifests = Vec::new();
    for value in values {
        if value.is_null() {
            continue;
        }
        if value.get("kind").and_then(|k| k.as_str()) == Some("List") {
            let items = value
                .get("items")
                .and_then(|i| i.as_array())
                .cloned()
                .unwrap_or_default();
            for item in items {
                manifests.push(parse_manifest(item)?);
            }
        } else {
            manifests.push(parse_manifest(value)?);
        }
    }
    Ok(manifests)
}

/// Load every `.yaml`, `.yml` and `.json` file in a directory.
///
/// Files are read in name order; the result is then stably sorted by
/// [`kind_priority`] so dependencies (namespaces, secrets, services) land
/// before workloads.
pub fn load_manifest_dir(dir: &Path) -> Result<Vec<ManifestMetadata>, Error> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        Error::configuration_for_field(
            "manifests",
            format!("failed to read {}: {}", dir.display(), e),
        )
    })?;

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml" | "yml" | "json")
                )
        })
        .collect();
    paths.sort();

    let mut manifests = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        let parsed = parse_manifests(&content).map_err(|e| {
            Error::serialization(format!("{}: {}", path.display(), e))
        })?;
        debug!(file = %path.display(), count = parsed.len(), "loaded manifests");
        manifests.extend(parsed);
    }

    manifests.sort_by_key(|m| kind_priority(&m.api_resource.kind));
    Ok(manifests)
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use stagehand_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("apps/v1");
/// assert_eq!(group, "apps");
/// assert_eq!(version, "v1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from a known apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Apply order for manifest kinds; lower applies first
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "PersistentVolumeClaim" => 6,
        "Service" => 7,
        "Deployment" | "DaemonSet" | "StatefulSet" => 8,
        "Route" | "Ingress" => 9,
        _ => 10,
    }
}

/// Kinds applied without a namespace
pub fn is_cluster_scoped(kind: &str) -> bool {
    matches!(
        kind,
        "Namespace"
            | "CustomResourceDefinition"
            | "ClusterRole"
            | "ClusterRoleBinding"
            | "PersistentVolume"
            | "StorageClass"
            | "PriorityClass"
            | "OAuthClient"
    )
}

/// Known resource pluralizations the fallback rules get wrong
const KIND_PLURALS: &[(&str, &str)] = &[
    ("ingress", "ingresses"),
    ("networkpolicy", "networkpolicies"),
    ("storageclass", "storageclasses"),
    ("priorityclass", "priorityclasses"),
    ("endpoints", "endpoints"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for irregular kinds, falling back to simple
/// pluralization rules.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Server-side apply one manifest, optionally as a dry run.
///
/// Returns the object as the API server would persist it.
pub async fn apply_manifest(
    client: &Client,
    manifest: &ManifestMetadata,
    default_namespace: &str,
    dry_run: bool,
) -> Result<DynamicObject, Error> {
    let mut params = PatchParams::apply(FIELD_MANAGER).force();
    params.dry_run = dry_run;

    let api = dynamic_api(client, manifest, default_namespace);
    api.patch(&manifest.name, &params, &Patch::Apply(&manifest.value))
        .await
        .map_err(|e| {
            Error::cluster_for(
                "apply",
                manifest.display_name(),
                format!("server-side apply failed: {}", e),
            )
        })
}

/// Fetch the live object for a manifest, `None` if it does not exist
pub async fn get_live_object(
    client: &Client,
    manifest: &ManifestMetadata,
    default_namespace: &str,
) -> Result<Option<DynamicObject>, Error> {
    dynamic_api(client, manifest, default_namespace)
        .get_opt(&manifest.name)
        .await
        .map_err(|e| Error::cluster_for("get", manifest.display_name(), e.to_string()))
}

fn dynamic_api(
    client: &Client,
    manifest: &ManifestMetadata,
    default_namespace: &str,
) -> Api<DynamicObject> {
    match manifest.target_namespace(default_namespace) {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &manifest.api_resource),
        None => Api::all_with(client.clone(), &manifest.api_resource),
    }
}

/// Strip server-managed fields so two renderings of an object can be compared.
///
/// Removes `status` and the metadata the API server owns (uid,
/// resourceVersion, creationTimestamp, managedFields, generation).
pub fn comparable(value: &serde_json::Value) -> serde_json::Value {
    let mut value = value.clone();
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for key in [
                "uid",
                "resourceVersion",
                "creationTimestamp",
                "managedFields",
                "generation",
            ] {
                meta.remove(key);
            }
        }
    }
    value
}
