//! Stagehand configuration file (`stagehand.yaml`)
//!
//! The file declares the deployment targets and their dependencies, the
//! secrets to provision, the OAuth handshake, detector thresholds and timing
//! knobs. Per-environment blocks override the namespace, manifest directory,
//! replica counts and OAuth switches.
//!
//! Loading is split in two:
//! 1. [`StagehandConfig::load`] parses the YAML file
//! 2. [`StagehandConfig::resolve`] applies one environment's overrides and runs
//!    pre-flight validation, producing a [`ResolvedConfig`]
//!
//! Every validation failure is a [`Error::Configuration`] naming the field.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configured literal that means "generate a random alphanumeric value"
pub const GENERATE_SENTINEL: &str = "generate";

/// Serde helpers for durations written as (fractional) seconds
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Targets
// =============================================================================

/// Workload controller kind backing a target
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    /// apps/v1 Deployment
    #[default]
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Deployment => write!(f, "Deployment"),
            TargetKind::StatefulSet => write!(f, "StatefulSet"),
        }
    }
}

/// Reference to a workload the orchestrator scales, restarts or inspects
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRef {
    /// Workload name
    pub name: String,
    /// Controller kind
    #[serde(default)]
    pub kind: TargetKind,
    /// Pod label selector; defaults to `app=<name>`
    #[serde(default)]
    pub selector: Option<String>,
}

impl ComponentRef {
    /// Create a Deployment reference with the default selector
    pub fn deployment(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TargetKind::Deployment,
            selector: None,
        }
    }

    /// The pod label selector for this component
    pub fn selector(&self) -> String {
        self.selector
            .clone()
            .unwrap_or_else(|| default_selector(&self.name))
    }
}

fn default_selector(name: &str) -> String {
    format!("app={}", name)
}

/// How to recognise a duplicated primary process inside a target's pod
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessCheck {
    /// Substring identifying the primary process in a process listing
    pub pattern: String,
    /// Container to inspect; the pod's default container when unset
    #[serde(default)]
    pub container: Option<String>,
    /// Number of matching processes considered healthy
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
}

fn default_max_instances() -> usize {
    1
}

/// A deployable unit managed by the rollout sequencer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTarget {
    /// Workload name (also the default `app` label value)
    pub name: String,
    /// Controller kind
    #[serde(default)]
    pub kind: TargetKind,
    /// Replica count once the rollout completes
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    /// How long scale-up may take before the run aborts
    #[serde(
        rename = "readinessTimeoutSeconds",
        with = "secs",
        default = "default_readiness_timeout"
    )]
    pub readiness_timeout: Duration,
    /// Names of targets that must be ready before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Pod label selector; defaults to `app=<name>`
    #[serde(default)]
    pub selector: Option<String>,
    /// Optional duplicate-process integrity check
    #[serde(default)]
    pub process_check: Option<ProcessCheck>,
}

fn default_replicas() -> i32 {
    1
}

fn default_readiness_timeout() -> Duration {
    Duration::from_secs(300)
}

impl DeploymentTarget {
    /// Create a single-replica Deployment target with default settings
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TargetKind::Deployment,
            replicas: default_replicas(),
            readiness_timeout: default_readiness_timeout(),
            depends_on: Vec::new(),
            selector: None,
            process_check: None,
        }
    }

    /// Set the controller kind
    pub fn with_kind(mut self, kind: TargetKind) -> Self {
        self.kind = kind;
        self
    }

    /// Add a dependency on another target
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Set the readiness budget
    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    /// Set the desired replica count
    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.replicas = replicas;
        self
    }

    /// Attach a duplicate-process check
    pub fn with_process_check(mut self, check: ProcessCheck) -> Self {
        self.process_check = Some(check);
        self
    }

    /// The pod label selector for this target
    pub fn selector(&self) -> String {
        self.selector
            .clone()
            .unwrap_or_else(|| default_selector(&self.name))
    }

    /// This target as a plain component reference
    pub fn component(&self) -> ComponentRef {
        ComponentRef {
            name: self.name.clone(),
            kind: self.kind,
            selector: Some(self.selector()),
        }
    }
}

// =============================================================================
// Secrets
// =============================================================================

/// Shape of a generated secret value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RandomKind {
    /// 32 random bytes as 64 lowercase hex characters
    Hex32,
    /// 32 random bytes, standard base64
    Base64,
    /// 32 characters from `[A-Za-z0-9]`
    Alnum32,
}

impl fmt::Display for RandomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RandomKind::Hex32 => write!(f, "hex32"),
            RandomKind::Base64 => write!(f, "base64"),
            RandomKind::Alnum32 => write!(f, "alnum32"),
        }
    }
}

impl std::str::FromStr for RandomKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hex32" => Ok(RandomKind::Hex32),
            "base64" => Ok(RandomKind::Base64),
            "alnum32" => Ok(RandomKind::Alnum32),
            other => Err(Error::configuration(format!(
                "unknown random kind '{}', expected hex32, base64 or alnum32",
                other
            ))),
        }
    }
}

/// Where a secret field's value comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueSource {
    /// Use the configured value as-is
    Literal(String),
    /// Generate a random value, preserved across runs unless rotated
    GenerateRandom(RandomKind),
}

impl ValueSource {
    /// Short description recorded on the secret (`literal`, `generate:hex32`)
    pub fn intent(&self) -> String {
        match self {
            ValueSource::Literal(_) => "literal".to_string(),
            ValueSource::GenerateRandom(kind) => format!("generate:{}", kind),
        }
    }
}

/// One field of a provisioned secret
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawField")]
pub struct FieldSpec {
    /// Value source
    pub source: ValueSource,
    /// Restart the secret's consumers when this field changes
    pub restart_dependents: bool,
}

impl FieldSpec {
    /// A literal field that does not restart consumers
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            source: ValueSource::Literal(value.into()),
            restart_dependents: false,
        }
    }

    /// A generated field
    pub fn generate(kind: RandomKind) -> Self {
        Self {
            source: ValueSource::GenerateRandom(kind),
            restart_dependents: false,
        }
    }

    /// Mark the field as restarting consumers on change
    pub fn restarting_dependents(mut self) -> Self {
        self.restart_dependents = true;
        self
    }
}

/// On-disk forms accepted for a secret field
#[derive(Deserialize)]
#[serde(untagged)]
enum RawField {
    /// `password: generate` or `username: cost`
    Short(String),
    /// `password: { generate: hex32, restartDependents: true }`
    Full {
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        generate: Option<RandomKind>,
        #[serde(default, rename = "restartDependents")]
        restart_dependents: bool,
    },
}

impl TryFrom<RawField> for FieldSpec {
    type Error = String;

    fn try_from(raw: RawField) -> std::result::Result<Self, String> {
        match raw {
            RawField::Short(value) => Ok(Self {
                source: literal_or_sentinel(value),
                restart_dependents: false,
            }),
            RawField::Full {
                value,
                generate,
                restart_dependents,
            } => {
                let source = match (value, generate) {
                    (Some(_), Some(_)) => {
                        return Err("field sets both 'value' and 'generate'".to_string())
                    }
                    (Some(value), None) => literal_or_sentinel(value),
                    (None, Some(kind)) => ValueSource::GenerateRandom(kind),
                    (None, None) => {
                        return Err("field needs either 'value' or 'generate'".to_string())
                    }
                };
                Ok(Self {
                    source,
                    restart_dependents,
                })
            }
        }
    }
}

fn literal_or_sentinel(value: String) -> ValueSource {
    if value == GENERATE_SENTINEL {
        ValueSource::GenerateRandom(RandomKind::Alnum32)
    } else {
        ValueSource::Literal(value)
    }
}

/// A secret the credential provisioner keeps up to date
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretDescriptor {
    /// Secret name
    pub name: String,
    /// Components that read this secret (restarted when flagged fields change)
    #[serde(default)]
    pub consumers: Vec<String>,
    /// Field name to value spec
    pub fields: BTreeMap<String, FieldSpec>,
}

impl SecretDescriptor {
    /// Create an empty descriptor
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            consumers: Vec::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Add a field
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Add a consumer
    pub fn consumer(mut self, name: impl Into<String>) -> Self {
        self.consumers.push(name.into());
        self
    }
}

// =============================================================================
// OAuth, detector, timings
// =============================================================================

/// OAuth proxy handshake settings
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthConfig {
    /// Run the handshake at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Abort the deployment when the handshake fails
    #[serde(default)]
    pub mandatory: bool,
    /// Static client id written into the proxy secret
    pub client_id: String,
    /// Name of the identity platform's client object; defaults to `client_id`
    #[serde(default)]
    pub client_object: Option<String>,
    /// Secret read by the proxy
    pub proxy_secret: String,
    /// The proxy workload restarted once the secret is propagated
    pub proxy: ComponentRef,
    /// Delay between client object lookups
    #[serde(
        rename = "pollIntervalSeconds",
        with = "secs",
        default = "default_oauth_poll_interval"
    )]
    pub poll_interval: Duration,
    /// Lookups before giving up
    #[serde(default = "default_oauth_attempts")]
    pub max_attempts: u32,
}

fn default_true() -> bool {
    true
}

fn default_oauth_poll_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_oauth_attempts() -> u32 {
    30
}

impl OAuthConfig {
    /// Name of the client object to poll for
    pub fn client_object_name(&self) -> &str {
        self.client_object.as_deref().unwrap_or(&self.client_id)
    }
}

/// Stuck-deployment detector thresholds
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorConfig {
    /// Restart count above which a pod is problematic
    #[serde(default = "default_restart_threshold")]
    pub restart_threshold: i32,
    /// How long a rollout may report "still waiting" before recovery
    #[serde(
        rename = "probeTimeoutSeconds",
        with = "secs",
        default = "default_probe_timeout"
    )]
    pub probe_timeout: Duration,
    /// Bound on waiting for pods to disappear during recovery
    #[serde(
        rename = "deletionTimeoutSeconds",
        with = "secs",
        default = "default_deletion_timeout"
    )]
    pub deletion_timeout: Duration,
    /// Stateless components outside the rollout that are also monitored
    #[serde(default)]
    pub auxiliary: Vec<ComponentRef>,
}

fn default_restart_threshold() -> i32 {
    3
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_deletion_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            restart_threshold: default_restart_threshold(),
            probe_timeout: default_probe_timeout(),
            deletion_timeout: default_deletion_timeout(),
            auxiliary: Vec::new(),
        }
    }
}

/// Poll intervals, delays and drain bounds
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    /// Interval between rollout status and pod listing polls
    #[serde(
        rename = "pollIntervalSeconds",
        with = "secs",
        default = "default_poll_interval"
    )]
    pub poll_interval: Duration,
    /// Pause after the last target is ready before the integrity check
    #[serde(
        rename = "settleDelaySeconds",
        with = "secs",
        default = "default_settle_delay"
    )]
    pub settle_delay: Duration,
    /// Grace period for drain deletions
    #[serde(default = "default_drain_grace")]
    pub drain_grace_seconds: u32,
    /// How long drained pods may take to disappear before force deletion
    #[serde(
        rename = "drainTimeoutSeconds",
        with = "secs",
        default = "default_drain_timeout"
    )]
    pub drain_timeout: Duration,
    /// Readiness waits allowed to run at once within one dependency depth
    #[serde(default = "default_parallel_waits")]
    pub max_parallel_waits: usize,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_drain_grace() -> u32 {
    30
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_parallel_waits() -> usize {
    1
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            settle_delay: default_settle_delay(),
            drain_grace_seconds: default_drain_grace(),
            drain_timeout: default_drain_timeout(),
            max_parallel_waits: default_parallel_waits(),
        }
    }
}

impl Timings {
    /// Near-zero intervals for tests
    pub fn immediate() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            settle_delay: Duration::ZERO,
            drain_grace_seconds: 0,
            drain_timeout: Duration::from_millis(20),
            max_parallel_waits: 1,
        }
    }
}

// =============================================================================
// File model
// =============================================================================

/// Per-environment overrides
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    /// Namespace to deploy into
    #[serde(default)]
    pub namespace: Option<String>,
    /// Directory of rendered manifests
    #[serde(default)]
    pub manifests: Option<PathBuf>,
    /// Replica count overrides by target name
    #[serde(default)]
    pub replicas: BTreeMap<String, i32>,
    /// OAuth switches
    #[serde(default)]
    pub oauth: Option<OAuthOverride>,
}

/// OAuth switches that vary per environment
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthOverride {
    /// Override `oauth.enabled`
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Override `oauth.mandatory`
    #[serde(default)]
    pub mandatory: Option<bool>,
}

/// The parsed `stagehand.yaml`
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagehandConfig {
    /// Default namespace
    #[serde(default)]
    pub namespace: Option<String>,
    /// Default manifest directory, relative to the config file
    #[serde(default)]
    pub manifests: Option<PathBuf>,
    /// Targets in declaration order
    pub targets: Vec<DeploymentTarget>,
    /// Secrets to provision
    #[serde(default)]
    pub secrets: Vec<SecretDescriptor>,
    /// OAuth handshake
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,
    /// Detector thresholds
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Timing knobs
    #[serde(default)]
    pub timings: Timings,
    /// Environment overrides by name
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    /// Directory the file was loaded from
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Configuration with one environment's overrides applied and validated
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedConfig {
    /// Environment name
    pub environment: String,
    /// Namespace to deploy into
    pub namespace: String,
    /// Directory of rendered manifests
    pub manifests: PathBuf,
    /// Targets in declaration order
    pub targets: Vec<DeploymentTarget>,
    /// Secrets to provision
    pub secrets: Vec<SecretDescriptor>,
    /// OAuth handshake, `None` when disabled
    pub oauth: Option<OAuthConfig>,
    /// Detector thresholds
    pub detector: DetectorConfig,
    /// Timing knobs
    pub timings: Timings,
}

impl StagehandConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&content)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::configuration(format!("failed to parse configuration: {}", e)))
    }

    /// Apply an environment's overrides and validate the result
    pub fn resolve(&self, environment: &str) -> Result<ResolvedConfig> {
        let overrides = match self.environments.get(environment) {
            Some(env) => env.clone(),
            None if self.environments.is_empty() => EnvironmentConfig::default(),
            None => {
                return Err(Error::configuration_for_field(
                    "environments",
                    format!(
                        "unknown environment '{}' (known: {})",
                        environment,
                        self.environments
                            .keys()
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                ))
            }
        };

        let namespace = overrides
            .namespace
            .or_else(|| self.namespace.clone())
            .ok_or_else(|| {
                Error::configuration_for_field("namespace", "no namespace configured")
            })?;

        let manifests = overrides
            .manifests
            .or_else(|| self.manifests.clone())
            .map(|dir| self.base_dir.join(dir))
            .ok_or_else(|| {
                Error::configuration_for_field("manifests", "no manifest directory configured")
            })?;

        let mut targets = self.targets.clone();
        for (name, replicas) in &overrides.replicas {
            let target = targets.iter_mut().find(|t| &t.name == name).ok_or_else(|| {
                Error::configuration_for_field(
                    format!("environments.{}.replicas", environment),
                    format!("unknown target '{}'", name),
                )
            })?;
            target.replicas = *replicas;
        }

        let oauth = match self.oauth.clone() {
            Some(mut oauth) => {
                if let Some(switches) = &overrides.oauth {
                    if let Some(enabled) = switches.enabled {
                        oauth.enabled = enabled;
                    }
                    if let Some(mandatory) = switches.mandatory {
                        oauth.mandatory = mandatory;
                    }
                }
                oauth.enabled.then_some(oauth)
            }
            None => None,
        };

        let resolved = ResolvedConfig {
            environment: environment.to_string(),
            namespace,
            manifests,
            targets,
            secrets: self.secrets.clone(),
            oauth,
            detector: self.detector.clone(),
            timings: self.timings.clone(),
        };
        resolved.validate()?;
        Ok(resolved)
    }
}

impl ResolvedConfig {
    /// Pre-flight validation of names and references.
    ///
    /// Cycle detection happens when the target graph is built.
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(Error::configuration_for_field(
                "targets",
                "at least one target is required",
            ));
        }

        let mut names = HashSet::new();
        for (i, target) in self.targets.iter().enumerate() {
            if target.name.trim().is_empty() {
                return Err(Error::configuration_for_field(
                    format!("targets[{}].name", i),
                    "target name must not be empty",
                ));
            }
            if !names.insert(target.name.as_str()) {
                return Err(Error::configuration_for_field(
                    format!("targets[{}].name", i),
                    format!("duplicate target '{}'", target.name),
                ));
            }
            if target.replicas < 0 {
                return Err(Error::configuration_for_field(
                    format!("targets[{}].replicas", i),
                    "replicas must not be negative",
                ));
            }
            if target.readiness_timeout.is_zero() {
                return Err(Error::configuration_for_field(
                    format!("targets[{}].readinessTimeoutSeconds", i),
                    "readiness timeout must be positive",
                ));
            }
        }

        for (i, target) in self.targets.iter().enumerate() {
            for dep in &target.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(Error::configuration_for_field(
                        format!("targets[{}].dependsOn", i),
                        format!("'{}' depends on unknown target '{}'", target.name, dep),
                    ));
                }
            }
        }

        let mut known: HashSet<&str> = names;
        for aux in &self.detector.auxiliary {
            known.insert(aux.name.as_str());
        }
        if let Some(oauth) = &self.oauth {
            known.insert(oauth.proxy.name.as_str());
            if oauth.client_id.is_empty() {
                return Err(Error::configuration_for_field(
                    "oauth.clientId",
                    "client id must not be empty",
                ));
            }
            if oauth.max_attempts == 0 {
                return Err(Error::configuration_for_field(
                    "oauth.maxAttempts",
                    "at least one attempt is required",
                ));
            }
        }

        let mut secret_names = HashSet::new();
        for (i, secret) in self.secrets.iter().enumerate() {
            if !secret_names.insert(secret.name.as_str()) {
                return Err(Error::configuration_for_field(
                    format!("secrets[{}].name", i),
                    format!("duplicate secret '{}'", secret.name),
                ));
            }
            if secret.fields.is_empty() {
                return Err(Error::configuration_for_field(
                    format!("secrets[{}].fields", i),
                    format!("secret '{}' has no fields", secret.name),
                ));
            }
            for consumer in &secret.consumers {
                if !known.contains(consumer.as_str()) {
                    return Err(Error::configuration_for_field(
                        format!("secrets[{}].consumers", i),
                        format!("unknown consumer '{}'", consumer),
                    ));
                }
            }
        }

        if self.timings.max_parallel_waits == 0 {
            return Err(Error::configuration_for_field(
                "timings.maxParallelWaits",
                "must be at least 1",
            ));
        }

        Ok(())
    }

    /// Every component the detector monitors, flagged `true` for auxiliaries.
    ///
    /// Targets come first in declaration order; an auxiliary that shares a
    /// target's name is monitored once, as a target.
    pub fn monitored_components(&self) -> Vec<(ComponentRef, bool)> {
        let mut components: Vec<(ComponentRef, bool)> = self
            .targets
            .iter()
            .map(|t| (t.component(), false))
            .collect();
        for aux in &self.detector.auxiliary {
            if !components.iter().any(|(c, _)| c.name == aux.name) {
                components.push((aux.clone(), true));
            }
        }
        components
    }
}
