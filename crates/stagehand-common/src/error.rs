//! Error types for Stagehand
//!
//! Errors are structured with fields so an aborted run can name the step and
//! target that failed. Timeouts that callers are expected to branch on
//! (readiness, drain) are not errors at their boundary; they only become
//! errors here once the orchestrator decides they are fatal.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Stagehand operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Missing or invalid configuration, detected before anything is mutated
    #[error("configuration error{}: {message}", at_field(.field))]
    Configuration {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "targets[2].dependsOn")
        field: Option<String>,
    },

    /// A single platform call failed
    #[error("cluster communication error [{operation}] for {target}: {message}")]
    ClusterCommunication {
        /// The client operation that failed (scale, apply, upsert-secret, ...)
        operation: String,
        /// The resource involved
        target: String,
        /// Description of what failed
        message: String,
    },

    /// A target never became ready within its budget
    #[error("target {target} not ready after {timeout_secs}s: {last_status}")]
    ReadinessTimeout {
        /// Name of the target
        target: String,
        /// Readiness budget that elapsed
        timeout_secs: u64,
        /// Last rollout status observed before giving up
        last_status: String,
    },

    /// The OAuth client object never appeared
    #[error("oauth client {client} not found after {attempts} attempts")]
    HandshakeTimeout {
        /// Name of the OAuth client object that was polled
        client: String,
        /// Number of poll attempts made
        attempts: u32,
    },

    /// Duplicate-process condition that one restart did not clear
    #[error("integrity violation in {target}: {message}")]
    IntegrityViolation {
        /// Name of the target
        target: String,
        /// Description of what was detected
        message: String,
    },

    /// Random value generation failed
    #[error("failed to generate value for secret {secret} field {field}: {message}")]
    SecretGeneration {
        /// Secret being provisioned
        secret: String,
        /// Field being generated
        field: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// The run was interrupted between two steps
    #[error("run cancelled before {step}")]
    Cancelled {
        /// The step that was about to start
        step: String,
    },

    /// A rollout step failed and the sequence stopped
    #[error(
        "rollout aborted at step {step}{}: {source} (forced recovery {})",
        for_target(.target),
        attempted(.forced_recovery)
    )]
    RolloutAborted {
        /// Sequencer step that failed
        step: String,
        /// Target involved, if the failure is target specific
        target: Option<String>,
        /// Whether forced deletion or a recovery cycle ran before the failure
        forced_recovery: bool,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },
}

fn at_field(field: &Option<String>) -> String {
    field.as_ref().map(|f| format!(" at {f}")).unwrap_or_default()
}

fn for_target(target: &Option<String>) -> String {
    target
        .as_ref()
        .map(|t| format!(" for target {t}"))
        .unwrap_or_default()
}

fn attempted(forced_recovery: &bool) -> &'static str {
    if *forced_recovery {
        "attempted"
    } else {
        "not attempted"
    }
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error with a field path
    pub fn configuration_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a cluster communication error without a specific target
    pub fn cluster(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ClusterCommunication {
            operation: operation.into(),
            target: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a cluster communication error for a named resource
    pub fn cluster_for(
        operation: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ClusterCommunication {
            operation: operation.into(),
            target: target.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a cancellation error for the step that was about to run
    pub fn cancelled(step: impl Into<String>) -> Self {
        Self::Cancelled { step: step.into() }
    }

    /// Wrap an error as the cause of an aborted rollout
    pub fn aborted(
        step: impl Into<String>,
        target: Option<String>,
        forced_recovery: bool,
        source: Error,
    ) -> Self {
        Self::RolloutAborted {
            step: step.into(),
            target,
            forced_recovery,
            source: Box::new(source),
        }
    }

    /// Check if rerunning the same operation could succeed without a config change
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Configuration { .. } => false,
            Error::ClusterCommunication { .. } => true,
            Error::ReadinessTimeout { .. } => true,
            Error::HandshakeTimeout { .. } => true,
            Error::IntegrityViolation { .. } => true,
            Error::SecretGeneration { .. } => true,
            Error::Serialization { .. } => false,
            Error::Cancelled { .. } => true,
            Error::RolloutAborted { source, .. } => source.is_retryable(),
        }
    }

    /// Get the target name if this error is associated with a specific target
    pub fn target(&self) -> Option<&str> {
        match self {
            Error::ClusterCommunication { target, .. } => Some(target),
            Error::ReadinessTimeout { target, .. } => Some(target),
            Error::IntegrityViolation { target, .. } => Some(target),
            Error::RolloutAborted { target, source, .. } => {
                target.as_deref().or_else(|| source.target())
            }
            _ => None,
        }
    }

    /// The innermost error, looking through `RolloutAborted` wrappers
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RolloutAborted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
