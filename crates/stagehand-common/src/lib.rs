//! Common types for Stagehand: errors, configuration and Kubernetes helpers

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply issued by Stagehand
pub const FIELD_MANAGER: &str = "stagehand";

/// Label key identifying resources managed by Stagehand
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value for resources managed by Stagehand
pub const LABEL_MANAGED_BY_STAGEHAND: &str = "stagehand";

/// Annotation prefix recording the configured source of each secret field.
///
/// The full key is `stagehand.io/value-source.<field>`.
pub const VALUE_SOURCE_ANNOTATION_PREFIX: &str = "stagehand.io/value-source.";

/// Pod template annotation used to trigger a rolling restart
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "stagehand.yaml";
