//! Error types for the CLI

use stagehand_common::Error as CoreError;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Exit code for a configuration problem
pub const EXIT_CONFIGURATION: u8 = 2;
/// Exit code for a failed cluster call
pub const EXIT_CLUSTER: u8 = 3;
/// Exit code for a target that never became ready
pub const EXIT_READINESS: u8 = 4;
/// Exit code for a mandatory OAuth handshake that timed out
pub const EXIT_HANDSHAKE: u8 = 5;
/// Exit code for a duplicate process that a restart did not clear
pub const EXIT_INTEGRITY: u8 = 6;
/// Exit code for a credential that could not be generated
pub const EXIT_SECRET: u8 = 7;
/// Exit code for an interrupted run
pub const EXIT_CANCELLED: u8 = 130;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Stagehand(#[from] CoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Process exit code for this failure class
    pub fn exit_code(&self) -> u8 {
        let Error::Stagehand(err) = self else {
            return 1;
        };
        match err.root_cause() {
            CoreError::Configuration { .. } | CoreError::Serialization { .. } => EXIT_CONFIGURATION,
            CoreError::Kube { .. } | CoreError::ClusterCommunication { .. } => EXIT_CLUSTER,
            CoreError::ReadinessTimeout { .. } => EXIT_READINESS,
            CoreError::HandshakeTimeout { .. } => EXIT_HANDSHAKE,
            CoreError::IntegrityViolation { .. } => EXIT_INTEGRITY,
            CoreError::SecretGeneration { .. } => EXIT_SECRET,
            CoreError::Cancelled { .. } => EXIT_CANCELLED,
            CoreError::RolloutAborted { .. } => 1,
        }
    }
}
