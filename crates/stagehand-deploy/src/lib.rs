//! Deployment orchestration for Stagehand
//!
//! Brings a namespaced multi-component application down and back up in
//! dependency order, provisions its credentials, completes the OAuth proxy
//! handshake and recovers stuck workloads.
//!
//! Every cluster interaction goes through the [`ClusterClient`] trait so the
//! sequencing logic can be exercised against a recording fake.

pub mod cluster;
pub mod context;
pub mod graph;
pub mod identity;
pub mod integrity;
pub mod model;
pub mod oauth;
pub mod readiness;
pub mod recovery;
pub mod secrets;
pub mod sequencer;

#[cfg(test)]
mod testing;

pub use cluster::{ClusterClient, KubeClusterClient};
pub use context::RunContext;
pub use graph::TargetGraph;
pub use identity::{IdentityProvider, OpenShiftIdentityProvider};
pub use integrity::{ProcessProbe, PsProcessProbe};
pub use oauth::{HandshakeOutcome, HandshakeState, OAuthCoordinator};
pub use readiness::{Readiness, ReadinessWaiter};
pub use recovery::{DetectorReport, MonitoredComponent, StuckDetector};
pub use secrets::{CredentialProvisioner, ProvisionReport, RotationRequest};
pub use sequencer::{RunReport, Sequencer, SequencerState};

pub use stagehand_common::{Error, Result};
