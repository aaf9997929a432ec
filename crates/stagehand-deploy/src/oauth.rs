//! OAuth proxy handshake
//!
//! The proxy needs a client secret that only exists once the identity
//! platform has materialized the OAuth client object. The coordinator seeds
//! the proxy secret with an empty client secret and a fresh session secret,
//! polls for the client object, copies its secret over and restarts the
//! proxy. The state machine only moves forward; `Failed` is terminal.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use stagehand_common::config::{OAuthConfig, RandomKind};
use stagehand_common::{Error, Result};

use crate::cluster::ClusterClient;
use crate::context::RunContext;
use crate::identity::IdentityProvider;
use crate::model::SecretData;
use crate::secrets::generate;

/// Proxy secret key holding the static client id
pub const CLIENT_ID_KEY: &str = "client-id";
/// Proxy secret key holding the platform-generated client secret
pub const CLIENT_SECRET_KEY: &str = "client-secret";
/// Proxy secret key holding the cookie session secret
pub const SESSION_SECRET_KEY: &str = "session-secret";

/// Handshake progress
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HandshakeState {
    /// Nothing done yet
    NotStarted,
    /// Proxy secret seeded with a fresh session secret
    SecretGenerated,
    /// Polling for the client object
    AwaitingClientObject,
    /// Client object found with a secret
    ClientFound,
    /// Client secret written into the proxy secret
    SecretPropagated,
    /// Proxy pods deleted so they restart with the new secret
    ProxyRestarted,
    /// The client object never appeared
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeState::NotStarted => "not-started",
            HandshakeState::SecretGenerated => "secret-generated",
            HandshakeState::AwaitingClientObject => "awaiting-client-object",
            HandshakeState::ClientFound => "client-found",
            HandshakeState::SecretPropagated => "secret-propagated",
            HandshakeState::ProxyRestarted => "proxy-restarted",
            HandshakeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How the handshake ended
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeOutcome {
    /// Final state
    pub state: HandshakeState,
    /// Every state entered, in order
    pub transitions: Vec<HandshakeState>,
    /// Client object lookups made
    pub attempts: u32,
    /// Whether a failure aborts the run
    pub mandatory: bool,
}

impl HandshakeOutcome {
    /// Whether the proxy was restarted with a propagated secret
    pub fn succeeded(&self) -> bool {
        self.state == HandshakeState::ProxyRestarted
    }

    /// Convert a failed mandatory handshake into `HandshakeTimeout`
    pub fn into_result(self, client: &str) -> Result<Self> {
        if self.state == HandshakeState::Failed && self.mandatory {
            Err(Error::HandshakeTimeout {
                client: client.to_string(),
                attempts: self.attempts,
            })
        } else {
            Ok(self)
        }
    }
}

/// Drives the handshake for one proxy
pub struct OAuthCoordinator<'a> {
    cluster: &'a dyn ClusterClient,
    identity: &'a dyn IdentityProvider,
    config: &'a OAuthConfig,
    state: HandshakeState,
    transitions: Vec<HandshakeState>,
}

impl<'a> OAuthCoordinator<'a> {
    /// Create a coordinator in `NotStarted`
    pub fn new(
        cluster: &'a dyn ClusterClient,
        identity: &'a dyn IdentityProvider,
        config: &'a OAuthConfig,
    ) -> Self {
        Self {
            cluster,
            identity,
            config,
            state: HandshakeState::NotStarted,
            transitions: vec![HandshakeState::NotStarted],
        }
    }

    fn advance(&mut self, next: HandshakeState) {
        debug_assert!(next > self.state, "handshake moves forward only");
        info!(client = %self.config.client_id, from = %self.state, to = %next, "handshake transition");
        self.state = next;
        self.transitions.push(next);
    }

    fn outcome(self, attempts: u32) -> HandshakeOutcome {
        HandshakeOutcome {
            state: self.state,
            transitions: self.transitions,
            attempts,
            mandatory: self.config.mandatory,
        }
    }

    /// Run the handshake to `ProxyRestarted` or `Failed`.
    ///
    /// Poll exhaustion is reported as a `Failed` outcome; cluster errors and
    /// cancellation are returned as errors.
    #[instrument(skip_all, fields(client = %self.config.client_id))]
    pub async fn run(mut self, ctx: &RunContext) -> Result<HandshakeOutcome> {
        ctx.checkpoint("oauth-handshake")?;
        let secret_name = self.config.proxy_secret.clone();

        let session = generate(RandomKind::Alnum32).map_err(|e| Error::SecretGeneration {
            secret: secret_name.clone(),
            field: SESSION_SECRET_KEY.to_string(),
            message: e.to_string(),
        })?;
        let mut seed = SecretData::default();
        seed.data
            .insert(CLIENT_ID_KEY.to_string(), self.config.client_id.clone());
        seed.data
            .insert(CLIENT_SECRET_KEY.to_string(), String::new());
        seed.data.insert(SESSION_SECRET_KEY.to_string(), session);
        self.cluster.upsert_secret(&secret_name, &seed).await?;
        self.advance(HandshakeState::SecretGenerated);

        self.advance(HandshakeState::AwaitingClientObject);
        let object_name = self.config.client_object_name().to_string();
        let mut attempts = 0;
        let mut found = None;
        while attempts < self.config.max_attempts {
            attempts += 1;
            match self.identity.client_object(&object_name).await {
                Ok(Some(object)) => {
                    found = Some(object);
                    break;
                }
                Ok(None) => {
                    debug!(client = %object_name, attempt = attempts, "client object not there yet");
                }
                Err(e) => {
                    debug!(client = %object_name, attempt = attempts, error = %e, "client object lookup failed");
                }
            }
            if attempts < self.config.max_attempts && !ctx.sleep(self.config.poll_interval).await {
                return Err(Error::cancelled("oauth-handshake"));
            }
        }

        let Some(object) = found else {
            warn!(
                client = %object_name,
                attempts,
                mandatory = self.config.mandatory,
                "oauth client object never appeared"
            );
            self.advance(HandshakeState::Failed);
            return Ok(self.outcome(attempts));
        };
        self.advance(HandshakeState::ClientFound);

        ctx.checkpoint("oauth-propagate")?;
        let patch = BTreeMap::from([(CLIENT_SECRET_KEY.to_string(), object.secret)]);
        self.cluster.patch_secret(&secret_name, &patch).await?;
        self.advance(HandshakeState::SecretPropagated);

        self.cluster
            .delete_pods(
                &self.config.proxy.selector(),
                ctx.timings.drain_grace_seconds,
            )
            .await?;
        self.advance(HandshakeState::ProxyRestarted);

        Ok(self.outcome(attempts))
    }
}
