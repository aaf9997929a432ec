//! Identity platform boundary: lookup of externally managed OAuth clients

use async_trait::async_trait;
use kube::api::{Api, DynamicObject};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use stagehand_common::kube_utils::build_api_resource;
use stagehand_common::{Error, Result};

/// apiVersion of OpenShift OAuth clients
pub const OAUTH_CLIENT_API_VERSION: &str = "oauth.openshift.io/v1";
/// Kind of OpenShift OAuth clients
pub const OAUTH_CLIENT_KIND: &str = "OAuthClient";

/// The part of an OAuth client object the handshake needs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientObject {
    /// Platform-generated client secret
    pub secret: String,
}

/// Looks up OAuth client objects created by the identity platform
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Fetch a client object, `None` until the platform has created it
    async fn client_object(&self, name: &str) -> Result<Option<ClientObject>>;
}

/// OpenShift `OAuthClient` lookup (cluster scoped)
pub struct OpenShiftIdentityProvider {
    client: Client,
}

impl OpenShiftIdentityProvider {
    /// Create a provider using the given kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IdentityProvider for OpenShiftIdentityProvider {
    async fn client_object(&self, name: &str) -> Result<Option<ClientObject>> {
        let ar = build_api_resource(OAUTH_CLIENT_API_VERSION, OAUTH_CLIENT_KIND);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);

        let Some(obj) = api
            .get_opt(name)
            .await
            .map_err(|e| Error::cluster_for("get-oauth-client", name, e.to_string()))?
        else {
            return Ok(None);
        };

        match obj.data.get("secret").and_then(|s| s.as_str()) {
            Some(secret) if !secret.is_empty() => Ok(Some(ClientObject {
                secret: secret.to_string(),
            })),
            _ => {
                debug!(client = %name, "oauth client exists but has no secret yet");
                Ok(None)
            }
        }
    }
}
