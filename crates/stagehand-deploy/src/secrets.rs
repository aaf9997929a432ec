//! Credential provisioner
//!
//! Re-derives every configured secret on each run and upserts it. Generated
//! fields keep their previous value unless rotation is requested, so a rerun
//! without rotation leaves credentials byte-identical.
//!
//! The configured source of each field is recorded on the secret as
//! `stagehand.io/value-source.<field>`. A generated value is only reused
//! when that record still says "generate" with the same kind (or the secret
//! predates Stagehand and has no record); switching a field between literal
//! and generated, or between kinds, produces a fresh value.
//!
//! Fields marked `restartDependents` that changed produce restart obligations
//! for the secret's consumers.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use stagehand_common::config::{ComponentRef, RandomKind, SecretDescriptor, ValueSource};
use stagehand_common::{Error, Result, RESTARTED_AT_ANNOTATION, VALUE_SOURCE_ANNOTATION_PREFIX};

use crate::cluster::ClusterClient;
use crate::context::RunContext;
use crate::model::SecretData;

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Largest multiple of 62 that fits in a byte; bytes at or above are rejected
const ALNUM_REJECT_AT: u8 = 248;

/// Generate a random value of the given kind from the OS CSPRNG
pub fn generate(kind: RandomKind) -> std::result::Result<String, rand::Error> {
    match kind {
        RandomKind::Hex32 => {
            let bytes = random_bytes::<32>()?;
            Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
        }
        RandomKind::Base64 => {
            let bytes = random_bytes::<32>()?;
            Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        RandomKind::Alnum32 => {
            let mut out = String::with_capacity(32);
            let mut buf = [0u8; 64];
            while out.len() < 32 {
                OsRng.try_fill_bytes(&mut buf)?;
                for &b in buf.iter().filter(|&&b| b < ALNUM_REJECT_AT) {
                    if out.len() == 32 {
                        break;
                    }
                    out.push(ALPHANUMERIC[(b % 62) as usize] as char);
                }
            }
            Ok(out)
        }
    }
}

fn random_bytes<const N: usize>() -> std::result::Result<[u8; N], rand::Error> {
    let mut bytes = [0u8; N];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(bytes)
}

/// A request to regenerate a whole secret (`name`) or one field (`name/field`)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationRequest {
    /// Secret name
    pub secret: String,
    /// Field name, `None` for every generated field of the secret
    pub field: Option<String>,
}

impl RotationRequest {
    /// Whether this request covers the given field
    pub fn covers(&self, secret: &str, field: &str) -> bool {
        self.secret == secret && self.field.as_deref().map_or(true, |f| f == field)
    }
}

impl FromStr for RotationRequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (secret, field) = match s.split_once('/') {
            Some((secret, field)) => (secret, Some(field.to_string())),
            None => (s, None),
        };
        if secret.is_empty() || field.as_deref() == Some("") {
            return Err(Error::configuration_for_field(
                "rotate",
                format!("invalid rotation request '{}', expected <secret> or <secret>/<field>", s),
            ));
        }
        Ok(Self {
            secret: secret.to_string(),
            field,
        })
    }
}

impl fmt::Display for RotationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}/{}", self.secret, field),
            None => write!(f, "{}", self.secret),
        }
    }
}

/// How a field's value was decided
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldOutcome {
    /// Configured literal
    Literal,
    /// Previous generated value kept
    Reused,
    /// Generated because no usable previous value existed
    Generated,
    /// Regenerated on request
    Rotated,
}

/// Decision for one field (never carries the value)
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPlan {
    /// Field name
    pub field: String,
    /// How the value was decided
    pub outcome: FieldOutcome,
    /// Whether the value differs from the one stored before
    pub changed: bool,
}

/// Decisions for one secret
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretPlan {
    /// Secret name
    pub name: String,
    /// Whether the secret existed before this run
    pub existed: bool,
    /// Per-field decisions, in field name order
    pub fields: Vec<FieldPlan>,
}

/// A consumer that must restart to pick up a changed value
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartObligation {
    /// Component to restart
    pub consumer: String,
    /// Secret whose value changed
    pub secret: String,
}

/// Result of one provisioning pass
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionReport {
    /// Per-secret decisions
    pub secrets: Vec<SecretPlan>,
    /// Restart obligations, one per consumer and secret
    pub obligations: Vec<RestartObligation>,
}

/// Derives, generates and upserts secrets
pub struct CredentialProvisioner<'a> {
    cluster: &'a dyn ClusterClient,
}

impl<'a> CredentialProvisioner<'a> {
    /// Create a provisioner using the given cluster client
    pub fn new(cluster: &'a dyn ClusterClient) -> Self {
        Self { cluster }
    }

    /// Provision every secret; in dry-run mode only the plan is computed
    #[instrument(skip_all, fields(secrets = secrets.len(), dry_run = ctx.dry_run))]
    pub async fn provision(
        &self,
        ctx: &RunContext,
        secrets: &[SecretDescriptor],
        rotate: &[RotationRequest],
    ) -> Result<ProvisionReport> {
        for request in rotate {
            let Some(descriptor) = secrets.iter().find(|s| s.name == request.secret) else {
                return Err(Error::configuration_for_field(
                    "rotate",
                    format!("unknown secret '{}'", request.secret),
                ));
            };
            if let Some(field) = &request.field {
                match descriptor.fields.get(field).map(|spec| &spec.source) {
                    Some(ValueSource::GenerateRandom(_)) => {}
                    Some(ValueSource::Literal(_)) => {
                        return Err(Error::configuration_for_field(
                            "rotate",
                            format!("{} is a literal and cannot be rotated", request),
                        ));
                    }
                    None => {
                        return Err(Error::configuration_for_field(
                            "rotate",
                            format!("unknown field '{}' in secret '{}'", field, request.secret),
                        ));
                    }
                }
            }
        }

        let mut report = ProvisionReport::default();
        for descriptor in secrets {
            ctx.checkpoint("provision-secrets")?;
            let (plan, restart) = self.provision_one(ctx, descriptor, rotate).await?;
            if restart {
                for consumer in &descriptor.consumers {
                    report.obligations.push(RestartObligation {
                        consumer: consumer.clone(),
                        secret: descriptor.name.clone(),
                    });
                }
            }
            report.secrets.push(plan);
        }
        Ok(report)
    }

    async fn provision_one(
        &self,
        ctx: &RunContext,
        descriptor: &SecretDescriptor,
        rotate: &[RotationRequest],
    ) -> Result<(SecretPlan, bool)> {
        let prior = self.cluster.secret(&descriptor.name).await?;
        let existed = prior.is_some();
        let prior = prior.unwrap_or_default();

        let mut desired = SecretData::default();
        let mut fields = Vec::with_capacity(descriptor.fields.len());
        let mut restart = false;

        for (field, spec) in &descriptor.fields {
            let intent = spec.source.intent();
            let previous = prior.data.get(field).filter(|v| !v.is_empty());

            let (value, outcome) = match &spec.source {
                ValueSource::Literal(value) => (value.clone(), FieldOutcome::Literal),
                ValueSource::GenerateRandom(kind) => {
                    let rotating = rotate.iter().any(|r| r.covers(&descriptor.name, field));
                    let recorded = prior
                        .annotations
                        .get(&annotation_key(field))
                        .map(String::as_str);
                    let reusable = recorded.map_or(true, |r| r == intent);

                    match previous {
                        Some(prev) if !rotating && reusable => {
                            (prev.clone(), FieldOutcome::Reused)
                        }
                        _ => {
                            let value = generate(*kind).map_err(|e| Error::SecretGeneration {
                                secret: descriptor.name.clone(),
                                field: field.clone(),
                                message: e.to_string(),
                            })?;
                            let outcome = if rotating {
                                FieldOutcome::Rotated
                            } else {
                                FieldOutcome::Generated
                            };
                            (value, outcome)
                        }
                    }
                }
            };

            let changed = prior.data.get(field) != Some(&value);
            if changed && spec.restart_dependents {
                restart = true;
            }
            debug!(secret = %descriptor.name, field = %field, ?outcome, changed, "field decided");

            desired.data.insert(field.clone(), value);
            desired.annotations.insert(annotation_key(field), intent);
            fields.push(FieldPlan {
                field: field.clone(),
                outcome,
                changed,
            });
        }

        if ctx.dry_run {
            info!(secret = %descriptor.name, "dry run: secret not written");
        } else {
            self.cluster.upsert_secret(&descriptor.name, &desired).await?;
            info!(
                secret = %descriptor.name,
                changed = fields.iter().filter(|f| f.changed).count(),
                "secret provisioned"
            );
        }

        Ok((
            SecretPlan {
                name: descriptor.name.clone(),
                existed,
                fields,
            },
            restart,
        ))
    }
}

fn annotation_key(field: &str) -> String {
    format!("{}{}", VALUE_SOURCE_ANNOTATION_PREFIX, field)
}

/// Issue a rolling restart for each obligation whose consumer is not in `skip`.
///
/// Restart failures (typically: the consumer does not exist yet) are logged
/// and skipped. Returns the names of the components restarted.
pub async fn discharge_obligations(
    cluster: &dyn ClusterClient,
    ctx: &RunContext,
    obligations: &[RestartObligation],
    components: &[ComponentRef],
    skip: &HashSet<String>,
) -> Vec<String> {
    let mut restarted = Vec::new();
    let mut seen = HashSet::new();

    for obligation in obligations {
        let consumer = obligation.consumer.as_str();
        if skip.contains(consumer) || !seen.insert(consumer) {
            continue;
        }
        if ctx.dry_run {
            info!(workload = %consumer, "dry run: rolling restart skipped");
            continue;
        }

        let component = components
            .iter()
            .find(|c| c.name == consumer)
            .cloned()
            .unwrap_or_else(|| ComponentRef::deployment(consumer));
        let now = chrono::Utc::now().to_rfc3339();
        match cluster
            .annotate_pod_template(&component, RESTARTED_AT_ANNOTATION, &now)
            .await
        {
            Ok(()) => {
                info!(workload = %consumer, secret = %obligation.secret, "rolling restart issued");
                restarted.push(consumer.to_string());
            }
            Err(e) => {
                warn!(workload = %consumer, error = %e, "rolling restart failed, skipping");
            }
        }
    }
    restarted
}
