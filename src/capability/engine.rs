// Warden - Capability Engine
//
// Issues, validates, revokes, and lists capabilities. The in-memory
// engine keeps grants in a map behind a read/write lock and signs each
// grant with an Ed25519 key generated at startup, so a capability is
// only ever honoured by the engine instance that issued it.
//
// Validation order: revoked, expired, signature, constraints, usage
// limit. A successful validation consumes one use.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::constraints::CapabilityConstraints;
use super::models::{
    CapabilityFilter, CapabilityRequest, CapabilityType, GrantOutcome, GrantedCapability,
    InvalidReason, RevocationInfo, ValidationResult,
};
use super::CapabilityError;
use crate::clock::{Clock, SystemClock};
use crate::context::Context;

const AUDIT: &str = "warden::audit";

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over capability issuance and bookkeeping.
pub trait CapabilityEngine: Send + Sync {
    /// Issue a capability for an already policy-approved request.
    /// Malformed or out-of-bounds requests are denied, not errors.
    fn generate(&self, request: &CapabilityRequest) -> Result<GrantOutcome, CapabilityError>;

    /// Check a capability by id. Unknown ids are `CapabilityError::NotFound`;
    /// known but unusable capabilities return `valid = false` with a reason.
    fn validate(
        &self,
        capability_id: &str,
        context: Option<&Context>,
    ) -> Result<ValidationResult, CapabilityError>;

    /// Revoke a capability. Revoking twice keeps the first revocation record.
    fn revoke(
        &self,
        capability_id: &str,
        reason: &str,
        revoked_by: &str,
    ) -> Result<RevocationInfo, CapabilityError>;

    fn list(&self, filter: &CapabilityFilter) -> Result<Vec<GrantedCapability>, CapabilityError>;

    /// Drop grants that can never validate again. Returns how many were
    /// removed. Engines without local state have nothing to purge.
    fn purge_expired(&self) -> usize {
        0
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// TTL applied when a request does not ask for one.
    pub default_ttl_secs: u64,
    /// Upper bound on any requested TTL.
    pub max_ttl_secs: u64,
    /// Default and upper bound for `max_uses`.
    pub max_uses: u32,
    pub issuer: String,
    /// How long expired or revoked grants are kept before `purge_expired` drops them.
    pub retention_secs: u64,
    /// Interval of the server's background purge task.
    pub cleanup_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            max_ttl_secs: 3600,
            max_uses: 100,
            issuer: "warden-agent".to_string(),
            retention_secs: 3600,
            cleanup_interval_secs: 60,
        }
    }
}

// ─── In-memory Implementation ────────────────────────────────────────────────

pub struct MemoryCapabilityEngine {
    config: EngineConfig,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    clock: Arc<dyn Clock>,
    capabilities: RwLock<HashMap<String, GrantedCapability>>,
}

impl MemoryCapabilityEngine {
    /// Create an engine with a freshly generated signing key and the system clock.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut seed[..]);
        Self::with_signing_seed(config, clock, &seed)
    }

    /// Create an engine from a fixed 32-byte Ed25519 seed.
    pub fn with_signing_seed(config: EngineConfig, clock: Arc<dyn Clock>, seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            config,
            signing_key,
            verifying_key,
            clock,
            capabilities: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Hex-encoded public half of the signing key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.to_bytes())
    }

    fn check_request(&self, request: &CapabilityRequest) -> Result<(String, u64, u32), String> {
        let identity = match request.identity.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err("identity is required".to_string()),
        };
        if request.resource.trim().is_empty() {
            return Err("resource is required".to_string());
        }
        if request.permissions.is_empty() {
            return Err("at least one permission is required".to_string());
        }

        let ttl = match request.ttl_secs {
            None | Some(0) => self.config.default_ttl_secs,
            Some(ttl) if ttl > self.config.max_ttl_secs => {
                return Err(format!(
                    "requested TTL {}s exceeds maximum of {}s",
                    ttl, self.config.max_ttl_secs
                ))
            }
            Some(ttl) => ttl,
        };

        let max_uses = match request.max_uses {
            None | Some(0) => self.config.max_uses,
            Some(uses) if uses > self.config.max_uses => {
                return Err(format!(
                    "requested max uses {} exceeds maximum of {}",
                    uses, self.config.max_uses
                ))
            }
            Some(uses) => uses,
        };

        if let Some(constraints) = &request.constraints {
            check_constraints_shape(constraints)?;
        }

        Ok((identity, ttl, max_uses))
    }

    fn sign(&self, capability: &GrantedCapability) -> Result<String, CapabilityError> {
        let digest = signing_digest(capability)?;
        Ok(hex::encode(self.signing_key.sign(&digest).to_bytes()))
    }

    fn verify(&self, capability: &GrantedCapability) -> bool {
        let Ok(bytes) = hex::decode(&capability.signature) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&bytes) else {
            return false;
        };
        match signing_digest(capability) {
            Ok(digest) => self.verifying_key.verify(&digest, &signature).is_ok(),
            Err(_) => false,
        }
    }
}

impl CapabilityEngine for MemoryCapabilityEngine {
    fn generate(&self, request: &CapabilityRequest) -> Result<GrantOutcome, CapabilityError> {
        let (identity, ttl_secs, max_uses) = match self.check_request(request) {
            Ok(bounds) => bounds,
            Err(reason) => {
                tracing::info!(
                    target: AUDIT,
                    resource = %request.resource,
                    %reason,
                    "Capability request rejected by engine"
                );
                return Ok(GrantOutcome::Denied { reason });
            }
        };

        let now = self.clock.now();
        let Some(expires_at) = secs(ttl_secs).and_then(|ttl| now.checked_add_signed(ttl)) else {
            let reason = format!("TTL {}s is out of range", ttl_secs);
            tracing::info!(
                target: AUDIT,
                resource = %request.resource,
                %reason,
                "Capability request rejected by engine"
            );
            return Ok(GrantOutcome::Denied { reason });
        };
        let mut capability = GrantedCapability {
            id: format!("cap_{}", Uuid::new_v4().simple()),
            capability_type: CapabilityType::from_permissions(&request.permissions),
            resource: request.resource.clone(),
            permissions: request.permissions.clone(),
            identity,
            issuer: self.config.issuer.clone(),
            context: request.context.clone(),
            granted_at: now,
            expires_at,
            ttl_secs,
            max_uses,
            used_count: 0,
            purpose: request.purpose.clone(),
            constraints: request
                .constraints
                .clone()
                .filter(|c| !c.is_empty()),
            signature: String::new(),
            revocation: None,
        };
        capability.signature = self.sign(&capability)?;

        let mut caps = self
            .capabilities
            .write()
            .map_err(|_| CapabilityError::Internal("capability map lock poisoned".to_string()))?;
        caps.insert(capability.id.clone(), capability.clone());

        tracing::info!(
            target: AUDIT,
            capability_id = %capability.id,
            identity = %capability.identity,
            resource = %capability.resource,
            ttl_secs,
            "Capability granted"
        );

        Ok(GrantOutcome::Granted(capability))
    }

    fn validate(
        &self,
        capability_id: &str,
        context: Option<&Context>,
    ) -> Result<ValidationResult, CapabilityError> {
        let now = self.clock.now();
        let mut caps = self
            .capabilities
            .write()
            .map_err(|_| CapabilityError::Internal("capability map lock poisoned".to_string()))?;
        let capability = caps
            .get_mut(capability_id)
            .ok_or_else(|| CapabilityError::NotFound(capability_id.to_string()))?;

        let violation = match &capability.constraints {
            Some(constraints) => constraints.check(now, context).err(),
            None => None,
        };

        let failure = if capability.is_revoked() {
            Some(InvalidReason::Revoked)
        } else if capability.is_expired_at(now) {
            Some(InvalidReason::Expired)
        } else if !self.verify(capability) {
            Some(InvalidReason::InvalidSignature)
        } else if violation.is_some() {
            Some(InvalidReason::ConstraintViolation)
        } else if capability.used_count >= capability.max_uses {
            Some(InvalidReason::UsageLimitExceeded)
        } else {
            None
        };

        if failure.is_none() {
            capability.used_count += 1;
        }

        let message = failure.map(|reason| match reason {
            InvalidReason::Expired => format!(
                "capability expired at {}",
                capability.expires_at.to_rfc3339()
            ),
            InvalidReason::ConstraintViolation => violation.clone().unwrap_or_default(),
            InvalidReason::UsageLimitExceeded => format!(
                "usage limit exceeded: {}/{}",
                capability.used_count, capability.max_uses
            ),
            other => format!("capability {}", other),
        });

        if let Some(reason) = failure {
            tracing::info!(
                target: AUDIT,
                capability_id = %capability_id,
                %reason,
                "Capability validation failed"
            );
        }

        Ok(ValidationResult {
            capability_id: capability.id.clone(),
            valid: failure.is_none(),
            reason: failure,
            message,
            expires_at: capability.expires_at,
            remaining_uses: capability.max_uses.saturating_sub(capability.used_count),
            context_matches: context.map(|ctx| *ctx == capability.context),
        })
    }

    fn revoke(
        &self,
        capability_id: &str,
        reason: &str,
        revoked_by: &str,
    ) -> Result<RevocationInfo, CapabilityError> {
        let now = self.clock.now();
        let mut caps = self
            .capabilities
            .write()
            .map_err(|_| CapabilityError::Internal("capability map lock poisoned".to_string()))?;
        let capability = caps
            .get_mut(capability_id)
            .ok_or_else(|| CapabilityError::NotFound(capability_id.to_string()))?;

        if let Some(existing) = &capability.revocation {
            return Ok(existing.clone());
        }

        let info = RevocationInfo {
            revoked_at: now,
            reason: reason.to_string(),
            revoked_by: revoked_by.to_string(),
        };
        capability.revocation = Some(info.clone());

        tracing::info!(
            target: AUDIT,
            capability_id = %capability_id,
            revoked_by = %revoked_by,
            reason = %reason,
            "Capability revoked"
        );

        Ok(info)
    }

    fn list(&self, filter: &CapabilityFilter) -> Result<Vec<GrantedCapability>, CapabilityError> {
        let now = self.clock.now();
        let caps = self
            .capabilities
            .read()
            .map_err(|_| CapabilityError::Internal("capability map lock poisoned".to_string()))?;

        let mut matched: Vec<GrantedCapability> = caps
            .values()
            .filter(|cap| filter.matches(cap, now))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.granted_at.cmp(&b.granted_at).then_with(|| a.id.cmp(&b.id)));

        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    /// Drop grants that expired (or were revoked) more than `retention_secs` ago.
    /// Returns how many were removed.
    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let Some(cutoff) = secs(self.config.retention_secs).and_then(|r| now.checked_sub_signed(r))
        else {
            return 0;
        };
        let mut caps = match self.capabilities.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = caps.len();
        caps.retain(|_, cap| {
            let ended_at = match &cap.revocation {
                Some(rev) => rev.revoked_at.min(cap.expires_at),
                None => cap.expires_at,
            };
            ended_at > cutoff
        });
        let removed = before - caps.len();
        if removed > 0 {
            tracing::debug!(removed, "Purged ended capabilities");
        }
        removed
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Whole seconds as a `Duration`, or None when out of range.
fn secs(value: u64) -> Option<Duration> {
    i64::try_from(value).ok().and_then(Duration::try_seconds)
}

fn check_constraints_shape(constraints: &CapabilityConstraints) -> Result<(), String> {
    let Some(window) = &constraints.time_window else {
        return Ok(());
    };
    if let Some(hour) = window.hours.iter().find(|h| **h > 23) {
        return Err(format!("constraint hour {} is outside 0-23", hour));
    }
    if let Some(day) = window.days_of_week.iter().find(|d| **d > 6) {
        return Err(format!("constraint day {} is outside 0-6", day));
    }
    if window.blackout_periods.iter().any(|p| p.start >= p.end) {
        return Err("blackout period must end after it starts".to_string());
    }
    Ok(())
}

/// Fields covered by the signature. Mutable bookkeeping (`used_count`,
/// `revocation`) is excluded.
#[derive(Serialize)]
struct SignedFields<'a> {
    id: &'a str,
    capability_type: CapabilityType,
    resource: &'a str,
    permissions: &'a std::collections::BTreeSet<String>,
    identity: &'a str,
    issuer: &'a str,
    context: &'a Context,
    granted_at: i64,
    expires_at: i64,
    ttl_secs: u64,
    max_uses: u32,
    purpose: Option<&'a str>,
    constraints: Option<&'a CapabilityConstraints>,
}

fn signing_digest(capability: &GrantedCapability) -> Result<[u8; 32], CapabilityError> {
    let fields = SignedFields {
        id: &capability.id,
        capability_type: capability.capability_type,
        resource: &capability.resource,
        permissions: &capability.permissions,
        identity: &capability.identity,
        issuer: &capability.issuer,
        context: &capability.context,
        granted_at: timestamp_micros(capability.granted_at),
        expires_at: timestamp_micros(capability.expires_at),
        ttl_secs: capability.ttl_secs,
        max_uses: capability.max_uses,
        purpose: capability.purpose.as_deref(),
        constraints: capability.constraints.as_ref(),
    };
    let bytes = serde_json::to_vec(&fields).map_err(|e| CapabilityError::Signing(e.to_string()))?;
    Ok(Sha256::digest(&bytes).into())
}

fn timestamp_micros(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_micros()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
