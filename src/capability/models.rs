// Warden - Capability data models
//
// A `GrantedCapability` is only ever valid while it is unrevoked and the
// current instant is strictly before `expires_at`. There is no renewal:
// a fresh grant is a fresh capability with a fresh id.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::constraints::CapabilityConstraints;
use super::CapabilityError;
use crate::context::Context;

/// A request for a capability over `resource`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    /// Requesting identity. Stamped or stripped by the gateway depending on
    /// the connection's authentication state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub resource: String,
    pub permissions: BTreeSet<String>,
    /// Requested lifetime in seconds. The engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u32>,
    pub context: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    /// Conditions checked on every validation of the resulting grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<CapabilityConstraints>,
}

impl CapabilityRequest {
    pub fn new<I, S>(resource: impl Into<String>, permissions: I, context: Context) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identity: None,
            resource: resource.into(),
            permissions: permissions.into_iter().map(Into::into).collect(),
            ttl_secs: None,
            max_uses: None,
            context,
            purpose: None,
            constraints: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    pub fn with_max_uses(mut self, max_uses: u32) -> Self {
        self.max_uses = Some(max_uses);
        self
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }

    pub fn with_constraints(mut self, constraints: CapabilityConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }
}

/// Coarse classification of a permission set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityType {
    Read,
    Write,
    Delete,
    Execute,
    Admin,
}

impl CapabilityType {
    /// Strongest type implied by the permissions: admin > delete > write > execute > read.
    pub fn from_permissions(permissions: &BTreeSet<String>) -> Self {
        let has = |names: &[&str]| permissions.iter().any(|p| names.contains(&p.as_str()));
        if has(&["admin", "*"]) {
            Self::Admin
        } else if has(&["delete"]) {
            Self::Delete
        } else if has(&["write", "create", "update"]) {
            Self::Write
        } else if has(&["execute", "run"]) {
            Self::Execute
        } else {
            Self::Read
        }
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Delete => write!(f, "delete"),
            Self::Execute => write!(f, "execute"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// Lifecycle state of a grant as observed at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityState {
    Active,
    Revoked,
    Expired,
}

impl fmt::Display for CapabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Revoked => write!(f, "revoked"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationInfo {
    pub revoked_at: DateTime<Utc>,
    pub reason: String,
    pub revoked_by: String,
}

/// A capability issued by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantedCapability {
    pub id: String,
    #[serde(rename = "type")]
    pub capability_type: CapabilityType,
    pub resource: String,
    pub permissions: BTreeSet<String>,
    pub identity: String,
    pub issuer: String,
    pub context: Context,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub max_uses: u32,
    #[serde(default)]
    pub used_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<CapabilityConstraints>,
    /// Hex-encoded Ed25519 signature over the immutable fields.
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation: Option<RevocationInfo>,
}

impl GrantedCapability {
    pub fn is_revoked(&self) -> bool {
        self.revocation.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// `now < expires_at`, and never once revoked.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && !self.is_expired_at(now)
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> CapabilityState {
        if self.is_revoked() {
            CapabilityState::Revoked
        } else if self.is_expired_at(now) {
            CapabilityState::Expired
        } else {
            CapabilityState::Active
        }
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

impl fmt::Display for GrantedCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let permissions: Vec<&str> = self.permissions.iter().map(String::as_str).collect();
        write!(
            f,
            "[{}] {} on {} for {} (expires {})",
            self.id,
            permissions.join(","),
            self.resource,
            self.identity,
            self.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Result of `CapabilityEngine::generate`. A denial is an expected outcome,
/// not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum GrantOutcome {
    Granted(GrantedCapability),
    Denied { reason: String },
}

/// Why a known capability failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvalidReason {
    Expired,
    Revoked,
    InvalidSignature,
    ConstraintViolation,
    UsageLimitExceeded,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "expired"),
            Self::Revoked => write!(f, "revoked"),
            Self::InvalidSignature => write!(f, "invalid signature"),
            Self::ConstraintViolation => write!(f, "constraint violation"),
            Self::UsageLimitExceeded => write!(f, "usage limit exceeded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub capability_id: String,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<InvalidReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub remaining_uses: u32,
    /// Whether the supplied context equals the grant context. Diagnostic only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_matches: Option<bool>,
}

impl ValidationResult {
    /// Turn an invalid result into the matching typed error.
    pub fn ensure_valid(&self) -> Result<(), CapabilityError> {
        let id = self.capability_id.clone();
        match self.reason {
            None if self.valid => Ok(()),
            Some(InvalidReason::Expired) => Err(CapabilityError::Expired(id)),
            Some(InvalidReason::Revoked) => Err(CapabilityError::Revoked(id)),
            Some(InvalidReason::InvalidSignature) => Err(CapabilityError::InvalidSignature(id)),
            Some(InvalidReason::ConstraintViolation) => Err(CapabilityError::ConstraintViolation(
                self.message.clone().unwrap_or(id),
            )),
            Some(InvalidReason::UsageLimitExceeded) => {
                Err(CapabilityError::UsageLimitExceeded(id))
            }
            None => Err(CapabilityError::Internal(format!(
                "capability {} reported invalid without a reason",
                id
            ))),
        }
    }
}

/// Filter for listing capabilities. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Exact resource, or a prefix pattern ending in `*`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CapabilityState>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub capability_type: Option<CapabilityType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

impl CapabilityFilter {
    pub fn for_identity(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            ..Default::default()
        }
    }

    /// Overlay the fields set in `supplied` on top of `self`.
    pub fn merged_with(self, supplied: CapabilityFilter) -> Self {
        Self {
            identity: supplied.identity.or(self.identity),
            resource: supplied.resource.or(self.resource),
            status: supplied.status.or(self.status),
            capability_type: supplied.capability_type.or(self.capability_type),
            limit: supplied.limit.or(self.limit),
            offset: supplied.offset.or(self.offset),
        }
    }

    pub fn matches(&self, capability: &GrantedCapability, now: DateTime<Utc>) -> bool {
        if let Some(identity) = &self.identity {
            if &capability.identity != identity {
                return false;
            }
        }
        if let Some(resource) = &self.resource {
            let hit = match resource.strip_suffix('*') {
                Some(prefix) => capability.resource.starts_with(prefix),
                None => &capability.resource == resource,
            };
            if !hit {
                return false;
            }
        }
        if let Some(status) = self.status {
            if capability.state_at(now) != status {
                return false;
            }
        }
        if let Some(kind) = self.capability_type {
            if capability.capability_type != kind {
                return false;
            }
        }
        true
    }
}

/// Parse a TTL string such as `"30s"`, `"5m"`, `"1h"` or `"2d"`.
/// A bare number is taken as seconds. Returns None on anything else.
pub fn parse_ttl(ttl: &str) -> Option<Duration> {
    let ttl = ttl.trim();
    let split = ttl
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(ttl.len());
    let (num_str, unit) = ttl.split_at(split);
    let amount: i64 = num_str.parse().ok()?;

    match unit {
        "" | "s" => Some(Duration::seconds(amount)),
        "m" => Some(Duration::minutes(amount)),
        "h" => Some(Duration::hours(amount)),
        "d" => Some(Duration::days(amount)),
        _ => None,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn perms(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn sample(now: DateTime<Utc>) -> GrantedCapability {
        GrantedCapability {
            id: "cap_1".to_string(),
            capability_type: CapabilityType::Read,
            resource: "db:orders".to_string(),
            permissions: perms(&["read"]),
            identity: "svc-a".to_string(),
            issuer: "warden-agent".to_string(),
            context: Context::builder("svc-a", "dev").correlation_id("c").build(),
            granted_at: now,
            expires_at: now + Duration::seconds(60),
            ttl_secs: 60,
            max_uses: 10,
            used_count: 0,
            purpose: None,
            constraints: None,
            signature: String::new(),
            revocation: None,
        }
    }

    #[test]
    fn test_capability_type_precedence() {
        assert_eq!(CapabilityType::from_permissions(&perms(&["read"])), CapabilityType::Read);
        assert_eq!(
            CapabilityType::from_permissions(&perms(&["read", "write"])),
            CapabilityType::Write
        );
        assert_eq!(
            CapabilityType::from_permissions(&perms(&["write", "delete"])),
            CapabilityType::Delete
        );
        assert_eq!(CapabilityType::from_permissions(&perms(&["run"])), CapabilityType::Execute);
        assert_eq!(
            CapabilityType::from_permissions(&perms(&["delete", "*"])),
            CapabilityType::Admin
        );
    }

    #[test]
    fn test_validity_boundary_is_exclusive() {
        let now = Utc::now();
        let cap = sample(now);
        assert!(cap.is_valid_at(now));
        assert!(cap.is_valid_at(now + Duration::seconds(59)));
        assert!(!cap.is_valid_at(now + Duration::seconds(60)));
        assert_eq!(cap.state_at(now + Duration::seconds(60)), CapabilityState::Expired);
        assert_eq!(cap.remaining_at(now + Duration::seconds(120)), Duration::zero());
    }

    #[test]
    fn test_revoked_is_invalid_regardless_of_ttl() {
        let now = Utc::now();
        let mut cap = sample(now);
        cap.revocation = Some(RevocationInfo {
            revoked_at: now,
            reason: "rotated".to_string(),
            revoked_by: "ops".to_string(),
        });
        assert!(!cap.is_valid_at(now));
        assert_eq!(cap.state_at(now), CapabilityState::Revoked);
    }

    #[test]
    fn test_filter_merge_prefers_supplied_fields() {
        let base = CapabilityFilter::for_identity("svc-a");
        let supplied = CapabilityFilter {
            resource: Some("db:*".to_string()),
            ..Default::default()
        };
        let merged = base.merged_with(supplied);
        assert_eq!(merged.identity.as_deref(), Some("svc-a"));
        assert_eq!(merged.resource.as_deref(), Some("db:*"));
    }

    #[test]
    fn test_filter_matches_prefix_and_status() {
        let now = Utc::now();
        let cap = sample(now);
        let filter = CapabilityFilter {
            resource: Some("db:*".to_string()),
            status: Some(CapabilityState::Active),
            ..Default::default()
        };
        assert!(filter.matches(&cap, now));
        assert!(!filter.matches(&cap, now + Duration::hours(1)));

        let other = CapabilityFilter::for_identity("svc-b");
        assert!(!other.matches(&cap, now));
    }

    #[test]
    fn test_parse_ttl_units() {
        assert_eq!(parse_ttl("30s"), Some(Duration::seconds(30)));
        assert_eq!(parse_ttl("5m"), Some(Duration::minutes(5)));
        assert_eq!(parse_ttl("1h"), Some(Duration::hours(1)));
        assert_eq!(parse_ttl("2d"), Some(Duration::days(2)));
        assert_eq!(parse_ttl("45"), Some(Duration::seconds(45)));
        assert_eq!(parse_ttl("1w"), None);
        assert_eq!(parse_ttl("abc"), None);
    }

    #[test]
    fn test_ensure_valid_maps_reasons() {
        let result = ValidationResult {
            capability_id: "cap_1".to_string(),
            valid: false,
            reason: Some(InvalidReason::Expired),
            message: None,
            expires_at: Utc::now(),
            remaining_uses: 0,
            context_matches: None,
        };
        assert!(matches!(result.ensure_valid(), Err(CapabilityError::Expired(_))));
    }
}
