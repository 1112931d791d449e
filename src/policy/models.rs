// Warden - Policy documents
//
// Policies are JSON documents holding prioritised allow/deny rules.
// Patterns use `*` as a wildcard matching any run of characters.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::PolicyError;
use crate::capability::CapabilityRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    #[default]
    Active,
    Inactive,
    Deprecated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: String,
    #[serde(default)]
    pub status: PolicyStatus,
    pub rules: Vec<PolicyRule>,
}

impl Policy {
    /// Structural checks applied before a policy is accepted by an engine.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let invalid = |reason: String| PolicyError::Invalid {
            policy: if self.id.is_empty() {
                "<unnamed>".to_string()
            } else {
                self.id.clone()
            },
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("policy id cannot be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("policy name cannot be empty".to_string()));
        }
        if self.version.trim().is_empty() {
            return Err(invalid("policy version cannot be empty".to_string()));
        }
        if self.rules.is_empty() {
            return Err(invalid("policy must have at least one rule".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.id.trim().is_empty() {
                return Err(invalid(format!("rule {} has an empty id", i)));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(invalid(format!("duplicate rule id '{}'", rule.id)));
            }
            for (j, condition) in rule.conditions.iter().enumerate() {
                condition
                    .validate()
                    .map_err(|reason| invalid(format!("rule '{}' condition {}: {}", rule.id, j, reason)))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub effect: Effect,
    /// Resource patterns. Empty matches any resource.
    #[serde(default)]
    pub resources: Vec<String>,
    /// Permission patterns. Empty matches any permission.
    #[serde(default)]
    pub actions: Vec<String>,
    /// Identity patterns. Empty matches any identity, including none.
    #[serde(default)]
    pub identities: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// Higher runs first.
    #[serde(default)]
    pub priority: u32,
}

impl PolicyRule {
    /// Whether this rule applies to `request`.
    ///
    /// An allow rule must cover every requested permission; a deny rule
    /// fires if it covers any of them.
    pub fn matches(&self, request: &CapabilityRequest) -> bool {
        if !self.resources.is_empty()
            && !self
                .resources
                .iter()
                .any(|p| matches_pattern(p, &request.resource))
        {
            return false;
        }

        if !self.actions.is_empty() {
            let covered = |perm: &String| self.actions.iter().any(|p| matches_pattern(p, perm));
            let hit = match self.effect {
                Effect::Allow => {
                    !request.permissions.is_empty() && request.permissions.iter().all(covered)
                }
                Effect::Deny => request.permissions.iter().any(covered),
            };
            if !hit {
                return false;
            }
        }

        if !self.identities.is_empty() {
            let Some(identity) = request.identity.as_deref() else {
                return false;
            };
            if !self.identities.iter().any(|p| matches_pattern(p, identity)) {
                return false;
            }
        }

        self.conditions.iter().all(|c| c.evaluate(request))
    }
}

/// Request attribute a condition inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionField {
    Identity,
    Resource,
    Action,
    Service,
    Environment,
    Namespace,
    /// Context metadata entry named by the condition's `key`.
    Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    In,
    NotIn,
    Contains,
    Prefix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    One(String),
    Many(Vec<String>),
}

impl ConditionValue {
    fn as_slice(&self) -> &[String] {
        match self {
            Self::One(v) => std::slice::from_ref(v),
            Self::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(rename = "type")]
    pub field: ConditionField,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub value: ConditionValue,
    #[serde(default)]
    pub negate: bool,
}

impl RuleCondition {
    fn validate(&self) -> Result<(), String> {
        if self.field == ConditionField::Metadata
            && self.key.as_deref().map_or(true, |k| k.trim().is_empty())
        {
            return Err("metadata conditions need a key".to_string());
        }
        match (self.operator, &self.value) {
            (Operator::In | Operator::NotIn, _) => Ok(()),
            (_, ConditionValue::Many(_)) => Err(format!(
                "operator {:?} takes a single value",
                self.operator
            )),
            _ => Ok(()),
        }
    }

    pub fn evaluate(&self, request: &CapabilityRequest) -> bool {
        let ctx = &request.context;
        let actual: Vec<&str> = match self.field {
            ConditionField::Identity => request.identity.as_deref().into_iter().collect(),
            ConditionField::Resource => vec![request.resource.as_str()],
            ConditionField::Action => request.permissions.iter().map(String::as_str).collect(),
            ConditionField::Service => vec![ctx.service()],
            ConditionField::Environment => vec![ctx.environment()],
            ConditionField::Namespace => ctx.namespace().into_iter().collect(),
            ConditionField::Metadata => self
                .key
                .as_deref()
                .and_then(|k| ctx.metadata_value(k))
                .into_iter()
                .collect(),
        };

        let expected = self.value.as_slice();
        let matched = match self.operator {
            Operator::Eq => actual.iter().any(|a| expected.iter().any(|e| a == e)),
            Operator::Ne => !actual.iter().any(|a| expected.iter().any(|e| a == e)),
            Operator::In => actual.iter().any(|a| expected.iter().any(|e| a == e)),
            Operator::NotIn => !actual.is_empty() && actual.iter().all(|a| !expected.iter().any(|e| a == e)),
            Operator::Contains => actual
                .iter()
                .any(|a| expected.iter().any(|e| a.contains(e.as_str()))),
            Operator::Prefix => actual
                .iter()
                .any(|a| expected.iter().any(|e| a.starts_with(e.as_str()))),
        };

        matched != self.negate
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub effect: Effect,
    /// `policy_id/rule_id` of the deciding rule; None for the default decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub applied_policies: Vec<String>,
}

impl PolicyDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            effect: Effect::Allow,
            rule: None,
            reason: reason.into(),
            applied_policies: Vec::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            effect: Effect::Deny,
            rule: None,
            reason: reason.into(),
            applied_policies: Vec::new(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.effect == Effect::Allow
    }
}

/// Glob match where `*` matches any (possibly empty) run of characters.
pub fn matches_pattern(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return value.is_empty(),
    };
    let Some(mut remaining) = value.strip_prefix(first) else {
        return false;
    };

    let (last, middle) = match rest.split_last() {
        Some(split) => split,
        None => return remaining.is_empty(),
    };
    for part in middle {
        match remaining.find(part) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    fn request() -> CapabilityRequest {
        CapabilityRequest::new(
            "db:orders",
            ["read", "write"],
            Context::builder("orders-api", "production")
                .namespace("payments")
                .metadata("team", "core")
                .build(),
        )
        .with_identity("svc-orders")
    }

    fn rule(effect: Effect) -> PolicyRule {
        PolicyRule {
            id: "r1".to_string(),
            description: None,
            effect,
            resources: vec![],
            actions: vec![],
            identities: vec![],
            conditions: vec![],
            priority: 0,
        }
    }

    #[test]
    fn test_glob_patterns() {
        assert!(matches_pattern("*", "anything"));
        assert!(matches_pattern("db:*", "db:orders"));
        assert!(matches_pattern("*:orders", "db:orders"));
        assert!(matches_pattern("db:*:read*", "db:eu:readonly"));
        assert!(!matches_pattern("db:*", "queue:jobs"));
        assert!(!matches_pattern("db:orders", "db:orders2"));
        assert!(matches_pattern("a*a", "aa"));
        assert!(!matches_pattern("a*a", "a"));
    }

    #[test]
    fn test_allow_rule_must_cover_all_permissions() {
        let mut r = rule(Effect::Allow);
        r.actions = vec!["read".to_string()];
        assert!(!r.matches(&request()));
        r.actions.push("write".to_string());
        assert!(r.matches(&request()));
    }

    #[test]
    fn test_deny_rule_fires_on_any_permission() {
        let mut r = rule(Effect::Deny);
        r.actions = vec!["write".to_string()];
        assert!(r.matches(&request()));
    }

    #[test]
    fn test_identity_patterns_reject_anonymous_requests() {
        let mut r = rule(Effect::Allow);
        r.identities = vec!["svc-*".to_string()];
        assert!(r.matches(&request()));

        let mut anonymous = request();
        anonymous.identity = None;
        assert!(!r.matches(&anonymous));
    }

    #[test]
    fn test_conditions_on_context() {
        let env = RuleCondition {
            field: ConditionField::Environment,
            operator: Operator::In,
            key: None,
            value: ConditionValue::Many(vec!["staging".to_string(), "production".to_string()]),
            negate: false,
        };
        assert!(env.evaluate(&request()));

        let team = RuleCondition {
            field: ConditionField::Metadata,
            operator: Operator::Eq,
            key: Some("team".to_string()),
            value: ConditionValue::One("core".to_string()),
            negate: true,
        };
        assert!(!team.evaluate(&request()));

        let ns = RuleCondition {
            field: ConditionField::Namespace,
            operator: Operator::Prefix,
            key: None,
            value: ConditionValue::One("pay".to_string()),
            negate: false,
        };
        assert!(ns.evaluate(&request()));
    }

    #[test]
    fn test_condition_deserializes_from_document_shape() {
        let json = r#"{"type":"service","operator":"not_in","value":["legacy"]}"#;
        let cond: RuleCondition = serde_json::from_str(json).unwrap();
        assert_eq!(cond.field, ConditionField::Service);
        assert!(cond.evaluate(&request()));
    }

    #[test]
    fn test_policy_validation() {
        let mut policy = Policy {
            id: "p1".to_string(),
            name: "orders".to_string(),
            description: None,
            version: "1".to_string(),
            status: PolicyStatus::Active,
            rules: vec![rule(Effect::Allow)],
        };
        assert!(policy.validate().is_ok());

        policy.rules.push(rule(Effect::Deny));
        assert!(matches!(policy.validate(), Err(PolicyError::Invalid { .. })));

        policy.rules.clear();
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_metadata_condition_requires_key() {
        let mut r = rule(Effect::Allow);
        r.conditions.push(RuleCondition {
            field: ConditionField::Metadata,
            operator: Operator::Eq,
            key: None,
            value: ConditionValue::One("x".to_string()),
            negate: false,
        });
        let policy = Policy {
            id: "p".to_string(),
            name: "p".to_string(),
            description: None,
            version: "1".to_string(),
            status: PolicyStatus::Active,
            rules: vec![r],
        };
        assert!(policy.validate().is_err());
    }
}
