// Warden - Policy engine
//
// `RulePolicyEngine` flattens every active policy's rules into a single
// list ordered by priority (deny before allow on ties) and lets the first
// matching rule decide. When nothing matches, the configured default
// decision applies. The policy set can be re-read from disk while the
// server runs; a failed reload leaves the previous set in force.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::models::{Effect, Policy, PolicyDecision, PolicyRule, PolicyStatus};
use super::PolicyError;
use crate::capability::CapabilityRequest;

const AUDIT: &str = "warden::audit";

/// Abstraction over pre-grant authorization.
pub trait PolicyEngine: Send + Sync {
    /// Decide on `request`. A deny is `Ok`, not `Err`.
    fn evaluate(&self, request: &CapabilityRequest) -> Result<PolicyDecision, PolicyError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Directory of `*.json` policy documents. None starts with no policies.
    pub policy_dir: Option<PathBuf>,
    /// Decision when no rule matches.
    pub default_decision: Effect,
    /// Re-read `policy_dir` on this interval. None reloads only on SIGHUP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reload_interval_secs: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            policy_dir: None,
            default_decision: Effect::Deny,
            reload_interval_secs: None,
        }
    }
}

pub struct RulePolicyEngine {
    policies: RwLock<Vec<Policy>>,
    default_decision: Effect,
    policy_dir: Option<PathBuf>,
}

impl RulePolicyEngine {
    /// Build an engine from in-memory policies. Every policy is validated.
    pub fn from_policies(policies: Vec<Policy>, default_decision: Effect) -> Result<Self, PolicyError> {
        check_all(&policies)?;
        Ok(Self {
            policies: RwLock::new(policies),
            default_decision,
            policy_dir: None,
        })
    }

    /// Build an engine from a `PolicyConfig`, loading the policy directory if set.
    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyError> {
        let policies = match &config.policy_dir {
            Some(dir) => load_dir(dir)?,
            None => Vec::new(),
        };
        let mut engine = Self::from_policies(policies, config.default_decision)?;
        engine.policy_dir = config.policy_dir.clone();
        Ok(engine)
    }

    /// Re-read the policy directory. On failure the current set is kept.
    pub fn reload(&self) -> Result<usize, PolicyError> {
        let Some(dir) = &self.policy_dir else {
            return Ok(self.len());
        };
        let fresh = load_dir(dir)?;
        check_all(&fresh)?;
        let count = fresh.len();
        *self.write()? = fresh;
        tracing::info!(dir = %dir.display(), count, "Policies reloaded");
        Ok(count)
    }

    /// Call [`reload`](Self::reload) every `every` until `shutdown` fires.
    pub async fn reload_every(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reload() {
                        tracing::warn!(error = %e, "Policy reload failed; keeping current policies");
                    }
                }
            }
        }
    }

    pub fn policies(&self) -> Vec<Policy> {
        match self.policies.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.policies.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn default_decision(&self) -> Effect {
        self.default_decision
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<Policy>>, PolicyError> {
        self.policies
            .write()
            .map_err(|_| PolicyError::Internal("policy set lock poisoned".to_string()))
    }
}

impl PolicyEngine for RulePolicyEngine {
    fn evaluate(&self, request: &CapabilityRequest) -> Result<PolicyDecision, PolicyError> {
        let policies = self
            .policies
            .read()
            .map_err(|_| PolicyError::Internal("policy set lock poisoned".to_string()))?;

        let mut ordered: Vec<(&Policy, &PolicyRule)> = policies
            .iter()
            .filter(|p| p.status == PolicyStatus::Active)
            .flat_map(|p| p.rules.iter().map(move |r| (p, r)))
            .collect();
        ordered.sort_by(|(_, a), (_, b)| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| deny_first(a.effect).cmp(&deny_first(b.effect)))
        });

        let decision = match ordered.into_iter().find(|(_, rule)| rule.matches(request)) {
            Some((policy, rule)) => {
                let reference = format!("{}/{}", policy.id, rule.id);
                let reason = match &rule.description {
                    Some(desc) => format!("rule {} matched: {}", reference, desc),
                    None => format!("rule {} matched", reference),
                };
                PolicyDecision {
                    effect: rule.effect,
                    rule: Some(reference),
                    reason,
                    applied_policies: vec![policy.id.clone()],
                }
            }
            None => PolicyDecision {
                effect: self.default_decision,
                rule: None,
                reason: format!("no matching rule; default decision is {}", self.default_decision),
                applied_policies: Vec::new(),
            },
        };

        tracing::info!(
            target: AUDIT,
            identity = request.identity.as_deref().unwrap_or("-"),
            resource = %request.resource,
            effect = %decision.effect,
            rule = decision.rule.as_deref().unwrap_or("-"),
            "Policy evaluated"
        );

        Ok(decision)
    }
}

fn deny_first(effect: Effect) -> u8 {
    match effect {
        Effect::Deny => 0,
        Effect::Allow => 1,
    }
}

fn check_all(policies: &[Policy]) -> Result<(), PolicyError> {
    let mut ids = HashSet::new();
    for policy in policies {
        policy.validate()?;
        if !ids.insert(policy.id.as_str()) {
            return Err(PolicyError::Duplicate(policy.id.clone()));
        }
    }
    Ok(())
}

/// Load every `*.json` file in `dir` (non-recursive), in file-name order.
pub fn load_dir(dir: &Path) -> Result<Vec<Policy>, PolicyError> {
    let read_err = |source| PolicyError::Read {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(read_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut policies = Vec::with_capacity(paths.len());
    for path in paths {
        let data = std::fs::read_to_string(&path).map_err(|source| PolicyError::Read {
            path: path.clone(),
            source,
        })?;
        let policy: Policy =
            serde_json::from_str(&data).map_err(|source| PolicyError::Parse { path: path.clone(), source })?;
        tracing::debug!(path = %path.display(), id = %policy.id, "Loaded policy");
        policies.push(policy);
    }
    Ok(policies)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
