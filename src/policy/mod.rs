// Warden - Policy evaluation
//
// Decides whether a capability request may proceed to issuance. A deny
// is an ordinary outcome carried in `PolicyDecision`; `PolicyError` is
// reserved for engines that cannot reach a decision at all.

pub mod engine;
pub mod error;
pub mod models;

pub use engine::{PolicyConfig, PolicyEngine, RulePolicyEngine};
pub use error::PolicyError;
pub use models::{
    ConditionField, ConditionValue, Effect, Operator, Policy, PolicyDecision, PolicyRule,
    PolicyStatus, RuleCondition,
};
