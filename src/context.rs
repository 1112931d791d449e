// Warden - Request context
//
// An immutable description of who is asking and from where: service,
// environment, optional namespace, free-form metadata, and a correlation
// id. Built once per logical operation and carried unchanged through the
// request, the policy decision, and the granted capability.
//
// Equality is structural and exists for audit/diagnostic comparison.
// Authorization decisions look at identity and permissions, never at
// context equality.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    service: String,
    environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
    correlation_id: String,
}

impl Context {
    /// Start building a context for `service` running in `environment`.
    pub fn builder(service: impl Into<String>, environment: impl Into<String>) -> ContextBuilder {
        ContextBuilder {
            service: service.into(),
            environment: environment.into(),
            namespace: None,
            metadata: BTreeMap::new(),
            correlation_id: None,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.environment)?;
        if let Some(ns) = &self.namespace {
            write!(f, "/{}", ns)?;
        }
        write!(f, " [{}]", self.correlation_id)
    }
}

/// Builder for [`Context`]. A correlation id is generated when none is set.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    service: String,
    environment: String,
    namespace: Option<String>,
    metadata: BTreeMap<String, String>,
    correlation_id: Option<String>,
}

impl ContextBuilder {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn build(self) -> Context {
        Context {
            service: self.service,
            environment: self.environment,
            namespace: self.namespace,
            metadata: self.metadata,
            correlation_id: self
                .correlation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
