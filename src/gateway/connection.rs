// Warden - Connection state
//
// One `Connection` per accepted socket, owned by that socket's serving
// loop. The server registry only holds `ConnectionInfo` snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::caller::CallerInfo;
use crate::protocol::AuthMethod;

#[derive(Debug)]
pub struct Connection {
    id: String,
    caller: Option<CallerInfo>,
    authenticated: bool,
    identity: Option<String>,
    auth_method: Option<AuthMethod>,
    metadata: BTreeMap<String, String>,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl Connection {
    /// Seeds the metadata with the caller's peer credentials and
    /// executable fingerprint, when known.
    pub fn new(caller: Option<CallerInfo>) -> Self {
        let now = Utc::now();
        let mut metadata = BTreeMap::new();
        if let Some(caller) = &caller {
            metadata.insert("uid".to_string(), caller.uid.to_string());
            metadata.insert("gid".to_string(), caller.gid.to_string());
            if let Some(pid) = caller.pid {
                metadata.insert("pid".to_string(), pid.to_string());
            }
            if let Some(path) = &caller.exe_path {
                metadata.insert("exe_path".to_string(), path.display().to_string());
            }
            if let Some(hash) = &caller.exe_hash {
                metadata.insert("exe_hash".to_string(), hash.clone());
            }
        }
        Self {
            id: format!("conn_{}", Uuid::new_v4().simple()),
            caller,
            authenticated: false,
            identity: None,
            auth_method: None,
            metadata,
            connected_at: now,
            last_activity: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn caller(&self) -> Option<&CallerInfo> {
        self.caller.as_ref()
    }

    /// Remote endpoint descriptor.
    pub fn remote(&self) -> String {
        self.caller
            .as_ref()
            .map(CallerInfo::descriptor)
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Resolved identity. Only set once authenticated.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn auth_method(&self) -> Option<AuthMethod> {
        self.auth_method
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn authenticate(&mut self, identity: impl Into<String>, method: AuthMethod) {
        self.authenticated = true;
        self.identity = Some(identity.into());
        self.auth_method = Some(method);
        self.set_metadata("auth_method", method.to_string());
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            remote: self.remote(),
            authenticated: self.authenticated,
            identity: self.identity.clone(),
            metadata: self.metadata.clone(),
            connected_at: self.connected_at,
            last_activity: self.last_activity,
        }
    }
}

/// Read-only snapshot of a connection, as seen by the server registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub remote: String,
    pub authenticated: bool,
    pub identity: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_connection_is_anonymous() {
        let conn = Connection::new(None);
        assert!(conn.id().starts_with("conn_"));
        assert!(!conn.is_authenticated());
        assert!(conn.identity().is_none());
        assert_eq!(conn.remote(), "unknown");
    }

    #[test]
    fn test_authenticate_sets_identity() {
        let mut conn = Connection::new(None);
        conn.authenticate("svc-orders", AuthMethod::Peer);
        assert!(conn.is_authenticated());
        assert_eq!(conn.identity(), Some("svc-orders"));

        let info = conn.info();
        assert!(info.authenticated);
        assert_eq!(info.identity.as_deref(), Some("svc-orders"));
    }

    #[test]
    fn test_touch_moves_last_activity_forward() {
        let mut conn = Connection::new(None);
        let before = conn.last_activity();
        conn.touch();
        assert!(conn.last_activity() >= before);
    }

    #[test]
    fn test_metadata_is_seeded_from_caller_and_snapshotted() {
        let caller = CallerInfo {
            uid: 1000,
            gid: 1000,
            pid: Some(4242),
            exe_path: Some(std::path::PathBuf::from("/usr/bin/orders")),
            exe_hash: Some("ab".repeat(32)),
        };
        let mut conn = Connection::new(Some(caller));
        assert_eq!(conn.metadata().get("uid").map(String::as_str), Some("1000"));
        assert_eq!(conn.metadata().get("pid").map(String::as_str), Some("4242"));
        assert_eq!(
            conn.metadata().get("exe_path").map(String::as_str),
            Some("/usr/bin/orders")
        );

        conn.set_metadata("region", "eu-west-1");
        conn.authenticate("svc-orders", AuthMethod::Token);
        let info = conn.info();
        assert_eq!(info.metadata.get("region").map(String::as_str), Some("eu-west-1"));
        assert_eq!(info.metadata.get("auth_method").map(String::as_str), Some("token"));
        assert_eq!(info.metadata.get("exe_hash").map(String::len), Some(64));
    }

    #[test]
    fn test_anonymous_connection_has_no_metadata() {
        assert!(Connection::new(None).info().metadata.is_empty());
    }
}
