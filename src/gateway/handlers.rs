// Warden - Request handlers
//
// Maps one decoded request onto one response message. Handler failures
// become `error_response` messages; nothing here closes the connection.

use crate::capability::{CapabilityError, CapabilityFilter, CapabilityRequest, GrantOutcome};
use crate::protocol::{
    AuthMethod, AuthRequest, AuthResponse, CapabilityResponse, ErrorCode, ListResponse, Message,
    PingResponse, RevokeRequest, RevokeResponse, StatusResponse, ValidateRequest,
};

use super::connection::Connection;
use super::uds::ServerState;

const AUDIT: &str = "warden::audit";

/// Handle one request on behalf of `conn`.
pub(super) fn dispatch(state: &ServerState, conn: &mut Connection, message: Message) -> Message {
    match message {
        Message::AuthRequest(req) => handle_auth(state, conn, req),
        Message::CapabilityRequest(req) => handle_capability_request(state, conn, req),
        Message::CapabilityValidate(req) => handle_validate(state, req),
        Message::CapabilityRevoke(req) => handle_revoke(state, conn, req),
        Message::CapabilityList(filter) => handle_list(state, conn, filter),
        Message::StatusRequest => handle_status(state, conn),
        Message::PingRequest => Message::PingResponse(PingResponse::pong()),
        other => Message::error(
            ErrorCode::ProtocolError,
            format!("{} is not a request", other.kind()),
        ),
    }
}

// ─── Authentication ──────────────────────────────────────────────────────────

fn handle_auth(state: &ServerState, conn: &mut Connection, req: AuthRequest) -> Message {
    let identity = req.identity.trim();
    if identity.is_empty() {
        return Message::error(ErrorCode::AuthenticationFailed, "identity must not be empty");
    }

    if state.config.auth_enabled {
        if let Err(reason) = check_credentials(state, conn, &req) {
            tracing::warn!(
                target: AUDIT,
                connection_id = %conn.id(),
                remote = %conn.remote(),
                identity = %identity,
                method = %req.method,
                %reason,
                "Authentication failed"
            );
            return Message::error(ErrorCode::AuthenticationFailed, reason);
        }
    }

    conn.authenticate(identity, req.method);
    state.refresh(conn);
    tracing::info!(
        target: AUDIT,
        connection_id = %conn.id(),
        remote = %conn.remote(),
        identity = %identity,
        method = %req.method,
        "Connection authenticated"
    );

    Message::AuthResponse(AuthResponse {
        authenticated: true,
        identity: identity.to_string(),
        method: req.method,
        connection_id: conn.id().to_string(),
    })
}

fn check_credentials(state: &ServerState, conn: &Connection, req: &AuthRequest) -> Result<(), String> {
    match req.method {
        AuthMethod::Peer => {
            let Some(caller) = conn.caller() else {
                return Err("peer credentials unavailable".to_string());
            };
            if caller.uid == state.owner_uid() {
                Ok(())
            } else {
                Err(format!(
                    "peer uid {} does not own the socket",
                    caller.uid
                ))
            }
        }
        AuthMethod::Token => {
            let Some(token) = req.token.as_deref() else {
                return Err("token authentication requires a token".to_string());
            };
            if state.config.auth_tokens.iter().any(|t| t.matches(token)) {
                Ok(())
            } else {
                Err("invalid token".to_string())
            }
        }
    }
}

/// Connections that must authenticate before `action`.
fn require_auth(state: &ServerState, conn: &Connection, action: &str) -> Option<Message> {
    if state.config.auth_enabled && !conn.is_authenticated() {
        Some(Message::error(
            ErrorCode::AuthenticationRequired,
            format!("{} requires an authenticated connection", action),
        ))
    } else {
        None
    }
}

// ─── Capabilities ────────────────────────────────────────────────────────────

fn handle_capability_request(
    state: &ServerState,
    conn: &Connection,
    mut req: CapabilityRequest,
) -> Message {
    if state.config.auth_enabled {
        req.identity = if conn.is_authenticated() {
            conn.identity().map(str::to_string)
        } else {
            None
        };
    }

    let decision = match state.policy.evaluate(&req) {
        Ok(decision) => decision,
        Err(e) => {
            tracing::error!(error = %e, resource = %req.resource, "Policy evaluation failed");
            return Message::error(ErrorCode::PolicyEvaluationFailed, e.to_string());
        }
    };

    if !decision.is_allowed() {
        tracing::info!(
            target: AUDIT,
            connection_id = %conn.id(),
            identity = req.identity.as_deref().unwrap_or("-"),
            resource = %req.resource,
            reason = %decision.reason,
            "Capability request denied by policy"
        );
        return Message::CapabilityResponse(CapabilityResponse::denied(
            decision.reason,
            decision.rule,
        ));
    }

    match state.engine.generate(&req) {
        Ok(GrantOutcome::Granted(capability)) => {
            Message::CapabilityResponse(CapabilityResponse::granted(capability))
        }
        Ok(GrantOutcome::Denied { reason }) => {
            Message::CapabilityResponse(CapabilityResponse::denied(reason, decision.rule))
        }
        Err(e) => capability_error(e),
    }
}

fn handle_validate(state: &ServerState, req: ValidateRequest) -> Message {
    match state.engine.validate(&req.capability_id, req.context.as_ref()) {
        Ok(result) => Message::ValidationResponse(result),
        Err(e) => capability_error(e),
    }
}

fn handle_revoke(state: &ServerState, conn: &Connection, req: RevokeRequest) -> Message {
    if let Some(denied) = require_auth(state, conn, "capability_revoke") {
        return denied;
    }

    let revoked_by = req
        .revoked_by
        .or_else(|| conn.identity().map(str::to_string))
        .unwrap_or_else(|| conn.remote());
    let reason = req
        .reason
        .unwrap_or_else(|| "revoked by client".to_string());

    match state.engine.revoke(&req.capability_id, &reason, &revoked_by) {
        Ok(revocation) => Message::RevokeResponse(RevokeResponse {
            capability_id: req.capability_id,
            revoked: true,
            revocation,
        }),
        Err(e) => capability_error(e),
    }
}

fn handle_list(state: &ServerState, conn: &Connection, supplied: CapabilityFilter) -> Message {
    if let Some(denied) = require_auth(state, conn, "capability_list") {
        return denied;
    }

    let base = match conn.identity() {
        Some(identity) if conn.is_authenticated() => CapabilityFilter::for_identity(identity),
        _ => CapabilityFilter::default(),
    };
    let filter = base.merged_with(supplied);

    match state.engine.list(&filter) {
        Ok(capabilities) => Message::ListResponse(ListResponse {
            count: capabilities.len(),
            capabilities,
        }),
        Err(e) => capability_error(e),
    }
}

fn capability_error(err: CapabilityError) -> Message {
    let code = match &err {
        CapabilityError::NotFound(_) => ErrorCode::CapabilityNotFound,
        CapabilityError::Expired(_) => ErrorCode::CapabilityExpired,
        _ => ErrorCode::CapabilityEngineError,
    };
    if code == ErrorCode::CapabilityEngineError {
        tracing::error!(error = %err, "Capability engine failure");
    }
    Message::error(code, err.to_string())
}

// ─── Status ──────────────────────────────────────────────────────────────────

fn handle_status(state: &ServerState, conn: &Connection) -> Message {
    Message::StatusResponse(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: state.connection_count(),
        max_connections: state.config.max_connections,
        socket_path: state.config.socket_path.display().to_string(),
        authenticated: conn.is_authenticated(),
        identity: conn.identity().map(str::to_string),
        connection_id: conn.id().to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        metadata: conn.metadata().clone(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capability::{EngineConfig, InvalidReason, MemoryCapabilityEngine};
    use crate::clock::ManualClock;
    use crate::config::{SecretToken, ServerConfig};
    use crate::context::Context;
    use crate::gateway::caller::CallerInfo;
    use crate::policy::{Effect, Policy, PolicyRule, PolicyStatus, RulePolicyEngine};

    fn allow_db_policy() -> Policy {
        Policy {
            id: "db".to_string(),
            name: "db access".to_string(),
            description: None,
            version: "1".to_string(),
            status: PolicyStatus::Active,
            rules: vec![PolicyRule {
                id: "read-db".to_string(),
                description: None,
                effect: Effect::Allow,
                resources: vec!["db:*".to_string()],
                actions: vec!["read".to_string()],
                identities: vec!["svc-*".to_string()],
                conditions: vec![],
                priority: 10,
            }],
        }
    }

    fn state(auth_enabled: bool) -> ServerState {
        let config = ServerConfig {
            auth_enabled,
            auth_tokens: vec![SecretToken::new("letmein")],
            ..Default::default()
        };
        let policy = RulePolicyEngine::from_policies(vec![allow_db_policy()], Effect::Deny).unwrap();
        let engine = MemoryCapabilityEngine::with_clock(
            EngineConfig::default(),
            Arc::new(ManualClock::default()),
        );
        ServerState::new(config, Arc::new(policy), Arc::new(engine))
    }

    fn caller(uid: u32) -> CallerInfo {
        CallerInfo {
            uid,
            gid: uid,
            pid: None,
            exe_path: None,
            exe_hash: None,
        }
    }

    fn capability_request(identity: &str) -> Message {
        Message::CapabilityRequest(
            CapabilityRequest::new(
                "db:orders",
                ["read"],
                Context::builder("orders", "test").build(),
            )
            .with_identity(identity),
        )
    }

    fn token_auth(identity: &str, token: &str) -> Message {
        Message::AuthRequest(AuthRequest {
            identity: identity.to_string(),
            method: AuthMethod::Token,
            token: Some(token.to_string()),
        })
    }

    fn granted_id(msg: Message) -> String {
        match msg {
            Message::CapabilityResponse(resp) => resp.capability_id().unwrap().to_string(),
            other => panic!("expected grant, got {:?}", other),
        }
    }

    #[test]
    fn test_peer_auth_requires_matching_uid() {
        let state = state(true);
        state.set_owner_uid(1000);
        let mut conn = Connection::new(Some(caller(1000)));
        let ok = dispatch(
            &state,
            &mut conn,
            Message::AuthRequest(AuthRequest {
                identity: "svc-orders".to_string(),
                method: AuthMethod::Peer,
                token: None,
            }),
        );
        assert!(matches!(ok, Message::AuthResponse(_)));
        assert_eq!(conn.identity(), Some("svc-orders"));

        let mut stranger = Connection::new(Some(caller(1001)));
        let denied = dispatch(
            &state,
            &mut stranger,
            Message::AuthRequest(AuthRequest {
                identity: "svc-orders".to_string(),
                method: AuthMethod::Peer,
                token: None,
            }),
        );
        assert!(matches!(denied, Message::Error(ref e) if e.code == ErrorCode::AuthenticationFailed));
        assert!(!stranger.is_authenticated());
    }

    #[test]
    fn test_token_auth() {
        let state = state(true);
        let mut conn = Connection::new(None);
        let bad = dispatch(&state, &mut conn, token_auth("svc-a", "wrong"));
        assert!(matches!(bad, Message::Error(_)));
        let good = dispatch(&state, &mut conn, token_auth("svc-a", "letmein"));
        assert!(matches!(good, Message::AuthResponse(ref r) if r.identity == "svc-a"));
    }

    #[test]
    fn test_unauthenticated_request_loses_claimed_identity() {
        let state = state(true);
        let mut conn = Connection::new(None);
        let resp = dispatch(&state, &mut conn, capability_request("svc-orders"));
        match resp {
            Message::CapabilityResponse(r) => assert!(!r.is_granted()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_authenticated_identity_replaces_claimed_identity() {
        let state = state(true);
        let mut conn = Connection::new(None);
        dispatch(&state, &mut conn, token_auth("svc-billing", "letmein"));

        let resp = dispatch(&state, &mut conn, capability_request("someone-else"));
        match resp {
            Message::CapabilityResponse(r) => {
                assert_eq!(r.capability.unwrap().identity, "svc-billing");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_auth_disabled_keeps_claimed_identity() {
        let state = state(false);
        let mut conn = Connection::new(None);
        let id = granted_id(dispatch(&state, &mut conn, capability_request("svc-orders")));
        assert!(id.starts_with("cap_"));
    }

    #[test]
    fn test_policy_denial_is_not_an_error() {
        let state = state(false);
        let mut conn = Connection::new(None);
        let resp = dispatch(&state, &mut conn, capability_request("intruder"));
        match resp {
            Message::CapabilityResponse(r) => {
                assert!(!r.is_granted());
                assert!(r.reason.unwrap().contains("default decision"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_validate_unknown_is_not_found() {
        let state = state(false);
        let mut conn = Connection::new(None);
        let resp = dispatch(
            &state,
            &mut conn,
            Message::CapabilityValidate(ValidateRequest {
                capability_id: "cap_nope".to_string(),
                context: None,
            }),
        );
        assert!(matches!(resp, Message::Error(ref e) if e.code == ErrorCode::CapabilityNotFound));
    }

    #[test]
    fn test_revoke_defaults_revoker_to_connection_identity() {
        let state = state(true);
        let mut conn = Connection::new(None);
        dispatch(&state, &mut conn, token_auth("svc-orders", "letmein"));
        let id = granted_id(dispatch(&state, &mut conn, capability_request("svc-orders")));

        let resp = dispatch(
            &state,
            &mut conn,
            Message::CapabilityRevoke(RevokeRequest {
                capability_id: id.clone(),
                reason: None,
                revoked_by: None,
            }),
        );
        match resp {
            Message::RevokeResponse(r) => {
                assert!(r.revoked);
                assert_eq!(r.revocation.revoked_by, "svc-orders");
            }
            other => panic!("unexpected {:?}", other),
        }

        let check = dispatch(
            &state,
            &mut conn,
            Message::CapabilityValidate(ValidateRequest {
                capability_id: id,
                context: None,
            }),
        );
        match check {
            Message::ValidationResponse(v) => assert_eq!(v.reason, Some(InvalidReason::Revoked)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_revoke_and_list_require_authentication() {
        let state = state(true);
        let mut conn = Connection::new(None);
        let revoke = dispatch(
            &state,
            &mut conn,
            Message::CapabilityRevoke(RevokeRequest {
                capability_id: "cap_x".to_string(),
                reason: None,
                revoked_by: None,
            }),
        );
        assert!(matches!(revoke, Message::Error(ref e) if e.code == ErrorCode::AuthenticationRequired));
        let list = dispatch(&state, &mut conn, Message::CapabilityList(CapabilityFilter::default()));
        assert!(matches!(list, Message::Error(ref e) if e.code == ErrorCode::AuthenticationRequired));
    }

    #[test]
    fn test_list_defaults_to_own_identity() {
        let state = state(true);
        let mut mine = Connection::new(None);
        dispatch(&state, &mut mine, token_auth("svc-a", "letmein"));
        dispatch(&state, &mut mine, capability_request("ignored"));

        let mut theirs = Connection::new(None);
        dispatch(&state, &mut theirs, token_auth("svc-b", "letmein"));
        dispatch(&state, &mut theirs, capability_request("ignored"));

        match dispatch(&state, &mut mine, Message::CapabilityList(CapabilityFilter::default())) {
            Message::ListResponse(list) => {
                assert_eq!(list.count, 1);
                assert_eq!(list.capabilities[0].identity, "svc-a");
            }
            other => panic!("unexpected {:?}", other),
        }

        let explicit = CapabilityFilter::for_identity("svc-b");
        match dispatch(&state, &mut mine, Message::CapabilityList(explicit)) {
            Message::ListResponse(list) => assert_eq!(list.capabilities[0].identity, "svc-b"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_status_reports_connection_details() {
        let state = state(true);
        let mut conn = Connection::new(None);
        match dispatch(&state, &mut conn, Message::StatusRequest) {
            Message::StatusResponse(status) => {
                assert_eq!(status.connection_id, conn.id());
                assert!(!status.authenticated);
                assert_eq!(status.max_connections, 100);
                assert!(status.metadata.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_status_exposes_connection_metadata() {
        let state = state(false);
        let mut conn = Connection::new(None);
        conn.set_metadata("region", "eu-west-1");
        dispatch(
            &state,
            &mut conn,
            Message::AuthRequest(AuthRequest {
                identity: "svc-a".to_string(),
                method: AuthMethod::Peer,
                token: None,
            }),
        );
        match dispatch(&state, &mut conn, Message::StatusRequest) {
            Message::StatusResponse(status) => {
                assert_eq!(status.metadata.get("region").map(String::as_str), Some("eu-west-1"));
                assert_eq!(status.metadata.get("auth_method").map(String::as_str), Some("peer"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_response_kinds_are_rejected_as_requests() {
        let state = state(false);
        let mut conn = Connection::new(None);
        let resp = dispatch(&state, &mut conn, Message::PingResponse(PingResponse::pong()));
        assert!(matches!(resp, Message::Error(ref e) if e.code == ErrorCode::ProtocolError));
    }
}
