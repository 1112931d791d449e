// Warden - Broker Client
//
// A single connection to the broker socket. Each operation writes one
// envelope and waits for exactly one reply, both under the configured
// request timeout. Any transport failure drops the connection; the
// client never reconnects or retries on its own.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::capability::{CapabilityFilter, CapabilityRequest, ValidationResult};
use crate::config::ClientConfig;
use crate::context::Context;
use crate::error::{Result, WardenError};
use crate::protocol::{
    AuthRequest, AuthResponse, CapabilityResponse, Envelope, EnvelopeCodec, ListResponse, Message,
    MessageKind, PingResponse, ProtocolError, RevokeRequest, RevokeResponse, StatusResponse,
    ValidateRequest,
};

pub struct BrokerClient {
    config: ClientConfig,
    framed: Option<Framed<UnixStream, EnvelopeCodec>>,
    authenticated: bool,
    identity: Option<String>,
    connection_id: Option<String>,
}

impl BrokerClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            framed: None,
            authenticated: false,
            identity: None,
            connection_id: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Identity the server resolved during the handshake.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Server-assigned connection id, known after a handshake or status call.
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Dial the socket and, when enabled, authenticate.
    pub async fn connect(&mut self) -> Result<()> {
        self.config.validate()?;
        if self.is_connected() {
            return Ok(());
        }

        let path = &self.config.socket_path;
        let stream = tokio::time::timeout(self.config.connect_timeout(), UnixStream::connect(path))
            .await
            .map_err(|_| {
                WardenError::Transport(format!("timed out connecting to {}", path.display()))
            })?
            .map_err(|e| {
                WardenError::Transport(format!("cannot connect to {}: {}", path.display(), e))
            })?;
        self.framed = Some(Framed::new(stream, EnvelopeCodec::new()));
        tracing::debug!(socket = %path.display(), "Connected to broker");

        if self.config.auth_enabled {
            if let Err(e) = self.authenticate().await {
                self.close().await;
                return Err(match e {
                    WardenError::Authentication(_) | WardenError::Transport(_) => e,
                    other => WardenError::Authentication(other.to_string()),
                });
            }
        }

        if self.config.fetch_status_on_connect {
            match self.get_status().await {
                Ok(status) => tracing::debug!(
                    version = %status.version,
                    connections = status.connections,
                    max_connections = status.max_connections,
                    "Broker status"
                ),
                Err(e) => tracing::debug!(error = %e, "Status check after connect failed"),
            }
        }

        Ok(())
    }

    async fn authenticate(&mut self) -> Result<AuthResponse> {
        let creds = &self.config.credentials;
        let request = AuthRequest {
            identity: creds.identity.clone(),
            method: creds.method,
            token: creds.token.as_ref().map(|t| t.expose().to_string()),
        };

        let response = match self.call(Message::AuthRequest(request)).await? {
            Message::AuthResponse(resp) => resp,
            other => return Err(unexpected(MessageKind::AuthResponse, &other)),
        };
        if !response.authenticated {
            return Err(WardenError::Authentication(
                "server did not accept credentials".to_string(),
            ));
        }

        self.authenticated = true;
        self.identity = Some(response.identity.clone());
        self.connection_id = Some(response.connection_id.clone());
        tracing::debug!(identity = %response.identity, method = %response.method, "Authenticated");
        Ok(response)
    }

    /// Close the connection and forget authentication state. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut framed) = self.framed.take() {
            if let Err(e) = framed.close().await {
                tracing::debug!(error = %e, "Error closing broker connection");
            }
        }
        self.authenticated = false;
        self.identity = None;
        self.connection_id = None;
    }

    // ─── Operations ──────────────────────────────────────────────────────────

    /// Ask for a capability. A policy denial is `Ok` with a denied status.
    pub async fn request_capability(
        &mut self,
        mut request: CapabilityRequest,
    ) -> Result<CapabilityResponse> {
        if request.identity.is_none() {
            request.identity = Some(self.config.credentials.identity.clone());
        }
        match self.call(Message::CapabilityRequest(request)).await? {
            Message::CapabilityResponse(resp) => Ok(resp),
            other => Err(unexpected(MessageKind::CapabilityResponse, &other)),
        }
    }

    /// Validate a capability. Expired or revoked capabilities come back as
    /// an invalid result; use [`ValidationResult::ensure_valid`] to turn
    /// that into an error.
    pub async fn validate_capability(
        &mut self,
        capability_id: &str,
        context: Option<Context>,
    ) -> Result<ValidationResult> {
        let request = ValidateRequest {
            capability_id: capability_id.to_string(),
            context,
        };
        match self.call(Message::CapabilityValidate(request)).await? {
            Message::ValidationResponse(result) => Ok(result),
            other => Err(unexpected(MessageKind::ValidationResponse, &other)),
        }
    }

    pub async fn revoke_capability(
        &mut self,
        capability_id: &str,
        reason: Option<&str>,
    ) -> Result<RevokeResponse> {
        let request = RevokeRequest {
            capability_id: capability_id.to_string(),
            reason: reason.map(str::to_string),
            revoked_by: None,
        };
        match self.call(Message::CapabilityRevoke(request)).await? {
            Message::RevokeResponse(resp) => Ok(resp),
            other => Err(unexpected(MessageKind::RevokeResponse, &other)),
        }
    }

    pub async fn list_capabilities(&mut self, filter: CapabilityFilter) -> Result<ListResponse> {
        match self.call(Message::CapabilityList(filter)).await? {
            Message::ListResponse(resp) => Ok(resp),
            other => Err(unexpected(MessageKind::ListResponse, &other)),
        }
    }

    pub async fn get_status(&mut self) -> Result<StatusResponse> {
        match self.call(Message::StatusRequest).await? {
            Message::StatusResponse(status) => {
                self.connection_id = Some(status.connection_id.clone());
                Ok(status)
            }
            other => Err(unexpected(MessageKind::StatusResponse, &other)),
        }
    }

    pub async fn ping(&mut self) -> Result<PingResponse> {
        match self.call(Message::PingRequest).await? {
            Message::PingResponse(pong) => Ok(pong),
            other => Err(unexpected(MessageKind::PingResponse, &other)),
        }
    }

    // ─── Exchange ────────────────────────────────────────────────────────────

    /// Send one request and wait for its reply. Error responses become
    /// typed errors; transport failures also disconnect the client.
    async fn call(&mut self, message: Message) -> Result<Message> {
        let expected = message.kind().response_kind();
        let request = Envelope::new(message);
        let request_id = request.id.clone();
        let timeout = self.config.request_timeout();

        let reply = match self.exchange(request, timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_transport() {
                    self.drop_connection();
                }
                return Err(e);
            }
        };

        if reply.id != request_id {
            self.drop_connection();
            return Err(ProtocolError::CorrelationMismatch {
                sent: request_id,
                received: reply.id,
            }
            .into());
        }

        match reply.message {
            Message::Error(err) => Err(WardenError::from_remote(err.code, err.message)),
            message => match expected {
                Some(kind) if kind != message.kind() => Err(unexpected(kind, &message)),
                _ => Ok(message),
            },
        }
    }

    async fn exchange(&mut self, request: Envelope, timeout: Duration) -> Result<Envelope> {
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| WardenError::Transport("not connected".to_string()))?;

        match tokio::time::timeout(timeout, framed.send(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(WardenError::Transport(format!("write failed: {}", e))),
            Err(_) => return Err(WardenError::Transport("write timed out".to_string())),
        }

        match tokio::time::timeout(timeout, framed.next()).await {
            Err(_) => Err(WardenError::Transport("read timed out".to_string())),
            Ok(None) => Err(WardenError::Transport("connection closed by server".to_string())),
            Ok(Some(Err(e))) => Err(WardenError::Transport(format!("read failed: {}", e))),
            Ok(Some(Ok(Err(rejection)))) => Err(rejection.into_protocol_error().into()),
            Ok(Some(Ok(Ok(envelope)))) => Ok(envelope),
        }
    }

    fn drop_connection(&mut self) {
        if self.framed.take().is_some() {
            tracing::debug!("Broker connection marked unusable");
        }
        self.authenticated = false;
        self.identity = None;
        self.connection_id = None;
    }
}

fn unexpected(expected: MessageKind, actual: &Message) -> WardenError {
    ProtocolError::UnexpectedResponse {
        expected,
        actual: actual.kind(),
    }
    .into()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
