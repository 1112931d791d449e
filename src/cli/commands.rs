// Warden - CLI Command Handlers
//
// `serve` builds the policy and capability engines from the agent config
// and runs the UDS server until Ctrl-C. SIGHUP reloads the policy
// directory, as does the optional `policy.reload_interval_secs` timer.
// Every other command opens one `BrokerClient` connection, performs a
// single operation, and prints it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::capability::{
    parse_ttl, CapabilityFilter, CapabilityRequest, CapabilityState, MemoryCapabilityEngine,
};
use crate::client::BrokerClient;
use crate::config::{AgentConfig, ClientConfig, SecretToken};
use crate::context::Context;
use crate::error::WardenError;
use crate::gateway::UdsServer;
use crate::policy::RulePolicyEngine;
use crate::protocol::{AuthMethod, CapabilityStatus};

use super::{Cli, Commands, CredentialArgs};

/// Execute the parsed CLI command.
pub async fn execute(cli: Cli) -> Result<(), WardenError> {
    let Cli {
        config,
        socket,
        no_auth,
        command,
    } = cli;
    let overrides = Overrides {
        config: config.as_deref(),
        socket: socket.as_deref(),
        no_auth,
    };

    match command {
        Commands::Serve {
            policy_dir,
            max_connections,
            policy_reload_secs,
        } => {
            let mut agent = overrides.agent_config()?;
            if let Some(dir) = policy_dir {
                agent.policy.policy_dir = Some(dir);
            }
            if let Some(secs) = policy_reload_secs {
                agent.policy.reload_interval_secs = Some(secs);
            }
            if let Some(max) = max_connections {
                agent.server.max_connections = max;
            }
            cmd_serve(agent).await
        }
        Commands::Request {
            resource,
            permissions,
            ttl,
            max_uses,
            service,
            environment,
            namespace,
            purpose,
            credentials,
        } => {
            let mut ctx = Context::builder(service, environment);
            if let Some(ns) = namespace {
                ctx = ctx.namespace(ns);
            }
            let mut request = CapabilityRequest::new(resource, permissions, ctx.build());
            if let Some(ttl) = ttl {
                let ttl = parse_ttl(&ttl)
                    .filter(|d| d.num_seconds() > 0)
                    .ok_or_else(|| WardenError::Other(format!("Invalid TTL '{}'", ttl)))?;
                request = request.with_ttl_secs(ttl.num_seconds().unsigned_abs());
            }
            if let Some(max_uses) = max_uses {
                request = request.with_max_uses(max_uses);
            }
            if let Some(purpose) = purpose {
                request = request.with_purpose(purpose);
            }
            let client = overrides.client_config(&credentials)?;
            cmd_request(client, request).await
        }
        Commands::Validate {
            id,
            service,
            environment,
            credentials,
        } => {
            let context = service.map(|svc| Context::builder(svc, environment).build());
            cmd_validate(overrides.client_config(&credentials)?, id, context).await
        }
        Commands::Revoke {
            id,
            reason,
            credentials,
        } => cmd_revoke(overrides.client_config(&credentials)?, id, reason).await,
        Commands::List {
            resource,
            status,
            limit,
            credentials,
        } => {
            let status = status.map(|s| parse_state(&s)).transpose()?;
            let filter = CapabilityFilter {
                resource,
                status,
                limit,
                ..Default::default()
            };
            cmd_list(overrides.client_config(&credentials)?, filter).await
        }
        Commands::Status { credentials } => {
            cmd_status(overrides.client_config(&credentials)?).await
        }
        Commands::Ping => cmd_ping(overrides.client_config(&CredentialArgs::default())?).await,
        Commands::Config => cmd_config(overrides.agent_config()?),
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Global flags layered over whichever config file applies.
struct Overrides<'a> {
    config: Option<&'a Path>,
    socket: Option<&'a Path>,
    no_auth: bool,
}

impl Overrides<'_> {
    fn agent_config(&self) -> Result<AgentConfig, WardenError> {
        let mut agent = match self.config {
            Some(path) => AgentConfig::load(path)?,
            None => AgentConfig::default(),
        };
        if let Some(socket) = self.socket {
            agent.server.socket_path = socket.to_path_buf();
        }
        if self.no_auth {
            agent.server.auth_enabled = false;
        }
        Ok(agent)
    }

    fn client_config(&self, credentials: &CredentialArgs) -> Result<ClientConfig, WardenError> {
        let mut client = match self.config {
            Some(path) => ClientConfig::load(path)?,
            None => ClientConfig::default(),
        };
        if let Some(socket) = self.socket {
            client.socket_path = socket.to_path_buf();
        }
        if self.no_auth {
            client.auth_enabled = false;
        }
        if let Some(identity) = &credentials.identity {
            client.credentials.identity = identity.clone();
        }
        if let Some(token) = &credentials.token {
            client.credentials.method = AuthMethod::Token;
            client.credentials.token = Some(SecretToken::new(token.clone()));
        }
        client.validate()?;
        Ok(client)
    }
}

fn parse_state(value: &str) -> Result<CapabilityState, WardenError> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase())).map_err(|_| {
        WardenError::Other(format!(
            "Invalid status '{}'. Use 'active', 'revoked' or 'expired'.",
            value
        ))
    })
}

async fn connect(config: ClientConfig) -> Result<BrokerClient, WardenError> {
    let mut client = BrokerClient::new(config);
    client.connect().await?;
    Ok(client)
}

// ─── Serve ───────────────────────────────────────────────────────────────────

async fn cmd_serve(agent: AgentConfig) -> Result<(), WardenError> {
    agent.validate()?;

    let policy = Arc::new(RulePolicyEngine::from_config(&agent.policy)?);
    tracing::info!(
        policies = policy.len(),
        default_decision = %policy.default_decision(),
        "Policy engine ready"
    );
    let engine = MemoryCapabilityEngine::new(agent.engine.clone());

    let mut hangup = signal(SignalKind::hangup())?;
    let server = UdsServer::new(agent.server.clone(), policy.clone(), Arc::new(engine))
        .with_cleanup_interval(Duration::from_secs(agent.engine.cleanup_interval_secs));
    server.start().await?;

    let reload_shutdown = CancellationToken::new();
    let reload_task = agent.policy.reload_interval_secs.map(|secs| {
        tracing::info!(interval_secs = secs, "Periodic policy reload enabled");
        tokio::spawn(
            Arc::clone(&policy).reload_every(Duration::from_secs(secs), reload_shutdown.clone()),
        )
    });

    println!("✓ Warden listening on {}", server.socket_path().display());
    println!("  Press Ctrl-C to stop, send SIGHUP to reload policies.");

    let signal = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => break signal,
            _ = hangup.recv() => reload_policies(&policy),
        }
    };
    println!("Shutting down...");

    reload_shutdown.cancel();
    if let Some(task) = reload_task {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Policy reload task ended abnormally");
        }
    }
    server.stop().await?;
    signal?;

    Ok(())
}

fn reload_policies(policy: &RulePolicyEngine) {
    match policy.reload() {
        Ok(count) => tracing::info!(policies = count, "Policies reloaded on SIGHUP"),
        Err(e) => tracing::warn!(error = %e, "Policy reload failed; keeping current policies"),
    }
}

// ─── Capabilities ────────────────────────────────────────────────────────────

async fn cmd_request(config: ClientConfig, request: CapabilityRequest) -> Result<(), WardenError> {
    let mut client = connect(config).await?;
    let response = client.request_capability(request).await;
    client.close().await;
    let response = response?;

    match (response.status, &response.capability) {
        (CapabilityStatus::Granted, Some(cap)) => {
            println!("✓ Capability granted");
            println!("  ID:          {}", cap.id);
            println!("  Type:        {}", cap.capability_type);
            println!("  Resource:    {}", cap.resource);
            println!(
                "  Permissions: {}",
                cap.permissions.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            println!("  Identity:    {}", cap.identity);
            println!("  TTL:         {}s", cap.ttl_secs);
            println!("  Max uses:    {}", cap.max_uses);
            println!("  Expires:     {}", cap.expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        _ => {
            println!("✗ Capability denied");
            if let Some(reason) = &response.reason {
                println!("  Reason: {}", reason);
            }
            if let Some(rule) = &response.rule {
                println!("  Rule:   {}", rule);
            }
        }
    }

    Ok(())
}

async fn cmd_validate(
    config: ClientConfig,
    id: String,
    context: Option<Context>,
) -> Result<(), WardenError> {
    let mut client = connect(config).await?;
    let result = client.validate_capability(&id, context).await;
    client.close().await;
    let result = result?;

    if result.valid {
        println!("✓ Capability {} is valid", result.capability_id);
    } else {
        let reason = result
            .reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "invalid".to_string());
        println!("✗ Capability {} is not valid: {}", result.capability_id, reason);
        if let Some(message) = &result.message {
            println!("  {}", message);
        }
    }
    println!("  Expires:        {}", result.expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Remaining uses: {}", result.remaining_uses);
    if let Some(matches) = result.context_matches {
        println!("  Context match:  {}", matches);
    }

    Ok(())
}

async fn cmd_revoke(
    config: ClientConfig,
    id: String,
    reason: Option<String>,
) -> Result<(), WardenError> {
    let mut client = connect(config).await?;
    let response = client.revoke_capability(&id, reason.as_deref()).await;
    client.close().await;
    let response = response?;

    println!("✓ Capability {} revoked", response.capability_id);
    println!("  By:     {}", response.revocation.revoked_by);
    println!("  Reason: {}", response.revocation.reason);
    println!(
        "  At:     {}",
        response.revocation.revoked_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    Ok(())
}

async fn cmd_list(config: ClientConfig, filter: CapabilityFilter) -> Result<(), WardenError> {
    let mut client = connect(config).await?;
    let response = client.list_capabilities(filter).await;
    client.close().await;
    let response = response?;

    if response.capabilities.is_empty() {
        println!("No capabilities found.");
        return Ok(());
    }

    println!("Capabilities ({}):\n", response.count);
    for cap in &response.capabilities {
        println!("  {}", cap);
    }

    Ok(())
}

// ─── Diagnostics ─────────────────────────────────────────────────────────────

async fn cmd_status(config: ClientConfig) -> Result<(), WardenError> {
    let mut client = connect(config).await?;
    let status = client.get_status().await;
    client.close().await;
    let status = status?;

    println!("Warden broker status:\n");
    println!("  Version:       {}", status.version);
    println!("  Socket:        {}", status.socket_path);
    println!("  Connections:   {}/{}", status.connections, status.max_connections);
    println!("  Uptime:        {}s", status.uptime_secs);
    println!("  Connection ID: {}", status.connection_id);
    match &status.identity {
        Some(identity) if status.authenticated => println!("  Identity:      {}", identity),
        _ => println!("  Identity:      (unauthenticated)"),
    }
    for (key, value) in &status.metadata {
        println!("  {:<14} {}", format!("{}:", key), value);
    }

    Ok(())
}

async fn cmd_ping(config: ClientConfig) -> Result<(), WardenError> {
    let mut client = connect(config).await?;
    let pong = client.ping().await;
    client.close().await;
    let pong = pong?;

    println!("✓ {} ({})", pong.message, pong.timestamp.to_rfc3339());
    Ok(())
}

fn cmd_config(mut agent: AgentConfig) -> Result<(), WardenError> {
    for token in agent.server.auth_tokens.iter_mut() {
        *token = SecretToken::new("<redacted>");
    }
    let json = agent
        .to_json_pretty()
        .map_err(|e| WardenError::Other(format!("Failed to render config: {}", e)))?;
    println!("{}", json);
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
