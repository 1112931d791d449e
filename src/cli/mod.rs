// Warden - CLI Module
//
// Command-line interface using clap derive macros.
// Subcommands: serve, request, validate, revoke, list, status, ping, config.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{AgentConfig, ClientConfig, LoggingConfig};

pub use commands::execute;

/// Warden - local capability broker for co-located services.
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// JSON configuration file (agent config for `serve`, client config otherwise).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Socket path; overrides the configuration file.
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    /// Disable the authentication handshake.
    #[arg(long, global = true, default_value = "false")]
    pub no_auth: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the broker daemon until interrupted.
    Serve {
        /// Directory of JSON policy documents.
        #[arg(long)]
        policy_dir: Option<PathBuf>,

        /// Maximum number of concurrent connections.
        #[arg(long)]
        max_connections: Option<usize>,

        /// Reload the policy directory every N seconds.
        #[arg(long)]
        policy_reload_secs: Option<u64>,
    },

    /// Request a capability for a resource.
    Request {
        /// The resource descriptor (e.g., "db:orders").
        resource: String,

        /// Comma-separated permissions (e.g., "read,write").
        #[arg(long, value_delimiter = ',', required = true)]
        permissions: Vec<String>,

        /// Requested lifetime (e.g., "90s", "5m", "1h").
        #[arg(long)]
        ttl: Option<String>,

        /// Maximum number of successful validations.
        #[arg(long)]
        max_uses: Option<u32>,

        #[arg(long, default_value = "default")]
        service: String,

        #[arg(long, default_value = "development")]
        environment: String,

        #[arg(long)]
        namespace: Option<String>,

        /// Free-form description of why the capability is needed.
        #[arg(long)]
        purpose: Option<String>,

        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Validate a capability by ID.
    Validate {
        id: String,

        /// Service of the caller's context, compared against the grant.
        #[arg(long)]
        service: Option<String>,

        #[arg(long, default_value = "development")]
        environment: String,

        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Revoke a capability by ID.
    Revoke {
        id: String,

        #[arg(long)]
        reason: Option<String>,

        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// List capabilities held by the authenticated identity.
    List {
        /// Resource or `*` pattern.
        #[arg(long)]
        resource: Option<String>,

        /// One of: active, revoked, expired.
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Show broker status.
    Status {
        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Check that the broker is reachable.
    Ping,

    /// Print the effective agent configuration as JSON.
    Config,
}

/// Client credentials that override the configuration file.
#[derive(clap::Args, Debug, Default, Clone)]
pub struct CredentialArgs {
    /// Identity to authenticate as.
    #[arg(long)]
    pub identity: Option<String>,

    /// Shared token; switches the handshake to token authentication.
    /// Prefer the config file to keep it out of shell history.
    #[arg(long)]
    pub token: Option<String>,
}

impl Cli {
    /// Logging settings from the configuration file, or defaults when the
    /// file is absent or unreadable. Load errors surface later in `execute`.
    pub fn logging(&self) -> LoggingConfig {
        let Some(path) = self.config.as_deref() else {
            return LoggingConfig::default();
        };
        match self.command {
            Commands::Serve { .. } | Commands::Config => AgentConfig::load(path)
                .map(|c| c.server.logging)
                .unwrap_or_default(),
            _ => ClientConfig::load(path)
                .map(|c| c.logging)
                .unwrap_or_default(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
