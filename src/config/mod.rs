// Warden - Configuration
//
// Server, client, and agent configuration loaded once at startup from
// JSON files. Every field has a default so partial files load; durations
// are whole seconds. `validate()` rejects configurations the server or
// client cannot honour.

mod error;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub use error::ConfigError;

use crate::capability::EngineConfig;
use crate::policy::PolicyConfig;
use crate::protocol::AuthMethod;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Ceiling for engine durations (TTL, retention): ten years.
pub const MAX_ENGINE_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Default socket path: `<config dir>/warden/agent.sock`.
/// Falls back to the temp directory when no config dir is known.
pub fn default_socket_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("warden")
        .join("agent.sock")
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

// ─── Secrets ─────────────────────────────────────────────────────────────────

/// A shared authentication token. Zeroed on drop and never printed.
#[derive(Clone)]
pub struct SecretToken(Zeroizing<String>);

impl SecretToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Zeroizing::new(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// Compare against a presented token via fixed-size digests.
    pub fn matches(&self, candidate: &str) -> bool {
        let ours = Sha256::digest(self.0.as_bytes());
        let theirs = Sha256::digest(candidate.as_bytes());
        ours.iter()
            .zip(theirs.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretToken(<redacted>)")
    }
}

impl Serialize for SecretToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for SecretToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

// ─── Shared Sections ─────────────────────────────────────────────────────────

/// Transport security settings. Local sockets rely on filesystem
/// permissions, so enabling TLS is rejected by `validate()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

impl TlsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled {
            return Err(ConfigError::invalid(
                "tls.enabled",
                "transport security is not supported on local sockets",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// `EnvFilter` directive for this crate.
    pub fn filter_directive(&self) -> String {
        if self.enabled {
            format!("warden={}", self.level)
        } else {
            "off".to_string()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.level.as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("unknown level '{}', expected one of {:?}", self.level, LOG_LEVELS),
            ));
        }
        Ok(())
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file after binding.
    pub socket_mode: u32,
    /// Must be set for `socket_mode` to grant access to other users.
    pub allow_world_access: bool,
    pub auth_enabled: bool,
    /// Read deadline while a connection is unauthenticated.
    pub auth_timeout_secs: u64,
    /// Read deadline once authenticated (or when auth is disabled).
    pub conn_timeout_secs: u64,
    /// Write deadline for each response.
    pub request_timeout_secs: u64,
    pub max_connections: usize,
    /// Tokens accepted by `token` authentication.
    pub auth_tokens: Vec<SecretToken>,
    pub tls: TlsConfig,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_mode: 0o600,
            allow_world_access: false,
            auth_enabled: true,
            auth_timeout_secs: 10,
            conn_timeout_secs: 300,
            request_timeout_secs: 30,
            max_connections: 100,
            auth_tokens: Vec::new(),
            tls: TlsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn conn_timeout(&self) -> Duration {
        Duration::from_secs(self.conn_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("socket_path", "must not be empty"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::invalid("max_connections", "must be at least 1"));
        }
        for (field, value) in [
            ("auth_timeout_secs", self.auth_timeout_secs),
            ("conn_timeout_secs", self.conn_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        if self.socket_mode & !0o777 != 0 {
            return Err(ConfigError::invalid(
                "socket_mode",
                format!("{:o} is not a permission mode", self.socket_mode),
            ));
        }
        if self.socket_mode & 0o007 != 0 && !self.allow_world_access {
            return Err(ConfigError::invalid(
                "socket_mode",
                format!(
                    "{:o} grants access to all local users; set allow_world_access to opt in",
                    self.socket_mode
                ),
            ));
        }
        self.tls.validate()?;
        self.logging.validate()
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthCredentials {
    pub identity: String,
    pub method: AuthMethod,
    pub token: Option<SecretToken>,
}

impl Default for AuthCredentials {
    fn default() -> Self {
        Self {
            identity: whoami(),
            method: AuthMethod::Peer,
            token: None,
        }
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "warden-client".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Perform the authentication handshake on connect.
    pub auth_enabled: bool,
    pub credentials: AuthCredentials,
    /// Fetch server status right after connecting and log it.
    pub fetch_status_on_connect: bool,
    pub tls: TlsConfig,
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
            auth_enabled: true,
            credentials: AuthCredentials::default(),
            fetch_status_on_connect: false,
            tls: TlsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("socket_path", "must not be empty"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::invalid("connect_timeout_secs", "must be greater than zero"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::invalid("request_timeout_secs", "must be greater than zero"));
        }
        if self.auth_enabled {
            if self.credentials.identity.trim().is_empty() {
                return Err(ConfigError::invalid("credentials.identity", "must not be empty"));
            }
            if self.credentials.method == AuthMethod::Token && self.credentials.token.is_none() {
                return Err(ConfigError::invalid(
                    "credentials.token",
                    "required for token authentication",
                ));
            }
        }
        self.tls.validate()?;
        self.logging.validate()
    }
}

// ─── Agent ───────────────────────────────────────────────────────────────────

/// Everything the `serve` command needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub policy: PolicyConfig,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;

        let engine = &self.engine;
        if engine.max_ttl_secs == 0 || engine.max_ttl_secs > MAX_ENGINE_DURATION_SECS {
            return Err(ConfigError::invalid(
                "engine.max_ttl_secs",
                format!("must be between 1 and {}", MAX_ENGINE_DURATION_SECS),
            ));
        }
        if engine.retention_secs > MAX_ENGINE_DURATION_SECS {
            return Err(ConfigError::invalid(
                "engine.retention_secs",
                format!("must not exceed {}", MAX_ENGINE_DURATION_SECS),
            ));
        }
        if engine.default_ttl_secs == 0 || engine.default_ttl_secs > engine.max_ttl_secs {
            return Err(ConfigError::invalid(
                "engine.default_ttl_secs",
                format!("must be between 1 and max_ttl_secs ({})", engine.max_ttl_secs),
            ));
        }
        if engine.max_uses == 0 {
            return Err(ConfigError::invalid("engine.max_uses", "must be at least 1"));
        }
        if engine.cleanup_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "engine.cleanup_interval_secs",
                "must be greater than zero",
            ));
        }
        if engine.issuer.trim().is_empty() {
            return Err(ConfigError::invalid("engine.issuer", "must not be empty"));
        }
        if self.policy.reload_interval_secs == Some(0) {
            return Err(ConfigError::invalid(
                "policy.reload_interval_secs",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
