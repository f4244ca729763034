//! Server Configuration
//!
//! Configuration types and defaults for the authority and resource servers.

use bastion_protocol::{
    AUTHORITY_PRINCIPAL, DEFAULT_CHALLENGE_TTL_SECS, DEFAULT_CLIENT_PRINCIPAL,
    DEFAULT_MAX_CLOCK_SKEW_SECS, DEFAULT_REPLAY_WINDOW_SECS, DEFAULT_SESSION_IDLE_TIMEOUT_SECS,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Which service this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    /// Ticket authority
    Authority,
    /// Bank front server
    Bank,
    /// Database server holding the ledger
    Database,
}

impl ServiceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceRole::Authority => "authority",
            ServiceRole::Bank => "bank",
            ServiceRole::Database => "database",
        }
    }

    /// Resource servers redeem tickets and bootstrap with the authority
    pub fn is_resource(self) -> bool {
        !matches!(self, ServiceRole::Authority)
    }
}

impl std::fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "authority" => Ok(ServiceRole::Authority),
            "bank" => Ok(ServiceRole::Bank),
            "database" => Ok(ServiceRole::Database),
            other => Err(ConfigError::InvalidValue(format!("unknown role '{other}'"))),
        }
    }
}

/// Account created in the ledger at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedAccount {
    pub holder: String,
    /// Plain password, hashed before it reaches the ledger
    pub password: String,
    pub balance: i64,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Service role
    pub role: ServiceRole,

    /// Principal name this service is known by
    pub name: String,

    /// Bind address
    pub bind_address: String,

    /// Bind port
    pub bind_port: u16,

    /// Maximum concurrent connections
    pub max_connections: usize,

    /// Directory for identity and key material
    pub data_dir: PathBuf,

    /// Authority address, required for resource roles
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority_address: Option<String>,

    /// Authority public key (PEM), required for resource roles
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority_public_key: Option<PathBuf>,

    /// Only principal allowed to redeem tickets here
    pub client_principal: String,

    /// Replay window in seconds
    pub replay_window_secs: u64,

    /// Allowed clock skew for future timestamps (seconds)
    pub max_clock_skew_secs: u64,

    /// Lifetime of challenges and half-finished exchanges (seconds)
    pub challenge_ttl_secs: u64,

    /// Idle timeout for established sessions (seconds)
    pub session_timeout_secs: u64,

    /// Lifetime of DH key material at the authority, 0 keeps it forever
    pub key_ttl_secs: u64,

    /// Principals the authority runs key exchange with
    pub counterparts: Vec<String>,

    /// Interval between expiry sweeps (seconds)
    pub sweep_interval_secs: u64,

    /// Log level
    pub log_level: String,

    /// Accounts created at startup
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<SeedAccount>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            role: ServiceRole::Authority,
            name: AUTHORITY_PRINCIPAL.to_string(),
            bind_address: "0.0.0.0".to_string(),
            bind_port: 7400,
            max_connections: 256,
            data_dir: PathBuf::from("bastion-data"),
            authority_address: None,
            authority_public_key: None,
            client_principal: DEFAULT_CLIENT_PRINCIPAL.to_string(),
            replay_window_secs: DEFAULT_REPLAY_WINDOW_SECS,
            max_clock_skew_secs: DEFAULT_MAX_CLOCK_SKEW_SECS,
            challenge_ttl_secs: DEFAULT_CHALLENGE_TTL_SECS,
            session_timeout_secs: DEFAULT_SESSION_IDLE_TIMEOUT_SECS,
            key_ttl_secs: 3600,
            counterparts: vec![
                ServiceRole::Bank.as_str().to_string(),
                ServiceRole::Database.as_str().to_string(),
            ],
            sweep_interval_secs: 30,
            log_level: "info".to_string(),
            accounts: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Get the bind socket address
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.bind_port)
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("bind address: {e}")))
    }

    pub fn replay_window(&self) -> Duration {
        Duration::from_secs(self.replay_window_secs)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Key material lifetime, `None` when unlimited
    pub fn key_ttl(&self) -> Option<Duration> {
        (self.key_ttl_secs > 0).then(|| Duration::from_secs(self.key_ttl_secs))
    }

    /// Identity directory under the data dir
    pub fn identity_dir(&self) -> PathBuf {
        self.data_dir.join("identity")
    }

    /// Per-peer DH key material directory under the data dir
    pub fn peers_dir(&self) -> PathBuf {
        self.data_dir.join("peers")
    }

    /// Long-term counterpart keys, never expired
    pub fn counterparts_dir(&self) -> PathBuf {
        self.data_dir.join("counterparts")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_port == 0 {
            return Err(ConfigError::InvalidValue("bind_port cannot be 0".into()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("max_connections cannot be 0".into()));
        }

        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue("name cannot be empty".into()));
        }

        if self.client_principal.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "client_principal cannot be empty".into(),
            ));
        }

        for (field, value) in [
            ("replay_window_secs", self.replay_window_secs),
            ("challenge_ttl_secs", self.challenge_ttl_secs),
            ("session_timeout_secs", self.session_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{field} cannot be 0")));
            }
        }

        if self.max_clock_skew_secs >= self.replay_window_secs {
            return Err(ConfigError::InvalidValue(
                "max_clock_skew_secs must be below replay_window_secs".into(),
            ));
        }

        if self.role == ServiceRole::Authority
            && self.counterparts.iter().any(|name| name.trim().is_empty())
        {
            return Err(ConfigError::InvalidValue(
                "counterparts cannot contain empty names".into(),
            ));
        }

        if self.role.is_resource() {
            if self.authority_address.is_none() {
                return Err(ConfigError::InvalidValue(format!(
                    "role {} requires authority_address",
                    self.role
                )));
            }
            if self.authority_public_key.is_none() {
                return Err(ConfigError::InvalidValue(format!(
                    "role {} requires authority_public_key",
                    self.role
                )));
            }
        }

        Ok(())
    }
}

/// Configuration builder
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set role; the name follows the role unless set explicitly afterwards
    pub fn role(mut self, role: ServiceRole) -> Self {
        self.config.role = role;
        self.config.name = role.as_str().to_string();
        self
    }

    /// Set principal name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set bind address
    pub fn bind_address(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_address = addr.into();
        self
    }

    /// Set bind port
    pub fn bind_port(mut self, port: u16) -> Self {
        self.config.bind_port = port;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set data directory
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    /// Set authority address and public key file
    pub fn authority(mut self, address: impl Into<String>, public_key: impl Into<PathBuf>) -> Self {
        self.config.authority_address = Some(address.into());
        self.config.authority_public_key = Some(public_key.into());
        self
    }

    /// Set client principal
    pub fn client_principal(mut self, principal: impl Into<String>) -> Self {
        self.config.client_principal = principal.into();
        self
    }

    /// Set replay window
    pub fn replay_window(mut self, secs: u64) -> Self {
        self.config.replay_window_secs = secs;
        self
    }

    /// Set challenge TTL
    pub fn challenge_ttl(mut self, secs: u64) -> Self {
        self.config.challenge_ttl_secs = secs;
        self
    }

    /// Set session timeout
    pub fn session_timeout(mut self, secs: u64) -> Self {
        self.config.session_timeout_secs = secs;
        self
    }

    /// Set the key exchange counterparts
    pub fn counterparts<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.counterparts = names.into_iter().map(Into::into).collect();
        self
    }

    /// Add a seed account
    pub fn account(mut self, holder: impl Into<String>, password: impl Into<String>, balance: i64) -> Self {
        self.config.accounts.push(SeedAccount {
            holder: holder.into(),
            password: password.into(),
            balance,
        });
        self
    }

    /// Set log level
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}
