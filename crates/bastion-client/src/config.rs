//! Client Configuration
//!
//! Configuration types and defaults for the Bastion client.

use crate::errors::ClientError;
use bastion_protocol::{DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_CLIENT_PRINCIPAL};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Authority address (host:port)
    pub authority_address: String,

    /// Resource server address (host:port)
    pub resource_address: String,

    /// Principal the tickets are issued to
    pub principal: String,

    /// Resource server principal
    pub target: String,

    /// Per-call timeout in seconds
    pub call_timeout_secs: u64,

    /// Client RSA key (PKCS#8 PEM); a fresh key is generated when absent
    pub identity_key: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            authority_address: "127.0.0.1:7400".to_string(),
            resource_address: "127.0.0.1:7402".to_string(),
            principal: DEFAULT_CLIENT_PRINCIPAL.to_string(),
            target: "database".to_string(),
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            identity_key: None,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Resolve an address to a SocketAddr
    pub fn resolve(address: &str) -> Result<SocketAddr, ClientError> {
        address
            .to_socket_addrs()
            .map_err(|e| ClientError::Config(format!("cannot resolve {address}: {e}")))?
            .next()
            .ok_or_else(|| ClientError::Config(format!("no address for {address}")))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.authority_address.is_empty() {
            return Err(ClientError::Config("Authority address is required".into()));
        }

        if self.resource_address.is_empty() {
            return Err(ClientError::Config("Resource address is required".into()));
        }

        if self.principal.is_empty() || self.target.is_empty() {
            return Err(ClientError::Config(
                "Principal and target cannot be empty".into(),
            ));
        }

        if self.call_timeout_secs == 0 {
            return Err(ClientError::Config("Call timeout cannot be 0".into()));
        }

        Ok(())
    }
}

/// Configuration builder
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set authority address
    pub fn authority_address(mut self, addr: impl Into<String>) -> Self {
        self.config.authority_address = addr.into();
        self
    }

    /// Set resource server address
    pub fn resource_address(mut self, addr: impl Into<String>) -> Self {
        self.config.resource_address = addr.into();
        self
    }

    /// Set client principal
    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.config.principal = principal.into();
        self
    }

    /// Set target service
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.config.target = target.into();
        self
    }

    /// Set call timeout
    pub fn call_timeout(mut self, secs: u64) -> Self {
        self.config.call_timeout_secs = secs;
        self
    }

    /// Set identity key file
    pub fn identity_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.identity_key = Some(path.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<ClientConfig, ClientError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.principal, "user");
        assert_eq!(config.target, "database");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::builder()
            .authority_address("10.0.0.1:7400")
            .resource_address("10.0.0.2:7401")
            .target("bank")
            .call_timeout(5)
            .build()
            .unwrap();

        assert_eq!(config.resource_address, "10.0.0.2:7401");
        assert_eq!(config.target, "bank");
        assert_eq!(config.call_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_config() {
        assert!(ClientConfig::builder().call_timeout(0).build().is_err());
        assert!(ClientConfig::builder().target("").build().is_err());
        assert!(ClientConfig::builder().authority_address("").build().is_err());
    }

    #[test]
    fn test_resolve() {
        let addr = ClientConfig::resolve("127.0.0.1:7400").unwrap();
        assert_eq!(addr.port(), 7400);
        assert!(ClientConfig::resolve("not-an-address").is_err());
    }
}
