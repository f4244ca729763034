//! Peer identities
//!
//! A peer is either a named principal (`authority`, `database`, `user`) or an
//! anonymous transport endpoint identified by a hash of its remote address.

use bastion_crypto::fingerprint;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Bytes of the address hash kept in an identity
const ADDRESS_ID_LEN: usize = 16;

/// Marks address-derived identities, keeping them apart from principal names
const ADDRESS_PREFIX: &str = "addr:";

/// Identity a key material slot or session belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Named principal
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Anonymous peer, keyed by a BLAKE3 hash of its transport address
    pub fn from_address(addr: &SocketAddr) -> Self {
        let digest = fingerprint(addr.to_string().as_bytes());
        Self(format!("{ADDRESS_PREFIX}{}", hex::encode(&digest[..ADDRESS_ID_LEN])))
    }

    /// Whether this identity was derived from a transport address
    pub fn is_address(&self) -> bool {
        self.0.starts_with(ADDRESS_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::named(s)
    }
}
