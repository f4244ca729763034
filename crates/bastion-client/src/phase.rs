//! Handshake phases
//!
//! Each phase owns exactly the material the next step needs, so a step can
//! only run when its inputs exist.

use bastion_crypto::{RsaPublicKey, SessionCipher};
use bastion_protocol::{KeyMaterial, SessionId};

/// Phase names, for state queries and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Unauthenticated,
    KeyAgreed,
    TicketIssued,
    Challenged,
    Established,
}

impl HandshakePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            HandshakePhase::Unauthenticated => "unauthenticated",
            HandshakePhase::KeyAgreed => "key_agreed",
            HandshakePhase::TicketIssued => "ticket_issued",
            HandshakePhase::Challenged => "challenged",
            HandshakePhase::Established => "established",
        }
    }
}

impl std::fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client side of an established session
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub(crate) cipher: SessionCipher,
    pub(crate) server_key: RsaPublicKey,
    pub(crate) session_id: SessionId,
}

impl SessionContext {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn server_key(&self) -> &RsaPublicKey {
        &self.server_key
    }
}

pub(crate) enum Phase {
    Unauthenticated,
    KeyAgreed {
        authority: KeyMaterial,
    },
    TicketIssued {
        session: SessionCipher,
        nested_ticket: Vec<u8>,
    },
    Challenged {
        session: SessionCipher,
        server_key: RsaPublicKey,
        nonce: i64,
    },
    Established(SessionContext),
}

impl Phase {
    pub(crate) fn name(&self) -> HandshakePhase {
        match self {
            Phase::Unauthenticated => HandshakePhase::Unauthenticated,
            Phase::KeyAgreed { .. } => HandshakePhase::KeyAgreed,
            Phase::TicketIssued { .. } => HandshakePhase::TicketIssued,
            Phase::Challenged { .. } => HandshakePhase::Challenged,
            Phase::Established(_) => HandshakePhase::Established,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::Unauthenticated.name(), HandshakePhase::Unauthenticated);
        let agreed = Phase::KeyAgreed {
            authority: KeyMaterial::new("authority", [1; 32], [2; 16]),
        };
        assert_eq!(agreed.name(), HandshakePhase::KeyAgreed);
        assert_eq!(HandshakePhase::TicketIssued.to_string(), "ticket_issued");
    }
}
