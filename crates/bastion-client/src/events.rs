//! Client Events
//!
//! Progress notifications from the orchestrator.

use bastion_protocol::SessionId;

use crate::phase::HandshakePhase;

/// Client events
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake moved to a new phase
    PhaseChanged {
        /// Phase entered
        phase: HandshakePhase,
    },

    /// Session established with the resource server
    SessionEstablished {
        /// Session identifier issued by the server
        session_id: SessionId,
    },

    /// Server no longer knows the session
    SessionExpired,

    /// Business call answered
    OperationCompleted {
        /// Operation name
        operation: &'static str,
    },

    /// Error occurred
    Error {
        /// Error message
        message: String,
    },
}

impl ClientEvent {
    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(self, ClientEvent::Error { .. } | ClientEvent::SessionExpired)
    }

    /// Get event name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::PhaseChanged { .. } => "PhaseChanged",
            ClientEvent::SessionEstablished { .. } => "SessionEstablished",
            ClientEvent::SessionExpired => "SessionExpired",
            ClientEvent::OperationCompleted { .. } => "OperationCompleted",
            ClientEvent::Error { .. } => "Error",
        }
    }
}

impl std::fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientEvent::PhaseChanged { phase } => write!(f, "Phase changed to {}", phase),
            ClientEvent::SessionEstablished { session_id } => {
                write!(f, "Session {} established", session_id)
            }
            ClientEvent::SessionExpired => write!(f, "Session expired"),
            ClientEvent::OperationCompleted { operation } => write!(f, "{} completed", operation),
            ClientEvent::Error { message } => write!(f, "Error: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_classification() {
        assert!(ClientEvent::SessionExpired.is_error());
        assert!(ClientEvent::Error { message: "x".into() }.is_error());
        assert!(!ClientEvent::PhaseChanged {
            phase: HandshakePhase::Challenged
        }
        .is_error());
    }

    #[test]
    fn test_event_display() {
        let event = ClientEvent::PhaseChanged {
            phase: HandshakePhase::KeyAgreed,
        };
        assert_eq!(event.to_string(), "Phase changed to key_agreed");
        assert_eq!(event.name(), "PhaseChanged");
    }
}
