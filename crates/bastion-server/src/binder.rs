//! Request identity binding
//!
//! Every inbound call is tagged with the identity of the peer that made it.
//! The identity is a BLAKE3 hash of the remote address and travels with the
//! call as a [`BindingGuard`]; the binder only counts what is in flight.

use bastion_protocol::{OperationKind, PeerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::trace;

#[derive(Default)]
pub struct RequestIdentityBinder {
    in_flight: Mutex<HashMap<OperationKind, usize>>,
}

impl RequestIdentityBinder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind the caller for `kind`; the call counts as in flight while the
    /// guard lives
    pub fn bind(self: &Arc<Self>, remote: &SocketAddr, kind: OperationKind) -> BindingGuard {
        let peer = PeerId::from_address(remote);
        *self.in_flight.lock().entry(kind).or_default() += 1;
        trace!("Bound {} call to peer {}", kind, peer.short());

        BindingGuard {
            binder: Arc::clone(self),
            kind,
            peer,
        }
    }

    /// Number of in-flight calls for `kind`
    pub fn pending(&self, kind: OperationKind) -> usize {
        self.in_flight.lock().get(&kind).copied().unwrap_or(0)
    }

    /// In-flight calls across all kinds
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().values().sum()
    }

    fn release(&self, kind: OperationKind) {
        let mut in_flight = self.in_flight.lock();
        if let Some(count) = in_flight.get_mut(&kind) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                in_flight.remove(&kind);
            }
        }
    }
}

/// Proof that a call is bound to a peer; dropping it unbinds the call
pub struct BindingGuard {
    binder: Arc<RequestIdentityBinder>,
    kind: OperationKind,
    peer: PeerId,
}

impl BindingGuard {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        self.binder.release(self.kind);
    }
}
