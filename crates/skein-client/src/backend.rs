//! Backend replica descriptor

use skein_protocol::RequestEnvelope;
use std::fmt;
use tokio::sync::mpsc;
use tracing::warn;

/// Descriptor of the backend replica currently authoritative for a shard.
///
/// Resolved by the [`BackendResolver`](crate::BackendResolver) and pinned
/// into a connected connection for the lifetime of that connection instance.
/// Identity is `(id, session_token)`: the same replica after a restart comes
/// back with a fresh session token and counts as a different backend.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    id: u64,
    session_token: u64,
    max_messages: usize,
    outbound: mpsc::UnboundedSender<RequestEnvelope>,
}

impl BackendInfo {
    /// Describe a backend session.
    ///
    /// `outbound` is the transport ingress for this session; whatever owns
    /// the socket consumes envelopes from the other end. `max_messages`
    /// bounds how many transmissions may be in flight at once.
    pub fn new(
        id: u64,
        session_token: u64,
        max_messages: usize,
        outbound: mpsc::UnboundedSender<RequestEnvelope>,
    ) -> Self {
        Self {
            id,
            session_token,
            max_messages,
            outbound,
        }
    }

    /// Backend replica id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Session token transmissions are bound to
    pub fn session_token(&self) -> u64 {
        self.session_token
    }

    /// Transmit window size
    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Hand an envelope to the transport. Returns false if the transport is
    /// gone; the caller keeps the entry buffered for replay.
    pub(crate) fn transmit(&self, envelope: RequestEnvelope) -> bool {
        if self.outbound.send(envelope).is_err() {
            warn!(backend = %self, "transport gone, keeping entry for replay");
            return false;
        }
        true
    }
}

impl PartialEq for BackendInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.session_token == other.session_token
    }
}

impl Eq for BackendInfo {}

impl fmt::Display for BackendInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend-{}/session-{}", self.id, self.session_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_id_and_session() {
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        let a = BackendInfo::new(1, 10, 32, tx_a.clone());
        let same = BackendInfo::new(1, 10, 64, tx_b);
        let restarted = BackendInfo::new(1, 11, 32, tx_a);

        assert_eq!(a, same);
        assert_ne!(a, restarted);
    }
}
