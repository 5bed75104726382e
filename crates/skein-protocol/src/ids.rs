//! Identifier model for client, history, and transaction addressing

use serde::{Deserialize, Serialize};
use std::fmt;

/// A frontend client instance at a particular generation.
///
/// Generations are monotonic: when a frontend restarts and re-registers, it
/// comes back with a higher generation, and the backends retire the old one.
/// Two `ClientId`s with the same frontend but different generations are
/// different clients as far as the access layer is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId {
    frontend: String,
    generation: u64,
}

impl ClientId {
    /// Create a new client identifier
    pub fn new(frontend: impl Into<String>, generation: u64) -> Self {
        Self {
            frontend: frontend.into(),
            generation,
        }
    }

    /// Frontend instance name
    pub fn frontend(&self) -> &str {
        &self.frontend
    }

    /// Client generation
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.frontend, self.generation)
    }
}

/// A local transaction history owned by a client, pinned to a shard.
///
/// The cookie identifies the shard all transactions in this history are
/// routed to. It is assigned when the history is created and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalHistoryId {
    client: ClientId,
    history: u64,
    cookie: u64,
}

impl LocalHistoryId {
    /// Create a new history identifier
    pub fn new(client: ClientId, history: u64, cookie: u64) -> Self {
        Self {
            client,
            history,
            cookie,
        }
    }

    /// Owning client
    pub fn client(&self) -> &ClientId {
        &self.client
    }

    /// History number within the client
    pub fn history(&self) -> u64 {
        self.history
    }

    /// Shard cookie this history is pinned to
    pub fn cookie(&self) -> u64 {
        self.cookie
    }
}

impl fmt::Display for LocalHistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:h{}:s{}", self.client, self.history, self.cookie)
    }
}

/// One transaction within a local history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    history: LocalHistoryId,
    transaction: u64,
}

impl TransactionId {
    /// Create a new transaction identifier
    pub fn new(history: LocalHistoryId, transaction: u64) -> Self {
        Self {
            history,
            transaction,
        }
    }

    /// Owning history
    pub fn history(&self) -> &LocalHistoryId {
        &self.history
    }

    /// Transaction number within the history
    pub fn transaction(&self) -> u64 {
        self.transaction
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:t{}", self.history, self.transaction)
    }
}

/// The addressee of a request or response message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestTarget {
    /// A bare client, used only on the control path
    Client(ClientId),
    /// A local history on some shard
    History(LocalHistoryId),
    /// A transaction within a history
    Transaction(TransactionId),
}

impl RequestTarget {
    /// The shard cookie this target routes to.
    ///
    /// # Panics
    ///
    /// Panics for [`RequestTarget::Client`]: requests on the shard path are
    /// always addressed to a history or a transaction, so hitting a client
    /// target here is a routing bug in the caller.
    pub fn shard_cookie(&self) -> u64 {
        match self {
            RequestTarget::History(id) => id.cookie(),
            RequestTarget::Transaction(id) => id.history().cookie(),
            RequestTarget::Client(id) => {
                panic!("client target {id} has no shard cookie")
            }
        }
    }
}

impl fmt::Display for RequestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestTarget::Client(id) => write!(f, "{id}"),
            RequestTarget::History(id) => write!(f, "{id}"),
            RequestTarget::Transaction(id) => write!(f, "{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> LocalHistoryId {
        LocalHistoryId::new(ClientId::new("member-1-frontend", 2), 4, 7)
    }

    #[test]
    fn test_history_cookie_extraction() {
        let target = RequestTarget::History(history());
        assert_eq!(target.shard_cookie(), 7);
    }

    #[test]
    fn test_transaction_cookie_extraction() {
        let target = RequestTarget::Transaction(TransactionId::new(history(), 9));
        assert_eq!(target.shard_cookie(), 7);
    }

    #[test]
    #[should_panic(expected = "has no shard cookie")]
    fn test_client_target_has_no_cookie() {
        RequestTarget::Client(ClientId::new("member-1-frontend", 2)).shard_cookie();
    }

    #[test]
    fn test_display_round_trip_structure() {
        let txn = TransactionId::new(history(), 9);
        assert_eq!(txn.to_string(), "member-1-frontend@2:h4:s7:t9");
    }

    #[test]
    fn test_generations_are_distinct_clients() {
        let old = ClientId::new("member-1-frontend", 2);
        let new = ClientId::new("member-1-frontend", 3);
        assert_ne!(old, new);
        assert!(old < new);
    }

    #[test]
    fn test_identifier_serde() {
        let target = RequestTarget::Transaction(TransactionId::new(history(), 1));
        let json = serde_json::to_string(&target).unwrap();
        let back: RequestTarget = serde_json::from_str(&json).unwrap();
        assert_eq!(target, back);
    }
}
