//! Request failure causes

use crate::ids::ClientId;
use thiserror::Error;

/// The cause attached to a failed request.
///
/// These are the failures a request callback can observe, whether they came
/// back from a backend or were synthesized locally when a connection was
/// poisoned. They are `Clone` because poisoning a connection completes every
/// buffered entry with the same cause.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// This client's generation has been superseded by a newer frontend
    /// incarnation. Terminal for the whole client, not just one shard.
    #[error("client {client} has been superseded by a newer generation")]
    RetiredGeneration {
        /// The retired client identifier
        client: ClientId,
    },

    /// Generic runtime failure reported by the backend or the access layer
    #[error("request failed: {0}")]
    Runtime(String),

    /// The connection refused the entry because its pending queue is full
    #[error("connection queue for shard {cookie} is full")]
    QueueOverflow {
        /// Cookie of the overloaded shard
        cookie: u64,
    },
}

impl RequestError {
    /// Whether the caller may retry the request as-is.
    ///
    /// Only backpressure rejections are worth retrying; everything else is
    /// either terminal or needs the failure propagated to the originator.
    pub fn is_retriable(&self) -> bool {
        matches!(self, RequestError::QueueOverflow { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RequestError::RetiredGeneration {
            client: ClientId::new("member-1-frontend", 3),
        };
        assert_eq!(
            err.to_string(),
            "client member-1-frontend@3 has been superseded by a newer generation"
        );

        let err = RequestError::QueueOverflow { cookie: 7 };
        assert_eq!(err.to_string(), "connection queue for shard 7 is full");
    }

    #[test]
    fn test_only_overflow_is_retriable() {
        assert!(RequestError::QueueOverflow { cookie: 0 }.is_retriable());
        assert!(!RequestError::Runtime("boom".into()).is_retriable());
        assert!(!RequestError::RetiredGeneration {
            client: ClientId::new("f", 0)
        }
        .is_retriable());
    }
}
