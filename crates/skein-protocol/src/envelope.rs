//! Request/response messages and their transmit envelopes
//!
//! A [`Request`] is what a producer hands to its shard connection; the
//! connection wraps it in a [`RequestEnvelope`] when it actually transmits,
//! stamping the backend session token and a per-connection transmit sequence.
//! Responses come back in [`SuccessEnvelope`] / [`FailureEnvelope`] carrying
//! the same pair, which is what the connection correlates on.

use crate::error::RequestError;
use crate::ids::RequestTarget;
use bytes::Bytes;

/// A request addressed to a shard.
///
/// `sequence` is assigned by the producer and is end-to-end: it survives
/// retransmission across backend moves. The payload is opaque to the access
/// layer; the codec lives with the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Addressee of the request
    pub target: RequestTarget,
    /// Producer-assigned request sequence
    pub sequence: u64,
    /// Opaque request body
    pub payload: Bytes,
}

impl Request {
    /// Create a new request
    pub fn new(target: RequestTarget, sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            target,
            sequence,
            payload: payload.into(),
        }
    }
}

/// A successful reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Addressee the original request carried
    pub target: RequestTarget,
    /// Sequence of the request this answers
    pub sequence: u64,
    /// Opaque response body
    pub payload: Bytes,
}

/// A failed reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFailure {
    /// Addressee the original request carried
    pub target: RequestTarget,
    /// Sequence of the request this answers
    pub sequence: u64,
    /// Why the request failed
    pub cause: RequestError,
}

/// An outbound request bound to one backend session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Session the transmission is bound to
    pub session_token: u64,
    /// Per-connection transmit sequence
    pub tx_sequence: u64,
    /// The request being transmitted
    pub message: Request,
}

/// An inbound successful reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessEnvelope {
    /// Session the backend answered on
    pub session_token: u64,
    /// Transmit sequence of the request this answers
    pub tx_sequence: u64,
    /// The reply
    pub message: Response,
}

/// An inbound failed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEnvelope {
    /// Session the backend answered on
    pub session_token: u64,
    /// Transmit sequence of the request this answers
    pub tx_sequence: u64,
    /// The failure
    pub message: RequestFailure,
}

/// Either inbound envelope kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEnvelope {
    /// Successful reply
    Success(SuccessEnvelope),
    /// Failed reply
    Failure(FailureEnvelope),
}

impl ResponseEnvelope {
    /// Session token the backend answered on
    pub fn session_token(&self) -> u64 {
        match self {
            ResponseEnvelope::Success(env) => env.session_token,
            ResponseEnvelope::Failure(env) => env.session_token,
        }
    }

    /// Transmit sequence of the request this answers
    pub fn tx_sequence(&self) -> u64 {
        match self {
            ResponseEnvelope::Success(env) => env.tx_sequence,
            ResponseEnvelope::Failure(env) => env.tx_sequence,
        }
    }

    /// Addressee of the answered request
    pub fn target(&self) -> &RequestTarget {
        match self {
            ResponseEnvelope::Success(env) => &env.message.target,
            ResponseEnvelope::Failure(env) => &env.message.target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ClientId, LocalHistoryId};

    fn target(cookie: u64) -> RequestTarget {
        RequestTarget::History(LocalHistoryId::new(
            ClientId::new("member-1-frontend", 0),
            1,
            cookie,
        ))
    }

    #[test]
    fn test_envelope_accessors() {
        let success = ResponseEnvelope::Success(SuccessEnvelope {
            session_token: 3,
            tx_sequence: 11,
            message: Response {
                target: target(7),
                sequence: 0,
                payload: Bytes::new(),
            },
        });
        assert_eq!(success.session_token(), 3);
        assert_eq!(success.tx_sequence(), 11);
        assert_eq!(success.target().shard_cookie(), 7);

        let failure = ResponseEnvelope::Failure(FailureEnvelope {
            session_token: 3,
            tx_sequence: 12,
            message: RequestFailure {
                target: target(7),
                sequence: 1,
                cause: RequestError::Runtime("no such chain".into()),
            },
        });
        assert_eq!(failure.tx_sequence(), 12);
        assert_eq!(failure.target().shard_cookie(), 7);
    }
}
