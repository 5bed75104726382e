//! Skein Access Protocol
//!
//! This crate defines the identifier model and message types shared between
//! skein clients and shard backends. It is deliberately transport-agnostic:
//! request and response payloads are opaque [`bytes::Bytes`] and the wire
//! codec lives with the transport, not here.
//!
//! # Addressing
//!
//! Client traffic is partitioned by a 64-bit *shard cookie*. Every message
//! carries a [`RequestTarget`] from which the cookie is derived:
//!
//! ```text
//! ClientId ──< LocalHistoryId ──< TransactionId
//!                   │
//!                   └── cookie: the shard this history is pinned to
//! ```
//!
//! # Sessions
//!
//! A connected client binds its transmissions to a backend *session token*.
//! Envelopes from a prior session fail token comparison on arrival and are
//! dropped, which is what makes retransmission after a backend move safe.
//!
//! # Example
//!
//! ```rust
//! use skein_protocol::{ClientId, LocalHistoryId, RequestTarget};
//!
//! let client = ClientId::new("member-1-frontend", 0);
//! let history = LocalHistoryId::new(client, 1, 7);
//! assert_eq!(RequestTarget::History(history).shard_cookie(), 7);
//! ```

mod envelope;
mod error;
mod ids;

pub use envelope::{
    FailureEnvelope, Request, RequestEnvelope, RequestFailure, Response, ResponseEnvelope,
    SuccessEnvelope,
};
pub use error::RequestError;
pub use ids::{ClientId, LocalHistoryId, RequestTarget, TransactionId};
