//! # skein-client
//!
//! Connection coordinator for skein shard access. A client actor keeps, for
//! every shard it has ever touched, a connection object that buffers
//! outbound requests and correlates inbound responses, and moves that
//! connection through its lifecycle as the shard's backend moves:
//!
//! ```text
//! (lookup miss)          (resolved)            (backend lost)
//!      │                     │                       │
//!      ▼                     ▼                       ▼
//! Connecting ────────▶ Connected ────────▶ Reconnecting ──▶ Connected …
//!   buffers             transmits            buffers
//!                    window-bounded       retains in-flight
//! ```
//!
//! No entry is lost, duplicated, or reordered across a transition: the old
//! connection is frozen, its buffered entries replay onto the new one in
//! enqueue order, and a forwarder catches stragglers from producers still
//! holding the old instance.
//!
//! ## Features
//!
//! - **Lazy per-shard connections**: created on first lookup, resolved
//!   asynchronously through a pluggable [`BackendResolver`]
//! - **Optimistic concurrent lookups**: producer threads validate read
//!   stamps against the transition lock instead of contending on it
//! - **Reconnect with replay**: per-shard FIFO preserved across backend
//!   moves, with an application [`ClientStrategy`] hook to rewrite entries
//! - **Session fencing**: responses from a retired backend session are
//!   dropped on token mismatch
//! - **Backpressure**: bounded transmit window per backend plus a pending
//!   queue ceiling surfaced as a retriable failure
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use skein_client::{ClientConfig, ClientCoordinator, DefaultStrategy};
//! use skein_client::{ClientId, Request, RequestTarget};
//! use std::sync::Arc;
//!
//! let handle = ClientCoordinator::spawn(
//!     ClientId::new("member-1-frontend", 0),
//!     Arc::new(my_resolver),
//!     Box::new(DefaultStrategy),
//!     ClientConfig::default(),
//! );
//!
//! // Producer threads look up a shard connection and enqueue on it
//! let conn = handle.get_connection(7)?;
//! let response = conn.send_request(Request::new(target, 0, payload)).await?;
//! ```
//!
//! A lookup can fail with [`CycleDetected`] while a transition is in
//! flight; release any other stamps you hold, call
//! [`CycleDetected::await_resolution`], and retry from the top.

pub mod actor;
pub mod backend;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod lock;
pub mod resolver;

pub use actor::{ClientActorContext, Command, InternalCommand, Next};
pub use backend::BackendInfo;
pub use config::{ClientConfig, ClientConfigBuilder};
pub use connection::{
    ConnectionEntry, ConnectionKind, ForwardToConnection, ReconnectForwarder, ReplayState,
    ResponseCallback, ShardConnection,
};
pub use coordinator::{
    ClientCoordinator, ClientHandle, ClientStatsSnapshot, ClientStrategy, ConnectCohort,
    DefaultStrategy, ReplayCohort,
};
pub use lock::{CycleDetected, InversibleLock};
pub use resolver::{BackendResolver, ResolverError};

// Re-export the protocol types clients deal in
pub use skein_protocol::{
    ClientId, FailureEnvelope, LocalHistoryId, Request, RequestEnvelope, RequestError,
    RequestFailure, RequestTarget, Response, ResponseEnvelope, SuccessEnvelope, TransactionId,
};
