//! Backend lookup seam

use crate::backend::BackendInfo;
use async_trait::async_trait;
use skein_protocol::RequestError;
use thiserror::Error;

/// Why a backend lookup failed.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// The lookup did not complete in time. Retried by the coordinator at a
    /// fixed cadence for as long as the connection stays current.
    #[error("backend lookup timed out")]
    Timeout,

    /// The lookup failed with a recognized request failure; the shard's
    /// connection is poisoned with exactly this cause.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Anything else; wrapped into a runtime request failure before
    /// poisoning the shard.
    #[error("backend lookup failed: {0}")]
    Other(String),
}

/// Resolves which backend replica is authoritative for a shard.
///
/// Implementations are free to consult cluster metadata, gossip state, or a
/// naming service; the coordinator only cares that completions eventually
/// arrive. Both methods are invoked from the client actor and their results
/// are re-dispatched onto it, so implementations may block internally but
/// must be `Send + Sync`.
#[async_trait]
pub trait BackendResolver: Send + Sync + 'static {
    /// Look up the backend for a shard the client has never talked to.
    async fn get_backend(&self, cookie: u64) -> Result<BackendInfo, ResolverError>;

    /// Look up a replacement for a backend that stopped answering.
    ///
    /// `stale` is the descriptor the client was connected to; resolvers use
    /// it to avoid handing back the session that just died.
    async fn refresh_backend(
        &self,
        cookie: u64,
        stale: &BackendInfo,
    ) -> Result<BackendInfo, ResolverError>;
}
