//! The connection coordinator
//!
//! [`ClientCoordinator`] owns the shard→connection map and drives every
//! lifecycle transition on the actor task. Producers reach it through a
//! cloneable [`ClientHandle`], whose only concurrent touch-points are
//! [`ClientHandle::get_connection`] and the returned connection's enqueue
//! path; everything else is funneled through the mailbox.
//!
//! The map is a concurrent map so lookups stay cheap, but transitions are
//! multi-step, so the map is additionally guarded by an [`InversibleLock`]:
//! the actor takes its write side for the duration of a transition, and
//! producers validate optimistic read stamps around their lookups. A
//! producer that gets [`CycleDetected`] must unwind, await resolution, and
//! retry from its outermost entry point.

use crate::actor::{self, ClientActorContext, Command, Next};
use crate::backend::BackendInfo;
use crate::config::ClientConfig;
use crate::connection::{
    ConnectionEntry, ConnectionKind, ForwardToConnection, ReconnectForwarder, ShardConnection,
};
use crate::lock::{CycleDetected, InversibleLock};
use crate::resolver::{BackendResolver, ResolverError};
use dashmap::DashMap;
use skein_protocol::{ClientId, RequestError, ResponseEnvelope};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Application hooks the coordinator calls out to.
///
/// This is the seam a concrete datastore client plugs its higher-level state
/// into: transaction chains, history generations, whatever must be adjusted
/// before traffic flows to a new backend. Clients with none of that use
/// [`DefaultStrategy`].
pub trait ClientStrategy: Send + 'static {
    /// Handle an application command the coordinator does not recognize.
    fn on_command(&mut self, client: &ClientHandle, command: Box<dyn Any + Send>) -> Next;

    /// A new connected connection is about to replace the current one.
    ///
    /// Runs under the connection map's write lock so that preparation is
    /// atomic with publication, and therefore must not block. The returned
    /// cohort finishes the transition by replaying the old connection's
    /// entries.
    fn connection_up(&mut self, new_connection: &Arc<ShardConnection>) -> Box<dyn ConnectCohort>;

    /// The client is terminally failed. Flush whatever state needs flushing;
    /// no further activity happens after this returns. Invoked at most once.
    fn halt_client(&mut self, cause: &RequestError);
}

/// One reconnect transition's worth of application participation.
pub trait ConnectCohort {
    /// Replay `entries` onto the new connection.
    ///
    /// The cohort may rewrite each entry (session tokens embedded in
    /// request payloads, for instance) but must preserve their relative
    /// order. The returned forwarder receives entries that land on the old
    /// connection after the freeze; it should apply the same rewrite.
    fn finish_reconnect(self: Box<Self>, entries: Vec<ConnectionEntry>)
        -> Box<dyn ReconnectForwarder>;
}

/// Stock cohort: replays entries unchanged and forwards stragglers the same
/// way.
pub struct ReplayCohort {
    successor: Arc<ShardConnection>,
}

impl ReplayCohort {
    /// Replay onto `successor`
    pub fn new(successor: Arc<ShardConnection>) -> Self {
        Self { successor }
    }
}

impl ConnectCohort for ReplayCohort {
    fn finish_reconnect(
        self: Box<Self>,
        entries: Vec<ConnectionEntry>,
    ) -> Box<dyn ReconnectForwarder> {
        for entry in entries {
            self.successor.enqueue_replayed(entry);
        }
        Box::new(ForwardToConnection::new(self.successor))
    }
}

/// Strategy for clients with no higher-level state to adjust on reconnect.
#[derive(Debug, Default)]
pub struct DefaultStrategy;

impl ClientStrategy for DefaultStrategy {
    fn on_command(&mut self, _client: &ClientHandle, _command: Box<dyn Any + Send>) -> Next {
        debug!("ignoring unrecognized application command");
        Next::Continue
    }

    fn connection_up(&mut self, new_connection: &Arc<ShardConnection>) -> Box<dyn ConnectCohort> {
        Box::new(ReplayCohort::new(Arc::clone(new_connection)))
    }

    fn halt_client(&mut self, cause: &RequestError) {
        warn!(%cause, "client halted");
    }
}

/// Counters shared between the coordinator and its connections.
#[derive(Debug, Default)]
pub(crate) struct ClientStats {
    pub(crate) requests_enqueued: AtomicU64,
    pub(crate) responses_matched: AtomicU64,
    pub(crate) unknown_responses: AtomicU64,
    pub(crate) reconnects: AtomicU64,
    pub(crate) poisoned_connections: AtomicU64,
}

impl ClientStats {
    fn snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            requests_enqueued: self.requests_enqueued.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            unknown_responses: self.unknown_responses.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            poisoned_connections: self.poisoned_connections.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of client counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStatsSnapshot {
    /// Entries accepted from producers
    pub requests_enqueued: u64,
    /// Responses matched to an in-flight entry
    pub responses_matched: u64,
    /// Responses dropped for an unknown cookie, session, or sequence
    pub unknown_responses: u64,
    /// Completed connection transitions
    pub reconnects: u64,
    /// Connections terminally poisoned
    pub poisoned_connections: u64,
}

/// State shared between the actor task and producer threads.
pub(crate) struct CoordinatorCore {
    context: ClientActorContext,
    config: ClientConfig,
    resolver: Arc<dyn BackendResolver>,
    connections: DashMap<u64, Arc<ShardConnection>>,
    connections_lock: InversibleLock,
    stats: Arc<ClientStats>,
}

impl CoordinatorCore {
    fn get_connection(&self, cookie: u64) -> Result<Arc<ShardConnection>, CycleDetected> {
        loop {
            let stamp = self.connections_lock.optimistic_read()?;
            let conn = match self.connections.get(&cookie) {
                Some(conn) => Arc::clone(conn.value()),
                None => Arc::clone(
                    self.connections
                        .entry(cookie)
                        .or_insert_with(|| self.create_connection(cookie))
                        .value(),
                ),
            };
            if self.connections_lock.validate(stamp) {
                return Ok(conn);
            }
            // A transition ran in between; the map may now hold a different
            // instance for this cookie.
        }
    }

    /// Build a fresh connecting connection and schedule its resolution.
    ///
    /// Runs on whichever producer thread lost the race to the map entry;
    /// that is fine because creation publishes nothing beyond the entry
    /// itself and resolution is bounced through the actor.
    fn create_connection(&self, cookie: u64) -> Arc<ShardConnection> {
        debug!(
            client = %self.context.persistence_id(),
            cookie,
            "creating connection"
        );
        let conn = ShardConnection::connecting(
            self.context.clone(),
            cookie,
            self.config.pending_queue_ceiling,
            Arc::clone(&self.stats),
        );
        let resolve = Arc::clone(&conn);
        self.context.execute_in_actor(move |coordinator| {
            coordinator.resolve_connection(resolve);
            Next::Continue
        });
        conn
    }
}

/// Producer-facing handle onto a spawned client.
#[derive(Clone)]
pub struct ClientHandle {
    core: Arc<CoordinatorCore>,
}

impl ClientHandle {
    /// The identity of this client
    pub fn client_id(&self) -> &ClientId {
        self.core.context.client_id()
    }

    /// Stable string identity used as the logging context
    pub fn persistence_id(&self) -> &str {
        self.core.context.persistence_id()
    }

    /// Get (or lazily create) the connection for a shard.
    ///
    /// # Errors
    ///
    /// [`CycleDetected`] when a connection transition is in progress and
    /// this caller holds other read stamps the transition may be waiting
    /// out. Release everything, [`CycleDetected::await_resolution`], retry.
    pub fn get_connection(&self, cookie: u64) -> Result<Arc<ShardConnection>, CycleDetected> {
        self.core.get_connection(cookie)
    }

    /// Feed an inbound envelope from the transport into the client.
    /// Returns false once the client has stopped.
    pub fn deliver(&self, envelope: ResponseEnvelope) -> bool {
        self.core.context.send(Command::Envelope(envelope))
    }

    /// Send an application command to the client strategy.
    /// Returns false once the client has stopped.
    pub fn send_command<C: Any + Send>(&self, command: C) -> bool {
        self.core.context.send(Command::Application(Box::new(command)))
    }

    /// Run a trusted callable on the actor task.
    ///
    /// This is the integration seam for transport watchers: a disconnect
    /// handler uses it to call [`ClientCoordinator::reconnect_connection`].
    pub fn execute_in_actor(
        &self,
        f: impl FnOnce(&mut ClientCoordinator) -> Next + Send + 'static,
    ) {
        self.core.context.execute_in_actor(f);
    }

    /// Poison every connection and stop the client.
    pub fn shutdown(&self) {
        self.core.context.execute_in_actor(|coordinator| {
            coordinator.poison_all(&RequestError::Runtime("client shut down".into()));
            Next::Stop
        });
    }

    /// Wait until the client actor has stopped.
    pub async fn closed(&self) {
        self.core.context.closed().await;
    }

    /// Current counter values
    pub fn stats(&self) -> ClientStatsSnapshot {
        self.core.stats.snapshot()
    }
}

/// The actor-hosted coordinator.
///
/// All methods taking `&mut self` run on the actor task only; they are
/// reached through [`ClientHandle::execute_in_actor`] or internally.
pub struct ClientCoordinator {
    core: Arc<CoordinatorCore>,
    strategy: Box<dyn ClientStrategy>,
    halted: bool,
}

impl ClientCoordinator {
    /// Spawn a client actor and return the producer handle.
    pub fn spawn(
        client_id: ClientId,
        resolver: Arc<dyn BackendResolver>,
        strategy: Box<dyn ClientStrategy>,
        config: ClientConfig,
    ) -> ClientHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let context = ClientActorContext::new(client_id, command_tx);
        let core = Arc::new(CoordinatorCore {
            context,
            config,
            resolver,
            connections: DashMap::new(),
            connections_lock: InversibleLock::new(),
            stats: Arc::new(ClientStats::default()),
        });
        let coordinator = ClientCoordinator {
            core: Arc::clone(&core),
            strategy,
            halted: false,
        };
        tokio::spawn(actor::run(coordinator, command_rx));
        ClientHandle { core }
    }

    pub(crate) fn persistence_id(&self) -> &str {
        self.core.context.persistence_id()
    }

    fn handle(&self) -> ClientHandle {
        ClientHandle {
            core: Arc::clone(&self.core),
        }
    }

    pub(crate) fn on_receive_command(&mut self, command: Command) -> Next {
        match command {
            Command::Internal(f) => f(self),
            Command::Envelope(envelope) => self.on_response_envelope(envelope),
            Command::Application(command) => {
                let handle = self.handle();
                self.strategy.on_command(&handle, command)
            }
        }
    }

    fn on_response_envelope(&mut self, envelope: ResponseEnvelope) -> Next {
        if let ResponseEnvelope::Failure(failure) = &envelope {
            if let RequestError::RetiredGeneration { .. } = &failure.message.cause {
                let cause = failure.message.cause.clone();
                error!(
                    client = %self.persistence_id(),
                    %cause,
                    "this generation has been superseded"
                );
                self.halt(&cause);
                return Next::Stop;
            }
        }
        self.deliver_response(envelope);
        Next::Continue
    }

    /// Route an envelope to its connection by shard cookie.
    fn deliver_response(&self, envelope: ResponseEnvelope) {
        let cookie = envelope.target().shard_cookie();
        match self.core.connections.get(&cookie) {
            Some(conn) => conn.value().receive_response(envelope),
            None => {
                info!(
                    client = %self.persistence_id(),
                    cookie,
                    "ignoring response for unknown connection"
                );
                self.core
                    .stats
                    .unknown_responses
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn halt(&mut self, cause: &RequestError) {
        if !self.halted {
            self.halted = true;
            self.strategy.halt_client(cause);
        }
        self.poison_all(cause);
    }

    /// Poison every connection and clear the map. Idempotent.
    pub fn poison_all(&self, cause: &RequestError) {
        let stamp = self.core.connections_lock.write_lock();
        for conn in self.core.connections.iter() {
            conn.value().poison(cause.clone());
        }
        self.core.connections.clear();
        self.core.connections_lock.unlock_write(stamp);
    }

    /// Drop `conn` from the map if it is still the published instance.
    /// No-op otherwise; a transition may already have replaced it.
    pub fn remove_connection(&self, conn: &Arc<ShardConnection>) {
        let removed = self
            .core
            .connections
            .remove_if(&conn.cookie(), |_, current| Arc::ptr_eq(current, conn));
        if removed.is_some() {
            debug!(
                client = %self.persistence_id(),
                cookie = conn.cookie(),
                "removed connection"
            );
        }
    }

    /// React to a lost backend: swap the connected connection for a
    /// reconnecting one (keeping its buffered entries, in order) and kick
    /// off a backend refresh.
    pub fn reconnect_connection(&mut self, old: &Arc<ShardConnection>) {
        let ConnectionKind::Connected(backend) = old.kind() else {
            warn!(
                client = %self.persistence_id(),
                cookie = old.cookie(),
                "ignoring reconnect request for a connection that is not connected"
            );
            return;
        };
        let backend = backend.clone();
        let cookie = old.cookie();
        info!(
            client = %self.persistence_id(),
            cookie,
            backend = %backend,
            "lost backend, reconnecting"
        );

        let stamp = self.core.connections_lock.write_lock();
        let new_conn = ShardConnection::reconnecting(
            old.context().clone(),
            cookie,
            backend.clone(),
            self.core.config.pending_queue_ceiling,
            Arc::clone(&self.core.stats),
        );
        let mut replay = old.start_replay();
        for entry in replay.take_entries() {
            new_conn.enqueue_replayed(entry);
        }
        old.finish_replay(replay, Box::new(ForwardToConnection::new(Arc::clone(&new_conn))));
        self.publish_connection(cookie, old, &new_conn);
        self.core.connections_lock.unlock_write(stamp);

        let resolver = Arc::clone(&self.core.resolver);
        let context = self.core.context.clone();
        tokio::spawn(async move {
            let result = resolver.refresh_backend(cookie, &backend).await;
            context.execute_in_actor(move |coordinator| {
                coordinator.backend_connect_finished(new_conn, result);
                Next::Continue
            });
        });
    }

    /// Fire the resolver for a connection and bounce the completion back
    /// onto the actor.
    pub(crate) fn resolve_connection(&mut self, conn: Arc<ShardConnection>) {
        let cookie = conn.cookie();
        debug!(client = %self.persistence_id(), cookie, "resolving backend");
        let resolver = Arc::clone(&self.core.resolver);
        let context = self.core.context.clone();
        tokio::spawn(async move {
            let result = resolver.get_backend(cookie).await;
            context.execute_in_actor(move |coordinator| {
                coordinator.backend_connect_finished(conn, result);
                Next::Continue
            });
        });
    }

    /// A delayed resolve retry; quits silently when the connection it was
    /// scheduled for is no longer the published one.
    fn retry_resolve(&mut self, conn: Arc<ShardConnection>) {
        if !self.is_current(conn.cookie(), &conn) {
            info!(
                client = %self.persistence_id(),
                cookie = conn.cookie(),
                "skipping resolve retry for superseded connection"
            );
            return;
        }
        self.resolve_connection(conn);
    }

    fn is_current(&self, cookie: u64, conn: &Arc<ShardConnection>) -> bool {
        self.core
            .connections
            .get(&cookie)
            .is_some_and(|current| Arc::ptr_eq(current.value(), conn))
    }

    pub(crate) fn backend_connect_finished(
        &mut self,
        conn: Arc<ShardConnection>,
        result: Result<BackendInfo, ResolverError>,
    ) {
        let cookie = conn.cookie();
        match result {
            Err(ResolverError::Timeout) => {
                if !self.is_current(cookie, &conn) {
                    // The connection removes itself when it gives up; once
                    // that happened there is no point in retrying.
                    info!(
                        client = %self.persistence_id(),
                        cookie,
                        "stopping resolution of superseded connection"
                    );
                    return;
                }
                let delay = self.core.config.resolve_retry_delay;
                debug!(
                    client = %self.persistence_id(),
                    cookie,
                    ?delay,
                    "backend lookup timed out, scheduling retry"
                );
                self.core.context.execute_in_actor_after(delay, move |coordinator| {
                    coordinator.retry_resolve(conn);
                    Next::Continue
                });
            }
            Err(ResolverError::Request(cause)) => {
                error!(client = %self.persistence_id(), cookie, %cause, "failed to resolve shard");
                conn.poison(cause);
            }
            Err(ResolverError::Other(message)) => {
                error!(client = %self.persistence_id(), cookie, message, "failed to resolve shard");
                conn.poison(RequestError::Runtime(format!(
                    "failed to resolve shard {cookie}: {message}"
                )));
            }
            Ok(backend) => self.finish_connect(conn, backend),
        }
    }

    /// The reconnect transition: freeze the old connection, let the
    /// strategy prepare, replay, install the forwarder, publish.
    fn finish_connect(&mut self, conn: Arc<ShardConnection>, backend: BackendInfo) {
        let cookie = conn.cookie();
        debug!(
            client = %self.persistence_id(),
            cookie,
            backend = %backend,
            "resolved backend"
        );

        let stamp = self.core.connections_lock.write_lock();
        let new_conn = ShardConnection::connected(
            conn.context().clone(),
            cookie,
            backend,
            self.core.config.pending_queue_ceiling,
            Arc::clone(&self.core.stats),
        );
        // The strategy adjusts higher-level state before any entry is
        // retransmitted; under the lock so it is atomic with publication.
        let cohort = self.strategy.connection_up(&new_conn);
        let mut replay = conn.start_replay();
        let entries = replay.take_entries();
        let forwarder = cohort.finish_reconnect(entries);
        conn.finish_replay(replay, forwarder);
        self.publish_connection(cookie, &conn, &new_conn);
        self.core.connections_lock.unlock_write(stamp);

        self.core.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        debug!(
            client = %self.persistence_id(),
            cookie,
            old = ?conn,
            new = ?new_conn,
            "connection transition complete"
        );
    }

    /// Compare-and-swap the map entry from `old` to `new` by identity.
    fn publish_connection(
        &self,
        cookie: u64,
        old: &Arc<ShardConnection>,
        new: &Arc<ShardConnection>,
    ) {
        if let Some(mut entry) = self.core.connections.get_mut(&cookie) {
            if Arc::ptr_eq(entry.value(), old) {
                *entry.value_mut() = Arc::clone(new);
                return;
            }
        }
        debug!(
            client = %self.persistence_id(),
            cookie,
            "connection superseded during transition, leaving map as-is"
        );
    }
}
