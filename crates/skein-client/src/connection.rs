//! Per-shard connection objects
//!
//! Exactly one [`ShardConnection`] instance is published per shard cookie at
//! any time. The *kind* of a connection is fixed at construction; a lifecycle
//! transition builds a new instance and swaps the map entry, it never mutates
//! the kind in place. What does change inside an instance is its queue state
//! and its terminal phase: an instance that has been through replay redirects
//! late entries to a [`ReconnectForwarder`], and a poisoned instance fails
//! everything it is handed.
//!
//! Lock order: a connection may lock its successor (to forward an entry)
//! while holding its own queue lock. Forwarding always points at a newer
//! instance, so these chains are acyclic.

use crate::actor::{ClientActorContext, Next};
use crate::backend::BackendInfo;
use crate::coordinator::ClientStats;
use parking_lot::{Mutex, MutexGuard};
use skein_protocol::{Request, RequestEnvelope, RequestError, Response, ResponseEnvelope};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Completion callback of a connection entry, consumed exactly once.
pub type ResponseCallback = Box<dyn FnOnce(Result<Response, RequestError>) + Send>;

/// A buffered request awaiting transmission or a response.
pub struct ConnectionEntry {
    /// The request to (re)transmit
    pub request: Request,
    /// When the producer enqueued this entry
    pub enqueued_at: Instant,
    callback: ResponseCallback,
}

impl ConnectionEntry {
    /// Create an entry from a request and its completion callback
    pub fn new(
        request: Request,
        callback: impl FnOnce(Result<Response, RequestError>) + Send + 'static,
    ) -> Self {
        Self {
            request,
            enqueued_at: Instant::now(),
            callback: Box::new(callback),
        }
    }

    /// Complete the entry, consuming it
    pub fn complete(self, result: Result<Response, RequestError>) {
        (self.callback)(result);
    }
}

impl fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("request", &self.request)
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}

/// An entry that has been handed to the transport and awaits its response.
#[derive(Debug)]
struct InflightEntry {
    tx_sequence: u64,
    entry: ConnectionEntry,
}

/// What a connection instance is, fixed at construction.
#[derive(Debug, Clone)]
pub enum ConnectionKind {
    /// No backend known yet; buffering until the first resolution completes
    Connecting,
    /// Bound to a backend session and transmitting
    Connected(BackendInfo),
    /// Lost its backend; buffering until a refreshed resolution completes
    Reconnecting(BackendInfo),
}

impl ConnectionKind {
    fn name(&self) -> &'static str {
        match self {
            ConnectionKind::Connecting => "connecting",
            ConnectionKind::Connected(_) => "connected",
            ConnectionKind::Reconnecting(_) => "reconnecting",
        }
    }
}

/// Redirects entries that land on a replaced connection during the race
/// window between freeze and the producers noticing the new map entry.
pub trait ReconnectForwarder: Send {
    /// Accept one straggler entry
    fn forward_entry(&self, entry: ConnectionEntry);
}

/// Stock forwarder: hands stragglers to the successor connection unchanged.
///
/// A reconnect cohort that rewrites replayed entries should return its own
/// forwarder applying the same rewrite, so stragglers are not treated
/// differently from the entries that were already buffered.
pub struct ForwardToConnection {
    successor: Arc<ShardConnection>,
}

impl ForwardToConnection {
    /// Forward everything to `successor`
    pub fn new(successor: Arc<ShardConnection>) -> Self {
        Self { successor }
    }
}

impl ReconnectForwarder for ForwardToConnection {
    fn forward_entry(&self, entry: ConnectionEntry) {
        self.successor.enqueue_replayed(entry);
    }
}

enum Phase {
    /// Accepting entries
    Open,
    /// Replaced; entries redirect to the forwarder
    Forwarding(Box<dyn ReconnectForwarder>),
    /// Terminal; entries fail immediately with the cause
    Poisoned(RequestError),
}

struct QueueState {
    phase: Phase,
    pending: VecDeque<ConnectionEntry>,
    inflight: VecDeque<InflightEntry>,
    next_tx_sequence: u64,
}

/// The frozen queue of a connection mid-transition.
///
/// Holds the connection's queue lock for as long as it lives, so no producer
/// enqueue can interleave between the freeze and the forwarder installation.
/// Obtain it from [`ShardConnection::start_replay`] and consume it with
/// [`ShardConnection::finish_replay`].
pub struct ReplayState<'a> {
    guard: MutexGuard<'a, QueueState>,
    entries: Vec<ConnectionEntry>,
}

impl ReplayState<'_> {
    /// Take the buffered entries, in their original enqueue order
    pub fn take_entries(&mut self) -> Vec<ConnectionEntry> {
        std::mem::take(&mut self.entries)
    }
}

/// One shard's connection to (or towards) its backend.
pub struct ShardConnection {
    context: ClientActorContext,
    cookie: u64,
    kind: ConnectionKind,
    pending_ceiling: usize,
    stats: Arc<ClientStats>,
    queue: Mutex<QueueState>,
}

impl ShardConnection {
    pub(crate) fn connecting(
        context: ClientActorContext,
        cookie: u64,
        pending_ceiling: usize,
        stats: Arc<ClientStats>,
    ) -> Arc<Self> {
        Self::with_kind(context, cookie, ConnectionKind::Connecting, pending_ceiling, stats)
    }

    pub(crate) fn connected(
        context: ClientActorContext,
        cookie: u64,
        backend: BackendInfo,
        pending_ceiling: usize,
        stats: Arc<ClientStats>,
    ) -> Arc<Self> {
        Self::with_kind(
            context,
            cookie,
            ConnectionKind::Connected(backend),
            pending_ceiling,
            stats,
        )
    }

    pub(crate) fn reconnecting(
        context: ClientActorContext,
        cookie: u64,
        backend: BackendInfo,
        pending_ceiling: usize,
        stats: Arc<ClientStats>,
    ) -> Arc<Self> {
        Self::with_kind(
            context,
            cookie,
            ConnectionKind::Reconnecting(backend),
            pending_ceiling,
            stats,
        )
    }

    fn with_kind(
        context: ClientActorContext,
        cookie: u64,
        kind: ConnectionKind,
        pending_ceiling: usize,
        stats: Arc<ClientStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            cookie,
            kind,
            pending_ceiling,
            stats,
            queue: Mutex::new(QueueState {
                phase: Phase::Open,
                pending: VecDeque::new(),
                inflight: VecDeque::new(),
                next_tx_sequence: 0,
            }),
        })
    }

    /// Shard cookie this connection serves
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Actor context this connection reports back through
    pub fn context(&self) -> &ClientActorContext {
        &self.context
    }

    /// What this connection instance is
    pub fn kind(&self) -> &ConnectionKind {
        &self.kind
    }

    /// The backend this connection is bound to or was last bound to
    pub fn backend(&self) -> Option<&BackendInfo> {
        match &self.kind {
            ConnectionKind::Connected(backend) | ConnectionKind::Reconnecting(backend) => {
                Some(backend)
            }
            ConnectionKind::Connecting => None,
        }
    }

    /// Whether this connection has been terminally poisoned
    pub fn is_poisoned(&self) -> bool {
        matches!(self.queue.lock().phase, Phase::Poisoned(_))
    }

    /// Entries buffered but not yet handed to the transport
    pub fn pending(&self) -> usize {
        self.queue.lock().pending.len()
    }

    /// Entries handed to the transport and awaiting a response
    pub fn in_flight(&self) -> usize {
        self.queue.lock().inflight.len()
    }

    /// Enqueue a producer entry.
    ///
    /// Applies the pending-queue ceiling: an entry that does not fit is
    /// completed immediately with [`RequestError::QueueOverflow`], which the
    /// producer may retry later. Entries never sit anywhere else; once this
    /// returns, the entry is buffered, in flight, forwarded, or completed.
    pub fn enqueue(&self, entry: ConnectionEntry) {
        self.stats.requests_enqueued.fetch_add(1, Ordering::Relaxed);
        self.enqueue_inner(entry, true);
    }

    /// Enqueue an entry that was already accepted by a predecessor
    /// connection. Replayed entries bypass the ceiling: they were admitted
    /// once and dropping them during a transition would break the
    /// exactly-once completion contract.
    pub fn enqueue_replayed(&self, entry: ConnectionEntry) {
        self.enqueue_inner(entry, false);
    }

    fn enqueue_inner(&self, entry: ConnectionEntry, enforce_ceiling: bool) {
        let mut queue = self.queue.lock();
        match &queue.phase {
            Phase::Poisoned(cause) => {
                let cause = cause.clone();
                drop(queue);
                trace!(cookie = self.cookie, "failing entry on poisoned connection");
                entry.complete(Err(cause));
            }
            Phase::Forwarding(forwarder) => {
                forwarder.forward_entry(entry);
            }
            Phase::Open => {
                if enforce_ceiling && queue.pending.len() >= self.pending_ceiling {
                    drop(queue);
                    warn!(
                        cookie = self.cookie,
                        ceiling = self.pending_ceiling,
                        "pending queue full, rejecting entry"
                    );
                    entry.complete(Err(RequestError::QueueOverflow {
                        cookie: self.cookie,
                    }));
                    return;
                }
                queue.pending.push_back(entry);
                self.pump(&mut queue);
            }
        }
    }

    /// Enqueue a request and receive its completion through a channel
    pub fn send_request(
        &self,
        request: Request,
    ) -> oneshot::Receiver<Result<Response, RequestError>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(ConnectionEntry::new(request, move |result| {
            let _ = tx.send(result);
        }));
        rx
    }

    /// Transmit from pending while the window has room. Only a connected
    /// connection transmits; the other kinds buffer.
    fn pump(&self, queue: &mut QueueState) {
        let ConnectionKind::Connected(backend) = &self.kind else {
            return;
        };
        while queue.inflight.len() < backend.max_messages() {
            let Some(entry) = queue.pending.pop_front() else {
                break;
            };
            let tx_sequence = queue.next_tx_sequence;
            let envelope = RequestEnvelope {
                session_token: backend.session_token(),
                tx_sequence,
                message: entry.request.clone(),
            };
            if !backend.transmit(envelope) {
                // Transport is gone; the entry stays buffered and the
                // transition protocol will replay it onto the successor.
                queue.pending.push_front(entry);
                break;
            }
            queue.next_tx_sequence += 1;
            queue.inflight.push_back(InflightEntry { tx_sequence, entry });
        }
    }

    /// Deliver an inbound envelope to the matching in-flight entry.
    ///
    /// Envelopes from another session (a predecessor connection's backend)
    /// and envelopes with an unknown transmit sequence are logged and
    /// dropped; neither is an error worth crashing over.
    pub fn receive_response(&self, envelope: ResponseEnvelope) {
        let mut queue = self.queue.lock();
        if matches!(queue.phase, Phase::Poisoned(_)) {
            trace!(cookie = self.cookie, "dropping response on poisoned connection");
            return;
        }
        let Some(backend) = self.backend() else {
            debug!(
                cookie = self.cookie,
                kind = self.kind.name(),
                "dropping response, connection never transmitted"
            );
            self.stats.unknown_responses.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if envelope.session_token() != backend.session_token() {
            debug!(
                cookie = self.cookie,
                session = envelope.session_token(),
                current = backend.session_token(),
                "dropping response from stale session"
            );
            self.stats.unknown_responses.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let position = queue
            .inflight
            .iter()
            .position(|inflight| inflight.tx_sequence == envelope.tx_sequence());
        let Some(position) = position else {
            debug!(
                cookie = self.cookie,
                tx_sequence = envelope.tx_sequence(),
                "dropping response with unknown transmit sequence"
            );
            self.stats.unknown_responses.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Some(inflight) = queue.inflight.remove(position) else {
            return;
        };
        self.stats.responses_matched.fetch_add(1, Ordering::Relaxed);
        // A response frees a window slot
        self.pump(&mut queue);
        drop(queue);
        match envelope {
            ResponseEnvelope::Success(success) => inflight.entry.complete(Ok(success.message)),
            ResponseEnvelope::Failure(failure) => {
                inflight.entry.complete(Err(failure.message.cause))
            }
        }
    }

    /// Freeze this connection for replay.
    ///
    /// Returns every buffered entry (in flight first, then pending, which is
    /// enqueue order) and keeps the queue locked until
    /// [`finish_replay`](Self::finish_replay) consumes the returned state.
    /// The caller must not touch this connection's queue through any other
    /// path while the replay state is alive.
    pub fn start_replay(&self) -> ReplayState<'_> {
        let mut guard = self.queue.lock();
        let mut entries = Vec::with_capacity(guard.inflight.len() + guard.pending.len());
        entries.extend(guard.inflight.drain(..).map(|inflight| inflight.entry));
        entries.extend(guard.pending.drain(..));
        debug!(
            cookie = self.cookie,
            kind = self.kind.name(),
            entries = entries.len(),
            "freezing connection for replay"
        );
        ReplayState { guard, entries }
    }

    /// Install the forwarder and unfreeze.
    ///
    /// Entries still sitting in the replay state (not taken by the caller)
    /// are handed to the forwarder so nothing is silently dropped. A
    /// connection that was poisoned while frozen stays poisoned.
    pub fn finish_replay(&self, mut replay: ReplayState<'_>, forwarder: Box<dyn ReconnectForwarder>) {
        for entry in replay.entries.drain(..) {
            forwarder.forward_entry(entry);
        }
        if !matches!(replay.guard.phase, Phase::Poisoned(_)) {
            replay.guard.phase = Phase::Forwarding(forwarder);
        }
    }

    /// Terminally fail this connection.
    ///
    /// Every buffered and in-flight entry is completed with `cause`, later
    /// entries fail immediately, and the coordinator is asked to drop this
    /// instance from the connection map. Idempotent.
    pub fn poison(self: &Arc<Self>, cause: RequestError) {
        let entries = {
            let mut queue = self.queue.lock();
            if matches!(queue.phase, Phase::Poisoned(_)) {
                return;
            }
            let mut entries =
                Vec::with_capacity(queue.inflight.len() + queue.pending.len());
            entries.extend(queue.inflight.drain(..).map(|inflight| inflight.entry));
            entries.extend(queue.pending.drain(..));
            queue.phase = Phase::Poisoned(cause.clone());
            entries
        };
        warn!(
            cookie = self.cookie,
            kind = self.kind.name(),
            entries = entries.len(),
            %cause,
            "poisoning connection"
        );
        self.stats.poisoned_connections.fetch_add(1, Ordering::Relaxed);
        for entry in entries {
            entry.complete(Err(cause.clone()));
        }
        let this = Arc::clone(self);
        self.context.execute_in_actor(move |coordinator| {
            coordinator.remove_connection(&this);
            Next::Continue
        });
    }
}

impl fmt::Debug for ShardConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardConnection")
            .field("cookie", &self.cookie)
            .field("kind", &self.kind.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use skein_protocol::{
        ClientId, FailureEnvelope, LocalHistoryId, RequestFailure, RequestTarget, SuccessEnvelope,
    };
    use tokio::sync::mpsc;

    fn context() -> (ClientActorContext, mpsc::UnboundedReceiver<crate::actor::Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ClientActorContext::new(ClientId::new("member-1-frontend", 0), tx),
            rx,
        )
    }

    fn target(cookie: u64) -> RequestTarget {
        RequestTarget::History(LocalHistoryId::new(
            ClientId::new("member-1-frontend", 0),
            1,
            cookie,
        ))
    }

    fn request(cookie: u64, sequence: u64) -> Request {
        Request::new(target(cookie), sequence, vec![])
    }

    type Sink = Arc<PlMutex<Vec<Result<Response, RequestError>>>>;

    fn sink_entry(cookie: u64, sequence: u64, sink: &Sink) -> ConnectionEntry {
        let sink = Arc::clone(sink);
        ConnectionEntry::new(request(cookie, sequence), move |result| {
            sink.lock().push(result);
        })
    }

    fn test_backend(
        session_token: u64,
        max_messages: usize,
    ) -> (BackendInfo, mpsc::UnboundedReceiver<RequestEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BackendInfo::new(1, session_token, max_messages, tx), rx)
    }

    fn success(session_token: u64, tx_sequence: u64, cookie: u64, sequence: u64) -> ResponseEnvelope {
        ResponseEnvelope::Success(SuccessEnvelope {
            session_token,
            tx_sequence,
            message: Response {
                target: target(cookie),
                sequence,
                payload: Default::default(),
            },
        })
    }

    #[test]
    fn test_connected_respects_transmit_window() {
        let (context, _rx) = context();
        let (backend, mut outbound) = test_backend(1, 2);
        let conn = ShardConnection::connected(context, 7, backend, 100, Default::default());

        let sink: Sink = Default::default();
        for sequence in 0..3 {
            conn.enqueue(sink_entry(7, sequence, &sink));
        }

        // Window of 2: two transmitted, one pending
        assert_eq!(outbound.try_recv().unwrap().tx_sequence, 0);
        assert_eq!(outbound.try_recv().unwrap().tx_sequence, 1);
        assert!(outbound.try_recv().is_err());
        assert_eq!(conn.pending(), 1);
        assert_eq!(conn.in_flight(), 2);

        // Completing one frees a slot and the third goes out
        conn.receive_response(success(1, 0, 7, 0));
        let third = outbound.try_recv().unwrap();
        assert_eq!(third.tx_sequence, 2);
        assert_eq!(third.message.sequence, 2);
        assert_eq!(sink.lock().len(), 1);
        assert!(sink.lock()[0].is_ok());
    }

    #[test]
    fn test_unknown_sequence_and_stale_session_dropped() {
        let (context, _rx) = context();
        let (backend, _outbound) = test_backend(5, 4);
        let conn = ShardConnection::connected(context, 7, backend, 100, Default::default());

        let sink: Sink = Default::default();
        conn.enqueue(sink_entry(7, 0, &sink));

        // Unknown transmit sequence
        conn.receive_response(success(5, 99, 7, 0));
        // Stale session token
        conn.receive_response(success(4, 0, 7, 0));
        assert!(sink.lock().is_empty());
        assert_eq!(conn.in_flight(), 1);

        // The genuine response still matches
        conn.receive_response(success(5, 0, 7, 0));
        assert_eq!(sink.lock().len(), 1);
    }

    #[test]
    fn test_failure_response_completes_with_cause() {
        let (context, _rx) = context();
        let (backend, _outbound) = test_backend(1, 4);
        let conn = ShardConnection::connected(context, 7, backend, 100, Default::default());

        let sink: Sink = Default::default();
        conn.enqueue(sink_entry(7, 0, &sink));
        conn.receive_response(ResponseEnvelope::Failure(FailureEnvelope {
            session_token: 1,
            tx_sequence: 0,
            message: RequestFailure {
                target: target(7),
                sequence: 0,
                cause: RequestError::Runtime("chain moved".into()),
            },
        }));

        let results = sink.lock();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0],
            Err(RequestError::Runtime("chain moved".into()))
        );
    }

    #[test]
    fn test_pending_ceiling_rejects_with_overflow() {
        let (context, _rx) = context();
        let conn = ShardConnection::connecting(context, 7, 2, Default::default());

        let sink: Sink = Default::default();
        for sequence in 0..3 {
            conn.enqueue(sink_entry(7, sequence, &sink));
        }

        let results = sink.lock();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], Err(RequestError::QueueOverflow { cookie: 7 }));
        assert_eq!(conn.pending(), 2);
    }

    #[test]
    fn test_replayed_entries_bypass_ceiling() {
        let (context, _rx) = context();
        let conn = ShardConnection::connecting(context, 7, 1, Default::default());

        let sink: Sink = Default::default();
        conn.enqueue_replayed(sink_entry(7, 0, &sink));
        conn.enqueue_replayed(sink_entry(7, 1, &sink));
        conn.enqueue_replayed(sink_entry(7, 2, &sink));

        assert!(sink.lock().is_empty());
        assert_eq!(conn.pending(), 3);
    }

    #[test]
    fn test_poison_completes_everything_and_rejects_later_entries() {
        let (context, mut actor_rx) = context();
        let (backend, _outbound) = test_backend(1, 1);
        let conn = ShardConnection::connected(context, 7, backend, 100, Default::default());

        let sink: Sink = Default::default();
        conn.enqueue(sink_entry(7, 0, &sink)); // in flight
        conn.enqueue(sink_entry(7, 1, &sink)); // pending

        conn.poison(RequestError::Runtime("backend lost".into()));
        assert!(conn.is_poisoned());
        {
            let results = sink.lock();
            assert_eq!(results.len(), 2);
            assert!(results
                .iter()
                .all(|result| result == &Err(RequestError::Runtime("backend lost".into()))));
        }

        // Later entries fail immediately
        conn.enqueue(sink_entry(7, 2, &sink));
        assert_eq!(sink.lock().len(), 3);

        // Poisoning asked the coordinator to drop us
        assert!(actor_rx.try_recv().is_ok());

        // And it is idempotent
        conn.poison(RequestError::Runtime("again".into()));
        assert_eq!(sink.lock().len(), 3);
    }

    #[test]
    fn test_replay_preserves_order_and_forwards_stragglers() {
        let (context, _rx) = context();
        let (backend, mut outbound) = test_backend(9, 16);

        let old = ShardConnection::connecting(context.clone(), 7, 100, Default::default());
        let new = ShardConnection::connected(context, 7, backend, 100, Default::default());

        let sink: Sink = Default::default();
        old.enqueue(sink_entry(7, 0, &sink));
        old.enqueue(sink_entry(7, 1, &sink));

        let mut replay = old.start_replay();
        let entries = replay.take_entries();
        assert_eq!(entries.len(), 2);
        for entry in entries {
            new.enqueue_replayed(entry);
        }
        old.finish_replay(replay, Box::new(ForwardToConnection::new(Arc::clone(&new))));

        // A straggler enqueued on the old instance lands after the replayed
        // entries on the new one
        old.enqueue(sink_entry(7, 2, &sink));

        let sequences: Vec<u64> = std::iter::from_fn(|| outbound.try_recv().ok())
            .map(|envelope| envelope.message.sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_untaken_replay_entries_reach_the_forwarder() {
        let (context, _rx) = context();
        let (backend, mut outbound) = test_backend(9, 16);

        let old = ShardConnection::connecting(context.clone(), 7, 100, Default::default());
        let new = ShardConnection::connected(context, 7, backend, 100, Default::default());

        let sink: Sink = Default::default();
        old.enqueue(sink_entry(7, 0, &sink));

        // Freeze but never take the entries; finish_replay must not drop them
        let replay = old.start_replay();
        old.finish_replay(replay, Box::new(ForwardToConnection::new(new)));

        assert_eq!(outbound.try_recv().unwrap().message.sequence, 0);
    }
}
