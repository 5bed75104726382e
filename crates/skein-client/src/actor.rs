//! Actor-style command loop
//!
//! The coordinator is not hosted by a real actor runtime; a single-consumer
//! command channel plays the mailbox. Everything that mutates coordinator
//! state (connection transitions, envelope routing, resolver completions)
//! runs on the one task draining that channel, so the coordinator itself
//! needs no internal locking beyond the connection map.

use crate::coordinator::ClientCoordinator;
use skein_protocol::{ClientId, ResponseEnvelope};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// What the command loop should do after handling a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Keep processing commands
    Continue,
    /// Stop the actor; the client is done
    Stop,
}

/// A trusted callable executed on the actor task to effect a state change.
pub type InternalCommand = Box<dyn FnOnce(&mut ClientCoordinator) -> Next + Send>;

/// One unit of actor mailbox traffic.
pub enum Command {
    /// Actor-local state transition
    Internal(InternalCommand),
    /// Inbound response envelope from the transport
    Envelope(ResponseEnvelope),
    /// Application-level command, dispatched to the client strategy
    Application(Box<dyn Any + Send>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Internal(_) => f.write_str("Command::Internal"),
            Command::Envelope(envelope) => write!(f, "Command::Envelope({envelope:?})"),
            Command::Application(_) => f.write_str("Command::Application"),
        }
    }
}

/// Handle onto the actor task, cheap to clone and safe to use from any
/// thread. This is what connections and resolver continuations use to get
/// back onto the actor.
#[derive(Debug, Clone)]
pub struct ClientActorContext {
    client_id: ClientId,
    persistence_id: Arc<str>,
    command_tx: mpsc::UnboundedSender<Command>,
}

impl ClientActorContext {
    pub(crate) fn new(client_id: ClientId, command_tx: mpsc::UnboundedSender<Command>) -> Self {
        let persistence_id = client_id.to_string().into();
        Self {
            client_id,
            persistence_id,
            command_tx,
        }
    }

    /// The identity of the client this actor hosts
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Stable string identity used as the logging context
    pub fn persistence_id(&self) -> &str {
        &self.persistence_id
    }

    /// Resolves once the actor task has stopped and dropped its mailbox.
    pub(crate) async fn closed(&self) {
        self.command_tx.closed().await;
    }

    pub(crate) fn send(&self, command: Command) -> bool {
        if self.command_tx.send(command).is_err() {
            trace!(client = %self.persistence_id, "actor stopped, dropping command");
            return false;
        }
        true
    }

    /// Run `f` on the actor task.
    ///
    /// Silently dropped if the actor has stopped; by then every connection
    /// has been poisoned and there is nothing left for the command to do.
    pub fn execute_in_actor(
        &self,
        f: impl FnOnce(&mut ClientCoordinator) -> Next + Send + 'static,
    ) {
        self.send(Command::Internal(Box::new(f)));
    }

    /// Run `f` on the actor task after `delay`.
    pub fn execute_in_actor_after(
        &self,
        delay: Duration,
        f: impl FnOnce(&mut ClientCoordinator) -> Next + Send + 'static,
    ) {
        let context = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            context.send(Command::Internal(Box::new(f)));
        });
    }
}

/// Drain the mailbox until a command asks the actor to stop or every sender
/// is gone.
pub(crate) async fn run(mut coordinator: ClientCoordinator, mut rx: mpsc::UnboundedReceiver<Command>) {
    debug!(client = %coordinator.persistence_id(), "client actor started");
    while let Some(command) = rx.recv().await {
        match coordinator.on_receive_command(command) {
            Next::Continue => {}
            Next::Stop => break,
        }
    }
    // Dropping the receiver closes the mailbox; producers observe the client
    // as stopped through their send failures.
    debug!(client = %coordinator.persistence_id(), "client actor stopped");
}
