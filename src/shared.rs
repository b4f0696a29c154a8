//! # Summary
//!
//! This module implements a central hub for in-process message forwarding.
//! We wrap the hub with Arc<RwLock<T>> to share the channels between
//! concurrently running replicas and clients.
//!
//! The core never talks to the hub directly: it only needs the [`Sender`]
//! contract, which the hub implements through per-endpoint [`Link`]s. Sends
//! are fire-and-forget; messages to unknown endpoints are dropped.

use std::collections::HashMap as Map;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::Rng;
use tokio::sync::mpsc;

use crate::message::{ClientId, ReplicaId};
use crate::thread::{client, replica};

/// Outbound side of the transport as seen by replicas and clients.
pub trait Sender: Send + Sync + 'static {
    /// Sends to every replica other than the sender itself.
    fn send_to_all(&self, message: replica::In);

    /// Sends to a single replica.
    fn send_to(&self, id: ReplicaId, message: replica::In);

    /// Sends to a client.
    fn send_to_client(&self, id: ClientId, message: client::In);
}

impl<T: Sender + ?Sized> Sender for Arc<T> {
    fn send_to_all(&self, message: replica::In) {
        (**self).send_to_all(message)
    }

    fn send_to(&self, id: ReplicaId, message: replica::In) {
        (**self).send_to(id, message)
    }

    fn send_to_client(&self, id: ClientId, message: client::In) {
        (**self).send_to_client(id, message)
    }
}

/// Sending side of a link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Replica(ReplicaId),
    Client(ClientId),
}

/// Thread-safe wrapper around the `Hub` forwarding state.
#[derive(Clone, Default)]
pub struct Shared(Arc<RwLock<Hub>>);

impl Shared {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every delivery by a random duration up to `max`, so messages
    /// may overtake each other. Requires a running Tokio runtime.
    pub fn with_jitter(self, max: Duration) -> Self {
        self.write().jitter = Some(max);
        self
    }

    /// Acquires a read lock on the underlying hub.
    pub fn read(&self) -> RwLockReadGuard<'_, Hub> {
        self.0.read()
    }

    /// Acquires a write lock on the underlying hub.
    pub fn write(&self) -> RwLockWriteGuard<'_, Hub> {
        self.0.write()
    }

    /// Registers a replica and returns its inbound channel.
    pub fn connect_replica(&self, id: ReplicaId) -> mpsc::UnboundedReceiver<replica::In> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.write().replica_txs.insert(id, tx);
        info!("connected replica {}", id);
        rx
    }

    /// Registers a client and returns its inbound channel.
    pub fn connect_client(&self, id: ClientId) -> mpsc::UnboundedReceiver<client::In> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.write().client_txs.insert(id, tx);
        info!("connected client {}", id);
        rx
    }

    pub fn disconnect_replica(&self, id: ReplicaId) {
        info!("disconnected replica {}", id);
        self.write().replica_txs.remove(&id);
    }

    pub fn disconnect_client(&self, id: ClientId) {
        info!("disconnected client {}", id);
        self.write().client_txs.remove(&id);
    }

    /// Creates a [`Sender`] that sends on behalf of `from`.
    pub fn link(&self, from: Endpoint) -> Link {
        Link { from, shared: self.clone() }
    }
}

/// Collection of inbound channels.
#[derive(Default)]
pub struct Hub {
    replica_txs: Map<ReplicaId, mpsc::UnboundedSender<replica::In>>,
    client_txs: Map<ClientId, mpsc::UnboundedSender<client::In>>,
    jitter: Option<Duration>,
}

impl Hub {
    pub fn replicas(&self) -> Vec<ReplicaId> {
        let mut ids = self.replica_txs.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    fn deliver<T: Send + 'static>(&self, tx: &mpsc::UnboundedSender<T>, message: T) {
        match self.jitter {
        | Some(max) if max > Duration::from_secs(0) => {
            let delay = rand::thread_rng().gen_range(Duration::from_secs(0)..=max);
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                tx.send(message).ok();
            });
        }
        | _ => {
            // Receiver may have shut down
            tx.send(message).ok();
        }
        }
    }

    /// Forwards a message to a replica.
    pub fn send_replica(&self, id: ReplicaId, message: replica::In) {
        match self.replica_txs.get(&id) {
        | Some(tx) => self.deliver(tx, message),
        | None => trace!("dropping message for unknown replica {}", id),
        }
    }

    /// Forwards a message to a client.
    pub fn send_client(&self, id: ClientId, message: client::In) {
        match self.client_txs.get(&id) {
        | Some(tx) => self.deliver(tx, message),
        | None => trace!("dropping message for unknown client {}", id),
        }
    }

    /// Forwards a message to every replica except `except`.
    pub fn broadcast(&self, except: Option<ReplicaId>, message: replica::In) {
        for (id, tx) in &self.replica_txs {
            if Some(*id) != except {
                self.deliver(tx, message.clone());
            }
        }
    }
}

/// [`Sender`] bound to one endpoint of a [`Shared`] hub.
#[derive(Clone)]
pub struct Link {
    from: Endpoint,
    shared: Shared,
}

impl Link {
    pub fn endpoint(&self) -> Endpoint {
        self.from
    }
}

impl Sender for Link {
    fn send_to_all(&self, message: replica::In) {
        let except = match self.from {
        | Endpoint::Replica(id) => Some(id),
        | Endpoint::Client(_) => None,
        };
        trace!("{:?} broadcasting {:?}", self.from, message);
        self.shared.read().broadcast(except, message);
    }

    fn send_to(&self, id: ReplicaId, message: replica::In) {
        trace!("{:?} sending {:?} to replica {}", self.from, message, id);
        self.shared.read().send_replica(id, message);
    }

    fn send_to_client(&self, id: ClientId, message: client::In) {
        trace!("{:?} sending {:?} to client {}", self.from, message, id);
        self.shared.read().send_client(id, message);
    }
}
