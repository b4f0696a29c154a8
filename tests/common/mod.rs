#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use curp::{
    client, replica, Client, ClientFactory, ClientId, Command, Completion, Config, Endpoint, Key,
    Link, Op, Replica, ReplicaId, Sender, Shared, Shutdown, State, Value, Wait,
};
use futures::channel::oneshot;
use parking_lot::Mutex;

pub const PATIENCE: Duration = Duration::from_secs(5);

/// Key-value state machine that remembers the order it executed commands in.
#[derive(Debug, Default)]
pub struct Memory {
    pub data: BTreeMap<Key, Value>,
    pub log: Vec<Command>,
}

impl State for Memory {
    fn execute(&mut self, command: &Command) -> Value {
        self.log.push(command.clone());
        match command.op {
        | Op::Put => {
            self.data.insert(command.key, command.value.clone());
            command.value.clone()
        }
        | _ => self.compute_result(command),
        }
    }

    fn compute_result(&self, command: &Command) -> Value {
        match command.op {
        | Op::Get => self.data.get(&command.key).cloned().unwrap_or_default(),
        | _ => Value::nil(),
        }
    }
}

/// Sender that keeps everything it is asked to send.
#[derive(Debug, Default)]
pub struct Recorder {
    pub replicas: Mutex<Vec<(Option<ReplicaId>, replica::In)>>,
    pub clients: Mutex<Vec<(ClientId, client::In)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn to_replicas(&self) -> Vec<(Option<ReplicaId>, replica::In)> {
        self.replicas.lock().clone()
    }

    pub fn to_clients(&self) -> Vec<client::In> {
        self.clients.lock().iter().map(|(_, message)| message.clone()).collect()
    }
}

impl Sender for Recorder {
    fn send_to_all(&self, message: replica::In) {
        self.replicas.lock().push((None, message));
    }

    fn send_to(&self, id: ReplicaId, message: replica::In) {
        self.replicas.lock().push((Some(id), message));
    }

    fn send_to_client(&self, id: ClientId, message: client::In) {
        self.clients.lock().push((id, message));
    }
}

/// Replicas and clients running over one in-process hub.
pub struct Cluster {
    pub shared: Shared,
    pub config: Config,
    pub replicas: Vec<Replica<Memory, Link>>,
    pub shutdown: Shutdown,
    factory: ClientFactory,
}

impl Cluster {
    /// Starts every replica of `config`. Must run inside a Tokio runtime.
    pub fn start(config: Config) -> Self {
        Self::start_on(Shared::new(), config)
    }

    pub fn start_on(shared: Shared, config: Config) -> Self {
        let shutdown = Shutdown::new();
        let replicas = (0..config.replicas)
            .map(|id| {
                let rx = shared.connect_replica(id);
                let link = shared.link(Endpoint::Replica(id));
                let replica = Replica::new(id, config.clone(), Memory::default(), link)
                    .expect("valid replica");
                tokio::spawn(replica.clone().run(rx, shutdown.clone()));
                replica
            })
            .collect();
        Cluster { shared, config, replicas, shutdown, factory: ClientFactory::new(1) }
    }

    pub fn leader(&self) -> &Replica<Memory, Link> {
        &self.replicas[self.config.leader]
    }

    /// Starts a client bound to replica `bound`.
    pub fn client(&self, bound: ReplicaId) -> Client<Link> {
        let shared = self.shared.clone();
        let client = self.factory
            .build(self.config.clone(), bound, |id| shared.link(Endpoint::Client(id)))
            .expect("valid client");
        let rx = self.shared.connect_client(client.id());
        tokio::spawn(client.clone().run(rx, self.shutdown.clone()));
        client
    }

    /// Waits until every replica has executed `slot`.
    pub async fn wait_executed(&self, slot: usize) -> bool {
        for replica in &self.replicas {
            if replica.wait_executed(slot, PATIENCE).await == Wait::TimedOut {
                return false
            }
        }
        true
    }

    pub fn logs(&self) -> Vec<Vec<Command>> {
        self.replicas
            .iter()
            .map(|replica| replica.with_state(|state| state.log.clone()))
            .collect()
    }

    pub fn stop(&self) {
        self.shutdown.trigger();
    }
}

/// Waits for a command to complete.
pub async fn complete(rx: oneshot::Receiver<Completion>) -> Completion {
    tokio::time::timeout(PATIENCE, rx)
        .await
        .expect("command timed out")
        .expect("client dropped command")
}
