//! # Summary
//!
//! Boots replicas and clients over one in-process hub and runs scenario
//! commands against them, one at a time.

use std::time::Duration;

use curp::{Client, ClientFactory, Config, Endpoint, Link, Replica, Shared, Shutdown};
use futures::channel::oneshot;

use crate::command;
use crate::error::Error;

pub struct Cluster {
    config: Config,
    replicas: Vec<Replica<kvstore::Store, Link>>,
    clients: Vec<Client<Link>>,
    timeout: Duration,
    shutdown: Shutdown,
}

impl Cluster {
    /// Starts every replica and client. Must run inside a Tokio runtime.
    pub fn start(settings: &command::Cluster) -> Result<Self, Error> {
        let mut config = Config::new(settings.replicas, settings.leader).with_variant(settings.variant);
        if settings.batching {
            config = config.with_batching(settings.batch_delay_ms.map(Duration::from_millis));
        }
        if let Some(max) = settings.max_desc_tasks {
            config = config.with_max_desc_tasks(max);
        }
        config.validate()?;

        let shared = match settings.jitter_ms {
        | Some(ms) => Shared::new().with_jitter(Duration::from_millis(ms)),
        | None => Shared::new(),
        };
        let shutdown = Shutdown::new();

        let mut replicas = Vec::with_capacity(settings.replicas);
        for id in 0..settings.replicas {
            let rx = shared.connect_replica(id);
            let replica = Replica::new(id, config.clone(), kvstore::Store::new(), shared.link(Endpoint::Replica(id)))?;
            tokio::spawn(replica.clone().run(rx, shutdown.clone()));
            replicas.push(replica);
        }

        let factory = ClientFactory::new(1);
        let mut clients = Vec::with_capacity(settings.clients.len());
        for (index, client) in settings.clients.iter().enumerate() {
            let latencies = client.latencies_ms
                .iter()
                .enumerate()
                .map(|(id, ms)| (id, Duration::from_millis(*ms)))
                .collect::<Vec<_>>();
            let bound = match curp::closest_replica(&latencies) {
            | Some(bound) => bound,
            | None if config.variant == curp::Variant::Ht => config.leader,
            | None => return Err(Error::Unbound(index)),
            };
            let client = factory.build(config.clone(), bound, |id| shared.link(Endpoint::Client(id)))?;
            let rx = shared.connect_client(client.id());
            tokio::spawn(client.clone().run(rx, shutdown.clone()));
            info!("client {} (index {}) bound to replica {}", client.id(), index, bound);
            clients.push(client);
        }

        Ok(Cluster {
            config,
            replicas,
            clients,
            timeout: Duration::from_millis(settings.timeout_ms),
            shutdown,
        })
    }

    fn client(&self, index: usize) -> Result<&Client<Link>, Error> {
        self.clients.get(index).ok_or(Error::Client(index))
    }

    fn expect_variant(&self, command: &'static str, expected: curp::Variant) -> Result<(), Error> {
        if self.config.variant == expected {
            Ok(())
        } else {
            Err(Error::Variant { command, expected })
        }
    }

    pub async fn run(&self, command: command::Command) -> Result<(), Error> {
        use command::Command::*;
        use curp::Variant::{Ho, Ht};
        let label = format!("{:?}", command);
        match command {
        | Put { client, key, value } => self.strong(client, curp::Command::put(key, value), &label).await,
        | Get { client, key } => self.strong(client, curp::Command::get(key), &label).await,
        | Scan { client, key, count } => self.strong(client, curp::Command::scan(key, count), &label).await,
        | WeakPut { client, key, value } => {
            self.expect_variant("weak_put", Ht)?;
            self.weak(client, curp::Command::put(key, value), &label).await
        }
        | WeakGet { client, key } => {
            self.expect_variant("weak_get", Ht)?;
            self.weak(client, curp::Command::get(key), &label).await
        }
        | CausalPut { client, key, value } => {
            self.expect_variant("causal_put", Ho)?;
            self.weak(client, curp::Command::put(key, value), &label).await
        }
        | CausalGet { client, key } => {
            self.expect_variant("causal_get", Ho)?;
            self.weak(client, curp::Command::get(key), &label).await
        }
        | Sleep { ms } => {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(())
        }
        | Stats => {
            self.stats();
            Ok(())
        }
        }
    }

    async fn strong(&self, index: usize, command: curp::Command, label: &str) -> Result<(), Error> {
        let (_, rx) = self.client(index)?.propose(command);
        self.finish(index, rx, label).await
    }

    async fn weak(&self, index: usize, command: curp::Command, label: &str) -> Result<(), Error> {
        let (_, rx) = self.client(index)?.propose_weak(command);
        self.finish(index, rx, label).await
    }

    async fn finish(&self, index: usize, rx: oneshot::Receiver<curp::Completion>, label: &str) -> Result<(), Error> {
        match tokio::time::timeout(self.timeout, rx).await {
        | Ok(Ok(completion)) => {
            println!("client {} {:?}: {} ({:?} path)", index, completion.cmd_id, completion.value, completion.path);
            Ok(())
        }
        | _ => Err(Error::Timeout(label.to_string())),
        }
    }

    fn stats(&self) {
        for (index, client) in self.clients.iter().enumerate() {
            let stats = client.stats();
            println!(
                "client {}: fast {}, slow {}, weak {}, escalated {}",
                index, stats.fast, stats.slow, stats.weak, stats.escalated,
            );
        }
        for replica in &self.replicas {
            let applied = replica.with_state(kvstore::Store::applied);
            print!("replica {}: executed {} slots, applied {}", replica.id(), replica.executed(), applied);
            match replica.batch_stats() {
            | Some(batch) => println!(
                ", {} batches (min {}, max {}, avg {:.2}, {} accepts, {} acks)",
                batch.batches, batch.min, batch.max, batch.average(), batch.accepts, batch.acks,
            ),
            | None => println!(),
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.trigger();
    }
}
