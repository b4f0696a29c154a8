//! # Summary
//!
//! This module implements the client side of the protocol.
//!
//! Every strong command is tracked by two certificates running side by
//! side. The fast certificate needs three quarters of the cluster including
//! the leader: the leader's speculative reply must be `True`, no witness may
//! have refused the command, and every witness must report the same weak
//! dependency. The slow certificate needs a majority including the leader's
//! committed `SyncReply`. Whichever fires first completes the command.
//!
//! A command that cannot take the fast path escalates exactly once: the
//! client sends a `Sync` to the leader and waits for the slow certificate.
//!
//! Weak commands complete on a single reply: from the leader after execution
//! in the leader-only variant, or speculatively from the bound replica in the
//! every-replica variant, where replies from any other replica are ignored.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use hashbrown::HashMap as Map;
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{Config, ConfigError, Variant};
use crate::message;
use crate::message::{Ack, ClientId, CommandId, ReplicaId, SeqNum};
use crate::quorum::{Certificate, Threshold};
use crate::shared::Sender;
use crate::shutdown::Shutdown;
use crate::state::{Command, Value};
use crate::thread::replica;

/// Every message a client can receive.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq)]
pub enum In {
    /// Leader's speculative result
    Reply(message::Reply),

    /// Leader's committed result
    SyncReply(message::Reply),

    /// Witness verdict from a non-leader
    RecordAck(message::RecordAck),

    WeakReply(message::WeakReply),

    /// Speculative weak result, only taken from the bound replica
    CausalReply(message::WeakReply),
}

/// How a command completed.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Path {
    Fast,
    Slow,
    Weak,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub cmd_id: CommandId,
    pub value: Value,
    pub path: Path,
}

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub fast: usize,
    pub slow: usize,
    pub weak: usize,

    /// Commands that fell back to the slow path
    pub escalated: usize,
}

/// Single acknowledgement, as counted by a certificate.
#[derive(Clone, Debug)]
struct Vote {
    ok: Ack,
    weak_dep: Option<CommandId>,
    value: Option<Value>,
}

impl From<message::Reply> for Vote {
    fn from(reply: message::Reply) -> Self {
        Vote { ok: reply.ok, weak_dep: None, value: Some(reply.value) }
    }
}

impl From<message::RecordAck> for Vote {
    fn from(ack: message::RecordAck) -> Self {
        Vote { ok: ack.ok, weak_dep: ack.weak_dep, value: None }
    }
}

/// Fast-path verdict: the leader's value if the acks are consistent.
fn fast_value(leader: Option<&Vote>, witnesses: &[Vote]) -> Option<Value> {
    let leader = leader?;
    if leader.ok != Ack::True {
        return None
    }
    if witnesses.iter().any(|vote| vote.ok == Ack::False) {
        return None
    }
    let weak_dep = witnesses.first().map(|vote| vote.weak_dep);
    if witnesses.iter().any(|vote| Some(vote.weak_dep) != weak_dep) {
        return None
    }
    leader.value.clone()
}

fn slow_value(leader: Option<&Vote>, _: &[Vote]) -> Value {
    leader.and_then(|vote| vote.value.clone()).unwrap_or_default()
}

/// In-flight strong command.
struct Pending {
    fast: Certificate<Vote, Option<Value>>,
    slow: Certificate<Vote, Value>,
    escalated: bool,
    done: oneshot::Sender<Completion>,
}

/// Decision taken while the pending table is locked.
enum Outcome {
    Wait,
    Escalate,
    Complete(Value, Path),
}

#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct Client<T>(Arc<Inner<T>>);

struct Inner<T> {
    id: ClientId,
    config: Config,

    /// Replica whose causal replies count
    bound: ReplicaId,

    sender: T,
    next_seq: AtomicU64,

    /// Sequence number of the latest weak command
    last_weak: Mutex<Option<SeqNum>>,

    pending: Mutex<Map<CommandId, Pending>>,
    weak: Mutex<Map<CommandId, oneshot::Sender<Completion>>>,
    stats: Mutex<Stats>,
}

impl<T: Sender> Client<T> {
    /// Creates client `id`, bound to replica `bound` for causal replies.
    pub fn new(id: ClientId, bound: ReplicaId, config: Config, sender: T) -> Result<Self, ConfigError> {
        config.validate_replica(bound)?;
        Ok(Client(Arc::new(Inner {
            id,
            config,
            bound,
            sender,
            next_seq: AtomicU64::new(0),
            last_weak: Mutex::new(None),
            pending: Mutex::new(Map::default()),
            weak: Mutex::new(Map::default()),
            stats: Mutex::new(Stats::default()),
        })))
    }

    pub fn id(&self) -> ClientId {
        self.0.id
    }

    pub fn bound_replica(&self) -> ReplicaId {
        self.0.bound
    }

    pub fn stats(&self) -> Stats {
        *self.0.stats.lock()
    }

    /// Number of commands still waiting for completion.
    pub fn in_flight(&self) -> usize {
        self.0.pending.lock().len() + self.0.weak.lock().len()
    }

    fn next_id(&self) -> CommandId {
        CommandId {
            client_id: self.0.id,
            seq_num: self.0.next_seq.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Sends a strong command to every replica.
    pub fn propose(&self, command: Command) -> (CommandId, oneshot::Receiver<Completion>) {
        let inner = &self.0;
        let cmd_id = self.next_id();
        let (done, rx) = oneshot::channel();
        let replicas = inner.config.replicas;
        let leader = inner.config.leader;

        let fast = Certificate::new(Threshold::ThreeQuarters, replicas, leader, fast_value)
            .with_leader_required(true);
        let slow = Certificate::new(Threshold::Majority, replicas, leader, slow_value)
            .with_leader_required(true);

        inner.pending.lock().insert(cmd_id, Pending { fast, slow, escalated: false, done });
        debug!("client {} proposing {:?}: {:?}", inner.id, cmd_id, command);
        inner.sender.send_to_all(replica::In::Propose(message::Propose { cmd_id, command }));
        (cmd_id, rx)
    }

    /// Sends a weak command: to the leader in the leader-only variant, to
    /// every replica in the every-replica variant.
    pub fn propose_weak(&self, command: Command) -> (CommandId, oneshot::Receiver<Completion>) {
        let inner = &self.0;
        let (done, rx) = oneshot::channel();

        let (cmd_id, causal_dep) = {
            let mut last_weak = inner.last_weak.lock();
            let cmd_id = self.next_id();
            (cmd_id, last_weak.replace(cmd_id.seq_num))
        };
        inner.weak.lock().insert(cmd_id, done);
        debug!("client {} proposing weak {:?} after {:?}: {:?}", inner.id, cmd_id, causal_dep, command);

        match inner.config.variant {
        | Variant::Ht => {
            let weak = message::WeakPropose { cmd_id, command, causal_dep, bound_replica: None };
            inner.sender.send_to(inner.config.leader, replica::In::WeakPropose(weak));
        }
        | Variant::Ho => {
            let weak = message::WeakPropose { cmd_id, command, causal_dep, bound_replica: Some(inner.bound) };
            inner.sender.send_to_all(replica::In::CausalPropose(weak));
        }
        }
        (cmd_id, rx)
    }

    /// Dispatch loop. Runs until the channel closes or `shutdown` fires.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<In>, shutdown: Shutdown) {
        info!("client {} started (bound to replica {})", self.0.id, self.0.bound);
        while !shutdown.is_triggered() {
            tokio::select! {
                message = rx.recv() => match message {
                | Some(message) => self.handle(message),
                | None => break,
                },
                _ = shutdown.wait() => break,
            }
        }
        info!("client {} stopped", self.0.id);
    }

    /// Handles a single inbound message.
    pub fn handle(&self, message: In) {
        trace!("client {} received {:?}", self.0.id, message);
        match message {
        | In::Reply(reply) => self.respond_reply(reply),
        | In::SyncReply(reply) => {
            let (from, cmd_id) = (reply.replica, reply.cmd_id);
            self.update(cmd_id, |pending| match pending.slow.add(from, Vote::from(reply)) {
            | Some(value) => Outcome::Complete(value, Path::Slow),
            | None => Outcome::Wait,
            });
        }
        | In::RecordAck(ack) => self.respond_record_ack(ack),
        | In::WeakReply(reply) => self.complete_weak(reply),
        | In::CausalReply(reply) => {
            if reply.replica == self.0.bound {
                self.complete_weak(reply);
            } else {
                trace!("client {} ignoring causal reply from replica {}", self.0.id, reply.replica);
            }
        }
        }
    }

    fn respond_reply(&self, reply: message::Reply) {
        let (from, cmd_id, ok) = (reply.replica, reply.cmd_id, reply.ok);
        self.update(cmd_id, |pending| {
            let fast = pending.fast.add(from, Vote::from(reply));
            match fast {
            | Some(Some(value)) => Outcome::Complete(value, Path::Fast),
            | Some(None) => Outcome::Escalate,
            | None if ok != Ack::True => Outcome::Escalate,
            | None => Outcome::Wait,
            }
        });
    }

    fn respond_record_ack(&self, ack: message::RecordAck) {
        if ack.ballot != self.0.config.ballot {
            trace!("client {} dropping stale record ack from replica {}", self.0.id, ack.replica);
            return
        }
        let (from, cmd_id) = (ack.replica, ack.cmd_id);
        self.update(cmd_id, |pending| {
            let vote = Vote::from(ack);
            let fast = pending.fast.add(from, vote.clone());
            let slow = pending.slow.add(from, vote);
            match (fast, slow) {
            | (Some(Some(value)), _) => Outcome::Complete(value, Path::Fast),
            | (_, Some(value)) => Outcome::Complete(value, Path::Slow),
            | (Some(None), None) => Outcome::Escalate,
            | (None, None) => Outcome::Wait,
            }
        });
    }

    /// Applies `decide` to the pending entry for `cmd_id` and carries out
    /// its outcome. Messages for unknown or completed commands are dropped.
    fn update<F>(&self, cmd_id: CommandId, decide: F) where F: FnOnce(&mut Pending) -> Outcome {
        let inner = &self.0;
        let mut pending = inner.pending.lock();
        let entry = match pending.get_mut(&cmd_id) {
        | Some(entry) => entry,
        | None => {
            trace!("client {} dropping late message for {:?}", inner.id, cmd_id);
            return
        }
        };
        match decide(entry) {
        | Outcome::Wait => (),
        | Outcome::Escalate => self.escalate(cmd_id, entry),
        | Outcome::Complete(value, path) => {
            if let Some(entry) = pending.remove(&cmd_id) {
                self.complete(entry.done, Completion { cmd_id, value, path });
            }
        }
        }
    }

    fn escalate(&self, cmd_id: CommandId, entry: &mut Pending) {
        if entry.escalated {
            return
        }
        entry.escalated = true;
        self.0.stats.lock().escalated += 1;
        debug!("client {} escalating {:?} to the slow path", self.0.id, cmd_id);
        self.0.sender.send_to(self.0.config.leader, replica::In::Sync(message::Sync { cmd_id }));
    }

    fn complete_weak(&self, reply: message::WeakReply) {
        let done = self.0.weak.lock().remove(&reply.cmd_id);
        match done {
        | Some(done) => self.complete(done, Completion { cmd_id: reply.cmd_id, value: reply.value, path: Path::Weak }),
        | None => trace!("client {} dropping late weak reply for {:?}", self.0.id, reply.cmd_id),
        }
    }

    fn complete(&self, done: oneshot::Sender<Completion>, completion: Completion) {
        {
            let mut stats = self.0.stats.lock();
            match completion.path {
            | Path::Fast => stats.fast += 1,
            | Path::Slow => stats.slow += 1,
            | Path::Weak => stats.weak += 1,
            }
        }
        debug!("client {} completed {:?} via {:?}", self.0.id, completion.cmd_id, completion.path);
        // Caller may have stopped waiting
        done.send(completion).ok();
    }
}

/// Hands out client identifiers.
#[derive(Debug, Default)]
pub struct ClientFactory {
    next: AtomicU32,
}

impl ClientFactory {
    pub fn new(first: ClientId) -> Self {
        ClientFactory { next: AtomicU32::new(first) }
    }

    pub fn next_id(&self) -> ClientId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Creates a client with a fresh id. `sender` builds the client's
    /// outbound link from that id.
    pub fn build<T, F>(&self, config: Config, bound: ReplicaId, sender: F) -> Result<Client<T>, ConfigError>
        where T: Sender,
              F: FnOnce(ClientId) -> T,
    {
        let id = self.next_id();
        Client::new(id, bound, config, sender(id))
    }
}

/// Picks the replica with the smallest measured latency, preferring the
/// lower id on ties.
pub fn closest_replica(latencies: &[(ReplicaId, Duration)]) -> Option<ReplicaId> {
    latencies
        .iter()
        .min_by_key(|(id, latency)| (*latency, *id))
        .map(|(id, _)| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_path_requires_consistent_witnesses() {
        let leader = Vote { ok: Ack::True, weak_dep: None, value: Some(Value::from("v")) };
        let dep = CommandId { client_id: 4, seq_num: 2 };
        let agree = |ok, weak_dep| Vote { ok, weak_dep, value: None };

        assert_eq!(fast_value(Some(&leader), &[agree(Ack::True, None), agree(Ack::Ordered, None)]), Some(Value::from("v")));
        assert_eq!(fast_value(Some(&leader), &[agree(Ack::True, Some(dep)), agree(Ack::True, Some(dep))]), Some(Value::from("v")));
        assert_eq!(fast_value(Some(&leader), &[agree(Ack::True, Some(dep)), agree(Ack::True, None)]), None);
        assert_eq!(fast_value(Some(&leader), &[agree(Ack::False, None)]), None);
        assert_eq!(fast_value(None, &[agree(Ack::True, None)]), None);

        let refused = Vote { ok: Ack::False, ..leader };
        assert_eq!(fast_value(Some(&refused), &[]), None);
    }

    #[test]
    fn closest_replica_breaks_ties_by_id() {
        let ms = Duration::from_millis;
        assert_eq!(closest_replica(&[(2, ms(5)), (0, ms(9)), (1, ms(5))]), Some(1));
        assert_eq!(closest_replica(&[(3, ms(1))]), Some(3));
        assert_eq!(closest_replica(&[]), None);
    }

    #[test]
    fn factory_hands_out_distinct_ids() {
        let factory = ClientFactory::new(10);
        assert_eq!(factory.next_id(), 10);
        assert_eq!(factory.next_id(), 11);
    }
}
