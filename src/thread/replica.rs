//! # Summary
//!
//! This module implements the replica orchestrator: a single dispatch loop
//! that consumes every inbound message kind and routes it either to role
//! logic (leader or witness) or to the command descriptor of the slot it
//! names.
//!
//! The leader assigns slots, answers strong commands speculatively and
//! drives replication. Every other replica witnesses strong commands for the
//! client, accepts the leader's order and executes committed slots in order.
//! How weak commands are treated is decided by the configured [`Variant`]'s
//! policy object.
//!
//! [`Variant`]: crate::config::Variant

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{Config, ConfigError};
use crate::message;
use crate::message::{Ack, ClientId, CommandId, ReplicaId, SeqNum, Slot};
use crate::notify::{Registry, Wait};
use crate::policy::WeakPath;
use crate::shard::ShardedMap;
use crate::shared::Sender;
use crate::shutdown::Shutdown;
use crate::state::{Command, Key, Op, State, Value};
use crate::thread::batcher::{BatchStats, Batcher};
use crate::thread::descriptor::{self, Event, Proposal};
use crate::thread::{causal, client};
use crate::witness::{Record, Witness};

/// Every message a replica can receive.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq)]
pub enum In {
    /// Strong command from a client
    Propose(message::Propose),

    /// Client request for a committed result
    Sync(message::Sync),

    /// Weak command, leader-only variant
    WeakPropose(message::WeakPropose),

    /// Weak command, every-replica variant
    CausalPropose(message::WeakPropose),

    Accept(message::Accept),

    AcceptAck(message::AcceptAck),

    Commit(message::Commit),

    Batch(message::Batch),
}

/// Most recent uncommitted write from one client to one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PendingWrite {
    pub(crate) seq_num: SeqNum,
    pub(crate) value: Value,
}

/// Command recorded in this replica's witness, retired on execution.
#[derive(Clone, Debug)]
pub(crate) struct Witnessed {
    pub(crate) command: Command,
    pub(crate) strong: bool,
}

/// Contiguous prefix of accepted slots on a non-leader.
#[derive(Debug, Default)]
pub(crate) struct Ordered {
    next: Slot,
    accepted: BTreeMap<Slot, (CommandId, bool)>,
}

#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct Replica<S, T>(Arc<Inner<S, T>>);

pub(crate) struct Inner<S, T> {
    pub(crate) id: ReplicaId,
    pub(crate) config: Config,
    pub(crate) sender: Arc<T>,
    pub(crate) policy: Box<dyn WeakPath>,
    pub(crate) state: Mutex<S>,
    pub(crate) witness: Witness,

    /// Leader only: next free slot, shared by strong and weak commands
    pub(crate) next_slot: AtomicUsize,

    /// Live command descriptors
    pub(crate) descs: ShardedMap<Slot, Arc<descriptor::Handle>>,

    /// Descriptors currently served by their own task
    pub(crate) live_tasks: AtomicUsize,

    /// Every slot below this one has executed
    pub(crate) executed: AtomicUsize,

    /// Committed slots that have not executed yet
    pub(crate) committed: ShardedMap<Slot, ()>,

    /// Executed results
    pub(crate) values: ShardedMap<CommandId, Value>,

    /// Leader only: slot assigned to each command
    pub(crate) cmd_slots: ShardedMap<CommandId, Slot>,

    pub(crate) pending_writes: ShardedMap<(ClientId, Key), PendingWrite>,

    /// Highest executed weak sequence number per client
    pub(crate) weak_executed: ShardedMap<ClientId, SeqNum>,

    pub(crate) witnessed: ShardedMap<CommandId, Witnessed>,

    /// Leader only: Sync requests waiting for execution
    pub(crate) sync_waiters: ShardedMap<CommandId, ()>,

    pub(crate) ordered: Mutex<Ordered>,

    pub(crate) commits: Registry<Slot>,
    pub(crate) executions: Registry<Slot>,
    pub(crate) weak_deps: Registry<ClientId>,

    pub(crate) batcher: Option<Batcher>,
}

impl<S: State, T: Sender> Replica<S, T> {
    /// Creates replica `id` of the cluster described by `config`. Batching
    /// starts a flush task and so needs a running Tokio runtime.
    pub fn new(id: ReplicaId, config: Config, state: S, sender: T) -> Result<Self, ConfigError> {
        config.validate_replica(id)?;
        let sender = Arc::new(sender);
        let batcher = if config.batching {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(ConfigError::Runtime)
            }
            Some(Batcher::spawn(sender.clone(), config.batch_delay))
        } else {
            None
        };
        let witness = if config.is_leader(id) {
            Witness::leader()
        } else {
            Witness::follower()
        };
        Ok(Replica(Arc::new(Inner {
            id,
            policy: config.variant.policy(),
            config,
            sender,
            state: Mutex::new(state),
            witness,
            next_slot: AtomicUsize::new(0),
            descs: ShardedMap::new(),
            live_tasks: AtomicUsize::new(0),
            executed: AtomicUsize::new(0),
            committed: ShardedMap::new(),
            values: ShardedMap::new(),
            cmd_slots: ShardedMap::new(),
            pending_writes: ShardedMap::new(),
            weak_executed: ShardedMap::new(),
            witnessed: ShardedMap::new(),
            sync_waiters: ShardedMap::new(),
            ordered: Mutex::new(Ordered::default()),
            commits: Registry::new(),
            executions: Registry::new(),
            weak_deps: Registry::new(),
            batcher,
        })))
    }

    pub fn id(&self) -> ReplicaId {
        self.0.id
    }

    pub fn is_leader(&self) -> bool {
        self.0.is_leader()
    }

    /// Dispatch loop. Runs until the channel closes or `shutdown` fires.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<In>, shutdown: Shutdown) {
        info!("replica {} started (leader: {})", self.0.id, self.is_leader());
        while !shutdown.is_triggered() {
            tokio::select! {
                message = rx.recv() => match message {
                | Some(message) => self.handle(message),
                | None => break,
                },
                _ = shutdown.wait() => break,
            }
        }
        info!("replica {} stopped", self.0.id);
    }

    /// Handles a single inbound message.
    pub fn handle(&self, message: In) {
        trace!("replica {} received {:?}", self.0.id, message);
        match message {
        | In::Propose(propose) => self.respond_propose(propose),
        | In::Sync(sync) => self.respond_sync(sync),
        | In::WeakPropose(weak) => self.respond_weak(weak, false),
        | In::CausalPropose(weak) => self.respond_weak(weak, true),
        | In::Accept(accept) => self.respond_accept(accept),
        | In::AcceptAck(ack) => self.respond_accept_ack(ack),
        | In::Commit(commit) => descriptor::route(&self.0, commit.slot, Event::Commit(commit)),
        | In::Batch(batch) => {
            for accept in batch.accepts {
                self.respond_accept(accept);
            }
            for ack in batch.acks {
                self.respond_accept_ack(ack);
            }
        }
        }
    }

    fn respond_propose(&self, propose: message::Propose) {
        let inner = &self.0;
        let message::Propose { cmd_id, command } = propose;

        if !inner.is_leader() {
            self.witness_propose(cmd_id, command);
            return
        }

        if inner.cmd_slots.contains_key(&cmd_id) {
            debug!("replica {} ignoring duplicate proposal {:?}", inner.id, cmd_id);
            return
        }

        let (slot, dep) = inner.witness.assign(cmd_id, &command, true, &inner.next_slot);
        inner.cmd_slots.insert(cmd_id, slot);
        let value = inner.speculate(cmd_id, &command, true);
        inner.record_pending(cmd_id, &command);

        let ok = match dep {
        | Some(dep) if !inner.is_committed(dep) => Ack::False,
        | _ => Ack::True,
        };
        debug!("leader assigned slot {} to {:?} (dep: {:?}, ok: {:?})", slot, cmd_id, dep, ok);

        descriptor::route(inner, slot, Event::Propose(Proposal {
            cmd_id,
            command: command.clone(),
            dep,
            weak: false,
            sync: ok == Ack::False,
            reply: false,
            causal: false,
        }));

        inner.sender.send_to_client(cmd_id.client_id, client::In::Reply(message::Reply {
            replica: inner.id,
            cmd_id,
            value,
            ok,
        }));

        inner.send_accept(message::Accept {
            ballot: inner.config.ballot,
            cmd_id,
            slot,
            command: Some(command),
            weak: false,
        });
    }

    fn witness_propose(&self, cmd_id: CommandId, command: Command) {
        let inner = &self.0;
        if inner.witnessed.contains_key(&cmd_id) {
            debug!("replica {} ignoring duplicate proposal {:?}", inner.id, cmd_id);
            return
        }
        let record = inner.record_witness(cmd_id, command, true);
        inner.sender.send_to_client(cmd_id.client_id, client::In::RecordAck(message::RecordAck {
            replica: inner.id,
            ballot: inner.config.ballot,
            cmd_id,
            ok: record.ok,
            weak_dep: record.weak_dep,
        }));
    }

    fn respond_sync(&self, sync: message::Sync) {
        let inner = &self.0;
        if !inner.is_leader() {
            return
        }
        let cmd_id = sync.cmd_id;
        if let Some(value) = inner.values.get(&cmd_id) {
            inner.send_sync_reply(cmd_id, value);
            return
        }
        inner.sync_waiters.insert(cmd_id, ());

        // Execution may have slipped in between
        if let Some(value) = inner.values.get(&cmd_id) {
            if inner.sync_waiters.remove(&cmd_id).is_some() {
                inner.send_sync_reply(cmd_id, value);
            }
        }
    }

    fn respond_weak(&self, weak: message::WeakPropose, causal: bool) {
        let inner = &self.0;
        let is_leader = inner.is_leader();
        if !inner.policy.accepts(is_leader) {
            trace!("replica {} ignoring weak command {:?}", inner.id, weak.cmd_id);
            return
        }

        let message::WeakPropose { cmd_id, command, causal_dep, .. } = weak;
        let value = inner.speculate(cmd_id, &command, false);
        inner.record_pending(cmd_id, &command);

        if inner.policy.witnesses(is_leader) {
            if is_leader {
                inner.witness.stage(cmd_id, &command);
            } else {
                inner.record_witness(cmd_id, command.clone(), false);
            }
        }

        if inner.policy.replies_speculatively() {
            inner.send_weak_reply(cmd_id, value, causal);
        }

        if is_leader {
            causal::spawn(self.0.clone(), causal::Weak { cmd_id, command, causal_dep, causal });
        }
    }

    fn respond_accept(&self, accept: message::Accept) {
        descriptor::route(&self.0, accept.slot, Event::Accept(accept));
    }

    fn respond_accept_ack(&self, ack: message::AcceptAck) {
        if self.0.is_leader() {
            descriptor::route(&self.0, ack.slot, Event::AcceptAck(ack));
        }
    }

    /// Number of slots executed so far; every slot below it has executed.
    pub fn executed(&self) -> Slot {
        self.0.executed.load(Ordering::SeqCst)
    }

    pub fn is_committed(&self, slot: Slot) -> bool {
        self.0.is_committed(slot)
    }

    /// Waits until `slot` has executed, for at most `timeout`.
    pub async fn wait_executed(&self, slot: Slot, timeout: Duration) -> Wait {
        let inner = &self.0;
        inner.executions.wait_until(slot, timeout, || inner.is_executed(slot)).await
    }

    /// Executed result of `cmd_id`, if any.
    pub fn value(&self, cmd_id: CommandId) -> Option<Value> {
        self.0.values.get(&cmd_id)
    }

    /// Slot assigned to `cmd_id` by this replica, if it is the leader.
    pub fn slot_of(&self, cmd_id: CommandId) -> Option<Slot> {
        self.0.cmd_slots.get(&cmd_id)
    }

    pub fn batch_stats(&self) -> Option<BatchStats> {
        self.0.batcher.as_ref().map(Batcher::stats)
    }

    /// Runs `f` against the state machine.
    pub fn with_state<F, R>(&self, f: F) -> R where F: FnOnce(&S) -> R {
        f(&self.0.state.lock())
    }
}

impl<S: State, T: Sender> Inner<S, T> {
    pub(crate) fn is_leader(&self) -> bool {
        self.config.is_leader(self.id)
    }

    pub(crate) fn is_executed(&self, slot: Slot) -> bool {
        slot < self.executed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_committed(&self, slot: Slot) -> bool {
        self.committed.contains_key(&slot) || self.is_executed(slot)
    }

    pub(crate) fn weak_executed(&self, client_id: ClientId) -> Option<SeqNum> {
        self.weak_executed.get(&client_id)
    }

    /// Tentative result of `command` before it commits.
    pub(crate) fn speculate(&self, cmd_id: CommandId, command: &Command, strong: bool) -> Value {
        match command.op {
        | Op::Put => return Value::nil(),
        | Op::Get => {
            // Read your own uncommitted write
            if let Some(write) = self.pending_writes.get(&(cmd_id.client_id, command.key)) {
                if write.seq_num < cmd_id.seq_num {
                    return write.value
                }
            }
            if strong && self.config.speculative_reads {
                if let Some((_, value)) = self.witness.weak_write(command.key) {
                    return value
                }
            }
        }
        | Op::Scan | Op::None => (),
        }
        self.state.lock().compute_result(command)
    }

    pub(crate) fn record_pending(&self, cmd_id: CommandId, command: &Command) {
        if !command.is_write() {
            return
        }
        let write = PendingWrite { seq_num: cmd_id.seq_num, value: command.value.clone() };
        self.pending_writes.upsert((cmd_id.client_id, command.key), |current| match current {
        | Some(current) if current.seq_num > write.seq_num => (Some(current), ()),
        | _ => (Some(write), ()),
        });
    }

    pub(crate) fn clear_pending(&self, cmd_id: CommandId, command: &Command) {
        if !command.is_write() {
            return
        }
        self.pending_writes.upsert((cmd_id.client_id, command.key), |current| match current {
        | Some(current) if current.seq_num <= cmd_id.seq_num => (None, ()),
        | current => (current, ()),
        });
    }

    /// Non-leader only. Records the command in the witness pool and makes
    /// sure it is retired even if it already executed here.
    fn record_witness(&self, cmd_id: CommandId, command: Command, strong: bool) -> Record {
        let record = self.witness.record(cmd_id, &command, strong);
        self.witnessed.insert(cmd_id, Witnessed { command, strong });
        if self.values.contains_key(&cmd_id) {
            self.retire(cmd_id);
        }
        record
    }

    /// Non-leader only. Releases the witness record of an executed command.
    pub(crate) fn retire(&self, cmd_id: CommandId) {
        if let Some(witnessed) = self.witnessed.remove(&cmd_id) {
            self.witness.sync(cmd_id, &witnessed.command, witnessed.strong);
        }
    }

    pub(crate) fn send_accept(&self, accept: message::Accept) {
        match &self.batcher {
        | Some(batcher) => batcher.send_accept(accept),
        | None => self.sender.send_to_all(In::Accept(accept)),
        }
    }

    pub(crate) fn send_accept_ack(&self, ack: message::AcceptAck) {
        match &self.batcher {
        | Some(batcher) => batcher.send_ack(ack),
        | None => self.sender.send_to(self.config.leader, In::AcceptAck(ack)),
        }
    }

    pub(crate) fn send_sync_reply(&self, cmd_id: CommandId, value: Value) {
        self.sender.send_to_client(cmd_id.client_id, client::In::SyncReply(message::Reply {
            replica: self.id,
            cmd_id,
            value,
            ok: Ack::True,
        }));
    }

    pub(crate) fn send_weak_reply(&self, cmd_id: CommandId, value: Value, causal: bool) {
        let reply = message::WeakReply { replica: self.id, cmd_id, value };
        let message = if causal {
            client::In::CausalReply(reply)
        } else {
            client::In::WeakReply(reply)
        };
        self.sender.send_to_client(cmd_id.client_id, message);
    }

    /// Non-leader only. Extends the accepted prefix with `slot` and tells
    /// the client of every strong command the prefix newly covers that its
    /// command is ordered.
    pub(crate) fn order(&self, slot: Slot, cmd_id: CommandId, weak: bool) {
        let mut ordered = self.ordered.lock();
        if slot < ordered.next {
            return
        }
        ordered.accepted.insert(slot, (cmd_id, weak));
        loop {
            let next = ordered.next;
            let (cmd_id, weak) = match ordered.accepted.remove(&next) {
            | Some(entry) => entry,
            | None => break,
            };
            ordered.next += 1;
            if !weak {
                self.sender.send_to_client(cmd_id.client_id, client::In::RecordAck(message::RecordAck {
                    replica: self.id,
                    ballot: self.config.ballot,
                    cmd_id,
                    ok: Ack::Ordered,
                    weak_dep: None,
                }));
            }
        }
    }
}
