//! # Summary
//!
//! This module implements the per-slot command descriptor: the state machine
//! that carries one slot from proposal through acceptance and commit to
//! execution.
//!
//! Messages for a slot are funneled to a dedicated task while the number of
//! live tasks stays under `max_desc_tasks`. Past that ceiling, or outside a
//! Tokio runtime, they are processed inline on the caller. Either way a
//! slot's messages are handled one at a time in arrival order.
//!
//! A committed slot executes only once the slot before it has executed. If
//! it has not, the slot registers itself as its predecessor's successor and
//! is delivered again when the predecessor finishes. The handoff is decided
//! under the predecessor's successor lock, so a wakeup is never lost.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::message;
use crate::message::{CommandId, Slot};
use crate::quorum::{Certificate, Threshold};
use crate::shared::Sender;
use crate::state::{Command, State};
use crate::thread::replica::{self, Inner};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Created, command may be unknown
    Start,
    /// Command known, being replicated
    Accept,
    /// Quorum reached, eligible to execute
    Commit,
}

/// Leader-side creation of a descriptor.
#[derive(Clone, Debug)]
pub(crate) struct Proposal {
    pub(crate) cmd_id: CommandId,
    pub(crate) command: Command,

    /// Previous pending slot on the same key
    pub(crate) dep: Option<Slot>,

    pub(crate) weak: bool,

    /// Send the committed result to the client without waiting for a Sync
    pub(crate) sync: bool,

    /// Weak only: answer the client from execution instead of from the
    /// replication task
    pub(crate) reply: bool,

    /// Weak only: answer with a CausalReply
    pub(crate) causal: bool,
}

#[derive(Debug)]
pub(crate) enum Event {
    Propose(Proposal),
    Accept(message::Accept),
    AcceptAck(message::AcceptAck),
    Commit(message::Commit),

    /// The previous slot has executed
    Deliver,
}

impl Event {
    /// Ballot carried by the event, if it came from another replica.
    fn ballot(&self) -> Option<message::Ballot> {
        match self {
        | Event::Accept(accept) => Some(accept.ballot),
        | Event::AcceptAck(ack) => Some(ack.ballot),
        | Event::Commit(commit) => Some(commit.ballot),
        | Event::Propose(_) | Event::Deliver => None,
        }
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct Descriptor {
    cmd_id: Option<CommandId>,
    command: Option<Command>,
    phase: Phase,
    dep: Option<Slot>,
    weak: bool,
    sync: bool,
    reply: bool,
    causal: bool,
    accepted: bool,
    applied: bool,

    /// Leader only: AcceptAcks toward commit
    #[derivative(Debug = "ignore")]
    certificate: Option<Certificate<message::AcceptAck, ()>>,
}

impl Default for Descriptor {
    fn default() -> Self {
        Descriptor {
            cmd_id: None,
            command: None,
            phase: Phase::Start,
            dep: None,
            weak: false,
            sync: false,
            reply: false,
            causal: false,
            accepted: false,
            applied: false,
            certificate: None,
        }
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct Handle {
    slot: Slot,
    desc: Mutex<Descriptor>,

    /// Slot waiting for this one to execute
    successor: Mutex<Option<Slot>>,

    /// Inbound queue of the slot's task, if it has one
    #[derivative(Debug = "ignore")]
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl Handle {
    fn new(slot: Slot, tx: Option<mpsc::UnboundedSender<Event>>) -> Self {
        Handle {
            slot,
            desc: Mutex::new(Descriptor::default()),
            successor: Mutex::new(None),
            tx,
        }
    }
}

/// Result of processing one event.
enum Step {
    Pending,
    /// Executed; carries the successor to deliver to
    Executed(Option<Slot>),
}

/// Delivers `event` to `slot`, then follows the chain of successors that
/// became executable. Iterates instead of recursing so long chains are
/// processed in constant stack space.
pub(crate) fn route<S: State, T: Sender>(inner: &Arc<Inner<S, T>>, slot: Slot, event: Event) {
    let mut next = Some((slot, event));
    while let Some((slot, event)) = next.take() {
        // Stale messages must not open descriptors for slots nobody uses
        if event.ballot().map_or(false, |ballot| ballot != inner.config.ballot) {
            trace!("replica {} dropping stale {:?} for slot {}", inner.id, event, slot);
            continue
        }
        let create = match event {
        | Event::Deliver => false,
        | _ => true,
        };
        let handle = match lookup(inner, slot, create) {
        | Some(handle) => handle,
        | None => {
            trace!("replica {} dropping {:?} for retired slot {}", inner.id, event, slot);
            continue
        }
        };
        match &handle.tx {
        | Some(tx) => {
            if tx.send(event).is_err() {
                trace!("replica {} slot {} task already finished", inner.id, slot);
            }
        }
        | None => {
            if let Step::Executed(Some(successor)) = process(inner, &handle, event) {
                next = Some((successor, Event::Deliver));
            }
        }
        }
    }
}

/// Finds the descriptor for `slot`, creating it if asked. Executed slots
/// have no descriptor.
fn lookup<S: State, T: Sender>(inner: &Arc<Inner<S, T>>, slot: Slot, create: bool) -> Option<Arc<Handle>> {
    inner.descs.upsert(slot, |current| match current {
    | Some(handle) => (Some(handle.clone()), Some(handle)),
    | None if create && !inner.is_executed(slot) => {
        let handle = open(inner, slot);
        (Some(handle.clone()), Some(handle))
    }
    | None => (None, None),
    })
}

fn open<S: State, T: Sender>(inner: &Arc<Inner<S, T>>, slot: Slot) -> Arc<Handle> {
    let runtime = match tokio::runtime::Handle::try_current() {
    | Ok(runtime) if inner.live_tasks.load(Ordering::SeqCst) < inner.config.max_desc_tasks => runtime,
    | _ => return Arc::new(Handle::new(slot, None)),
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = Arc::new(Handle::new(slot, Some(tx)));
    inner.live_tasks.fetch_add(1, Ordering::SeqCst);
    runtime.spawn(drive(inner.clone(), handle.clone(), rx));
    handle
}

/// Task body for a slot: processes events in order until the slot executes.
async fn drive<S: State, T: Sender>(
    inner: Arc<Inner<S, T>>,
    handle: Arc<Handle>,
    mut rx: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(event) = rx.recv().await {
        if let Step::Executed(successor) = process(&inner, &handle, event) {
            if let Some(successor) = successor {
                route(&inner, successor, Event::Deliver);
            }
            break
        }
    }
    inner.live_tasks.fetch_sub(1, Ordering::SeqCst);
}

fn process<S: State, T: Sender>(inner: &Arc<Inner<S, T>>, handle: &Handle, event: Event) -> Step {
    let slot = handle.slot;
    let mut desc = handle.desc.lock();
    if desc.applied {
        return Step::Pending
    }

    match event {
    | Event::Propose(proposal) => on_propose(inner, slot, &mut desc, proposal),
    | Event::Accept(accept) => on_accept(inner, slot, &mut desc, accept),
    | Event::AcceptAck(ack) => on_accept_ack(inner, slot, &mut desc, ack),
    | Event::Commit(_) => on_commit(inner, slot, &mut desc),
    | Event::Deliver => (),
    }

    if !try_execute(inner, slot, &mut desc) {
        return Step::Pending
    }

    drop(desc);
    inner.descs.remove(&slot);
    let successor = handle.successor.lock().take();
    Step::Executed(successor)
}

fn on_propose<S: State, T: Sender>(inner: &Inner<S, T>, slot: Slot, desc: &mut Descriptor, proposal: Proposal) {
    desc.cmd_id = Some(proposal.cmd_id);
    desc.command = Some(proposal.command);
    desc.dep = proposal.dep;
    desc.weak = proposal.weak;
    desc.sync = proposal.sync;
    desc.reply = proposal.reply;
    desc.causal = proposal.causal;
    desc.accepted = true;
    if desc.phase == Phase::Start {
        desc.phase = Phase::Accept;
    }
    debug!("replica {} slot {} accepting {:?}", inner.id, slot, proposal.cmd_id);

    let mut certificate = Certificate::<message::AcceptAck, ()>::new(Threshold::Majority, inner.config.replicas, inner.config.leader, |_, _| ());
    let own = message::AcceptAck { ballot: inner.config.ballot, slot, replica: inner.id };
    let quorum = certificate.add(inner.id, own);
    desc.certificate = Some(certificate);
    if quorum.is_some() {
        commit_as_leader(inner, slot, desc);
    }
}

fn on_accept<S: State, T: Sender>(inner: &Inner<S, T>, slot: Slot, desc: &mut Descriptor, accept: message::Accept) {
    if desc.accepted {
        return
    }
    desc.accepted = true;
    desc.cmd_id = Some(accept.cmd_id);
    if accept.command.is_some() {
        desc.command = accept.command;
    }
    desc.weak = accept.weak;
    if desc.phase == Phase::Start {
        desc.phase = Phase::Accept;
    }
    debug!("replica {} slot {} accepted {:?}", inner.id, slot, accept.cmd_id);

    inner.send_accept_ack(message::AcceptAck { ballot: inner.config.ballot, slot, replica: inner.id });
    inner.order(slot, accept.cmd_id, accept.weak);
}

fn on_accept_ack<S: State, T: Sender>(inner: &Inner<S, T>, slot: Slot, desc: &mut Descriptor, ack: message::AcceptAck) {
    let quorum = match &mut desc.certificate {
    | Some(certificate) => certificate.add(ack.replica, ack),
    | None => {
        trace!("replica {} has no certificate for slot {}", inner.id, slot);
        None
    }
    };
    if quorum.is_some() {
        commit_as_leader(inner, slot, desc);
    }
}

fn commit_as_leader<S: State, T: Sender>(inner: &Inner<S, T>, slot: Slot, desc: &mut Descriptor) {
    debug!("leader {} slot {} reached quorum", inner.id, slot);
    inner.sender.send_to_all(replica::In::Commit(message::Commit { ballot: inner.config.ballot, slot }));
    on_commit(inner, slot, desc);
}

fn on_commit<S: State, T: Sender>(inner: &Inner<S, T>, slot: Slot, desc: &mut Descriptor) {
    if desc.phase == Phase::Commit {
        return
    }
    desc.phase = Phase::Commit;
    inner.committed.insert(slot, ());
    inner.commits.notify(&slot);
    debug!("replica {} slot {} committed", inner.id, slot);
}

/// Executes the slot if it is committed, its command is known and the
/// previous slot has executed. Otherwise leaves a successor pointer on the
/// previous slot when that is what it waits for.
fn try_execute<S: State, T: Sender>(inner: &Arc<Inner<S, T>>, slot: Slot, desc: &mut Descriptor) -> bool {
    if desc.applied || desc.phase != Phase::Commit || desc.command.is_none() || desc.cmd_id.is_none() {
        return false
    }
    if slot > 0 && !inner.is_executed(slot - 1) {
        if let Some(previous) = lookup(inner, slot - 1, true) {
            let mut successor = previous.successor.lock();
            if !inner.is_executed(slot - 1) {
                *successor = Some(slot);
                trace!("replica {} slot {} waits for slot {}", inner.id, slot, slot - 1);
                return false
            }
        }
    }
    execute(inner, slot, desc);
    true
}

fn execute<S: State, T: Sender>(inner: &Inner<S, T>, slot: Slot, desc: &mut Descriptor) {
    let (cmd_id, command) = match (desc.cmd_id, &desc.command) {
    | (Some(cmd_id), Some(command)) => (cmd_id, command.clone()),
    | _ => panic!("[INTERNAL ERROR]: executing slot without a command"),
    };

    let value = inner.state.lock().execute(&command);
    desc.applied = true;
    inner.values.insert(cmd_id, value.clone());

    if inner.witness.is_leader() {
        inner.witness.release(slot, cmd_id, &command, !desc.weak);
    } else {
        inner.retire(cmd_id);
    }
    inner.clear_pending(cmd_id, &command);

    if desc.weak {
        inner.weak_executed.upsert(cmd_id.client_id, |current| {
            (Some(current.map_or(cmd_id.seq_num, |seq| seq.max(cmd_id.seq_num))), ())
        });
    }

    inner.executed.store(slot + 1, Ordering::SeqCst);
    inner.committed.remove(&slot);
    inner.executions.notify(&slot);
    if desc.weak {
        inner.weak_deps.notify(&cmd_id.client_id);
    }
    debug!("replica {} executed slot {} ({:?}, dep: {:?})", inner.id, slot, cmd_id, desc.dep);

    if !inner.is_leader() {
        return
    }
    if desc.weak {
        if desc.reply {
            inner.send_weak_reply(cmd_id, value, desc.causal);
        }
    } else {
        let waiting = inner.sync_waiters.remove(&cmd_id).is_some();
        if desc.sync || waiting {
            inner.send_sync_reply(cmd_id, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_start_empty() {
        let desc = Descriptor::default();
        assert_eq!(desc.phase, Phase::Start);
        assert!(!desc.accepted && !desc.applied);
        assert!(desc.certificate.is_none());
    }
}
