//! # Summary
//!
//! Background replication of weak commands on the leader.
//!
//! A weak command is ordered only after its client's previous weak command
//! has executed here, so one client's weak commands take increasing slots
//! and every replica applies them in issue order. It then travels the
//! regular Accept/Commit pipeline. Each wait is bounded by the configured
//! timeout; on expiry the task logs a warning and carries on.

use std::sync::Arc;

use crate::message;
use crate::message::{CommandId, SeqNum, Slot};
use crate::notify::Wait;
use crate::shared::Sender;
use crate::state::{Command, State};
use crate::thread::descriptor::{self, Event, Proposal};
use crate::thread::replica::Inner;

/// Weak command waiting to be ordered.
#[derive(Clone, Debug)]
pub(crate) struct Weak {
    pub(crate) cmd_id: CommandId,
    pub(crate) command: Command,

    /// Previous weak command of the same client
    pub(crate) causal_dep: Option<SeqNum>,

    /// Answer with a CausalReply instead of a WeakReply
    pub(crate) causal: bool,
}

/// Replicates `weak` on the current runtime. Outside a runtime the command
/// is ordered at once without waiting on its dependency, and its reply, if
/// any, goes out from execution.
pub(crate) fn spawn<S: State, T: Sender>(inner: Arc<Inner<S, T>>, weak: Weak) {
    match tokio::runtime::Handle::try_current() {
    | Ok(runtime) => {
        runtime.spawn(replicate(inner, weak));
    }
    | Err(_) => {
        if !dependency_met(&inner, &weak) {
            warn!("leader {} ordering {:?} before its causal dependency", inner.id, weak.cmd_id);
        }
        order(&inner, &weak, inner.policy.replies_after_execute());
    }
    }
}

async fn replicate<S: State, T: Sender>(inner: Arc<Inner<S, T>>, weak: Weak) {
    let cmd_id = weak.cmd_id;

    if weak.causal_dep.is_some() {
        let wait = inner.weak_deps
            .wait_until(cmd_id.client_id, inner.config.causal_wait, || dependency_met(&inner, &weak))
            .await;
        if wait == Wait::TimedOut {
            warn!(
                "leader {} timed out waiting for causal dependency {:?} of {:?}; proceeding",
                inner.id, weak.causal_dep, cmd_id,
            );
        }
    }

    let slot = order(&inner, &weak, false);

    let wait = inner.commits
        .wait_until(slot, inner.config.commit_wait, || inner.is_committed(slot))
        .await;
    if wait == Wait::TimedOut {
        warn!("leader {} timed out waiting for slot {} to commit; proceeding", inner.id, slot);
    }

    let wait = inner.executions
        .wait_until(slot, inner.config.execute_wait, || inner.is_executed(slot))
        .await;
    if wait == Wait::TimedOut {
        warn!("leader {} timed out waiting for slot {} to execute", inner.id, slot);
        return
    }

    if inner.policy.replies_after_execute() {
        if let Some(value) = inner.values.get(&cmd_id) {
            inner.send_weak_reply(cmd_id, value, weak.causal);
        }
    }
}

fn dependency_met<S: State, T: Sender>(inner: &Inner<S, T>, weak: &Weak) -> bool {
    match weak.causal_dep {
    | None => true,
    | Some(dep) => inner
        .weak_executed(weak.cmd_id.client_id)
        .map_or(false, |executed| executed >= dep),
    }
}

/// Assigns a slot to the weak command and starts replicating it. With
/// `reply` set, the slot answers the client itself once it executes.
fn order<S: State, T: Sender>(inner: &Arc<Inner<S, T>>, weak: &Weak, reply: bool) -> Slot {
    let cmd_id = weak.cmd_id;
    let (slot, dep) = inner.witness.assign(cmd_id, &weak.command, false, &inner.next_slot);
    inner.cmd_slots.insert(cmd_id, slot);
    debug!("leader {} assigned slot {} to weak {:?}", inner.id, slot, cmd_id);

    descriptor::route(inner, slot, Event::Propose(Proposal {
        cmd_id,
        command: weak.command.clone(),
        dep,
        weak: true,
        sync: false,
        reply,
        causal: weak.causal,
    }));

    inner.send_accept(message::Accept {
        ballot: inner.config.ballot,
        cmd_id,
        slot,
        command: Some(weak.command.clone()),
        weak: true,
    });
    slot
}
