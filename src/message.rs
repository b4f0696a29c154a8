use serde_derive::{Deserialize, Serialize};

use crate::state;

pub type ReplicaId = usize;

pub type ClientId = u32;

pub type SeqNum = u64;

/// Position in the replicated log.
pub type Slot = usize;

/// Leader epoch.
pub type Ballot = u32;

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId {
    pub client_id: ClientId,
    pub seq_num: SeqNum,
}

/// Witness verdict carried by acknowledgements.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Ack {
    /// No conflicting strong write is pending.
    True,
    /// A conflicting strong write is pending, or the dependency is uncommitted.
    False,
    /// The replica has seen the command in the leader's total order.
    Ordered,
}

/// Strong command from a client, sent to every replica.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Propose {
    pub cmd_id: CommandId,
    pub command: state::Command,
}

/// Client request for the leader's committed result.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Sync {
    pub cmd_id: CommandId,
}

/// Weak (causal) command. `causal_dep` is the sequence number of the
/// client's previous weak command.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeakPropose {
    pub cmd_id: CommandId,
    pub command: state::Command,
    pub causal_dep: Option<SeqNum>,
    pub bound_replica: Option<ReplicaId>,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accept {
    pub ballot: Ballot,
    pub cmd_id: CommandId,
    pub slot: Slot,
    pub command: Option<state::Command>,
    pub weak: bool,
}

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AcceptAck {
    pub ballot: Ballot,
    pub slot: Slot,
    pub replica: ReplicaId,
}

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub ballot: Ballot,
    pub slot: Slot,
}

/// Accepts and acknowledgements coalesced into one wire message.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    pub accepts: Vec<Accept>,
    pub acks: Vec<AcceptAck>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.accepts.len() + self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Witness acknowledgement from a non-leader replica.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordAck {
    pub replica: ReplicaId,
    pub ballot: Ballot,
    pub cmd_id: CommandId,
    pub ok: Ack,
    pub weak_dep: Option<CommandId>,
}

/// Leader result, speculative (`Reply`) or committed (`SyncReply`).
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub replica: ReplicaId,
    pub cmd_id: CommandId,
    pub value: state::Value,
    pub ok: Ack,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeakReply {
    pub replica: ReplicaId,
    pub cmd_id: CommandId,
    pub value: state::Value,
}
