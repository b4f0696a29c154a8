//! # Summary
//!
//! Speculative, witness-based replication in the CURP family. A command
//! normally completes in one round trip: the leader executes it
//! speculatively and replies at once, while every other replica records it
//! in a witness pool and acknowledges it to the client. When the witnesses
//! disagree the client falls back to a majority quorum behind the leader's
//! committed, totally ordered execution.
//!
//! Two variants share the same pipeline and differ only in how they treat
//! weak (causal) commands; see [`Variant`].

#[macro_use] extern crate derivative;
#[macro_use] extern crate log;

mod config;
mod message;
mod notify;
mod policy;
mod quorum;
mod shard;
mod shared;
mod shutdown;
mod state;
mod thread;
mod witness;

pub use crate::config::{Config, ConfigError, Variant};
pub use crate::message::{
    Accept, AcceptAck, Ack, Ballot, Batch, ClientId, CommandId, Commit,
    Propose, RecordAck, Reply, ReplicaId, SeqNum, Slot, Sync, WeakPropose, WeakReply,
};
pub use crate::notify::{Registry, Wait};
pub use crate::policy::{AllReplicas, LeaderOnly, WeakPath};
pub use crate::quorum::{Certificate, Threshold};
pub use crate::shard::{ShardKey, ShardedMap};
pub use crate::shared::{Endpoint, Link, Sender, Shared};
pub use crate::shutdown::Shutdown;
pub use crate::state::{Command, Key, Op, State, Value};
pub use crate::thread::batcher::{BatchStats, Batcher};
pub use crate::thread::client::{self, closest_replica, Client, ClientFactory, Completion, Path, Stats};
pub use crate::thread::replica::{self, Replica};
pub use crate::witness::{Record, UnsyncedEntry, Witness};
