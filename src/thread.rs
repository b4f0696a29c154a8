//! # Summary
//!
//! This module contains the concurrently running actors of the protocol.
//!
//! `replica` is the single dispatch loop of a server: it routes every inbound
//! message to the per-slot command descriptors in `descriptor`, which run
//! either on their own task or inline on the dispatcher. `causal` holds the
//! background replication of weak commands, `batcher` coalesces outgoing
//! replication traffic, and `client` is the client-side quorum certifier.

/// Outgoing Accept/AcceptAck coalescing.
pub mod batcher;

/// Weak command replication.
pub(crate) mod causal;

/// Client-side certificates.
pub mod client;

/// Per-slot state machine.
pub(crate) mod descriptor;

/// Message dispatch and role logic.
pub mod replica;
