//! # Summary
//!
//! Strategy objects for the weak (causal) command path. The descriptor state
//! machine, quorum certificates and notification registries are shared by
//! both protocol variants; only the answers below differ.

/// Decides who handles weak commands and when they are answered.
pub trait WeakPath: Send + Sync + 'static {
    /// Whether this replica accepts weak proposals at all.
    fn accepts(&self, is_leader: bool) -> bool;

    /// Whether this replica records weak commands in its witness pool on arrival.
    fn witnesses(&self, is_leader: bool) -> bool;

    /// Whether a speculative reply goes out as soon as the command arrives.
    fn replies_speculatively(&self) -> bool;

    /// Whether the leader replies once the command has committed and executed.
    fn replies_after_execute(&self) -> bool;
}

/// Only the leader sees weak commands; clients wait two round trips.
#[derive(Copy, Clone, Debug, Default)]
pub struct LeaderOnly;

impl WeakPath for LeaderOnly {
    fn accepts(&self, is_leader: bool) -> bool {
        is_leader
    }

    fn witnesses(&self, is_leader: bool) -> bool {
        is_leader
    }

    fn replies_speculatively(&self) -> bool {
        false
    }

    fn replies_after_execute(&self) -> bool {
        true
    }
}

/// Every replica witnesses weak commands and answers at once; the client
/// listens to its bound replica only.
#[derive(Copy, Clone, Debug, Default)]
pub struct AllReplicas;

impl WeakPath for AllReplicas {
    fn accepts(&self, _: bool) -> bool {
        true
    }

    fn witnesses(&self, _: bool) -> bool {
        true
    }

    fn replies_speculatively(&self) -> bool {
        true
    }

    fn replies_after_execute(&self) -> bool {
        false
    }
}
