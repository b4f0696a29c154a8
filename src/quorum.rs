//! # Summary
//!
//! Generic quorum certificate. A certificate accumulates one message per
//! replica and fires its completion callback exactly once, the moment the
//! threshold is met. Acks arriving after that are ignored.
//!
//! Replicas use a majority certificate per slot to decide commits. Clients
//! run a three-quarters certificate (fast path) and a majority certificate
//! (slow path) side by side for every strong command.

use hashbrown::HashSet as Set;
use serde_derive::{Deserialize, Serialize};

use crate::message::ReplicaId;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Threshold {
    /// ⌊N/2⌋ + 1
    Majority,
    /// ⌈3N/4⌉
    ThreeQuarters,
}

impl Threshold {
    pub fn size(self, replicas: usize) -> usize {
        match self {
        | Threshold::Majority => replicas / 2 + 1,
        | Threshold::ThreeQuarters => (3 * replicas + 3) / 4,
        }
    }
}

type Callback<M, R> = Box<dyn FnOnce(Option<&M>, &[M]) -> R + Send>;

type Predicate<M> = Box<dyn Fn(&M) -> bool + Send>;

pub struct Certificate<M, R> {
    /// Messages needed before firing
    threshold: usize,

    /// Replica whose message is kept apart from the rest
    leader: ReplicaId,

    /// Refuse to fire until the leader's message is in
    leader_required: bool,

    /// Filter for messages that count toward the threshold
    accept: Predicate<M>,

    /// Replicas already counted
    received: Set<ReplicaId>,

    leader_message: Option<M>,

    messages: Vec<M>,

    /// Taken on firing
    on_complete: Option<Callback<M, R>>,
}

impl<M, R> Certificate<M, R> {
    pub fn new<F>(threshold: Threshold, replicas: usize, leader: ReplicaId, on_complete: F) -> Self
        where F: FnOnce(Option<&M>, &[M]) -> R + Send + 'static
    {
        Certificate {
            threshold: threshold.size(replicas),
            leader,
            leader_required: false,
            accept: Box::new(|_| true),
            received: Set::default(),
            leader_message: None,
            messages: Vec::new(),
            on_complete: Some(Box::new(on_complete)),
        }
    }

    pub fn with_leader_required(mut self, required: bool) -> Self {
        self.leader_required = required;
        self
    }

    pub fn with_acceptor<F>(mut self, accept: F) -> Self
        where F: Fn(&M) -> bool + Send + 'static
    {
        self.accept = Box::new(accept);
        self
    }

    /// Counts `message` from replica `from`. Returns the callback's result if
    /// this message completed the certificate.
    pub fn add(&mut self, from: ReplicaId, message: M) -> Option<R> {
        if self.on_complete.is_none() || !(self.accept)(&message) {
            return None
        }
        if !self.received.insert(from) {
            return None
        }
        if from == self.leader {
            self.leader_message = Some(message);
        } else {
            self.messages.push(message);
        }
        if self.received.len() < self.threshold {
            return None
        }
        if self.leader_required && self.leader_message.is_none() {
            return None
        }
        self.on_complete
            .take()
            .map(|on_complete| on_complete(self.leader_message.as_ref(), &self.messages))
    }

    pub fn fired(&self) -> bool {
        self.on_complete.is_none()
    }

    pub fn len(&self) -> usize {
        self.received.len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

impl<M, R> std::fmt::Debug for Certificate<M, R> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Certificate")
            .field("threshold", &self.threshold)
            .field("received", &self.received.len())
            .field("fired", &self.fired())
            .finish()
    }
}
