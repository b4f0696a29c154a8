use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{Ballot, ReplicaId};
use crate::policy;
use crate::quorum::Threshold;

/// Selects how weak (causal) commands travel through the cluster.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Variant {
    /// Leader-only weak path, reply after commit and execution.
    Ht,
    /// Every replica witnesses weak commands and replies speculatively.
    Ho,
}

impl Variant {
    pub(crate) fn policy(self) -> Box<dyn policy::WeakPath> {
        match self {
        | Variant::Ht => Box::new(policy::LeaderOnly),
        | Variant::Ho => Box::new(policy::AllReplicas),
        }
    }
}

impl std::str::FromStr for Variant {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
        | "ht" | "curp-ht" => Ok(Variant::Ht),
        | "ho" | "curp-ho" => Ok(Variant::Ho),
        | other => Err(ConfigError::Variant(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cluster must contain at least one replica")]
    Empty,

    #[error("leader {leader} is out of range for {replicas} replicas")]
    Leader { leader: ReplicaId, replicas: usize },

    #[error("replica {id} is out of range for {replicas} replicas")]
    Replica { id: ReplicaId, replicas: usize },

    #[error("{0} timeout must be non-zero")]
    Timeout(&'static str),

    #[error("unknown protocol variant `{0}`")]
    Variant(String),

    #[error("batching requires a running Tokio runtime")]
    Runtime,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Total number of replicas
    pub replicas: usize,

    /// Replica that orders strong commands
    pub leader: ReplicaId,

    /// Current leader epoch
    pub ballot: Ballot,

    /// Weak command strategy
    pub variant: Variant,

    /// Ceiling on live per-slot tasks before messages are handled inline
    pub max_desc_tasks: usize,

    /// Coalesce outgoing Accept and AcceptAck traffic
    pub batching: bool,

    /// Artificial wait before each flush to grow batches
    pub batch_delay: Option<Duration>,

    /// Serve strong reads from a pending weak write on the same key
    pub speculative_reads: bool,

    /// Bound on waits for a slot to commit
    pub commit_wait: Duration,

    /// Bound on waits for a slot to execute
    pub execute_wait: Duration,

    /// Bound on waits for a client's previous weak command to execute
    pub causal_wait: Duration,
}

impl Config {
    pub fn new(replicas: usize, leader: ReplicaId) -> Self {
        Config {
            replicas,
            leader,
            ballot: 0,
            variant: Variant::Ht,
            max_desc_tasks: 1024,
            batching: false,
            batch_delay: None,
            speculative_reads: true,
            commit_wait: Duration::from_secs(1),
            execute_wait: Duration::from_secs(5),
            causal_wait: Duration::from_secs(1),
        }
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_ballot(mut self, ballot: Ballot) -> Self {
        self.ballot = ballot;
        self
    }

    pub fn with_max_desc_tasks(mut self, max: usize) -> Self {
        self.max_desc_tasks = max;
        self
    }

    pub fn with_batching(mut self, delay: Option<Duration>) -> Self {
        self.batching = true;
        self.batch_delay = delay;
        self
    }

    pub fn with_speculative_reads(mut self, enabled: bool) -> Self {
        self.speculative_reads = enabled;
        self
    }

    pub fn with_timeouts(mut self, commit: Duration, execute: Duration, causal: Duration) -> Self {
        self.commit_wait = commit;
        self.execute_wait = execute;
        self.causal_wait = causal;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replicas == 0 {
            return Err(ConfigError::Empty)
        }
        if self.leader >= self.replicas {
            return Err(ConfigError::Leader { leader: self.leader, replicas: self.replicas })
        }
        let timeouts = [
            ("commit", self.commit_wait),
            ("execute", self.execute_wait),
            ("causal", self.causal_wait),
        ];
        for (name, timeout) in timeouts.iter() {
            if *timeout == Duration::from_secs(0) {
                return Err(ConfigError::Timeout(*name))
            }
        }
        Ok(())
    }

    /// Checks that `id` names a replica of this cluster.
    pub fn validate_replica(&self, id: ReplicaId) -> Result<(), ConfigError> {
        self.validate()?;
        if id >= self.replicas {
            return Err(ConfigError::Replica { id, replicas: self.replicas })
        }
        Ok(())
    }

    pub fn is_leader(&self, id: ReplicaId) -> bool {
        self.leader == id
    }

    pub fn majority(&self) -> usize {
        Threshold::Majority.size(self.replicas)
    }

    pub fn fast_quorum(&self) -> usize {
        Threshold::ThreeQuarters.size(self.replicas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_sizes() {
        let config = Config::new(3, 0);
        assert_eq!(config.majority(), 2);
        assert_eq!(config.fast_quorum(), 3);

        let config = Config::new(5, 0);
        assert_eq!(config.majority(), 3);
        assert_eq!(config.fast_quorum(), 4);
    }

    #[test]
    fn rejects_bad_clusters() {
        assert_eq!(Config::new(0, 0).validate(), Err(ConfigError::Empty));
        assert_eq!(
            Config::new(3, 3).validate(),
            Err(ConfigError::Leader { leader: 3, replicas: 3 }),
        );
        assert_eq!(
            Config::new(3, 0).validate_replica(4),
            Err(ConfigError::Replica { id: 4, replicas: 3 }),
        );
        let zero = Duration::from_secs(0);
        assert_eq!(
            Config::new(3, 0).with_timeouts(zero, zero, zero).validate(),
            Err(ConfigError::Timeout("commit")),
        );
    }

    #[test]
    fn parses_variants() {
        assert_eq!("HT".parse::<Variant>(), Ok(Variant::Ht));
        assert_eq!("curp-ho".parse::<Variant>(), Ok(Variant::Ho));
        assert!("raft".parse::<Variant>().is_err());
    }
}
