use serde_derive::{Deserialize, Serialize};

/// Scenario file: a cluster to boot and the commands to run against it.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Execution {
    pub cluster: Cluster,
    pub commands: Vec<Command>,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
pub struct Cluster {
    /// Total number of replicas
    pub replicas: usize,

    #[serde(default)]
    pub leader: usize,

    #[serde(default = "default_variant")]
    pub variant: curp::Variant,

    /// One entry per client, indexed by position
    #[serde(default)]
    pub clients: Vec<Client>,

    #[serde(default)]
    pub batching: bool,

    #[serde(default)]
    pub batch_delay_ms: Option<u64>,

    /// Maximum random delivery delay
    #[serde(default)]
    pub jitter_ms: Option<u64>,

    #[serde(default)]
    pub max_desc_tasks: Option<usize>,

    /// Per-command completion timeout
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, Default)]
pub struct Client {
    /// Measured latency to each replica; the closest one becomes the
    /// client's bound replica
    #[serde(default)]
    pub latencies_ms: Vec<u64>,
}

fn default_variant() -> curp::Variant {
    curp::Variant::Ht
}

fn default_timeout() -> u64 {
    5000
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[derive(Clone, Debug)]
pub enum Command {
    /// Strong write
    Put {
        client: usize,
        key: i64,
        value: String,
    },

    /// Strong read
    Get {
        client: usize,
        key: i64,
    },

    /// Strong range read of `count` keys
    Scan {
        client: usize,
        key: i64,
        count: usize,
    },

    /// Weak write through the leader (leader-only variant)
    WeakPut {
        client: usize,
        key: i64,
        value: String,
    },

    WeakGet {
        client: usize,
        key: i64,
    },

    /// Weak write answered by the bound replica (every-replica variant)
    CausalPut {
        client: usize,
        key: i64,
        value: String,
    },

    CausalGet {
        client: usize,
        key: i64,
    },

    /// Sleep the harness for `ms` milliseconds
    Sleep {
        ms: u64,
    },

    /// Print client and batching statistics
    Stats,
}
