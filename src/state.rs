use serde_derive::{Deserialize, Serialize};

/// Key space of the replicated store.
pub type Key = i64;

/// Opaque value returned by the state machine. An empty value is NIL.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Default, Debug, PartialEq, Eq, Hash)]
pub struct Value(pub Vec<u8>);

impl Value {
    pub fn nil() -> Self {
        Value(Vec::new())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value(value.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value(value.into_bytes())
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_nil() {
            write!(fmt, "NIL")
        } else {
            write!(fmt, "{}", String::from_utf8_lossy(&self.0))
        }
    }
}

#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Put,
    Scan,
    None,
}

/// Operation that can be applied to the state machine. The core only looks
/// at `op` and `key` for conflict detection.
#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub op: Op,
    pub key: Key,
    pub value: Value,
}

impl Command {
    pub fn get(key: Key) -> Self {
        Command { op: Op::Get, key, value: Value::nil() }
    }

    pub fn put<V: Into<Value>>(key: Key, value: V) -> Self {
        Command { op: Op::Put, key, value: value.into() }
    }

    /// Reads `count` keys starting at `key`.
    pub fn scan(key: Key, count: usize) -> Self {
        Command { op: Op::Scan, key, value: Value::from(count.to_string()) }
    }

    pub fn none() -> Self {
        Command { op: Op::None, key: 0, value: Value::nil() }
    }

    pub fn is_write(&self) -> bool {
        self.op == Op::Put
    }
}

/// Replicated state machine. Must be deterministic given the same
/// execution order.
pub trait State: Send + 'static {
    /// Applies `command`, mutating the state.
    fn execute(&mut self, command: &Command) -> Value;

    /// Evaluates `command` against the current state without mutating it.
    fn compute_result(&self, command: &Command) -> Value;
}
