//! # Summary
//!
//! Deterministic in-memory key-value store replicated by `curp`.
//!
//! - `GET k` returns the value stored at `k`, or NIL.
//! - `PUT k v` stores `v` at `k` and returns it. Evaluated without
//!   mutation, a PUT returns NIL.
//! - `SCAN k n` returns the values of the first `n` stored keys at or after
//!   `k`, joined by `,`.
//! - `NONE` returns NIL.

#[macro_use] extern crate log;

use std::collections::BTreeMap;

use curp::{Command, Key, Op, Value};
use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Store {
    data: BTreeMap<Key, Value>,

    /// Commands applied so far
    applied: usize,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: Key) -> Option<&Value> {
        self.data.get(&key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn applied(&self) -> usize {
        self.applied
    }

    fn scan(&self, from: Key, count: &Value) -> Value {
        let count = String::from_utf8_lossy(count.as_bytes())
            .trim()
            .parse::<usize>()
            .unwrap_or(0);
        let values = self.data
            .range(from..)
            .take(count)
            .map(|(_, value)| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect::<Vec<_>>();
        Value::from(values.join(","))
    }
}

impl curp::State for Store {
    fn execute(&mut self, command: &Command) -> Value {
        self.applied += 1;
        match command.op {
        | Op::Put => {
            trace!("storing {} at key {}", command.value, command.key);
            self.data.insert(command.key, command.value.clone());
            command.value.clone()
        }
        | _ => self.compute_result(command),
        }
    }

    fn compute_result(&self, command: &Command) -> Value {
        match command.op {
        | Op::Get => self.data.get(&command.key).cloned().unwrap_or_default(),
        | Op::Put | Op::None => Value::nil(),
        | Op::Scan => self.scan(command.key, &command.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use curp::State;

    use super::*;

    #[test]
    fn put_then_get() {
        let mut store = Store::new();
        assert!(store.execute(&Command::get(1)).is_nil());
        assert_eq!(store.execute(&Command::put(1, "a")), Value::from("a"));
        assert_eq!(store.execute(&Command::get(1)), Value::from("a"));
        assert_eq!(store.applied(), 3);
    }

    #[test]
    fn evaluation_does_not_mutate() {
        let mut store = Store::new();
        store.execute(&Command::put(1, "a"));
        assert!(store.compute_result(&Command::put(1, "b")).is_nil());
        assert_eq!(store.compute_result(&Command::get(1)), Value::from("a"));
        assert_eq!(store.get(1), Some(&Value::from("a")));
    }

    #[test]
    fn scan_walks_keys_in_order() {
        let mut store = Store::new();
        for (key, value) in &[(5, "e"), (1, "a"), (3, "c"), (9, "i")] {
            store.execute(&Command::put(*key, *value));
        }
        assert_eq!(store.compute_result(&Command::scan(2, 2)), Value::from("c,e"));
        assert_eq!(store.compute_result(&Command::scan(0, 10)), Value::from("a,c,e,i"));
        assert!(store.compute_result(&Command::scan(10, 3)).is_nil());
        assert!(store.execute(&Command::none()).is_nil());
    }
}
