//! # Summary
//!
//! Fixed-size sharded map used for every collection touched concurrently by
//! slot tasks. Keys pick their shard directly from their integer value, so
//! slot and client lookups never go through string conversion or a hasher.
//!
//! Mutation goes through [`ShardedMap::upsert`], which runs a combiner under
//! the shard lock; callers never read and then write in two steps.

use hashbrown::HashMap as Map;
use parking_lot::Mutex;

use crate::message::{ClientId, CommandId};
use crate::state::Key;

const SHARDS: usize = 32;

/// Integer-like keys that choose their own shard.
pub trait ShardKey: std::hash::Hash + Eq {
    fn shard(&self) -> usize;
}

impl ShardKey for usize {
    fn shard(&self) -> usize {
        *self
    }
}

impl ShardKey for u32 {
    fn shard(&self) -> usize {
        *self as usize
    }
}

impl ShardKey for i64 {
    fn shard(&self) -> usize {
        *self as usize
    }
}

impl ShardKey for CommandId {
    fn shard(&self) -> usize {
        (self.client_id as usize).wrapping_mul(31).wrapping_add(self.seq_num as usize)
    }
}

impl ShardKey for (ClientId, Key) {
    fn shard(&self) -> usize {
        (self.0 as usize).wrapping_mul(31).wrapping_add(self.1 as usize)
    }
}

pub struct ShardedMap<K, V> {
    shards: Vec<Mutex<Map<K, V>>>,
}

impl<K: ShardKey, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        ShardedMap {
            shards: (0..SHARDS).map(|_| Mutex::new(Map::default())).collect(),
        }
    }
}

impl<K: ShardKey, V> ShardedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, key: &K) -> &Mutex<Map<K, V>> {
        &self.shards[key.shard() % SHARDS]
    }

    /// Atomically replaces the entry for `key` with the combiner's output.
    /// The combiner receives the current value (if any) and returns the new
    /// value (`None` removes the entry) together with a result for the caller.
    pub fn upsert<F, R>(&self, key: K, combine: F) -> R
        where F: FnOnce(Option<V>) -> (Option<V>, R)
    {
        let mut shard = self.shard(&key).lock();
        let current = shard.remove(&key);
        let (next, result) = combine(current);
        if let Some(next) = next {
            shard.insert(key, next);
        }
        result
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).lock().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).lock().remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shard(key).lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: ShardKey, V: Clone> ShardedMap<K, V> {
    pub fn get(&self, key: &K) -> Option<V> {
        self.shard(key).lock().get(key).cloned()
    }
}
