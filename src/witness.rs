//! # Summary
//!
//! This module implements the witness pool: a per-key record of operations
//! that have been proposed but not yet executed.
//!
//! On the leader an entry holds the slot of the most recent operation on its
//! key, so a new operation learns which slot it depends on. On every other
//! replica an entry holds a pending count, and a strong operation is refused
//! while a strong write on the same key is still pending. Pending weak
//! writes never refuse anything, but they are reported as a `weak_dep`
//! so the client can tell when a strong operation is entangled with an
//! uncommitted causal write.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::message::{Ack, CommandId, Slot};
use crate::shard::ShardedMap;
use crate::state::{Command, Key, Op, Value};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mode {
    Leader,
    Follower,
}

/// Witness record for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsyncedEntry {
    /// Leader: slot of the latest operation. Elsewhere: pending operation count.
    pub slot: usize,
    pub is_strong: bool,
    pub op: Op,
    pub value: Value,
    pub cmd_id: CommandId,

    /// Pending strong writes on this key
    pub strong_writes: usize,

    /// Latest pending weak write on this key
    pub weak_write: Option<(CommandId, Value)>,
}

impl UnsyncedEntry {
    fn new(slot: usize, cmd_id: CommandId, command: &Command, strong: bool) -> Self {
        let mut entry = UnsyncedEntry {
            slot,
            is_strong: strong,
            op: command.op,
            value: command.value.clone(),
            cmd_id,
            strong_writes: 0,
            weak_write: None,
        };
        entry.track(cmd_id, command, strong);
        entry
    }

    fn track(&mut self, cmd_id: CommandId, command: &Command, strong: bool) {
        self.is_strong = strong;
        self.op = command.op;
        self.value = command.value.clone();
        self.cmd_id = cmd_id;
        if command.is_write() {
            if strong {
                self.strong_writes += 1;
            } else {
                self.weak_write = Some((cmd_id, command.value.clone()));
            }
        }
    }

    fn untrack(&mut self, cmd_id: CommandId, command: &Command, strong: bool) {
        if !command.is_write() {
            return
        }
        if strong {
            self.strong_writes = self.strong_writes.saturating_sub(1);
        } else if self.weak_write.as_ref().map(|(id, _)| *id) == Some(cmd_id) {
            self.weak_write = None;
        }
    }

    fn verdict(&self, strong: bool) -> Record {
        let weak_dep = self.weak_write.as_ref().map(|(id, _)| *id);
        if strong && self.strong_writes > 0 {
            Record { ok: Ack::False, weak_dep }
        } else if strong {
            Record { ok: Ack::True, weak_dep }
        } else {
            Record { ok: Ack::True, weak_dep: None }
        }
    }
}

/// Conflict verdict for a witnessed operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub ok: Ack,
    pub weak_dep: Option<CommandId>,
}

impl Record {
    fn clear() -> Self {
        Record { ok: Ack::True, weak_dep: None }
    }
}

pub struct Witness {
    mode: Mode,
    unsynced: ShardedMap<Key, UnsyncedEntry>,

    /// Leader only: weak writes that arrived but have no slot yet
    staged: ShardedMap<Key, (CommandId, Value)>,
}

impl Witness {
    pub fn leader() -> Self {
        Witness { mode: Mode::Leader, unsynced: ShardedMap::new(), staged: ShardedMap::new() }
    }

    pub fn follower() -> Self {
        Witness { mode: Mode::Follower, unsynced: ShardedMap::new(), staged: ShardedMap::new() }
    }

    pub fn is_leader(&self) -> bool {
        self.mode == Mode::Leader
    }

    /// Leader only. Allocates the next slot from `next_slot` and records it as
    /// the latest operation on the command's key, returning the slot and the
    /// previous pending slot for that key. Allocation happens under the key's
    /// lock so slots recorded for one key never decrease.
    pub fn assign(
        &self,
        cmd_id: CommandId,
        command: &Command,
        strong: bool,
        next_slot: &AtomicUsize,
    ) -> (Slot, Option<Slot>) {
        debug_assert!(self.is_leader());
        if !strong {
            self.unstage(cmd_id, command.key);
        }
        self.unsynced.upsert(command.key, |current| {
            let slot = next_slot.fetch_add(1, Ordering::SeqCst);
            match current {
            | None => (Some(UnsyncedEntry::new(slot, cmd_id, command, strong)), (slot, None)),
            | Some(mut entry) => {
                if entry.slot > slot {
                    error!("witness slot {} for key {} exceeds assigned slot {}", entry.slot, command.key, slot);
                    panic!("[INTERNAL ERROR]: witness dependency slot exceeds assigned slot");
                }
                let dep = entry.slot;
                entry.slot = slot;
                entry.track(cmd_id, command, strong);
                (Some(entry), (slot, Some(dep)))
            }
            }
        })
    }

    /// Leader only. Records a weak write on arrival, before it is ordered,
    /// so speculative reads see it while it waits for its causal dependency.
    pub fn stage(&self, cmd_id: CommandId, command: &Command) {
        debug_assert!(self.is_leader());
        if command.is_write() {
            self.staged.insert(command.key, (cmd_id, command.value.clone()));
        }
    }

    fn unstage(&self, cmd_id: CommandId, key: Key) {
        self.staged.upsert(key, |current| match current {
        | Some((staged, _)) if staged == cmd_id => (None, ()),
        | current => (current, ()),
        });
    }

    /// Leader only. Drops the entry once the operation in `slot` has executed,
    /// unless a later operation has already replaced it.
    pub fn release(&self, slot: Slot, cmd_id: CommandId, command: &Command, strong: bool) {
        self.unsynced.upsert(command.key, |current| match current {
        | Some(entry) if entry.slot == slot => (None, ()),
        | Some(mut entry) => {
            entry.untrack(cmd_id, command, strong);
            (Some(entry), ())
        }
        | None => (None, ()),
        })
    }

    /// Follower only. Records a pending operation and returns the verdict
    /// computed against operations that were already pending.
    pub fn record(&self, cmd_id: CommandId, command: &Command, strong: bool) -> Record {
        debug_assert!(!self.is_leader());
        self.unsynced.upsert(command.key, |current| match current {
        | None => (Some(UnsyncedEntry::new(1, cmd_id, command, strong)), Record::clear()),
        | Some(mut entry) => {
            let verdict = entry.verdict(strong);
            entry.slot += 1;
            entry.track(cmd_id, command, strong);
            (Some(entry), verdict)
        }
        })
    }

    /// Follower only. Retires a pending operation after it executed.
    pub fn sync(&self, cmd_id: CommandId, command: &Command, strong: bool) {
        self.unsynced.upsert(command.key, |current| match current {
        | Some(mut entry) => {
            entry.slot = entry.slot.saturating_sub(1);
            entry.untrack(cmd_id, command, strong);
            if entry.slot == 0 {
                (None, ())
            } else {
                (Some(entry), ())
            }
        }
        | None => (None, ()),
        })
    }

    /// Verdict for `command` without recording it.
    pub fn check(&self, command: &Command, strong: bool) -> Record {
        self.unsynced
            .get(&command.key)
            .map(|entry| entry.verdict(strong))
            .unwrap_or_else(Record::clear)
    }

    /// Latest pending weak write on `key`, for cross-tier speculative reads.
    pub fn weak_write(&self, key: Key) -> Option<(CommandId, Value)> {
        self.staged
            .get(&key)
            .or_else(|| self.unsynced.get(&key).and_then(|entry| entry.weak_write))
    }

    pub fn entry(&self, key: Key) -> Option<UnsyncedEntry> {
        self.unsynced.get(&key)
    }

    pub fn len(&self) -> usize {
        self.unsynced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unsynced.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(client_id: u32, seq_num: u64) -> CommandId {
        CommandId { client_id, seq_num }
    }

    #[test]
    fn leader_chains_dependencies_per_key() {
        let witness = Witness::leader();
        let next = AtomicUsize::new(0);
        assert_eq!(witness.assign(id(1, 0), &Command::put(5, "a"), true, &next), (0, None));
        assert_eq!(witness.assign(id(2, 0), &Command::put(6, "b"), true, &next), (1, None));
        assert_eq!(witness.assign(id(3, 0), &Command::get(5), true, &next), (2, Some(0)));
        assert_eq!(witness.entry(5).map(|entry| entry.slot), Some(2));

        // Executing slot 0 leaves the newer entry in place
        witness.release(0, id(1, 0), &Command::put(5, "a"), true);
        assert_eq!(witness.entry(5).map(|entry| entry.slot), Some(2));
        witness.release(2, id(3, 0), &Command::get(5), true);
        assert!(witness.entry(5).is_none());
    }

    #[test]
    #[should_panic(expected = "INTERNAL ERROR")]
    fn leader_aborts_on_decreasing_slot() {
        let witness = Witness::leader();
        let next = AtomicUsize::new(10);
        witness.assign(id(1, 0), &Command::put(5, "a"), true, &next);
        next.store(3, Ordering::SeqCst);
        witness.assign(id(1, 1), &Command::put(5, "b"), true, &next);
    }

    #[test]
    fn pending_strong_write_conflicts() {
        let witness = Witness::follower();
        let put = Command::put(1, "a");
        assert_eq!(witness.record(id(1, 0), &put, true), Record { ok: Ack::True, weak_dep: None });
        assert_eq!(witness.record(id(2, 0), &Command::get(1), true).ok, Ack::False);
        assert_eq!(witness.record(id(3, 0), &Command::put(1, "c"), true).ok, Ack::False);

        // Unrelated keys are unaffected
        assert_eq!(witness.record(id(4, 0), &Command::get(2), true).ok, Ack::True);

        witness.sync(id(1, 0), &put, true);
        witness.sync(id(2, 0), &Command::get(1), true);
        assert_eq!(witness.check(&Command::get(1), true).ok, Ack::False);
        witness.sync(id(3, 0), &Command::put(1, "c"), true);
        assert!(witness.entry(1).is_none());
    }

    #[test]
    fn pending_reads_never_conflict() {
        let witness = Witness::follower();
        witness.record(id(1, 0), &Command::get(1), true);
        witness.record(id(1, 1), &Command::scan(1, 4), true);
        assert_eq!(witness.record(id(2, 0), &Command::put(1, "x"), true).ok, Ack::True);
        assert_eq!(witness.entry(1).map(|entry| entry.slot), Some(3));
    }

    #[test]
    fn pending_weak_write_surfaces_as_dependency() {
        let witness = Witness::follower();
        let causal = id(9, 4);
        witness.record(causal, &Command::put(1, "w"), false);
        let record = witness.record(id(2, 0), &Command::get(1), true);
        assert_eq!(record, Record { ok: Ack::True, weak_dep: Some(causal) });
        assert_eq!(witness.weak_write(1), Some((causal, Value::from("w"))));

        witness.sync(causal, &Command::put(1, "w"), false);
        assert_eq!(witness.weak_write(1), None);
        assert_eq!(witness.check(&Command::get(1), true), Record { ok: Ack::True, weak_dep: None });
    }

    #[test]
    fn staged_weak_write_is_visible_until_ordered() {
        let witness = Witness::leader();
        let next = AtomicUsize::new(0);
        let causal = id(9, 1);
        witness.stage(causal, &Command::put(4, "w"));
        witness.stage(id(9, 2), &Command::get(4));
        assert_eq!(witness.weak_write(4), Some((causal, Value::from("w"))));
        assert!(witness.is_empty());

        assert_eq!(witness.assign(causal, &Command::put(4, "w"), false, &next), (0, None));
        assert_eq!(witness.weak_write(4), Some((causal, Value::from("w"))));
        witness.release(0, causal, &Command::put(4, "w"), false);
        assert_eq!(witness.weak_write(4), None);
    }

    #[test]
    fn weak_operations_are_never_refused() {
        let witness = Witness::follower();
        witness.record(id(1, 0), &Command::put(1, "a"), true);
        assert_eq!(
            witness.record(id(2, 0), &Command::put(1, "b"), false),
            Record { ok: Ack::True, weak_dep: None },
        );
    }
}
