use crate::store::Version;
use cells::{KeyRange, OwnedKey};
use proto_tablet::{Lock, TableId};
use std::collections::HashMap;

enum LockState {
    Valid { counter: u64, snapshot: Version, ranges: Vec<KeyRange> },
    Broken { counter: u64 },
}

/// Optimistic locks taken by reads. A lock is broken by any committed write
/// into its covered key space; once broken it stays broken and reports a
/// strictly larger counter than it was acquired with.
pub struct LockTable {
    shard_id: u64,
    table: TableId,
    generation: u32,
    next_counter: u64,
    locks: HashMap<u64, LockState>,
}

impl LockTable {
    pub fn new(shard_id: u64, table: TableId, generation: u32) -> Self {
        Self { shard_id, table, generation, next_counter: 1, locks: HashMap::new() }
    }

    fn make_lock(&self, lock_tx_id: u64, counter: u64) -> Lock {
        Lock {
            lock_id: lock_tx_id,
            data_shard: self.shard_id,
            generation: self.generation,
            counter,
            scheme_shard: self.table.owner_id,
            path_id: self.table.table_id,
        }
    }

    /// Attaches `range` to the lock of `lock_tx_id`, creating the lock at
    /// `snapshot` when absent. Returns the lock plus whether it is broken.
    pub fn attach(&mut self, lock_tx_id: u64, range: KeyRange, snapshot: Version) -> (Lock, bool) {
        match self.locks.get_mut(&lock_tx_id) {
            Some(LockState::Broken { counter }) => {
                let counter = *counter;
                (self.make_lock(lock_tx_id, counter), true)
            }
            Some(LockState::Valid { counter, ranges, .. }) => {
                let counter = *counter;
                ranges.push(range);
                (self.make_lock(lock_tx_id, counter), false)
            }
            None => {
                let counter = self.next_counter;
                self.next_counter += 1;
                self.locks.insert(
                    lock_tx_id,
                    LockState::Valid { counter, snapshot, ranges: vec![range] },
                );
                (self.make_lock(lock_tx_id, counter), false)
            }
        }
    }

    pub fn get(&self, lock_tx_id: u64) -> Option<(Lock, bool)> {
        match self.locks.get(&lock_tx_id)? {
            LockState::Valid { counter, .. } => Some((self.make_lock(lock_tx_id, *counter), false)),
            LockState::Broken { counter } => Some((self.make_lock(lock_tx_id, *counter), true)),
        }
    }

    /// Breaks every valid lock whose covered space contains `key`.
    /// Both range borders count as covered.
    pub fn break_by_write(&mut self, key: &OwnedKey) {
        let broken: Vec<u64> = self
            .locks
            .iter()
            .filter_map(|(id, state)| match state {
                LockState::Valid { ranges, .. }
                    if ranges.iter().any(|r| r.contains(key.cells())) =>
                {
                    Some(*id)
                }
                _ => None,
            })
            .collect();
        for id in broken {
            self.break_lock(id);
        }
    }

    /// Breaks one lock, assigning it a fresh (strictly larger) counter.
    pub fn break_lock(&mut self, lock_tx_id: u64) {
        if let Some(state) = self.locks.get_mut(&lock_tx_id) {
            if matches!(state, LockState::Valid { .. }) {
                let counter = self.next_counter;
                self.next_counter += 1;
                tracing::debug!(lock_tx_id, counter, "lock broken");
                *state = LockState::Broken { counter };
            }
        }
    }

    /// Snapshot the lock was taken at, while it remains valid.
    pub fn snapshot_of(&self, lock_tx_id: u64) -> Option<Version> {
        match self.locks.get(&lock_tx_id)? {
            LockState::Valid { snapshot, .. } => Some(*snapshot),
            LockState::Broken { .. } => None,
        }
    }

    pub fn erase(&mut self, lock_tx_id: u64) {
        self.locks.remove(&lock_tx_id);
    }
}
