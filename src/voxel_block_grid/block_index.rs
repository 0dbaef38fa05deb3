//! Block index adapter: coordinate-to-slot resolution over a concurrent map.
//!
//! The grid talks to its hash index only through the [`BlockIndex`] trait, so
//! the collision strategy of the backing map never leaks into the passes.
//! [`ShardedBlockIndex`] is the provided backend; [`TouchScratch`] is the
//! disposable deduplication set the touch pass reuses across frames.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use super::types::BlockCoord;

/// Coordinate-to-slot index over the block lattice.
///
/// Slots index the flat attribute buffers in `0..capacity`. A coordinate
/// resolves to the same slot for as long as it is present, and no slot is
/// ever reassigned to a different coordinate while active. Activation is
/// safe under concurrent insertion of duplicate keys: races resolve to a
/// single slot.
pub trait BlockIndex: Send + Sync {
    /// Insert absent keys and resolve all of them. The mask is `false` for
    /// keys that could not be inserted because capacity is exhausted (their
    /// slot entry is meaningless); no error is raised, the caller decides.
    fn activate(&self, keys: &[BlockCoord]) -> (Vec<u32>, Vec<bool>);

    /// Resolve present keys; mask is `false` for absent ones.
    fn find(&self, keys: &[BlockCoord]) -> (Vec<u32>, Vec<bool>);

    fn find_one(&self, key: BlockCoord) -> Option<u32>;

    /// The live coordinate/slot table, in unspecified order.
    fn active_entries(&self) -> Vec<(BlockCoord, u32)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    /// Drop all entries; slot numbering restarts from zero.
    fn clear(&self);
}

/// Concurrent backend over a sharded hash map plus an atomic slot counter.
pub struct ShardedBlockIndex {
    map: DashMap<BlockCoord, u32>,
    next_slot: AtomicU32,
    capacity: usize,
}

impl ShardedBlockIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: DashMap::with_capacity(capacity),
            next_slot: AtomicU32::new(0),
            capacity,
        }
    }

    fn activate_one(&self, key: BlockCoord) -> Option<u32> {
        match self.map.entry(key) {
            Entry::Occupied(e) => Some(*e.get()),
            Entry::Vacant(vacant) => {
                let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
                if (slot as usize) < self.capacity {
                    vacant.insert(slot);
                    Some(slot)
                } else {
                    // Roll the reservation back; rollbacks can never drop the
                    // counter below the number of slots actually handed out.
                    self.next_slot.fetch_sub(1, Ordering::Relaxed);
                    None
                }
            }
        }
    }
}

impl BlockIndex for ShardedBlockIndex {
    fn activate(&self, keys: &[BlockCoord]) -> (Vec<u32>, Vec<bool>) {
        let mut slots = Vec::with_capacity(keys.len());
        let mut mask = Vec::with_capacity(keys.len());
        for &key in keys {
            match self.activate_one(key) {
                Some(slot) => {
                    slots.push(slot);
                    mask.push(true);
                }
                None => {
                    slots.push(0);
                    mask.push(false);
                }
            }
        }
        (slots, mask)
    }

    fn find(&self, keys: &[BlockCoord]) -> (Vec<u32>, Vec<bool>) {
        let mut slots = Vec::with_capacity(keys.len());
        let mut mask = Vec::with_capacity(keys.len());
        for key in keys {
            match self.map.get(key) {
                Some(slot) => {
                    slots.push(*slot);
                    mask.push(true);
                }
                None => {
                    slots.push(0);
                    mask.push(false);
                }
            }
        }
        (slots, mask)
    }

    fn find_one(&self, key: BlockCoord) -> Option<u32> {
        self.map.get(&key).map(|slot| *slot)
    }

    fn active_entries(&self) -> Vec<(BlockCoord, u32)> {
        self.map.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&self) {
        self.map.clear();
        self.next_slot.store(0, Ordering::Relaxed);
    }
}

/// Disposable deduplication set for the touch pass.
///
/// Cleared, not reallocated, between observations; rebuilt at a larger
/// capacity only when the size hint from the call signature grows. Never
/// holds voxel payload.
pub struct TouchScratch {
    set: DashSet<BlockCoord>,
    capacity_hint: usize,
}

impl TouchScratch {
    pub fn new() -> Self {
        Self {
            set: DashSet::new(),
            capacity_hint: 0,
        }
    }

    /// Make the set empty and large enough for `hint` coordinates.
    pub fn prepare(&mut self, hint: usize) {
        if hint > self.capacity_hint {
            self.set = DashSet::with_capacity(hint);
            self.capacity_hint = hint;
        } else {
            self.set.clear();
        }
    }

    #[inline]
    pub fn insert(&self, coord: BlockCoord) -> bool {
        self.set.insert(coord)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// The deduplicated coordinates, in unspecified order.
    pub fn coordinates(&self) -> Vec<BlockCoord> {
        self.set.iter().map(|c| *c).collect()
    }
}

impl Default for TouchScratch {
    fn default() -> Self {
        Self::new()
    }
}
