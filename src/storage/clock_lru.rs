/*
Copyright 2020 <盏一 w@hidva.com>
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/
use crate::utils::mtqueue::MtQueue;
use crate::utils::striped::StripedLock;
use crate::RowId;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering::Relaxed};
use std::sync::MutexGuard;

// Rounds over the whole ring before find_one_to_evict gives up.
pub const MAX_NUM_ROUNDS: usize = 10;

// CLOCK replacement over a fixed ring of slots, approximating LRU without
// a global list. A slot starts stale; only reference() earns it a second
// chance against the sweeping hand. Fully thread-safe.
//
// The stripe lock here is keyed by slot number, not row id: during
// eviction we know the slot before we know the row. ProcessStorage keeps
// its own row-id-keyed stripes for membership.
pub struct ClockLru {
    capacity: usize,
    evict_hand: AtomicUsize,
    // Only used before the ring first fills up; afterwards empty_slots
    // hands out freed slots.
    insert_hand: AtomicUsize,
    empty_slots: MtQueue<usize>,
    locks: StripedLock<usize>,
    stale: Vec<AtomicBool>,
    // -1 means empty.
    row_ids: Vec<AtomicI32>,
    occupied: AtomicI32,
}

// Returned by find_one_to_evict with the slot stripe held. evict() frees
// the slot; dropping the candidate without evicting releases the stripe
// with the slot unchanged.
pub struct EvictCandidate<'a> {
    lru: &'a ClockLru,
    slot: usize,
    row_id: RowId,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> EvictCandidate<'a> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn row_id(&self) -> RowId {
        self.row_id
    }

    pub fn evict(self) {
        self.lru.row_ids[self.slot].store(-1, Relaxed);
        let occ = self.lru.occupied.fetch_sub(1, Relaxed) - 1;
        assert!(occ >= 0, "evict: occupancy accounting violated. occ={}", occ);
        self.lru.empty_slots.push(self.slot);
        // stripe released on drop
    }
}

impl ClockLru {
    pub fn new(capacity: usize) -> ClockLru {
        assert!(capacity > 0, "ClockLru: capacity must be positive");
        let mut stale = Vec::with_capacity(capacity);
        stale.resize_with(capacity, || AtomicBool::new(false));
        let mut row_ids = Vec::with_capacity(capacity);
        row_ids.resize_with(capacity, || AtomicI32::new(-1));
        ClockLru {
            capacity,
            evict_hand: AtomicUsize::new(0),
            insert_hand: AtomicUsize::new(0),
            empty_slots: MtQueue::new(),
            locks: StripedLock::new(capacity),
            stale,
            row_ids,
            occupied: AtomicI32::new(0),
        }
    }

    fn find_empty_slot(&self) -> (usize, MutexGuard<'_, ()>) {
        for _ in 0..MAX_NUM_ROUNDS * self.capacity {
            if let Some(slot) = self.empty_slots.pop() {
                // freed by a finished evict; may still briefly contend
                // with the evictor releasing the stripe. The hand scan
                // below can claim a queued slot first, so a popped entry
                // may turn out occupied and is then simply discarded.
                let guard = self.locks.lock(&slot);
                if self.row_ids[slot].load(Relaxed) == -1 {
                    return (slot, guard);
                }
                continue;
            }
            let slot = self.insert_hand.fetch_add(1, Relaxed) % self.capacity;
            if let Some(guard) = self.locks.try_lock(&slot) {
                if self.row_ids[slot].load(Relaxed) == -1 {
                    return (slot, guard);
                }
            }
        }
        panic!(
            "find_empty_slot: no empty slot; caller did not ensure capacity. capacity={}",
            self.capacity
        );
    }

    // Caller must have ensured there is room (capacity accounting is
    // still checked here and violations are fatal). The fresh slot starts
    // stale: a row earns recency by being read, not by arriving.
    pub fn insert(&self, row_id: RowId) -> usize {
        assert!(row_id >= 0, "insert: invalid row. row={}", row_id);
        let (slot, _guard) = self.find_empty_slot();
        self.row_ids[slot].store(row_id, Relaxed);
        self.stale[slot].store(true, Relaxed);
        let occ = self.occupied.fetch_add(1, Relaxed) + 1;
        assert!(
            occ <= self.capacity as i32,
            "insert: capacity accounting violated. occ={} capacity={}",
            occ,
            self.capacity
        );
        return slot;
    }

    // Clear the stale flag without taking the slot stripe. A clear racing
    // an insert or evict is harmless: insert re-arms the flag and evict
    // empties the slot.
    pub fn reference(&self, slot: usize) {
        self.stale[slot].store(false, Relaxed);
    }

    pub fn find_one_to_evict(&self) -> EvictCandidate<'_> {
        for _ in 0..MAX_NUM_ROUNDS * self.capacity {
            let slot = self.evict_hand.fetch_add(1, Relaxed) % self.capacity;
            let guard = match self.locks.try_lock(&slot) {
                Some(g) => g,
                None => continue, // mid insert/evict, skip
            };
            if !self.stale[slot].swap(true, Relaxed) {
                // had its second chance, age it
                continue;
            }
            let row_id = self.row_ids[slot].load(Relaxed);
            if row_id < 0 {
                continue;
            }
            return EvictCandidate {
                lru: self,
                slot,
                row_id,
                _guard: guard,
            };
        }
        panic!(
            "find_one_to_evict: no evictable row after {} rounds; pinning exceeds capacity. capacity={}",
            MAX_NUM_ROUNDS, self.capacity
        );
    }

    #[cfg(test)]
    pub fn has_row(&self, row_id: RowId, slot: usize) -> bool {
        self.row_ids[slot].load(Relaxed) == row_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_chance_test() {
        let lru = ClockLru::new(2);
        let s10 = lru.insert(10);
        let s20 = lru.insert(20);
        lru.reference(s10);
        // 10 is not-stale after the reference, 20 has been stale since
        // insert: the sweep ages 10 and returns 20.
        let cand = lru.find_one_to_evict();
        assert_eq!(20, cand.row_id());
        assert_eq!(s20, cand.slot());
        cand.evict();
        assert!(lru.has_row(10, s10));
        assert!(!lru.has_row(20, s20));
    }

    #[test]
    fn freed_slot_reuse_test() {
        let lru = ClockLru::new(2);
        let s1 = lru.insert(1);
        let _s2 = lru.insert(2);
        let cand = lru.find_one_to_evict();
        let victim = cand.row_id();
        cand.evict();
        let s3 = lru.insert(3);
        assert!(lru.has_row(3, s3));
        if victim == 1 {
            assert_eq!(s1, s3);
        }
    }

    #[test]
    fn no_evict_keeps_slot_test() {
        let lru = ClockLru::new(1);
        let s = lru.insert(7);
        let cand = lru.find_one_to_evict();
        assert_eq!(7, cand.row_id());
        drop(cand); // NoEvict
        assert!(lru.has_row(7, s));
        // still evictable afterwards
        let cand = lru.find_one_to_evict();
        assert_eq!(7, cand.row_id());
        cand.evict();
    }

    #[test]
    #[should_panic(expected = "no evictable row")]
    fn starvation_is_fatal_test() {
        let lru = ClockLru::new(1);
        lru.insert(7);
        let _held = lru.find_one_to_evict();
        // the only slot is locked by the candidate above
        let _ = lru.find_one_to_evict();
    }
}
