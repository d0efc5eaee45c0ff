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
use crate::row::{Row, Val};
use crate::storage::clock_lru::ClockLru;
use crate::utils::striped::StripedLock;
use crate::{ColumnId, RowId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering::Relaxed};
use std::sync::{Arc, Mutex, RwLock};

struct CachedRow {
    slot: usize,
    // clock through which updates are applied
    clock: AtomicI32,
    // live read accessors; positive pins the row against eviction
    refcnt: AtomicU32,
    data: RwLock<Box<dyn Row>>,
}

// Scoped row access: pins on construction, unpins on every exit path.
pub struct RowAccessor {
    row: Arc<CachedRow>,
}

impl RowAccessor {
    fn new(row: Arc<CachedRow>) -> RowAccessor {
        row.refcnt.fetch_add(1, Relaxed);
        RowAccessor { row }
    }

    pub fn clock(&self) -> i32 {
        self.row.clock.load(Relaxed)
    }

    pub fn val(&self, column_id: ColumnId) -> Val {
        self.row.data.read().unwrap().val(column_id)
    }

    pub fn apply_update(&self, column_id: ColumnId, delta: Val) {
        self.row.data.write().unwrap().apply_update(column_id, delta);
    }

    pub fn apply_batch_update(&self, column_ids: &[ColumnId], deltas: &[Val]) {
        self.row
            .data
            .write()
            .unwrap()
            .apply_batch_update(column_ids, deltas);
    }
}

impl Drop for RowAccessor {
    fn drop(&mut self) {
        self.row.refcnt.fetch_sub(1, Relaxed);
    }
}

// Fixed-capacity row_id -> row map backed by a ClockLru of the same
// capacity. find() may run from any thread; insert() only from the bg
// workers. The row-id stripes serialize membership changes; the map
// RwLock makes pinning atomic against eviction's refcount check.
pub struct ProcessStorage {
    capacity: usize,
    rows: RwLock<HashMap<RowId, Arc<CachedRow>>>,
    lru: ClockLru,
    row_locks: StripedLock<RowId>,
    // serializes inserters so the capacity check and the slot allocation
    // stay one step
    insert_lock: Mutex<()>,
}

impl ProcessStorage {
    pub fn new(capacity: usize) -> ProcessStorage {
        assert!(capacity > 0, "ProcessStorage: capacity must be positive");
        ProcessStorage {
            capacity,
            rows: RwLock::new(HashMap::with_capacity(capacity)),
            lru: ClockLru::new(capacity),
            row_locks: StripedLock::new(capacity),
            insert_lock: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    pub fn find(&self, row_id: RowId) -> Option<RowAccessor> {
        let slot;
        let acc;
        {
            let map = self.rows.read().unwrap();
            let row = map.get(&row_id)?;
            // pin under the read lock: an evictor checks the refcount
            // under the write lock, so it sees either the pin or our miss
            acc = RowAccessor::new(row.clone());
            slot = row.slot;
        }
        self.lru.reference(slot);
        return Some(acc);
    }

    // Install a fetched row. An already-cached row is refreshed in place;
    // a new row evicts per CLOCK when the table is full. Returns the
    // evicted row id, if any.
    pub fn insert(&self, row_id: RowId, data: Box<dyn Row>, clock: i32) -> Option<RowId> {
        {
            let map = self.rows.read().unwrap();
            if let Some(row) = map.get(&row_id) {
                *row.data.write().unwrap() = data;
                row.clock.store(clock, Relaxed);
                return None;
            }
        }
        let _ig = self.insert_lock.lock().unwrap();
        let mut evicted = None;
        loop {
            if self.rows.read().unwrap().len() < self.capacity {
                break;
            }
            let cand = self.lru.find_one_to_evict();
            let victim = cand.row_id();
            let _rg = self.row_locks.lock(&victim);
            let mut map = self.rows.write().unwrap();
            let removable = match map.get(&victim) {
                Some(v) => v.refcnt.load(Relaxed) == 0,
                None => false,
            };
            if removable {
                map.remove(&victim);
                drop(map);
                cand.evict();
                evicted = Some(victim);
            } else {
                // pinned, or a slot whose row is not yet published: give
                // it up and rescan
                drop(map);
                std::thread::yield_now();
            }
        }
        let slot = self.lru.insert(row_id);
        let row = Arc::new(CachedRow {
            slot,
            clock: AtomicI32::new(clock),
            refcnt: AtomicU32::new(0),
            data: RwLock::new(data),
        });
        let _rg = self.row_locks.lock(&row_id);
        let mut map = self.rows.write().unwrap();
        let prev = map.insert(row_id, row);
        assert!(prev.is_none(), "insert: row raced into cache. row={}", row_id);
        return evicted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::DenseRow;

    fn dense(width: usize, col: ColumnId, v: Val) -> Box<dyn Row> {
        let mut row = DenseRow::new(width);
        row.apply_update(col, v);
        Box::new(row)
    }

    #[test]
    fn find_insert_test() {
        let st = ProcessStorage::new(4);
        assert!(st.find(1).is_none());
        assert_eq!(None, st.insert(1, dense(2, 0, 5.0), 3));
        let acc = st.find(1).unwrap();
        assert_eq!(3, acc.clock());
        assert_eq!(5.0, acc.val(0));
    }

    #[test]
    fn refresh_in_place_test() {
        let st = ProcessStorage::new(2);
        assert_eq!(None, st.insert(1, dense(2, 0, 5.0), 1));
        let acc = st.find(1).unwrap();
        assert_eq!(None, st.insert(1, dense(2, 0, 9.0), 4));
        // the held accessor observes the refresh
        assert_eq!(9.0, acc.val(0));
        assert_eq!(4, acc.clock());
        assert_eq!(1, st.len());
    }

    #[test]
    fn evict_unreferenced_test() {
        let st = ProcessStorage::new(2);
        assert_eq!(None, st.insert(1, dense(2, 0, 1.0), 0));
        assert_eq!(None, st.insert(2, dense(2, 0, 2.0), 0));
        // read 1 so that 2 is the stale one
        let _acc = st.find(1).unwrap();
        let evicted = st.insert(3, dense(2, 0, 3.0), 0);
        assert_eq!(Some(2), evicted);
        assert!(st.find(2).is_none());
        assert!(st.find(1).is_some());
        assert!(st.find(3).is_some());
    }

    #[test]
    fn pinned_row_survives_test() {
        let st = ProcessStorage::new(2);
        assert_eq!(None, st.insert(1, dense(2, 0, 1.0), 0));
        assert_eq!(None, st.insert(2, dense(2, 0, 2.0), 0));
        // pin 2; even though 1 was referenced more recently, 2 must not go
        let acc2 = st.find(2).unwrap();
        let acc1 = st.find(1).unwrap();
        drop(acc1);
        let evicted = st.insert(3, dense(2, 0, 3.0), 0);
        assert_eq!(Some(1), evicted);
        assert_eq!(2.0, acc2.val(0));
        assert!(st.find(2).is_some());
    }

    #[test]
    fn accessor_unpins_on_drop_test() {
        let st = ProcessStorage::new(1);
        assert_eq!(None, st.insert(1, dense(2, 0, 1.0), 0));
        {
            let _acc = st.find(1).unwrap();
        }
        // unpinned now, insert may evict it
        let evicted = st.insert(2, dense(2, 0, 2.0), 0);
        assert_eq!(Some(1), evicted);
    }
}
