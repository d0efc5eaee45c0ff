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
use crate::client::ClientTable;
use crate::config::ConsistencyModel;
use crate::row::Val;
use crate::storage::RowAccessor;
use crate::{curr_thread_clock, ColumnId, RowId};
use std::cmp::max;

// The consistency model decides what Get may return and when Inc becomes
// visible. SSP is the one model implemented; the dispatch point is here
// so another model is one more variant, not a new call surface.
pub enum ConsistencyController {
    Ssp(SspController),
}

impl ConsistencyController {
    pub fn new(model: ConsistencyModel, staleness: i32) -> ConsistencyController {
        match model {
            ConsistencyModel::Ssp => ConsistencyController::Ssp(SspController { staleness }),
        }
    }

    pub fn get(&self, t: &ClientTable, row_id: RowId) -> anyhow::Result<RowAccessor> {
        match self {
            ConsistencyController::Ssp(c) => c.get(t, row_id),
        }
    }

    pub fn inc(&self, t: &ClientTable, row_id: RowId, column_id: ColumnId, delta: Val) {
        match self {
            ConsistencyController::Ssp(c) => c.inc(t, row_id, column_id, delta),
        }
    }

    pub fn batch_inc(&self, t: &ClientTable, row_id: RowId, column_ids: &[ColumnId], deltas: &[Val]) {
        match self {
            ConsistencyController::Ssp(c) => c.batch_inc(t, row_id, column_ids, deltas),
        }
    }
}

// Stale Synchronous Parallel: a reader at clock c accepts any row whose
// applied updates cover every clock <= c - staleness. Too stale means
// block, never means serve.
pub struct SspController {
    staleness: i32,
}

impl SspController {
    fn get(&self, t: &ClientTable, row_id: RowId) -> anyhow::Result<RowAccessor> {
        let clock = curr_thread_clock()?;
        let stalest = max(0, clock - self.staleness);
        if let Some(acc) = fetch_fresh(t, row_id, stalest) {
            return Ok(acc);
        }
        let cond = t.waits().get(row_id);
        let mut guard = cond.m.lock().unwrap();
        // the bg worker may have installed the row while we took the
        // monitor
        if let Some(acc) = fetch_fresh(t, row_id, stalest) {
            return Ok(acc);
        }
        t.request_row(row_id, stalest)?;
        loop {
            guard = cond.cv.wait(guard).unwrap();
            // a reply that satisfied our request is fresh by
            // construction; any other wakeup is for a coalesced neighbor
            // and we keep waiting
            if let Some(acc) = fetch_fresh(t, row_id, stalest) {
                return Ok(acc);
            }
        }
    }

    // Returns immediately. The delta lands in the oplog for the server
    // and, when the row is cached, on the local copy so this thread
    // observes its own write.
    fn inc(&self, t: &ClientTable, row_id: RowId, column_id: ColumnId, delta: Val) {
        t.oplog().inc(row_id, column_id, delta);
        if let Some(acc) = t.storage().find(row_id) {
            acc.apply_update(column_id, delta);
        }
    }

    fn batch_inc(&self, t: &ClientTable, row_id: RowId, column_ids: &[ColumnId], deltas: &[Val]) {
        t.oplog().batch_inc(row_id, column_ids, deltas);
        if let Some(acc) = t.storage().find(row_id) {
            acc.apply_batch_update(column_ids, deltas);
        }
    }
}

// Fresh means applied clock at or past the bound.
pub(crate) fn fetch_fresh(t: &ClientTable, row_id: RowId, stalest: i32) -> Option<RowAccessor> {
    let acc = t.storage().find(row_id)?;
    if acc.clock() >= stalest {
        return Some(acc);
    }
    None
}
