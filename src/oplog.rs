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
use crate::{bg_index, ColumnId, RowId, TableId};
use static_assertions::const_assert;
use std::collections::HashMap;
use std::sync::Mutex;

pub type RowOpLog = HashMap<ColumnId, Val>;

const OPLOG_PARTS: usize = 32;
const_assert!(OPLOG_PARTS.is_power_of_two());

// Pending local updates of one table, row -> column -> accumulated delta.
// App threads append concurrently; a bg worker drains its row partition at
// every clock boundary. Striped so that hot Inc() traffic on different
// rows does not serialize.
pub struct TableOpLog {
    parts: Vec<Mutex<HashMap<RowId, RowOpLog>>>,
}

impl TableOpLog {
    pub fn new() -> TableOpLog {
        let mut parts = Vec::with_capacity(OPLOG_PARTS);
        parts.resize_with(OPLOG_PARTS, || Mutex::new(HashMap::new()));
        TableOpLog { parts }
    }

    fn part(&self, row_id: RowId) -> &Mutex<HashMap<RowId, RowOpLog>> {
        &self.parts[(row_id as u32 as usize) & (OPLOG_PARTS - 1)]
    }

    pub fn inc(&self, row_id: RowId, column_id: ColumnId, delta: Val) {
        let mut part = self.part(row_id).lock().unwrap();
        let rowlog = part.entry(row_id).or_insert_with(HashMap::new);
        *rowlog.entry(column_id).or_insert(0.0) += delta;
    }

    pub fn batch_inc(&self, row_id: RowId, column_ids: &[ColumnId], deltas: &[Val]) {
        assert_eq!(
            column_ids.len(),
            deltas.len(),
            "batch_inc: column/delta mismatch"
        );
        let mut part = self.part(row_id).lock().unwrap();
        let rowlog = part.entry(row_id).or_insert_with(HashMap::new);
        for (idx, &col) in column_ids.iter().enumerate() {
            *rowlog.entry(col).or_insert(0.0) += deltas[idx];
        }
    }

    // Take every pending row owned by bg worker #bg out of the buffer.
    pub fn drain_rows_of_bg(&self, bg: usize, num_bg: usize) -> HashMap<RowId, RowOpLog> {
        let mut ret = HashMap::new();
        for part in &self.parts {
            let mut part = part.lock().unwrap();
            let keys: Vec<RowId> = part
                .keys()
                .copied()
                .filter(|&r| bg_index(r, num_bg) == bg)
                .collect();
            for k in keys {
                let rowlog = part.remove(&k).unwrap();
                ret.insert(k, rowlog);
            }
        }
        return ret;
    }

    // Apply the row's still-pending deltas without consuming them. Used
    // when a fetched row is installed so that the fetching thread keeps
    // seeing its own unflushed writes.
    pub fn apply_pending(&self, row_id: RowId, row: &mut dyn Row) {
        let part = self.part(row_id).lock().unwrap();
        if let Some(rowlog) = part.get(&row_id) {
            for (&col, &delta) in rowlog {
                row.apply_update(col, delta);
            }
        }
    }
}

// One sealed oplog version of one bg worker: every table's drained row
// partition. Immutable once sealed.
pub struct BgOpLog {
    tables: HashMap<TableId, HashMap<RowId, RowOpLog>>,
}

pub type OpLogData = HashMap<TableId, HashMap<RowId, RowOpLog>>;

impl BgOpLog {
    pub fn new() -> BgOpLog {
        BgOpLog {
            tables: HashMap::new(),
        }
    }

    pub fn add_table(&mut self, table_id: TableId, rows: HashMap<RowId, RowOpLog>) {
        if !rows.is_empty() {
            self.tables.insert(table_id, rows);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn row_oplog(&self, table_id: TableId, row_id: RowId) -> Option<&RowOpLog> {
        self.tables.get(&table_id).and_then(|rows| rows.get(&row_id))
    }

    // The subset of rows stored on server thread #server, cloned for the
    // wire.
    pub fn rows_of_server(&self, server: usize, num_server: usize) -> OpLogData {
        let mut ret = OpLogData::new();
        for (&table_id, rows) in &self.tables {
            let sub: HashMap<RowId, RowOpLog> = rows
                .iter()
                .filter(|(&r, _)| crate::server_index(r, num_server) == server)
                .map(|(&r, log)| (r, log.clone()))
                .collect();
            if !sub.is_empty() {
                ret.insert(table_id, sub);
            }
        }
        return ret;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::DenseRow;

    #[test]
    fn inc_accumulate_test() {
        let oplog = TableOpLog::new();
        oplog.inc(3, 0, 1.0);
        oplog.inc(3, 0, 2.0);
        oplog.batch_inc(3, &[0, 1], &[4.0, 8.0]);
        let rows = oplog.drain_rows_of_bg(bg_index(3, 1), 1);
        let rowlog = rows.get(&3).unwrap();
        assert_eq!(7.0, rowlog[&0]);
        assert_eq!(8.0, rowlog[&1]);
        // drained: nothing left
        assert!(oplog.drain_rows_of_bg(0, 1).is_empty());
    }

    #[test]
    fn drain_partition_test() {
        let oplog = TableOpLog::new();
        for row in 0..8 {
            oplog.inc(row, 0, 1.0);
        }
        let bg0 = oplog.drain_rows_of_bg(0, 2);
        let bg1 = oplog.drain_rows_of_bg(1, 2);
        assert_eq!(4, bg0.len());
        assert_eq!(4, bg1.len());
        for &r in bg0.keys() {
            assert_eq!(0, bg_index(r, 2));
        }
    }

    #[test]
    fn apply_pending_test() {
        let oplog = TableOpLog::new();
        oplog.inc(5, 2, 3.0);
        let mut row = DenseRow::new(4);
        oplog.apply_pending(5, &mut row);
        assert_eq!(3.0, row.val(2));
        // deltas stay buffered
        let mut row2 = DenseRow::new(4);
        oplog.apply_pending(5, &mut row2);
        assert_eq!(3.0, row2.val(2));
    }
}
