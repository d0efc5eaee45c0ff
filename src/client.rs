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
use crate::comm::{Msg, MsgBus};
use crate::config::ClientTableConfig;
use crate::consistency::ConsistencyController;
use crate::oplog::TableOpLog;
use crate::row::{Row, Val};
use crate::storage::{ProcessStorage, RowAccessor};
use crate::{curr_thread_id, ColumnId, GlobalContext, RowId, TableId};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

pub(crate) struct RowCond {
    pub m: Mutex<()>,
    pub cv: Condvar,
}

// One condvar per row with waiters. An entry lives while any Get holds
// its Arc; the signaler reaps entries nobody shares anymore.
pub(crate) struct RowWaits {
    conds: Mutex<HashMap<RowId, Arc<RowCond>>>,
}

impl RowWaits {
    fn new() -> RowWaits {
        RowWaits {
            conds: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, row_id: RowId) -> Arc<RowCond> {
        let mut conds = self.conds.lock().unwrap();
        conds
            .entry(row_id)
            .or_insert_with(|| {
                Arc::new(RowCond {
                    m: Mutex::new(()),
                    cv: Condvar::new(),
                })
            })
            .clone()
    }

    pub fn signal(&self, row_id: RowId) {
        let mut conds = self.conds.lock().unwrap();
        let reap = match conds.get(&row_id) {
            Some(cond) => {
                // take the monitor so a Get between its freshness check
                // and its wait cannot miss this signal
                {
                    let _g = cond.m.lock().unwrap();
                }
                cond.cv.notify_all();
                Arc::strong_count(cond) == 1
            }
            None => false,
        };
        if reap {
            conds.remove(&row_id);
        }
    }
}

// A table as the application sees it: the process cache, the pending
// oplog, and the consistency controller deciding what a read may return.
pub struct ClientTable {
    table_id: TableId,
    config: ClientTableConfig,
    sample_row: Box<dyn Row>,
    storage: ProcessStorage,
    oplog: TableOpLog,
    waits: RowWaits,
    controller: ConsistencyController,
    ctx: &'static GlobalContext,
    bus: &'static MsgBus,
}

impl ClientTable {
    pub(crate) fn new(
        table_id: TableId,
        config: ClientTableConfig,
        ctx: &'static GlobalContext,
        bus: &'static MsgBus,
    ) -> anyhow::Result<ClientTable> {
        config.validate()?;
        let sample_row = config.info.row_type.sample();
        let storage = ProcessStorage::new(config.process_cache_capacity);
        let controller =
            ConsistencyController::new(ctx.conf.consistency_model, config.info.staleness);
        Ok(ClientTable {
            table_id,
            config,
            sample_row,
            storage,
            oplog: TableOpLog::new(),
            waits: RowWaits::new(),
            controller,
            ctx,
            bus,
        })
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn staleness(&self) -> i32 {
        self.config.info.staleness
    }

    // Blocks until a row fresh enough for this thread's clock is cached.
    pub fn get(&self, row_id: RowId) -> anyhow::Result<RowAccessor> {
        self.controller.get(self, row_id)
    }

    pub fn inc(&self, row_id: RowId, column_id: ColumnId, delta: Val) -> anyhow::Result<()> {
        curr_thread_id()?;
        self.controller.inc(self, row_id, column_id, delta);
        return Ok(());
    }

    pub fn batch_inc(
        &self,
        row_id: RowId,
        column_ids: &[ColumnId],
        deltas: &[Val],
    ) -> anyhow::Result<()> {
        curr_thread_id()?;
        self.controller.batch_inc(self, row_id, column_ids, deltas);
        return Ok(());
    }

    pub(crate) fn storage(&self) -> &ProcessStorage {
        &self.storage
    }

    pub(crate) fn oplog(&self) -> &TableOpLog {
        &self.oplog
    }

    pub(crate) fn waits(&self) -> &RowWaits {
        &self.waits
    }

    pub(crate) fn sample_row(&self) -> &dyn Row {
        self.sample_row.as_ref()
    }

    // Ask the owning bg worker to fetch the row; clock is the freshness
    // bound the reply must meet.
    pub(crate) fn request_row(&self, row_id: RowId, clock: i32) -> anyhow::Result<()> {
        let app_thread_id = curr_thread_id()?;
        self.bus.send(
            self.ctx.bg_thread_for(row_id),
            Msg::AppRequestRow {
                app_thread_id,
                table_id: self.table_id,
                row_id,
                clock,
            },
        )
    }
}
