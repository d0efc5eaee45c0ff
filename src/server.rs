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
use crate::config::TableInfo;
use crate::oplog::OpLogData;
use crate::row::Row;
use crate::utils::vclock::VectorClock;
use crate::{GlobalContext, RowId, TableId, ThreadId};
use crossbeam_channel::Receiver;
use std::collections::HashMap;

struct BufferedRequest {
    from: ThreadId,
    seq: u64,
    table_id: TableId,
    row_id: RowId,
    clock: i32,
    version: u32,
}

// One server thread owns the rows of its partition. Oplog batches from a
// given bg apply in arrival order; a row request waits until the server's
// clock frontier reaches the request's clock, then is answered with the
// row, the frontier, and the version of the requester's updates applied
// so far.
pub(crate) struct ServerThread {
    server_id: ThreadId,
    ctx: &'static GlobalContext,
    bus: &'static MsgBus,
    recv: Receiver<Msg>,
    tables: HashMap<TableId, TableInfo>,
    rows: HashMap<(TableId, RowId), Box<dyn Row>>,
    // clock entries per bg worker of this client
    vclock: VectorClock,
    // last applied oplog version per bg worker
    applied: HashMap<ThreadId, u32>,
    buffered: Vec<BufferedRequest>,
}

impl ServerThread {
    pub(crate) fn new(
        server_idx: usize,
        ctx: &'static GlobalContext,
        bus: &'static MsgBus,
        recv: Receiver<Msg>,
        bg_ids: &[ThreadId],
    ) -> ServerThread {
        ServerThread {
            server_id: ctx.server_thread_id(server_idx),
            ctx,
            bus,
            recv,
            tables: HashMap::new(),
            rows: HashMap::new(),
            vclock: VectorClock::with_ids(bg_ids),
            applied: HashMap::new(),
            buffered: Vec::new(),
        }
    }

    fn reply(&self, from: ThreadId, seq: u64, table_id: TableId, row_id: RowId) {
        let mut payload = Vec::new();
        match self.rows.get(&(table_id, row_id)) {
            Some(row) => row.serialize(&mut payload),
            None => match self.tables.get(&table_id) {
                // never-written rows read as zeroes
                Some(info) => info.row_type.sample().serialize(&mut payload),
                None => {
                    log::warn!(
                        "request for unknown table. table={} row={}",
                        table_id,
                        row_id
                    );
                    return;
                }
            },
        }
        let version = self.applied.get(&from).copied().unwrap_or(0);
        let sent = self.bus.send(
            from,
            Msg::RowReply {
                seq,
                table_id,
                row_id,
                clock: self.vclock.min_clock(),
                version,
                payload,
            },
        );
        if let Err(err) = sent {
            log::warn!("row reply not sent. to={} err={:#}", from, err);
        }
    }

    fn handle_oplog(&mut self, from: ThreadId, version: u32, advance_clock: bool, data: OpLogData) {
        for (table_id, rows) in data {
            let info = match self.tables.get(&table_id) {
                Some(info) => info,
                None => {
                    log::warn!("oplog for unknown table. table={}", table_id);
                    continue;
                }
            };
            for (row_id, rowlog) in rows {
                let row = self
                    .rows
                    .entry((table_id, row_id))
                    .or_insert_with(|| info.row_type.sample());
                for (col, delta) in rowlog {
                    row.apply_update(col, delta);
                }
            }
        }
        self.applied.insert(from, version);
        if advance_clock {
            let newmin = self.vclock.tick(from);
            if newmin != 0 {
                self.release_buffered(newmin);
            }
        }
    }

    fn release_buffered(&mut self, newmin: i32) {
        let (due, rest): (Vec<BufferedRequest>, Vec<BufferedRequest>) =
            std::mem::take(&mut self.buffered)
                .into_iter()
                .partition(|r| r.clock <= newmin);
        self.buffered = rest;
        for req in due {
            log::trace!(
                "release buffered request. row={} clock={} version={}",
                req.row_id,
                req.clock,
                req.version
            );
            self.reply(req.from, req.seq, req.table_id, req.row_id);
        }
    }
}

pub(crate) fn server_main(mut s: ServerThread) {
    log::info!(
        "server thread up. id={} ring_size={} snapshot_clock={}",
        s.server_id,
        s.ctx.conf.server_ring_size,
        s.ctx.conf.snapshot_clock
    );
    loop {
        let msg = match s.recv.recv() {
            Ok(m) => m,
            Err(_) => break,
        };
        match msg {
            Msg::CreateTable { table_id, info } => {
                s.tables.insert(table_id, info);
                let sent = s.bus.send(
                    s.ctx.init_thread_id(),
                    Msg::CreateTableReply { table_id },
                );
                if let Err(err) = sent {
                    log::warn!("create table ack not sent. err={:#}", err);
                }
            }
            Msg::OpLog {
                from,
                version,
                clock: _,
                advance_clock,
                data,
            } => s.handle_oplog(from, version, advance_clock, data),
            Msg::RowRequest {
                from,
                seq,
                table_id,
                row_id,
                clock,
                version,
            } => {
                if s.vclock.min_clock() >= clock {
                    s.reply(from, seq, table_id, row_id);
                } else {
                    s.buffered.push(BufferedRequest {
                        from,
                        seq,
                        table_id,
                        row_id,
                        clock,
                        version,
                    });
                }
            }
            Msg::ShutDown => break,
            _ => log::warn!("server: unexpected message. id={}", s.server_id),
        }
    }
    log::info!("server thread down. id={}", s.server_id);
}
