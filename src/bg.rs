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
use crate::oplog::BgOpLog;
use crate::utils::vclock::VectorClockMt;
use crate::{GlobalContext, RowId, TableId, TableMap, ThreadId};
use crossbeam_channel::Receiver;
use self::request::{RowRequestInfo, RowRequestMgr};

pub mod request;

// One bg worker serves the rows with its residue: it forwards their
// fetches, seals their oplog partition at clock boundaries, and installs
// their replies. All request/version bookkeeping is thread-local to it.
pub(crate) struct BgWorker {
    bg_id: ThreadId,
    bg_idx: usize,
    ctx: &'static GlobalContext,
    bus: &'static MsgBus,
    tables: &'static TableMap,
    vclock: &'static VectorClockMt,
    recv: Receiver<Msg>,
    mgr: RowRequestMgr,
    // latest sealed oplog version; 0 means nothing sealed yet
    version: u32,
    seq: u64,
}

impl BgWorker {
    pub(crate) fn new(
        bg_idx: usize,
        ctx: &'static GlobalContext,
        bus: &'static MsgBus,
        tables: &'static TableMap,
        vclock: &'static VectorClockMt,
        recv: Receiver<Msg>,
    ) -> BgWorker {
        BgWorker {
            bg_id: ctx.bg_thread_id(bg_idx),
            bg_idx,
            ctx,
            bus,
            tables,
            vclock,
            recv,
            mgr: RowRequestMgr::new(),
            version: 0,
            seq: 0,
        }
    }

    fn handle_request_row(
        &mut self,
        app_thread_id: ThreadId,
        table_id: TableId,
        row_id: RowId,
        clock: i32,
    ) {
        let table = match self.tables.read().unwrap().get(&table_id) {
            Some(t) => t.clone(),
            None => {
                log::warn!(
                    "row request for unknown table. table={} row={}",
                    table_id,
                    row_id
                );
                return;
            }
        };
        // a reply for an earlier waiter may have landed while this
        // request sat in the queue
        if let Some(acc) = table.storage().find(row_id) {
            if acc.clock() >= clock {
                table.waits().signal(row_id);
                return;
            }
        }
        let request = RowRequestInfo {
            app_thread_id,
            clock,
            version: self.version,
            sent: false,
        };
        if self.mgr.add_row_request(request, table_id, row_id) {
            self.seq += 1;
            let sent = self.bus.send(
                self.ctx.server_thread_for(row_id),
                Msg::RowRequest {
                    from: self.bg_id,
                    seq: self.seq,
                    table_id,
                    row_id,
                    clock,
                    version: self.version,
                },
            );
            if let Err(err) = sent {
                log::warn!("row request not sent. row={} err={:#}", row_id, err);
            }
        }
    }

    // Seal the next oplog version out of every table's partition for this
    // bg and ship it; with advance_clock the servers also tick this bg's
    // clock entry, even on an empty batch.
    fn seal_and_send(&mut self, advance_clock: bool) {
        self.version = self.version.wrapping_add(1);
        let num_bg = self.ctx.num_bg();
        let mut oplog = BgOpLog::new();
        {
            let tables = self.tables.read().unwrap();
            for (&table_id, table) in tables.iter() {
                oplog.add_table(table_id, table.oplog().drain_rows_of_bg(self.bg_idx, num_bg));
            }
        }
        let clock = self.vclock.min_clock();
        let num_server = self.ctx.num_server();
        for s in 0..num_server {
            let data = oplog.rows_of_server(s, num_server);
            if !advance_clock && data.is_empty() {
                continue;
            }
            let sent = self.bus.send(
                self.ctx.server_thread_id(s),
                Msg::OpLog {
                    from: self.bg_id,
                    version: self.version,
                    clock,
                    advance_clock,
                    data,
                },
            );
            if let Err(err) = sent {
                log::warn!("oplog not sent. version={} err={:#}", self.version, err);
            }
        }
        // keep the sealed version only while someone may replay it
        self.mgr.add_oplog(self.version, oplog);
    }

    fn handle_reply(
        &mut self,
        table_id: TableId,
        row_id: RowId,
        clock: i32,
        reply_version: u32,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let table = match self.tables.read().unwrap().get(&table_id) {
            Some(t) => t.clone(),
            None => anyhow::bail!("reply for unknown table. table={}", table_id),
        };
        let mut row = table.sample_row().deserialize(payload)?;
        // replay the sealed versions the server had not applied when it
        // produced this reply
        let span = self.version.wrapping_sub(reply_version);
        let mut w = reply_version;
        for _ in 0..span {
            w = w.wrapping_add(1);
            if let Some(oplog) = self.mgr.oplog(w) {
                if let Some(rowlog) = oplog.row_oplog(table_id, row_id) {
                    for (&col, &delta) in rowlog {
                        row.apply_update(col, delta);
                    }
                }
            }
        }
        // unsealed deltas keep read-your-writes across the refill
        table.oplog().apply_pending(row_id, row.as_mut());
        if let Some(evicted) = table.storage().insert(row_id, row, clock) {
            log::trace!("row evicted. table={} row={}", table_id, evicted);
        }
        let mut app_thread_ids = Vec::new();
        self.mgr
            .inform_reply(table_id, row_id, clock, self.version, &mut app_thread_ids);
        table.waits().signal(row_id);
        return Ok(());
    }
}

pub(crate) fn bg_main(mut w: BgWorker) {
    log::info!("bg worker up. id={}", w.bg_id);
    loop {
        let msg = match w.recv.recv() {
            Ok(m) => m,
            Err(_) => break,
        };
        match msg {
            Msg::AppRequestRow {
                app_thread_id,
                table_id,
                row_id,
                clock,
            } => w.handle_request_row(app_thread_id, table_id, row_id, clock),
            Msg::AppClock => w.seal_and_send(true),
            Msg::AppSendOpLogs => w.seal_and_send(false),
            Msg::RowReply {
                seq: _,
                table_id,
                row_id,
                clock,
                version,
                payload,
            } => {
                if let Err(err) = w.handle_reply(table_id, row_id, clock, version, &payload) {
                    // a reply we cannot install leaves its waiters
                    // blocked forever; that is a logic bug, not a state
                    // to limp on from
                    panic!("bg: reply handling failed. err={:#}", err);
                }
            }
            Msg::ShutDown => break,
            _ => log::warn!("bg: unexpected message. id={}", w.bg_id),
        }
    }
    log::info!("bg worker down. id={}", w.bg_id);
}
