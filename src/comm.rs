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
use crate::config::TableInfo;
use crate::oplog::OpLogData;
use crate::{RowId, TableId, ThreadId};
use anyhow::{bail, ensure};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::RwLock;

// Everything the threads of one client say to each other. Row payloads
// cross as serialized bytes; a socket transport would slot in at this
// seam without touching the senders.
pub enum Msg {
    // app thread -> bg worker
    AppRequestRow {
        app_thread_id: ThreadId,
        table_id: TableId,
        row_id: RowId,
        clock: i32,
    },
    AppClock,
    AppSendOpLogs,
    // bg worker -> server thread
    RowRequest {
        from: ThreadId,
        seq: u64,
        table_id: TableId,
        row_id: RowId,
        clock: i32,
        version: u32,
    },
    OpLog {
        from: ThreadId,
        version: u32,
        clock: i32,
        advance_clock: bool,
        data: OpLogData,
    },
    // server thread -> bg worker
    RowReply {
        seq: u64,
        table_id: TableId,
        row_id: RowId,
        clock: i32,
        version: u32,
        payload: Vec<u8>,
    },
    // init thread <-> server threads
    CreateTable {
        table_id: TableId,
        info: TableInfo,
    },
    CreateTableReply {
        table_id: TableId,
    },
    ShutDown,
}

// Datagram-style bus between the threads of this process: reliable,
// FIFO per sender/receiver pair (each endpoint is one channel and a
// sender's messages stay in order).
pub struct MsgBus {
    endpoints: RwLock<HashMap<ThreadId, Sender<Msg>>>,
}

impl MsgBus {
    pub fn new() -> MsgBus {
        MsgBus {
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, id: ThreadId) -> anyhow::Result<Receiver<Msg>> {
        let (send, recv) = unbounded();
        let mut ep = self.endpoints.write().unwrap();
        ensure!(
            ep.insert(id, send).is_none(),
            "MsgBus: endpoint already registered. id={}",
            id
        );
        return Ok(recv);
    }

    pub fn deregister(&self, id: ThreadId) {
        let mut ep = self.endpoints.write().unwrap();
        ep.remove(&id);
    }

    pub fn send(&self, to: ThreadId, msg: Msg) -> anyhow::Result<()> {
        let ep = self.endpoints.read().unwrap();
        match ep.get(&to) {
            None => bail!("MsgBus: unknown endpoint. to={}", to),
            Some(sender) => {
                if sender.send(msg).is_err() {
                    bail!("MsgBus: endpoint closed. to={}", to);
                }
            }
        }
        return Ok(());
    }
}
