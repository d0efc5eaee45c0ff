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
use anyhow::{bail, ensure};
use client::ClientTable;
use comm::{Msg, MsgBus};
use config::TableGroupConfig;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering::Relaxed};
use std::sync::{Arc, Barrier, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use stderrlog::{ColorChoice, Timestamp};
use threadpool::ThreadPool;
use utils::vclock::VectorClockMt;

pub mod bg;
pub mod client;
pub mod comm;
pub mod common;
pub mod config;
pub mod consistency;
pub mod oplog;
pub mod row;
pub mod server;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod test;

pub const ZL_MAJOR: i32 = 0;
pub const ZL_MINOR: i32 = 0;
pub const ZL_PATCH: i32 = 1;
pub const ZL_VER: i32 = ZL_MAJOR * 100 * 100 + ZL_MINOR * 100 + ZL_PATCH;
pub const ZL_VERSTR: &str = "0.0.1";

pub type TableId = i32;
pub type RowId = i32;
pub type ColumnId = i32;
pub type ThreadId = i32;

pub fn init_log() {
    stderrlog::new()
        .verbosity(33)
        .timestamp(Timestamp::Microsecond)
        .color(ColorChoice::Never)
        .init()
        .unwrap();
}

fn make_static<T>(v: T) -> &'static T {
    Box::leak(Box::new(v))
}

// Rows are spread over the bg workers and over the server threads by
// residue; the two views are independent.
pub fn bg_index(row_id: RowId, num_bg: usize) -> usize {
    (row_id as u32 as usize) % num_bg
}

pub fn server_index(row_id: RowId, num_server: usize) -> usize {
    (row_id as u32 as usize) % num_server
}

// ================= per-thread context =================

struct ThreadCtx {
    id: ThreadId,
    clock: i32,
}

thread_local! {
    static THREAD_CTX: RefCell<Option<ThreadCtx>> = RefCell::new(None);
}

pub(crate) fn curr_thread_id() -> anyhow::Result<ThreadId> {
    THREAD_CTX.with(|c| match c.borrow().as_ref() {
        Some(ctx) => Ok(ctx.id),
        None => bail!("thread is not registered with the table group"),
    })
}

pub(crate) fn curr_thread_clock() -> anyhow::Result<i32> {
    THREAD_CTX.with(|c| match c.borrow().as_ref() {
        Some(ctx) => Ok(ctx.clock),
        None => bail!("thread is not registered with the table group"),
    })
}

fn thread_ctx_set() -> bool {
    THREAD_CTX.with(|c| c.borrow().is_some())
}

fn set_thread_ctx(id: ThreadId) {
    THREAD_CTX.with(|c| *c.borrow_mut() = Some(ThreadCtx { id, clock: 0 }));
}

fn clear_thread_ctx() {
    THREAD_CTX.with(|c| *c.borrow_mut() = None);
}

fn tick_thread_ctx() -> anyhow::Result<ThreadId> {
    THREAD_CTX.with(|c| match c.borrow_mut().as_mut() {
        Some(ctx) => {
            ctx.clock += 1;
            Ok(ctx.id)
        }
        None => bail!("thread is not registered with the table group"),
    })
}

// ================= process-wide state =================

// Config-derived facts every thread consults. Thread ids are dense in
// [local_id_min, local_id_max]: servers, then bg workers, then the init
// thread, then app threads in registration order.
pub struct GlobalContext {
    pub conf: TableGroupConfig,
}

impl GlobalContext {
    pub(crate) fn num_server(&self) -> usize {
        self.conf.num_local_server_threads as usize
    }

    pub(crate) fn num_bg(&self) -> usize {
        self.conf.num_local_bg_threads as usize
    }

    pub fn server_thread_id(&self, idx: usize) -> ThreadId {
        self.conf.local_id_min + idx as i32
    }

    pub fn bg_thread_id(&self, idx: usize) -> ThreadId {
        self.conf.local_id_min + self.conf.num_local_server_threads + idx as i32
    }

    pub fn init_thread_id(&self) -> ThreadId {
        self.conf.local_id_min
            + self.conf.num_local_server_threads
            + self.conf.num_local_bg_threads
    }

    pub fn app_thread_id(&self, offset: i32) -> ThreadId {
        self.init_thread_id() + offset
    }

    pub(crate) fn server_thread_for(&self, row_id: RowId) -> ThreadId {
        self.server_thread_id(server_index(row_id, self.num_server()))
    }

    pub(crate) fn bg_thread_for(&self, row_id: RowId) -> ThreadId {
        self.bg_thread_id(bg_index(row_id, self.num_bg()))
    }
}

pub(crate) type TableMap = RwLock<HashMap<TableId, Arc<ClientTable>>>;

// The registration barrier is sized at CreateTableDone, after which
// registering threads park on it.
struct RegisterBarrier {
    m: Mutex<Option<Arc<Barrier>>>,
    cv: Condvar,
}

impl RegisterBarrier {
    fn new() -> RegisterBarrier {
        RegisterBarrier {
            m: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn size(&self, n: usize) {
        let mut g = self.m.lock().unwrap();
        assert!(g.is_none(), "registration barrier sized twice");
        *g = Some(Arc::new(Barrier::new(n)));
        self.cv.notify_all();
    }

    fn wait(&self) {
        let barrier = {
            let mut g = self.m.lock().unwrap();
            loop {
                match g.as_ref() {
                    Some(b) => break b.clone(),
                    None => g = self.cv.wait(g).unwrap(),
                }
            }
        };
        barrier.wait();
    }
}

// Process-wide façade over one client's runtime: the tables, the vector
// clock, the bus, and the framework threads. Clone is cheap; all state is
// behind leaked statics and lives until process exit, while shut_down
// stops the threads.
#[derive(Clone)]
pub struct TableGroup {
    ctx: &'static GlobalContext,
    bus: &'static MsgBus,
    vclock: &'static VectorClockMt,
    tables: &'static TableMap,
    barrier: &'static RegisterBarrier,
    registered: &'static AtomicI32,
    bg_handles: &'static Mutex<Vec<JoinHandle<()>>>,
    server_pool: &'static Mutex<ThreadPool>,
    init_recv: &'static crossbeam_channel::Receiver<Msg>,
    num_table_threads: i32,
    table_access: bool,
}

impl TableGroup {
    // Brings up server and bg threads and registers the calling thread
    // as the init thread (participant 0 when it accesses tables).
    pub fn init(conf: TableGroupConfig, table_access: bool) -> anyhow::Result<TableGroup> {
        conf.validate()?;
        let num_table_threads = if table_access {
            conf.num_local_app_threads
        } else {
            conf.num_local_app_threads - 1
        };
        ensure!(
            num_table_threads > 0,
            "no table-accessing threads. num_local_app_threads={}",
            conf.num_local_app_threads
        );
        let ctx = make_static(GlobalContext { conf });
        let bus = make_static(MsgBus::new());
        let vclock = make_static(VectorClockMt::new());
        let tables: &'static TableMap = make_static(RwLock::new(HashMap::new()));
        let barrier = make_static(RegisterBarrier::new());
        let registered = make_static(AtomicI32::new(1)); // init thread is first

        let mut server_recvs = Vec::with_capacity(ctx.num_server());
        for s in 0..ctx.num_server() {
            server_recvs.push(bus.register(ctx.server_thread_id(s))?);
        }
        let mut bg_recvs = Vec::with_capacity(ctx.num_bg());
        for b in 0..ctx.num_bg() {
            bg_recvs.push(bus.register(ctx.bg_thread_id(b))?);
        }
        let init_recv = make_static(bus.register(ctx.init_thread_id())?);

        let bg_ids: Vec<ThreadId> = (0..ctx.num_bg()).map(|b| ctx.bg_thread_id(b)).collect();
        let server_pool = make_static(Mutex::new(ThreadPool::new(ctx.num_server())));
        {
            let pool = server_pool.lock().unwrap();
            for (s, recv) in server_recvs.into_iter().enumerate() {
                let st = server::ServerThread::new(s, ctx, bus, recv, &bg_ids);
                pool.execute(move || server::server_main(st));
            }
        }
        let mut handles = Vec::with_capacity(ctx.num_bg());
        for (b, recv) in bg_recvs.into_iter().enumerate() {
            let worker = bg::BgWorker::new(b, ctx, bus, tables, vclock, recv);
            let handle = std::thread::Builder::new()
                .name(format!("zlbg{}", b))
                .spawn(move || bg::bg_main(worker))?;
            handles.push(handle);
        }

        set_thread_ctx(ctx.init_thread_id());
        if table_access {
            vclock.add_clock(ctx.init_thread_id(), 0)?;
        }
        log::info!(
            "table group up. client={} servers={} bgs={} app_threads={} aggressive={}",
            ctx.conf.client_id,
            ctx.num_server(),
            ctx.num_bg(),
            ctx.conf.num_local_app_threads,
            ctx.conf.aggressive_clock
        );
        Ok(TableGroup {
            ctx,
            bus,
            vclock,
            tables,
            barrier,
            registered,
            bg_handles: make_static(Mutex::new(handles)),
            server_pool,
            init_recv,
            num_table_threads,
            table_access,
        })
    }

    pub fn context(&self) -> &'static GlobalContext {
        self.ctx
    }

    pub fn create_table(
        &self,
        table_id: TableId,
        conf: config::ClientTableConfig,
    ) -> anyhow::Result<()> {
        conf.validate()?;
        let info = conf.info.clone();
        let table = Arc::new(ClientTable::new(table_id, conf, self.ctx, self.bus)?);
        {
            let mut tables = self.tables.write().unwrap();
            ensure!(
                !tables.contains_key(&table_id),
                "table already exists. table={}",
                table_id
            );
            tables.insert(table_id, table);
        }
        for s in 0..self.ctx.num_server() {
            self.bus.send(
                self.ctx.server_thread_id(s),
                Msg::CreateTable {
                    table_id,
                    info: info.clone(),
                },
            )?;
        }
        let mut acks = 0;
        while acks < self.ctx.num_server() {
            match self.init_recv.recv() {
                Ok(Msg::CreateTableReply { .. }) => acks += 1,
                Ok(_) => bail!("create_table: unexpected message"),
                Err(_) => bail!("create_table: bus closed"),
            }
        }
        log::info!(
            "table created. table={} staleness={}",
            table_id,
            info.staleness
        );
        return Ok(());
    }

    // Sizes the registration barrier; table operations proceed only once
    // every declared table thread has arrived.
    pub fn create_table_done(&self) {
        self.barrier.size(self.num_table_threads as usize);
    }

    // The init thread's own arrival, iff it accesses tables.
    pub fn wait_thread_register(&self) {
        if self.table_access {
            self.barrier.wait();
        }
    }

    pub fn register_thread(&self) -> anyhow::Result<ThreadId> {
        ensure!(!thread_ctx_set(), "thread is already registered");
        let offset = self.registered.fetch_add(1, Relaxed);
        ensure!(
            offset < self.ctx.conf.num_local_app_threads,
            "more registrations than declared app threads. declared={}",
            self.ctx.conf.num_local_app_threads
        );
        let id = self.ctx.app_thread_id(offset);
        self.bus.register(id)?;
        self.vclock.add_clock(id, 0)?;
        set_thread_ctx(id);
        self.barrier.wait();
        return Ok(id);
    }

    pub fn deregister_thread(&self) {
        if let Ok(id) = curr_thread_id() {
            self.bus.deregister(id);
        }
        clear_thread_ctx();
    }

    pub fn table(&self, table_id: TableId) -> anyhow::Result<Arc<ClientTable>> {
        match self.tables.read().unwrap().get(&table_id) {
            Some(t) => Ok(t.clone()),
            None => bail!("unknown table. table={}", table_id),
        }
    }

    // Advance this thread's clock. When the tick moves the process
    // minimum, every bg worker seals and ships a clock-carrying oplog; in
    // aggressive mode a tick that did not move the minimum still ships
    // the accumulated oplogs.
    pub fn clock(&self) -> anyhow::Result<()> {
        let id = tick_thread_ctx()?;
        let newmin = self.vclock.tick(id);
        if newmin != 0 {
            for b in 0..self.ctx.num_bg() {
                self.bus.send(self.ctx.bg_thread_id(b), Msg::AppClock)?;
            }
        } else if self.ctx.conf.aggressive_clock {
            for b in 0..self.ctx.num_bg() {
                self.bus.send(self.ctx.bg_thread_id(b), Msg::AppSendOpLogs)?;
            }
        }
        return Ok(());
    }

    // Collective teardown; every outstanding Get must have returned.
    pub fn shut_down(&self) -> anyhow::Result<()> {
        for b in 0..self.ctx.num_bg() {
            self.bus.send(self.ctx.bg_thread_id(b), Msg::ShutDown)?;
        }
        for s in 0..self.ctx.num_server() {
            self.bus.send(self.ctx.server_thread_id(s), Msg::ShutDown)?;
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut g = self.bg_handles.lock().unwrap();
            g.drain(..).collect()
        };
        for handle in handles {
            if handle.join().is_err() {
                log::error!("bg worker panicked during shutdown");
            }
        }
        self.server_pool.lock().unwrap().join();
        self.bus.deregister(self.ctx.init_thread_id());
        clear_thread_ctx();
        log::info!("table group down. client={}", self.ctx.conf.client_id);
        return Ok(());
    }
}
