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
use crate::config::{ClientTableConfig, RowType, TableGroupConfig, TableInfo};
use crate::row::DenseRow;
use crate::row::Row;
use crate::TableGroup;
use std::thread;
use std::time::{Duration, Instant};

lazy_static::lazy_static! {
    static ref LOG_INIT: () = crate::init_log();
}

fn test_conf(num_app: i32, aggressive: bool) -> TableGroupConfig {
    lazy_static::initialize(&LOG_INIT);
    let mut conf = TableGroupConfig::default();
    conf.num_local_app_threads = num_app;
    conf.num_local_server_threads = 2;
    conf.num_total_server_threads = 2;
    conf.num_local_bg_threads = 2;
    conf.num_total_bg_threads = 2;
    conf.local_id_max = 63;
    conf.aggressive_clock = aggressive;
    conf
}

fn table_conf(staleness: i32) -> ClientTableConfig {
    ClientTableConfig {
        info: TableInfo {
            staleness,
            row_type: RowType::Dense(4),
        },
        process_cache_capacity: 64,
    }
}

#[test]
fn read_your_writes_test() {
    let tg = TableGroup::init(test_conf(1, false), true).unwrap();
    tg.create_table(0, table_conf(1)).unwrap();
    tg.create_table_done();
    tg.wait_thread_register();
    let table = tg.table(0).unwrap();

    table.inc(7, 0, 3.0).unwrap();
    // cold cache: the fetch blocks on the reply, and the unflushed inc
    // must be visible on the fetched row
    let acc = table.get(7).unwrap();
    assert_eq!(3.0, acc.val(0));
    drop(acc);

    // the row is cached now; a batch update lands on the local copy too
    table.batch_inc(7, &[0, 2], &[1.0, 8.0]).unwrap();
    let acc = table.get(7).unwrap();
    assert_eq!(4.0, acc.val(0));
    assert_eq!(8.0, acc.val(2));
    drop(acc);

    tg.clock().unwrap();
    let acc = table.get(7).unwrap();
    assert_eq!(4.0, acc.val(0));
    drop(acc);
    tg.shut_down().unwrap();
}

#[test]
fn ssp_blocking_test() {
    let tg = TableGroup::init(test_conf(2, false), true).unwrap();
    tg.create_table(0, table_conf(1)).unwrap();
    tg.create_table_done();

    let tg2 = tg.clone();
    let worker = thread::spawn(move || {
        tg2.register_thread().unwrap();
        let table = tg2.table(0).unwrap();
        thread::sleep(Duration::from_millis(300));
        table.inc(5, 1, 42.0).unwrap();
        // the worker was the slowest; this tick advances the minimum and
        // ships the inc
        tg2.clock().unwrap();
        tg2.deregister_thread();
    });
    tg.wait_thread_register();

    tg.clock().unwrap();
    tg.clock().unwrap();
    let table = tg.table(0).unwrap();
    let begin = Instant::now();
    // thread clock 2, staleness 1: needs applied clock >= 1, so this
    // blocks until the worker's tick crosses the boundary
    let acc = table.get(5).unwrap();
    assert!(begin.elapsed() >= Duration::from_millis(250));
    assert!(acc.clock() >= 1);
    assert_eq!(42.0, acc.val(1));
    drop(acc);

    // row applied clock equals the bound now: no blocking
    let acc = table.get(5).unwrap();
    assert_eq!(42.0, acc.val(1));
    drop(acc);

    worker.join().unwrap();
    tg.shut_down().unwrap();
}

#[test]
fn coalesced_get_test() {
    let tg = TableGroup::init(test_conf(3, false), true).unwrap();
    tg.create_table(0, table_conf(0)).unwrap();
    tg.create_table_done();

    let mut workers = Vec::new();
    for _ in 0..2 {
        let tg2 = tg.clone();
        workers.push(thread::spawn(move || {
            tg2.register_thread().unwrap();
            let table = tg2.table(0).unwrap();
            // both threads fetch the same cold row in the same tick
            let acc = table.get(9).unwrap();
            let v = acc.val(0);
            drop(acc);
            tg2.deregister_thread();
            v
        }));
    }
    tg.wait_thread_register();
    for w in workers {
        assert_eq!(0.0, w.join().unwrap());
    }
    // both were satisfied by one cached instance
    assert!(tg.table(0).unwrap().storage().find(9).is_some());
    assert_eq!(1, tg.table(0).unwrap().storage().len());
    tg.shut_down().unwrap();
}

#[test]
fn aggressive_clock_test() {
    let tg = TableGroup::init(test_conf(2, true), true).unwrap();
    tg.create_table(0, table_conf(0)).unwrap();
    tg.create_table_done();

    let tg2 = tg.clone();
    let worker = thread::spawn(move || {
        tg2.register_thread().unwrap();
        let table = tg2.table(0).unwrap();
        table.inc(3, 0, 7.0).unwrap();
        // the init thread is still at 0, so this tick does not advance
        // the minimum; aggressive mode ships the oplogs anyway
        tg2.clock().unwrap();
        tg2.deregister_thread();
    });
    tg.wait_thread_register();
    worker.join().unwrap();
    thread::sleep(Duration::from_millis(200));

    let table = tg.table(0).unwrap();
    // the delta left the pending buffer even though no clock boundary
    // was crossed
    let mut probe = DenseRow::new(4);
    table.oplog().apply_pending(3, &mut probe);
    assert_eq!(0.0, probe.val(0));

    let acc = table.get(3).unwrap();
    assert_eq!(7.0, acc.val(0));
    drop(acc);
    tg.shut_down().unwrap();
}

#[test]
fn conservative_clock_test() {
    let tg = TableGroup::init(test_conf(2, false), true).unwrap();
    tg.create_table(0, table_conf(0)).unwrap();
    tg.create_table_done();

    let tg2 = tg.clone();
    let worker = thread::spawn(move || {
        tg2.register_thread().unwrap();
        let table = tg2.table(0).unwrap();
        table.inc(3, 0, 7.0).unwrap();
        tg2.clock().unwrap();
        tg2.deregister_thread();
    });
    tg.wait_thread_register();
    worker.join().unwrap();
    thread::sleep(Duration::from_millis(200));

    let table = tg.table(0).unwrap();
    // no clock boundary, no aggressive mode: the delta stays pending
    let mut probe = DenseRow::new(4);
    table.oplog().apply_pending(3, &mut probe);
    assert_eq!(7.0, probe.val(0));

    // a fetch still observes it as a local prefix
    let acc = table.get(3).unwrap();
    assert_eq!(7.0, acc.val(0));
    drop(acc);
    tg.shut_down().unwrap();
}

#[test]
fn register_barrier_test() {
    let tg = TableGroup::init(test_conf(3, false), true).unwrap();
    tg.create_table(0, table_conf(0)).unwrap();
    tg.create_table_done();

    let tg1 = tg.clone();
    let early = thread::spawn(move || {
        let begin = Instant::now();
        tg1.register_thread().unwrap();
        let waited = begin.elapsed();
        tg1.deregister_thread();
        waited
    });
    let tg2 = tg.clone();
    let late = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        tg2.register_thread().unwrap();
        tg2.deregister_thread();
    });
    tg.wait_thread_register();
    // the early thread parked until the last declared thread arrived
    assert!(early.join().unwrap() >= Duration::from_millis(250));
    late.join().unwrap();

    // one more registration than declared is a programming error
    let tg3 = tg.clone();
    let extra = thread::spawn(move || tg3.register_thread().map(|_| ()));
    assert!(extra.join().unwrap().is_err());
    tg.shut_down().unwrap();
}

#[test]
fn app_error_test() {
    let tg = TableGroup::init(test_conf(1, false), true).unwrap();
    tg.create_table(0, table_conf(0)).unwrap();
    assert!(tg.table(99).is_err());
    assert!(tg.create_table(0, table_conf(0)).is_err());
    // the init thread is implicitly registered already
    assert!(tg.register_thread().is_err());

    // table operations from an unregistered thread are rejected
    let table = tg.table(0).unwrap();
    let stray = thread::spawn(move || table.inc(1, 0, 1.0));
    assert!(stray.join().unwrap().is_err());

    tg.create_table_done();
    tg.wait_thread_register();
    tg.shut_down().unwrap();
}
