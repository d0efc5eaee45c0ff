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
use clap::{App, Arg};
use rand::Rng;
use std::thread;
use std::time::Instant;
use zhulong::config::{ClientTableConfig, RowType, TableGroupConfig, TableInfo};
use zhulong::TableGroup;

fn worker_main(tg: TableGroup, rows: i32, cols: usize, iters: i32) -> u64 {
    tg.register_thread().unwrap();
    let table = tg.table(0).unwrap();
    let mut rng = rand::thread_rng();
    let mut ops = 0u64;
    for _ in 0..iters {
        for _ in 0..8 {
            let row = rng.gen_range(0..rows);
            let col = rng.gen_range(0..cols) as i32;
            table.inc(row, col, 1.0).unwrap();
            let acc = table.get(row).unwrap();
            let _ = acc.val(col);
            ops += 2;
        }
        tg.clock().unwrap();
    }
    tg.deregister_thread();
    ops
}

fn arg_i32(matches: &clap::ArgMatches, name: &str) -> i32 {
    matches
        .value_of(name)
        .unwrap()
        .parse()
        .unwrap_or_else(|_| panic!("invalid --{}", name))
}

fn main() {
    zhulong::init_log();
    let cmdline = App::new("ZhuLong(烛龙) Parameter Server")
        .version(zhulong::ZL_VERSTR)
        .author("盏一 <w@hidva.com>")
        .about("zlbench drives a local ZhuLong cluster with synthetic SSP traffic")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("optional zhulong.conf overriding cluster defaults"),
        )
        .arg(
            Arg::with_name("threads")
                .short("t")
                .long("threads")
                .takes_value(true)
                .default_value("4"),
        )
        .arg(
            Arg::with_name("rows")
                .long("rows")
                .takes_value(true)
                .default_value("1024"),
        )
        .arg(
            Arg::with_name("cols")
                .long("cols")
                .takes_value(true)
                .default_value("8"),
        )
        .arg(
            Arg::with_name("iters")
                .short("i")
                .long("iters")
                .takes_value(true)
                .default_value("200"),
        )
        .arg(
            Arg::with_name("staleness")
                .short("s")
                .long("staleness")
                .takes_value(true)
                .default_value("2"),
        )
        .get_matches();

    let threads = arg_i32(&cmdline, "threads");
    let rows = arg_i32(&cmdline, "rows");
    let cols = arg_i32(&cmdline, "cols") as usize;
    let iters = arg_i32(&cmdline, "iters");
    let staleness = arg_i32(&cmdline, "staleness");
    assert!(threads > 0 && rows > 0 && cols > 0 && iters > 0);

    let mut conf = match cmdline.value_of("config") {
        Some(path) => zhulong::config::load(path).expect("load config failed"),
        None => TableGroupConfig::default(),
    };
    // workers plus the init thread, which stays off the tables
    conf.num_local_app_threads = threads + 1;
    conf.num_local_bg_threads = conf.num_local_bg_threads.max(2);
    conf.num_total_bg_threads = conf.num_local_bg_threads;
    conf.num_local_server_threads = conf.num_local_server_threads.max(2);
    conf.num_total_server_threads = conf.num_local_server_threads;
    conf.local_id_max = conf.local_id_min + 1024;

    let tg = TableGroup::init(conf, false).expect("table group init failed");
    // cache half the working set so eviction is part of the benchmark
    let table_conf = ClientTableConfig {
        info: TableInfo {
            staleness,
            row_type: RowType::Dense(cols),
        },
        process_cache_capacity: (rows as usize / 2).max(1),
    };
    tg.create_table(0, table_conf).expect("create table failed");
    tg.create_table_done();

    log::info!(
        "benchmark start. threads={} rows={} cols={} iters={} staleness={}",
        threads,
        rows,
        cols,
        iters,
        staleness
    );
    let begin = Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let tg2 = tg.clone();
            thread::spawn(move || worker_main(tg2, rows, cols, iters))
        })
        .collect();
    tg.wait_thread_register();
    let mut ops = 0u64;
    for handle in handles {
        ops += handle.join().unwrap();
    }
    let secs = begin.elapsed().as_secs_f64();
    log::info!(
        "benchmark done. ops={} secs={:.3} ops_per_sec={:.0}",
        ops,
        secs,
        ops as f64 / secs
    );
    tg.shut_down().expect("shutdown failed");
}
