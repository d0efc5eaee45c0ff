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
use crate::common;
use crate::row::{DenseRow, Row};
use anyhow::{anyhow, ensure};
use std::collections::HashMap;
use yaml_rust::Yaml;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsistencyModel {
    Ssp,
}

#[derive(Clone, Debug)]
pub enum RowType {
    Dense(usize),
}

impl RowType {
    // A zeroed row of this type; also the sample used to deserialize
    // reply payloads.
    pub fn sample(&self) -> Box<dyn Row> {
        match self {
            &RowType::Dense(width) => Box::new(DenseRow::new(width)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TableInfo {
    pub staleness: i32,
    pub row_type: RowType,
}

#[derive(Clone, Debug)]
pub struct ClientTableConfig {
    pub info: TableInfo,
    pub process_cache_capacity: usize,
}

impl ClientTableConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.info.staleness >= 0, "staleness must be non-negative");
        ensure!(
            self.process_cache_capacity > 0,
            "process_cache_capacity must be positive"
        );
        match self.info.row_type {
            RowType::Dense(width) => ensure!(width > 0, "dense row width must be positive"),
        }
        return Ok(());
    }
}

#[derive(Clone, Debug)]
pub struct TableGroupConfig {
    pub num_total_server_threads: i32,
    pub num_local_server_threads: i32,
    // includes the init thread
    pub num_local_app_threads: i32,
    pub num_local_bg_threads: i32,
    pub num_total_bg_threads: i32,
    pub num_tables: i32,
    pub client_id: i32,
    pub num_total_clients: i32,
    // cluster topology; pass-through for a multi-client deployment
    pub host_map: HashMap<i32, String>,
    pub server_ids: Vec<i32>,
    // this client's thread-id range
    pub local_id_min: i32,
    pub local_id_max: i32,
    pub consistency_model: ConsistencyModel,
    // server-side parameters, carried but not interpreted here
    pub server_ring_size: i32,
    pub snapshot_clock: i32,
    pub resume_clock: i32,
    pub snapshot_dir: String,
    pub aggressive_clock: bool,
}

impl Default for TableGroupConfig {
    fn default() -> TableGroupConfig {
        TableGroupConfig {
            num_total_server_threads: 1,
            num_local_server_threads: 1,
            num_local_app_threads: 1,
            num_local_bg_threads: 1,
            num_total_bg_threads: 1,
            num_tables: 1,
            client_id: 0,
            num_total_clients: 1,
            host_map: HashMap::new(),
            server_ids: Vec::new(),
            local_id_min: 0,
            local_id_max: 1023,
            consistency_model: ConsistencyModel::Ssp,
            server_ring_size: 0,
            snapshot_clock: -1,
            resume_clock: -1,
            snapshot_dir: String::new(),
            aggressive_clock: false,
        }
    }
}

impl TableGroupConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.num_local_server_threads > 0, "need local server threads");
        ensure!(self.num_local_bg_threads > 0, "need local bg threads");
        ensure!(self.num_local_app_threads > 0, "need local app threads");
        ensure!(self.num_tables >= 0, "num_tables must be non-negative");
        ensure!(
            self.num_total_server_threads >= self.num_local_server_threads,
            "num_total_server_threads below local count"
        );
        ensure!(
            self.num_total_bg_threads >= self.num_local_bg_threads,
            "num_total_bg_threads below local count"
        );
        ensure!(
            self.num_total_clients >= 1 && self.client_id < self.num_total_clients,
            "bad client id. client_id={} num_total_clients={}",
            self.client_id,
            self.num_total_clients
        );
        let needed = self.num_local_server_threads
            + self.num_local_bg_threads
            + self.num_local_app_threads;
        ensure!(
            self.local_id_max - self.local_id_min + 1 >= needed,
            "thread id range too small. needed={} range=[{}, {}]",
            needed,
            self.local_id_min,
            self.local_id_max
        );
        return Ok(());
    }
}

fn apply_key(conf: &mut TableGroupConfig, key: &str, val: &Yaml) {
    macro_rules! toi32 {
        ($field: ident) => {
            match common::yaml_try_toi32(val) {
                Some(v) => conf.$field = v,
                None => log::warn!("invalid config val. key={} val={:?}", key, val),
            }
        };
    }
    match key {
        "num_total_server_threads" => toi32!(num_total_server_threads),
        "num_local_server_threads" => toi32!(num_local_server_threads),
        "num_local_app_threads" => toi32!(num_local_app_threads),
        "num_local_bg_threads" => toi32!(num_local_bg_threads),
        "num_total_bg_threads" => toi32!(num_total_bg_threads),
        "num_tables" => toi32!(num_tables),
        "client_id" => toi32!(client_id),
        "num_total_clients" => toi32!(num_total_clients),
        "local_id_min" => toi32!(local_id_min),
        "local_id_max" => toi32!(local_id_max),
        "server_ring_size" => toi32!(server_ring_size),
        "snapshot_clock" => toi32!(snapshot_clock),
        "resume_clock" => toi32!(resume_clock),
        "snapshot_dir" => match common::yaml_try_tostr(val) {
            Some(v) => conf.snapshot_dir = v,
            None => log::warn!("invalid config val. key={} val={:?}", key, val),
        },
        "aggressive_clock" => match common::yaml_try_tobool(val) {
            Some(v) => conf.aggressive_clock = v,
            None => log::warn!("invalid config val. key={} val={:?}", key, val),
        },
        "consistency_model" => match common::yaml_try_tostr(val).as_deref() {
            Some("ssp") | Some("SSP") => conf.consistency_model = ConsistencyModel::Ssp,
            _ => log::warn!("unknown consistency model. val={:?}", val),
        },
        "host_map" => match val.as_hash() {
            Some(hash) => {
                for (k, v) in hash {
                    match (common::yaml_try_toi32(k), common::yaml_try_tostr(v)) {
                        (Some(id), Some(host)) => {
                            conf.host_map.insert(id, host);
                        }
                        _ => log::warn!("invalid host_map entry. key={:?}", k),
                    }
                }
            }
            None => log::warn!("host_map must be a mapping"),
        },
        "server_ids" => match val.as_vec() {
            Some(ids) => {
                conf.server_ids = ids
                    .iter()
                    .filter_map(common::yaml_try_toi32)
                    .collect();
            }
            None => log::warn!("server_ids must be a list"),
        },
        _ => log::warn!("unknown config key. key={}", key),
    }
}

// Defaults overridden by a zhulong.conf yaml file.
pub fn load(path: &str) -> anyhow::Result<TableGroupConfig> {
    let mut conf = TableGroupConfig::default();
    let docs = common::load_yaml(path)?;
    if let Some(doc) = docs.first() {
        let hash = doc
            .as_hash()
            .ok_or_else(|| anyhow!("config is not a mapping. path={}", path))?;
        for (key, val) in hash {
            match common::yaml_try_tostr(key) {
                Some(k) => apply_key(&mut conf, &k, val),
                None => log::warn!("unknown config key. key={:?}", key),
            }
        }
    }
    conf.validate()?;
    return Ok(conf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn validate_test() {
        let conf = TableGroupConfig::default();
        conf.validate().unwrap();

        let mut bad = conf.clone();
        bad.num_local_bg_threads = 0;
        assert!(bad.validate().is_err());

        let mut bad = conf.clone();
        bad.local_id_max = bad.local_id_min;
        bad.num_local_app_threads = 8;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn table_config_validate_test() {
        let conf = ClientTableConfig {
            info: TableInfo {
                staleness: 0,
                row_type: RowType::Dense(4),
            },
            process_cache_capacity: 16,
        };
        conf.validate().unwrap();

        let mut bad = conf.clone();
        bad.process_cache_capacity = 0;
        assert!(bad.validate().is_err());

        let mut bad = conf.clone();
        bad.info.staleness = -1;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn load_test() {
        let dir = std::env::temp_dir().join("zhulong_config_load_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("zhulong.conf");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(
            b"num_local_app_threads: 4\n\
              num_local_bg_threads: 2\n\
              aggressive_clock: true\n\
              consistency_model: ssp\n\
              num_total_bg_threads: 2\n\
              some_future_knob: 7\n",
        )
        .unwrap();
        drop(f);
        let conf = load(path.to_str().unwrap()).unwrap();
        assert_eq!(4, conf.num_local_app_threads);
        assert_eq!(2, conf.num_local_bg_threads);
        assert!(conf.aggressive_clock);
        assert_eq!(ConsistencyModel::Ssp, conf.consistency_model);
    }
}
