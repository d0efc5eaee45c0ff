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
use crate::oplog::BgOpLog;
use crate::{RowId, TableId, ThreadId};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct RowRequestInfo {
    pub app_thread_id: ThreadId,
    pub clock: i32,
    // latest sealed oplog version when the request was enqueued
    pub version: u32,
    pub sent: bool,
}

// Oplog versions are u32 and wrap; order is only defined inside the
// half-window anchored at the current version: a precedes b iff a is
// further behind curr than b is.
fn version_lt(a: u32, b: u32, curr: u32) -> bool {
    curr.wrapping_sub(a) > curr.wrapping_sub(b)
}

// Tracks row fetches that are in flight or waiting behind one, and keeps
// each sealed oplog alive exactly as long as a request sent before it
// might need it replayed onto the server's reply. Owned by one bg worker;
// no internal locking.
//
// A reply may be produced by the server before later-sent oplogs reach
// the row, so the reply carries the version actually applied and the bg
// worker replays everything newer out of the retained oplogs.
pub struct RowRequestMgr {
    // per (table, row), ascending clock
    pending: HashMap<(TableId, RowId), Vec<RowRequestInfo>>,
    version_oplogs: HashMap<u32, Arc<BgOpLog>>,
    // how many pending requests carry each version
    version_request_cnt: HashMap<u32, i32>,
}

impl RowRequestMgr {
    pub fn new() -> RowRequestMgr {
        RowRequestMgr {
            pending: HashMap::new(),
            version_oplogs: HashMap::new(),
            version_request_cnt: HashMap::new(),
        }
    }

    // True means the caller must send the request: nothing in flight will
    // cover it. False means a pending request at an equal or higher clock
    // will satisfy this one when its reply lands.
    pub fn add_row_request(
        &mut self,
        mut request: RowRequestInfo,
        table_id: TableId,
        row_id: RowId,
    ) -> bool {
        let list = self.pending.entry((table_id, row_id)).or_insert_with(Vec::new);
        let send = list.iter().all(|r| r.clock < request.clock);
        request.sent = send;
        *self
            .version_request_cnt
            .entry(request.version)
            .or_insert(0) += 1;
        let pos = list
            .iter()
            .position(|r| r.clock > request.clock)
            .unwrap_or(list.len());
        list.insert(pos, request);
        return send;
    }

    // Pop every request the reply satisfies, collect their app thread
    // ids, and release oplog versions nothing pends on anymore. Returns
    // the number of requests satisfied.
    pub fn inform_reply(
        &mut self,
        table_id: TableId,
        row_id: RowId,
        reply_clock: i32,
        curr_version: u32,
        app_thread_ids: &mut Vec<ThreadId>,
    ) -> usize {
        app_thread_ids.clear();
        let mut popped_versions = Vec::new();
        if let Some(list) = self.pending.get_mut(&(table_id, row_id)) {
            while !list.is_empty() && list[0].clock <= reply_clock {
                let req = list.remove(0);
                app_thread_ids.push(req.app_thread_id);
                popped_versions.push(req.version);
            }
            if list.is_empty() {
                self.pending.remove(&(table_id, row_id));
            }
        }
        for version in popped_versions {
            let cnt = self
                .version_request_cnt
                .get_mut(&version)
                .unwrap_or_else(|| {
                    panic!("inform_reply: untracked version. version={}", version)
                });
            *cnt -= 1;
            assert!(
                *cnt >= 0,
                "inform_reply: version count underflow. version={}",
                version
            );
            if *cnt == 0 {
                self.version_request_cnt.remove(&version);
                self.clean_version_oplogs(version, curr_version);
            }
        }
        return app_thread_ids.len();
    }

    // Retain a freshly sealed oplog only if some pending request predates
    // it; otherwise refuse and let the caller drop it. Such a request's
    // reply may carry a version before `version`, and the replay then
    // needs these deltas.
    pub fn add_oplog(&mut self, version: u32, oplog: BgOpLog) -> bool {
        if !self.has_pending_older_than(version, version) {
            return false;
        }
        let prev = self.version_oplogs.insert(version, Arc::new(oplog));
        assert!(
            prev.is_none(),
            "add_oplog: version already sealed. version={}",
            version
        );
        return true;
    }

    pub fn oplog(&self, version: u32) -> Option<&Arc<BgOpLog>> {
        self.version_oplogs.get(&version)
    }

    fn has_pending_older_than(&self, w: u32, curr: u32) -> bool {
        self.version_request_cnt
            .keys()
            .any(|&v| version_lt(v, w, curr))
    }

    // The last request of req_version has been answered: walk the sealed
    // versions after it and drop each one until we hit one that an older
    // pending request still needs for replay.
    fn clean_version_oplogs(&mut self, req_version: u32, curr_version: u32) {
        let span = curr_version.wrapping_sub(req_version);
        let mut w = req_version;
        for _ in 0..span {
            w = w.wrapping_add(1);
            if self.has_pending_older_than(w, curr_version) {
                break;
            }
            self.version_oplogs.remove(&w);
        }
    }

    #[cfg(test)]
    fn num_pending(&self) -> usize {
        self.pending.values().map(|l| l.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(app_thread_id: ThreadId, clock: i32, version: u32) -> RowRequestInfo {
        RowRequestInfo {
            app_thread_id,
            clock,
            version,
            sent: false,
        }
    }

    fn oplog_with(table_id: TableId, row_id: RowId, col: i32, delta: f64) -> BgOpLog {
        let mut rows = HashMap::new();
        let mut rowlog = HashMap::new();
        rowlog.insert(col, delta);
        rows.insert(row_id, rowlog);
        let mut oplog = BgOpLog::new();
        oplog.add_table(table_id, rows);
        oplog
    }

    #[test]
    fn coalescing_test() {
        let mut mgr = RowRequestMgr::new();
        // empty list: send
        assert!(mgr.add_row_request(req(100, 5, 0), 0, 1));
        // same clock: coalesced behind the first
        assert!(!mgr.add_row_request(req(101, 5, 0), 0, 1));
        // lower clock: the in-flight reply covers it
        assert!(!mgr.add_row_request(req(102, 3, 0), 0, 1));
        // strictly higher clock than everything pending: send
        assert!(mgr.add_row_request(req(103, 7, 0), 0, 1));
        // other row: independent
        assert!(mgr.add_row_request(req(104, 5, 0), 0, 2));

        let mut ids = Vec::new();
        // reply at clock 5 satisfies 3, 5, 5 but not 7
        assert_eq!(3, mgr.inform_reply(0, 1, 5, 0, &mut ids));
        assert_eq!(vec![102, 100, 101], ids);
        assert_eq!(2, mgr.num_pending());
        assert_eq!(1, mgr.inform_reply(0, 1, 9, 0, &mut ids));
        assert_eq!(vec![103], ids);
        // nothing pending for that row anymore
        assert_eq!(0, mgr.inform_reply(0, 1, 9, 0, &mut ids));
    }

    #[test]
    fn version_retention_replay_test() {
        let mut mgr = RowRequestMgr::new();
        // request A goes out before any oplog has shipped
        assert!(mgr.add_row_request(req(100, 5, 0), 0, 1));
        assert!(mgr.add_oplog(1, oplog_with(0, 1, 0, 1.0)));
        // request B goes out with version 1 sealed
        assert!(mgr.add_row_request(req(101, 3, 1), 0, 2));
        assert!(mgr.add_oplog(2, oplog_with(0, 2, 0, 2.0)));
        assert!(mgr.add_oplog(3, oplog_with(0, 2, 0, 3.0)));

        // A answered: version 1 is no longer needed by anyone, but B (at
        // version 1) still needs 2 and 3 replayed onto its reply.
        let mut ids = Vec::new();
        assert_eq!(1, mgr.inform_reply(0, 1, 5, 3, &mut ids));
        assert_eq!(vec![100], ids);
        assert!(mgr.oplog(1).is_none());
        assert!(mgr.oplog(2).is_some());
        assert!(mgr.oplog(3).is_some());

        // B answered, server applied through version 1: the replay range
        // is (1, 3]; afterwards everything may go.
        assert_eq!(1, mgr.inform_reply(0, 2, 3, 3, &mut ids));
        assert_eq!(vec![101], ids);
        assert!(mgr.oplog(2).is_none());
        assert!(mgr.oplog(3).is_none());
    }

    #[test]
    fn oplog_without_pending_is_refused_test() {
        let mut mgr = RowRequestMgr::new();
        assert!(!mgr.add_oplog(1, BgOpLog::new()));
        assert!(mgr.oplog(1).is_none());
    }

    #[test]
    fn version_wrap_test() {
        let mut mgr = RowRequestMgr::new();
        let near_wrap = u32::MAX - 1;
        assert!(mgr.add_row_request(req(100, 1, near_wrap), 0, 1));
        assert!(mgr.add_oplog(u32::MAX, oplog_with(0, 1, 0, 1.0)));
        // the version counter wrapped to 0
        assert!(mgr.add_oplog(0, oplog_with(0, 1, 0, 2.0)));
        assert!(mgr.oplog(u32::MAX).is_some());
        assert!(mgr.oplog(0).is_some());

        let mut ids = Vec::new();
        assert_eq!(1, mgr.inform_reply(0, 1, 1, 0, &mut ids));
        // the walk crosses the wrap boundary
        assert!(mgr.oplog(u32::MAX).is_none());
        assert!(mgr.oplog(0).is_none());
    }
}
