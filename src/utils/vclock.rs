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
use crate::ThreadId;
use anyhow::{bail, ensure};
use std::collections::HashMap;
use std::sync::RwLock;

// Per-thread clocks plus a cached minimum. The minimum is the frontier of
// local progress: a tick only moves it when the ticked thread was the
// unique slowest.
pub struct VectorClock {
    clocks: HashMap<ThreadId, i32>,
    min_clock: i32,
}

impl VectorClock {
    pub fn new() -> VectorClock {
        VectorClock {
            clocks: HashMap::new(),
            min_clock: 0,
        }
    }

    pub fn with_ids(ids: &[ThreadId]) -> VectorClock {
        let mut v = VectorClock::new();
        for &id in ids {
            v.add_clock(id, 0).unwrap();
        }
        v
    }

    pub fn add_clock(&mut self, id: ThreadId, clock: i32) -> anyhow::Result<()> {
        ensure!(
            self.clocks.insert(id, clock).is_none(),
            "add_clock: duplicate thread. id={}",
            id
        );
        if clock < self.min_clock || self.clocks.len() == 1 {
            self.min_clock = clock;
        }
        return Ok(());
    }

    // Return the new minimum iff the ticked thread was the unique slowest
    // before the tick, 0 otherwise.
    pub fn tick(&mut self, id: ThreadId) -> i32 {
        let clock = match self.clocks.get_mut(&id) {
            Some(v) => v,
            None => panic!("tick: unknown thread. id={}", id),
        };
        let was = *clock;
        *clock += 1;
        if was != self.min_clock {
            return 0;
        }
        let newmin = self.clocks.values().min().copied().unwrap();
        if newmin == self.min_clock {
            // another thread shared the old minimum
            return 0;
        }
        debug_assert_eq!(self.min_clock + 1, newmin);
        self.min_clock = newmin;
        return newmin;
    }

    pub fn clock(&self, id: ThreadId) -> anyhow::Result<i32> {
        match self.clocks.get(&id) {
            Some(&v) => Ok(v),
            None => bail!("clock: unknown thread. id={}", id),
        }
    }

    pub fn min_clock(&self) -> i32 {
        self.min_clock
    }
}

// Reader-writer lock over VectorClock; the bg workers read the minimum on
// every oplog seal while app threads tick.
pub struct VectorClockMt(RwLock<VectorClock>);

impl VectorClockMt {
    pub fn new() -> VectorClockMt {
        VectorClockMt(RwLock::new(VectorClock::new()))
    }

    pub fn add_clock(&self, id: ThreadId, clock: i32) -> anyhow::Result<()> {
        self.0.write().unwrap().add_clock(id, clock)
    }

    pub fn tick(&self, id: ThreadId) -> i32 {
        self.0.write().unwrap().tick(id)
    }

    pub fn clock(&self, id: ThreadId) -> anyhow::Result<i32> {
        self.0.read().unwrap().clock(id)
    }

    pub fn min_clock(&self) -> i32 {
        self.0.read().unwrap().min_clock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_unique_slowest_test() {
        let mut v = VectorClock::new();
        v.add_clock(1, 0).unwrap();
        v.add_clock(2, 0).unwrap();
        // both at 0: neither tick alone is the unique slowest until the
        // last one moves.
        assert_eq!(0, v.tick(1));
        assert_eq!(1, v.tick(2));
        assert_eq!(1, v.min_clock());
        // 1 and 2 both at 1 now; tick 1 twice: first returns 0 (shared
        // minimum), second returns 0 (not the slowest).
        assert_eq!(0, v.tick(1));
        assert_eq!(0, v.tick(1));
        assert_eq!(3, v.clock(1).unwrap());
        assert_eq!(2, v.tick(2));
    }

    #[test]
    fn single_thread_tick_test() {
        let mut v = VectorClock::new();
        v.add_clock(7, 0).unwrap();
        assert_eq!(1, v.tick(7));
        assert_eq!(2, v.tick(7));
    }

    #[test]
    fn dup_add_test() {
        let mut v = VectorClock::new();
        v.add_clock(7, 0).unwrap();
        assert!(v.add_clock(7, 0).is_err());
    }

    #[test]
    fn mt_test() {
        let v = VectorClockMt::new();
        v.add_clock(1, 0).unwrap();
        assert_eq!(0, v.min_clock());
        assert_eq!(1, v.tick(1));
        assert_eq!(1, v.clock(1).unwrap());
    }
}
