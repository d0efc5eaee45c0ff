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
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard};

// Fixed-width array of mutexes indexed by hash of a key. Two keys may map
// to the same stripe; a holder must never acquire a second stripe from the
// same StripedLock.
pub struct StripedLock<K> {
    locks: Vec<Mutex<()>>,
    mask: usize,
    marker: PhantomData<K>,
}

impl<K: Hash> StripedLock<K> {
    pub fn new(pool_size: usize) -> StripedLock<K> {
        let n = pool_size.max(1).next_power_of_two();
        let mut locks = Vec::with_capacity(n);
        locks.resize_with(n, || Mutex::new(()));
        StripedLock {
            locks,
            mask: n - 1,
            marker: PhantomData,
        }
    }

    fn stripe(&self, k: &K) -> usize {
        let mut h = DefaultHasher::new();
        k.hash(&mut h);
        (h.finish() as usize) & self.mask
    }

    pub fn lock(&self, k: &K) -> MutexGuard<'_, ()> {
        self.locks[self.stripe(k)].lock().unwrap()
    }

    pub fn try_lock(&self, k: &K) -> Option<MutexGuard<'_, ()>> {
        self.locks[self.stripe(k)].try_lock().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn striped_lock_test() {
        let locks = StripedLock::<i32>::new(4);
        let g = locks.lock(&7);
        // 7 and 7+mask+1 share a stripe only if the hash collides; the same
        // key always does.
        assert!(locks.try_lock(&7).is_none());
        drop(g);
        assert!(locks.try_lock(&7).is_some());
    }

    #[test]
    fn pool_size_rounding_test() {
        let locks = StripedLock::<i32>::new(33);
        assert_eq!(64, locks.locks.len());
        let locks = StripedLock::<i32>::new(0);
        assert_eq!(1, locks.locks.len());
    }
}
