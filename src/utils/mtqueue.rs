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
use std::collections::VecDeque;
use std::sync::Mutex;

pub struct MtQueue<T>(Mutex<VecDeque<T>>);

impl<T> MtQueue<T> {
    pub fn new() -> MtQueue<T> {
        MtQueue(Mutex::new(VecDeque::new()))
    }

    pub fn push(&self, v: T) {
        let mut q = self.0.lock().unwrap();
        q.push_back(v);
    }

    pub fn pop(&self) -> Option<T> {
        let mut q = self.0.lock().unwrap();
        q.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtqueue_test() {
        let q = MtQueue::new();
        assert_eq!(None, q.pop());
        q.push(33);
        q.push(77);
        assert_eq!(Some(33), q.pop());
        assert_eq!(Some(77), q.pop());
        assert_eq!(None, q.pop());
    }
}
