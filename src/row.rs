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
use crate::utils::ser;
use crate::ColumnId;
use anyhow::ensure;

pub type Val = f64;

// A row is an opaque value that knows how to absorb column deltas and to
// move across the wire. Tables hold a sample row; deserialize() builds a
// fresh row of the sample's type from a reply payload.
pub trait Row: Send + Sync {
    fn apply_update(&mut self, column_id: ColumnId, delta: Val);
    fn apply_batch_update(&mut self, column_ids: &[ColumnId], deltas: &[Val]);
    fn val(&self, column_id: ColumnId) -> Val;
    fn serialize(&self, out: &mut Vec<u8>);
    fn deserialize(&self, data: &[u8]) -> anyhow::Result<Box<dyn Row>>;
    fn clone_row(&self) -> Box<dyn Row>;
}

// Fixed-width dense vector of f64, the standard row of ML workloads.
pub struct DenseRow {
    vals: Vec<Val>,
}

impl DenseRow {
    pub fn new(width: usize) -> DenseRow {
        DenseRow {
            vals: vec![0.0; width],
        }
    }

    pub fn width(&self) -> usize {
        self.vals.len()
    }
}

impl Row for DenseRow {
    fn apply_update(&mut self, column_id: ColumnId, delta: Val) {
        self.vals[column_id as usize] += delta;
    }

    fn apply_batch_update(&mut self, column_ids: &[ColumnId], deltas: &[Val]) {
        assert_eq!(
            column_ids.len(),
            deltas.len(),
            "apply_batch_update: column/delta mismatch"
        );
        for (idx, &col) in column_ids.iter().enumerate() {
            self.vals[col as usize] += deltas[idx];
        }
    }

    fn val(&self, column_id: ColumnId) -> Val {
        self.vals[column_id as usize]
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        ser::ser_u32(out, self.vals.len() as u32);
        for &v in &self.vals {
            ser::ser_f64(out, v);
        }
    }

    fn deserialize(&self, data: &[u8]) -> anyhow::Result<Box<dyn Row>> {
        let width = ser::de_u32(data, 0)? as usize;
        ensure!(
            width == self.vals.len(),
            "DenseRow: width mismatch. expected={} actual={}",
            self.vals.len(),
            width
        );
        let mut vals = Vec::with_capacity(width);
        for idx in 0..width {
            vals.push(ser::de_f64(data, 4 + idx * 8)?);
        }
        return Ok(Box::new(DenseRow { vals }));
    }

    fn clone_row(&self) -> Box<dyn Row> {
        Box::new(DenseRow {
            vals: self.vals.clone(),
        })
    }
}
