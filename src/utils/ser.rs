/*
Copyright 2021 <盏一 w@hidva.com>
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
use anyhow::ensure;
use std::mem::size_of;

// little-endian on the wire

pub fn ser_u32(out: &mut Vec<u8>, val: u32) {
    out.extend_from_slice(&val.to_le_bytes());
}

pub fn ser_i32(out: &mut Vec<u8>, val: i32) {
    out.extend_from_slice(&val.to_le_bytes());
}

pub fn ser_f64(out: &mut Vec<u8>, val: f64) {
    out.extend_from_slice(&val.to_le_bytes());
}

pub fn de_u32(data: &[u8], at: usize) -> anyhow::Result<u32> {
    ensure!(
        data.len() >= at + size_of::<u32>(),
        "de_u32: short buffer. len={} at={}",
        data.len(),
        at
    );
    let mut b = [0u8; size_of::<u32>()];
    b.copy_from_slice(&data[at..at + size_of::<u32>()]);
    return Ok(u32::from_le_bytes(b));
}

pub fn de_f64(data: &[u8], at: usize) -> anyhow::Result<f64> {
    ensure!(
        data.len() >= at + size_of::<f64>(),
        "de_f64: short buffer. len={} at={}",
        data.len(),
        at
    );
    let mut b = [0u8; size_of::<f64>()];
    b.copy_from_slice(&data[at..at + size_of::<f64>()]);
    return Ok(f64::from_le_bytes(b));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ser_de_test() {
        let mut out = Vec::new();
        ser_u32(&mut out, 20181218);
        ser_f64(&mut out, -33.75);
        assert_eq!(20181218, de_u32(&out, 0).unwrap());
        assert_eq!(-33.75, de_f64(&out, 4).unwrap());
        assert!(de_f64(&out, 8).is_err());
    }
}
