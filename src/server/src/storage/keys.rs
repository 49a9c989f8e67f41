// Copyright 2023 The Tessera Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The keyed layout of a data storage: user data under the `data` prefix,
//! shard metadata under the `meta` prefix keyed by `(shard_id, log_index)`,
//! applied-index records keyed by shard id.

pub const DATA_PREFIX: u8 = 0x01;
pub const META_PREFIX: u8 = 0x02;
pub const APPLIED_PREFIX: u8 = 0x03;

pub fn data_key(key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + 1);
    buf.push(DATA_PREFIX);
    buf.extend_from_slice(key);
    buf
}

/// The user key encoded in `key`, which must be a data key.
pub fn origin_key(key: &[u8]) -> &[u8] {
    &key[1..]
}

pub fn is_data_key(key: &[u8]) -> bool {
    key.first() == Some(&DATA_PREFIX)
}

pub fn meta_prefix(shard_id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(META_PREFIX);
    buf.extend_from_slice(&shard_id.to_be_bytes());
    buf
}

pub fn meta_key(shard_id: u64, log_index: u64) -> Vec<u8> {
    let mut buf = meta_prefix(shard_id);
    buf.extend_from_slice(&log_index.to_be_bytes());
    buf
}

/// Decode `(shard_id, log_index)` out of a meta key.
pub fn decode_meta_key(key: &[u8]) -> Option<(u64, u64)> {
    if key.len() != 17 || key[0] != META_PREFIX {
        return None;
    }
    let shard_id = u64::from_be_bytes(key[1..9].try_into().unwrap());
    let log_index = u64::from_be_bytes(key[9..17].try_into().unwrap());
    Some((shard_id, log_index))
}

pub fn applied_index_key(shard_id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(APPLIED_PREFIX);
    buf.extend_from_slice(&shard_id.to_be_bytes());
    buf
}
