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

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
};

use prost::Message;
use tessera_api::{metapb::Shard, metapb::ShardLocalState, shard::belongs_to};

use super::{
    keys, DataStorage, DeleteRequest, GetRequest, SetRequest, ShardMetadata, StorageStats,
    CMD_DELETE, CMD_GET, CMD_SET,
};
use crate::{Error, Result};

const SNAP_DATA: &str = "DATA";

#[derive(Clone, PartialEq, ::prost::Message)]
struct SnapshotData {
    #[prost(bytes = "vec", repeated, tag = "1")]
    keys: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    values: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

/// A BTreeMap-backed data storage holding user data, shard metadata and
/// applied-index records in one keyspace, laid out by [`super::keys`].
#[derive(Default)]
pub struct MemDataStorage {
    kv: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    written_bytes: AtomicU64,
    written_keys: AtomicU64,
    read_bytes: AtomicU64,
    read_keys: AtomicU64,
}

impl MemDataStorage {
    pub fn new() -> Self {
        MemDataStorage::default()
    }

    fn shard_data_range(shard: &Shard) -> (Vec<u8>, Option<Vec<u8>>) {
        let start = keys::data_key(&shard.start);
        let end = if shard.end.is_empty() {
            // The whole data prefix.
            None
        } else {
            Some(keys::data_key(&shard.end))
        };
        (start, end)
    }

    fn check_key_in_shard(shard: &Shard, key: &[u8]) -> Result<()> {
        if belongs_to(shard, key) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "key not in shard {}",
                shard.id
            )))
        }
    }
}

impl DataStorage for MemDataStorage {
    fn exec_write(
        &self,
        shard: &Shard,
        _log_index: u64,
        custom_type: u64,
        cmd: &[u8],
    ) -> Result<Vec<u8>> {
        match custom_type {
            CMD_SET => {
                let req = SetRequest::decode(cmd)?;
                Self::check_key_in_shard(shard, &req.key)?;
                self.written_bytes
                    .fetch_add((req.key.len() + req.value.len()) as u64, Ordering::Relaxed);
                self.written_keys.fetch_add(1, Ordering::Relaxed);
                let mut kv = self.kv.write().unwrap();
                kv.insert(keys::data_key(&req.key), req.value);
                Ok(Vec::new())
            }
            CMD_DELETE => {
                let req = DeleteRequest::decode(cmd)?;
                Self::check_key_in_shard(shard, &req.key)?;
                self.written_keys.fetch_add(1, Ordering::Relaxed);
                let mut kv = self.kv.write().unwrap();
                kv.remove(&keys::data_key(&req.key));
                Ok(Vec::new())
            }
            _ => Err(Error::InvalidArgument(format!(
                "unknown write command {custom_type}"
            ))),
        }
    }

    fn exec_read(&self, shard: &Shard, custom_type: u64, cmd: &[u8]) -> Result<Vec<u8>> {
        match custom_type {
            CMD_GET => {
                let req = GetRequest::decode(cmd)?;
                Self::check_key_in_shard(shard, &req.key)?;
                let kv = self.kv.read().unwrap();
                let value = kv
                    .get(&keys::data_key(&req.key))
                    .cloned()
                    .unwrap_or_default();
                self.read_bytes
                    .fetch_add(value.len() as u64, Ordering::Relaxed);
                self.read_keys.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            _ => Err(Error::InvalidArgument(format!(
                "unknown read command {custom_type}"
            ))),
        }
    }

    fn save_shard_metadata(&self, log_index: u64, state: ShardLocalState) -> Result<()> {
        let shard_id = state.shard.as_ref().map(|s| s.id).unwrap_or_default();
        let mut kv = self.kv.write().unwrap();
        kv.insert(keys::meta_key(shard_id, log_index), state.encode_to_vec());
        Ok(())
    }

    fn set_applied_index(&self, shard_id: u64, index: u64) -> Result<()> {
        let mut kv = self.kv.write().unwrap();
        kv.insert(keys::applied_index_key(shard_id), index.to_be_bytes().to_vec());
        Ok(())
    }

    fn persisted_applied_index(&self, shard_id: u64) -> Result<u64> {
        let kv = self.kv.read().unwrap();
        Ok(kv
            .get(&keys::applied_index_key(shard_id))
            .and_then(|v| v.as_slice().try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or_default())
    }

    fn initial_states(&self) -> Result<Vec<ShardMetadata>> {
        let kv = self.kv.read().unwrap();
        let mut latest: BTreeMap<u64, ShardMetadata> = BTreeMap::new();
        for (key, value) in kv.range(vec![keys::META_PREFIX]..vec![keys::META_PREFIX + 1]) {
            let Some((shard_id, log_index)) = keys::decode_meta_key(key) else {
                continue;
            };
            let metadata = ShardLocalState::decode(value.as_slice())
                .map_err(|_| Error::InvalidData("shard local state".into()))?;
            let sid = metadata.shard.as_ref().map(|s| s.id).unwrap_or_default();
            if sid != shard_id {
                panic!(
                    "BUG: shard id not match in metadata, expect {shard_id}, actual {sid}"
                );
            }
            // Meta keys order by log index, so the last record wins.
            latest.insert(
                shard_id,
                ShardMetadata {
                    shard_id,
                    log_index,
                    metadata,
                },
            );
        }
        Ok(latest.into_values().collect())
    }

    fn save_snapshot(&self, shard: &Shard, dir: &Path) -> Result<()> {
        let (start, end) = Self::shard_data_range(shard);
        let mut data = SnapshotData::default();
        {
            let kv = self.kv.read().unwrap();
            let iter: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<u8>)>> = match &end {
                Some(end) => Box::new(kv.range(start..end.clone())),
                None => Box::new(
                    kv.range(start..)
                        .take_while(|(k, _)| keys::is_data_key(k)),
                ),
            };
            for (key, value) in iter {
                data.keys.push(key.clone());
                data.values.push(value.clone());
            }
        }
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(SNAP_DATA), data.encode_to_vec())?;
        Ok(())
    }

    fn recover_from_snapshot(&self, shard: &Shard, dir: &Path) -> Result<()> {
        let bytes = std::fs::read(dir.join(SNAP_DATA))?;
        let data = SnapshotData::decode(bytes.as_slice())
            .map_err(|_| Error::InvalidData("snapshot data".into()))?;

        let (start, end) = Self::shard_data_range(shard);
        let mut kv = self.kv.write().unwrap();
        let stale = match &end {
            Some(end) => kv
                .range(start.clone()..end.clone())
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>(),
            None => kv
                .range(start.clone()..)
                .take_while(|(k, _)| keys::is_data_key(k))
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>(),
        };
        for key in stale {
            kv.remove(&key);
        }
        for (key, value) in data.keys.into_iter().zip(data.values.into_iter()) {
            kv.insert(key, value);
        }
        Ok(())
    }

    fn remove_shard(&self, shard: &Shard, remove_data: bool) -> Result<()> {
        let mut kv = self.kv.write().unwrap();
        if remove_data {
            let (start, end) = Self::shard_data_range(shard);
            let doomed = match &end {
                Some(end) => kv
                    .range(start.clone()..end.clone())
                    .map(|(k, _)| k.clone())
                    .collect::<Vec<_>>(),
                None => kv
                    .range(start.clone()..)
                    .take_while(|(k, _)| keys::is_data_key(k))
                    .map(|(k, _)| k.clone())
                    .collect::<Vec<_>>(),
            };
            for key in doomed {
                kv.remove(&key);
            }
        }
        let meta = kv
            .range(keys::meta_prefix(shard.id)..keys::meta_key(shard.id, u64::MAX))
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();
        for key in meta {
            kv.remove(&key);
        }
        kv.remove(&keys::applied_index_key(shard.id));
        Ok(())
    }

    fn split_check(&self, shard: &Shard, target_size: u64) -> Result<(u64, Vec<Vec<u8>>)> {
        let (start, end) = Self::shard_data_range(shard);
        let kv = self.kv.read().unwrap();
        let iter: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<u8>)>> = match &end {
            Some(end) => Box::new(kv.range(start..end.clone())),
            None => Box::new(kv.range(start..).take_while(|(k, _)| keys::is_data_key(k))),
        };

        let mut total = 0u64;
        let mut current = 0u64;
        let mut split_keys = Vec::new();
        for (key, value) in iter {
            let size = (key.len() + value.len()) as u64;
            total += size;
            current += size;
            if target_size > 0 && current >= target_size {
                split_keys.push(keys::origin_key(key).to_vec());
                current = 0;
            }
        }
        Ok((total, split_keys))
    }

    fn stats(&self) -> StorageStats {
        StorageStats {
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            written_keys: self.written_keys.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            read_keys: self.read_keys.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_api::metapb::{Epoch, ReplicaState};

    use super::*;

    fn shard(id: u64, start: &[u8], end: &[u8]) -> Shard {
        Shard {
            id,
            start: start.to_vec(),
            end: end.to_vec(),
            epoch: Some(Epoch {
                generation: 1,
                config_ver: 1,
            }),
            ..Default::default()
        }
    }

    fn set(ds: &MemDataStorage, shard: &Shard, index: u64, key: &[u8], value: &[u8]) {
        let cmd = SetRequest {
            key: key.to_vec(),
            value: value.to_vec(),
        }
        .encode_to_vec();
        ds.exec_write(shard, index, CMD_SET, &cmd).unwrap();
    }

    fn get(ds: &MemDataStorage, shard: &Shard, key: &[u8]) -> Vec<u8> {
        let cmd = GetRequest { key: key.to_vec() }.encode_to_vec();
        ds.exec_read(shard, CMD_GET, &cmd).unwrap()
    }

    #[test]
    fn write_read_delete_round_trip() {
        let ds = MemDataStorage::new();
        let s = shard(1, b"", b"");
        set(&ds, &s, 1, b"k", b"v");
        assert_eq!(get(&ds, &s, b"k"), b"v");

        let cmd = DeleteRequest { key: b"k".to_vec() }.encode_to_vec();
        ds.exec_write(&s, 2, CMD_DELETE, &cmd).unwrap();
        assert!(get(&ds, &s, b"k").is_empty());
    }

    #[test]
    fn writes_outside_shard_range_rejected() {
        let ds = MemDataStorage::new();
        let s = shard(1, b"m", b"z");
        let cmd = SetRequest {
            key: b"a".to_vec(),
            value: b"v".to_vec(),
        }
        .encode_to_vec();
        assert!(ds.exec_write(&s, 1, CMD_SET, &cmd).is_err());
    }

    #[test]
    fn initial_states_return_latest_metadata() {
        let ds = MemDataStorage::new();
        let mut state = ShardLocalState {
            shard: Some(shard(1, b"", b"")),
            state: ReplicaState::Normal as i32,
            remove_data: false,
        };
        ds.save_shard_metadata(5, state.clone()).unwrap();
        state.state = ReplicaState::Tombstone as i32;
        ds.save_shard_metadata(9, state).unwrap();
        ds.set_applied_index(1, 9).unwrap();

        let states = ds.initial_states().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].log_index, 9);
        assert_eq!(states[0].metadata.state, ReplicaState::Tombstone as i32);
        assert_eq!(ds.persisted_applied_index(1).unwrap(), 9);
    }

    #[test]
    fn snapshot_round_trip_scopes_to_shard_range() {
        let dir = tempdir::TempDir::new("mem-storage-snap").unwrap();
        let ds = MemDataStorage::new();
        let left = shard(1, b"", b"m");
        let right = shard(2, b"m", b"");
        set(&ds, &left, 1, b"a", b"1");
        set(&ds, &right, 1, b"x", b"2");

        ds.save_snapshot(&left, dir.path()).unwrap();

        let restored = MemDataStorage::new();
        restored.recover_from_snapshot(&left, dir.path()).unwrap();
        assert_eq!(get(&restored, &left, b"a"), b"1");
        assert!(get(&restored, &right, b"x").is_empty());
    }

    #[test]
    fn remove_shard_deletes_records() {
        let ds = MemDataStorage::new();
        let s = shard(1, b"", b"");
        set(&ds, &s, 1, b"k", b"v");
        ds.save_shard_metadata(
            1,
            ShardLocalState {
                shard: Some(s.clone()),
                state: ReplicaState::Normal as i32,
                remove_data: false,
            },
        )
        .unwrap();
        ds.set_applied_index(1, 1).unwrap();

        ds.remove_shard(&s, true).unwrap();
        assert!(get(&ds, &s, b"k").is_empty());
        assert!(ds.initial_states().unwrap().is_empty());
        assert_eq!(ds.persisted_applied_index(1).unwrap(), 0);
    }

    #[test]
    fn split_check_emits_keys_at_target_size() {
        let ds = MemDataStorage::new();
        let s = shard(1, b"", b"");
        for i in 0..10u8 {
            set(&ds, &s, i as u64, &[b'k', i], &[0u8; 100]);
        }
        let (total, split_keys) = ds.split_check(&s, 300).unwrap();
        assert!(total > 1000);
        assert!(!split_keys.is_empty());
        assert!(split_keys.len() < 10);
    }
}
