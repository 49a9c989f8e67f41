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

//! The data storage boundary. The actual key-value engine is an external
//! collaborator; replicas only ever talk to the [`DataStorage`] trait. The
//! in-memory implementation backs tests and `use_memory_as_storage` stores.

pub mod keys;
mod mem;

use std::{path::Path, sync::Arc};

use tessera_api::metapb::{Shard, ShardLocalState};

pub use self::mem::MemDataStorage;
use crate::Result;

/// KV command types executed by the built-in key-value executor.
pub const CMD_SET: u64 = 1;
pub const CMD_GET: u64 = 2;
pub const CMD_DELETE: u64 = 3;

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct SetRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub value: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct GetRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub key: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct DeleteRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub key: ::prost::alloc::vec::Vec<u8>,
}

/// The latest persisted metadata of one shard, surfaced at boot.
#[derive(Clone, Debug, PartialEq)]
pub struct ShardMetadata {
    pub shard_id: u64,
    pub log_index: u64,
    pub metadata: ShardLocalState,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StorageStats {
    pub written_bytes: u64,
    pub written_keys: u64,
    pub read_bytes: u64,
    pub read_keys: u64,
}

/// The keyed engine a replica applies committed commands to. Implementations
/// must be thread-safe for concurrent readers with a single committed writer
/// per shard.
pub trait DataStorage: Send + Sync {
    /// Execute a write command at `log_index`; the returned bytes become the
    /// response value.
    fn exec_write(
        &self,
        shard: &Shard,
        log_index: u64,
        custom_type: u64,
        cmd: &[u8],
    ) -> Result<Vec<u8>>;

    /// Execute a read; reads never move the applied index.
    fn exec_read(&self, shard: &Shard, custom_type: u64, cmd: &[u8]) -> Result<Vec<u8>>;

    /// Execute an opaque transaction batch.
    fn exec_txn(&self, _shard: &Shard, _payload: &[u8]) -> Result<Vec<u8>> {
        Err(crate::Error::InvalidArgument(
            "txn batch not supported by this storage".into(),
        ))
    }

    /// Persist the shard-local metadata record at `log_index`.
    fn save_shard_metadata(&self, log_index: u64, state: ShardLocalState) -> Result<()>;

    /// Persist the applied index of `shard_id`.
    fn set_applied_index(&self, shard_id: u64, index: u64) -> Result<()>;

    /// The applied index persisted for `shard_id`, 0 when unknown.
    fn persisted_applied_index(&self, shard_id: u64) -> Result<u64>;

    /// The latest metadata record of every shard hosted by this storage.
    fn initial_states(&self) -> Result<Vec<ShardMetadata>>;

    /// Serialize the shard's data into `dir`.
    fn save_snapshot(&self, shard: &Shard, dir: &Path) -> Result<()>;

    /// Replace the shard's data with the image in `dir`.
    fn recover_from_snapshot(&self, shard: &Shard, dir: &Path) -> Result<()>;

    /// Delete all data and records of the shard.
    fn remove_shard(&self, shard: &Shard, remove_data: bool) -> Result<()>;

    /// Scan the shard to decide whether it should split: returns the
    /// approximate size and the candidate split keys for `target_size`.
    fn split_check(&self, shard: &Shard, target_size: u64) -> Result<(u64, Vec<Vec<u8>>)>;

    fn stats(&self) -> StorageStats;
}

/// Provides the data storage of each shard group.
pub trait DataStorageFactory: Send + Sync {
    fn data_storage(&self, group: u64) -> Arc<dyn DataStorage>;
    fn foreach(&self, f: &mut dyn FnMut(u64, &Arc<dyn DataStorage>));
}

/// Every group shares one storage.
pub struct SingleDataStorageFactory {
    storage: Arc<dyn DataStorage>,
}

impl SingleDataStorageFactory {
    pub fn new(storage: Arc<dyn DataStorage>) -> Self {
        SingleDataStorageFactory { storage }
    }
}

impl DataStorageFactory for SingleDataStorageFactory {
    fn data_storage(&self, _group: u64) -> Arc<dyn DataStorage> {
        self.storage.clone()
    }

    fn foreach(&self, f: &mut dyn FnMut(u64, &Arc<dyn DataStorage>)) {
        f(0, &self.storage);
    }
}

/// Reads the capacity numbers reported in store heartbeats.
pub trait StorageStatsReader: Send + Sync {
    fn capacity_stats(&self) -> CapacityStats;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CapacityStats {
    pub capacity: u64,
    pub available: u64,
    pub used_size: u64,
}

pub struct MemoryStatsReader;

impl StorageStatsReader for MemoryStatsReader {
    fn capacity_stats(&self) -> CapacityStats {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let capacity = system.total_memory();
        let available = system.available_memory();
        CapacityStats {
            capacity,
            available,
            used_size: capacity.saturating_sub(available),
        }
    }
}

pub struct DiskStatsReader {
    path: std::path::PathBuf,
}

impl DiskStatsReader {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        DiskStatsReader { path: path.into() }
    }
}

impl StorageStatsReader for DiskStatsReader {
    fn capacity_stats(&self) -> CapacityStats {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        // Pick the disk with the longest mount point covering the data path.
        let disk = disks
            .iter()
            .filter(|d| self.path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());
        match disk {
            Some(disk) => CapacityStats {
                capacity: disk.total_space(),
                available: disk.available_space(),
                used_size: disk.total_space().saturating_sub(disk.available_space()),
            },
            None => CapacityStats::default(),
        }
    }
}
