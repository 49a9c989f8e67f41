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

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// The root dir of the store's persistent state.
    pub data_path: PathBuf,

    /// The address serving client requests.
    pub client_address: String,

    /// The address serving inter-store raft traffic.
    pub raft_address: String,

    pub labels: Vec<(String, String)>,

    /// Report memory stats instead of disk stats in store heartbeats.
    pub use_memory_as_storage: bool,

    /// Overrides the reported storage capacity when non-zero.
    pub capacity: u64,

    #[serde(default)]
    pub raft: RaftConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RaftConfig {
    /// The interval of raft ticks, in millis.
    ///
    /// Default: 500ms.
    pub tick_interval_ms: u64,

    /// Before a follower begins an election it must wait this many ticks
    /// without hearing from a leader.
    ///
    /// Default: 10.
    pub election_tick: usize,

    /// The proposal size ceiling; one batch never exceeds it.
    ///
    /// Default: 1MB.
    pub max_entry_bytes: u64,

    /// Limit the entries batched in one append message, in bytes.
    ///
    /// Default: 64KB.
    pub max_size_per_msg: u64,

    /// Limit the number of inflight append messages to one peer.
    ///
    /// Default: 256.
    pub max_inflight_msgs: usize,

    /// The capacity of each replica's inbound queues.
    ///
    /// Default: 4096.
    pub max_inflight_requests: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReplicationConfig {
    /// Compact when `min_match - first_index` exceeds this many entries.
    ///
    /// Default: 1024.
    pub compact_threshold: u64,

    /// Force a compaction once the retained entry count reaches this value.
    ///
    /// Default: 8192.
    pub force_compact_count: u64,

    /// Force a compaction once the unreclaimed log size reaches this value.
    ///
    /// Default: 64MB.
    pub force_compact_bytes: u64,

    /// The interval between destroy-task progress checks, in millis.
    ///
    /// Default: 100ms.
    pub destroy_check_interval_ms: u64,

    /// The data size a shard aims for; the split checker cuts candidate
    /// keys at this granularity when placement asks for a split without
    /// naming keys.
    ///
    /// Default: 64MB.
    pub shard_split_bytes: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// The number of threads driving replica event loops.
    ///
    /// Default: the number of cpus.
    pub raft_event_workers: usize,
}

impl Config {
    /// Normalize zero-valued knobs to their defaults.
    pub fn adjust(&mut self) {
        let defaults = RaftConfig::default();
        if self.raft.tick_interval_ms == 0 {
            self.raft.tick_interval_ms = defaults.tick_interval_ms;
        }
        if self.raft.election_tick == 0 {
            self.raft.election_tick = defaults.election_tick;
        }
        if self.raft.max_entry_bytes == 0 {
            self.raft.max_entry_bytes = defaults.max_entry_bytes;
        }
        if self.raft.max_size_per_msg == 0 {
            self.raft.max_size_per_msg = defaults.max_size_per_msg;
        }
        if self.raft.max_inflight_msgs == 0 {
            self.raft.max_inflight_msgs = defaults.max_inflight_msgs;
        }
        if self.raft.max_inflight_requests == 0 {
            self.raft.max_inflight_requests = defaults.max_inflight_requests;
        }
        if self.worker.raft_event_workers == 0 {
            self.worker.raft_event_workers = num_cpus();
        }
    }

    #[inline]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.raft.tick_interval_ms)
    }

    #[inline]
    pub fn destroy_check_interval(&self) -> Duration {
        Duration::from_millis(self.replication.destroy_check_interval_ms)
    }

    #[inline]
    pub fn snapshot_root(&self) -> PathBuf {
        self.data_path.join("snapshots")
    }

    #[inline]
    pub fn log_path(&self) -> PathBuf {
        self.data_path.join("raft")
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            tick_interval_ms: 500,
            election_tick: 10,
            max_entry_bytes: 1 << 20,
            max_size_per_msg: 64 << 10,
            max_inflight_msgs: 256,
            max_inflight_requests: 4096,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            compact_threshold: 1024,
            force_compact_count: 8192,
            force_compact_bytes: 64 << 20,
            destroy_check_interval_ms: 100,
            shard_split_bytes: 64 << 20,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            raft_event_workers: num_cpus(),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|v| v.get())
        .unwrap_or(1)
}
