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

//! Cluster metadata: shards, replicas, stores and their lifecycle states.

use std::collections::HashMap;

/// The version pair used to detect stale routing metadata. `generation`
/// increments on every split or merge, `config_ver` on every membership
/// change.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct Epoch {
    #[prost(uint64, tag = "1")]
    pub generation: u64,
    #[prost(uint64, tag = "2")]
    pub config_ver: u64,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub key: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub value: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ReplicaRole {
    Voter = 0,
    Learner = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum ShardState {
    Running = 0,
    Destroying = 1,
    Destroyed = 2,
    Tombstone = 3,
}

/// The persisted state of one replica of a shard on a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum ReplicaState {
    Normal = 0,
    Tombstone = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConfigChangeType {
    AddNode = 0,
    RemoveNode = 1,
    AddLearnerNode = 2,
}

/// One member of a shard's raft group, hosted on one store.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Replica {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub store_id: u64,
    #[prost(enumeration = "ReplicaRole", tag = "3")]
    pub role: i32,
}

/// A raft group managing the byte range `[start, end)` inside `group`. An
/// empty `end` means positive infinity.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Shard {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub group: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub start: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub end: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "5")]
    pub epoch: ::core::option::Option<Epoch>,
    #[prost(message, repeated, tag = "6")]
    pub replicas: ::prost::alloc::vec::Vec<Replica>,
    #[prost(enumeration = "ShardState", tag = "7")]
    pub state: i32,
    #[prost(message, repeated, tag = "8")]
    pub labels: ::prost::alloc::vec::Vec<Label>,
}

/// A node hosting many replicas.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Store {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub raft_address: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub client_address: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "4")]
    pub labels: ::prost::alloc::vec::Vec<Label>,
    #[prost(int64, tag = "5")]
    pub start_time: i64,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ShardStats {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
    #[prost(uint64, tag = "2")]
    pub approximate_size: u64,
    #[prost(uint64, tag = "3")]
    pub approximate_keys: u64,
    #[prost(uint64, tag = "4")]
    pub written_bytes: u64,
    #[prost(uint64, tag = "5")]
    pub written_keys: u64,
    #[prost(uint64, tag = "6")]
    pub read_bytes: u64,
    #[prost(uint64, tag = "7")]
    pub read_keys: u64,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct StoreStats {
    #[prost(uint64, tag = "1")]
    pub store_id: u64,
    #[prost(uint64, tag = "2")]
    pub capacity: u64,
    #[prost(uint64, tag = "3")]
    pub available: u64,
    #[prost(uint64, tag = "4")]
    pub used_size: u64,
    #[prost(uint64, tag = "5")]
    pub shard_count: u64,
    #[prost(uint64, tag = "6")]
    pub sending_snap_count: u64,
    #[prost(uint64, tag = "7")]
    pub start_time: u64,
    #[prost(uint64, tag = "8")]
    pub written_bytes: u64,
    #[prost(uint64, tag = "9")]
    pub written_keys: u64,
    #[prost(uint64, tag = "10")]
    pub read_bytes: u64,
    #[prost(uint64, tag = "11")]
    pub read_keys: u64,
}

/// The placement-service record tracking a shard's two-phase destruction.
/// The state flips to `Destroyed` once every replica has reported.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DestroyingStatus {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(bool, tag = "2")]
    pub remove_data: bool,
    #[prost(enumeration = "ShardState", tag = "3")]
    pub state: i32,
    #[prost(map = "uint64, bool", tag = "4")]
    pub replicas: HashMap<u64, bool>,
}

/// The shard metadata persisted next to the user data on every store.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShardLocalState {
    #[prost(message, optional, tag = "1")]
    pub shard: ::core::option::Option<Shard>,
    #[prost(enumeration = "ReplicaState", tag = "2")]
    pub state: i32,
    #[prost(bool, tag = "3")]
    pub remove_data: bool,
}

impl Shard {
    #[inline]
    pub fn epoch(&self) -> Epoch {
        self.epoch.unwrap_or_default()
    }

    #[inline]
    pub fn shard_state(&self) -> ShardState {
        ShardState::from_i32(self.state).unwrap_or(ShardState::Running)
    }

    /// The replica of this shard hosted on `store_id`, if any.
    pub fn replica_on_store(&self, store_id: u64) -> Option<Replica> {
        self.replicas.iter().find(|r| r.store_id == store_id).cloned()
    }

    pub fn replica(&self, replica_id: u64) -> Option<Replica> {
        self.replicas.iter().find(|r| r.id == replica_id).cloned()
    }
}

impl Replica {
    pub fn new(id: u64, store_id: u64, role: ReplicaRole) -> Self {
        Replica {
            id,
            store_id,
            role: role as i32,
        }
    }

    #[inline]
    pub fn replica_role(&self) -> ReplicaRole {
        ReplicaRole::from_i32(self.role).unwrap_or(ReplicaRole::Voter)
    }
}
