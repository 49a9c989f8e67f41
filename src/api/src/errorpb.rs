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

//! The wire error union and its retryability classification.

use crate::metapb;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NotLeader {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
    #[prost(message, optional, tag = "2")]
    pub leader: ::core::option::Option<metapb::Replica>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ShardNotFound {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StaleEpoch {
    /// Shards likely covering the request's key after a split; a hint for
    /// route repair, not authoritative.
    #[prost(message, repeated, tag = "1")]
    pub new_shards: ::prost::alloc::vec::Vec<metapb::Shard>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ShardUnavailable {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct StoreNotMatch {
    #[prost(uint64, tag = "1")]
    pub expect_store_id: u64,
    #[prost(uint64, tag = "2")]
    pub actual_store_id: u64,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct KeyNotInShard {
    #[prost(bytes = "vec", tag = "1")]
    pub key: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub shard_id: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub start: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub end: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct RaftEntryTooLarge {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
    #[prost(uint64, tag = "2")]
    pub entry_size: u64,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ServerIsBusy {
    #[prost(string, tag = "1")]
    pub reason: ::prost::alloc::string::String,
}

/// The error carried by responses; `message` is always set, at most one
/// detail field is.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
    #[prost(string, tag = "1")]
    pub message: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub not_leader: ::core::option::Option<NotLeader>,
    #[prost(message, optional, tag = "3")]
    pub shard_not_found: ::core::option::Option<ShardNotFound>,
    #[prost(message, optional, tag = "4")]
    pub stale_epoch: ::core::option::Option<StaleEpoch>,
    #[prost(message, optional, tag = "5")]
    pub shard_unavailable: ::core::option::Option<ShardUnavailable>,
    #[prost(message, optional, tag = "6")]
    pub store_not_match: ::core::option::Option<StoreNotMatch>,
    #[prost(message, optional, tag = "7")]
    pub key_not_in_shard: ::core::option::Option<KeyNotInShard>,
    #[prost(message, optional, tag = "8")]
    pub raft_entry_too_large: ::core::option::Option<RaftEntryTooLarge>,
    #[prost(message, optional, tag = "9")]
    pub server_is_busy: ::core::option::Option<ServerIsBusy>,
}

impl Error {
    pub fn not_leader(shard_id: u64, leader: Option<metapb::Replica>) -> Self {
        Error {
            message: "not leader".into(),
            not_leader: Some(NotLeader { shard_id, leader }),
            ..Default::default()
        }
    }

    pub fn shard_not_found(shard_id: u64) -> Self {
        Error {
            message: "shard not found".into(),
            shard_not_found: Some(ShardNotFound { shard_id }),
            ..Default::default()
        }
    }

    pub fn stale_epoch(new_shards: Vec<metapb::Shard>) -> Self {
        Error {
            message: "stale epoch".into(),
            stale_epoch: Some(StaleEpoch { new_shards }),
            ..Default::default()
        }
    }

    pub fn shard_unavailable(shard_id: u64) -> Self {
        Error {
            message: "shard unavailable".into(),
            shard_unavailable: Some(ShardUnavailable { shard_id }),
            ..Default::default()
        }
    }

    pub fn store_not_match(expect_store_id: u64, actual_store_id: u64) -> Self {
        Error {
            message: "store not match".into(),
            store_not_match: Some(StoreNotMatch {
                expect_store_id,
                actual_store_id,
            }),
            ..Default::default()
        }
    }

    pub fn key_not_in_shard(key: Vec<u8>, shard: &metapb::Shard) -> Self {
        Error {
            message: "key not in shard".into(),
            key_not_in_shard: Some(KeyNotInShard {
                key,
                shard_id: shard.id,
                start: shard.start.clone(),
                end: shard.end.clone(),
            }),
            ..Default::default()
        }
    }

    pub fn raft_entry_too_large(shard_id: u64, entry_size: u64) -> Self {
        Error {
            message: "raft entry is too large".into(),
            raft_entry_too_large: Some(RaftEntryTooLarge {
                shard_id,
                entry_size,
            }),
            ..Default::default()
        }
    }

    pub fn server_is_busy(reason: impl Into<String>) -> Self {
        Error {
            message: "server is busy".into(),
            server_is_busy: Some(ServerIsBusy {
                reason: reason.into(),
            }),
            ..Default::default()
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Error {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Whether re-dispatching the request may succeed without caller
    /// involvement.
    pub fn retryable(&self) -> bool {
        self.not_leader.is_some() || self.stale_epoch.is_some() || self.server_is_busy.is_some()
    }
}

/// True when `err` actually carries an error.
pub fn has_error(err: &Option<Error>) -> bool {
    err.is_some()
}
