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

//! Wire messages exchanged between clients, proxies and stores, plus the
//! placement-service event stream.

use crate::{errorpb, metapb};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum CmdType {
    Read = 0,
    Write = 1,
    Admin = 2,
    Txn = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum AdminCmdType {
    InvalidAdmin = 0,
    AdminConfigChange = 1,
    AdminBatchSplit = 2,
    AdminTransferLeader = 3,
    AdminCompactLog = 4,
    AdminUpdateMetadata = 5,
    AdminUpdateLabels = 6,
}

/// How the router picks the replica-hosting store for a request.
///
/// `SelectLeaseHolder` is accepted on the wire but resolves as
/// `SelectLeader` until lease tracking exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum ReplicaSelectPolicy {
    SelectLeader = 0,
    SelectRandom = 1,
    SelectLeaseHolder = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum LabelPolicy {
    Add = 0,
    Replace = 1,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Range {
    #[prost(bytes = "vec", tag = "1")]
    pub from: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub to: ::prost::alloc::vec::Vec<u8>,
}

/// An opaque transaction batch, forwarded to the data storage unchanged.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct TxnBatchRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct TxnBatchResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

/// A client request. `key` and `to_shard` are mutually exclusive routing
/// hints; `stop_at` is the unix-second deadline after which retries stop.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub group: u64,
    #[prost(enumeration = "CmdType", tag = "3")]
    pub cmd_type: i32,
    #[prost(uint64, tag = "4")]
    pub custom_type: u64,
    #[prost(bytes = "vec", tag = "5")]
    pub key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub cmd: ::prost::alloc::vec::Vec<u8>,
    #[prost(int64, tag = "7")]
    pub pid: i64,
    #[prost(uint64, tag = "8")]
    pub to_shard: u64,
    #[prost(bool, tag = "9")]
    pub ignore_epoch_check: bool,
    #[prost(message, optional, tag = "10")]
    pub epoch: ::core::option::Option<metapb::Epoch>,
    #[prost(message, optional, tag = "11")]
    pub keys_range: ::core::option::Option<Range>,
    #[prost(enumeration = "ReplicaSelectPolicy", tag = "12")]
    pub replica_select_policy: i32,
    #[prost(int64, tag = "13")]
    pub stop_at: i64,
    #[prost(message, optional, tag = "14")]
    pub txn_batch_request: ::core::option::Option<TxnBatchRequest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(enumeration = "CmdType", tag = "2")]
    pub cmd_type: i32,
    #[prost(uint64, tag = "3")]
    pub custom_type: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub value: ::prost::alloc::vec::Vec<u8>,
    #[prost(int64, tag = "5")]
    pub pid: i64,
    #[prost(message, optional, tag = "6")]
    pub error: ::core::option::Option<errorpb::Error>,
    #[prost(message, optional, tag = "7")]
    pub txn_batch_response: ::core::option::Option<TxnBatchResponse>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestBatchHeader {
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub shard_id: u64,
    #[prost(message, optional, tag = "3")]
    pub replica: ::core::option::Option<metapb::Replica>,
}

/// A group of compatible requests proposed as one raft log entry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestBatch {
    #[prost(message, optional, tag = "1")]
    pub header: ::core::option::Option<RequestBatchHeader>,
    #[prost(message, repeated, tag = "2")]
    pub requests: ::prost::alloc::vec::Vec<Request>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseBatchHeader {
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub error: ::core::option::Option<errorpb::Error>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseBatch {
    #[prost(message, optional, tag = "1")]
    pub header: ::core::option::Option<ResponseBatchHeader>,
    #[prost(message, repeated, tag = "2")]
    pub responses: ::prost::alloc::vec::Vec<Response>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigChangeRequest {
    #[prost(enumeration = "metapb::ConfigChangeType", tag = "1")]
    pub change_type: i32,
    #[prost(message, optional, tag = "2")]
    pub replica: ::core::option::Option<metapb::Replica>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigChangeResponse {
    #[prost(message, optional, tag = "1")]
    pub shard: ::core::option::Option<metapb::Shard>,
}

/// One child range produced by a batch split.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SplitRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub start: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub end: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub new_shard_id: u64,
    #[prost(uint64, repeated, tag = "4")]
    pub new_replica_ids: ::prost::alloc::vec::Vec<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchSplitRequest {
    #[prost(message, repeated, tag = "1")]
    pub requests: ::prost::alloc::vec::Vec<SplitRequest>,
    #[prost(bytes = "vec", tag = "2")]
    pub context: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BatchSplitResponse {
    #[prost(message, repeated, tag = "1")]
    pub shards: ::prost::alloc::vec::Vec<metapb::Shard>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransferLeaderRequest {
    #[prost(message, optional, tag = "1")]
    pub replica: ::core::option::Option<metapb::Replica>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct TransferLeaderResponse {}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CompactLogRequest {
    #[prost(uint64, tag = "1")]
    pub compact_index: u64,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CompactLogResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateMetadataRequest {
    #[prost(message, optional, tag = "1")]
    pub metadata: ::core::option::Option<metapb::ShardLocalState>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateMetadataResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateLabelsRequest {
    #[prost(message, repeated, tag = "1")]
    pub labels: ::prost::alloc::vec::Vec<metapb::Label>,
    #[prost(enumeration = "LabelPolicy", tag = "2")]
    pub policy: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateLabelsResponse {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum EventType {
    InitEvent = 0,
    ShardEvent = 1,
    StoreEvent = 2,
    ShardStatsEvent = 3,
    StoreStatsEvent = 4,
}

/// The wholesale topology reset emitted when a watcher (re)connects. The
/// shard and store payloads are encoded `metapb::Shard` / `metapb::Store`;
/// `leaders[i]` is the leader replica id of `shards[i]` (0 when unknown).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitEvent {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub shards: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(uint64, repeated, tag = "2")]
    pub leaders: ::prost::alloc::vec::Vec<u64>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub stores: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

/// A single shard change. Exactly one of `removed` and `create` may be set;
/// otherwise the event is an upsert with an optional leader hint.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShardEvent {
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub leader_replica_id: u64,
    #[prost(bool, tag = "3")]
    pub removed: bool,
    #[prost(bool, tag = "4")]
    pub create: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreEvent {
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// One message on the placement event channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventNotify {
    #[prost(enumeration = "EventType", tag = "1")]
    pub event_type: i32,
    #[prost(message, optional, tag = "2")]
    pub init: ::core::option::Option<InitEvent>,
    #[prost(message, optional, tag = "3")]
    pub shard: ::core::option::Option<ShardEvent>,
    #[prost(message, optional, tag = "4")]
    pub store: ::core::option::Option<StoreEvent>,
    #[prost(message, optional, tag = "5")]
    pub shard_stats: ::core::option::Option<metapb::ShardStats>,
    #[prost(message, optional, tag = "6")]
    pub store_stats: ::core::option::Option<metapb::StoreStats>,
}

impl Request {
    #[inline]
    pub fn request_type(&self) -> CmdType {
        CmdType::from_i32(self.cmd_type).unwrap_or(CmdType::Read)
    }

    #[inline]
    pub fn select_policy(&self) -> ReplicaSelectPolicy {
        ReplicaSelectPolicy::from_i32(self.replica_select_policy)
            .unwrap_or(ReplicaSelectPolicy::SelectLeader)
    }

    #[inline]
    pub fn epoch(&self) -> metapb::Epoch {
        self.epoch.unwrap_or_default()
    }
}

impl RequestBatch {
    pub fn with_header(id: Vec<u8>, shard_id: u64, replica: metapb::Replica) -> Self {
        RequestBatch {
            header: Some(RequestBatchHeader {
                id,
                shard_id,
                replica: Some(replica),
            }),
            requests: Vec::new(),
        }
    }

    #[inline]
    pub fn header_id(&self) -> &[u8] {
        self.header.as_ref().map(|h| h.id.as_slice()).unwrap_or(&[])
    }

    #[inline]
    pub fn shard_id(&self) -> u64 {
        self.header.as_ref().map(|h| h.shard_id).unwrap_or_default()
    }

    /// An admin batch always holds exactly one admin request.
    pub fn is_admin(&self) -> bool {
        self.requests.len() == 1 && self.requests[0].request_type() == CmdType::Admin
    }

    pub fn admin_cmd_type(&self) -> AdminCmdType {
        if !self.is_admin() {
            return AdminCmdType::InvalidAdmin;
        }
        AdminCmdType::from_i32(self.requests[0].custom_type as i32)
            .unwrap_or(AdminCmdType::InvalidAdmin)
    }
}

impl ResponseBatch {
    /// A batch holding one response per request, in request order.
    pub fn with_responses(id: Vec<u8>, responses: Vec<Response>) -> Self {
        ResponseBatch {
            header: Some(ResponseBatchHeader { id, error: None }),
            responses,
        }
    }

    /// A batch reporting `err` for every request of `requests`.
    pub fn with_error(id: Vec<u8>, requests: &[Request], err: errorpb::Error) -> Self {
        let responses = requests
            .iter()
            .map(|req| Response {
                id: req.id.clone(),
                cmd_type: req.cmd_type,
                custom_type: req.custom_type,
                pid: req.pid,
                error: Some(err.clone()),
                ..Default::default()
            })
            .collect();
        ResponseBatch {
            header: Some(ResponseBatchHeader {
                id,
                error: Some(err),
            }),
            responses,
        }
    }

    #[inline]
    pub fn header_error(&self) -> Option<&errorpb::Error> {
        self.header.as_ref().and_then(|h| h.error.as_ref())
    }
}

impl EventNotify {
    pub fn init(shards: Vec<(metapb::Shard, u64)>, stores: Vec<metapb::Store>) -> Self {
        use prost::Message;

        let mut init = InitEvent::default();
        for (shard, leader) in shards {
            init.shards.push(shard.encode_to_vec());
            init.leaders.push(leader);
        }
        for store in stores {
            init.stores.push(store.encode_to_vec());
        }
        EventNotify {
            event_type: EventType::InitEvent as i32,
            init: Some(init),
            ..Default::default()
        }
    }

    pub fn shard(shard: metapb::Shard, leader_replica_id: u64, removed: bool, create: bool) -> Self {
        use prost::Message;

        EventNotify {
            event_type: EventType::ShardEvent as i32,
            shard: Some(ShardEvent {
                data: shard.encode_to_vec(),
                leader_replica_id,
                removed,
                create,
            }),
            ..Default::default()
        }
    }

    pub fn store(store: metapb::Store) -> Self {
        use prost::Message;

        EventNotify {
            event_type: EventType::StoreEvent as i32,
            store: Some(StoreEvent {
                data: store.encode_to_vec(),
            }),
            ..Default::default()
        }
    }

    pub fn shard_stats(stats: metapb::ShardStats) -> Self {
        EventNotify {
            event_type: EventType::ShardStatsEvent as i32,
            shard_stats: Some(stats),
            ..Default::default()
        }
    }

    pub fn store_stats(stats: metapb::StoreStats) -> Self {
        EventNotify {
            event_type: EventType::StoreStatsEvent as i32,
            store_stats: Some(stats),
            ..Default::default()
        }
    }
}
