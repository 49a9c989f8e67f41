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

//! Server-internal persisted and transport messages. The eraftpb payloads
//! stay protobuf-encoded because the raft crate owns those types; everything
//! tessera defines itself is prost.

use tessera_api::metapb;

/// The identity of a log entry.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct EntryId {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(uint64, tag = "2")]
    pub term: u64,
}

/// The metadata stored inside every snapshot image (`META` file). A dummy
/// snapshot is a placeholder emitted by the log reader and must never be
/// installed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotMeta {
    #[prost(message, optional, tag = "1")]
    pub apply_state: ::core::option::Option<EntryId>,
    #[prost(message, optional, tag = "2")]
    pub shard: ::core::option::Option<metapb::Shard>,
    #[prost(bool, tag = "3")]
    pub dummy: bool,
}

/// The payload carried in `eraftpb::Snapshot::data`, locating the on-disk
/// image. A dummy record is a placeholder and must never be installed.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct SnapshotInfo {
    /// The random suffix of the image directory.
    #[prost(uint64, tag = "1")]
    pub extra: u64,
    #[prost(bool, tag = "2")]
    pub dummy: bool,
}

/// One file of a snapshot image shipped over the raft transport.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct SnapshotFile {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// The envelope for raft messages between two replicas of one shard.
/// `messages` holds protobuf-encoded `eraftpb::Message` payloads.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RaftMessage {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
    #[prost(message, optional, tag = "2")]
    pub from_replica: ::core::option::Option<metapb::Replica>,
    #[prost(message, optional, tag = "3")]
    pub to_replica: ::core::option::Option<metapb::Replica>,
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub messages: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    /// Set when the sender observed the shard as destroyed; the receiver
    /// should tombstone itself.
    #[prost(bool, tag = "5")]
    pub is_tombstone: bool,
    /// The image files accompanying a `MsgSnapshot` payload.
    #[prost(message, repeated, tag = "6")]
    pub snapshot_files: ::prost::alloc::vec::Vec<SnapshotFile>,
    /// The sender's view of the shard, enough for the receiver to create a
    /// replica it does not know yet.
    #[prost(uint64, tag = "7")]
    pub group: u64,
    #[prost(bytes = "vec", tag = "8")]
    pub start: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "9")]
    pub end: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "10")]
    pub shard_epoch: ::core::option::Option<metapb::Epoch>,
}
