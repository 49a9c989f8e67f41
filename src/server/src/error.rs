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

use std::time::Duration;

use tessera_api::{errorpb, metapb};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument {0}")]
    InvalidArgument(String),

    #[error("deadline exceeded {0}")]
    DeadlineExceeded(String),

    #[error("invalid {0} data")]
    InvalidData(String),

    #[error("request canceled")]
    Canceled,

    #[error("stopped")]
    Stopped,

    #[error("raft {0}")]
    Raft(#[from] raft::Error),

    #[error("raft engine {0}")]
    RaftEngine(#[from] raft_engine::Error),

    #[error("io {0}")]
    Io(#[from] std::io::Error),

    // retryable errors
    #[error("service {0} is busy")]
    ServiceIsBusy(&'static str),

    /// The backend was not connected yet; the dispatch may be retried after
    /// `wait`.
    #[error("not connected, try again")]
    TryAgain { wait: Duration },

    #[error("not leader of shard {0}")]
    NotLeader(u64, Option<metapb::Replica>),

    #[error("stale epoch of shard")]
    StaleEpoch(Vec<metapb::Shard>),

    #[error("shard {0} not found")]
    ShardNotFound(u64),

    #[error("shard {0} unavailable")]
    ShardUnavailable(u64),

    #[error("store not match, give {0} want {1}")]
    StoreNotMatch(u64, u64),

    #[error("invalid config change request")]
    InvalidConfigChangeRequest,

    #[error("removing or demoting the leader is not allowed")]
    RemoveLeader,

    #[error("exec timeout: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the shards proxy may transparently retry after this error.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader(..)
                | Error::StaleEpoch(_)
                | Error::ServiceIsBusy(_)
                | Error::TryAgain { .. }
        )
    }
}

impl From<Error> for errorpb::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::NotLeader(shard_id, leader) => errorpb::Error::not_leader(shard_id, leader),
            Error::StaleEpoch(new_shards) => errorpb::Error::stale_epoch(new_shards),
            Error::ShardNotFound(shard_id) => errorpb::Error::shard_not_found(shard_id),
            Error::ShardUnavailable(shard_id) => errorpb::Error::shard_unavailable(shard_id),
            Error::StoreNotMatch(give, want) => errorpb::Error::store_not_match(want, give),
            Error::ServiceIsBusy(reason) => errorpb::Error::server_is_busy(reason),
            err => errorpb::Error::message(err.to_string()),
        }
    }
}

impl From<errorpb::Error> for Error {
    fn from(err: errorpb::Error) -> Self {
        if let Some(v) = err.not_leader {
            Error::NotLeader(v.shard_id, v.leader)
        } else if let Some(v) = err.stale_epoch {
            Error::StaleEpoch(v.new_shards)
        } else if let Some(v) = err.shard_not_found {
            Error::ShardNotFound(v.shard_id)
        } else if let Some(v) = err.shard_unavailable {
            Error::ShardUnavailable(v.shard_id)
        } else if let Some(v) = err.store_not_match {
            Error::StoreNotMatch(v.actual_store_id, v.expect_store_id)
        } else if err.server_is_busy.is_some() {
            Error::ServiceIsBusy("remote")
        } else {
            Error::InvalidData(err.message)
        }
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<protobuf::ProtobufError> for Error {
    fn from(err: protobuf::ProtobufError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<futures::channel::oneshot::Canceled> for Error {
    fn from(_: futures::channel::oneshot::Canceled) -> Self {
        Error::Canceled
    }
}
