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

//! The tessera replication and routing core.
//!
//! A store hosts many replicas; every shard is a raft group driven by a
//! single-threaded cooperative event loop. The router keeps a live cache of
//! the placement topology, and the shards proxy dispatches client requests to
//! the owning shard's leader, repairing routes and retrying on the way.

mod config;
mod error;

pub mod placement;
pub mod proxy;
pub mod replica;
pub mod router;
pub mod serverpb;
pub mod shard_tree;
pub mod storage;
pub mod store;
pub mod transport;

pub use self::{
    config::{Config, RaftConfig, ReplicationConfig, WorkerConfig},
    error::{Error, Result},
    proxy::{FailureCallback, RetryController, ShardsProxy, SuccessCallback},
    router::Router,
    store::{ShardStateAware, Store},
};
