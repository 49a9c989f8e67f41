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

//! The placement-service boundary. The service itself lives elsewhere; the
//! store only depends on these traits. The in-process stub backs tests and
//! single-process deployments.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tessera_api::{
    metapb::{DestroyingStatus, Shard, ShardStats, Store, StoreStats},
    rpcpb::EventNotify,
};
use tokio::sync::mpsc;

use crate::{
    replica::{destroy::DestroyingStorage, SplitId},
    Result,
};

/// What the placement service asks a shard's leader to do, piggybacked on
/// the shard heartbeat response.
#[derive(Default)]
pub struct ShardHeartbeatRsp {
    /// Destroy the replica without the quorum protocol; the shard is gone.
    pub destroy_directly: bool,
    pub config_change: Option<tessera_api::rpcpb::ConfigChangeRequest>,
    pub transfer_leader: Option<tessera_api::rpcpb::TransferLeaderRequest>,
    /// Ask the shard to split. When `split_keys` is empty the leader's
    /// split checker scans the data storage for candidates.
    pub split: bool,
    /// Split at these exact keys; the leader allocates ids via
    /// `ask_batch_split`.
    pub split_keys: Vec<Vec<u8>>,
}

/// The lifecycle states of booted shards, as the placement service sees
/// them.
#[derive(Default)]
pub struct CheckedShardStates {
    pub destroying: Vec<u64>,
    pub destroyed: Vec<u64>,
}

/// The client surface of the placement service.
pub trait PlacementClient: DestroyingStorage {
    /// Allocate a cluster-unique id.
    fn alloc_id(&self) -> Result<u64>;

    /// Subscribe to the topology event stream. The first message is an
    /// `Init` snapshot.
    fn watch(&self) -> mpsc::UnboundedReceiver<EventNotify>;

    /// Register or refresh this store's record.
    fn put_store(&self, store: Store) -> Result<()>;

    /// Report store stats; the service fans them out to watchers.
    fn store_heartbeat(&self, stats: StoreStats) -> Result<()>;

    /// Report a shard's stats and leadership; the response may carry work.
    fn shard_heartbeat(&self, shard: Shard, stats: ShardStats, leader_replica_id: u64)
        -> Result<ShardHeartbeatRsp>;

    /// Which of `shards` the service already considers destroying or
    /// destroyed; consulted at boot.
    fn check_shard_states(&self, shards: &[u64]) -> Result<CheckedShardStates>;

    /// Allocate ids for `count` split children of `shard`.
    fn ask_batch_split(&self, shard: Shard, count: u32) -> Result<Vec<SplitId>>;
}

#[derive(Default)]
struct StubState {
    shards: HashMap<u64, (Shard, u64)>,
    stores: HashMap<u64, Store>,
    destroying: HashMap<u64, DestroyingStatus>,
    watchers: Vec<mpsc::UnboundedSender<EventNotify>>,
}

/// An in-process placement service good enough for tests and examples: it
/// remembers what it is told and replays it to watchers.
pub struct StubPlacementClient {
    next_id: AtomicU64,
    state: Mutex<StubState>,
}

impl Default for StubPlacementClient {
    fn default() -> Self {
        StubPlacementClient {
            next_id: AtomicU64::new(1000),
            state: Mutex::default(),
        }
    }
}

impl StubPlacementClient {
    pub fn new() -> Arc<Self> {
        Arc::new(StubPlacementClient::default())
    }

    /// Seed a shard record and fan it out.
    pub fn put_shard(&self, shard: Shard, leader_replica_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.shards.insert(shard.id, (shard.clone(), leader_replica_id));
        Self::broadcast(
            &mut state,
            EventNotify::shard(shard, leader_replica_id, false, false),
        );
    }

    /// Announce removal of a shard.
    pub fn remove_shard(&self, shard: Shard) {
        let mut state = self.state.lock().unwrap();
        state.shards.remove(&shard.id);
        Self::broadcast(&mut state, EventNotify::shard(shard, 0, true, false));
    }

    /// Ask stores hosting the shard to create it.
    pub fn create_shard(&self, shard: Shard) {
        let mut state = self.state.lock().unwrap();
        state.shards.insert(shard.id, (shard.clone(), 0));
        Self::broadcast(&mut state, EventNotify::shard(shard, 0, false, true));
    }

    fn broadcast(state: &mut StubState, event: EventNotify) {
        state
            .watchers
            .retain(|w| w.send(event.clone()).is_ok());
    }
}

impl DestroyingStorage for StubPlacementClient {
    fn create_destroying(
        &self,
        shard_id: u64,
        index: u64,
        remove_data: bool,
        replicas: Vec<u64>,
    ) -> Result<tessera_api::metapb::ShardState> {
        use tessera_api::metapb::ShardState;

        let mut state = self.state.lock().unwrap();
        let status = state.destroying.entry(shard_id).or_insert_with(|| {
            DestroyingStatus {
                index,
                remove_data,
                state: ShardState::Destroying as i32,
                replicas: replicas.into_iter().map(|id| (id, false)).collect(),
            }
        });
        Ok(ShardState::from_i32(status.state).unwrap_or(ShardState::Destroying))
    }

    fn report_destroyed(
        &self,
        shard_id: u64,
        replica_id: u64,
    ) -> Result<tessera_api::metapb::ShardState> {
        use tessera_api::metapb::ShardState;

        let mut state = self.state.lock().unwrap();
        let new_state = {
            let Some(status) = state.destroying.get_mut(&shard_id) else {
                return Ok(ShardState::Destroying);
            };
            status.replicas.insert(replica_id, true);
            if status.replicas.values().all(|v| *v) {
                status.state = ShardState::Destroyed as i32;
            }
            ShardState::from_i32(status.state).unwrap_or(ShardState::Destroying)
        };
        if new_state == ShardState::Destroyed {
            // Every replica is gone; watchers drop the shard from their
            // routes.
            if let Some((shard, _)) = state.shards.remove(&shard_id) {
                Self::broadcast(&mut state, EventNotify::shard(shard, 0, true, false));
            }
        }
        Ok(new_state)
    }

    fn get_destroying(&self, shard_id: u64) -> Result<Option<DestroyingStatus>> {
        Ok(self.state.lock().unwrap().destroying.get(&shard_id).cloned())
    }
}

impl PlacementClient for StubPlacementClient {
    fn alloc_id(&self) -> Result<u64> {
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn watch(&self) -> mpsc::UnboundedReceiver<EventNotify> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        let init = EventNotify::init(
            state.shards.values().cloned().collect(),
            state.stores.values().cloned().collect(),
        );
        tx.send(init).unwrap_or_default();
        state.watchers.push(tx);
        rx
    }

    fn put_store(&self, store: Store) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.stores.insert(store.id, store.clone());
        Self::broadcast(&mut state, EventNotify::store(store));
        Ok(())
    }

    fn store_heartbeat(&self, stats: StoreStats) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::broadcast(&mut state, EventNotify::store_stats(stats));
        Ok(())
    }

    fn shard_heartbeat(
        &self,
        shard: Shard,
        stats: ShardStats,
        leader_replica_id: u64,
    ) -> Result<ShardHeartbeatRsp> {
        let mut state = self.state.lock().unwrap();
        state
            .shards
            .insert(shard.id, (shard.clone(), leader_replica_id));
        Self::broadcast(
            &mut state,
            EventNotify::shard(shard, leader_replica_id, false, false),
        );
        Self::broadcast(&mut state, EventNotify::shard_stats(stats));
        Ok(ShardHeartbeatRsp::default())
    }

    fn check_shard_states(&self, shards: &[u64]) -> Result<CheckedShardStates> {
        use tessera_api::metapb::ShardState;

        let state = self.state.lock().unwrap();
        let mut checked = CheckedShardStates::default();
        for shard_id in shards {
            match state.destroying.get(shard_id) {
                Some(status) if status.state == ShardState::Destroyed as i32 => {
                    checked.destroyed.push(*shard_id)
                }
                Some(_) => checked.destroying.push(*shard_id),
                None => {}
            }
        }
        Ok(checked)
    }

    fn ask_batch_split(&self, _shard: Shard, count: u32) -> Result<Vec<SplitId>> {
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ids.push(SplitId {
                new_shard_id: self.alloc_id()?,
                new_replica_ids: vec![self.alloc_id()?],
            });
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use tessera_api::metapb::Epoch;

    use super::*;

    fn shard(id: u64) -> Shard {
        Shard {
            id,
            epoch: Some(Epoch {
                generation: 1,
                config_ver: 1,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn watch_replays_an_init_snapshot() {
        let pc = StubPlacementClient::new();
        pc.put_store(Store {
            id: 1,
            ..Default::default()
        })
        .unwrap();
        pc.put_shard(shard(7), 0);

        let mut rx = pc.watch();
        let event = rx.recv().await.unwrap();
        let init = event.init.unwrap();
        assert_eq!(init.shards.len(), 1);
        assert_eq!(init.stores.len(), 1);
    }

    #[test]
    fn destroy_quorum_progression() {
        use tessera_api::metapb::ShardState;

        let pc = StubPlacementClient::new();
        pc.put_shard(shard(1), 0);
        pc.create_destroying(1, 100, true, vec![1, 2, 3]).unwrap();

        assert_eq!(pc.report_destroyed(1, 1).unwrap(), ShardState::Destroying);
        assert_eq!(pc.report_destroyed(1, 2).unwrap(), ShardState::Destroying);
        assert_eq!(
            pc.get_destroying(1).unwrap().unwrap().state,
            ShardState::Destroying as i32
        );
        assert_eq!(pc.report_destroyed(1, 3).unwrap(), ShardState::Destroyed);
        assert_eq!(
            pc.get_destroying(1).unwrap().unwrap().state,
            ShardState::Destroyed as i32
        );
    }

    #[test]
    fn ids_are_unique() {
        let pc = StubPlacementClient::new();
        let a = pc.alloc_id().unwrap();
        let b = pc.alloc_id().unwrap();
        assert_ne!(a, b);
    }
}
