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

//! The cluster-wide routing cache.
//!
//! A router consumes the placement event stream serially and answers
//! `(group, key) -> (shard, store)` queries from an in-memory snapshot.
//! Queries never fail; unknown targets come back as default values.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use prost::Message;
use tessera_api::{
    metapb::{Shard, ShardStats, Store, StoreStats},
    rpcpb::{EventNotify, EventType, ReplicaSelectPolicy},
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::shard_tree::ShardTree;

/// Reacts to shards disappearing from or appearing in the topology; the
/// store uses these to destroy and create local replicas.
pub trait ShardEventHandler: Send + Sync {
    fn on_shard_removed(&self, shard_id: u64);
    fn on_shard_created(&self, shard: Shard);
}

struct NopShardEventHandler;

impl ShardEventHandler for NopShardEventHandler {
    fn on_shard_removed(&self, _shard_id: u64) {}
    fn on_shard_created(&self, _shard: Shard) {}
}

#[derive(Default)]
struct RouterState {
    /// group id -> tree of live ranges.
    key_ranges: HashMap<u64, Arc<ShardTree>>,
    /// shard id -> shard metadata.
    shards: HashMap<u64, Shard>,
    /// shard id -> the store hosting the leader replica.
    leaders: HashMap<u64, Store>,
    /// store id -> store metadata.
    stores: HashMap<u64, Store>,
    /// Leaders whose store is not yet known; promoted on the store event.
    missing_leader_stores: HashMap<u64, tessera_api::metapb::Replica>,
    /// shard id -> round-robin cursor for `SelectRandom`.
    ops: HashMap<u64, u64>,
    shard_stats: HashMap<u64, ShardStats>,
    store_stats: HashMap<u64, StoreStats>,
}

/// The authoritative in-memory cache of cluster topology.
#[derive(Clone)]
pub struct Router
where
    Self: Send + Sync,
{
    state: Arc<RwLock<RouterState>>,
    handler: Arc<dyn ShardEventHandler>,
}

impl Router {
    /// Build a router consuming `events`; the consumer task runs until the
    /// channel closes.
    pub fn new(events: mpsc::UnboundedReceiver<EventNotify>) -> Router {
        Self::with_handler(events, Arc::new(NopShardEventHandler))
    }

    pub fn with_handler(
        mut events: mpsc::UnboundedReceiver<EventNotify>,
        handler: Arc<dyn ShardEventHandler>,
    ) -> Router {
        let router = Router {
            state: Arc::default(),
            handler,
        };
        let cloned_router = router.clone();
        tokio::spawn(async move {
            info!("router event loop task started");
            while let Some(event) = events.recv().await {
                cloned_router.handle_event(event);
            }
            info!("router event loop task stopped");
        });
        router
    }

    /// A router detached from any event stream; callers feed it through
    /// `update_shard` / `update_store` / `update_leader`.
    pub fn new_for_test() -> Router {
        let (_sender, receiver) = mpsc::unbounded_channel();
        Self::new(receiver)
    }

    pub fn handle_event(&self, event: EventNotify) {
        let mut state = self.state.write().unwrap();
        match EventType::from_i32(event.event_type) {
            Some(EventType::InitEvent) => {
                let init = event.init.unwrap_or_default();
                info!(
                    shards = init.shards.len(),
                    stores = init.stores.len(),
                    "router reset by init event",
                );
                state.key_ranges.clear();
                for data in &init.stores {
                    Self::update_store_locked(&mut state, data);
                }
                for (i, data) in init.shards.iter().enumerate() {
                    let leader = init.leaders.get(i).copied().unwrap_or_default();
                    self.update_shard_locked(&mut state, data, leader, false, false);
                }
            }
            Some(EventType::ShardEvent) => {
                let shard = event.shard.unwrap_or_default();
                self.update_shard_locked(
                    &mut state,
                    &shard.data,
                    shard.leader_replica_id,
                    shard.removed,
                    shard.create,
                );
            }
            Some(EventType::StoreEvent) => {
                let store = event.store.unwrap_or_default();
                Self::update_store_locked(&mut state, &store.data);
            }
            Some(EventType::ShardStatsEvent) => {
                if let Some(stats) = event.shard_stats {
                    state.shard_stats.insert(stats.shard_id, stats);
                }
            }
            Some(EventType::StoreStatsEvent) => {
                if let Some(stats) = event.store_stats {
                    state.store_stats.insert(stats.store_id, stats);
                }
            }
            None => {}
        }
    }

    /// The shard containing `key`, or a default shard when the group has no
    /// covering range.
    pub fn select_shard_id_by_key(&self, group: u64, key: &[u8]) -> u64 {
        let state = self.state.read().unwrap();
        Self::search_shard_locked(&state, group, key).id
    }

    /// `(shard, leader store)` for `key`; an empty store means no leader is
    /// known yet.
    pub fn select_shard(&self, group: u64, key: &[u8]) -> (Shard, Store) {
        self.select_shard_with_policy(group, key, ReplicaSelectPolicy::SelectLeader)
    }

    pub fn select_shard_with_policy(
        &self,
        group: u64,
        key: &[u8],
        policy: ReplicaSelectPolicy,
    ) -> (Shard, Store) {
        let mut state = self.state.write().unwrap();
        let shard = Self::search_shard_locked(&state, group, key);
        let store = Self::select_replica_store_by_policy_locked(&mut state, &shard, policy);
        (shard, store)
    }

    /// The store hosting a replica of `shard_id`, picked by `policy`.
    pub fn select_replica_store_with_policy(
        &self,
        shard_id: u64,
        policy: ReplicaSelectPolicy,
    ) -> Store {
        let mut state = self.state.write().unwrap();
        let Some(shard) = state.shards.get(&shard_id).cloned() else {
            return Store::default();
        };
        Self::select_replica_store_by_policy_locked(&mut state, &shard, policy)
    }

    pub fn get_shard(&self, shard_id: u64) -> Shard {
        let state = self.state.read().unwrap();
        state.shards.get(&shard_id).cloned().unwrap_or_default()
    }

    pub fn leader_replica_store(&self, shard_id: u64) -> Store {
        let state = self.state.read().unwrap();
        state.leaders.get(&shard_id).cloned().unwrap_or_default()
    }

    pub fn get_store(&self, store_id: u64) -> Store {
        let state = self.state.read().unwrap();
        state.stores.get(&store_id).cloned().unwrap_or_default()
    }

    /// Visit the shards of `group` intersecting `[start, end)` with the
    /// store picked by `policy`; stop when `f` returns false.
    pub fn ascend_range(
        &self,
        group: u64,
        start: &[u8],
        end: &[u8],
        policy: ReplicaSelectPolicy,
        mut f: impl FnMut(&Shard, Store) -> bool,
    ) {
        let mut state = self.state.write().unwrap();
        let Some(tree) = state.key_ranges.get(&group).cloned() else {
            return;
        };
        let mut visited = Vec::new();
        tree.ascend_range(start, end, |shard| {
            visited.push(shard.clone());
            true
        });
        for shard in visited {
            let store = Self::select_replica_store_by_policy_locked(&mut state, &shard, policy);
            if !f(&shard, store) {
                return;
            }
        }
    }

    /// Visit every shard of `group` in no particular order.
    pub fn foreach_shards(&self, group: u64, mut f: impl FnMut(&Shard) -> bool) {
        let state = self.state.read().unwrap();
        for shard in state.shards.values() {
            if shard.group == group && !f(shard) {
                return;
            }
        }
    }

    pub fn get_shard_stats(&self, shard_id: u64) -> ShardStats {
        let state = self.state.read().unwrap();
        state.shard_stats.get(&shard_id).cloned().unwrap_or_default()
    }

    pub fn get_store_stats(&self, store_id: u64) -> StoreStats {
        let state = self.state.read().unwrap();
        state.store_stats.get(&store_id).cloned().unwrap_or_default()
    }

    /// Repair the leader mapping from a `NotLeader` hint. A zero replica id
    /// is a no-op.
    pub fn update_leader(&self, shard_id: u64, leader_replica_id: u64) {
        if leader_replica_id == 0 {
            return;
        }
        let mut state = self.state.write().unwrap();
        Self::update_leader_locked(&mut state, shard_id, leader_replica_id);
    }

    pub fn update_shard(&self, shard: Shard) {
        let mut state = self.state.write().unwrap();
        let data = shard.encode_to_vec();
        self.update_shard_locked(&mut state, &data, 0, false, false);
    }

    pub fn update_store(&self, store: Store) {
        let mut state = self.state.write().unwrap();
        Self::update_store_locked(&mut state, &store.encode_to_vec());
    }

    fn update_shard_locked(
        &self,
        state: &mut RouterState,
        data: &[u8],
        leader_replica_id: u64,
        removed: bool,
        create: bool,
    ) {
        let shard = match Shard::decode(data) {
            Ok(shard) => shard,
            Err(err) => panic!("router: decode shard event payload: {err}"),
        };

        if removed {
            info!(shard = shard.id, group = shard.group, "shard removed from route table");
            self.handler.on_shard_removed(shard.id);
            if let Some(tree) = state.key_ranges.get(&shard.group) {
                tree.remove(&shard);
            }
            state.shards.remove(&shard.id);
            state.missing_leader_stores.remove(&shard.id);
            state.leaders.remove(&shard.id);
            return;
        }

        if create {
            info!(shard = shard.id, group = shard.group, "shard creation requested");
            self.handler.on_shard_created(shard);
            return;
        }

        state.shards.insert(shard.id, shard.clone());
        state
            .key_ranges
            .entry(shard.group)
            .or_insert_with(|| Arc::new(ShardTree::new()))
            .update([shard.clone()]);
        debug!(shard = shard.id, leader = leader_replica_id, "shard route updated");

        if leader_replica_id > 0 {
            Self::update_leader_locked(state, shard.id, leader_replica_id);
        }
    }

    fn update_store_locked(state: &mut RouterState, data: &[u8]) {
        let store = match Store::decode(data) {
            Ok(store) => store,
            Err(err) => panic!("router: decode store event payload: {err}"),
        };

        let store_id = store.id;
        state.stores.insert(store_id, store);

        // Promote any deferred leader record waiting for this store.
        let promoted = state
            .missing_leader_stores
            .iter()
            .filter(|(shard_id, replica)| {
                replica.store_id == store_id && state.shards.contains_key(shard_id)
            })
            .map(|(shard_id, replica)| (*shard_id, replica.id))
            .collect::<Vec<_>>();
        for (shard_id, replica_id) in promoted {
            Self::update_leader_locked(state, shard_id, replica_id);
        }
    }

    fn update_leader_locked(state: &mut RouterState, shard_id: u64, leader_replica_id: u64) {
        let Some(shard) = state.shards.get(&shard_id).cloned() else {
            panic!("router: shard {shard_id} must exist");
        };

        for replica in &shard.replicas {
            if replica.id == leader_replica_id {
                if let Some(store) = state.stores.get(&replica.store_id).cloned() {
                    state.missing_leader_stores.remove(&shard_id);
                    info!(
                        shard = shard_id,
                        leader = replica.id,
                        address = %store.client_address,
                        "shard leader updated",
                    );
                    state.leaders.insert(shard_id, store);
                    return;
                }

                // Wait for the store event.
                state.missing_leader_stores.insert(shard_id, replica.clone());
                break;
            }
        }

        debug!(shard = shard_id, "skip shard leader, missing store");
    }

    fn select_replica_store_by_policy_locked(
        state: &mut RouterState,
        shard: &Shard,
        policy: ReplicaSelectPolicy,
    ) -> Store {
        match policy {
            // Lease tracking does not exist yet; lease-holder reads resolve
            // to the leader.
            ReplicaSelectPolicy::SelectLeader | ReplicaSelectPolicy::SelectLeaseHolder => {
                state.leaders.get(&shard.id).cloned().unwrap_or_default()
            }
            ReplicaSelectPolicy::SelectRandom => {
                if shard.replicas.is_empty() {
                    return Store::default();
                }
                let op = state.ops.entry(shard.id).or_default();
                *op += 1;
                let store_id = shard.replicas[(*op as usize) % shard.replicas.len()].store_id;
                state.stores.get(&store_id).cloned().unwrap_or_default()
            }
        }
    }

    fn search_shard_locked(state: &RouterState, group: u64, key: &[u8]) -> Shard {
        state
            .key_ranges
            .get(&group)
            .and_then(|tree| tree.search(key))
            .unwrap_or_default()
    }
}
