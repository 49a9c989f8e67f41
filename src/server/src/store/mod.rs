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

//! The store: one node hosting many replicas. It boots persisted shards,
//! routes inbound requests to replicas, reacts to placement events and
//! heartbeat directives, and wires the router, proxy and transport
//! together.

mod worker_pool;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, RwLock,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use prost::Message as _;
use raft_engine::{Engine, LogBatch};
use tessera_api::{
    errorpb, metapb,
    metapb::{ReplicaState, Shard, ShardState},
    rpcpb::{AdminCmdType, CmdType, Request, ResponseBatch},
};
use tracing::{debug, error, info, warn};

pub use self::worker_pool::WorkerPool;
use crate::{
    config::Config,
    placement::PlacementClient,
    proxy::{backend::DefaultBackendFactory, ProxyRpc, ShardsProxy},
    replica::{
        destroy::DestroyingStorage, proposal::ResponseCb, Action, Replica, ReplicaHost,
        ReplicaOptions, SnapshotStatusSignal, SplitId,
    },
    router::{Router, ShardEventHandler},
    serverpb::RaftMessage,
    shard_tree::ShardTree,
    storage::{
        DataStorageFactory, DiskStatsReader, MemoryStatsReader, StorageStatsReader,
    },
    transport::{AddressResolver, MessageHandler, Transport},
    Error, Result,
};

const STORE_IDENT_GROUP: u64 = 0;
const STORE_IDENT_KEY: &[u8] = b"store_ident";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Observes shard lifecycle transitions on this store; the customization
/// point for embedding applications.
pub trait ShardStateAware: Send + Sync {
    fn created(&self, _shard: &Shard) {}
    fn updated(&self, _shard: &Shard) {}
    fn destroyed(&self, _shard: &Shard) {}
    fn become_leader(&self, _shard: &Shard) {}
    fn become_follower(&self, _shard: &Shard) {}
}

/// A lazily bound back-reference to the store, handed to the bridge
/// structures created before the store exists.
#[derive(Clone, Default)]
struct StoreRef(Arc<OnceLock<Store>>);

impl StoreRef {
    fn get(&self) -> Option<Store> {
        self.0.get().cloned()
    }
}

struct StoreInner {
    cfg: Config,
    meta: metapb::Store,
    engine: Arc<Engine>,
    storage_factory: Arc<dyn DataStorageFactory>,
    placement: Arc<dyn PlacementClient>,
    router: Router,
    proxy: ShardsProxy,
    rpc: Arc<ProxyRpc>,
    transport: Transport,
    worker_pool: Mutex<Option<WorkerPool>>,
    replicas: RwLock<HashMap<u64, Arc<Replica>>>,
    replica_records: RwLock<HashMap<u64, metapb::Replica>>,
    key_ranges: RwLock<HashMap<u64, Arc<ShardTree>>>,
    /// Vote messages for shards that do not exist here yet; replayed when
    /// the replica appears.
    dropped_vote_msgs: Mutex<HashMap<u64, RaftMessage>>,
    stats_reader: Box<dyn StorageStatsReader>,
    aware: Option<Arc<dyn ShardStateAware>>,
    stopped: AtomicBool,
}

/// The handle to one running store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Boot a store: open the log engine, join the placement service,
    /// restart persisted shards, and start serving.
    pub async fn start(
        cfg: Config,
        storage_factory: Arc<dyn DataStorageFactory>,
        placement: Arc<dyn PlacementClient>,
    ) -> Result<Store> {
        Self::start_with_aware(cfg, storage_factory, placement, None).await
    }

    /// As `start`, with a shard-state observer plugged in.
    pub async fn start_with_aware(
        mut cfg: Config,
        storage_factory: Arc<dyn DataStorageFactory>,
        placement: Arc<dyn PlacementClient>,
        aware: Option<Arc<dyn ShardStateAware>>,
    ) -> Result<Store> {
        cfg.adjust();
        info!("begin to start store");

        std::fs::create_dir_all(cfg.log_path())?;
        std::fs::create_dir_all(cfg.snapshot_root())?;
        let engine_cfg = raft_engine::Config {
            dir: cfg.log_path().to_str().unwrap().to_owned(),
            ..Default::default()
        };
        let engine = Arc::new(Engine::open(engine_cfg)?);

        let store_id = Self::load_or_alloc_store_id(&engine, placement.as_ref())?;
        let meta = metapb::Store {
            id: store_id,
            raft_address: cfg.raft_address.clone(),
            client_address: cfg.client_address.clone(),
            labels: cfg
                .labels
                .iter()
                .map(|(key, value)| metapb::Label {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
            start_time: unix_now() as i64,
        };

        let store_ref = StoreRef::default();
        let router = Router::with_handler(
            placement.watch(),
            Arc::new(RouterEventBridge(store_ref.clone())),
        );

        let max_frame_length = (cfg.raft.max_entry_bytes as usize) * 2;
        let transport = Transport::new(
            Arc::new(RouterAddressResolver(router.clone())),
            Arc::new(TransportBridge(store_ref.clone())),
            max_frame_length,
        );

        let request_ref = store_ref.clone();
        let request_handler = Arc::new(move |req: Request| match request_ref.get() {
            Some(store) => store.on_request(req),
            None => Err(Error::Stopped),
        });
        let factory = DefaultBackendFactory::new(
            cfg.client_address.clone(),
            request_handler.clone(),
            max_frame_length,
        );
        let proxy = ShardsProxy::new(router.clone(), Box::new(factory));
        let rpc = ProxyRpc::new(request_handler, max_frame_length);
        proxy.set_rpc(rpc.clone());

        let worker_pool = WorkerPool::new("tessera", cfg.worker.raft_event_workers)?;

        let stats_reader: Box<dyn StorageStatsReader> = if cfg.use_memory_as_storage {
            Box::new(MemoryStatsReader)
        } else {
            Box::new(DiskStatsReader::new(cfg.data_path.clone()))
        };

        let store = Store {
            inner: Arc::new(StoreInner {
                cfg,
                meta: meta.clone(),
                engine,
                storage_factory,
                placement: placement.clone(),
                router,
                proxy,
                rpc,
                transport,
                worker_pool: Mutex::new(Some(worker_pool)),
                replicas: RwLock::new(HashMap::new()),
                replica_records: RwLock::new(HashMap::new()),
                key_ranges: RwLock::new(HashMap::new()),
                dropped_vote_msgs: Mutex::new(HashMap::new()),
                stats_reader,
                aware,
                stopped: AtomicBool::new(false),
            }),
        };
        store_ref.0.set(store.clone()).ok();

        placement.put_store(meta)?;
        if !store.inner.cfg.raft_address.is_empty() {
            store
                .inner
                .transport
                .start(&store.inner.cfg.raft_address)
                .await?;
            info!("raft transport started");
        }

        store.start_shards()?;
        info!("shards started");

        if !store.inner.cfg.client_address.is_empty() {
            store.inner.rpc.start(&store.inner.cfg.client_address).await?;
            info!("shards proxy rpc started");
        }

        store.start_heartbeat_tasks();
        info!(store = store_id, "store started");
        Ok(store)
    }

    fn load_or_alloc_store_id(engine: &Engine, placement: &dyn PlacementClient) -> Result<u64> {
        if let Some(bytes) = engine.get(STORE_IDENT_GROUP, STORE_IDENT_KEY) {
            let id = u64::from_be_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::InvalidData("store ident".into()))?,
            );
            return Ok(id);
        }
        let id = placement.alloc_id()?;
        let mut batch = LogBatch::default();
        batch
            .put(
                STORE_IDENT_GROUP,
                STORE_IDENT_KEY.to_vec(),
                id.to_be_bytes().to_vec(),
            )
            .unwrap();
        engine.write(&mut batch, true)?;
        info!(store = id, "store ident allocated");
        Ok(id)
    }

    /// Restart every shard the data storage remembers. Tombstones are
    /// cleaned, destroying shards re-enter their destroy task, and the
    /// placement service gets the final say on everything else.
    fn start_shards(&self) -> Result<()> {
        let mut boot = Vec::new();
        let mut destroying = Vec::new();
        let mut tombstones = 0;

        let mut states = Vec::new();
        self.inner.storage_factory.foreach(&mut |_, ds| {
            if let Ok(mut s) = ds.initial_states() {
                states.append(&mut s);
            }
        });

        for state in states {
            let metadata = state.metadata.clone();
            let Some(shard) = metadata.shard.clone() else {
                continue;
            };
            if metadata.state == ReplicaState::Tombstone as i32 {
                tombstones += 1;
                debug!(shard = shard.id, "shard is tombstone in store");
                continue;
            }
            if shard.shard_state() == ShardState::Destroying {
                destroying.push((shard, state.log_index, metadata.remove_data));
                continue;
            }
            boot.push(shard);
        }

        // Placement may have destroyed shards while this store was down.
        let shard_ids = boot.iter().map(|s| s.id).collect::<Vec<_>>();
        let checked = self.inner.placement.check_shard_states(&shard_ids)?;
        let (confirmed, stale): (Vec<_>, Vec<_>) = boot
            .into_iter()
            .partition(|s| !checked.destroying.contains(&s.id) && !checked.destroyed.contains(&s.id));

        let total = confirmed.len() + destroying.len();
        for shard in confirmed {
            if let Err(err) = self.create_replica(&shard, "restart") {
                error!(shard = shard.id, "fail to restart shard: {err}");
            }
        }
        for (shard, log_index, remove_data) in destroying {
            match self.create_replica(&shard, "restart destroying") {
                Ok(replica) => {
                    replica.start_destroy_replica_task(log_index, remove_data, "restart")
                }
                Err(err) => error!(shard = shard.id, "fail to restart destroying shard: {err}"),
            }
        }
        for shard in stale {
            if let Some(replica) = self.get_replica(shard.id) {
                replica.start_destroy_replica_task(0, true, "destroyed while offline");
            } else if let Ok(replica) = self.create_replica(&shard, "restart stale") {
                replica.start_destroy_replica_task(0, true, "destroyed while offline");
            }
        }

        info!(total, tombstones, "persisted shards restarted");
        Ok(())
    }

    fn create_replica(&self, shard: &Shard, reason: &str) -> Result<Arc<Replica>> {
        let Some(replica) = shard.replica_on_store(self.inner.meta.id) else {
            return Err(Error::InvalidArgument(format!(
                "shard {} holds no replica on store {}",
                shard.id, self.inner.meta.id
            )));
        };

        {
            let replicas = self.inner.replicas.read().unwrap();
            if let Some(existing) = replicas.get(&shard.id) {
                return Ok(existing.clone());
            }
        }

        info!(
            shard = shard.id,
            replica = replica.id,
            reason,
            "begin to create replica",
        );

        let host_ref = StoreRef::default();
        host_ref.0.set(self.clone()).ok();

        let data_storage = self.inner.storage_factory.data_storage(shard.group);
        let options = ReplicaOptions {
            store_id: self.inner.meta.id,
            shard: shard.clone(),
            replica: replica.clone(),
            raft: self.inner.cfg.raft.clone(),
            replication: self.inner.cfg.replication.clone(),
            tick_interval: self.inner.cfg.tick_interval(),
            engine: self.inner.engine.clone(),
            data_storage,
            snapshot_root: self.inner.cfg.snapshot_root(),
            transport: Arc::new(self.inner.transport.clone()),
            destroying_storage: placement_as_destroying(self.inner.placement.clone()),
            host: Arc::new(HostBridge(host_ref)),
        };

        // Replica loops live on the worker pool runtime.
        let pool = self.inner.worker_pool.lock().unwrap();
        let Some(pool) = pool.as_ref() else {
            return Err(Error::Stopped);
        };
        let _guard = pool.handle().enter();
        let new_replica = Replica::start(options)?;

        let mut replicas = self.inner.replicas.write().unwrap();
        let entry = replicas.entry(shard.id).or_insert_with(|| new_replica);
        let replica_handle = entry.clone();
        drop(replicas);

        {
            let mut records = self.inner.replica_records.write().unwrap();
            for r in &shard.replicas {
                records.insert(r.id, r.clone());
            }
        }
        self.update_shard_key_range(shard.clone());

        // A parked vote may belong to this shard; feed it now.
        if let Some(msg) = self.inner.dropped_vote_msgs.lock().unwrap().remove(&shard.id) {
            replica_handle.on_raft_message(msg);
        }
        if let Some(aware) = &self.inner.aware {
            aware.created(shard);
        }
        Ok(replica_handle)
    }

    /// Receive a request from the proxy (local or RPC) and hand it to the
    /// owning replica.
    pub fn on_request(&self, req: Request) -> Result<()> {
        let proxy = self.inner.proxy.clone();
        let cb: ResponseCb = Arc::new(move |resp| proxy.on_response(resp));
        self.on_request_with_cb(req, cb)
    }

    pub fn on_request_with_cb(&self, req: Request, cb: ResponseCb) -> Result<()> {
        debug!(id = ?req.id, "receive request");

        let replica = if req.to_shard > 0 {
            match self.get_replica(req.to_shard) {
                Some(replica) => replica,
                None => {
                    respond_error(&req, &cb, errorpb::Error::store_not_match(0, self.inner.meta.id));
                    return Ok(());
                }
            }
        } else {
            match self.select_replica(req.group, &req.key) {
                Some(replica) => replica,
                None => {
                    respond_error(&req, &cb, errorpb::Error::store_not_match(0, self.inner.meta.id));
                    return Ok(());
                }
            }
        };

        // A destroying shard no longer serves; its successors (split
        // children or migrated replicas) do.
        if replica.shard().shard_state() == ShardState::Destroying {
            respond_error(&req, &cb, errorpb::Error::shard_unavailable(replica.shard_id()));
            return Ok(());
        }

        if let Err(err) = replica.on_request(req.clone(), cb.clone()) {
            respond_error(&req, &cb, err.into());
        }
        Ok(())
    }

    fn select_replica(&self, group: u64, key: &[u8]) -> Option<Arc<Replica>> {
        let shard = {
            let trees = self.inner.key_ranges.read().unwrap();
            trees.get(&group)?.search(key)?
        };
        self.get_replica(shard.id)
    }

    pub fn get_replica(&self, shard_id: u64) -> Option<Arc<Replica>> {
        self.inner.replicas.read().unwrap().get(&shard_id).cloned()
    }

    /// Whether this store hosts the (probable) leader replica of the shard.
    pub fn maybe_leader(&self, shard_id: u64) -> bool {
        self.get_replica(shard_id)
            .map(|r| r.is_leader())
            .unwrap_or_default()
    }

    pub fn meta(&self) -> metapb::Store {
        self.inner.meta.clone()
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn shards_proxy(&self) -> &ShardsProxy {
        &self.inner.proxy
    }

    /// Allocate an id from placement, retrying forever; callers rely on
    /// ids always arriving.
    pub fn must_alloc_id(&self) -> u64 {
        loop {
            match self.inner.placement.alloc_id() {
                Ok(id) => return id,
                Err(err) => {
                    error!("failed to alloc id: {err}");
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
        }
    }

    fn update_shard_key_range(&self, shard: Shard) {
        let tree = {
            let mut trees = self.inner.key_ranges.write().unwrap();
            trees
                .entry(shard.group)
                .or_insert_with(|| Arc::new(ShardTree::new()))
                .clone()
        };
        tree.update([shard]);
    }

    fn next_shard(&self, shard: &Shard) -> Option<Shard> {
        let trees = self.inner.key_ranges.read().unwrap();
        trees.get(&shard.group)?.next_shard(&shard.start)
    }

    /// Inbound raft traffic; unknown shards may spawn a replica shell that
    /// gets its data from the leader's snapshot.
    fn handle_raft_message(&self, msg: RaftMessage) {
        let Some(to_replica) = msg.to_replica.clone() else {
            return;
        };
        if to_replica.store_id != self.inner.meta.id {
            warn!(
                shard = msg.shard_id,
                give = to_replica.store_id,
                want = self.inner.meta.id,
                "drop misrouted raft message",
            );
            return;
        }

        if let Some(replica) = self.get_replica(msg.shard_id) {
            replica.on_raft_message(msg);
            return;
        }

        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }

        // A replica this store does not host yet: create a shell from the
        // sender's view; range overlap with live shards parks votes instead
        // (the local split has not applied yet).
        let shard = Shard {
            id: msg.shard_id,
            group: msg.group,
            start: msg.start.clone(),
            end: msg.end.clone(),
            epoch: msg.shard_epoch,
            replicas: [msg.from_replica.clone(), Some(to_replica)]
                .into_iter()
                .flatten()
                .collect(),
            ..Default::default()
        };

        if self.overlaps_existing_range(&shard) {
            self.cache_dropped_vote_msg(msg);
            return;
        }

        match self.create_replica(&shard, "raft message") {
            Ok(replica) => replica.on_raft_message(msg),
            Err(err) => warn!(shard = shard.id, "create replica for message: {err}"),
        }
    }

    fn overlaps_existing_range(&self, shard: &Shard) -> bool {
        let trees = self.inner.key_ranges.read().unwrap();
        let Some(tree) = trees.get(&shard.group) else {
            return false;
        };
        let mut overlapped = false;
        tree.ascend_range(&shard.start, &shard.end, |stored| {
            if stored.id != shard.id {
                overlapped = true;
            }
            !overlapped
        });
        overlapped
    }

    /// A split may deliver vote messages for the child before the local
    /// parent applied the split; park them until the child exists.
    fn cache_dropped_vote_msg(&self, msg: RaftMessage) {
        use protobuf::Message as _;
        use raft::eraftpb::MessageType;

        for payload in &msg.messages {
            let mut message = raft::eraftpb::Message::default();
            if message.merge_from_bytes(payload).is_err() {
                continue;
            }
            if matches!(
                message.get_msg_type(),
                MessageType::MsgRequestVote | MessageType::MsgRequestPreVote
            ) {
                self.inner
                    .dropped_vote_msgs
                    .lock()
                    .unwrap()
                    .insert(msg.shard_id, msg.clone());
                return;
            }
        }
    }

    /// Dynamic creation requested through the placement event stream.
    fn do_dynamically_create(&self, shard: Shard) {
        if self.get_replica(shard.id).is_some() {
            return;
        }
        if shard.replica_on_store(self.inner.meta.id).is_none() {
            return;
        }
        if let Err(err) = self.create_replica(&shard, "dynamic create") {
            warn!(shard = shard.id, "fail to create shard dynamically: {err}");
        }
    }

    /// Destroy the local replica of `shard_id`.
    pub fn destroy_replica(&self, shard_id: u64, remove_data: bool, reason: &str) {
        if let Some(replica) = self.get_replica(shard_id) {
            let target_index = replica.state().applied_index();
            replica.start_destroy_replica_task(target_index, remove_data, reason);
        }
    }

    fn on_replica_destroyed(&self, shard_id: u64) {
        let removed = self.inner.replicas.write().unwrap().remove(&shard_id);
        if let Some(replica) = removed {
            let shard = replica.shard();
            if let Some(tree) = self.inner.key_ranges.read().unwrap().get(&shard.group) {
                tree.remove(&shard);
            }
            let mut records = self.inner.replica_records.write().unwrap();
            records.remove(&replica.replica_id());
            replica.close();
            if let Some(aware) = &self.inner.aware {
                aware.destroyed(&shard);
            }
        }
    }

    fn start_heartbeat_tasks(&self) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                if store.inner.stopped.load(Ordering::Acquire) {
                    return;
                }
                store.handle_store_heartbeat();
                store.handle_shard_heartbeats();
            }
        });
    }

    fn handle_store_heartbeat(&self) {
        let stats = self.collect_store_stats();
        if let Err(err) = self.inner.placement.store_heartbeat(stats) {
            error!("store heartbeat: {err}");
        }
    }

    fn collect_store_stats(&self) -> metapb::StoreStats {
        let capacity = self.inner.stats_reader.capacity_stats();
        let mut stats = metapb::StoreStats {
            store_id: self.inner.meta.id,
            capacity: capacity.capacity,
            available: capacity.available,
            used_size: capacity.used_size,
            shard_count: self.inner.replicas.read().unwrap().len() as u64,
            sending_snap_count: self.inner.transport.sending_snapshot_count(),
            start_time: self.inner.meta.start_time as u64,
            ..Default::default()
        };
        if self.inner.cfg.capacity > 0 {
            stats.capacity = self.inner.cfg.capacity;
            stats.available = stats.capacity.saturating_sub(stats.used_size);
        }
        self.inner.storage_factory.foreach(&mut |_, ds| {
            let s = ds.stats();
            stats.written_bytes += s.written_bytes;
            stats.written_keys += s.written_keys;
            stats.read_bytes += s.read_bytes;
            stats.read_keys += s.read_keys;
        });
        stats
    }

    /// Report each leader replica and execute whatever the placement
    /// service piggybacks on the response.
    fn handle_shard_heartbeats(&self) {
        let leaders = {
            let replicas = self.inner.replicas.read().unwrap();
            replicas
                .values()
                .filter(|r| r.is_leader())
                .cloned()
                .collect::<Vec<_>>()
        };

        for replica in leaders {
            let shard = replica.shard();
            let ds = self.inner.storage_factory.data_storage(shard.group);
            let approximate_size = ds.split_check(&shard, 0).map(|(size, _)| size).unwrap_or(0);
            let stats = metapb::ShardStats {
                shard_id: shard.id,
                approximate_size,
                ..Default::default()
            };
            let rsp = match self.inner.placement.shard_heartbeat(
                shard.clone(),
                stats,
                replica.replica_id(),
            ) {
                Ok(rsp) => rsp,
                Err(err) => {
                    error!(shard = shard.id, "shard heartbeat: {err}");
                    continue;
                }
            };

            if rsp.destroy_directly {
                self.destroy_replica(shard.id, true, "remove by placement");
                continue;
            }
            if let Some(change) = rsp.config_change {
                info!(shard = shard.id, "send config change request");
                self.propose_admin(
                    &replica,
                    AdminCmdType::AdminConfigChange,
                    change.encode_to_vec(),
                );
            } else if let Some(transfer) = rsp.transfer_leader {
                info!(shard = shard.id, "send transfer leader request");
                self.propose_admin(
                    &replica,
                    AdminCmdType::AdminTransferLeader,
                    transfer.encode_to_vec(),
                );
            } else if rsp.split || !rsp.split_keys.is_empty() {
                let split_keys = if rsp.split_keys.is_empty() {
                    // No keys named: scan for candidates at the configured
                    // granularity.
                    let ds = self.inner.storage_factory.data_storage(shard.group);
                    match ds.split_check(&shard, self.inner.cfg.replication.shard_split_bytes) {
                        Ok((_, keys)) => keys,
                        Err(err) => {
                            error!(shard = shard.id, "split check: {err}");
                            continue;
                        }
                    }
                } else {
                    rsp.split_keys
                };
                if !split_keys.is_empty() {
                    self.ask_split(&replica, shard, split_keys);
                }
            }
        }
    }

    fn propose_admin(&self, replica: &Arc<Replica>, ct: AdminCmdType, cmd: Vec<u8>) {
        let shard = replica.shard();
        let req = Request {
            id: uuid::Uuid::new_v4().as_bytes().to_vec(),
            group: shard.group,
            cmd_type: CmdType::Admin as i32,
            custom_type: ct as u64,
            cmd,
            epoch: Some(shard.epoch()),
            to_shard: shard.id,
            ..Default::default()
        };
        let shard_id = shard.id;
        let cb: ResponseCb = Arc::new(move |resp: ResponseBatch| {
            if let Some(err) = resp.header_error() {
                debug!(shard = shard_id, "admin request rejected: {}", err.message);
            }
        });
        if let Err(err) = replica.on_request(req, cb) {
            warn!(shard = shard_id, "fail to submit admin request: {err}");
        }
    }

    fn ask_split(&self, replica: &Arc<Replica>, shard: Shard, split_keys: Vec<Vec<u8>>) {
        let count = split_keys.len() as u32 + 1;
        let split_ids: Vec<SplitId> =
            match self.inner.placement.ask_batch_split(shard.clone(), count) {
                Ok(ids) => ids,
                Err(err) => {
                    error!(shard = shard.id, "fail to ask batch split: {err}");
                    return;
                }
            };
        replica.add_action(Action::Split {
            epoch: shard.epoch(),
            split_keys,
            split_ids,
        });
    }

    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("begin to stop store");

        self.inner.rpc.stop();
        self.inner.transport.close();

        let replicas = {
            let mut replicas = self.inner.replicas.write().unwrap();
            replicas.drain().map(|(_, r)| r).collect::<Vec<_>>()
        };
        for replica in replicas {
            replica.close();
        }

        self.inner.proxy.stop();
        if let Some(pool) = self.inner.worker_pool.lock().unwrap().take() {
            pool.shutdown();
        }
        info!("store stopped");
    }
}

fn respond_error(req: &Request, cb: &ResponseCb, err: errorpb::Error) {
    let batch = ResponseBatch::with_error(req.id.clone(), std::slice::from_ref(req), err);
    cb(batch);
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn placement_as_destroying(placement: Arc<dyn PlacementClient>) -> Arc<dyn DestroyingStorage> {
    struct Bridge(Arc<dyn PlacementClient>);
    impl DestroyingStorage for Bridge {
        fn create_destroying(
            &self,
            shard_id: u64,
            index: u64,
            remove_data: bool,
            replicas: Vec<u64>,
        ) -> Result<ShardState> {
            self.0.create_destroying(shard_id, index, remove_data, replicas)
        }
        fn report_destroyed(&self, shard_id: u64, replica_id: u64) -> Result<ShardState> {
            self.0.report_destroyed(shard_id, replica_id)
        }
        fn get_destroying(&self, shard_id: u64) -> Result<Option<metapb::DestroyingStatus>> {
            self.0.get_destroying(shard_id)
        }
    }
    Arc::new(Bridge(placement))
}

/// Router events that require store action: removals destroy local
/// replicas, creations boot them.
struct RouterEventBridge(StoreRef);

impl ShardEventHandler for RouterEventBridge {
    fn on_shard_removed(&self, shard_id: u64) {
        if let Some(store) = self.0.get() {
            store.destroy_replica(shard_id, true, "remove by event");
        }
    }

    fn on_shard_created(&self, shard: Shard) {
        if let Some(store) = self.0.get() {
            store.do_dynamically_create(shard);
        }
    }
}

struct RouterAddressResolver(Router);

impl AddressResolver for RouterAddressResolver {
    fn resolve(&self, store_id: u64) -> Option<String> {
        let store = self.0.get_store(store_id);
        if store.raft_address.is_empty() {
            None
        } else {
            Some(store.raft_address)
        }
    }
}

struct TransportBridge(StoreRef);

impl MessageHandler for TransportBridge {
    fn handle(&self, msg: RaftMessage) {
        if let Some(store) = self.0.get() {
            store.handle_raft_message(msg);
        }
    }

    fn unreachable(&self, shard_id: u64, to_replica_id: u64) {
        if let Some(store) = self.0.get() {
            if let Some(replica) = store.get_replica(shard_id) {
                replica.add_feedback(to_replica_id);
            }
        }
    }

    fn snapshot_status(&self, shard_id: u64, to_replica_id: u64, rejected: bool) {
        if let Some(store) = self.0.get() {
            if let Some(replica) = store.get_replica(shard_id) {
                replica.add_snapshot_status(SnapshotStatusSignal {
                    to_replica: to_replica_id,
                    rejected,
                });
            }
        }
    }
}

/// What replicas ask of their store.
struct HostBridge(StoreRef);

impl ReplicaHost for HostBridge {
    fn update_shard_key_range(&self, shard: Shard) {
        if let Some(store) = self.0.get() {
            if let Some(aware) = &store.inner.aware {
                aware.updated(&shard);
            }
            store.update_shard_key_range(shard);
        }
    }

    fn on_leadership_changed(&self, shard: &Shard, is_leader: bool) {
        if let Some(store) = self.0.get() {
            if let Some(aware) = &store.inner.aware {
                if is_leader {
                    aware.become_leader(shard);
                } else {
                    aware.become_follower(shard);
                }
            }
        }
    }

    fn on_shards_split(&self, children: Vec<Shard>) {
        let Some(store) = self.0.get() else { return };
        for child in children {
            if child.replica_on_store(store.inner.meta.id).is_some() {
                if let Err(err) = store.create_replica(&child, "split") {
                    warn!(shard = child.id, "fail to create split child: {err}");
                }
            }
        }
    }

    fn on_replica_destroyed(&self, shard_id: u64) {
        if let Some(store) = self.0.get() {
            store.on_replica_destroyed(shard_id);
        }
    }

    fn on_replica_removed(&self, shard_id: u64, target_index: u64) {
        if let Some(store) = self.0.get() {
            if let Some(replica) = store.get_replica(shard_id) {
                replica.start_destroy_replica_task(
                    target_index,
                    true,
                    "removed by config change",
                );
            }
        }
    }

    fn next_shard(&self, shard: &Shard) -> Option<Shard> {
        self.0.get()?.next_shard(shard)
    }
}
