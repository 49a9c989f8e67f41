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

//! One replica, one raft group, one cooperative event loop.
//!
//! The loop owns the raw raft node, the proposal pipeline and the state
//! machine; the rest of the store talks to it through queues on the
//! [`Replica`] handle. Every iteration drains a bounded slice of each queue,
//! feeds raft, then processes the produced `Ready`: persist entries and hard
//! state, ship messages, apply committed entries, release read-index reads
//! and react to snapshot requests.

pub mod apply;
pub mod compact;
pub mod conf_change;
pub mod destroy;
pub mod pending;
pub mod proposal;
pub mod read;
pub mod snapshot;
pub mod storage;

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use prost::Message as _;
use protobuf::Message as _;
use raft::{
    eraftpb::{ConfChange, ConfChangeV2, Entry, EntryType, Message, MessageType},
    Config as RaftNodeConfig, RawNode, ReadOnlyOption, SnapshotStatus, StateRole,
};
use raft_engine::{Engine, LogBatch};
use raft_proto::ConfChangeI;
use tessera_api::{
    errorpb,
    metapb::{Epoch, ReplicaRole, ReplicaState, Shard, ShardLocalState},
    rpcpb::{
        BatchSplitRequest, ConfigChangeRequest, Request, RequestBatch, SplitRequest,
        TransferLeaderRequest, TransferLeaderResponse,
    },
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::{
    apply::{AdminEffect, ApplyContext, NextShardHint, StateMachine},
    conf_change::{check_conf_change, ConfChangeEncoding},
    destroy::{DestroyReplicaTaskFactory, DestroyingStorage},
    pending::PendingProposals,
    proposal::{Batch, ProposalBatch, ReqCtx, RequestType, ResponseCb},
    read::ReadIndexQueue,
    snapshot::Snapshotter,
    storage::{LogReader, WriteTask},
};
use crate::{
    config::{RaftConfig, ReplicationConfig},
    serverpb::{RaftMessage, SnapshotFile},
    Error, Result,
};

/// How many queue items one loop iteration consumes per queue.
const EVENT_BATCH: usize = 256;

/// The ids allocated for one split child.
#[derive(Clone, Debug, Default)]
pub struct SplitId {
    pub new_shard_id: u64,
    pub new_replica_ids: Vec<u64>,
}

/// Internal deferred work executed inside the event loop.
pub enum Action {
    /// Answer with the group's replica ids once every peer's match index
    /// reaches `target_index`; drop the sender otherwise.
    CheckLogCommitted {
        target_index: u64,
        tx: oneshot::Sender<Vec<u64>>,
    },
    /// Answer once the local applied index reaches `target_index`.
    CheckLogApplied {
        target_index: u64,
        tx: oneshot::Sender<()>,
    },
    /// Garbage-collect snapshot images below `index`; drop the image at
    /// `index` too when the persistent log already covers it.
    SnapshotCompaction {
        index: u64,
        extra: u64,
        persistent_log_index: u64,
    },
    /// Propose a batch split at `split_keys` using pre-allocated ids.
    Split {
        epoch: Epoch,
        split_keys: Vec<Vec<u8>>,
        split_ids: Vec<SplitId>,
    },
    /// Propose a compact-log up to `index`.
    ProposeCompactLog { index: u64 },
    /// The destroy task finished; tombstone the replica and shut down.
    CompleteDestroy { remove_data: bool },
}

/// Snapshot-send results reported by the transport.
#[derive(Clone, Copy, Debug)]
pub struct SnapshotStatusSignal {
    pub to_replica: u64,
    pub rejected: bool,
}

/// Ships raft message envelopes to other stores.
pub trait RaftTransport: Send + Sync {
    fn send_raft_message(&self, msg: RaftMessage);
}

/// What a replica needs from its hosting store, expressed as a trait to
/// avoid strong ownership cycles.
pub trait ReplicaHost: Send + Sync {
    /// Update the store's per-group key range tree.
    fn update_shard_key_range(&self, shard: Shard);

    /// Create local replicas for freshly split child shards.
    fn on_shards_split(&self, children: Vec<Shard>);

    /// The replica left the store; forget it.
    fn on_replica_destroyed(&self, shard_id: u64);

    /// The replica was demoted out of the group by a config change; the
    /// store starts its destroy task against `target_index`.
    fn on_replica_removed(&self, shard_id: u64, target_index: u64);

    /// The shard likely following `shard` in the key space, for stale-epoch
    /// hints.
    fn next_shard(&self, shard: &Shard) -> Option<Shard>;

    /// The replica's raft role flipped.
    fn on_leadership_changed(&self, _shard: &Shard, _is_leader: bool) {}
}

struct NopHost;

impl ReplicaHost for NopHost {
    fn update_shard_key_range(&self, _shard: Shard) {}
    fn on_shards_split(&self, _children: Vec<Shard>) {}
    fn on_replica_destroyed(&self, _shard_id: u64) {}
    fn on_replica_removed(&self, _shard_id: u64, _target_index: u64) {}
    fn next_shard(&self, _shard: &Shard) -> Option<Shard> {
        None
    }
}

/// The shared, lock-cheap view of a replica used by the store and proxy.
pub struct ReplicaStatus {
    pub shard_id: u64,
    pub replica_id: u64,
    pub group: u64,
    shard: RwLock<Shard>,
    leader_replica_id: AtomicU64,
    term: AtomicU64,
    is_leader: AtomicBool,
    applied_index: AtomicU64,
    closed: AtomicBool,
    destroy_task: Mutex<Option<String>>,
}

impl ReplicaStatus {
    #[inline]
    pub fn shard(&self) -> Shard {
        self.shard.read().unwrap().clone()
    }

    #[inline]
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    #[inline]
    pub fn leader_replica_id(&self) -> u64 {
        self.leader_replica_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }

    #[inline]
    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Everything needed to boot one replica.
pub struct ReplicaOptions {
    pub store_id: u64,
    pub shard: Shard,
    pub replica: tessera_api::metapb::Replica,
    pub raft: RaftConfig,
    pub replication: ReplicationConfig,
    pub tick_interval: Duration,
    pub engine: Arc<Engine>,
    pub data_storage: Arc<dyn crate::storage::DataStorage>,
    pub snapshot_root: PathBuf,
    pub transport: Arc<dyn RaftTransport>,
    pub destroying_storage: Arc<dyn DestroyingStorage>,
    pub host: Arc<dyn ReplicaHost>,
}

/// The handle to a running replica; all mutation goes through queues.
pub struct Replica {
    state: Arc<ReplicaStatus>,
    requests: mpsc::Sender<ReqCtx>,
    messages: mpsc::UnboundedSender<RaftMessage>,
    actions: mpsc::UnboundedSender<Action>,
    feedbacks: mpsc::UnboundedSender<u64>,
    snapshot_status: mpsc::UnboundedSender<SnapshotStatusSignal>,
    close_token: CancellationToken,
    destroy_factory: DestroyReplicaTaskFactory,
}

impl Replica {
    /// Boot the replica and spawn its event loop on the current runtime.
    pub fn start(options: ReplicaOptions) -> Result<Arc<Replica>> {
        let shard = options.shard.clone();
        let shard_id = shard.id;
        let replica_id = options.replica.id;

        // First boot of this raft group seeds the initial states.
        if options
            .engine
            .get_message::<raft::eraftpb::HardState>(replica_id, storage::keys::HARD_STATE_KEY)?
            .is_none()
        {
            let voters = shard
                .replicas
                .iter()
                .filter(|r| r.replica_role() == ReplicaRole::Voter)
                .map(|r| r.id)
                .collect();
            let learners = shard
                .replicas
                .iter()
                .filter(|r| r.replica_role() == ReplicaRole::Learner)
                .map(|r| r.id)
                .collect();
            storage::write_initial_state(&options.engine, replica_id, voters, learners)?;
        }

        let applied_index = options.data_storage.persisted_applied_index(shard_id)?;
        let log_reader = LogReader::open(replica_id, options.engine.clone())?;

        let raft_config = RaftNodeConfig {
            id: replica_id,
            election_tick: options.raft.election_tick,
            heartbeat_tick: 2,
            applied: applied_index,
            pre_vote: true,
            check_quorum: true,
            max_size_per_msg: options.raft.max_size_per_msg,
            max_inflight_msgs: options.raft.max_inflight_msgs,
            read_only_option: ReadOnlyOption::Safe,
            ..Default::default()
        };
        let mut raw_node = RawNode::with_default_logger(&raft_config, log_reader)?;

        // A single-member group elects itself immediately.
        if shard.replicas.len() == 1 && shard.replicas[0].id == replica_id {
            raw_node.campaign()?;
        }

        let state = Arc::new(ReplicaStatus {
            shard_id,
            replica_id,
            group: shard.group,
            shard: RwLock::new(shard.clone()),
            leader_replica_id: AtomicU64::new(0),
            term: AtomicU64::new(0),
            is_leader: AtomicBool::new(false),
            applied_index: AtomicU64::new(applied_index),
            closed: AtomicBool::new(false),
            destroy_task: Mutex::new(None),
        });

        let (requests_tx, requests_rx) = mpsc::channel(options.raft.max_inflight_requests);
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let (feedbacks_tx, feedbacks_rx) = mpsc::unbounded_channel();
        let (snapshot_status_tx, snapshot_status_rx) = mpsc::unbounded_channel();
        let close_token = CancellationToken::new();

        let snapshotter = Snapshotter::new(&options.snapshot_root, shard_id, replica_id)?;
        let host = options.host.clone();
        let hint_host = options.host.clone();
        let next_shard_hint: NextShardHint = Arc::new(move |shard| hint_host.next_shard(shard));
        let sm = StateMachine::new(
            options.store_id,
            replica_id,
            shard.clone(),
            options.data_storage.clone(),
            applied_index,
            0,
            next_shard_hint,
        );

        let destroy_actions = actions_tx.clone();
        let destroy_factory = DestroyReplicaTaskFactory::new(
            Arc::new(move |action| {
                destroy_actions.send(action).unwrap_or_default();
            }),
            options.destroying_storage.clone(),
            Duration::from_millis(options.replication.destroy_check_interval_ms),
        );

        let replica = Arc::new(Replica {
            state: state.clone(),
            requests: requests_tx,
            messages: messages_tx,
            actions: actions_tx,
            feedbacks: feedbacks_tx,
            snapshot_status: snapshot_status_tx,
            close_token: close_token.clone(),
            destroy_factory,
        });

        let event_loop = ReplicaEventLoop {
            store_id: options.store_id,
            shard_id,
            replica: options.replica.clone(),
            raw_node,
            engine: options.engine,
            sm,
            snapshotter,
            incoming_proposals: ProposalBatch::new(
                options.raft.max_entry_bytes as usize,
                shard_id,
                options.replica,
            ),
            pending_proposals: PendingProposals::new(),
            pending_reads: ReadIndexQueue::new(),
            requests_rx,
            messages_rx,
            actions_rx,
            feedbacks_rx,
            snapshot_status_rx,
            transport: options.transport,
            host,
            state,
            replication: options.replication,
            max_entry_bytes: options.raft.max_entry_bytes,
            tick_interval: options.tick_interval,
            close_token,
            destroying: None,
        };
        tokio::spawn(event_loop.run());
        Ok(replica)
    }

    #[inline]
    pub fn state(&self) -> &Arc<ReplicaStatus> {
        &self.state
    }

    #[inline]
    pub fn shard_id(&self) -> u64 {
        self.state.shard_id
    }

    #[inline]
    pub fn replica_id(&self) -> u64 {
        self.state.replica_id
    }

    #[inline]
    pub fn group(&self) -> u64 {
        self.state.group
    }

    #[inline]
    pub fn shard(&self) -> Shard {
        self.state.shard()
    }

    #[inline]
    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    /// Admit a client request to this replica's proposal pipeline.
    pub fn on_request(&self, req: Request, cb: ResponseCb) -> Result<()> {
        if self.state.is_closed() {
            return Err(Error::ShardNotFound(self.state.shard_id));
        }
        self.requests
            .try_send(ReqCtx::new(req, cb))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => Error::ServiceIsBusy("request queue full"),
                mpsc::error::TrySendError::Closed(_) => Error::ShardNotFound(self.state.shard_id),
            })
    }

    /// Feed an inbound raft message envelope.
    pub fn on_raft_message(&self, msg: RaftMessage) {
        self.messages.send(msg).unwrap_or_default();
    }

    pub fn add_action(&self, action: Action) {
        self.actions.send(action).unwrap_or_default();
    }

    /// A peer replica looked unreachable to the transport.
    pub fn add_feedback(&self, to_replica: u64) {
        self.feedbacks.send(to_replica).unwrap_or_default();
    }

    pub fn add_snapshot_status(&self, status: SnapshotStatusSignal) {
        self.snapshot_status.send(status).unwrap_or_default();
    }

    /// Start (or re-enter after restart) the two-phase destroy task. Only
    /// the first caller wins; later reasons are ignored.
    pub fn start_destroy_replica_task(&self, target_index: u64, remove_data: bool, reason: &str) {
        {
            let mut task = self.state.destroy_task.lock().unwrap();
            if task.is_some() {
                debug!(
                    shard = self.state.shard_id,
                    reason, "destroy replica task already exists",
                );
                return;
            }
            *task = Some(reason.to_string());
        }
        let task = self.destroy_factory.new_task(
            self.state.shard_id,
            self.state.replica_id,
            target_index,
            remove_data,
            reason.to_string(),
        );
        tokio::spawn(task.run());
    }

    pub fn destroy_task_reason(&self) -> Option<String> {
        self.state.destroy_task.lock().unwrap().clone()
    }

    /// Ask the event loop to stop; queued requests are answered with
    /// `ShardNotFound`.
    pub fn close(&self) {
        self.close_token.cancel();
    }
}

struct ReplicaEventLoop {
    store_id: u64,
    shard_id: u64,
    replica: tessera_api::metapb::Replica,
    raw_node: RawNode<LogReader>,
    engine: Arc<Engine>,
    sm: StateMachine,
    snapshotter: Snapshotter,
    incoming_proposals: ProposalBatch,
    pending_proposals: PendingProposals,
    pending_reads: ReadIndexQueue,
    requests_rx: mpsc::Receiver<ReqCtx>,
    messages_rx: mpsc::UnboundedReceiver<RaftMessage>,
    actions_rx: mpsc::UnboundedReceiver<Action>,
    feedbacks_rx: mpsc::UnboundedReceiver<u64>,
    snapshot_status_rx: mpsc::UnboundedReceiver<SnapshotStatusSignal>,
    transport: Arc<dyn RaftTransport>,
    host: Arc<dyn ReplicaHost>,
    state: Arc<ReplicaStatus>,
    replication: ReplicationConfig,
    max_entry_bytes: u64,
    tick_interval: Duration,
    close_token: CancellationToken,
    /// Set once the destroy task completes; carries `remove_data`.
    destroying: Option<bool>,
}

impl ReplicaEventLoop {
    async fn run(mut self) {
        debug!(
            shard = self.shard_id,
            replica = self.replica.id,
            "replica event loop started",
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.destroying.is_some() {
                break;
            }

            if !self.raw_node.has_ready() {
                tokio::select! {
                    biased;
                    _ = self.close_token.cancelled() => break,
                    _ = interval.tick() => {
                        self.raw_node.tick();
                        self.tick_maintenance();
                    }
                    req = self.requests_rx.recv() => match req {
                        Some(req) => self.incoming_proposals.push(req),
                        None => break,
                    },
                    Some(msg) = self.messages_rx.recv() => self.handle_raft_message(msg),
                    Some(action) = self.actions_rx.recv() => self.handle_action(action),
                    Some(to) = self.feedbacks_rx.recv() => self.raw_node.report_unreachable(to),
                    Some(status) = self.snapshot_status_rx.recv() => self.handle_snapshot_status(status),
                }
            }

            if let Err(err) = self.handle_event() {
                error!(
                    shard = self.shard_id,
                    replica = self.replica.id,
                    "replica event loop: {err}",
                );
                break;
            }
            tokio::task::yield_now().await;
        }

        self.shutdown().await;
    }

    /// One cooperative round: drain bounded slices of every queue, feed
    /// raft, then process the pending `Ready`.
    fn handle_event(&mut self) -> Result<()> {
        for _ in 0..EVENT_BATCH {
            match self.requests_rx.try_recv() {
                Ok(req) => self.incoming_proposals.push(req),
                Err(_) => break,
            }
        }
        for _ in 0..EVENT_BATCH {
            match self.messages_rx.try_recv() {
                Ok(msg) => self.handle_raft_message(msg),
                Err(_) => break,
            }
        }
        for _ in 0..EVENT_BATCH {
            match self.actions_rx.try_recv() {
                Ok(action) => self.handle_action(action),
                Err(_) => break,
            }
        }
        for _ in 0..EVENT_BATCH {
            match self.feedbacks_rx.try_recv() {
                Ok(to) => self.raw_node.report_unreachable(to),
                Err(_) => break,
            }
        }
        for _ in 0..EVENT_BATCH {
            match self.snapshot_status_rx.try_recv() {
                Ok(status) => self.handle_snapshot_status(status),
                Err(_) => break,
            }
        }

        self.propose_batches();
        self.dispatch_ready()?;
        self.handle_raft_create_snapshot_request()?;
        Ok(())
    }

    fn handle_raft_message(&mut self, msg: RaftMessage) {
        if !msg.snapshot_files.is_empty() {
            self.install_snapshot_files(&msg);
        }
        for payload in &msg.messages {
            let mut message = Message::default();
            if message.merge_from_bytes(payload).is_err() {
                warn!(shard = self.shard_id, "drop undecodable raft message");
                continue;
            }
            if let Err(err) = self.raw_node.step(message) {
                if !matches!(err, raft::Error::StepPeerNotFound) {
                    warn!(shard = self.shard_id, "step raft message: {err}");
                }
            }
        }
    }

    fn install_snapshot_files(&mut self, msg: &RaftMessage) {
        for payload in &msg.messages {
            let mut message = Message::default();
            if message.merge_from_bytes(payload).is_err() {
                continue;
            }
            if message.get_msg_type() == MessageType::MsgSnapshot {
                if let Err(err) = self
                    .snapshotter
                    .install_image_files(message.get_snapshot(), &msg.snapshot_files)
                {
                    warn!(shard = self.shard_id, "install snapshot files: {err}");
                }
            }
        }
    }

    fn handle_snapshot_status(&mut self, status: SnapshotStatusSignal) {
        let result = if status.rejected {
            SnapshotStatus::Failure
        } else {
            SnapshotStatus::Finish
        };
        self.raw_node.report_snapshot(status.to_replica, result);
    }

    fn handle_action(&mut self, action: Action) {
        match action {
            Action::CheckLogCommitted { target_index, tx } => {
                if !self.is_leader() {
                    return;
                }
                let status = self.raw_node.status();
                let all_reached = status
                    .progress
                    .map(|tracker| tracker.iter().all(|(_, p)| p.matched >= target_index))
                    .unwrap_or_default();
                if all_reached {
                    let replicas = self.sm.shard().replicas.iter().map(|r| r.id).collect();
                    tx.send(replicas).unwrap_or_default();
                }
            }
            Action::CheckLogApplied { target_index, tx } => {
                if self.sm.applied_index() >= target_index {
                    tx.send(()).unwrap_or_default();
                }
            }
            Action::SnapshotCompaction {
                index,
                extra,
                persistent_log_index,
            } => {
                let including = (persistent_log_index >= index).then_some(extra);
                if let Err(err) = self.snapshotter.recycle(index, including) {
                    warn!(shard = self.shard_id, "snapshot compaction: {err}");
                }
            }
            Action::Split {
                epoch,
                split_keys,
                split_ids,
            } => self.propose_batch_split(epoch, split_keys, split_ids),
            Action::ProposeCompactLog { index } => self.propose_compact_log(index),
            Action::CompleteDestroy { remove_data } => {
                self.destroying = Some(remove_data);
            }
        }
    }

    #[inline]
    fn is_leader(&self) -> bool {
        self.raw_node.raft.state == StateRole::Leader
    }

    fn leader_replica(&self) -> Option<tessera_api::metapb::Replica> {
        let leader_id = self.raw_node.raft.leader_id;
        if leader_id == 0 {
            return None;
        }
        self.sm.shard().replica(leader_id)
    }

    /// Pop merged batches and hand them to raft by type.
    fn propose_batches(&mut self) {
        while let Some(batch) = self.incoming_proposals.pop() {
            match batch.request_type() {
                RequestType::ReadIndex => self.submit_read_index(batch),
                RequestType::ProposalNormal => self.propose_normal(batch),
                RequestType::ProposalConfigChange => self.propose_config_change(batch),
                RequestType::RequestTransferLeader => self.handle_transfer_leader(batch),
            }
        }
    }

    fn submit_read_index(&mut self, batch: Batch) {
        if !self.is_leader() {
            batch.respond_error(errorpb::Error::not_leader(
                self.shard_id,
                self.leader_replica(),
            ));
            return;
        }
        let ctx = self.pending_reads.append(batch);
        self.raw_node.read_index(ctx);
    }

    fn propose_normal(&mut self, batch: Batch) {
        if !self.is_leader() {
            batch.respond_error(errorpb::Error::not_leader(
                self.shard_id,
                self.leader_replica(),
            ));
            return;
        }

        let data = batch.request_batch.encode_to_vec();
        if data.len() as u64 > self.max_entry_bytes {
            batch.respond_error(errorpb::Error::raft_entry_too_large(
                self.shard_id,
                data.len() as u64,
            ));
            return;
        }

        match self.raw_node.propose(vec![], data) {
            Ok(()) => self.pending_proposals.append(batch),
            Err(raft::Error::ProposalDropped) => {
                batch.respond_error(errorpb::Error::server_is_busy("proposal dropped"));
            }
            Err(err) => batch.respond_error(errorpb::Error::message(err.to_string())),
        }
    }

    fn propose_config_change(&mut self, batch: Batch) {
        if !self.is_leader() {
            batch.respond_error(errorpb::Error::not_leader(
                self.shard_id,
                self.leader_replica(),
            ));
            return;
        }
        if self.pending_proposals.has_config_change() {
            batch.respond_error(errorpb::Error::server_is_busy(
                "another config change is in progress",
            ));
            return;
        }

        let req = &batch.request_batch.requests[0];
        let cc_req = match ConfigChangeRequest::decode(req.cmd.as_slice()) {
            Ok(cc) => cc,
            Err(err) => {
                batch.respond_error(errorpb::Error::message(err.to_string()));
                return;
            }
        };
        let reqs = vec![cc_req];
        let context = batch.request_batch.encode_to_vec();
        let encoding = ConfChangeEncoding::build(&reqs, context);
        if let Err(err) = check_conf_change(
            &self.raw_node,
            self.replica.id,
            self.sm.shard(),
            &reqs,
            &encoding,
        ) {
            batch.respond_error(err.into());
            return;
        }

        let result = match encoding {
            ConfChangeEncoding::V1(cc) => self.raw_node.propose_conf_change(vec![], cc),
            ConfChangeEncoding::V2(cc) => self.raw_node.propose_conf_change(vec![], cc),
        };
        match result {
            Ok(()) => self.pending_proposals.set_config_change(batch),
            Err(raft::Error::ProposalDropped) => {
                batch.respond_error(errorpb::Error::server_is_busy("proposal dropped"));
            }
            Err(err) => batch.respond_error(errorpb::Error::message(err.to_string())),
        }
    }

    /// Leader transfers execute locally and answer immediately; raft takes
    /// care of the rest.
    fn handle_transfer_leader(&mut self, batch: Batch) {
        if !self.is_leader() {
            batch.respond_error(errorpb::Error::not_leader(
                self.shard_id,
                self.leader_replica(),
            ));
            return;
        }
        if !apply::check_epoch(self.sm.shard(), &batch.request_batch) {
            let hint = self.host.next_shard(self.sm.shard()).into_iter().collect();
            batch.respond_error(errorpb::Error::stale_epoch(hint));
            return;
        }

        let req = &batch.request_batch.requests[0];
        let transferee = match TransferLeaderRequest::decode(req.cmd.as_slice()) {
            Ok(tl) => tl.replica.unwrap_or_default(),
            Err(err) => {
                batch.respond_error(errorpb::Error::message(err.to_string()));
                return;
            }
        };
        info!(
            shard = self.shard_id,
            transferee = transferee.id,
            "transfer leadership",
        );
        self.raw_node.transfer_leader(transferee.id);

        let resp = tessera_api::rpcpb::Response {
            id: req.id.clone(),
            cmd_type: req.cmd_type,
            custom_type: req.custom_type,
            pid: req.pid,
            value: TransferLeaderResponse::default().encode_to_vec(),
            ..Default::default()
        };
        batch.respond(tessera_api::rpcpb::ResponseBatch::with_responses(
            batch.request_id().to_vec(),
            vec![resp],
        ));
    }

    fn propose_batch_split(&mut self, epoch: Epoch, split_keys: Vec<Vec<u8>>, split_ids: Vec<SplitId>) {
        if !self.is_leader() {
            return;
        }
        let shard = self.sm.shard().clone();
        if shard.epoch() != epoch {
            debug!(shard = self.shard_id, "skip a split hint with a stale epoch");
            return;
        }
        if split_keys.is_empty() || split_ids.len() != split_keys.len() + 1 {
            warn!(shard = self.shard_id, "skip a malformed split hint");
            return;
        }

        let mut requests = Vec::with_capacity(split_ids.len());
        let mut start = shard.start.clone();
        for (i, id) in split_ids.iter().enumerate() {
            let end = if i < split_keys.len() {
                split_keys[i].clone()
            } else {
                shard.end.clone()
            };
            requests.push(SplitRequest {
                start: std::mem::take(&mut start),
                end: end.clone(),
                new_shard_id: id.new_shard_id,
                new_replica_ids: id.new_replica_ids.clone(),
            });
            start = end;
        }
        let split = BatchSplitRequest {
            requests,
            context: vec![],
        };

        self.propose_internal_admin(
            tessera_api::rpcpb::AdminCmdType::AdminBatchSplit,
            split.encode_to_vec(),
            epoch,
        );
    }

    fn propose_compact_log(&mut self, index: u64) {
        let compact = tessera_api::rpcpb::CompactLogRequest {
            compact_index: index,
        };
        let epoch = self.sm.shard().epoch();
        self.propose_internal_admin(
            tessera_api::rpcpb::AdminCmdType::AdminCompactLog,
            compact.encode_to_vec(),
            epoch,
        );
    }

    /// Build and enqueue an internally generated admin request.
    fn propose_internal_admin(
        &mut self,
        ct: tessera_api::rpcpb::AdminCmdType,
        cmd: Vec<u8>,
        epoch: Epoch,
    ) {
        let shard_id = self.shard_id;
        let req = Request {
            id: uuid::Uuid::new_v4().as_bytes().to_vec(),
            group: self.sm.shard().group,
            cmd_type: tessera_api::rpcpb::CmdType::Admin as i32,
            custom_type: ct as u64,
            cmd,
            epoch: Some(epoch),
            to_shard: shard_id,
            ..Default::default()
        };
        let cb: ResponseCb = Arc::new(move |resp| {
            if let Some(err) = resp.header_error() {
                debug!(shard = shard_id, "internal admin rejected: {}", err.message);
            }
        });
        self.incoming_proposals.push(ReqCtx::new(req, cb));
    }

    /// Process raft's `Ready`: leadership observations, message shipping,
    /// snapshot installation, committed-entry application and persistence.
    fn dispatch_ready(&mut self) -> Result<()> {
        // Reads released by a previous round's apply.
        self.release_pending_reads();

        if !self.raw_node.has_ready() {
            return Ok(());
        }
        let mut ready = self.raw_node.ready();

        if let Some(ss) = ready.ss() {
            self.observe_leadership(ss.leader_id, ss.raft_state);
        }

        if !ready.messages().is_empty() {
            let msgs = ready.take_messages();
            self.send_raft_messages(msgs);
        }

        let mut write_task = WriteTask {
            hard_state: ready.hs().cloned(),
            entries: ready.take_entries(),
            snapshot: None,
            must_sync: ready.must_sync(),
        };
        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            self.apply_snapshot(&snapshot)?;
            write_task.snapshot = Some(snapshot);
        }

        self.pending_reads.ready(ready.take_read_states());

        if !ready.committed_entries().is_empty() {
            let entries = ready.take_committed_entries();
            self.apply_entries(entries)?;
        }

        if !write_task.is_empty() {
            let mut batch = LogBatch::default();
            self.raw_node
                .raft
                .mut_store()
                .write(&mut batch, &write_task)
                .expect("write log batch");
            self.engine.write(&mut batch, write_task.must_sync)?;
        }

        if !ready.persisted_messages().is_empty() {
            let msgs = ready.take_persisted_messages();
            self.send_raft_messages(msgs);
        }

        let mut light_ready = self.raw_node.advance(ready);
        if !light_ready.messages().is_empty() {
            let msgs = light_ready.take_messages();
            self.send_raft_messages(msgs);
        }
        if !light_ready.committed_entries().is_empty() {
            let entries = light_ready.take_committed_entries();
            self.apply_entries(entries)?;
        }
        self.raw_node.advance_apply();

        self.release_pending_reads();
        Ok(())
    }

    fn observe_leadership(&mut self, leader_id: u64, role: StateRole) {
        let was_leader = self.state.is_leader.load(Ordering::Acquire);
        let is_leader = role == StateRole::Leader;
        self.state
            .leader_replica_id
            .store(leader_id, Ordering::Release);
        self.state.is_leader.store(is_leader, Ordering::Release);
        self.state
            .term
            .store(self.raw_node.raft.term, Ordering::Release);

        if was_leader && !is_leader {
            info!(
                shard = self.shard_id,
                replica = self.replica.id,
                new_leader = leader_id,
                "leadership lost",
            );
            // In-flight proposals will be decided by the new leader; answer
            // them stale so clients re-route.
            self.pending_proposals.clear();
            let leader = self.leader_replica();
            let shard_id = self.shard_id;
            self.pending_reads.close(|batch| {
                batch.respond_error(errorpb::Error::not_leader(shard_id, leader.clone()));
            });
            self.host
                .on_leadership_changed(self.sm.shard(), false);
        } else if !was_leader && is_leader {
            info!(
                shard = self.shard_id,
                replica = self.replica.id,
                term = self.raw_node.raft.term,
                "leadership acquired",
            );
            self.host.on_leadership_changed(self.sm.shard(), true);
        }
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<()> {
        for entry in entries {
            let index = entry.index;
            let term = entry.term;
            match entry.get_entry_type() {
                EntryType::EntryNormal => self.apply_normal_entry(entry)?,
                EntryType::EntryConfChange | EntryType::EntryConfChangeV2 => {
                    self.apply_conf_change_entry(entry)?
                }
            }
            self.sm.set_applied_state(index, term);
        }

        self.sm.flush_applied_index()?;
        self.state
            .applied_index
            .store(self.sm.applied_index(), Ordering::Release);
        Ok(())
    }

    fn apply_normal_entry(&mut self, entry: Entry) -> Result<()> {
        if entry.get_data().is_empty() {
            return Ok(());
        }
        let batch = RequestBatch::decode(entry.get_data())?;
        let ctx = ApplyContext {
            is_leader: self.is_leader(),
            leader_replica: self.leader_replica(),
        };
        let (resp, effect) = self.sm.apply(&batch, entry.index, entry.term, &ctx);
        self.handle_admin_effect(effect)?;
        self.pending_proposals
            .notify(batch.header_id(), resp, false);
        Ok(())
    }

    fn apply_conf_change_entry(&mut self, entry: Entry) -> Result<()> {
        let (cc_v2, context) = match entry.get_entry_type() {
            EntryType::EntryConfChange => {
                let mut cc = ConfChange::default();
                cc.merge_from_bytes(entry.get_data())?;
                let context = cc.get_context().to_vec();
                (cc.into_v2(), context)
            }
            _ => {
                let mut cc = ConfChangeV2::default();
                cc.merge_from_bytes(entry.get_data())?;
                let context = cc.get_context().to_vec();
                (cc, context)
            }
        };

        let batch = RequestBatch::decode(context.as_slice())?;
        let ctx = ApplyContext {
            is_leader: self.is_leader(),
            leader_replica: self.leader_replica(),
        };
        let (resp, effect) = self.sm.apply(&batch, entry.index, entry.term, &ctx);
        if resp.header_error().is_none() {
            match self.raw_node.apply_conf_change(&cc_v2) {
                Ok(conf_state) => {
                    self.raw_node.raft.mut_store().set_conf_state(conf_state)?;
                    self.handle_admin_effect(effect)?;
                }
                Err(err) => {
                    // A conf change raft cannot apply (e.g. leaving a joint
                    // state the group is not in) is dropped, not fatal.
                    warn!(shard = self.shard_id, "apply conf change: {err}");
                }
            }
        }
        self.pending_proposals.notify(batch.header_id(), resp, true);
        Ok(())
    }

    fn handle_admin_effect(&mut self, effect: AdminEffect) -> Result<()> {
        match effect {
            AdminEffect::None => {}
            AdminEffect::ConfChange => {
                let shard = self.sm.shard().clone();
                *self.state.shard.write().unwrap() = shard.clone();
                self.host.update_shard_key_range(shard.clone());

                // Demoted out of the group: the store hands this replica to
                // the destroy flow.
                if shard.replica(self.replica.id).is_none() {
                    info!(
                        shard = self.shard_id,
                        replica = self.replica.id,
                        "replica removed by config change",
                    );
                    self.host
                        .on_replica_removed(self.shard_id, self.sm.applied_index());
                }
            }
            AdminEffect::Split { children } => {
                let shard = self.sm.shard().clone();
                *self.state.shard.write().unwrap() = shard;
                for child in &children {
                    self.host.update_shard_key_range(child.clone());
                }
                self.host.on_shards_split(children);
            }
            AdminEffect::CompactLog { index } => {
                self.raw_node.raft.mut_store().compact_to(index)?;
            }
        }
        Ok(())
    }

    fn release_pending_reads(&mut self) {
        let applied = self.sm.applied_index();
        let sm = &self.sm;
        let pending_reads = &mut self.pending_reads;
        pending_reads.process(applied, |batch| {
            let resp = sm.exec_read_batch(&batch.request_batch);
            batch.respond(resp);
        });
    }

    fn apply_snapshot(&mut self, snapshot: &raft::eraftpb::Snapshot) -> Result<()> {
        let meta = self
            .snapshotter
            .recover(self.sm.data_storage(), snapshot)?;
        let apply_state = meta.apply_state.unwrap_or_default();
        let shard = meta.shard.clone().unwrap_or_default();

        info!(
            shard = self.shard_id,
            replica = self.replica.id,
            index = apply_state.index,
            term = apply_state.term,
            "snapshot applied",
        );

        self.sm.update_shard(shard.clone());
        self.sm.set_applied_state(apply_state.index, apply_state.term);
        self.sm.flush_applied_index()?;
        self.state
            .applied_index
            .store(apply_state.index, Ordering::Release);
        if let Some(replica) = shard.replica_on_store(self.store_id) {
            self.replica = replica;
        }
        *self.state.shard.write().unwrap() = shard.clone();
        self.host.update_shard_key_range(shard);

        let info = snapshot::decode_snapshot_info(snapshot);
        let persistent_log_index = self
            .sm
            .data_storage()
            .persisted_applied_index(self.shard_id)?;
        self.handle_action(Action::SnapshotCompaction {
            index: snapshot.get_metadata().index,
            extra: info.extra,
            persistent_log_index,
        });
        Ok(())
    }

    /// Raft asked the storage for a snapshot it does not hold; build one at
    /// the applied index and register it.
    fn handle_raft_create_snapshot_request(&mut self) -> Result<()> {
        if !self.raw_node.raft.store().take_snapshot_requested() {
            return Ok(());
        }
        let (index, term) = self.sm.applied_state();
        if index == 0 {
            panic!("invalid snapshot index");
        }
        info!(
            shard = self.shard_id,
            replica = self.replica.id,
            index,
            "requested to create snapshot",
        );

        let conf_state = self.raw_node.raft.prs().conf().to_conf_state();
        let shard = self.sm.shard().clone();
        let (snapshot, env) =
            self.snapshotter
                .save(self.sm.data_storage(), &shard, &conf_state, index, term)?;
        self.snapshotter.commit(&env)?;
        match self.raw_node.raft.mut_store().create_snapshot(snapshot) {
            Ok(()) => {
                info!(shard = self.shard_id, index, "snapshot created and registered");
            }
            Err(raft::Error::Store(raft::StorageError::SnapshotOutOfDate)) => {
                // The reader already holds a newer snapshot.
                info!(shard = self.shard_id, index, "snapshot creation aborted");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Leader-only periodic duties: the log compaction check.
    fn tick_maintenance(&mut self) {
        if !self.is_leader() {
            return;
        }
        let min_match = {
            let status = self.raw_node.status();
            match status
                .progress
                .and_then(|tracker| tracker.iter().map(|(_, p)| p.matched).min())
            {
                Some(min_match) => min_match,
                None => return,
            }
        };
        let committed = self.raw_node.raft.raft_log.committed;
        let (first_index, size_hint) = {
            let store = self.raw_node.raft.store();
            (
                raft::Storage::first_index(store).unwrap_or(1),
                store.raft_log_size_hint(),
            )
        };

        if let Some(compact_index) = compact::check_log_compact(
            &self.replication,
            first_index,
            self.sm.applied_index(),
            committed,
            min_match,
            size_hint,
        ) {
            self.handle_action(Action::ProposeCompactLog {
                index: compact_index,
            });
        }
    }

    fn send_raft_messages(&mut self, msgs: Vec<Message>) {
        use std::collections::HashMap;

        let shard = self.sm.shard();
        let mut by_target: HashMap<u64, Vec<Message>> = HashMap::new();
        for msg in msgs {
            by_target.entry(msg.to).or_default().push(msg);
        }

        for (target, msgs) in by_target {
            let Some(to_replica) = shard.replica(target) else {
                warn!(
                    shard = self.shard_id,
                    target, "send message to unknown target",
                );
                continue;
            };

            let mut snapshot_files: Vec<SnapshotFile> = Vec::new();
            let mut payloads = Vec::with_capacity(msgs.len());
            for msg in &msgs {
                if msg.get_msg_type() == MessageType::MsgSnapshot {
                    match self.snapshotter.load_image_files(msg.get_snapshot()) {
                        Ok(files) => snapshot_files = files,
                        Err(err) => {
                            warn!(shard = self.shard_id, "load snapshot image: {err}");
                            continue;
                        }
                    }
                }
                payloads.push(msg.write_to_bytes().expect("encode raft message"));
            }

            self.transport.send_raft_message(RaftMessage {
                shard_id: self.shard_id,
                from_replica: Some(self.replica.clone()),
                to_replica: Some(to_replica),
                messages: payloads,
                is_tombstone: false,
                snapshot_files,
                group: shard.group,
                start: shard.start.clone(),
                end: shard.end.clone(),
                shard_epoch: Some(shard.epoch()),
            });
        }
    }

    async fn shutdown(mut self) {
        self.state.closed.store(true, Ordering::Release);
        self.requests_rx.close();

        // Everything still queued is answered so callers never hang.
        while let Ok(req) = self.requests_rx.try_recv() {
            let batch = tessera_api::rpcpb::ResponseBatch::with_error(
                req.req.id.clone(),
                std::slice::from_ref(&req.req),
                errorpb::Error::shard_not_found(self.shard_id),
            );
            (req.cb)(batch);
        }
        self.incoming_proposals.close(self.store_id);
        self.pending_proposals.close(self.shard_id);
        let shard_id = self.shard_id;
        self.pending_reads.close(|batch| {
            batch.respond_error(errorpb::Error::shard_not_found(shard_id));
        });

        if let Some(remove_data) = self.destroying {
            self.complete_destroy(remove_data).await;
        }

        debug!(
            shard = self.shard_id,
            replica = self.replica.id,
            "replica event loop stopped",
        );
    }

    /// The final step of destruction: tombstone the persisted state, drop
    /// the data (or keep it, per `remove_data`), clean the log and images.
    async fn complete_destroy(&mut self, remove_data: bool) {
        let mut shard = self.sm.shard().clone();
        shard.state = tessera_api::metapb::ShardState::Destroyed as i32;
        let state = ShardLocalState {
            shard: Some(shard.clone()),
            state: ReplicaState::Tombstone as i32,
            remove_data,
        };
        let index = self.sm.applied_index().max(1);
        if let Err(err) = self.sm.data_storage().save_shard_metadata(index, state) {
            error!(shard = self.shard_id, "persist tombstone: {err}");
        }
        if let Err(err) = self.sm.data_storage().remove_shard(&shard, remove_data) {
            error!(shard = self.shard_id, "remove shard data: {err}");
        }
        if let Err(err) = storage::destroy_storage(&self.engine, self.replica.id) {
            error!(shard = self.shard_id, "destroy raft storage: {err}");
        }
        if let Err(err) = self.snapshotter.destroy() {
            error!(shard = self.shard_id, "destroy snapshot images: {err}");
        }
        self.host.on_replica_destroyed(self.shard_id);
        info!(
            shard = self.shard_id,
            replica = self.replica.id,
            remove_data,
            "replica destroyed",
        );
    }
}
