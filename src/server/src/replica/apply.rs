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

//! Committed-entry application: validation against the current shard
//! metadata, command execution on the data storage, and the admin commands
//! that rewrite the shard itself.

use std::sync::Arc;

use prost::Message;
use tessera_api::{
    errorpb,
    metapb::{
        ConfigChangeType, Epoch, Label, Replica, ReplicaRole, ReplicaState, Shard,
        ShardLocalState, ShardState,
    },
    rpcpb::{
        AdminCmdType, BatchSplitRequest, BatchSplitResponse, CmdType, CompactLogRequest,
        ConfigChangeRequest, ConfigChangeResponse, LabelPolicy, Request, RequestBatch, Response,
        ResponseBatch, TxnBatchResponse, UpdateLabelsRequest, UpdateMetadataRequest,
    },
};
use tracing::{info, warn};

use crate::{storage::DataStorage, Result};

/// Supplies the shard likely covering a key range after a split, attached
/// to `StaleEpoch` responses for route repair.
pub type NextShardHint = Arc<dyn Fn(&Shard) -> Option<Shard> + Send + Sync>;

/// What the event loop must do after an admin command applied.
pub enum AdminEffect {
    None,
    /// The membership changed; the new conf state must reach raft and the
    /// log reader.
    ConfChange,
    /// The shard split; the children need local replicas and routing
    /// entries.
    Split { children: Vec<Shard> },
    /// The log below `index` may be dropped.
    CompactLog { index: u64 },
}

pub struct ApplyContext {
    pub is_leader: bool,
    pub leader_replica: Option<Replica>,
}

/// The per-replica state machine: the cached shard descriptor plus the data
/// storage every committed command lands in.
pub struct StateMachine {
    store_id: u64,
    replica_id: u64,
    shard: Shard,
    data_storage: Arc<dyn DataStorage>,
    applied_index: u64,
    applied_term: u64,
    next_shard_hint: NextShardHint,
}

/// Whether `batch` carries an epoch the current shard still accepts.
///
/// Normal commands and batch splits compare generations, config changes
/// compare config versions, leader transfers compare both; every other
/// admin passes. A batch with `ignore_epoch_check` always passes.
pub fn check_epoch(shard: &Shard, batch: &RequestBatch) -> bool {
    let mut check_generation = false;
    let mut check_config_ver = false;

    if batch.is_admin() {
        match batch.admin_cmd_type() {
            AdminCmdType::AdminBatchSplit => check_generation = true,
            AdminCmdType::AdminConfigChange => check_config_ver = true,
            AdminCmdType::AdminTransferLeader => {
                check_generation = true;
                check_config_ver = true;
            }
            _ => {}
        }
    } else {
        // Normal commands do not care about membership changes.
        check_generation = true;
    }

    if !check_generation && !check_config_ver {
        return true;
    }

    let Some(first) = batch.requests.first() else {
        return false;
    };
    if first.ignore_epoch_check {
        return true;
    }

    // Requests inside a batch share one epoch; checking the first suffices.
    let latest = shard.epoch();
    let from = first.epoch();
    let stale = (check_config_ver && from.config_ver < latest.config_ver)
        || (check_generation && from.generation < latest.generation);
    !stale
}

impl StateMachine {
    pub fn new(
        store_id: u64,
        replica_id: u64,
        shard: Shard,
        data_storage: Arc<dyn DataStorage>,
        applied_index: u64,
        applied_term: u64,
        next_shard_hint: NextShardHint,
    ) -> Self {
        StateMachine {
            store_id,
            replica_id,
            shard,
            data_storage,
            applied_index,
            applied_term,
            next_shard_hint,
        }
    }

    #[inline]
    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    #[inline]
    pub fn data_storage(&self) -> &Arc<dyn DataStorage> {
        &self.data_storage
    }

    #[inline]
    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    #[inline]
    pub fn applied_state(&self) -> (u64, u64) {
        (self.applied_index, self.applied_term)
    }

    pub fn set_applied_state(&mut self, index: u64, term: u64) {
        self.applied_index = index;
        self.applied_term = term;
    }

    /// Replace the cached shard; used by snapshot application and restarts.
    pub fn update_shard(&mut self, shard: Shard) {
        self.shard = shard;
    }

    /// Persist the applied index; called once per apply round.
    pub fn flush_applied_index(&self) -> Result<()> {
        self.data_storage
            .set_applied_index(self.shard.id, self.applied_index)
    }

    fn validate(&self, batch: &RequestBatch, ctx: &ApplyContext) -> Option<errorpb::Error> {
        let header = batch.header.as_ref()?;
        let replica = header.replica.clone().unwrap_or_default();
        if replica.store_id != self.store_id {
            // The proposal was stamped for another store; metadata and
            // persisted state disagree.
            panic!(
                "BUG: store id not match, give {} want {}",
                replica.store_id, self.store_id
            );
        }

        if !ctx.is_leader {
            return Some(errorpb::Error::not_leader(
                self.shard.id,
                ctx.leader_replica.clone(),
            ));
        }

        if replica.id != self.replica_id {
            return Some(errorpb::Error::message(format!(
                "mismatch replica id, want {}, but {}",
                self.replica_id, replica.id
            )));
        }

        if !check_epoch(&self.shard, batch) {
            // Attach the likely successor shard so clients can repair their
            // routes after a split; a wrong hint only costs one more retry.
            let new_shards = (self.next_shard_hint)(&self.shard).into_iter().collect();
            return Some(errorpb::Error::stale_epoch(new_shards));
        }

        None
    }

    /// Apply one committed request batch and produce its response batch
    /// plus the admin side effect for the event loop.
    pub fn apply(
        &mut self,
        batch: &RequestBatch,
        entry_index: u64,
        entry_term: u64,
        ctx: &ApplyContext,
    ) -> (ResponseBatch, AdminEffect) {
        self.applied_index = entry_index;
        self.applied_term = entry_term;

        if let Some(err) = self.validate(batch, ctx) {
            return (
                ResponseBatch::with_error(batch.header_id().to_vec(), &batch.requests, err),
                AdminEffect::None,
            );
        }

        if batch.is_admin() {
            return self.apply_admin(batch, entry_index);
        }

        let mut responses = Vec::with_capacity(batch.requests.len());
        for req in &batch.requests {
            responses.push(self.apply_request(req, entry_index));
        }
        (
            ResponseBatch::with_responses(batch.header_id().to_vec(), responses),
            AdminEffect::None,
        )
    }

    fn apply_request(&mut self, req: &Request, entry_index: u64) -> Response {
        let mut resp = Response {
            id: req.id.clone(),
            cmd_type: req.cmd_type,
            custom_type: req.custom_type,
            pid: req.pid,
            ..Default::default()
        };
        let result = match req.request_type() {
            CmdType::Txn => {
                let payload = req
                    .txn_batch_request
                    .as_ref()
                    .map(|t| t.payload.as_slice())
                    .unwrap_or_default();
                self.data_storage
                    .exec_txn(&self.shard, payload)
                    .map(|payload| {
                        resp.txn_batch_response = Some(TxnBatchResponse { payload });
                        Vec::new()
                    })
            }
            _ => self
                .data_storage
                .exec_write(&self.shard, entry_index, req.custom_type, &req.cmd),
        };
        match result {
            Ok(value) => resp.value = value,
            Err(err) => resp.error = Some(err.into()),
        }
        resp
    }

    /// Execute a released read batch against the data storage. The epoch is
    /// re-checked: the shard may have split between admission and release.
    pub fn exec_read_batch(&self, batch: &RequestBatch) -> ResponseBatch {
        if !check_epoch(&self.shard, batch) {
            let new_shards = (self.next_shard_hint)(&self.shard).into_iter().collect();
            return ResponseBatch::with_error(
                batch.header_id().to_vec(),
                &batch.requests,
                errorpb::Error::stale_epoch(new_shards),
            );
        }

        let mut responses = Vec::with_capacity(batch.requests.len());
        for req in &batch.requests {
            let mut resp = Response {
                id: req.id.clone(),
                cmd_type: req.cmd_type,
                custom_type: req.custom_type,
                pid: req.pid,
                ..Default::default()
            };
            match self
                .data_storage
                .exec_read(&self.shard, req.custom_type, &req.cmd)
            {
                Ok(value) => resp.value = value,
                Err(err) => resp.error = Some(err.into()),
            }
            responses.push(resp);
        }
        ResponseBatch::with_responses(batch.header_id().to_vec(), responses)
    }

    fn apply_admin(&mut self, batch: &RequestBatch, entry_index: u64) -> (ResponseBatch, AdminEffect) {
        let req = &batch.requests[0];
        let id = batch.header_id().to_vec();
        let result = match batch.admin_cmd_type() {
            AdminCmdType::AdminConfigChange => self.apply_config_change(req, entry_index),
            AdminCmdType::AdminBatchSplit => self.apply_batch_split(req, entry_index),
            AdminCmdType::AdminCompactLog => self.apply_compact_log(req),
            AdminCmdType::AdminUpdateMetadata => self.apply_update_metadata(req, entry_index),
            AdminCmdType::AdminUpdateLabels => self.apply_update_labels(req, entry_index),
            _ => Err(crate::Error::InvalidArgument(format!(
                "admin command {:?} cannot be applied",
                batch.admin_cmd_type()
            ))),
        };

        match result {
            Ok((value, effect)) => {
                let resp = Response {
                    id: req.id.clone(),
                    cmd_type: req.cmd_type,
                    custom_type: req.custom_type,
                    pid: req.pid,
                    value,
                    ..Default::default()
                };
                (ResponseBatch::with_responses(id, vec![resp]), effect)
            }
            Err(err) => (
                ResponseBatch::with_error(id, &batch.requests, err.into()),
                AdminEffect::None,
            ),
        }
    }

    fn apply_config_change(
        &mut self,
        req: &Request,
        entry_index: u64,
    ) -> Result<(Vec<u8>, AdminEffect)> {
        let cc = ConfigChangeRequest::decode(req.cmd.as_slice())?;
        let target = cc.replica.clone().unwrap_or_default();

        let mut shard = self.shard.clone();
        match cc.change_type() {
            ConfigChangeType::AddNode => {
                match shard.replicas.iter_mut().find(|r| r.id == target.id) {
                    Some(existing) => existing.role = ReplicaRole::Voter as i32,
                    None => shard.replicas.push(Replica {
                        role: ReplicaRole::Voter as i32,
                        ..target.clone()
                    }),
                }
            }
            ConfigChangeType::AddLearnerNode => {
                match shard.replicas.iter_mut().find(|r| r.id == target.id) {
                    Some(existing) => existing.role = ReplicaRole::Learner as i32,
                    None => shard.replicas.push(Replica {
                        role: ReplicaRole::Learner as i32,
                        ..target.clone()
                    }),
                }
            }
            ConfigChangeType::RemoveNode => {
                shard.replicas.retain(|r| r.id != target.id);
            }
        }
        let mut epoch = shard.epoch();
        epoch.config_ver += 1;
        shard.epoch = Some(epoch);

        info!(
            shard = shard.id,
            replica = self.replica_id,
            change = ?cc.change_type(),
            target = target.id,
            config_ver = epoch.config_ver,
            "membership changed",
        );

        self.persist_shard(shard.clone(), entry_index)?;
        self.shard = shard.clone();

        let resp = ConfigChangeResponse { shard: Some(shard) };
        Ok((resp.encode_to_vec(), AdminEffect::ConfChange))
    }

    fn apply_batch_split(
        &mut self,
        req: &Request,
        entry_index: u64,
    ) -> Result<(Vec<u8>, AdminEffect)> {
        let split = BatchSplitRequest::decode(req.cmd.as_slice())?;
        if split.requests.len() < 2 {
            return Err(crate::Error::InvalidArgument(
                "batch split needs at least two children".into(),
            ));
        }

        // The children must partition the parent range exactly.
        let first = &split.requests[0];
        let last = &split.requests[split.requests.len() - 1];
        if first.start != self.shard.start || last.end != self.shard.end {
            return Err(crate::Error::InvalidArgument(
                "split children do not cover the parent range".into(),
            ));
        }
        for pair in split.requests.windows(2) {
            if pair[0].end != pair[1].start || pair[0].end.is_empty() {
                return Err(crate::Error::InvalidArgument(
                    "split children are not contiguous".into(),
                ));
            }
        }

        let parent_epoch = self.shard.epoch();
        let mut children = Vec::with_capacity(split.requests.len());
        for child_req in &split.requests {
            if child_req.new_replica_ids.len() != self.shard.replicas.len() {
                return Err(crate::Error::InvalidArgument(
                    "split child replica count mismatch".into(),
                ));
            }
            let replicas = self
                .shard
                .replicas
                .iter()
                .zip(child_req.new_replica_ids.iter())
                .map(|(r, id)| Replica {
                    id: *id,
                    store_id: r.store_id,
                    role: r.role,
                })
                .collect();
            children.push(Shard {
                id: child_req.new_shard_id,
                group: self.shard.group,
                start: child_req.start.clone(),
                end: child_req.end.clone(),
                epoch: Some(Epoch {
                    generation: parent_epoch.generation + 1,
                    config_ver: parent_epoch.config_ver,
                }),
                replicas,
                state: ShardState::Running as i32,
                labels: self.shard.labels.clone(),
            });
        }

        for child in &children {
            self.data_storage.save_shard_metadata(
                entry_index,
                ShardLocalState {
                    shard: Some(child.clone()),
                    state: ReplicaState::Normal as i32,
                    remove_data: false,
                },
            )?;
        }

        // The parent stops owning its range; placement destroys it once the
        // children are settled.
        let mut parent = self.shard.clone();
        parent.state = ShardState::Destroying as i32;
        self.persist_shard(parent.clone(), entry_index)?;
        self.shard = parent;

        info!(
            shard = self.shard.id,
            children = ?children.iter().map(|s| s.id).collect::<Vec<_>>(),
            "shard split applied",
        );

        let resp = BatchSplitResponse {
            shards: children.clone(),
        };
        Ok((resp.encode_to_vec(), AdminEffect::Split { children }))
    }

    fn apply_compact_log(&mut self, req: &Request) -> Result<(Vec<u8>, AdminEffect)> {
        let compact = CompactLogRequest::decode(req.cmd.as_slice())?;
        Ok((
            tessera_api::rpcpb::CompactLogResponse::default().encode_to_vec(),
            AdminEffect::CompactLog {
                index: compact.compact_index,
            },
        ))
    }

    fn apply_update_metadata(
        &mut self,
        req: &Request,
        entry_index: u64,
    ) -> Result<(Vec<u8>, AdminEffect)> {
        let update = UpdateMetadataRequest::decode(req.cmd.as_slice())?;
        let Some(state) = update.metadata else {
            return Err(crate::Error::InvalidArgument("metadata is required".into()));
        };
        let Some(shard) = state.shard.clone() else {
            return Err(crate::Error::InvalidArgument("shard is required".into()));
        };
        if shard.epoch().generation < self.shard.epoch().generation {
            warn!(
                shard = self.shard.id,
                "skip updating metadata with a regressed generation",
            );
            return Err(crate::Error::InvalidArgument(
                "metadata generation regressed".into(),
            ));
        }
        self.data_storage.save_shard_metadata(entry_index, state)?;
        self.shard = shard;
        Ok((
            tessera_api::rpcpb::UpdateMetadataResponse::default().encode_to_vec(),
            AdminEffect::None,
        ))
    }

    fn apply_update_labels(
        &mut self,
        req: &Request,
        entry_index: u64,
    ) -> Result<(Vec<u8>, AdminEffect)> {
        let update = UpdateLabelsRequest::decode(req.cmd.as_slice())?;
        let mut shard = self.shard.clone();
        match LabelPolicy::from_i32(update.policy).unwrap_or(LabelPolicy::Add) {
            LabelPolicy::Add => {
                for label in update.labels {
                    match shard.labels.iter_mut().find(|l| l.key == label.key) {
                        Some(existing) => existing.value = label.value,
                        None => shard.labels.push(Label {
                            key: label.key,
                            value: label.value,
                        }),
                    }
                }
            }
            LabelPolicy::Replace => shard.labels = update.labels,
        }
        self.persist_shard(shard.clone(), entry_index)?;
        self.shard = shard;
        Ok((
            tessera_api::rpcpb::UpdateLabelsResponse::default().encode_to_vec(),
            AdminEffect::None,
        ))
    }

    fn persist_shard(&self, shard: Shard, log_index: u64) -> Result<()> {
        self.data_storage.save_shard_metadata(
            log_index,
            ShardLocalState {
                shard: Some(shard),
                state: ReplicaState::Normal as i32,
                remove_data: false,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use tessera_api::rpcpb::RequestBatchHeader;

    use super::*;
    use crate::storage::{MemDataStorage, SetRequest, CMD_SET};

    fn shard(generation: u64, config_ver: u64) -> Shard {
        Shard {
            id: 1,
            epoch: Some(Epoch {
                generation,
                config_ver,
            }),
            replicas: vec![Replica::new(1, 1, ReplicaRole::Voter)],
            ..Default::default()
        }
    }

    fn admin_batch(ct: AdminCmdType, epoch: Epoch, cmd: Vec<u8>) -> RequestBatch {
        RequestBatch {
            header: Some(RequestBatchHeader {
                id: b"batch".to_vec(),
                shard_id: 1,
                replica: Some(Replica::new(1, 1, ReplicaRole::Voter)),
            }),
            requests: vec![Request {
                cmd_type: CmdType::Admin as i32,
                custom_type: ct as u64,
                epoch: Some(epoch),
                cmd,
                ..Default::default()
            }],
        }
    }

    fn write_batch(epoch: Epoch) -> RequestBatch {
        RequestBatch {
            header: Some(RequestBatchHeader {
                id: b"batch".to_vec(),
                shard_id: 1,
                replica: Some(Replica::new(1, 1, ReplicaRole::Voter)),
            }),
            requests: vec![Request {
                cmd_type: CmdType::Write as i32,
                custom_type: CMD_SET,
                epoch: Some(epoch),
                cmd: SetRequest {
                    key: b"k".to_vec(),
                    value: b"v".to_vec(),
                }
                .encode_to_vec(),
                ..Default::default()
            }],
        }
    }

    fn epoch(generation: u64, config_ver: u64) -> Epoch {
        Epoch {
            generation,
            config_ver,
        }
    }

    fn state_machine(shard: Shard) -> StateMachine {
        StateMachine::new(
            1,
            1,
            shard,
            Arc::new(MemDataStorage::new()),
            0,
            0,
            Arc::new(|_| None),
        )
    }

    fn leader_ctx() -> ApplyContext {
        ApplyContext {
            is_leader: true,
            leader_replica: Some(Replica::new(1, 1, ReplicaRole::Voter)),
        }
    }

    #[test]
    fn epoch_check_matrix() {
        let s = shard(5, 7);

        // Normal commands compare generations only.
        assert!(check_epoch(&s, &write_batch(epoch(5, 0))));
        assert!(!check_epoch(&s, &write_batch(epoch(4, 7))));

        // Batch split: generation only.
        let split = |e| admin_batch(AdminCmdType::AdminBatchSplit, e, vec![]);
        assert!(check_epoch(&s, &split(epoch(5, 0))));
        assert!(!check_epoch(&s, &split(epoch(4, 9))));

        // Config change: config version only.
        let cc = |e| admin_batch(AdminCmdType::AdminConfigChange, e, vec![]);
        assert!(check_epoch(&s, &cc(epoch(0, 7))));
        assert!(!check_epoch(&s, &cc(epoch(5, 6))));

        // Transfer leader: both.
        let tl = |e| admin_batch(AdminCmdType::AdminTransferLeader, e, vec![]);
        assert!(check_epoch(&s, &tl(epoch(5, 7))));
        assert!(!check_epoch(&s, &tl(epoch(4, 7))));
        assert!(!check_epoch(&s, &tl(epoch(5, 6))));

        // Other admins always pass.
        let compact = |e| admin_batch(AdminCmdType::AdminCompactLog, e, vec![]);
        assert!(check_epoch(&s, &compact(epoch(0, 0))));
    }

    #[test]
    fn ignore_epoch_check_bypasses_staleness() {
        let s = shard(5, 7);
        let mut batch = write_batch(epoch(1, 1));
        batch.requests[0].ignore_epoch_check = true;
        assert!(check_epoch(&s, &batch));
    }

    #[test]
    fn stale_write_gets_stale_epoch_with_hint() {
        let hint_shard = shard(6, 7);
        let hint = hint_shard.clone();
        let mut sm = StateMachine::new(
            1,
            1,
            shard(5, 7),
            Arc::new(MemDataStorage::new()),
            0,
            0,
            Arc::new(move |_| Some(hint.clone())),
        );

        let (resp, _) = sm.apply(&write_batch(epoch(4, 7)), 1, 1, &leader_ctx());
        let err = resp.responses[0].error.as_ref().unwrap();
        let stale = err.stale_epoch.as_ref().unwrap();
        assert_eq!(stale.new_shards.len(), 1);
        assert_eq!(stale.new_shards[0].epoch().generation, 6);
    }

    #[test]
    fn non_leader_apply_answers_not_leader() {
        let mut sm = state_machine(shard(1, 1));
        let ctx = ApplyContext {
            is_leader: false,
            leader_replica: Some(Replica::new(9, 2, ReplicaRole::Voter)),
        };
        let (resp, _) = sm.apply(&write_batch(epoch(1, 1)), 1, 1, &ctx);
        let err = resp.responses[0].error.as_ref().unwrap();
        assert_eq!(err.not_leader.as_ref().unwrap().leader.as_ref().unwrap().id, 9);
    }

    #[test]
    fn mismatched_replica_id_is_an_error() {
        let mut sm = StateMachine::new(
            1,
            7,
            shard(1, 1),
            Arc::new(MemDataStorage::new()),
            0,
            0,
            Arc::new(|_| None),
        );
        let (resp, _) = sm.apply(&write_batch(epoch(1, 1)), 1, 1, &leader_ctx());
        let err = resp.responses[0].error.as_ref().unwrap();
        assert!(err.message.contains("mismatch replica id"));
    }

    #[test]
    #[should_panic(expected = "store id not match")]
    fn mismatched_store_id_is_fatal() {
        let mut sm = StateMachine::new(
            2,
            1,
            shard(1, 1),
            Arc::new(MemDataStorage::new()),
            0,
            0,
            Arc::new(|_| None),
        );
        sm.apply(&write_batch(epoch(1, 1)), 1, 1, &leader_ctx());
    }

    #[test]
    fn write_apply_reaches_the_data_storage() {
        let mut sm = state_machine(shard(1, 1));
        let (resp, _) = sm.apply(&write_batch(epoch(1, 1)), 3, 1, &leader_ctx());
        assert!(resp.responses[0].error.is_none());
        assert_eq!(sm.applied_index(), 3);

        let read = RequestBatch {
            header: Some(RequestBatchHeader {
                id: b"read".to_vec(),
                shard_id: 1,
                replica: Some(Replica::new(1, 1, ReplicaRole::Voter)),
            }),
            requests: vec![Request {
                cmd_type: CmdType::Read as i32,
                custom_type: crate::storage::CMD_GET,
                epoch: Some(epoch(1, 1)),
                cmd: crate::storage::GetRequest { key: b"k".to_vec() }.encode_to_vec(),
                ..Default::default()
            }],
        };
        let resp = sm.exec_read_batch(&read);
        assert_eq!(resp.responses[0].value, b"v");
    }

    #[test]
    fn config_change_bumps_config_ver() {
        let mut sm = state_machine(shard(1, 1));
        let cc = ConfigChangeRequest {
            change_type: ConfigChangeType::AddNode as i32,
            replica: Some(Replica::new(2, 2, ReplicaRole::Voter)),
        };
        let batch = admin_batch(
            AdminCmdType::AdminConfigChange,
            epoch(1, 1),
            cc.encode_to_vec(),
        );

        let (resp, effect) = sm.apply(&batch, 5, 1, &leader_ctx());
        assert!(resp.responses[0].error.is_none());
        assert!(matches!(effect, AdminEffect::ConfChange));
        assert_eq!(sm.shard().epoch().config_ver, 2);
        assert_eq!(sm.shard().replicas.len(), 2);

        // Removal takes the replica out again.
        let cc = ConfigChangeRequest {
            change_type: ConfigChangeType::RemoveNode as i32,
            replica: Some(Replica::new(2, 2, ReplicaRole::Voter)),
        };
        let batch = admin_batch(
            AdminCmdType::AdminConfigChange,
            epoch(1, 2),
            cc.encode_to_vec(),
        );
        let (resp, _) = sm.apply(&batch, 6, 1, &leader_ctx());
        assert!(resp.responses[0].error.is_none());
        assert_eq!(sm.shard().replicas.len(), 1);
        assert_eq!(sm.shard().epoch().config_ver, 3);
    }

    #[test]
    fn batch_split_installs_children() {
        let mut parent = shard(1, 1);
        parent.start = b"a".to_vec();
        parent.end = b"z".to_vec();
        let mut sm = state_machine(parent);

        let split = BatchSplitRequest {
            requests: vec![
                tessera_api::rpcpb::SplitRequest {
                    start: b"a".to_vec(),
                    end: b"m".to_vec(),
                    new_shard_id: 2,
                    new_replica_ids: vec![21],
                },
                tessera_api::rpcpb::SplitRequest {
                    start: b"m".to_vec(),
                    end: b"z".to_vec(),
                    new_shard_id: 3,
                    new_replica_ids: vec![31],
                },
            ],
            context: vec![],
        };
        let batch = admin_batch(
            AdminCmdType::AdminBatchSplit,
            epoch(1, 1),
            split.encode_to_vec(),
        );

        let (resp, effect) = sm.apply(&batch, 7, 1, &leader_ctx());
        assert!(resp.responses[0].error.is_none());
        let AdminEffect::Split { children } = effect else {
            panic!("expected a split effect");
        };
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].epoch().generation, 2);
        assert_eq!(children[1].id, 3);
        assert_eq!(sm.shard().shard_state(), ShardState::Destroying);

        let states = sm.data_storage().initial_states().unwrap();
        assert_eq!(states.len(), 3);
    }

    #[test]
    fn uncovering_split_is_rejected() {
        let mut parent = shard(1, 1);
        parent.start = b"a".to_vec();
        parent.end = b"z".to_vec();
        let mut sm = state_machine(parent);

        let split = BatchSplitRequest {
            requests: vec![
                tessera_api::rpcpb::SplitRequest {
                    start: b"a".to_vec(),
                    end: b"m".to_vec(),
                    new_shard_id: 2,
                    new_replica_ids: vec![21],
                },
                tessera_api::rpcpb::SplitRequest {
                    start: b"m".to_vec(),
                    end: b"y".to_vec(),
                    new_shard_id: 3,
                    new_replica_ids: vec![31],
                },
            ],
            context: vec![],
        };
        let batch = admin_batch(
            AdminCmdType::AdminBatchSplit,
            epoch(1, 1),
            split.encode_to_vec(),
        );
        let (resp, _) = sm.apply(&batch, 7, 1, &leader_ctx());
        assert!(resp.responses[0].error.is_some());
    }

    #[test]
    fn update_labels_add_and_replace() {
        let mut sm = state_machine(shard(1, 1));

        let update = UpdateLabelsRequest {
            labels: vec![Label {
                key: "zone".into(),
                value: "east".into(),
            }],
            policy: LabelPolicy::Add as i32,
        };
        let batch = admin_batch(
            AdminCmdType::AdminUpdateLabels,
            epoch(1, 1),
            update.encode_to_vec(),
        );
        let (resp, _) = sm.apply(&batch, 2, 1, &leader_ctx());
        assert!(resp.responses[0].error.is_none());
        assert_eq!(sm.shard().labels.len(), 1);

        let update = UpdateLabelsRequest {
            labels: vec![Label {
                key: "rack".into(),
                value: "r1".into(),
            }],
            policy: LabelPolicy::Replace as i32,
        };
        let batch = admin_batch(
            AdminCmdType::AdminUpdateLabels,
            epoch(1, 1),
            update.encode_to_vec(),
        );
        sm.apply(&batch, 3, 1, &leader_ctx());
        assert_eq!(sm.shard().labels.len(), 1);
        assert_eq!(sm.shard().labels[0].key, "rack");
    }
}
