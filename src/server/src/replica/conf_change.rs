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

//! Membership-change encoding and the safety checks applied before a
//! config change is handed to raft.

use std::collections::HashSet;

use raft::{
    eraftpb::{ConfChange, ConfChangeSingle, ConfChangeTransition, ConfChangeType, ConfChangeV2},
    Changer, RawNode,
};
use raft_proto::ConfChangeI;
use tessera_api::{
    metapb::{ConfigChangeType, Shard},
    rpcpb::ConfigChangeRequest,
};

use crate::{Error, Result};

/// The raft encoding of a membership change, derived from the number of
/// requested changes: none leaves a joint configuration, one is a simple
/// change, several enter a joint configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfChangeKind {
    LeaveJoint,
    Simple,
    EnterJoint,
}

impl ConfChangeKind {
    pub fn from_changes(count: usize) -> Self {
        match count {
            0 => ConfChangeKind::LeaveJoint,
            1 => ConfChangeKind::Simple,
            _ => ConfChangeKind::EnterJoint,
        }
    }
}

/// Either conf-change encoding, proposable through `RawNode`.
pub enum ConfChangeEncoding {
    V1(ConfChange),
    V2(ConfChangeV2),
}

impl ConfChangeEncoding {
    /// Encode `reqs` the way raft expects: a single change uses the V1
    /// message, everything else V2. `context` travels with the entry and is
    /// decoded again at apply time.
    pub fn build(reqs: &[ConfigChangeRequest], context: Vec<u8>) -> Self {
        if reqs.len() == 1 {
            let mut cc = ConfChange::default();
            cc.set_change_type(raft_change_type(reqs[0].change_type()));
            cc.node_id = reqs[0].replica.as_ref().map(|r| r.id).unwrap_or_default();
            cc.set_context(context.into());
            ConfChangeEncoding::V1(cc)
        } else {
            let mut cc = ConfChangeV2::default();
            cc.set_transition(ConfChangeTransition::Auto);
            for req in reqs {
                let mut single = ConfChangeSingle::default();
                single.set_change_type(raft_change_type(req.change_type()));
                single.node_id = req.replica.as_ref().map(|r| r.id).unwrap_or_default();
                cc.mut_changes().push(single);
            }
            cc.set_context(context.into());
            ConfChangeEncoding::V2(cc)
        }
    }

    pub fn into_v2(self) -> ConfChangeV2 {
        match self {
            ConfChangeEncoding::V1(cc) => cc.into_v2(),
            ConfChangeEncoding::V2(cc) => cc,
        }
    }

    pub fn as_v2(&self) -> ConfChangeV2 {
        match self {
            ConfChangeEncoding::V1(cc) => cc.clone().into_v2(),
            ConfChangeEncoding::V2(cc) => cc.clone(),
        }
    }
}

fn raft_change_type(ct: ConfigChangeType) -> ConfChangeType {
    match ct {
        ConfigChangeType::AddNode => ConfChangeType::AddNode,
        ConfigChangeType::RemoveNode => ConfChangeType::RemoveNode,
        ConfigChangeType::AddLearnerNode => ConfChangeType::AddLearnerNode,
    }
}

/// Syntactic validity: the requested role must agree with the change type.
/// Removals are always well formed.
pub fn is_valid_config_change_request(req: &ConfigChangeRequest) -> bool {
    use tessera_api::metapb::ReplicaRole;

    let role = req
        .replica
        .as_ref()
        .map(|r| r.replica_role())
        .unwrap_or(ReplicaRole::Voter);
    match req.change_type() {
        ConfigChangeType::RemoveNode => true,
        ConfigChangeType::AddNode => role == ReplicaRole::Voter,
        ConfigChangeType::AddLearnerNode => role == ReplicaRole::Learner,
    }
}

/// In a simple change, removing the leader or demoting it to learner would
/// leave the group leaderless mid-change.
pub fn is_removing_or_demoting_leader(
    kind: ConfChangeKind,
    req: &ConfigChangeRequest,
    leader_replica_id: u64,
) -> bool {
    if kind != ConfChangeKind::Simple {
        return false;
    }
    let target = req.replica.as_ref().map(|r| r.id).unwrap_or_default();
    target == leader_replica_id
        && matches!(
            req.change_type(),
            ConfigChangeType::RemoveNode | ConfigChangeType::AddLearnerNode
        )
}

/// Entering a joint configuration must demote voters to learners instead of
/// removing them outright; a direct removal would break the joint quorum.
pub fn removes_voter_directly_in_joint_consensus(
    kind: ConfChangeKind,
    req: &ConfigChangeRequest,
) -> bool {
    use tessera_api::metapb::ReplicaRole;

    kind == ConfChangeKind::EnterJoint
        && req.change_type() == ConfigChangeType::RemoveNode
        && req
            .replica
            .as_ref()
            .map(|r| r.replica_role() == ReplicaRole::Voter)
            .unwrap_or_default()
}

/// Reject config changes that would strand or behead the group. The final
/// check applies the change prospectively to the raft progress tracker and
/// requires that at least one voter survives.
pub fn check_conf_change<T: raft::Storage>(
    raw_node: &RawNode<T>,
    leader_replica_id: u64,
    shard: &Shard,
    reqs: &[ConfigChangeRequest],
    cc: &ConfChangeEncoding,
) -> Result<()> {
    let kind = ConfChangeKind::from_changes(reqs.len());
    for req in reqs {
        if !is_valid_config_change_request(req) {
            return Err(Error::InvalidConfigChangeRequest);
        }
        if is_removing_or_demoting_leader(kind, req, leader_replica_id) {
            return Err(Error::RemoveLeader);
        }
        if removes_voter_directly_in_joint_consensus(kind, req) {
            return Err(Error::InvalidConfigChangeRequest);
        }
    }

    let cc = cc.as_v2();
    let tracker = raw_node.raft.prs();
    let mut changer = Changer::new(tracker);
    let cfg = match kind {
        ConfChangeKind::LeaveJoint => changer.leave_joint(),
        ConfChangeKind::EnterJoint => {
            let auto_leave = cc.enter_joint().unwrap_or_default();
            changer.enter_joint(auto_leave, cc.get_changes())
        }
        ConfChangeKind::Simple => changer.simple(cc.get_changes()),
    }
    .map(|(cfg, _)| cfg)
    .map_err(|_| Error::InvalidConfigChangeRequest)?;

    // Candidate voter ids: current members plus everything the change
    // touches.
    let mut candidates: HashSet<u64> = shard.replicas.iter().map(|r| r.id).collect();
    candidates.insert(leader_replica_id);
    for change in cc.get_changes() {
        candidates.insert(change.node_id);
    }
    let remaining_voters = candidates
        .iter()
        .filter(|id| cfg.voters().contains(**id))
        .count();
    if remaining_voters == 0 {
        return Err(Error::InvalidConfigChangeRequest);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tessera_api::metapb::{Replica, ReplicaRole};

    use super::*;

    fn change(ct: ConfigChangeType, replica: Replica) -> ConfigChangeRequest {
        ConfigChangeRequest {
            change_type: ct as i32,
            replica: Some(replica),
        }
    }

    #[test]
    fn kind_from_change_count() {
        assert_eq!(ConfChangeKind::from_changes(0), ConfChangeKind::LeaveJoint);
        assert_eq!(ConfChangeKind::from_changes(1), ConfChangeKind::Simple);
        assert_eq!(ConfChangeKind::from_changes(2), ConfChangeKind::EnterJoint);
        assert_eq!(
            ConfChangeKind::from_changes(100),
            ConfChangeKind::EnterJoint
        );
    }

    #[test]
    fn validity_ties_role_to_change_type() {
        let voter = Replica::new(1, 1, ReplicaRole::Voter);
        let learner = Replica::new(1, 1, ReplicaRole::Learner);

        assert!(is_valid_config_change_request(&change(
            ConfigChangeType::RemoveNode,
            voter.clone()
        )));
        assert!(is_valid_config_change_request(&change(
            ConfigChangeType::AddNode,
            voter.clone()
        )));
        assert!(!is_valid_config_change_request(&change(
            ConfigChangeType::AddNode,
            learner.clone()
        )));
        assert!(is_valid_config_change_request(&change(
            ConfigChangeType::AddLearnerNode,
            learner
        )));
        assert!(!is_valid_config_change_request(&change(
            ConfigChangeType::AddLearnerNode,
            voter
        )));
    }

    #[test]
    fn leader_removal_rejected_only_in_simple_mode() {
        let as_target = |id| Replica::new(id, 1, ReplicaRole::Voter);

        assert!(!is_removing_or_demoting_leader(
            ConfChangeKind::Simple,
            &change(ConfigChangeType::RemoveNode, as_target(2)),
            1,
        ));
        assert!(is_removing_or_demoting_leader(
            ConfChangeKind::Simple,
            &change(ConfigChangeType::RemoveNode, as_target(2)),
            2,
        ));
        assert!(is_removing_or_demoting_leader(
            ConfChangeKind::Simple,
            &change(ConfigChangeType::AddLearnerNode, as_target(2)),
            2,
        ));
        assert!(!is_removing_or_demoting_leader(
            ConfChangeKind::LeaveJoint,
            &change(ConfigChangeType::AddLearnerNode, as_target(2)),
            2,
        ));
        assert!(!is_removing_or_demoting_leader(
            ConfChangeKind::EnterJoint,
            &change(ConfigChangeType::AddLearnerNode, as_target(2)),
            2,
        ));
    }

    #[test]
    fn direct_voter_removal_rejected_in_joint_mode() {
        let voter = Replica::new(3, 1, ReplicaRole::Voter);
        let learner = Replica::new(3, 1, ReplicaRole::Learner);

        assert!(removes_voter_directly_in_joint_consensus(
            ConfChangeKind::EnterJoint,
            &change(ConfigChangeType::RemoveNode, voter.clone()),
        ));
        assert!(!removes_voter_directly_in_joint_consensus(
            ConfChangeKind::EnterJoint,
            &change(ConfigChangeType::RemoveNode, learner.clone()),
        ));
        assert!(!removes_voter_directly_in_joint_consensus(
            ConfChangeKind::EnterJoint,
            &change(ConfigChangeType::AddLearnerNode, learner),
        ));
        assert!(!removes_voter_directly_in_joint_consensus(
            ConfChangeKind::Simple,
            &change(ConfigChangeType::RemoveNode, voter),
        ));
    }

    #[test]
    fn raft_backed_rejections() {
        use raft::Config;

        use crate::replica::storage::{write_initial_state, LogReader};

        let dir = tempdir::TempDir::new("conf-change-check").unwrap();
        let engine_cfg = raft_engine::Config {
            dir: dir.path().to_str().unwrap().to_owned(),
            ..Default::default()
        };
        let engine = std::sync::Arc::new(raft_engine::Engine::open(engine_cfg).unwrap());
        write_initial_state(&engine, 1, vec![1, 200], vec![]).unwrap();

        let log_reader = LogReader::open(1, engine).unwrap();
        let raft_cfg = Config {
            id: 1,
            election_tick: 10,
            heartbeat_tick: 1,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        };
        let raw_node = RawNode::with_default_logger(&raft_cfg, log_reader).unwrap();

        let shard = Shard {
            id: 1,
            replicas: vec![
                Replica::new(1, 1, ReplicaRole::Voter),
                Replica::new(200, 2, ReplicaRole::Voter),
            ],
            ..Default::default()
        };

        let cases: Vec<(ConfigChangeRequest, Option<fn(&crate::Error) -> bool>)> = vec![
            // Removing a non-leader voter is allowed.
            (
                change(
                    ConfigChangeType::RemoveNode,
                    Replica::new(200, 2, ReplicaRole::Voter),
                ),
                None,
            ),
            (
                change(
                    ConfigChangeType::AddNode,
                    Replica::new(100, 3, ReplicaRole::Voter),
                ),
                None,
            ),
            (
                change(
                    ConfigChangeType::AddLearnerNode,
                    Replica::new(100, 3, ReplicaRole::Learner),
                ),
                None,
            ),
            // Role/type mismatches are invalid.
            (
                change(
                    ConfigChangeType::AddNode,
                    Replica::new(100, 3, ReplicaRole::Learner),
                ),
                Some(|e| matches!(e, crate::Error::InvalidConfigChangeRequest)),
            ),
            (
                change(
                    ConfigChangeType::AddLearnerNode,
                    Replica::new(100, 3, ReplicaRole::Voter),
                ),
                Some(|e| matches!(e, crate::Error::InvalidConfigChangeRequest)),
            ),
            // Removing or demoting the leader in a simple change is not.
            (
                change(
                    ConfigChangeType::RemoveNode,
                    Replica::new(1, 1, ReplicaRole::Voter),
                ),
                Some(|e| matches!(e, crate::Error::RemoveLeader)),
            ),
            (
                change(
                    ConfigChangeType::AddLearnerNode,
                    Replica::new(1, 1, ReplicaRole::Learner),
                ),
                Some(|e| matches!(e, crate::Error::RemoveLeader)),
            ),
        ];

        for (idx, (req, expected)) in cases.into_iter().enumerate() {
            let reqs = vec![req];
            let encoding = ConfChangeEncoding::build(&reqs, vec![]);
            let result = check_conf_change(&raw_node, 1, &shard, &reqs, &encoding);
            match expected {
                None => assert!(result.is_ok(), "case {idx} should pass: {result:?}"),
                Some(matcher) => {
                    let err = result.expect_err("expected a rejection");
                    assert!(matcher(&err), "case {idx} rejected with {err:?}");
                }
            }
        }
    }

    #[test]
    fn single_change_encodes_as_v1() {
        let reqs = vec![change(
            ConfigChangeType::RemoveNode,
            Replica::new(123, 1, ReplicaRole::Voter),
        )];
        let context = vec![0x23, 0, 0, 0, 0, 0, 0, 0xbf];
        match ConfChangeEncoding::build(&reqs, context.clone()) {
            ConfChangeEncoding::V1(cc) => {
                assert_eq!(cc.get_change_type(), ConfChangeType::RemoveNode);
                assert_eq!(cc.node_id, 123);
                assert_eq!(cc.get_context(), context.as_slice());
            }
            ConfChangeEncoding::V2(_) => panic!("expected V1 encoding"),
        }
    }

    #[test]
    fn multiple_changes_encode_as_v2() {
        let reqs = vec![
            change(
                ConfigChangeType::AddNode,
                Replica::new(4, 4, ReplicaRole::Voter),
            ),
            change(
                ConfigChangeType::AddLearnerNode,
                Replica::new(5, 5, ReplicaRole::Learner),
            ),
        ];
        match ConfChangeEncoding::build(&reqs, vec![]) {
            ConfChangeEncoding::V2(cc) => {
                assert_eq!(cc.get_changes().len(), 2);
                assert_eq!(cc.get_changes()[0].node_id, 4);
                assert_eq!(
                    cc.get_changes()[1].get_change_type(),
                    ConfChangeType::AddLearnerNode
                );
            }
            ConfChangeEncoding::V1(_) => panic!("expected V2 encoding"),
        }
    }
}
