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

//! Quorum-observed replica destruction. The task walks two phases: wait for
//! the whole group to commit up to the target index and publish the
//! destroying record, then wait for the local apply to catch up and report
//! this replica destroyed. The task is idempotent and re-entered on restart
//! for shards persisted in the `Destroying` state.

use std::{sync::Arc, time::Duration};

use tessera_api::metapb::{DestroyingStatus, ShardState};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::Action;
use crate::Result;

/// The placement-service surface tracking destroying shards.
pub trait DestroyingStorage: Send + Sync {
    /// Publish the destroying record; idempotent.
    fn create_destroying(
        &self,
        shard_id: u64,
        index: u64,
        remove_data: bool,
        replicas: Vec<u64>,
    ) -> Result<ShardState>;

    /// Mark one replica destroyed; returns the record's state afterwards.
    fn report_destroyed(&self, shard_id: u64, replica_id: u64) -> Result<ShardState>;

    fn get_destroying(&self, shard_id: u64) -> Result<Option<DestroyingStatus>>;
}

pub type ActionHandler = Arc<dyn Fn(Action) + Send + Sync>;

/// Builds destroy tasks; tests substitute the action handler, storage and
/// check interval.
pub struct DestroyReplicaTaskFactory {
    action_handler: ActionHandler,
    storage: Arc<dyn DestroyingStorage>,
    check_interval: Duration,
}

impl DestroyReplicaTaskFactory {
    pub fn new(
        action_handler: ActionHandler,
        storage: Arc<dyn DestroyingStorage>,
        check_interval: Duration,
    ) -> Self {
        DestroyReplicaTaskFactory {
            action_handler,
            storage,
            check_interval,
        }
    }

    pub fn new_task(
        &self,
        shard_id: u64,
        replica_id: u64,
        target_index: u64,
        remove_data: bool,
        reason: String,
    ) -> DestroyReplicaTask {
        DestroyReplicaTask {
            shard_id,
            replica_id,
            target_index,
            remove_data,
            reason,
            action_handler: self.action_handler.clone(),
            storage: self.storage.clone(),
            check_interval: self.check_interval,
        }
    }
}

pub struct DestroyReplicaTask {
    shard_id: u64,
    replica_id: u64,
    target_index: u64,
    remove_data: bool,
    reason: String,
    action_handler: ActionHandler,
    storage: Arc<dyn DestroyingStorage>,
    check_interval: Duration,
}

impl DestroyReplicaTask {
    pub async fn run(self) {
        info!(
            shard = self.shard_id,
            replica = self.replica_id,
            index = self.target_index,
            reason = %self.reason,
            "destroy replica task started",
        );

        // Phase one ends when the destroying record exists, whether this
        // run published it (leader) or another replica's did.
        let (target_index, remove_data) = loop {
            match self.storage.get_destroying(self.shard_id) {
                Ok(Some(status)) => break (status.index, status.remove_data),
                Ok(None) => {}
                Err(err) => {
                    warn!(shard = self.shard_id, "read destroying status: {err}");
                }
            }

            // Only the leader observes the whole group's progress; others
            // keep polling for the record.
            let (tx, rx) = oneshot::channel();
            (self.action_handler)(Action::CheckLogCommitted {
                target_index: self.target_index,
                tx,
            });
            if let Ok(replicas) = rx.await {
                if let Err(err) = self.storage.create_destroying(
                    self.shard_id,
                    self.target_index,
                    self.remove_data,
                    replicas,
                ) {
                    warn!(shard = self.shard_id, "create destroying record: {err}");
                }
                continue;
            }
            tokio::time::sleep(self.check_interval).await;
        };

        self.wait_log_applied(target_index).await;

        loop {
            match self
                .storage
                .report_destroyed(self.shard_id, self.replica_id)
            {
                Ok(state) => {
                    debug!(
                        shard = self.shard_id,
                        replica = self.replica_id,
                        ?state,
                        "replica reported destroyed",
                    );
                    break;
                }
                Err(err) => {
                    warn!(shard = self.shard_id, "report destroyed: {err}");
                    tokio::time::sleep(self.check_interval).await;
                }
            }
        }

        (self.action_handler)(Action::CompleteDestroy { remove_data });
        info!(
            shard = self.shard_id,
            replica = self.replica_id,
            "destroy replica task completed",
        );
    }

    /// Phase two: the local state machine must have applied the target
    /// index.
    async fn wait_log_applied(&self, target_index: u64) {
        loop {
            let (tx, rx) = oneshot::channel();
            (self.action_handler)(Action::CheckLogApplied { target_index, tx });
            if rx.await.is_ok() {
                return;
            }
            tokio::time::sleep(self.check_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct TestDestroyingStorage {
        data: Mutex<std::collections::HashMap<u64, DestroyingStatus>>,
    }

    impl DestroyingStorage for TestDestroyingStorage {
        fn create_destroying(
            &self,
            shard_id: u64,
            index: u64,
            remove_data: bool,
            replicas: Vec<u64>,
        ) -> Result<ShardState> {
            let mut data = self.data.lock().unwrap();
            let status = DestroyingStatus {
                index,
                remove_data,
                state: ShardState::Destroying as i32,
                replicas: replicas.into_iter().map(|id| (id, false)).collect(),
            };
            data.insert(shard_id, status);
            Ok(ShardState::Destroying)
        }

        fn report_destroyed(&self, shard_id: u64, replica_id: u64) -> Result<ShardState> {
            let mut data = self.data.lock().unwrap();
            let Some(status) = data.get_mut(&shard_id) else {
                return Ok(ShardState::Destroying);
            };
            status.replicas.insert(replica_id, true);
            if status.replicas.values().all(|v| *v) {
                status.state = ShardState::Destroyed as i32;
            }
            Ok(ShardState::from_i32(status.state).unwrap())
        }

        fn get_destroying(&self, shard_id: u64) -> Result<Option<DestroyingStatus>> {
            Ok(self.data.lock().unwrap().get(&shard_id).cloned())
        }
    }

    fn factory(
        handler: impl Fn(Action) + Send + Sync + 'static,
        storage: Arc<TestDestroyingStorage>,
    ) -> DestroyReplicaTaskFactory {
        DestroyReplicaTaskFactory::new(Arc::new(handler), storage, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn phase_one_publishes_destroying_record() {
        let storage = Arc::new(TestDestroyingStorage::default());
        let f = factory(
            |action| match action {
                Action::CheckLogCommitted { tx, .. } => {
                    tx.send(vec![1, 2, 3]).unwrap_or_default();
                }
                Action::CheckLogApplied { .. } => {}
                _ => {}
            },
            storage.clone(),
        );

        let task = f.new_task(1, 1, 100, false, "test".into());
        let handle = tokio::spawn(task.run());

        // The applied check never answers, so the task parks in phase two
        // with the record already published.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = storage.get_destroying(1).unwrap().unwrap();
        assert_eq!(status.index, 100);
        assert_eq!(status.replicas.len(), 3);
        assert_eq!(status.state, ShardState::Destroying as i32);
        handle.abort();
    }

    #[tokio::test]
    async fn completed_task_reports_destroyed() {
        let storage = Arc::new(TestDestroyingStorage::default());
        storage.create_destroying(1, 100, false, vec![1, 2, 3]).unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let f = factory(
            move |action| match action {
                Action::CheckLogApplied { tx, .. } => {
                    tx.send(()).unwrap_or_default();
                }
                Action::CompleteDestroy { remove_data } => {
                    done_tx.send(remove_data).unwrap();
                }
                _ => {}
            },
            storage.clone(),
        );

        f.new_task(1, 1, 100, false, "test".into()).run().await;

        assert!(!done_rx.try_recv().unwrap());
        let status = storage.get_destroying(1).unwrap().unwrap();
        assert!(status.replicas[&1]);
        assert_eq!(status.state, ShardState::Destroying as i32);

        // The last two replicas reporting flip the record to destroyed.
        assert_eq!(storage.report_destroyed(1, 2).unwrap(), ShardState::Destroying);
        assert_eq!(storage.report_destroyed(1, 3).unwrap(), ShardState::Destroyed);
    }

    #[tokio::test]
    async fn existing_record_skips_phase_one() {
        let storage = Arc::new(TestDestroyingStorage::default());
        storage.create_destroying(1, 60, true, vec![1]).unwrap();

        let committed_checks = Arc::new(Mutex::new(0));
        let cloned = committed_checks.clone();
        let f = factory(
            move |action| match action {
                Action::CheckLogCommitted { .. } => *cloned.lock().unwrap() += 1,
                Action::CheckLogApplied { target_index, tx } => {
                    // The stored index wins over the task argument.
                    assert_eq!(target_index, 60);
                    tx.send(()).unwrap_or_default();
                }
                _ => {}
            },
            storage.clone(),
        );

        f.new_task(1, 1, 100, false, "restart".into()).run().await;
        assert_eq!(*committed_checks.lock().unwrap(), 0);
        assert_eq!(storage.get_destroying(1).unwrap().unwrap().index, 60);
    }
}
