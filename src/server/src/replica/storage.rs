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

//! The raft storage adapter over the shared log engine. One `LogReader`
//! serves one replica; the engine groups logs by replica id.

use std::{cell::Cell, sync::Arc};

use prost::Message as _;
use raft::{
    eraftpb::{ConfState, Entry, HardState, Snapshot},
    GetEntriesContext, RaftState, StorageError,
};
use raft_engine::{Command, Engine, LogBatch, MessageExt};

use crate::{serverpb::EntryId, Result};

#[derive(Clone)]
pub struct MessageExtTyped;

impl MessageExt for MessageExtTyped {
    type Entry = Entry;

    fn index(e: &Entry) -> u64 {
        e.index
    }
}

pub mod keys {
    pub const HARD_STATE_KEY: &[u8] = b"hard_state";
    pub const CONF_STATE_KEY: &[u8] = b"conf_state";
    pub const TRUNCATED_STATE_KEY: &[u8] = b"truncated_state";
}

/// The entries, states and snapshot record the replica loop persists per
/// `Ready`.
#[derive(Default)]
pub struct WriteTask {
    pub hard_state: Option<HardState>,
    pub entries: Vec<Entry>,
    pub snapshot: Option<Snapshot>,
    pub must_sync: bool,
}

impl WriteTask {
    pub fn is_empty(&self) -> bool {
        self.hard_state.is_none() && self.entries.is_empty() && self.snapshot.is_none()
    }

    #[cfg(test)]
    pub fn with_entries(entries: Vec<Entry>) -> Self {
        WriteTask {
            entries,
            ..Default::default()
        }
    }
}

/// The implementation of [`raft::Storage`].
pub struct LogReader {
    replica_id: u64,
    engine: Arc<Engine>,

    first_index: u64,
    last_index: u64,
    hard_state: HardState,
    conf_state: ConfState,
    truncated: EntryId,

    /// The snapshot registered by the snapshotter, pending consumption by
    /// raft.
    snapshot: Option<Snapshot>,
    /// Set when raft asked for a snapshot the reader does not hold; the
    /// event loop reacts by creating one.
    snapshot_requested: Cell<bool>,
}

impl LogReader {
    pub fn open(replica_id: u64, engine: Arc<Engine>) -> Result<Self> {
        let hard_state = engine
            .get_message::<HardState>(replica_id, keys::HARD_STATE_KEY)?
            .expect("hard state must be initialized");
        let conf_state = engine
            .get_message::<ConfState>(replica_id, keys::CONF_STATE_KEY)?
            .expect("conf state must be initialized");
        let truncated = engine
            .get(replica_id, keys::TRUNCATED_STATE_KEY)
            .map(|v| EntryId::decode(v.as_slice()).expect("decode truncated state"))
            .unwrap_or_default();

        let first_index = engine.first_index(replica_id).unwrap_or(truncated.index + 1);
        let last_index = engine.last_index(replica_id).unwrap_or(truncated.index);

        Ok(LogReader {
            replica_id,
            engine,
            first_index,
            last_index,
            hard_state,
            conf_state,
            truncated,
            snapshot: None,
            snapshot_requested: Cell::new(false),
        })
    }

    /// Stage `write_task` into `batch`; the caller flushes the batch to the
    /// engine.
    pub fn write(&mut self, batch: &mut LogBatch, write_task: &WriteTask) -> Result<()> {
        if let Some(snapshot) = &write_task.snapshot {
            self.stage_snapshot(batch, snapshot)?;
        }
        if !write_task.entries.is_empty() {
            batch
                .add_entries::<MessageExtTyped>(self.replica_id, &write_task.entries)
                .unwrap();
            self.last_index = write_task.entries.last().unwrap().index;
        }
        if let Some(hs) = &write_task.hard_state {
            batch
                .put_message(self.replica_id, keys::HARD_STATE_KEY.to_owned(), hs)
                .unwrap();
            self.hard_state = hs.clone();
        }
        Ok(())
    }

    /// Reset the log around an installed snapshot: everything below its
    /// index is gone, and the log restarts right after it.
    fn stage_snapshot(&mut self, batch: &mut LogBatch, snapshot: &Snapshot) -> Result<()> {
        let metadata = snapshot.get_metadata();
        self.truncated = EntryId {
            index: metadata.index,
            term: metadata.term,
        };
        self.conf_state = metadata.get_conf_state().clone();
        self.first_index = metadata.index + 1;
        self.last_index = metadata.index;
        self.snapshot = None;

        batch.add_command(self.replica_id, Command::Clean);
        batch
            .put(
                self.replica_id,
                keys::TRUNCATED_STATE_KEY.to_owned(),
                self.truncated.encode_to_vec(),
            )
            .unwrap();
        batch
            .put_message(
                self.replica_id,
                keys::CONF_STATE_KEY.to_owned(),
                &self.conf_state,
            )
            .unwrap();
        batch
            .put_message(
                self.replica_id,
                keys::HARD_STATE_KEY.to_owned(),
                &self.hard_state,
            )
            .unwrap();
        Ok(())
    }

    /// Register a freshly created snapshot. Fails with `SnapshotOutOfDate`
    /// when a newer one is already registered.
    pub fn create_snapshot(&mut self, snapshot: Snapshot) -> std::result::Result<(), raft::Error> {
        if let Some(current) = &self.snapshot {
            if current.get_metadata().index >= snapshot.get_metadata().index {
                return Err(raft::Error::Store(StorageError::SnapshotOutOfDate));
            }
        }
        if self.truncated.index >= snapshot.get_metadata().index {
            return Err(raft::Error::Store(StorageError::SnapshotOutOfDate));
        }
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Whether raft asked for a snapshot since the last call.
    pub fn take_snapshot_requested(&self) -> bool {
        self.snapshot_requested.replace(false)
    }

    /// Persist the new truncated entry and drop the log prefix up to
    /// `compact_index` (exclusive).
    pub fn compact_to(&mut self, compact_index: u64) -> Result<()> {
        if compact_index <= self.truncated.index {
            return Ok(());
        }
        let term = raft::Storage::term(self, compact_index)?;
        self.truncated = EntryId {
            index: compact_index,
            term,
        };

        let mut batch = LogBatch::default();
        batch
            .put(
                self.replica_id,
                keys::TRUNCATED_STATE_KEY.to_owned(),
                self.truncated.encode_to_vec(),
            )
            .unwrap();
        self.engine.write(&mut batch, false)?;
        self.engine.compact_to(self.replica_id, compact_index + 1);
        self.first_index = compact_index + 1;
        Ok(())
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) -> Result<()> {
        let mut batch = LogBatch::default();
        batch
            .put_message(self.replica_id, keys::CONF_STATE_KEY.to_owned(), &conf_state)
            .unwrap();
        self.engine.write(&mut batch, false)?;
        self.conf_state = conf_state;
        Ok(())
    }

    #[inline]
    pub fn truncated_index(&self) -> u64 {
        self.truncated.index
    }

    #[inline]
    pub fn raft_log_size_hint(&self) -> u64 {
        // An estimate: the engine tracks sizes internally, the reader only
        // needs an order of magnitude for compaction pacing.
        self.last_index.saturating_sub(self.truncated.index) * 256
    }

    fn check_range(&self, low: u64, high: u64) -> raft::Result<()> {
        if low > high {
            panic!("low {} is greater than high {}", low, high);
        } else if high > self.last_index + 1 {
            panic!(
                "entries high {} is out of bound, last index {}",
                high, self.last_index
            );
        } else if low <= self.truncated.index {
            Err(raft::Error::Store(StorageError::Compacted))
        } else {
            Ok(())
        }
    }
}

impl raft::Storage for LogReader {
    fn initial_state(&self) -> raft::Result<RaftState> {
        Ok(RaftState {
            hard_state: self.hard_state.clone(),
            conf_state: self.conf_state.clone(),
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.check_range(low, high)?;
        let mut entries = Vec::with_capacity((high - low) as usize);
        if low == high {
            return Ok(entries);
        }

        let max_size = max_size.into().map(|v| v as usize);
        self.engine
            .fetch_entries_to::<MessageExtTyped>(self.replica_id, low, high, max_size, &mut entries)
            .map_err(|err| raft::Error::Store(StorageError::Other(err.into())))?;
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        if idx == self.truncated.index {
            return Ok(self.truncated.term);
        }
        self.check_range(idx, idx + 1)?;
        match self
            .engine
            .get_entry::<MessageExtTyped>(self.replica_id, idx)
            .map_err(|err| raft::Error::Store(StorageError::Other(err.into())))?
        {
            Some(entry) => Ok(entry.term),
            None => Err(raft::Error::Store(StorageError::Unavailable)),
        }
    }

    #[inline]
    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.first_index)
    }

    #[inline]
    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.last_index)
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        if let Some(snapshot) = &self.snapshot {
            if snapshot.get_metadata().index >= request_index {
                return Ok(snapshot.clone());
            }
        }
        self.snapshot_requested.set(true);
        Err(raft::Error::Store(
            StorageError::SnapshotTemporarilyUnavailable,
        ))
    }
}

/// Seed the engine with the initial raft states of a new replica. All
/// previous data of the replica is cleaned first.
pub fn write_initial_state(
    engine: &Engine,
    replica_id: u64,
    voters: Vec<u64>,
    learners: Vec<u64>,
) -> Result<()> {
    let hard_state = HardState::default();
    let mut conf_state = ConfState::default();
    conf_state.set_voters(voters);
    conf_state.set_learners(learners);
    let truncated = EntryId::default();

    let mut batch = LogBatch::default();
    batch.add_command(replica_id, Command::Clean);
    batch
        .put_message(replica_id, keys::HARD_STATE_KEY.to_owned(), &hard_state)
        .unwrap();
    batch
        .put_message(replica_id, keys::CONF_STATE_KEY.to_owned(), &conf_state)
        .unwrap();
    batch
        .put(
            replica_id,
            keys::TRUNCATED_STATE_KEY.to_owned(),
            truncated.encode_to_vec(),
        )
        .unwrap();
    engine.write(&mut batch, true)?;
    Ok(())
}

/// Remove every trace of the replica from the engine.
pub fn destroy_storage(engine: &Engine, replica_id: u64) -> Result<()> {
    let mut batch = LogBatch::default();
    batch.add_command(replica_id, Command::Clean);
    engine.write(&mut batch, true)?;
    Ok(())
}
