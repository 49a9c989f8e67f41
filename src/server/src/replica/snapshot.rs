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

//! On-disk snapshot images. One snapshotter serves one replica; images live
//! under `<data_path>/snapshots/shard-{shard}-replica-{replica}/` in
//! `snap-{index}-{random}` directories holding a `META` record plus the
//! data files written by the data storage.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use prost::Message;
use raft::eraftpb::{ConfState, Snapshot, SnapshotMetadata};
use tessera_api::metapb::Shard;
use tracing::info;

use crate::{
    serverpb::{EntryId, SnapshotFile, SnapshotInfo, SnapshotMeta},
    storage::DataStorage,
    Error, Result,
};

const SNAP_META: &str = "META";
const SNAP_PREFIX: &str = "snap";
const TMP_PREFIX: &str = "tmp";

/// A staged snapshot between `save` and `commit`.
pub struct SnapshotEnv {
    tmp_dir: PathBuf,
    final_dir: PathBuf,
}

impl SnapshotEnv {
    pub fn final_dir(&self) -> &Path {
        &self.final_dir
    }

    pub fn remove_tmp_dir(&self) {
        let _ = std::fs::remove_dir_all(&self.tmp_dir);
    }
}

pub struct Snapshotter {
    root_dir: PathBuf,
    shard_id: u64,
    replica_id: u64,
}

impl Snapshotter {
    /// `snapshot_root` is the store-wide snapshot directory; the replica
    /// image dir is created beneath it.
    pub fn new(snapshot_root: &Path, shard_id: u64, replica_id: u64) -> Result<Self> {
        let root_dir = snapshot_root.join(format!("shard-{shard_id}-replica-{replica_id}"));
        std::fs::create_dir_all(&root_dir)?;
        Ok(Snapshotter {
            root_dir,
            shard_id,
            replica_id,
        })
    }

    #[inline]
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn dir_name(prefix: &str, index: u64, extra: u64) -> String {
        format!("{prefix}-{index:016x}-{extra:016x}")
    }

    pub fn image_dir(&self, index: u64, extra: u64) -> PathBuf {
        self.root_dir.join(Self::dir_name(SNAP_PREFIX, index, extra))
    }

    /// Write the data image and META record into a temp dir; nothing is
    /// visible until `commit`.
    pub fn save(
        &self,
        data_storage: &Arc<dyn DataStorage>,
        shard: &Shard,
        conf_state: &ConfState,
        index: u64,
        term: u64,
    ) -> Result<(Snapshot, SnapshotEnv)> {
        let extra: u64 = rand::random();
        let env = SnapshotEnv {
            tmp_dir: self.root_dir.join(Self::dir_name(TMP_PREFIX, index, extra)),
            final_dir: self.image_dir(index, extra),
        };

        std::fs::create_dir_all(&env.tmp_dir)?;
        data_storage.save_snapshot(shard, &env.tmp_dir)?;

        let meta = SnapshotMeta {
            apply_state: Some(EntryId { index, term }),
            shard: Some(shard.clone()),
            dummy: false,
        };
        std::fs::write(env.tmp_dir.join(SNAP_META), meta.encode_to_vec())?;

        let info = SnapshotInfo {
            extra,
            dummy: false,
        };
        let mut metadata = SnapshotMetadata::default();
        metadata.index = index;
        metadata.term = term;
        metadata.set_conf_state(conf_state.clone());
        let mut snapshot = Snapshot::default();
        snapshot.set_data(info.encode_to_vec().into());
        snapshot.set_metadata(metadata);
        Ok((snapshot, env))
    }

    /// Atomically publish the staged image. A collision at the final path
    /// means two snapshots drew the same `(index, random)` pair, which is a
    /// bug in id allocation.
    pub fn commit(&self, env: &SnapshotEnv) -> Result<()> {
        if env.final_dir.exists() {
            panic!(
                "snapshot final dir {} already exists",
                env.final_dir.display()
            );
        }
        std::fs::rename(&env.tmp_dir, &env.final_dir)?;
        info!(
            shard = self.shard_id,
            replica = self.replica_id,
            dir = %env.final_dir.display(),
            "snapshot committed",
        );
        Ok(())
    }

    /// Load the META record and restore the data storage from the image
    /// `snapshot` points at. Dummy snapshots are never installable.
    pub fn recover(
        &self,
        data_storage: &Arc<dyn DataStorage>,
        snapshot: &Snapshot,
    ) -> Result<SnapshotMeta> {
        let info = decode_snapshot_info(snapshot);
        if info.dummy {
            panic!(
                "shard {} replica {} trying to recover from a dummy snapshot",
                self.shard_id, self.replica_id
            );
        }

        let dir = self.image_dir(snapshot.get_metadata().index, info.extra);
        let meta = self.read_meta(&dir)?;
        let shard = meta
            .shard
            .clone()
            .ok_or_else(|| Error::InvalidData("snapshot meta".into()))?;
        data_storage.recover_from_snapshot(&shard, &dir)?;
        Ok(meta)
    }

    fn read_meta(&self, dir: &Path) -> Result<SnapshotMeta> {
        let bytes = std::fs::read(dir.join(SNAP_META))?;
        SnapshotMeta::decode(bytes.as_slice())
            .map_err(|_| Error::InvalidData("snapshot meta".into()))
    }

    /// The image files of `snapshot`, for shipping to a follower.
    pub fn load_image_files(&self, snapshot: &Snapshot) -> Result<Vec<SnapshotFile>> {
        let info = decode_snapshot_info(snapshot);
        let dir = self.image_dir(snapshot.get_metadata().index, info.extra);
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().is_file() {
                files.push(SnapshotFile {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    data: std::fs::read(entry.path())?,
                });
            }
        }
        Ok(files)
    }

    /// Write image files received from a leader so that the accompanying
    /// `MsgSnapshot` can be applied locally.
    pub fn install_image_files(
        &self,
        snapshot: &Snapshot,
        files: &[SnapshotFile],
    ) -> Result<()> {
        let info = decode_snapshot_info(snapshot);
        let dir = self.image_dir(snapshot.get_metadata().index, info.extra);
        std::fs::create_dir_all(&dir)?;
        for file in files {
            std::fs::write(dir.join(&file.name), &file.data)?;
        }
        Ok(())
    }

    /// Remove every image strictly below `index`; when `including` is set,
    /// also the image exactly at `index` (the persistent log already covers
    /// it).
    pub fn recycle(&self, index: u64, including_extra: Option<u64>) -> Result<()> {
        for entry in std::fs::read_dir(&self.root_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((snap_index, extra)) = parse_dir_name(&name) else {
                continue;
            };
            let doomed =
                snap_index < index || (snap_index == index && including_extra == Some(extra));
            if doomed {
                info!(
                    shard = self.shard_id,
                    replica = self.replica_id,
                    dir = %entry.path().display(),
                    "removing snapshot dir",
                );
                std::fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }

    /// Drop the whole image tree of this replica.
    pub fn destroy(&self) -> Result<()> {
        if self.root_dir.exists() {
            std::fs::remove_dir_all(&self.root_dir)?;
        }
        Ok(())
    }
}

pub fn decode_snapshot_info(snapshot: &Snapshot) -> SnapshotInfo {
    if snapshot.get_data().is_empty() {
        return SnapshotInfo {
            extra: 0,
            dummy: true,
        };
    }
    SnapshotInfo::decode(snapshot.get_data()).expect("snapshot data is SnapshotInfo")
}

fn parse_dir_name(name: &str) -> Option<(u64, u64)> {
    let rest = name.strip_prefix(&format!("{SNAP_PREFIX}-"))?;
    let (index, extra) = rest.split_once('-')?;
    Some((
        u64::from_str_radix(index, 16).ok()?,
        u64::from_str_radix(extra, 16).ok()?,
    ))
}
