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

//! An ordered map of non-overlapping shard ranges within one group.

use std::{collections::BTreeMap, sync::RwLock};

use tessera_api::metapb::{Shard, ShardState};

/// The per-group index of live shard ranges, keyed by start key. Stored
/// ranges never overlap; inserting a shard deletes every stored shard whose
/// range intersects it first.
#[derive(Default)]
pub struct ShardTree {
    tree: RwLock<BTreeMap<Vec<u8>, Shard>>,
}

impl ShardTree {
    pub fn new() -> Self {
        ShardTree::default()
    }

    pub fn len(&self) -> usize {
        self.tree.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `shards`, deleting overlapped entries first. Shards in
    /// `Destroying` or `Destroyed` state are ignored; on equal start keys
    /// the last write wins.
    pub fn update(&self, shards: impl IntoIterator<Item = Shard>) {
        let mut tree = self.tree.write().unwrap();
        for shard in shards {
            if matches!(
                shard.shard_state(),
                ShardState::Destroying | ShardState::Destroyed
            ) {
                continue;
            }

            let overlapped = tree
                .iter()
                .filter(|(_, stored)| tessera_api::shard::overlaps(stored, &shard))
                .map(|(start, _)| start.clone())
                .collect::<Vec<_>>();
            for start in overlapped {
                tree.remove(&start);
            }

            tree.insert(shard.start.clone(), shard);
        }
    }

    /// Remove `shard` only when the stored entry covering its start key has
    /// the same id. Returns whether an entry was removed.
    pub fn remove(&self, shard: &Shard) -> bool {
        let mut tree = self.tree.write().unwrap();
        match Self::find_locked(&tree, &shard.start) {
            Some(stored) if stored.id == shard.id => {
                let start = stored.start.clone();
                tree.remove(&start);
                true
            }
            _ => false,
        }
    }

    /// The shard whose range contains `key`, if any.
    pub fn search(&self, key: &[u8]) -> Option<Shard> {
        let tree = self.tree.read().unwrap();
        Self::find_locked(&tree, key).cloned()
    }

    /// The stored shard with the smallest start key strictly greater than
    /// `start`.
    pub fn next_shard(&self, start: &[u8]) -> Option<Shard> {
        let tree = self.tree.read().unwrap();
        tree.range::<[u8], _>((
            std::ops::Bound::Excluded(start),
            std::ops::Bound::Unbounded,
        ))
        .next()
        .map(|(_, shard)| shard.clone())
    }

    /// Visit the shards intersecting `[start, end)` in ascending start
    /// order; stop when `f` returns false. An empty `end` is unbounded.
    pub fn ascend_range(&self, start: &[u8], end: &[u8], mut f: impl FnMut(&Shard) -> bool) {
        let tree = self.tree.read().unwrap();
        // The containing shard may begin before `start`.
        let first = match Self::find_locked(&tree, start) {
            Some(shard) => shard.start.clone(),
            None => return,
        };
        for (stored_start, shard) in tree.range(first..) {
            if !end.is_empty() && stored_start.as_slice() >= end {
                return;
            }
            if !f(shard) {
                return;
            }
        }
    }

    fn find_locked<'a>(tree: &'a BTreeMap<Vec<u8>, Shard>, key: &[u8]) -> Option<&'a Shard> {
        tree.range::<[u8], _>((std::ops::Bound::Unbounded, std::ops::Bound::Included(key)))
            .next_back()
            .map(|(_, shard)| shard)
            .filter(|shard| tessera_api::shard::belongs_to(shard, key))
    }
}

#[cfg(test)]
mod tests {
    use tessera_api::metapb::Epoch;

    use super::*;

    fn shard(id: u64, start: &[u8], end: &[u8]) -> Shard {
        Shard {
            id,
            start: start.to_vec(),
            end: end.to_vec(),
            epoch: Some(Epoch {
                generation: 1,
                config_ver: 1,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn update_deletes_overlapped_shards() {
        let tree = ShardTree::new();
        tree.update([shard(1, b"", b"")]);
        assert_eq!(tree.len(), 1);

        // A split replaces the parent with both children.
        tree.update([shard(2, b"", b"m"), shard(3, b"m", b"")]);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.search(b"a").unwrap().id, 2);
        assert_eq!(tree.search(b"m").unwrap().id, 3);
        assert_eq!(tree.search(b"z").unwrap().id, 3);
    }

    #[test]
    fn update_ignores_destroying_shards() {
        let tree = ShardTree::new();
        let mut s = shard(1, b"a", b"b");
        s.state = ShardState::Destroying as i32;
        tree.update([s.clone()]);
        assert!(tree.is_empty());

        s.state = ShardState::Destroyed as i32;
        tree.update([s]);
        assert!(tree.is_empty());
    }

    #[test]
    fn update_last_write_wins_on_equal_start() {
        let tree = ShardTree::new();
        tree.update([shard(1, b"a", b"c"), shard(2, b"a", b"c")]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.search(b"b").unwrap().id, 2);
    }

    #[test]
    fn search_misses_outside_ranges() {
        let tree = ShardTree::new();
        tree.update([shard(1, b"b", b"d")]);
        assert!(tree.search(b"a").is_none());
        assert_eq!(tree.search(b"b").unwrap().id, 1);
        assert_eq!(tree.search(b"c").unwrap().id, 1);
        assert!(tree.search(b"d").is_none());
    }

    #[test]
    fn remove_checks_shard_id() {
        let tree = ShardTree::new();
        tree.update([shard(1, b"a", b"c")]);

        assert!(!tree.remove(&shard(2, b"a", b"c")));
        assert_eq!(tree.len(), 1);

        assert!(tree.remove(&shard(1, b"a", b"c")));
        assert!(tree.is_empty());
    }

    #[test]
    fn next_shard_is_strictly_greater() {
        let tree = ShardTree::new();
        tree.update([shard(1, b"a", b"c"), shard(2, b"c", b"e"), shard(3, b"e", b"")]);

        assert_eq!(tree.next_shard(b"a").unwrap().id, 2);
        assert_eq!(tree.next_shard(b"c").unwrap().id, 3);
        assert!(tree.next_shard(b"e").is_none());
    }

    #[test]
    fn ascend_range_visits_intersecting_shards() {
        let tree = ShardTree::new();
        tree.update([shard(1, b"", b"c"), shard(2, b"c", b"e"), shard(3, b"e", b"")]);

        let mut seen = vec![];
        tree.ascend_range(b"b", b"f", |s| {
            seen.push(s.id);
            true
        });
        assert_eq!(seen, vec![1, 2, 3]);

        // Early stop.
        let mut seen = vec![];
        tree.ascend_range(b"", b"", |s| {
            seen.push(s.id);
            s.id < 2
        });
        assert_eq!(seen, vec![1, 2]);
    }
}
