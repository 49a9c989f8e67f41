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

//! The leader-side log compaction policy.

use crate::config::ReplicationConfig;

/// Decide whether the leader should propose a `CompactLog`, and up to which
/// index. `min_match` is the smallest match index across the group,
/// `raft_log_size_hint` the unreclaimed log size estimate.
///
/// A match index beyond the committed index breaks the raft invariant and
/// is fatal.
pub fn check_log_compact(
    cfg: &ReplicationConfig,
    first_index: u64,
    applied_index: u64,
    committed_index: u64,
    min_match: u64,
    raft_log_size_hint: u64,
) -> Option<u64> {
    if min_match > committed_index {
        panic!(
            "min match index {min_match} is beyond the committed index {committed_index}"
        );
    }
    if min_match < first_index {
        return None;
    }

    let retained = min_match - first_index;
    if retained > cfg.compact_threshold || cfg.force_compact_count <= retained {
        return Some(min_match);
    }
    if raft_log_size_hint >= cfg.force_compact_bytes {
        // Forced by size; take the latest applied entry when it sits below
        // the match watermark.
        return Some(applied_index.min(min_match));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(threshold: u64, force_count: u64, force_bytes: u64) -> ReplicationConfig {
        ReplicationConfig {
            compact_threshold: threshold,
            force_compact_count: force_count,
            force_compact_bytes: force_bytes,
            ..Default::default()
        }
    }

    #[test]
    fn compacts_to_min_match_at_the_count_threshold() {
        let decision = check_log_compact(&cfg(1, 1, u64::MAX), 100, 100, 200, 101, 0);
        assert_eq!(decision, Some(101));
    }

    #[test]
    fn force_by_bytes_picks_the_latest_applied() {
        let decision = check_log_compact(&cfg(1000, 1000, 1), 100, 100, 200, 101, 1);
        assert_eq!(decision, Some(100));
    }

    #[test]
    fn below_first_index_is_a_no_op() {
        let decision = check_log_compact(&cfg(1, 1, 1), 100, 100, 200, 99, 1 << 30);
        assert_eq!(decision, None);
    }

    #[test]
    fn no_compaction_below_all_thresholds() {
        let decision = check_log_compact(&cfg(1000, 1000, u64::MAX), 100, 150, 200, 150, 0);
        assert_eq!(decision, None);
    }

    #[test]
    #[should_panic(expected = "beyond the committed index")]
    fn match_beyond_committed_is_fatal() {
        check_log_compact(&cfg(1, 1, 1), 100, 100, 100, 101, 0);
    }
}
