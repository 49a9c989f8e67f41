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

//! Key-range helpers over shard descriptors. Ranges are half-open
//! `[start, end)`; an empty `end` extends to the end of the key space.

use crate::metapb::Shard;

/// Whether `key` falls inside the shard's range.
pub fn belongs_to(shard: &Shard, key: &[u8]) -> bool {
    key >= shard.start.as_slice() && (shard.end.is_empty() || key < shard.end.as_slice())
}

/// Whether the ranges of `a` and `b` intersect.
pub fn overlaps(a: &Shard, b: &Shard) -> bool {
    let a_before_b = !a.end.is_empty() && a.end.as_slice() <= b.start.as_slice();
    let b_before_a = !b.end.is_empty() && b.end.as_slice() <= a.start.as_slice();
    !(a_before_b || b_before_a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(start: &[u8], end: &[u8]) -> Shard {
        Shard {
            start: start.to_vec(),
            end: end.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn belongs_to_half_open_range() {
        let s = shard(b"b", b"d");
        assert!(!belongs_to(&s, b"a"));
        assert!(belongs_to(&s, b"b"));
        assert!(belongs_to(&s, b"c"));
        assert!(!belongs_to(&s, b"d"));

        let unbounded = shard(b"b", b"");
        assert!(belongs_to(&unbounded, b"zzzz"));
        assert!(!belongs_to(&unbounded, b"a"));
    }

    #[test]
    fn overlap_with_infinite_end() {
        assert!(overlaps(&shard(b"a", b""), &shard(b"z", b"")));
        assert!(overlaps(&shard(b"a", b"m"), &shard(b"l", b"z")));
        assert!(!overlaps(&shard(b"a", b"m"), &shard(b"m", b"z")));
        assert!(overlaps(&shard(b"", b""), &shard(b"q", b"r")));
    }
}
