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

//! Read-index reads. Batched reads wait for raft's read state, then for the
//! applied index to reach it, before executing against the state machine.

use std::collections::HashMap;

use raft::ReadState;

use super::proposal::Batch;

/// The reads admitted to the leader but not yet released for execution.
/// Keyed by the batch header id, which doubles as the read-index context.
#[derive(Default)]
pub struct ReadIndexQueue {
    pending: HashMap<Vec<u8>, Batch>,
    /// Read states raft has confirmed, waiting for apply to catch up.
    ready: Vec<(u64, Vec<u8>)>,
}

impl ReadIndexQueue {
    pub fn new() -> Self {
        ReadIndexQueue::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty()
    }

    /// Park `batch` and return the context to submit with `MsgReadIndex`.
    pub fn append(&mut self, batch: Batch) -> Vec<u8> {
        let ctx = batch.request_id().to_vec();
        self.pending.insert(ctx.clone(), batch);
        ctx
    }

    /// Record read states confirmed by raft.
    pub fn ready(&mut self, read_states: Vec<ReadState>) {
        for rs in read_states {
            if self.pending.contains_key(&rs.request_ctx) {
                self.ready.push((rs.index, rs.request_ctx));
            }
        }
    }

    /// Release every read whose index is covered by `applied_index`.
    pub fn process(&mut self, applied_index: u64, mut exec: impl FnMut(Batch)) {
        if self.ready.is_empty() {
            return;
        }
        let mut remaining = Vec::with_capacity(self.ready.len());
        for (index, ctx) in self.ready.drain(..) {
            if index <= applied_index {
                if let Some(batch) = self.pending.remove(&ctx) {
                    exec(batch);
                }
            } else {
                remaining.push((index, ctx));
            }
        }
        self.ready = remaining;
    }

    /// Drop everything, answering with `f`.
    pub fn close(&mut self, mut f: impl FnMut(Batch)) {
        self.ready.clear();
        for (_, batch) in self.pending.drain() {
            f(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tessera_api::rpcpb::{CmdType, Request, RequestBatch, RequestBatchHeader};

    use super::super::proposal::{RequestKind, ResponseCb};
    use super::*;

    fn read_batch() -> Batch {
        let cb: ResponseCb = Arc::new(|_| {});
        let mut rb = RequestBatch::default();
        rb.header = Some(RequestBatchHeader {
            id: uuid::Uuid::new_v4().as_bytes().to_vec(),
            ..Default::default()
        });
        rb.requests.push(Request {
            cmd_type: CmdType::Read as i32,
            ..Default::default()
        });
        Batch::new(rb, cb, RequestKind::Read, 0)
    }

    fn read_state(index: u64, ctx: &[u8]) -> ReadState {
        ReadState {
            index,
            request_ctx: ctx.to_vec(),
        }
    }

    #[test]
    fn reads_wait_for_apply_to_reach_read_index() {
        let mut q = ReadIndexQueue::new();
        let ctx = q.append(read_batch());
        q.ready(vec![read_state(5, &ctx)]);

        let executed = Arc::new(Mutex::new(0));
        let counter = executed.clone();
        q.process(4, |_| *counter.lock().unwrap() += 1);
        assert_eq!(*executed.lock().unwrap(), 0);

        let counter = executed.clone();
        q.process(5, |_| *counter.lock().unwrap() += 1);
        assert_eq!(*executed.lock().unwrap(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn unknown_read_states_are_ignored() {
        let mut q = ReadIndexQueue::new();
        q.ready(vec![read_state(5, b"unknown")]);
        assert!(q.is_empty());
    }

    #[test]
    fn close_drains_pending_reads() {
        let mut q = ReadIndexQueue::new();
        q.append(read_batch());
        q.append(read_batch());
        let mut n = 0;
        q.close(|_| n += 1);
        assert_eq!(n, 2);
        assert!(q.is_empty());
    }
}
