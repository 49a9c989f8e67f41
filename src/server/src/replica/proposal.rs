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

//! Client requests entering a replica are merged into proposal batches:
//! one raft log entry carries many compatible requests.

use std::{collections::VecDeque, sync::Arc};

use tessera_api::{
    errorpb,
    metapb::Replica,
    rpcpb::{AdminCmdType, CmdType, Request, RequestBatch, ResponseBatch},
};

/// Invoked with the response batch of a proposal; shared because stale
/// notifications and the final response may both fire.
pub type ResponseCb = Arc<dyn Fn(ResponseBatch) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
    Admin,
}

/// A classified request waiting to join a proposal batch.
pub struct ReqCtx {
    pub kind: RequestKind,
    pub req: Request,
    pub cb: ResponseCb,
}

impl ReqCtx {
    pub fn new(req: Request, cb: ResponseCb) -> Self {
        let kind = match req.request_type() {
            CmdType::Read => RequestKind::Read,
            CmdType::Write | CmdType::Txn => RequestKind::Write,
            CmdType::Admin => RequestKind::Admin,
        };
        ReqCtx { kind, req, cb }
    }
}

/// How a popped batch is submitted to raft.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    ReadIndex,
    ProposalNormal,
    ProposalConfigChange,
    RequestTransferLeader,
}

/// A group of requests proposed as one log entry, plus its callback.
#[derive(Clone)]
pub struct Batch {
    pub request_batch: RequestBatch,
    pub cb: ResponseCb,
    pub kind: RequestKind,
    pub byte_size: usize,
}

impl Batch {
    pub fn new(request_batch: RequestBatch, cb: ResponseCb, kind: RequestKind, size: usize) -> Self {
        Batch {
            request_batch,
            cb,
            kind,
            byte_size: size,
        }
    }

    #[inline]
    pub fn request_id(&self) -> &[u8] {
        self.request_batch.header_id()
    }

    #[inline]
    pub fn is_admin(&self) -> bool {
        self.request_batch.is_admin()
    }

    #[inline]
    pub fn admin_cmd_type(&self) -> AdminCmdType {
        self.request_batch.admin_cmd_type()
    }

    fn is_full(&self, next: usize, max: usize) -> bool {
        max > 0 && self.byte_size + next > max
    }

    /// Requests may share a batch only with compatible epochs: either both
    /// sides skip the epoch check, or the epochs are identical.
    fn can_batch(&self, req: &Request) -> bool {
        match self.request_batch.requests.first() {
            None => true,
            Some(first) => {
                if first.ignore_epoch_check && req.ignore_epoch_check {
                    true
                } else if first.ignore_epoch_check != req.ignore_epoch_check {
                    false
                } else {
                    first.epoch() == req.epoch()
                }
            }
        }
    }

    /// Answer every request of this batch with `err`.
    pub fn respond_error(&self, err: errorpb::Error) {
        let resp = ResponseBatch::with_error(
            self.request_batch.header_id().to_vec(),
            &self.request_batch.requests,
            err,
        );
        (self.cb)(resp);
    }

    pub fn respond(&self, resp: ResponseBatch) {
        (self.cb)(resp);
    }

    /// The request type driving how this batch enters raft. A batch mixing
    /// read and write kinds is a programming error.
    pub fn request_type(&self) -> RequestType {
        if self.request_batch.is_admin() {
            return match self.request_batch.admin_cmd_type() {
                AdminCmdType::AdminConfigChange => RequestType::ProposalConfigChange,
                AdminCmdType::AdminTransferLeader => RequestType::RequestTransferLeader,
                _ => RequestType::ProposalNormal,
            };
        }

        let mut has_read = false;
        let mut has_write = false;
        for req in &self.request_batch.requests {
            match req.request_type() {
                CmdType::Read => has_read = true,
                _ => has_write = true,
            }
        }
        if has_read && has_write {
            panic!("BUG: a batch mixes read and write requests");
        }
        if has_read {
            RequestType::ReadIndex
        } else {
            RequestType::ProposalNormal
        }
    }
}

/// Merges incoming requests into open batches. Admin requests always form
/// singleton batches; others append to the newest compatible batch of the
/// same kind while the size cap allows.
pub struct ProposalBatch {
    max_size: usize,
    shard_id: u64,
    replica: Replica,
    batches: VecDeque<Batch>,
}

impl ProposalBatch {
    pub fn new(max_size: usize, shard_id: u64, replica: Replica) -> Self {
        ProposalBatch {
            max_size,
            shard_id,
            replica,
            batches: VecDeque::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn push(&mut self, ctx: ReqCtx) {
        use prost::Message;

        let size = ctx.req.encoded_len();
        let is_admin = ctx.kind == RequestKind::Admin;

        if !is_admin {
            for batch in self.batches.iter_mut() {
                if batch.kind == ctx.kind
                    && !batch.is_full(size, self.max_size)
                    && batch.can_batch(&ctx.req)
                {
                    batch.request_batch.requests.push(ctx.req);
                    batch.byte_size += size;
                    return;
                }
            }
        }

        let mut rb = RequestBatch::with_header(
            uuid::Uuid::new_v4().as_bytes().to_vec(),
            self.shard_id,
            self.replica.clone(),
        );
        rb.requests.push(ctx.req);
        self.batches.push_back(Batch::new(rb, ctx.cb, ctx.kind, size));
    }

    pub fn pop(&mut self) -> Option<Batch> {
        self.batches.pop_front()
    }

    /// Drain the queue answering everything with `StoreNotMatch`; the
    /// requests never reached raft on this store.
    pub fn close(&mut self, store_id: u64) {
        while let Some(batch) = self.pop() {
            batch.respond_error(errorpb::Error::store_not_match(0, store_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tessera_api::metapb::{Epoch, ReplicaRole};

    use super::*;

    fn nop_cb() -> ResponseCb {
        Arc::new(|_| {})
    }

    fn request(kind: CmdType, epoch: Epoch, payload_len: usize) -> Request {
        Request {
            id: uuid::Uuid::new_v4().as_bytes().to_vec(),
            cmd_type: kind as i32,
            epoch: Some(epoch),
            cmd: vec![0; payload_len],
            ..Default::default()
        }
    }

    fn epoch(generation: u64, config_ver: u64) -> Epoch {
        Epoch {
            generation,
            config_ver,
        }
    }

    fn proposal_batch(max_size: usize) -> ProposalBatch {
        ProposalBatch::new(max_size, 1, Replica::new(1, 1, ReplicaRole::Voter))
    }

    #[test]
    fn same_kind_requests_merge() {
        let mut pb = proposal_batch(1 << 20);
        pb.push(ReqCtx::new(request(CmdType::Write, epoch(1, 1), 8), nop_cb()));
        pb.push(ReqCtx::new(request(CmdType::Write, epoch(1, 1), 8), nop_cb()));
        assert_eq!(pb.len(), 1);
        assert_eq!(pb.pop().unwrap().request_batch.requests.len(), 2);
    }

    #[test]
    fn different_kinds_never_merge() {
        let mut pb = proposal_batch(1 << 20);
        pb.push(ReqCtx::new(request(CmdType::Write, epoch(1, 1), 8), nop_cb()));
        pb.push(ReqCtx::new(request(CmdType::Read, epoch(1, 1), 8), nop_cb()));
        assert_eq!(pb.len(), 2);
    }

    #[test]
    fn size_cap_opens_a_new_batch() {
        let mut pb = proposal_batch(64);
        pb.push(ReqCtx::new(request(CmdType::Write, epoch(1, 1), 40), nop_cb()));
        pb.push(ReqCtx::new(request(CmdType::Write, epoch(1, 1), 40), nop_cb()));
        assert_eq!(pb.len(), 2);
    }

    #[test]
    fn mismatched_epochs_never_merge() {
        let mut pb = proposal_batch(1 << 20);
        pb.push(ReqCtx::new(request(CmdType::Write, epoch(1, 1), 8), nop_cb()));
        pb.push(ReqCtx::new(request(CmdType::Write, epoch(2, 1), 8), nop_cb()));
        assert_eq!(pb.len(), 2);
    }

    #[test]
    fn ignore_epoch_check_must_match_on_both_sides() {
        let mut pb = proposal_batch(1 << 20);
        let mut a = request(CmdType::Write, epoch(1, 1), 8);
        a.ignore_epoch_check = true;
        let mut b = request(CmdType::Write, epoch(9, 9), 8);
        b.ignore_epoch_check = true;
        pb.push(ReqCtx::new(a, nop_cb()));
        pb.push(ReqCtx::new(b, nop_cb()));
        assert_eq!(pb.len(), 1);

        let c = request(CmdType::Write, epoch(1, 1), 8);
        pb.push(ReqCtx::new(c, nop_cb()));
        assert_eq!(pb.len(), 2);
    }

    #[test]
    fn admin_requests_form_singleton_batches() {
        let mut pb = proposal_batch(1 << 20);
        let mut admin = request(CmdType::Admin, epoch(1, 1), 8);
        admin.custom_type = AdminCmdType::AdminCompactLog as u64;
        pb.push(ReqCtx::new(admin.clone(), nop_cb()));
        pb.push(ReqCtx::new(admin, nop_cb()));
        assert_eq!(pb.len(), 2);
    }

    #[test]
    fn close_answers_store_not_match() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cloned = seen.clone();
        let cb: ResponseCb = Arc::new(move |resp: ResponseBatch| {
            cloned.lock().unwrap().push(resp);
        });

        let mut pb = proposal_batch(1 << 20);
        pb.push(ReqCtx {
            kind: RequestKind::Write,
            req: request(CmdType::Write, epoch(1, 1), 8),
            cb,
        });
        pb.close(7);
        assert!(pb.is_empty());

        let responses = seen.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].responses[0]
            .error
            .as_ref()
            .unwrap()
            .store_not_match
            .is_some());
    }

    #[test]
    fn request_typing() {
        let admin = |ct: AdminCmdType| {
            let mut req = request(CmdType::Admin, epoch(1, 1), 0);
            req.custom_type = ct as u64;
            let mut rb = RequestBatch::default();
            rb.requests.push(req);
            Batch::new(rb, nop_cb(), RequestKind::Admin, 0)
        };
        assert_eq!(
            admin(AdminCmdType::AdminConfigChange).request_type(),
            RequestType::ProposalConfigChange
        );
        assert_eq!(
            admin(AdminCmdType::AdminTransferLeader).request_type(),
            RequestType::RequestTransferLeader
        );
        assert_eq!(
            admin(AdminCmdType::AdminBatchSplit).request_type(),
            RequestType::ProposalNormal
        );
        assert_eq!(
            admin(AdminCmdType::AdminCompactLog).request_type(),
            RequestType::ProposalNormal
        );

        let mut rb = RequestBatch::default();
        rb.requests.push(request(CmdType::Write, epoch(1, 1), 0));
        assert_eq!(
            Batch::new(rb, nop_cb(), RequestKind::Write, 0).request_type(),
            RequestType::ProposalNormal
        );

        let mut rb = RequestBatch::default();
        rb.requests.push(request(CmdType::Read, epoch(1, 1), 0));
        assert_eq!(
            Batch::new(rb, nop_cb(), RequestKind::Read, 0).request_type(),
            RequestType::ReadIndex
        );
    }

    #[test]
    #[should_panic(expected = "mixes read and write")]
    fn mixed_read_write_batch_panics() {
        let mut rb = RequestBatch::default();
        rb.requests.push(request(CmdType::Write, epoch(1, 1), 0));
        rb.requests.push(request(CmdType::Read, epoch(1, 1), 0));
        Batch::new(rb, nop_cb(), RequestKind::Write, 0).request_type();
    }
}
