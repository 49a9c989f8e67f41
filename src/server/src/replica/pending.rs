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

//! Proposals in flight between `propose` and apply. Owned exclusively by the
//! replica's event loop, so no locking is needed. Replies come back in
//! proposal order; acknowledging a batch stale-notifies everything proposed
//! before it.

use std::collections::VecDeque;

use tessera_api::{errorpb, rpcpb::AdminCmdType, rpcpb::ResponseBatch};

use super::proposal::Batch;

const STALE_CMD: &str = "stale command";

#[derive(Default)]
pub struct PendingProposals {
    cmds: VecDeque<Batch>,
    /// The at-most-one outstanding config change.
    conf_change_cmd: Option<Batch>,
}

impl PendingProposals {
    pub fn new() -> Self {
        PendingProposals::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty() && self.conf_change_cmd.is_none()
    }

    pub fn append(&mut self, cmd: Batch) {
        self.cmds.push_back(cmd);
    }

    pub fn pop(&mut self) -> Option<Batch> {
        self.cmds.pop_front()
    }

    /// Park the outstanding config-change batch. Only admin config-change
    /// batches may live here.
    pub fn set_config_change(&mut self, cmd: Batch) {
        if cmd.admin_cmd_type() != AdminCmdType::AdminConfigChange {
            panic!("BUG: only a config change batch may take the config change slot");
        }
        self.conf_change_cmd = Some(cmd);
    }

    #[inline]
    pub fn has_config_change(&self) -> bool {
        self.conf_change_cmd.is_some()
    }

    /// Answer the batch identified by `id`. For regular proposals, batches
    /// proposed earlier are acknowledged as stale first (their entries were
    /// superseded); the config-change slot is handled separately because it
    /// commits out of band with the normal queue.
    pub fn notify(&mut self, id: &[u8], resp: ResponseBatch, is_conf_change: bool) {
        if is_conf_change {
            if let Some(cmd) = self.conf_change_cmd.take() {
                if cmd.request_id() == id {
                    cmd.respond(resp);
                } else {
                    self.conf_change_cmd = Some(cmd);
                }
            }
            return;
        }

        let found = self.cmds.iter().any(|cmd| cmd.request_id() == id);
        if !found {
            return;
        }
        while let Some(cmd) = self.cmds.pop_front() {
            if cmd.request_id() == id {
                cmd.respond(resp);
                return;
            }
            Self::respond_stale(&cmd);
        }
    }

    /// Stale-notify everything; the replica lost leadership or the shard
    /// metadata moved on.
    pub fn clear(&mut self) {
        while let Some(cmd) = self.cmds.pop_front() {
            Self::respond_stale(&cmd);
        }
        if let Some(cmd) = self.conf_change_cmd.take() {
            Self::respond_stale(&cmd);
        }
    }

    /// The replica is going away; answer everything with `ShardNotFound`.
    pub fn close(&mut self, shard_id: u64) {
        while let Some(cmd) = self.cmds.pop_front() {
            cmd.respond_error(errorpb::Error::shard_not_found(shard_id));
        }
        if let Some(cmd) = self.conf_change_cmd.take() {
            cmd.respond_error(errorpb::Error::shard_not_found(shard_id));
        }
    }

    fn respond_stale(cmd: &Batch) {
        cmd.respond_error(errorpb::Error::message(STALE_CMD));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tessera_api::rpcpb::{CmdType, Request, RequestBatch};

    use super::super::proposal::{RequestKind, ResponseCb};
    use super::*;

    fn collecting_cb() -> (ResponseCb, Arc<Mutex<Vec<ResponseBatch>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cloned = seen.clone();
        let cb: ResponseCb = Arc::new(move |resp| cloned.lock().unwrap().push(resp));
        (cb, seen)
    }

    fn batch(cb: ResponseCb) -> Batch {
        let mut rb = RequestBatch::default();
        rb.header = Some(tessera_api::rpcpb::RequestBatchHeader {
            id: uuid::Uuid::new_v4().as_bytes().to_vec(),
            ..Default::default()
        });
        rb.requests.push(Request::default());
        Batch::new(rb, cb, RequestKind::Write, 0)
    }

    fn conf_change_batch(cb: ResponseCb) -> Batch {
        let mut rb = RequestBatch::default();
        rb.header = Some(tessera_api::rpcpb::RequestBatchHeader {
            id: uuid::Uuid::new_v4().as_bytes().to_vec(),
            ..Default::default()
        });
        rb.requests.push(Request {
            cmd_type: CmdType::Admin as i32,
            custom_type: AdminCmdType::AdminConfigChange as u64,
            ..Default::default()
        });
        Batch::new(rb, cb, RequestKind::Admin, 0)
    }

    #[test]
    fn append_and_pop_preserve_fifo() {
        let (cb, _) = collecting_cb();
        let mut p = PendingProposals::new();
        let b1 = batch(cb.clone());
        let b2 = batch(cb);
        let id1 = b1.request_id().to_vec();
        p.append(b1);
        p.append(b2);
        assert_eq!(p.len(), 2);
        assert_eq!(p.pop().unwrap().request_id(), id1.as_slice());
        assert_eq!(p.len(), 1);
    }

    #[test]
    #[should_panic(expected = "config change")]
    fn regular_cmd_rejected_in_config_change_slot() {
        let (cb, _) = collecting_cb();
        let mut p = PendingProposals::new();
        p.set_config_change(batch(cb));
    }

    #[test]
    fn notify_acknowledges_earlier_batches_as_stale() {
        let (stale_cb, stale_seen) = collecting_cb();
        let (cb, seen) = collecting_cb();
        let (untouched_cb, untouched_seen) = collecting_cb();

        let first = batch(stale_cb);
        let second = batch(cb);
        let third = batch(untouched_cb);
        let id = second.request_id().to_vec();

        let mut p = PendingProposals::new();
        p.append(first);
        p.append(second);
        p.append(third);

        let resp = ResponseBatch::with_error(
            id.clone(),
            &[Request::default()],
            errorpb::Error::shard_not_found(100),
        );
        p.notify(&id, resp, false);

        assert_eq!(stale_seen.lock().unwrap().len(), 1);
        assert_eq!(
            stale_seen.lock().unwrap()[0].responses[0]
                .error
                .as_ref()
                .unwrap()
                .message,
            STALE_CMD
        );
        assert!(seen.lock().unwrap()[0].responses[0]
            .error
            .as_ref()
            .unwrap()
            .shard_not_found
            .is_some());
        assert!(untouched_seen.lock().unwrap().is_empty());
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn notify_unknown_id_leaves_queue_untouched() {
        let (cb, seen) = collecting_cb();
        let mut p = PendingProposals::new();
        p.append(batch(cb));
        p.notify(b"missing", ResponseBatch::default(), false);
        assert_eq!(p.len(), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn notify_config_change_clears_the_slot() {
        let (cb, seen) = collecting_cb();
        let mut p = PendingProposals::new();
        let cmd = conf_change_batch(cb);
        let id = cmd.request_id().to_vec();
        p.set_config_change(cmd);

        p.notify(
            &id,
            ResponseBatch::with_responses(id.clone(), vec![Default::default()]),
            true,
        );
        assert!(!p.has_config_change());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn clear_reports_stale_and_close_reports_shard_not_found() {
        for close in [false, true] {
            let (cb, seen) = collecting_cb();
            let mut p = PendingProposals::new();
            p.append(batch(cb.clone()));
            p.append(batch(cb.clone()));
            p.set_config_change(conf_change_batch(cb));

            if close {
                p.close(100);
            } else {
                p.clear();
            }
            assert!(p.is_empty());

            let responses = seen.lock().unwrap();
            assert_eq!(responses.len(), 3);
            for resp in responses.iter() {
                let err = resp.responses[0].error.as_ref().unwrap();
                if close {
                    assert!(err.shard_not_found.is_some());
                } else {
                    assert_eq!(err.message, STALE_CMD);
                }
            }
        }
    }
}
