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

//! The tessera client: builds requests, tracks them in flight, and plugs
//! into the shards proxy as its retry controller.

mod future;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use prost::Message;
use tessera_api::{
    metapb::Label,
    rpcpb::{
        AdminCmdType, CmdType, Range, ReplicaSelectPolicy, Request, Response, TxnBatchRequest,
        UpdateLabelsRequest,
    },
};
use tessera_server::{Error, Result, RetryController, Router, ShardsProxy};
use tokio::{sync::oneshot, time::Instant};
use tracing::debug;

use self::future::{FutureReply, ReplySender};
pub use self::future::Future;

/// Per-request routing options.
pub enum RequestOption {
    /// Execute against this shard group's key space.
    ShardGroup(u64),
    /// Route by this key.
    RouteKey(Vec<u8>),
    /// The key range `[from, to)` the request touches; lets callers
    /// re-split after shard boundaries move.
    KeysRange(Vec<u8>, Vec<u8>),
    /// Route to this exact shard instead of by key.
    ToShard(u64),
    /// How the router picks the serving replica.
    SelectPolicy(ReplicaSelectPolicy),
    /// Skip the epoch staleness check on apply.
    IgnoreEpochCheck,
}

struct Inflight {
    req: Request,
    stop_at: i64,
    tx: Option<ReplySender>,
}

struct ClientInner {
    proxy: ShardsProxy,
    inflights: RwLock<HashMap<Vec<u8>, Inflight>>,
}

/// A cube of requests over one shards proxy. Cloning shares the in-flight
/// table.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Wire a client to `proxy`; the client becomes the proxy's response
    /// sink and retry controller.
    pub fn new(proxy: ShardsProxy) -> Client {
        let client = Client {
            inner: Arc::new(ClientInner {
                proxy,
                inflights: RwLock::new(HashMap::new()),
            }),
        };

        let success = client.clone();
        let failure = client.clone();
        client.inner.proxy.set_callback(
            Arc::new(move |resp| success.done(resp)),
            Arc::new(move |id, err| failure.done_error(id, err)),
        );
        client
            .inner
            .proxy
            .set_retry_controller(Arc::new(client.clone()));
        client
    }

    pub fn router(&self) -> &Router {
        self.inner.proxy.router()
    }

    /// Submit a write; the response carries the command's value.
    pub fn write(
        &self,
        timeout: Duration,
        custom_type: u64,
        payload: Vec<u8>,
        opts: Vec<RequestOption>,
    ) -> Future {
        self.exec(CmdType::Write, custom_type, payload, None, timeout, opts)
    }

    pub fn read(
        &self,
        timeout: Duration,
        custom_type: u64,
        payload: Vec<u8>,
        opts: Vec<RequestOption>,
    ) -> Future {
        self.exec(CmdType::Read, custom_type, payload, None, timeout, opts)
    }

    pub fn admin(
        &self,
        timeout: Duration,
        custom_type: u64,
        payload: Vec<u8>,
        opts: Vec<RequestOption>,
    ) -> Future {
        self.exec(CmdType::Admin, custom_type, payload, None, timeout, opts)
    }

    /// Submit an opaque transaction batch.
    pub fn txn(
        &self,
        timeout: Duration,
        request: TxnBatchRequest,
        opts: Vec<RequestOption>,
    ) -> Future {
        self.exec(CmdType::Txn, 0, Vec::new(), Some(request), timeout, opts)
    }

    /// Attach a label to a shard through the admin pipeline.
    pub fn add_label_to_shard(
        &self,
        timeout: Duration,
        name: impl Into<String>,
        value: impl Into<String>,
        shard: u64,
    ) -> Future {
        let payload = UpdateLabelsRequest {
            labels: vec![Label {
                key: name.into(),
                value: value.into(),
            }],
            policy: tessera_api::rpcpb::LabelPolicy::Add as i32,
        }
        .encode_to_vec();
        self.admin(
            timeout,
            AdminCmdType::AdminUpdateLabels as u64,
            payload,
            vec![RequestOption::ToShard(shard)],
        )
    }

    fn exec(
        &self,
        cmd_type: CmdType,
        custom_type: u64,
        payload: Vec<u8>,
        txn_request: Option<TxnBatchRequest>,
        timeout: Duration,
        opts: Vec<RequestOption>,
    ) -> Future {
        if timeout.is_zero() {
            panic!("client requests must carry a deadline");
        }

        let mut req = Request {
            id: uuid::Uuid::new_v4().as_bytes().to_vec(),
            cmd_type: cmd_type as i32,
            custom_type,
            cmd: payload,
            txn_batch_request: txn_request,
            stop_at: unix_now() + timeout.as_secs().max(1) as i64,
            ..Default::default()
        };
        for opt in opts {
            match opt {
                RequestOption::ShardGroup(group) => req.group = group,
                RequestOption::RouteKey(key) => req.key = key,
                RequestOption::KeysRange(from, to) => req.keys_range = Some(Range { from, to }),
                RequestOption::ToShard(shard) => req.to_shard = shard,
                RequestOption::SelectPolicy(policy) => req.replica_select_policy = policy as i32,
                RequestOption::IgnoreEpochCheck => req.ignore_epoch_check = true,
            }
        }
        if !req.key.is_empty() && req.to_shard > 0 {
            panic!("route with key and route with shard cannot be set at the same time");
        }

        debug!(id = ?req.id, "begin to send request");
        let (tx, rx) = oneshot::channel();
        {
            let mut inflights = self.inner.inflights.write().unwrap();
            inflights.insert(
                req.id.clone(),
                Inflight {
                    req: req.clone(),
                    stop_at: req.stop_at,
                    tx: Some(tx),
                },
            );
        }

        let closer_client = self.clone();
        let future = Future::new(
            req.id.clone(),
            Instant::now() + timeout,
            rx,
            Box::new(move |id| {
                closer_client.remove_inflight(id);
            }),
        );

        if let Err(err) = self.inner.proxy.dispatch(req.clone()) {
            self.done_error(&req.id, err);
        }
        future
    }

    fn remove_inflight(&self, id: &[u8]) {
        self.inner.inflights.write().unwrap().remove(id);
    }

    /// Response demultiplexer; unknown ids are responses that arrived after
    /// their caller gave up.
    fn done(&self, resp: Response) {
        let mut inflights = self.inner.inflights.write().unwrap();
        let Some(mut slot) = inflights.remove(&resp.id) else {
            debug!(id = ?resp.id, "response skipped, missing ctx");
            return;
        };
        if let Some(tx) = slot.tx.take() {
            tx.send(Ok(FutureReply {
                value: resp.value,
                txn_response: resp.txn_batch_response,
            }))
            .unwrap_or_default();
        }
    }

    fn done_error(&self, id: &[u8], err: Error) {
        let mut inflights = self.inner.inflights.write().unwrap();
        let Some(mut slot) = inflights.remove(id) else {
            return;
        };
        if let Some(tx) = slot.tx.take() {
            tx.send(Err(err)).unwrap_or_default();
        }
    }

}

impl RetryController for Client {
    /// The proxy asks before re-dispatching: hand back the request while
    /// the caller's deadline still stands.
    fn retry(&self, request_id: &[u8]) -> Option<Request> {
        let inflights = self.inner.inflights.read().unwrap();
        let slot = inflights.get(request_id)?;
        if unix_now() >= slot.stop_at {
            return None;
        }
        Some(slot.req.clone())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
