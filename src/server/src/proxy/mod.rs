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

//! The shards proxy: routes each request to the owning shard's leader
//! store, classifies response errors, repairs routes and retries while the
//! caller's deadline allows.

pub mod backend;
pub mod rpc;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tessera_api::{
    errorpb,
    metapb::Shard,
    rpcpb::{Request, Response, ResponseBatch},
};
use tracing::debug;

pub use self::backend::{Backend, BackendFactory, DefaultBackendFactory};
pub use self::rpc::ProxyRpc;
use crate::{router::Router, Error, Result};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Invoked with every successfully completed response.
pub type SuccessCallback = Arc<dyn Fn(Response) + Send + Sync>;

/// Invoked with the request id and the terminal error.
pub type FailureCallback = Arc<dyn Fn(&[u8], Error) + Send + Sync>;

/// Decides whether an in-flight request is still worth retrying; the client
/// implements this over its in-flight table.
pub trait RetryController: Send + Sync {
    /// The request to re-dispatch, or `None` to give up.
    fn retry(&self, request_id: &[u8]) -> Option<Request>;
}

struct ProxyInner {
    router: Router,
    factory: Box<dyn BackendFactory>,
    retry_interval: Duration,
    backends: RwLock<HashMap<String, Arc<dyn Backend>>>,
    success_cb: RwLock<Option<SuccessCallback>>,
    failure_cb: RwLock<Option<FailureCallback>>,
    retry_controller: RwLock<Option<Arc<dyn RetryController>>>,
    rpc: RwLock<Option<Arc<ProxyRpc>>>,
    stopped: AtomicBool,
}

/// Dispatches requests to store backends and demultiplexes the responses.
#[derive(Clone)]
pub struct ShardsProxy {
    inner: Arc<ProxyInner>,
}

impl ShardsProxy {
    pub fn new(router: Router, factory: Box<dyn BackendFactory>) -> Self {
        Self::with_retry_interval(router, factory, DEFAULT_RETRY_INTERVAL)
    }

    pub fn with_retry_interval(
        router: Router,
        factory: Box<dyn BackendFactory>,
        retry_interval: Duration,
    ) -> Self {
        ShardsProxy {
            inner: Arc::new(ProxyInner {
                router,
                factory,
                retry_interval,
                backends: RwLock::new(HashMap::new()),
                success_cb: RwLock::new(None),
                failure_cb: RwLock::new(None),
                retry_controller: RwLock::new(None),
                rpc: RwLock::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_callback(&self, success: SuccessCallback, failure: FailureCallback) {
        *self.inner.success_cb.write().unwrap() = Some(success);
        *self.inner.failure_cb.write().unwrap() = Some(failure);
    }

    pub fn set_retry_controller(&self, controller: Arc<dyn RetryController>) {
        *self.inner.retry_controller.write().unwrap() = Some(controller);
    }

    pub fn set_rpc(&self, rpc: Arc<ProxyRpc>) {
        *self.inner.rpc.write().unwrap() = Some(rpc);
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut backends = self.inner.backends.write().unwrap();
        for (_, backend) in backends.drain() {
            backend.close();
        }
    }

    /// Route `req` by its `to_shard` hint or by `(group, key)` and forward
    /// it to the selected replica's store.
    pub fn dispatch(&self, req: Request) -> Result<()> {
        if req.to_shard == 0 {
            let (shard, store) =
                self.inner
                    .router
                    .select_shard_with_policy(req.group, &req.key, req.select_policy());
            return self.dispatch_to(req, shard, &store.client_address);
        }

        let shard = self.inner.router.get_shard(req.to_shard);
        let store = self
            .inner
            .router
            .select_replica_store_with_policy(req.to_shard, req.select_policy());
        self.dispatch_to(req, shard, &store.client_address)
    }

    /// As `dispatch`, with a caller-chosen target.
    pub fn dispatch_to(&self, mut req: Request, shard: Shard, addr: &str) -> Result<()> {
        debug!(id = ?req.id, to_shard = shard.id, to_store = addr, "dispatch request");

        // No leader yet; wait out a leader election tick and retry.
        if addr.is_empty() {
            self.retry_dispatch(&req.id.clone(), "dispatch to empty store");
            return Ok(());
        }

        req.epoch = Some(shard.epoch());
        self.forward_to_backend(req, addr)
    }

    fn forward_to_backend(&self, req: Request, addr: &str) -> Result<()> {
        let backend = match self.get_backend(addr) {
            Some(backend) => backend,
            None => {
                if self.inner.stopped.load(Ordering::Acquire) {
                    return Err(Error::Stopped);
                }
                self.create_backend(addr)?
            }
        };

        let id = req.id.clone();
        match backend.dispatch(req) {
            Ok(()) => Ok(()),
            Err(err @ (Error::TryAgain { .. } | Error::ServiceIsBusy(_))) => {
                // The backend is reconnecting or saturated; both heal with
                // time, so take the retry path.
                self.retry_dispatch(&id, &err.to_string());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn get_backend(&self, addr: &str) -> Option<Arc<dyn Backend>> {
        self.inner.backends.read().unwrap().get(addr).cloned()
    }

    /// Backend creation is single-flighted under the write lock.
    fn create_backend(&self, addr: &str) -> Result<Arc<dyn Backend>> {
        let mut backends = self.inner.backends.write().unwrap();
        if let Some(backend) = backends.get(addr) {
            return Ok(backend.clone());
        }

        let this = self.clone();
        let success: SuccessCallback = Arc::new(move |resp| this.done(resp));
        let this = self.clone();
        let failure: FailureCallback = Arc::new(move |id, err| this.done_with_error(id, err));
        let backend = self.inner.factory.create(addr, success, failure)?;
        backends.insert(addr.to_string(), backend.clone());
        Ok(backend)
    }

    /// Demultiplex a response batch: responses bound to an RPC session go
    /// back over it, the rest complete local callers.
    pub fn on_response(&self, batch: ResponseBatch) {
        let header_error = batch.header_error().cloned();
        let rpc = self.inner.rpc.read().unwrap().clone();
        for mut resp in batch.responses {
            if resp.error.is_none() {
                resp.error = header_error.clone();
            }
            match &rpc {
                Some(rpc) if resp.pid != 0 => rpc.on_response(resp),
                _ => self.done(resp),
            }
        }
    }

    /// Classify one response: success, terminal failure, or repair-and-
    /// retry.
    fn done(&self, resp: Response) {
        let Some(err) = resp.error.clone() else {
            self.call_success(resp);
            return;
        };

        if !err.retryable() {
            self.call_failure(&resp.id, err.into());
            return;
        }

        self.adjust_route(&err);
        self.retry_dispatch(&resp.id, &err.message);
    }

    fn done_with_error(&self, request_id: &[u8], err: Error) {
        if err.retryable() {
            self.retry_dispatch(request_id, &err.to_string());
        } else {
            self.call_failure(request_id, err);
        }
    }

    /// Route repair from response hints: a `NotLeader` names the new
    /// leader.
    fn adjust_route(&self, err: &errorpb::Error) {
        if let Some(not_leader) = &err.not_leader {
            if let Some(leader) = &not_leader.leader {
                self.inner
                    .router
                    .update_leader(not_leader.shard_id, leader.id);
            }
        }
    }

    /// Consult the retry controller, honor the request deadline, and
    /// reschedule the dispatch after the retry interval.
    fn retry_dispatch(&self, request_id: &[u8], cause: &str) {
        let controller = self.inner.retry_controller.read().unwrap().clone();
        let Some(controller) = controller else {
            debug!(id = ?request_id, cause, "request failed with no retry controller");
            self.call_failure(request_id, Error::InvalidData(cause.to_string()));
            return;
        };

        let Some(req) = controller.retry(request_id) else {
            debug!(id = ?request_id, cause, "request failed, retry declined");
            self.call_failure(request_id, Error::Timeout(cause.to_string()));
            return;
        };

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        if req.stop_at != 0 && now >= req.stop_at {
            self.call_failure(request_id, Error::Timeout(cause.to_string()));
            return;
        }

        debug!(id = ?request_id, cause, "request failed, retry later");
        let this = self.clone();
        let retry_interval = self.inner.retry_interval;
        tokio::spawn(async move {
            tokio::time::sleep(retry_interval).await;
            if this.inner.stopped.load(Ordering::Acquire) {
                return;
            }
            let id = req.id.clone();
            if let Err(err) = this.dispatch(req) {
                this.call_failure(&id, err);
            }
        });
    }

    fn call_success(&self, resp: Response) {
        if let Some(cb) = self.inner.success_cb.read().unwrap().as_ref() {
            cb(resp);
        }
    }

    fn call_failure(&self, request_id: &[u8], err: Error) {
        if let Some(cb) = self.inner.failure_cb.read().unwrap().as_ref() {
            cb(request_id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tessera_api::metapb::{Epoch, Replica, ReplicaRole, Store};
    use tessera_api::rpcpb::{CmdType, EventNotify};

    use super::*;

    /// A backend that answers through a programmable handler, like the
    /// upstream mock.
    struct MockBackend {
        handler: Box<dyn Fn(Request) -> Option<ResponseBatch> + Send + Sync>,
        proxy: ShardsProxy,
    }

    impl Backend for MockBackend {
        fn dispatch(&self, mut req: Request) -> Result<()> {
            req.pid = 0;
            if let Some(resp) = (self.handler)(req) {
                self.proxy.on_response(resp);
            }
            Ok(())
        }

        fn close(&self) {}
    }

    struct MockBackendFactory {
        proxy: Arc<Mutex<Option<ShardsProxy>>>,
        handler: Arc<dyn Fn(Request) -> Option<ResponseBatch> + Send + Sync>,
    }

    impl BackendFactory for MockBackendFactory {
        fn create(
            &self,
            _addr: &str,
            _success: SuccessCallback,
            _failure: FailureCallback,
        ) -> Result<Arc<dyn Backend>> {
            let handler = self.handler.clone();
            let proxy = self.proxy.lock().unwrap().clone().unwrap();
            Ok(Arc::new(MockBackend {
                handler: Box::new(move |req| handler(req)),
                proxy,
            }))
        }
    }

    struct AlwaysRetry {
        req: Mutex<Option<Request>>,
    }

    impl RetryController for AlwaysRetry {
        fn retry(&self, _request_id: &[u8]) -> Option<Request> {
            self.req.lock().unwrap().clone()
        }
    }

    fn routed_proxy(
        handler: Arc<dyn Fn(Request) -> Option<ResponseBatch> + Send + Sync>,
    ) -> ShardsProxy {
        let router = Router::new_for_test();
        router.handle_event(EventNotify::store(Store {
            id: 1,
            client_address: "127.0.0.1:20001".into(),
            ..Default::default()
        }));
        router.handle_event(EventNotify::shard(
            Shard {
                id: 1,
                group: 0,
                epoch: Some(Epoch {
                    generation: 1,
                    config_ver: 1,
                }),
                replicas: vec![Replica::new(11, 1, ReplicaRole::Voter)],
                ..Default::default()
            },
            11,
            false,
            false,
        ));

        // The factory needs the proxy to close the response loop; it is
        // injected after construction through the shared slot.
        let proxy_slot = Arc::new(Mutex::new(None));
        let factory = Box::new(MockBackendFactory {
            proxy: proxy_slot.clone(),
            handler,
        });
        let proxy = ShardsProxy::with_retry_interval(router, factory, Duration::from_millis(10));
        proxy_slot.lock().unwrap().replace(proxy.clone());
        proxy
    }

    fn request(id: &[u8]) -> Request {
        Request {
            id: id.to_vec(),
            group: 0,
            cmd_type: CmdType::Write as i32,
            key: b"k".to_vec(),
            stop_at: i64::MAX,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dispatch_stamps_the_routed_epoch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cloned = seen.clone();
        let proxy = routed_proxy(Arc::new(move |req: Request| {
            cloned.lock().unwrap().push(req.clone());
            Some(ResponseBatch::with_responses(
                vec![],
                vec![Response {
                    id: req.id,
                    ..Default::default()
                }],
            ))
        }));

        let done = Arc::new(Mutex::new(Vec::new()));
        let cloned_done = done.clone();
        proxy.set_callback(
            Arc::new(move |resp| cloned_done.lock().unwrap().push(resp)),
            Arc::new(|_, _| {}),
        );

        proxy.dispatch(request(b"r1")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = seen.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].epoch.unwrap().generation, 1);
        assert_eq!(done.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn not_leader_repairs_route_and_retries() {
        let attempts = Arc::new(Mutex::new(0));
        let cloned = attempts.clone();
        let proxy = routed_proxy(Arc::new(move |req: Request| {
            let mut attempts = cloned.lock().unwrap();
            *attempts += 1;
            let resp = if *attempts == 1 {
                // First try hits a follower: reply with a leader hint.
                Response {
                    id: req.id,
                    error: Some(errorpb::Error::not_leader(
                        1,
                        Some(Replica::new(11, 1, ReplicaRole::Voter)),
                    )),
                    ..Default::default()
                }
            } else {
                Response {
                    id: req.id,
                    value: b"ok".to_vec(),
                    ..Default::default()
                }
            };
            Some(ResponseBatch::with_responses(vec![], vec![resp]))
        }));

        let done = Arc::new(Mutex::new(Vec::new()));
        let cloned_done = done.clone();
        proxy.set_callback(
            Arc::new(move |resp: Response| cloned_done.lock().unwrap().push(resp)),
            Arc::new(|_, _| {}),
        );
        proxy.set_retry_controller(Arc::new(AlwaysRetry {
            req: Mutex::new(Some(request(b"r1"))),
        }));

        proxy.dispatch(request(b"r1")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*attempts.lock().unwrap(), 2);
        let responses = done.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].value, b"ok");
    }

    #[tokio::test]
    async fn stale_epoch_retries_after_route_refresh() {
        let attempts = Arc::new(Mutex::new(0));
        let cloned = attempts.clone();
        let proxy = routed_proxy(Arc::new(move |req: Request| {
            let mut attempts = cloned.lock().unwrap();
            *attempts += 1;
            let resp = if *attempts == 1 {
                // The shard split under the client; hint the successor.
                Response {
                    id: req.id,
                    error: Some(errorpb::Error::stale_epoch(vec![Shard {
                        id: 2,
                        epoch: Some(Epoch {
                            generation: 2,
                            config_ver: 1,
                        }),
                        ..Default::default()
                    }])),
                    ..Default::default()
                }
            } else {
                Response {
                    id: req.id,
                    value: b"routed".to_vec(),
                    ..Default::default()
                }
            };
            Some(ResponseBatch::with_responses(vec![], vec![resp]))
        }));

        let done = Arc::new(Mutex::new(Vec::new()));
        let cloned_done = done.clone();
        proxy.set_callback(
            Arc::new(move |resp: Response| cloned_done.lock().unwrap().push(resp)),
            Arc::new(|_, _| {}),
        );
        proxy.set_retry_controller(Arc::new(AlwaysRetry {
            req: Mutex::new(Some(request(b"r1"))),
        }));

        proxy.dispatch(request(b"r1")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The second dispatch re-routes through the (meanwhile refreshed)
        // router and succeeds.
        assert_eq!(*attempts.lock().unwrap(), 2);
        assert_eq!(done.lock().unwrap()[0].value, b"routed");
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let proxy = routed_proxy(Arc::new(|req: Request| {
            Some(ResponseBatch::with_responses(
                vec![],
                vec![Response {
                    id: req.id,
                    error: Some(errorpb::Error::shard_not_found(1)),
                    ..Default::default()
                }],
            ))
        }));

        let failures = Arc::new(Mutex::new(Vec::new()));
        let cloned = failures.clone();
        proxy.set_callback(
            Arc::new(|_| {}),
            Arc::new(move |id: &[u8], err| {
                cloned.lock().unwrap().push((id.to_vec(), err.to_string()));
            }),
        );
        proxy.set_retry_controller(Arc::new(AlwaysRetry {
            req: Mutex::new(Some(request(b"r1"))),
        }));

        proxy.dispatch(request(b"r1")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].1.contains("not found"));
    }

    #[tokio::test]
    async fn expired_deadline_stops_retrying() {
        let proxy = routed_proxy(Arc::new(|req: Request| {
            Some(ResponseBatch::with_responses(
                vec![],
                vec![Response {
                    id: req.id,
                    error: Some(errorpb::Error::server_is_busy("busy")),
                    ..Default::default()
                }],
            ))
        }));

        let failures = Arc::new(Mutex::new(Vec::new()));
        let cloned = failures.clone();
        proxy.set_callback(
            Arc::new(|_| {}),
            Arc::new(move |id: &[u8], err| {
                cloned.lock().unwrap().push((id.to_vec(), err.to_string()));
            }),
        );

        // A deadline already in the past declines the retry.
        let mut expired = request(b"r1");
        expired.stop_at = 1;
        proxy.set_retry_controller(Arc::new(AlwaysRetry {
            req: Mutex::new(Some(expired.clone())),
        }));

        proxy.dispatch(expired).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].1.contains("timeout"));
    }
}
