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

//! Client behavior against a scripted backend: future lifecycle, in-flight
//! bookkeeping, and retry interplay with the proxy.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tessera_api::{
    errorpb,
    metapb::{Epoch, Replica, ReplicaRole, Shard, Store},
    rpcpb::{CmdType, EventNotify, Request, Response, ResponseBatch},
};
use tessera_client::{Client, RequestOption};
use tessera_server::{
    proxy::{
        backend::{Backend, BackendFactory},
        ShardsProxy,
    },
    FailureCallback, Router, SuccessCallback,
};

/// Answers every dispatch through the scripted handler, feeding the proxy's
/// response path like a real backend read loop would.
struct ScriptedBackend {
    handler: Arc<dyn Fn(Request) -> Response + Send + Sync>,
    proxy: Arc<Mutex<Option<ShardsProxy>>>,
}

impl Backend for ScriptedBackend {
    fn dispatch(&self, mut req: Request) -> tessera_server::Result<()> {
        req.pid = 0;
        let resp = (self.handler)(req);
        let proxy = self.proxy.lock().unwrap().clone().unwrap();
        proxy.on_response(ResponseBatch::with_responses(vec![], vec![resp]));
        Ok(())
    }

    fn close(&self) {}
}

struct ScriptedFactory {
    handler: Arc<dyn Fn(Request) -> Response + Send + Sync>,
    proxy: Arc<Mutex<Option<ShardsProxy>>>,
}

impl BackendFactory for ScriptedFactory {
    fn create(
        &self,
        _addr: &str,
        _success: SuccessCallback,
        _failure: FailureCallback,
    ) -> tessera_server::Result<Arc<dyn Backend>> {
        Ok(Arc::new(ScriptedBackend {
            handler: self.handler.clone(),
            proxy: self.proxy.clone(),
        }))
    }
}

fn scripted_client(handler: Arc<dyn Fn(Request) -> Response + Send + Sync>) -> Client {
    let router = Router::new_for_test();
    router.handle_event(EventNotify::store(Store {
        id: 1,
        client_address: "127.0.0.1:21001".into(),
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

    let proxy_slot = Arc::new(Mutex::new(None));
    let factory = Box::new(ScriptedFactory {
        handler,
        proxy: proxy_slot.clone(),
    });
    let proxy = ShardsProxy::with_retry_interval(router, factory, Duration::from_millis(20));
    proxy_slot.lock().unwrap().replace(proxy.clone());
    Client::new(proxy)
}

#[tokio::test]
async fn future_resolves_and_clears_the_inflight_table() {
    let client = scripted_client(Arc::new(|req: Request| Response {
        id: req.id,
        value: b"value".to_vec(),
        ..Default::default()
    }));

    let mut fut = client.write(
        Duration::from_secs(5),
        1,
        b"payload".to_vec(),
        vec![RequestOption::RouteKey(b"k".to_vec())],
    );
    assert_eq!(fut.get().await.unwrap(), b"value");
    fut.close();

    // A second write works independently; ids never collide.
    let mut other = client.write(
        Duration::from_secs(5),
        1,
        b"payload".to_vec(),
        vec![RequestOption::RouteKey(b"k".to_vec())],
    );
    assert_eq!(other.get().await.unwrap(), b"value");
    other.close();
}

#[tokio::test]
async fn deadline_expires_before_completion() {
    // The backend answers with a retryable error forever, so the future can
    // only finish through its deadline.
    let client = scripted_client(Arc::new(|req: Request| Response {
        id: req.id,
        error: Some(errorpb::Error::server_is_busy("always busy")),
        ..Default::default()
    }));

    let mut fut = client.write(
        Duration::from_secs(1),
        1,
        b"payload".to_vec(),
        vec![RequestOption::RouteKey(b"k".to_vec())],
    );
    let err = fut.get().await.unwrap_err();
    fut.close();
    let message = err.to_string();
    assert!(
        message.contains("deadline") || message.contains("timeout"),
        "unexpected error: {message}",
    );
}

#[tokio::test]
async fn retryable_error_is_retried_to_success() {
    let attempts = Arc::new(Mutex::new(0));
    let cloned = attempts.clone();
    let client = scripted_client(Arc::new(move |req: Request| {
        let mut attempts = cloned.lock().unwrap();
        *attempts += 1;
        if *attempts < 3 {
            Response {
                id: req.id,
                error: Some(errorpb::Error::server_is_busy("warming up")),
                ..Default::default()
            }
        } else {
            Response {
                id: req.id,
                value: b"done".to_vec(),
                ..Default::default()
            }
        }
    }));

    let mut fut = client.write(
        Duration::from_secs(10),
        1,
        b"payload".to_vec(),
        vec![RequestOption::RouteKey(b"k".to_vec())],
    );
    assert_eq!(fut.get().await.unwrap(), b"done");
    fut.close();
    assert_eq!(*attempts.lock().unwrap(), 3);
}

#[tokio::test]
async fn closed_future_drops_late_responses() {
    let respond = Arc::new(Mutex::new(false));
    let cloned = respond.clone();
    let pending: Arc<Mutex<Vec<Response>>> = Arc::new(Mutex::new(Vec::new()));
    let cloned_pending = pending.clone();
    let client = scripted_client(Arc::new(move |req: Request| {
        if *cloned.lock().unwrap() {
            Response {
                id: req.id,
                ..Default::default()
            }
        } else {
            // Park the response; nothing completes the future.
            cloned_pending.lock().unwrap().push(Response {
                id: req.id.clone(),
                error: Some(errorpb::Error::server_is_busy("parked")),
                ..Default::default()
            });
            Response {
                id: req.id,
                error: Some(errorpb::Error::server_is_busy("parked")),
                ..Default::default()
            }
        }
    }));

    let mut fut = client.write(
        Duration::from_secs(1),
        1,
        b"payload".to_vec(),
        vec![RequestOption::RouteKey(b"k".to_vec())],
    );
    let _ = fut.get().await;
    // Closing removes the in-flight record; anything arriving later has
    // nowhere to land and must not panic.
    fut.close();
    *respond.lock().unwrap() = true;
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[test]
#[should_panic(expected = "cannot be set at the same time")]
fn key_and_shard_routing_are_mutually_exclusive() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let _guard = rt.enter();

    let client = scripted_client(Arc::new(|req: Request| Response {
        id: req.id,
        ..Default::default()
    }));
    let _ = client.write(
        Duration::from_secs(1),
        1,
        Vec::new(),
        vec![
            RequestOption::RouteKey(b"k".to_vec()),
            RequestOption::ToShard(7),
        ],
    );
}

#[test]
#[should_panic(expected = "deadline")]
fn requests_without_deadline_are_rejected() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let _guard = rt.enter();

    let client = scripted_client(Arc::new(|req: Request| Response {
        id: req.id,
        ..Default::default()
    }));
    let _ = client.write(Duration::ZERO, 1, Vec::new(), vec![]);
}

#[tokio::test]
async fn txn_payload_round_trips_opaquely() {
    let client = scripted_client(Arc::new(|req: Request| {
        let payload = req
            .txn_batch_request
            .map(|t| t.payload)
            .unwrap_or_default();
        Response {
            id: req.id,
            cmd_type: CmdType::Txn as i32,
            txn_batch_response: Some(tessera_api::rpcpb::TxnBatchResponse { payload }),
            ..Default::default()
        }
    }));

    let mut fut = client.txn(
        Duration::from_secs(5),
        tessera_api::rpcpb::TxnBatchRequest {
            payload: b"opaque-batch".to_vec(),
        },
        vec![RequestOption::RouteKey(b"k".to_vec())],
    );
    let resp = fut.get_txn().await.unwrap();
    fut.close();
    assert_eq!(resp.payload, b"opaque-batch");
}
