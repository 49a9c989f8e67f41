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

//! The client-address front door: thin TCP sessions whose requests are
//! stamped with a session `pid` so responses find their way back.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, RwLock,
    },
};

use futures::{SinkExt, StreamExt};
use prost::Message;
use tessera_api::rpcpb::{Request, Response};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{Error, Result};

pub type RequestHandler = Arc<dyn Fn(Request) -> Result<()> + Send + Sync>;

pub struct ProxyRpc {
    sessions: RwLock<HashMap<i64, mpsc::UnboundedSender<Response>>>,
    next_pid: AtomicI64,
    handler: RequestHandler,
    max_frame_length: usize,
    shutdown: CancellationToken,
}

impl ProxyRpc {
    pub fn new(handler: RequestHandler, max_frame_length: usize) -> Arc<Self> {
        Arc::new(ProxyRpc {
            sessions: RwLock::new(HashMap::new()),
            next_pid: AtomicI64::new(1),
            handler,
            max_frame_length,
            shutdown: CancellationToken::new(),
        })
    }

    fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .max_frame_length(self.max_frame_length)
            .new_codec()
    }

    pub async fn start(self: &Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(address = addr, "proxy rpc listening");

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        let pid = this.next_pid.fetch_add(1, Ordering::Relaxed);
                        debug!(peer = %peer, pid, "proxy rpc session opened");
                        let session = this.clone();
                        tokio::spawn(async move { session.serve(pid, stream).await });
                    }
                }
            }
        });
        Ok(())
    }

    async fn serve(self: Arc<Self>, pid: i64, stream: tokio::net::TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, self.codec());
        let mut writer = FramedWrite::new(write_half, self.codec());

        let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
        self.sessions.write().unwrap().insert(pid, tx);

        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                resp = rx.recv() => {
                    let Some(resp) = resp else { break };
                    if writer.send(resp.encode_to_vec().into()).await.is_err() {
                        break;
                    }
                }
                frame = reader.next() => {
                    match frame {
                        Some(Ok(bytes)) => {
                            let mut req = match Request::decode(bytes.as_ref()) {
                                Ok(req) => req,
                                Err(err) => {
                                    warn!(pid, "drop undecodable request: {err}");
                                    continue;
                                }
                            };
                            req.pid = pid;
                            let id = req.id.clone();
                            if let Err(err) = (self.handler)(req) {
                                self.respond_error(pid, id, err);
                            }
                        }
                        _ => break,
                    }
                }
            }
        }

        self.sessions.write().unwrap().remove(&pid);
        debug!(pid, "proxy rpc session closed");
    }

    fn respond_error(&self, pid: i64, id: Vec<u8>, err: Error) {
        let resp = Response {
            id,
            pid,
            error: Some(err.into()),
            ..Default::default()
        };
        self.on_response(resp);
    }

    /// Route a response back over the session its request came in on.
    /// Responses for dead sessions are dropped.
    pub fn on_response(&self, resp: Response) {
        let sessions = self.sessions.read().unwrap();
        if let Some(session) = sessions.get(&resp.pid) {
            session.send(resp).unwrap_or_default();
        }
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}
