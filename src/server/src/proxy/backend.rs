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

//! Proxy backends: the in-process short circuit for the local store and the
//! framed TCP channel for remote stores.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::{FailureCallback, SuccessCallback};
use crate::{Error, Result};

use tessera_api::rpcpb::{Request, Response};

/// How many queued requests one write round drains.
const WRITE_BATCH: usize = 16;
const BACKEND_QUEUE: usize = 4096;
const RETRY_AGAIN_WAIT: Duration = Duration::from_secs(1);

/// An outbound channel to one target store.
pub trait Backend: Send + Sync {
    fn dispatch(&self, req: Request) -> Result<()>;
    fn close(&self);
}

/// Creates backends; the proxy keys them by store client address.
pub trait BackendFactory: Send + Sync {
    fn create(
        &self,
        addr: &str,
        success: SuccessCallback,
        failure: FailureCallback,
    ) -> Result<Arc<dyn Backend>>;
}

/// Short-circuits requests into the local store's request handler.
pub struct LocalBackend {
    handler: Arc<dyn Fn(Request) -> Result<()> + Send + Sync>,
}

impl LocalBackend {
    pub fn new(handler: Arc<dyn Fn(Request) -> Result<()> + Send + Sync>) -> Self {
        LocalBackend { handler }
    }
}

impl Backend for LocalBackend {
    fn dispatch(&self, mut req: Request) -> Result<()> {
        // Local requests never travel through an RPC session.
        req.pid = 0;
        (self.handler)(req)
    }

    fn close(&self) {}
}

enum QueueItem {
    Request(Request),
    /// Wake the write loop so it (re)connects without carrying a request.
    Nudge,
    Close,
}

/// A lazily connected, framed TCP channel to one remote store. `dispatch`
/// only enqueues; a write loop drains the queue in bounded rounds and a
/// read loop demultiplexes responses until the first read error, after
/// which the next dispatch reconnects.
pub struct RemoteBackend {
    addr: String,
    queue: mpsc::Sender<QueueItem>,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl RemoteBackend {
    pub fn new(
        addr: String,
        success: SuccessCallback,
        failure: FailureCallback,
        max_frame_length: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(BACKEND_QUEUE);
        let backend = Arc::new(RemoteBackend {
            addr: addr.clone(),
            queue: tx,
            connected: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        });

        let writer = WriteLoop {
            addr,
            rx,
            success,
            failure,
            connected: backend.connected.clone(),
            max_frame_length,
        };
        tokio::spawn(writer.run());
        backend
    }
}

impl Backend for RemoteBackend {
    fn dispatch(&self, req: Request) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }

        if !self.connected.load(Ordering::Acquire) {
            // Kick the write loop into connecting and let the proxy retry.
            let _ = self.queue.try_send(QueueItem::Nudge);
            return Err(Error::TryAgain {
                wait: RETRY_AGAIN_WAIT,
            });
        }

        self.queue
            .try_send(QueueItem::Request(req))
            .map_err(|_| Error::ServiceIsBusy("backend queue full"))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let queue = self.queue.clone();
        tokio::spawn(async move {
            queue.send(QueueItem::Close).await.unwrap_or_default();
        });
    }
}

struct WriteLoop {
    addr: String,
    rx: mpsc::Receiver<QueueItem>,
    success: SuccessCallback,
    failure: FailureCallback,
    connected: Arc<AtomicBool>,
    max_frame_length: usize,
}

impl WriteLoop {
    fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .max_frame_length(self.max_frame_length)
            .new_codec()
    }

    async fn run(mut self) {
        info!(remote = %self.addr, "backend write loop started");
        let mut sink: Option<FramedWrite<tokio::net::tcp::OwnedWriteHalf, LengthDelimitedCodec>> =
            None;

        'outer: loop {
            let Some(first) = self.rx.recv().await else {
                break;
            };

            // Connect attempts happen inside the single write loop, so they
            // are naturally serialized.
            if sink.is_none() || !self.connected.load(Ordering::Acquire) {
                sink = self.connect().await;
            }

            let mut round = Vec::with_capacity(WRITE_BATCH);
            match first {
                QueueItem::Close => break,
                QueueItem::Nudge => {}
                QueueItem::Request(req) => round.push(req),
            }
            while round.len() < WRITE_BATCH {
                match self.rx.try_recv() {
                    Ok(QueueItem::Close) => {
                        self.fail_round(&round, || Error::Stopped);
                        break 'outer;
                    }
                    Ok(QueueItem::Nudge) => {}
                    Ok(QueueItem::Request(req)) => round.push(req),
                    Err(_) => break,
                }
            }
            if round.is_empty() {
                continue;
            }

            let Some(framed) = sink.as_mut() else {
                self.fail_round(&round, || Error::TryAgain {
                    wait: RETRY_AGAIN_WAIT,
                });
                continue;
            };

            let mut write_failed = false;
            for req in &round {
                debug!(remote = %self.addr, id = ?req.id, "send request");
                if framed.feed(req.encode_to_vec().into()).await.is_err() {
                    write_failed = true;
                    break;
                }
            }
            if !write_failed {
                write_failed = framed.flush().await.is_err();
            }

            if write_failed {
                // The connection is gone; report every request of this
                // round and reconnect on the next dispatch.
                self.connected.store(false, Ordering::Release);
                sink = None;
                self.fail_round(&round, || Error::TryAgain {
                    wait: RETRY_AGAIN_WAIT,
                });
            }
        }

        self.connected.store(false, Ordering::Release);
        info!(remote = %self.addr, "backend write loop stopped");
    }

    fn fail_round(&self, round: &[Request], err: impl Fn() -> Error) {
        for req in round {
            (self.failure)(&req.id, err());
        }
    }

    async fn connect(
        &mut self,
    ) -> Option<FramedWrite<tokio::net::tcp::OwnedWriteHalf, LengthDelimitedCodec>> {
        match TcpStream::connect(&self.addr).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                self.connected.store(true, Ordering::Release);

                let reader = ReadLoop {
                    addr: self.addr.clone(),
                    framed: FramedRead::new(read_half, self.codec()),
                    success: self.success.clone(),
                    connected: self.connected.clone(),
                };
                tokio::spawn(reader.run());

                info!(remote = %self.addr, "backend connected");
                Some(FramedWrite::new(write_half, self.codec()))
            }
            Err(err) => {
                warn!(remote = %self.addr, "fail to connect to backend: {err}");
                self.connected.store(false, Ordering::Release);
                None
            }
        }
    }
}

struct ReadLoop {
    addr: String,
    framed: FramedRead<tokio::net::tcp::OwnedReadHalf, LengthDelimitedCodec>,
    success: SuccessCallback,
    connected: Arc<AtomicBool>,
}

impl ReadLoop {
    async fn run(mut self) {
        info!(remote = %self.addr, "backend read loop started");
        while let Some(frame) = self.framed.next().await {
            match frame {
                Ok(bytes) => match Response::decode(bytes.as_ref()) {
                    Ok(resp) => {
                        debug!(remote = %self.addr, id = ?resp.id, "backend received response");
                        (self.success)(resp);
                    }
                    Err(err) => {
                        warn!(remote = %self.addr, "drop undecodable response: {err}");
                    }
                },
                Err(_) => break,
            }
        }
        // Any read error drops the connection; the next dispatch
        // reconnects.
        self.connected.store(false, Ordering::Release);
        info!(remote = %self.addr, "backend read loop stopped");
    }
}

/// The default factory: a local short circuit for this store's address,
/// remote framed channels for everything else.
pub struct DefaultBackendFactory {
    local_address: String,
    local_handler: Arc<dyn Fn(Request) -> Result<()> + Send + Sync>,
    max_frame_length: usize,
}

impl DefaultBackendFactory {
    pub fn new(
        local_address: String,
        local_handler: Arc<dyn Fn(Request) -> Result<()> + Send + Sync>,
        max_frame_length: usize,
    ) -> Self {
        DefaultBackendFactory {
            local_address,
            local_handler,
            max_frame_length,
        }
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn create(
        &self,
        addr: &str,
        success: SuccessCallback,
        failure: FailureCallback,
    ) -> Result<Arc<dyn Backend>> {
        if addr == self.local_address {
            return Ok(Arc::new(LocalBackend::new(self.local_handler.clone())));
        }
        Ok(RemoteBackend::new(
            addr.to_string(),
            success,
            failure,
            self.max_frame_length,
        ))
    }
}
