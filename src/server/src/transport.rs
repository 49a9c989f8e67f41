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

//! Inter-store raft traffic: one lazily connected, length-delimited framed
//! channel per target store. Undeliverable messages surface as reachability
//! feedback so raft can slow down towards the dead peer.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{serverpb::RaftMessage, Result};

const OUTBOUND_QUEUE: usize = 4096;

/// Receives inbound envelopes and delivery failures.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, msg: RaftMessage);

    /// The target replica could not be reached.
    fn unreachable(&self, shard_id: u64, to_replica_id: u64);

    /// A snapshot message was flushed (or failed) towards a follower.
    fn snapshot_status(&self, shard_id: u64, to_replica_id: u64, rejected: bool);
}

/// Resolves a store id to its raft address; backed by the router's store
/// table.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, store_id: u64) -> Option<String>;
}

struct TransportInner {
    resolver: Arc<dyn AddressResolver>,
    handler: Arc<dyn MessageHandler>,
    channels: RwLock<HashMap<u64, mpsc::Sender<RaftMessage>>>,
    sending_snapshots: AtomicU64,
    shutdown: CancellationToken,
    max_frame_length: usize,
}

#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn new(
        resolver: Arc<dyn AddressResolver>,
        handler: Arc<dyn MessageHandler>,
        max_frame_length: usize,
    ) -> Self {
        Transport {
            inner: Arc::new(TransportInner {
                resolver,
                handler,
                channels: RwLock::new(HashMap::new()),
                sending_snapshots: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                max_frame_length,
            }),
        }
    }

    fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .max_frame_length(self.inner.max_frame_length)
            .new_codec()
    }

    /// Bind the raft address and accept inbound message streams.
    pub async fn start(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(address = addr, "raft transport listening");

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.inner.shutdown.cancelled() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        debug!(peer = %peer, "raft transport connection accepted");
                        let cloned = this.clone();
                        tokio::spawn(async move { cloned.read_loop(stream).await });
                    }
                }
            }
        });
        Ok(())
    }

    async fn read_loop(self, stream: TcpStream) {
        let mut framed = Framed::new(stream, self.codec());
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                frame = framed.next() => {
                    match frame {
                        Some(Ok(bytes)) => match RaftMessage::decode(bytes.as_ref()) {
                            Ok(msg) => self.inner.handler.handle(msg),
                            Err(err) => {
                                warn!("drop undecodable raft envelope: {err}");
                            }
                        },
                        Some(Err(err)) => {
                            debug!("raft transport read failed: {err}");
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Queue an envelope towards its target store; connections are created
    /// lazily and recycled on failure.
    pub fn send(&self, msg: RaftMessage) {
        let Some(to_replica) = msg.to_replica.clone() else {
            return;
        };
        let store_id = to_replica.store_id;

        let sender = {
            let channels = self.inner.channels.read().unwrap();
            channels.get(&store_id).cloned()
        };
        let sender = match sender {
            Some(sender) => sender,
            None => self.create_channel(store_id),
        };

        let shard_id = msg.shard_id;
        if !msg.snapshot_files.is_empty() {
            self.inner.sending_snapshots.fetch_add(1, Ordering::Relaxed);
        }
        if sender.try_send(msg).is_err() {
            self.inner.handler.unreachable(shard_id, to_replica.id);
        }
    }

    fn create_channel(&self, store_id: u64) -> mpsc::Sender<RaftMessage> {
        let mut channels = self.inner.channels.write().unwrap();
        if let Some(sender) = channels.get(&store_id) {
            return sender.clone();
        }
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        channels.insert(store_id, tx.clone());

        let this = self.clone();
        tokio::spawn(async move { this.write_loop(store_id, rx).await });
        tx
    }

    async fn write_loop(self, store_id: u64, mut rx: mpsc::Receiver<RaftMessage>) {
        let drop_channel = |this: &Transport| {
            this.inner.channels.write().unwrap().remove(&store_id);
        };

        let Some(addr) = self.inner.resolver.resolve(store_id) else {
            warn!(store = store_id, "no raft address for store");
            drop_channel(&self);
            self.report_drained(&mut rx).await;
            return;
        };

        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(store = store_id, address = %addr, "connect raft transport: {err}");
                drop_channel(&self);
                self.report_drained(&mut rx).await;
                return;
            }
        };
        debug!(store = store_id, address = %addr, "raft transport connected");
        let mut framed = Framed::new(stream, self.codec());

        while let Some(msg) = recv_or_shutdown(&self.inner.shutdown, &mut rx).await {
            let shard_id = msg.shard_id;
            let to_replica_id = msg.to_replica.as_ref().map(|r| r.id).unwrap_or_default();
            let has_snapshot = !msg.snapshot_files.is_empty();
            let bytes = msg.encode_to_vec();

            if let Err(err) = framed.send(bytes.into()).await {
                debug!(store = store_id, "raft transport write failed: {err}");
                self.inner.handler.unreachable(shard_id, to_replica_id);
                if has_snapshot {
                    self.inner.sending_snapshots.fetch_sub(1, Ordering::Relaxed);
                    self.inner
                        .handler
                        .snapshot_status(shard_id, to_replica_id, true);
                }
                break;
            }
            if has_snapshot {
                self.inner.sending_snapshots.fetch_sub(1, Ordering::Relaxed);
                self.inner
                    .handler
                    .snapshot_status(shard_id, to_replica_id, false);
            }
        }

        drop_channel(&self);
        self.report_drained(&mut rx).await;
    }

    /// Everything still queued on a dead channel is unreachable.
    async fn report_drained(&self, rx: &mut mpsc::Receiver<RaftMessage>) {
        rx.close();
        while let Ok(msg) = rx.try_recv() {
            let to_replica_id = msg.to_replica.as_ref().map(|r| r.id).unwrap_or_default();
            if !msg.snapshot_files.is_empty() {
                self.inner.sending_snapshots.fetch_sub(1, Ordering::Relaxed);
                self.inner
                    .handler
                    .snapshot_status(msg.shard_id, to_replica_id, true);
            }
            self.inner.handler.unreachable(msg.shard_id, to_replica_id);
        }
    }

    pub fn sending_snapshot_count(&self) -> u64 {
        self.inner.sending_snapshots.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.channels.write().unwrap().clear();
    }
}

async fn recv_or_shutdown(
    shutdown: &CancellationToken,
    rx: &mut mpsc::Receiver<RaftMessage>,
) -> Option<RaftMessage> {
    tokio::select! {
        _ = shutdown.cancelled() => None,
        msg = rx.recv() => msg,
    }
}

impl crate::replica::RaftTransport for Transport {
    fn send_raft_message(&self, msg: RaftMessage) {
        self.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tessera_api::metapb::{Replica, ReplicaRole};

    use super::*;

    struct StaticResolver(HashMap<u64, String>);

    impl AddressResolver for StaticResolver {
        fn resolve(&self, store_id: u64) -> Option<String> {
            self.0.get(&store_id).cloned()
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        received: Mutex<Vec<RaftMessage>>,
        unreachable: Mutex<Vec<u64>>,
        notify: Mutex<Option<mpsc::UnboundedSender<()>>>,
    }

    impl MessageHandler for RecordingHandler {
        fn handle(&self, msg: RaftMessage) {
            self.received.lock().unwrap().push(msg);
            if let Some(tx) = self.notify.lock().unwrap().as_ref() {
                tx.send(()).unwrap_or_default();
            }
        }

        fn unreachable(&self, _shard_id: u64, to_replica_id: u64) {
            self.unreachable.lock().unwrap().push(to_replica_id);
        }

        fn snapshot_status(&self, _shard_id: u64, _to_replica_id: u64, _rejected: bool) {}
    }

    fn envelope(shard_id: u64, to_store: u64) -> RaftMessage {
        RaftMessage {
            shard_id,
            from_replica: Some(Replica::new(1, 1, ReplicaRole::Voter)),
            to_replica: Some(Replica::new(2, to_store, ReplicaRole::Voter)),
            messages: vec![vec![1, 2, 3]],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn messages_reach_the_remote_handler() {
        let addr = "127.0.0.1:28931";
        let receiver_handler = Arc::new(RecordingHandler::default());
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        *receiver_handler.notify.lock().unwrap() = Some(notify_tx);

        let receiver = Transport::new(
            Arc::new(StaticResolver(HashMap::new())),
            receiver_handler.clone(),
            1 << 20,
        );
        receiver.start(addr).await.unwrap();

        let sender_handler = Arc::new(RecordingHandler::default());
        let sender = Transport::new(
            Arc::new(StaticResolver(HashMap::from([(2, addr.to_string())]))),
            sender_handler,
            1 << 20,
        );
        sender.send(envelope(7, 2));

        notify_rx.recv().await.unwrap();
        let received = receiver_handler.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].shard_id, 7);

        sender.close();
        receiver.close();
    }

    #[tokio::test]
    async fn unresolvable_store_reports_unreachable() {
        let handler = Arc::new(RecordingHandler::default());
        let transport = Transport::new(
            Arc::new(StaticResolver(HashMap::new())),
            handler.clone(),
            1 << 20,
        );
        transport.send(envelope(7, 9));

        // The write loop fails resolution asynchronously.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(handler.unreachable.lock().unwrap().as_slice(), &[2]);
        transport.close();
    }
}
