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

//! The one-shot handle binding a request to its eventual response.

use tessera_api::rpcpb::TxnBatchResponse;
use tessera_server::{Error, Result};
use tokio::{sync::oneshot, time::Instant};

pub(crate) struct FutureReply {
    pub value: Vec<u8>,
    pub txn_response: Option<TxnBatchResponse>,
}

pub(crate) type ReplySender = oneshot::Sender<Result<FutureReply>>;

/// Obtained from every client call; resolves to the response value or the
/// deadline error, whichever comes first. `close` must be called exactly
/// once after `get`/`get_txn` so late responses are dropped instead of
/// leaking in the in-flight table.
pub struct Future {
    request_id: Vec<u8>,
    deadline: Instant,
    rx: oneshot::Receiver<Result<FutureReply>>,
    closer: Box<dyn FnOnce(&[u8]) + Send>,
    closed: bool,
}

impl Future {
    pub(crate) fn new(
        request_id: Vec<u8>,
        deadline: Instant,
        rx: oneshot::Receiver<Result<FutureReply>>,
        closer: Box<dyn FnOnce(&[u8]) + Send>,
    ) -> Self {
        Future {
            request_id,
            deadline,
            rx,
            closer,
            closed: false,
        }
    }

    #[inline]
    pub fn request_id(&self) -> &[u8] {
        &self.request_id
    }

    /// Wait for the response value, bounded by the caller deadline.
    pub async fn get(&mut self) -> Result<Vec<u8>> {
        self.wait().await.map(|reply| reply.value)
    }

    /// Wait for the transaction response, bounded by the caller deadline.
    pub async fn get_txn(&mut self) -> Result<TxnBatchResponse> {
        self.wait()
            .await
            .map(|reply| reply.txn_response.unwrap_or_default())
    }

    async fn wait(&mut self) -> Result<FutureReply> {
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => {
                Err(Error::DeadlineExceeded("wait response".into()))
            }
            reply = &mut self.rx => match reply {
                Ok(result) => result,
                // The completion slot is gone; the client stopped.
                Err(_) => Err(Error::Canceled),
            }
        }
    }

    /// Drop the in-flight record. Idempotent; late completions after close
    /// are silently discarded.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let closer = std::mem::replace(&mut self.closer, Box::new(|_| {}));
        closer(&self.request_id);
    }
}

impl Drop for Future {
    fn drop(&mut self) {
        self.close();
    }
}
