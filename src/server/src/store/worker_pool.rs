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

//! The worker pool driving replica event loops: a dedicated multi-thread
//! runtime sized by `WorkerConfig::raft_event_workers`. Each replica loop
//! is one cooperative task on it.

use tokio::runtime::{Builder, Handle, Runtime};

use crate::Result;

pub struct WorkerPool {
    runtime: Runtime,
}

impl WorkerPool {
    pub fn new(name: &str, workers: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name(format!("{name}-raft-worker"))
            .enable_all()
            .build()?;
        Ok(WorkerPool { runtime })
    }

    #[inline]
    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future);
    }

    /// Stop accepting work and drop the runtime without blocking on running
    /// tasks.
    pub fn shutdown(self) {
        self.runtime.shutdown_background();
    }
}
