// Copyright 2015 The tiny-http Contributors
// Copyright (c) 2017 The Enclume developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A fixed set of worker threads consuming connection tasks.
//!
//! Each accepted connection becomes one task; a task runs its
//! connection's whole keep-alive loop on a single worker, so per-request
//! state never migrates between threads mid-request. Workers exit when
//! every `TaskPool` handle has been dropped and the queue drains.

use std::thread;

use crossbeam_channel::unbounded;
use crossbeam_channel::Sender;
use log::error;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Manages a collection of threads.
#[derive(Clone)]
pub(crate) struct TaskPool {
    sender: Sender<Task>,
}

impl TaskPool {
    /// Initializes a new task pool with `workers` threads.
    pub(crate) fn new(workers: usize) -> TaskPool {
        let (sender, receiver) = unbounded::<Task>();

        for n in 0..workers.max(1) {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("enclume-worker-{}", n))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                });
            if let Err(e) = spawned {
                error!("failed to spawn worker thread: {}", e);
            }
        }

        TaskPool { sender }
    }

    /// Executes a function on a worker thread.
    #[inline]
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Fails only when every worker is gone, i.e. during teardown.
        let _ = self.sender.send(Box::new(task));
    }
}
