// Copyright (c) 2017 The Enclume developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Reuse of per-connection state.
//!
//! A `Triple` bundles the {stream, request, response} objects one
//! connection needs; the pool keeps released triples, reset in place with
//! their buffers intact, so steady-state request handling allocates
//! nothing. `acquire` creates new triples up to the capacity bound and
//! then blocks until one is released.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;

use log::trace;

use crate::stream::ByteStream;
use crate::Request;
use crate::Response;

/// The pooled per-connection objects.
pub struct Triple {
    pub stream: ByteStream,
    pub request: Request,
    pub response: Response,
}

impl Triple {
    fn new(buffer_size: usize) -> Triple {
        Triple {
            stream: ByteStream::new(buffer_size),
            request: Request::new(buffer_size),
            response: Response::new(),
        }
    }

    /// Resets all three objects in place. After this the triple holds no
    /// reference to per-request heap data and owns no temp file.
    pub fn reset(&mut self) {
        self.stream.reset();
        self.request.reset();
        self.response.reset();
    }
}

struct PoolState {
    free: Vec<Triple>,
    live: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
    capacity: usize,
    buffer_size: usize,
}

/// Fixed-capacity free list of `Triple`s.
#[derive(Clone)]
pub struct ObjectPool {
    inner: Arc<PoolInner>,
}

impl ObjectPool {
    pub fn new(capacity: usize, buffer_size: usize) -> ObjectPool {
        ObjectPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    live: 0,
                }),
                available: Condvar::new(),
                capacity: capacity.max(1),
                buffer_size,
            }),
        }
    }

    /// Takes a triple, creating a new one while under capacity and
    /// blocking until a release otherwise.
    pub fn acquire(&self) -> Triple {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(triple) = state.free.pop() {
                trace!("reusing a pooled triple");
                return triple;
            }
            if state.live < self.inner.capacity {
                state.live += 1;
                trace!("pool grows to {} live triples", state.live);
                return Triple::new(self.inner.buffer_size);
            }
            state = self.inner.available.wait(state).unwrap();
        }
    }

    /// Resets the triple and puts it back on the free list.
    pub fn release(&self, mut triple: Triple) {
        triple.reset();
        let mut state = self.inner.state.lock().unwrap();
        state.free.push(triple);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Number of triples currently waiting on the free list.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().unwrap().free.len()
    }
}
