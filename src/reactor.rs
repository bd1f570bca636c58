// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Readiness multiplexer wrapper
//!
//! Thin layer over `mio::Poll`. Connection tokens are slab keys; the listener
//! and the waker sit at the top of the token space where slab keys never
//! reach. All operations except [`Reactor::waker`]-driven wakes run on the
//! loop thread.

use std::io::Result;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

/// Token reserved for the accepting listener socket.
pub(crate) const LISTEN_TOKEN: Token = Token(usize::MAX);
/// Token reserved for the task-queue waker.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// Owns the poll instance and hands out readiness events.
#[derive(Debug)]
pub struct Reactor {
    poll: Poll,
    waker: Arc<Waker>,
}

impl Reactor {
    /// Creates the poll and its waker.
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self { poll, waker })
    }

    /// Waker handle for foreign-thread submissions. Cheap to clone, safe from
    /// any thread, idempotent between polls.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Registers the accepting socket for Accept (readable) readiness.
    pub fn register_server(&self, listener: &mut TcpListener) -> Result<()> {
        self.poll
            .registry()
            .register(listener, LISTEN_TOKEN, Interest::READABLE)
    }

    /// Registers a client socket for Read readiness under a slab token.
    pub fn register_client(&self, stream: &mut TcpStream, token: usize) -> Result<()> {
        self.poll
            .registry()
            .register(stream, Token(token), Interest::READABLE)
    }

    /// Adds Write to the interest mask, preserving Read.
    pub fn enable_write(&self, stream: &mut TcpStream, token: usize) -> Result<()> {
        self.poll.registry().reregister(
            stream,
            Token(token),
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    /// Drops Write from the interest mask, preserving Read.
    pub fn disable_write(&self, stream: &mut TcpStream, token: usize) -> Result<()> {
        self.poll
            .registry()
            .reregister(stream, Token(token), Interest::READABLE)
    }

    /// Cancels a registration. The socket itself closes when dropped by the
    /// caller; deregistering twice is a no-op.
    pub fn deregister(&self, source: &mut impl Source) {
        // NotFound here means the registration is already gone
        let _ = self.poll.registry().deregister(source);
    }

    /// Blocks for readiness up to `timeout`. A wake delivers `WAKE_TOKEN`
    /// without any socket being ready.
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> Result<()> {
        self.poll.poll(events, timeout)
    }
}
