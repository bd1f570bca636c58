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

//! The loop thread
//!
//! One thread drives everything: poll for readiness, dispatch accept/read/
//! write, drain queued tasks, account the iteration. Connection state is
//! touched nowhere else.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use mio::net::TcpListener;
use mio::Events;

use crate::config::Config;
use crate::connection::{ConnState, ConnectionTable, IoOutcome};
use crate::dispatcher::Router;
use crate::metrics::{MetricsSnapshot, ServerMetrics};
use crate::parser::{parse_request, ParseOutcome, Response, Status};
use crate::queue::TaskQueue;
use crate::reactor::{Reactor, LISTEN_TOKEN, WAKE_TOKEN};
use crate::Error;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const EVENT_CAPACITY: usize = 1024;
const ERROR_COOLDOWN: Duration = Duration::from_millis(100);
const COOLDOWN_SLICE: Duration = Duration::from_millis(10);
const METRICS_LOG_EVERY: u64 = 10_000;

/// Everything the loop thread owns. Queued tasks receive `&mut LoopState`,
/// which is what keeps all connection mutation on this one thread.
pub(crate) struct LoopState {
    pub(crate) reactor: Reactor,
    pub(crate) listener: TcpListener,
    pub(crate) table: ConnectionTable,
    pub(crate) router: Box<dyn Router>,
    pub(crate) config: Config,
    pub(crate) metrics: Arc<ServerMetrics>,
    pub(crate) queue: TaskQueue,
    pub(crate) running: Arc<AtomicBool>,
}

/// Owner of the loop thread: binds, starts, exposes handles, shuts down.
pub struct EventLoop {
    config: Config,
    metrics: Arc<ServerMetrics>,
    queue: TaskQueue,
    waker: Arc<mio::Waker>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    startup: Option<(Reactor, TcpListener, Box<dyn Router>)>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

impl EventLoop {
    /// Binds the listener and prepares the loop without starting it.
    pub fn new(config: Config, router: impl Router) -> Result<Self, Error> {
        config.validate()?;

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    ErrorKind::AddrNotAvailable,
                    format!("host {:?} did not resolve", config.host),
                )
            })?;
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let reactor = Reactor::new()?;
        reactor.register_server(&mut listener)?;

        let metrics = Arc::new(ServerMetrics::default());
        let waker = reactor.waker();
        let queue = TaskQueue::new(Arc::clone(&waker), Arc::clone(&metrics));

        Ok(Self {
            config,
            metrics,
            queue,
            waker,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            startup: Some((reactor, listener, Box::new(router))),
            local_addr,
        })
    }

    /// Address the listener actually bound, useful with port `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for submitting work onto the loop.
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Shared counters.
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Loosely-consistent snapshot of the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Whether the loop thread is live.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns the loop thread. Calling on a running loop is a no-op; a loop
    /// that was already shut down cannot be restarted.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.is_running() {
            return Ok(());
        }
        let (reactor, listener, router) = self.startup.take().ok_or(Error::Stopped)?;

        self.running.store(true, Ordering::Release);
        self.metrics.set_running(true);

        let state = LoopState {
            reactor,
            listener,
            table: ConnectionTable::new(Arc::clone(&self.metrics)),
            router,
            config: self.config.clone(),
            metrics: Arc::clone(&self.metrics),
            queue: self.queue.clone(),
            running: Arc::clone(&self.running),
        };

        let thread = match thread::Builder::new()
            .name("snar-loop".into())
            .spawn(move || run(state))
        {
            Ok(thread) => thread,
            Err(err) => {
                self.running.store(false, Ordering::Release);
                self.metrics.set_running(false);
                return Err(Error::Io(err));
            }
        };
        self.thread = Some(thread);

        // periodic idle sweep; canceled with the scheduler at shutdown
        let interval = Duration::from_secs(self.config.cleanup_interval_s);
        let max_idle = Duration::from_millis(self.config.connection_timeout_ms);
        let queue = self.queue.clone();
        self.queue.schedule_at_fixed_rate(
            move || {
                let queue = queue.clone();
                queue.execute_on_loop(move |state| state.sweep(max_idle));
            },
            interval,
            interval,
        );

        Ok(())
    }

    /// Stops the loop: flips the flag, wakes the blocked poll, joins the
    /// thread, and tears the scheduler down. Later calls are no-ops; later
    /// submissions are dropped.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.metrics.set_running(false);
        self.queue.shutdown();
        if let Err(err) = self.waker.wake() {
            warn!("failed to wake loop for shutdown: {err}");
        }

        if let Some(thread) = self.thread.take() {
            // the loop wakes within the poll timeout and exits; teardown
            // closes the reactor and every socket with it
            if thread.join().is_err() {
                error!("event loop thread panicked during shutdown");
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(mut state: LoopState) {
    state.queue.mark_loop_thread();
    let mut events = Events::with_capacity(EVENT_CAPACITY);
    debug!("event loop started");

    while state.running.load(Ordering::Acquire) {
        let started = Instant::now();

        match state.turn(&mut events) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                error!("event loop iteration failed: {err}");
                state.cooldown();
            }
        }

        state.metrics.loop_completed(started.elapsed());
        if state.metrics.total_loops() % METRICS_LOG_EVERY == 0 {
            debug!("loop metrics: {:?}", state.metrics.snapshot());
        }
    }

    state.teardown();
    debug!("event loop stopped");
}

impl LoopState {
    /// One iteration: poll, dispatch readiness, drain tasks.
    fn turn(&mut self, events: &mut Events) -> io::Result<()> {
        self.reactor.poll(events, Some(POLL_TIMEOUT))?;
        // from here on, new submissions must wake the next poll
        self.queue.ack_wake();

        for event in events.iter() {
            match event.token() {
                LISTEN_TOKEN => self.accept(),
                WAKE_TOKEN => {} // nothing to read; the drain below picks tasks up
                token => {
                    // accept > read > write; one handler per readiness key
                    if event.is_readable() {
                        self.handle_read(token.0);
                    } else if event.is_writable() {
                        self.handle_write(token.0);
                    }
                }
            }
        }

        let queue = self.queue.clone();
        let max_tasks = self.config.max_tasks_per_iteration;
        queue.drain(self, max_tasks);
        Ok(())
    }

    /// Drains the accept queue, admitting and registering each stream.
    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let token = self.table.insert(stream);
                    if let Some(conn) = self.table.get_mut(token) {
                        // drop the connection if we can't register with poll
                        if self.reactor.register_client(conn.stream_mut(), token).is_err() {
                            self.table.remove(token);
                        }
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("accept failed: {err}");
                    return;
                }
            }
        }
    }

    /// Read readiness: drain the socket into the chain, then try to parse.
    fn handle_read(&mut self, token: usize) {
        let Some(conn) = self.table.get_mut(token) else {
            return;
        };

        match conn.fill() {
            Ok(IoOutcome::Progress(n)) => {
                self.metrics.add_bytes_read(n as u64);
                self.try_parse(token);
            }
            Ok(IoOutcome::WouldBlock) => {}
            Ok(IoOutcome::Closed) => self.close_connection(token),
            Err(err) => {
                // includes out-of-memory on read: no response, just close
                warn!("read failed on connection {token}: {err}");
                self.close_connection(token);
            }
        }
    }

    /// Attempts to recognize one request at the head of the chain. Only legal
    /// in `ReadingRequest`; bytes arriving in other states stay buffered.
    fn try_parse(&mut self, token: usize) {
        let Some(conn) = self.table.get_mut(token) else {
            return;
        };
        if conn.state() != ConnState::ReadingRequest {
            return;
        }

        let outcome = {
            let view = conn.chain().coalesced();
            parse_request(&view, self.config.max_request_size)
        };

        match outcome {
            Ok(ParseOutcome::Partial) => {}
            Ok(ParseOutcome::Complete { request, consumed }) => {
                conn.chain_mut().consume(consumed);
                self.dispatch(token, request);
            }
            Err(err) => {
                debug!("parse failed on connection {token}: {err}");
                self.fail_connection(token, err.status());
            }
        }
    }

    /// Answers a protocol violation with its minimal error response and a
    /// close after the write.
    fn fail_connection(&mut self, token: usize, status: Status) {
        let Some(conn) = self.table.get_mut(token) else {
            return;
        };
        let raw = Response::error(status).serialize(false);
        conn.set_response(raw, status, false);
        self.attempt_write(token);
    }

    /// Write readiness: keep draining the pending response.
    fn handle_write(&mut self, token: usize) {
        let Some(conn) = self.table.get_mut(token) else {
            return;
        };
        if conn.state() != ConnState::WritingResponse {
            return;
        }
        self.attempt_write(token);
    }

    /// Pushes response bytes out; arms Write interest on a partial drain and
    /// finishes the cycle on a full one.
    pub(crate) fn attempt_write(&mut self, token: usize) {
        let chunk = self.config.response_buffer_size;
        let Some(conn) = self.table.get_mut(token) else {
            return;
        };

        match conn.flush(chunk) {
            Ok(IoOutcome::Progress(n)) => {
                self.metrics.add_bytes_written(n as u64);
                if let Some(conn) = self.table.get_mut(token) {
                    if conn.response_complete() {
                        self.finish_response(token);
                    } else if self
                        .reactor
                        .enable_write(conn.stream_mut(), token)
                        .is_err()
                    {
                        self.close_connection(token);
                    }
                }
            }
            Ok(IoOutcome::WouldBlock) => {
                if self.reactor.enable_write(conn.stream_mut(), token).is_err() {
                    self.close_connection(token);
                }
            }
            Ok(IoOutcome::Closed) => self.close_connection(token),
            Err(err) => {
                warn!("write failed on connection {token}: {err}");
                self.close_connection(token);
            }
        }
    }

    /// A response fully drained: either reset for Keep-Alive and immediately
    /// parse any pipelined tail bytes, or close.
    fn finish_response(&mut self, token: usize) {
        let Some(conn) = self.table.get_mut(token) else {
            return;
        };

        if conn.keep_alive() {
            // reset before any further parsing so the next request starts
            // from a clean response slate; tail bytes stay in the chain
            conn.reset();
            if self.reactor.disable_write(conn.stream_mut(), token).is_err() {
                self.close_connection(token);
                return;
            }
            self.try_parse(token);
        } else {
            self.close_connection(token);
        }
    }

    /// Removes the connection and cancels its registration. The socket
    /// closes when the record drops.
    pub(crate) fn close_connection(&mut self, token: usize) {
        if let Some(mut conn) = self.table.remove(token) {
            self.reactor.deregister(conn.stream_mut());
        }
    }

    /// Evicts every connection idle at least `max_idle`. Runs as a queued
    /// task on the loop thread.
    pub(crate) fn sweep(&mut self, max_idle: Duration) {
        for token in self.table.idle_tokens(max_idle) {
            debug!("evicting idle connection {token}");
            self.close_connection(token);
        }
    }

    /// Shutdown path: drop every connection, then the reactor with it.
    fn teardown(&mut self) {
        for token in self.table.all_tokens() {
            self.close_connection(token);
        }
        self.reactor.deregister(&mut self.listener);
    }

    fn cooldown(&self) {
        // sliced so a shutdown during the cool-down short-circuits
        let deadline = Instant::now() + ERROR_COOLDOWN;
        while self.running.load(Ordering::Acquire) && Instant::now() < deadline {
            thread::sleep(COOLDOWN_SLICE);
        }
    }
}
