//! Connection state and the table that owns it

use std::io::{ErrorKind, Read, Result, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use slab::Slab;

use crate::buffer::ChunkChain;
use crate::metrics::ServerMetrics;
use crate::parser::{Request, Status};

const KB: usize = 1024;
const READ_CHUNK: usize = 8 * KB;

/// Where a connection sits in the request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accumulating bytes until a full request parses.
    ReadingRequest,
    /// A request is with the router; nothing is parsed meanwhile.
    ProcessingRequest,
    /// A framed response is draining to the socket.
    WritingResponse,
}

/// Result of a non-blocking fill or flush pass over a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// Bytes moved; the count for this pass.
    Progress(usize),
    /// The socket had nothing to give (or take) right now.
    WouldBlock,
    /// Peer closed the stream.
    Closed,
}

/// One accepted client socket with its buffers and accounting.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    stream: TcpStream,
    state: ConnState,
    chain: ChunkChain,
    request: Option<Request>,
    response: Vec<u8>,
    write_offset: usize,
    response_status: Status,
    keep_alive: bool,
    created_at: Instant,
    last_activity: Instant,
    bytes_read: u64,
    bytes_written: u64,
}

impl Connection {
    /// Wraps a freshly accepted stream. Starts in `ReadingRequest` with an
    /// empty chain and a default `200` status.
    pub fn new(id: u64, stream: TcpStream) -> Self {
        let now = Instant::now();
        Self {
            id,
            stream,
            state: ConnState::ReadingRequest,
            chain: ChunkChain::new(),
            request: None,
            response: Vec::new(),
            write_offset: 0,
            response_status: Status::Ok,
            keep_alive: false,
            created_at: now,
            last_activity: now,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Stable identifier, never reused within the process lifetime. Slab
    /// tokens are reused after close, so anything that outlives a readiness
    /// cycle refers to connections by this id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    /// Inbound chain of unparsed bytes.
    pub(crate) fn chain(&self) -> &ChunkChain {
        &self.chain
    }

    pub(crate) fn chain_mut(&mut self) -> &mut ChunkChain {
        &mut self.chain
    }

    pub(crate) fn take_request(&mut self) -> Option<Request> {
        self.request.take()
    }

    pub(crate) fn set_request(&mut self, request: Request) {
        self.request = Some(request);
    }

    /// Moment the socket was accepted.
    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since the last byte moved in either direction.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Cumulative bytes read from the peer.
    #[inline]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Cumulative bytes written to the peer.
    #[inline]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Status of the in-flight response.
    #[inline]
    pub fn response_status(&self) -> Status {
        self.response_status
    }

    /// Keep-Alive decision for the in-flight response.
    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Bytes of the framed response already on the wire.
    #[inline]
    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Drains the socket into the chain until it would block.
    ///
    /// `Closed` means the peer shut the stream down; `WouldBlock` means the
    /// readiness event carried no data.
    pub fn fill(&mut self) -> Result<IoOutcome> {
        let mut total = 0;
        let mut buf = [0u8; READ_CHUNK];

        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(IoOutcome::Closed),
                Ok(n) => {
                    self.chain.append(&buf[..n]);
                    self.bytes_read += n as u64;
                    self.touch();
                    total += n;
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => {
                        return if total == 0 {
                            Ok(IoOutcome::WouldBlock)
                        } else {
                            Ok(IoOutcome::Progress(total))
                        };
                    }
                    ErrorKind::Interrupted => {}
                    _ => return Err(e),
                },
            }
        }
    }

    /// Installs a framed response and arms the write cycle.
    pub(crate) fn set_response(&mut self, raw: Vec<u8>, status: Status, keep_alive: bool) {
        self.response = raw;
        self.write_offset = 0;
        self.response_status = status;
        self.keep_alive = keep_alive;
        self.state = ConnState::WritingResponse;
    }

    /// True once the whole framed response is on the wire.
    #[inline]
    pub fn response_complete(&self) -> bool {
        self.write_offset == self.response.len()
    }

    /// Pushes pending response bytes to the socket, at most `chunk` bytes per
    /// syscall, until drained or the socket pushes back.
    pub fn flush(&mut self, chunk: usize) -> Result<IoOutcome> {
        let mut total = 0;

        while self.write_offset < self.response.len() {
            let end = (self.write_offset + chunk).min(self.response.len());
            match self.stream.write(&self.response[self.write_offset..end]) {
                Ok(0) => return Ok(IoOutcome::Closed),
                Ok(n) => {
                    self.write_offset += n;
                    self.bytes_written += n as u64;
                    self.touch();
                    total += n;
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => {
                        return if total == 0 {
                            Ok(IoOutcome::WouldBlock)
                        } else {
                            Ok(IoOutcome::Progress(total))
                        };
                    }
                    ErrorKind::Interrupted => {}
                    _ => return Err(e),
                },
            }
        }

        Ok(IoOutcome::Progress(total))
    }

    /// Keep-Alive reset: back to `ReadingRequest` with response state cleared.
    ///
    /// The chain keeps any tail bytes that arrived after the previous
    /// request's end, so a pipelined follow-up request is parsed rather than
    /// dropped. Identity and timestamps are retained.
    pub(crate) fn reset(&mut self) {
        self.request = None;
        self.response = Vec::new();
        self.write_offset = 0;
        self.response_status = Status::Ok;
        self.keep_alive = false;
        self.state = ConnState::ReadingRequest;
    }
}

/// Owns every live connection, keyed by slab token.
#[derive(Debug)]
pub struct ConnectionTable {
    connections: Slab<Connection>,
    next_id: u64,
    metrics: Arc<ServerMetrics>,
}

impl ConnectionTable {
    /// Creates an empty table reporting into `metrics`.
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self {
            connections: Slab::new(),
            next_id: 0,
            metrics,
        }
    }

    /// Admits an accepted stream; returns the slab token to register with
    /// the reactor. Bumps the accepted and active counters exactly once.
    pub fn insert(&mut self, stream: TcpStream) -> usize {
        let id = self.next_id;
        self.next_id += 1;

        let token = self.connections.insert(Connection::new(id, stream));
        self.metrics.connection_opened();
        token
    }

    /// Removes and returns the connection behind `token`, decrementing the
    /// active counter exactly once. The caller closes the socket.
    pub fn remove(&mut self, token: usize) -> Option<Connection> {
        let conn = self.connections.try_remove(token);
        if conn.is_some() {
            self.metrics.connection_closed();
        }
        conn
    }

    /// Connection behind a readiness token.
    pub fn get_mut(&mut self, token: usize) -> Option<&mut Connection> {
        self.connections.get_mut(token)
    }

    /// Re-finds a connection by stable id after a cross-thread hop. `None`
    /// when it was evicted or replaced in the meantime.
    pub fn find_by_id(&mut self, id: u64) -> Option<(usize, &mut Connection)> {
        self.connections
            .iter_mut()
            .find(|(_, c)| c.id() == id)
            .map(|(t, c)| (t, c))
    }

    /// Tokens of connections idle longer than `max_idle`.
    pub fn idle_tokens(&self, max_idle: Duration) -> Vec<usize> {
        let now = Instant::now();
        self.connections
            .iter()
            .filter(|(_, c)| c.idle_for(now) >= max_idle)
            .map(|(t, _)| t)
            .collect()
    }

    /// Every live token, for shutdown teardown.
    pub fn all_tokens(&self) -> Vec<usize> {
        self.connections.iter().map(|(t, _)| t).collect()
    }

    /// Live connection count.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True when no connections are live.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
