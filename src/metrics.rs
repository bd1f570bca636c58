//! Loop and connection counters

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Counters the loop and connection table write as they go.
///
/// All access is `Relaxed`: readers take snapshots without synchronization
/// and may observe slightly stale values.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    running: AtomicBool,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    total_loops: AtomicU64,
    total_tasks: AtomicU64,
    queued_tasks: AtomicU64,
    last_loop_nanos: AtomicU64,
}

impl ServerMetrics {
    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub(crate) fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn loop_completed(&self, elapsed: Duration) {
        self.total_loops.fetch_add(1, Ordering::Relaxed);
        self.last_loop_nanos
            .store(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn task_executed(&self) {
        self.total_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_queued(&self) {
        self.queued_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_dequeued(&self) {
        self.queued_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn total_loops(&self) -> u64 {
        self.total_loops.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            running: self.running.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            total_loops: self.total_loops.load(Ordering::Relaxed),
            total_tasks: self.total_tasks.load(Ordering::Relaxed),
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
            last_loop_duration: Duration::from_nanos(self.last_loop_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Loosely-consistent view of the server's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Whether the loop thread is live.
    pub running: bool,
    /// Connections ever accepted.
    pub total_connections: u64,
    /// Connections currently in the table.
    pub active_connections: u64,
    /// Bytes read off all sockets.
    pub bytes_read: u64,
    /// Bytes written to all sockets.
    pub bytes_written: u64,
    /// Loop iterations completed.
    pub total_loops: u64,
    /// Tasks executed on the loop.
    pub total_tasks: u64,
    /// Tasks waiting in the queue.
    pub queued_tasks: u64,
    /// Wall time of the most recent iteration.
    pub last_loop_duration: Duration,
}
