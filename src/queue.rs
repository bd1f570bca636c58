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

//! Cross-thread task submission and timing primitives
//!
//! Foreign threads never touch loop state directly. They enqueue closures
//! here; the loop drains them between polls. A single auxiliary scheduler
//! thread orders delayed and periodic work by deadline and feeds it back
//! through the same queue.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};
use mio::Waker;
use thiserror::Error;

use crate::event_loop::LoopState;
use crate::metrics::ServerMetrics;

/// Closure executed on the loop thread with access to loop-owned state.
pub(crate) type LoopTask = Box<dyn FnOnce(&mut LoopState) + Send + 'static>;

/// Failure modes for asynchronous task completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The timeout scheduled alongside the work fired first.
    #[error("task timed out")]
    TimedOut,
    /// The loop or scheduler was already stopped at submission time.
    #[error("event loop is stopped")]
    Stopped,
    /// The supplier reported failure.
    #[error("task failed: {0}")]
    Failed(String),
}

/// Result carried by a [`Promise`].
pub type TaskResult<T> = std::result::Result<T, TaskError>;

// The scheduler parks in bounded slices so shutdown joins promptly.
const SCHED_PARK_MAX: Duration = Duration::from_millis(500);

/// Lightweight enqueue-and-wake handle. Scheduler jobs and completion
/// callbacks capture clones of this instead of the full queue, so nothing
/// long-lived keeps the scheduler alive through a reference cycle.
#[derive(Clone)]
pub(crate) struct Submitter {
    tx: Sender<LoopTask>,
    waker: Arc<Waker>,
    wake_flag: Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
    loop_thread: Arc<Mutex<Option<ThreadId>>>,
    metrics: Arc<ServerMetrics>,
}

impl Submitter {
    /// Enqueues unconditionally and wakes a blocked poll at most once per
    /// poll cycle. Submissions after shutdown are dropped.
    pub(crate) fn enqueue(&self, task: LoopTask) {
        if !self.accepting.load(Ordering::Acquire) {
            debug!("task submitted after shutdown, dropping");
            return;
        }
        if self.tx.send(task).is_err() {
            return;
        }
        self.metrics.task_queued();

        // coalesce: first submission since the last poll wakes it
        if !self.wake_flag.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.waker.wake() {
                warn!("failed to wake event loop: {e}");
            }
        }
    }

    fn in_event_loop(&self) -> bool {
        let guard = self
            .loop_thread
            .lock()
            .expect("loop thread id lock poisoned");
        *guard == Some(thread::current().id())
    }
}

/// Handle for submitting work to the loop thread. Cheap to clone; every
/// clone talks to the same queue, waker, and scheduler.
#[derive(Clone)]
pub struct TaskQueue {
    submitter: Submitter,
    rx: Receiver<LoopTask>,
    scheduler: Arc<Scheduler>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("queued", &self.rx.len())
            .finish()
    }
}

impl TaskQueue {
    pub(crate) fn new(waker: Arc<Waker>, metrics: Arc<ServerMetrics>) -> Self {
        let (tx, rx) = unbounded();
        let submitter = Submitter {
            tx,
            waker,
            wake_flag: Arc::new(AtomicBool::new(false)),
            accepting: Arc::new(AtomicBool::new(true)),
            loop_thread: Arc::new(Mutex::new(None)),
            metrics,
        };
        Self {
            submitter,
            rx,
            scheduler: Arc::new(Scheduler::start()),
        }
    }

    /// True iff called from the loop thread. Consumers use this to elide
    /// queue hops.
    pub fn in_event_loop(&self) -> bool {
        self.submitter.in_event_loop()
    }

    /// Runs `task` on the loop thread. Called from the loop thread itself,
    /// the task runs inline before this returns and never touches the queue;
    /// otherwise it is enqueued FIFO and the poll is woken.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        if self.in_event_loop() {
            task();
            self.submitter.metrics.task_executed();
        } else {
            self.submitter.enqueue(Box::new(move |_| task()));
        }
    }

    /// Internal variant handing the task loop-state access. Always queued,
    /// so connection mutation stays on the loop thread regardless of caller.
    pub(crate) fn execute_on_loop(
        &self,
        task: impl FnOnce(&mut LoopState) + Send + 'static,
    ) {
        self.submitter.enqueue(Box::new(task));
    }

    /// Runs `supplier` on the loop thread, delivering its result through the
    /// returned promise. A stopped queue completes the promise with
    /// [`TaskError::Stopped`] instead of leaving it forever pending.
    pub fn submit_async<T, F>(&self, supplier: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        let promise = Promise::new();
        if !self.submitter.accepting.load(Ordering::Acquire) {
            promise.complete(Err(TaskError::Stopped));
            return promise;
        }
        let completer = promise.clone();
        self.execute(move || completer.complete(supplier()));
        promise
    }

    /// Runs `task` on the loop thread once `delay` has elapsed.
    pub fn schedule(&self, task: impl FnOnce() + Send + 'static, delay: Duration) {
        let sub = self.submitter.clone();
        let scheduled = self
            .scheduler
            .schedule_once(delay, Box::new(move || sub.enqueue(Box::new(move |_| task()))));
        if !scheduled {
            debug!("schedule after shutdown, dropping task");
        }
    }

    /// [`TaskQueue::submit_async`] with an initial delay.
    pub fn schedule_async<T, F>(&self, supplier: F, delay: Duration) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        let promise = Promise::new();
        let completer = promise.clone();
        let sub = self.submitter.clone();
        let scheduled = self.scheduler.schedule_once(
            delay,
            Box::new(move || {
                if !sub.accepting.load(Ordering::Acquire) {
                    completer.complete(Err(TaskError::Stopped));
                    return;
                }
                sub.enqueue(Box::new(move |_| completer.complete(supplier())));
            }),
        );
        if !scheduled {
            promise.complete(Err(TaskError::Stopped));
        }
        promise
    }

    /// Runs `task` on the loop thread every `period`, first after `initial`.
    /// Repetition stops when the scheduler shuts down.
    pub fn schedule_at_fixed_rate(
        &self,
        task: impl FnMut() + Send + 'static,
        initial: Duration,
        period: Duration,
    ) {
        let sub = self.submitter.clone();
        // shared so each firing can hop to the loop thread; only the loop
        // ever takes the lock, the scheduler just clones the handle
        let task = Arc::new(Mutex::new(task));
        let scheduled = self.scheduler.schedule_repeat(
            initial,
            period,
            Box::new(move || {
                let task = Arc::clone(&task);
                sub.enqueue(Box::new(move |_| {
                    (task.lock().expect("fixed-rate task lock poisoned"))()
                }));
            }),
        );
        if !scheduled {
            debug!("fixed-rate schedule after shutdown, dropping task");
        }
    }

    /// Submits `supplier` immediately and arms a timeout that, if the work
    /// has not completed by then, completes the promise with
    /// [`TaskError::TimedOut`]. Whichever completion lands first wins.
    pub fn execute_with_timeout<T, F>(&self, supplier: F, timeout: Duration) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        let promise = self.submit_async(supplier);
        let loser = promise.clone();
        self.scheduler.schedule_once(
            timeout,
            Box::new(move || loser.complete(Err(TaskError::TimedOut))),
        );
        promise
    }

    /// Runs `supplier` on the loop; on failure re-submits after
    /// `retry_delay`, up to `max_retries` additional attempts. The final
    /// failure propagates through the promise.
    pub fn retry<T, F>(
        &self,
        supplier: F,
        max_retries: usize,
        retry_delay: Duration,
    ) -> Promise<T>
    where
        T: Send + 'static,
        F: Fn() -> TaskResult<T> + Send + Sync + 'static,
    {
        let promise = Promise::new();
        retry_attempt(
            self.clone(),
            Arc::new(supplier),
            promise.clone(),
            max_retries,
            retry_delay,
        );
        promise
    }

    /// Feeds `items` to `consumer`, at most `batch_size` per loop iteration,
    /// re-submitting the remainder so one large batch cannot monopolize the
    /// loop.
    pub fn process_batch<I>(
        &self,
        items: Vec<I>,
        consumer: impl FnMut(I) + Send + 'static,
        batch_size: usize,
    ) where
        I: Send + 'static,
    {
        let batch_size = batch_size.max(1);
        run_batch(
            self.submitter.clone(),
            items.into_iter().collect(),
            consumer,
            batch_size,
        );
    }

    /// Runs the given tasks sequentially on the loop thread.
    pub fn execute_all(&self, tasks: Vec<Box<dyn FnOnce() + Send>>) {
        self.execute(move || {
            for task in tasks {
                task();
            }
        });
    }

    /// Tasks currently waiting in the queue.
    pub fn queued_len(&self) -> usize {
        self.rx.len()
    }

    pub(crate) fn mark_loop_thread(&self) {
        let mut guard = self
            .submitter
            .loop_thread
            .lock()
            .expect("loop thread id lock poisoned");
        *guard = Some(thread::current().id());
    }

    /// Clears the wake coalescing flag. The loop calls this after each poll
    /// returns, so the next foreign submission wakes the next poll.
    pub(crate) fn ack_wake(&self) {
        self.submitter.wake_flag.store(false, Ordering::Release);
    }

    /// Drains up to `max` tasks in FIFO order, running each with loop-state
    /// access. Returns the number executed.
    pub(crate) fn drain(&self, state: &mut LoopState, max: usize) -> usize {
        let mut executed = 0;
        while executed < max {
            match self.rx.try_recv() {
                Ok(task) => {
                    self.submitter.metrics.task_dequeued();
                    task(state);
                    self.submitter.metrics.task_executed();
                    executed += 1;
                }
                Err(_) => break,
            }
        }
        executed
    }

    /// Stops intake and tears the scheduler thread down. Queued but not yet
    /// executed tasks are silently discarded.
    pub(crate) fn shutdown(&self) {
        self.submitter.accepting.store(false, Ordering::Release);
        self.scheduler.shutdown();
    }
}

fn retry_attempt<T>(
    queue: TaskQueue,
    supplier: Arc<dyn Fn() -> TaskResult<T> + Send + Sync>,
    promise: Promise<T>,
    remaining: usize,
    delay: Duration,
) where
    T: Send + 'static,
{
    let again = queue.clone();
    queue.execute(move || match supplier() {
        Ok(value) => promise.complete(Ok(value)),
        Err(err) if remaining == 0 => promise.complete(Err(err)),
        Err(_) => {
            let scheduled = again.scheduler.schedule_once(delay, {
                let again = again.clone();
                let promise = promise.clone();
                Box::new(move || {
                    retry_attempt(again.clone(), supplier, promise, remaining - 1, delay)
                })
            });
            if !scheduled {
                promise.complete(Err(TaskError::Stopped));
            }
        }
    });
}

fn run_batch<I>(
    submitter: Submitter,
    mut items: std::collections::VecDeque<I>,
    mut consumer: impl FnMut(I) + Send + 'static,
    batch_size: usize,
) where
    I: Send + 'static,
{
    // continuation goes through the queue even from the loop thread; an
    // inline fast path here would defeat the per-iteration cap
    submitter.clone().enqueue(Box::new(move |_| {
        for _ in 0..batch_size {
            match items.pop_front() {
                Some(item) => consumer(item),
                None => return,
            }
        }
        if !items.is_empty() {
            run_batch(submitter, items, consumer, batch_size);
        }
    }));
}

// ---------------------------------------------------------------------------
// Promise

type Callback<T> = Box<dyn FnOnce(TaskResult<T>) + Send>;

enum PromiseState<T> {
    Pending(Option<Callback<T>>),
    Ready(Option<TaskResult<T>>),
    Taken,
}

struct PromiseInner<T> {
    state: Mutex<PromiseState<T>>,
    cond: Condvar,
}

/// Single-completion handle for a value produced elsewhere.
///
/// Completed at most once; later completions are ignored, which is what lets
/// a timeout race the real result safely. The value goes to a registered
/// [`Promise::on_complete`] callback, or to the first [`Promise::wait_timeout`]
/// caller when no callback is set.
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    /// Creates a pending promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PromiseInner {
                state: Mutex::new(PromiseState::Pending(None)),
                cond: Condvar::new(),
            }),
        }
    }

    /// A promise already completed with `result`.
    pub fn resolved(result: TaskResult<T>) -> Self {
        let promise = Self::new();
        promise.complete(result);
        promise
    }

    /// Completes the promise. First completion wins; the rest are dropped.
    pub fn complete(&self, result: TaskResult<T>) {
        let callback = {
            let mut state = self.inner.state.lock().expect("promise lock poisoned");
            match &mut *state {
                PromiseState::Pending(callback) => match callback.take() {
                    Some(cb) => {
                        *state = PromiseState::Taken;
                        Some((cb, result))
                    }
                    None => {
                        *state = PromiseState::Ready(Some(result));
                        self.inner.cond.notify_all();
                        None
                    }
                },
                // already completed
                PromiseState::Ready(_) | PromiseState::Taken => None,
            }
        };

        // user callback runs outside the lock
        if let Some((cb, result)) = callback {
            cb(result);
        }
    }

    /// Registers the delivery callback. Runs immediately (on the calling
    /// thread) when the promise already holds a value; otherwise it runs on
    /// whichever thread completes the promise.
    pub fn on_complete(&self, callback: impl FnOnce(TaskResult<T>) + Send + 'static) {
        let callback: Callback<T> = Box::new(callback);
        let immediate = {
            let mut state = self.inner.state.lock().expect("promise lock poisoned");
            match &mut *state {
                PromiseState::Pending(slot) => {
                    *slot = Some(callback);
                    None
                }
                PromiseState::Ready(value) => {
                    let value = value.take();
                    *state = PromiseState::Taken;
                    value.map(|value| (callback, value))
                }
                PromiseState::Taken => None,
            }
        };

        // runs outside the lock
        if let Some((callback, value)) = immediate {
            callback(value);
        }
    }

    /// Whether a completion has landed.
    pub fn is_complete(&self) -> bool {
        let state = self.inner.state.lock().expect("promise lock poisoned");
        !matches!(*state, PromiseState::Pending(_))
    }

    /// Blocks until the value arrives or `timeout` elapses. `None` on
    /// timeout, or when the value was already delivered elsewhere.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskResult<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().expect("promise lock poisoned");

        loop {
            match &mut *state {
                PromiseState::Ready(value) => {
                    let value = value.take();
                    *state = PromiseState::Taken;
                    return value;
                }
                PromiseState::Taken => return None,
                PromiseState::Pending(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .inner
                        .cond
                        .wait_timeout(state, deadline - now)
                        .expect("promise lock poisoned");
                    state = guard;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler

enum JobKind {
    Once(Box<dyn FnOnce() + Send>),
    Repeat {
        period: Duration,
        run: Box<dyn FnMut() + Send>,
    },
}

struct Job {
    deadline: Instant,
    seq: u64,
    kind: JobKind,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    // reversed so the max-heap yields the earliest deadline; FIFO within a
    // deadline via submission sequence
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

struct SchedulerInner {
    jobs: Mutex<BinaryHeap<Job>>,
    cond: Condvar,
    running: AtomicBool,
    seq: AtomicU64,
}

/// Deadline-ordered timer wheel on one auxiliary thread.
pub(crate) struct Scheduler {
    inner: Arc<SchedulerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    fn start() -> Self {
        let inner = Arc::new(SchedulerInner {
            jobs: Mutex::new(BinaryHeap::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            seq: AtomicU64::new(0),
        });

        let thread_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("snar-scheduler".into())
            .spawn(move || Self::run(thread_inner))
            .expect("failed to spawn scheduler thread");

        Self {
            inner,
            thread: Mutex::new(Some(thread)),
        }
    }

    fn run(inner: Arc<SchedulerInner>) {
        while inner.running.load(Ordering::Acquire) {
            let due = {
                let mut jobs = inner.jobs.lock().expect("scheduler lock poisoned");
                let now = Instant::now();

                match jobs.peek().map(|job| job.deadline) {
                    Some(deadline) if deadline <= now => jobs.pop(),
                    Some(deadline) => {
                        let wait = (deadline - now).min(SCHED_PARK_MAX);
                        let _ = inner.cond.wait_timeout(jobs, wait);
                        continue;
                    }
                    None => {
                        let _ = inner.cond.wait_timeout(jobs, SCHED_PARK_MAX);
                        continue;
                    }
                }
            };

            // jobs run outside the lock so submissions never contend with them
            if let Some(job) = due {
                match job.kind {
                    JobKind::Once(run) => run(),
                    JobKind::Repeat { period, mut run } => {
                        run();
                        // fixed rate: next deadline anchored to the previous
                        let next = Job {
                            deadline: job.deadline + period,
                            seq: inner.seq.fetch_add(1, Ordering::Relaxed),
                            kind: JobKind::Repeat { period, run },
                        };
                        inner
                            .jobs
                            .lock()
                            .expect("scheduler lock poisoned")
                            .push(next);
                    }
                }
            }
        }
    }

    fn push(&self, deadline: Instant, kind: JobKind) -> bool {
        if !self.inner.running.load(Ordering::Acquire) {
            return false;
        }
        let job = Job {
            deadline,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            kind,
        };
        let mut jobs = self.inner.jobs.lock().expect("scheduler lock poisoned");
        jobs.push(job);
        self.inner.cond.notify_all();
        true
    }

    pub(crate) fn schedule_once(
        &self,
        delay: Duration,
        run: Box<dyn FnOnce() + Send>,
    ) -> bool {
        self.push(Instant::now() + delay, JobKind::Once(run))
    }

    pub(crate) fn schedule_repeat(
        &self,
        initial: Duration,
        period: Duration,
        run: Box<dyn FnMut() + Send>,
    ) -> bool {
        self.push(Instant::now() + initial, JobKind::Repeat { period, run })
    }

    /// Stops intake, wakes the thread, and joins it. The thread parks in
    /// bounded slices, so the join completes well inside the 5 s drain bound.
    pub(crate) fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.cond.notify_all();

        let handle = self
            .thread
            .lock()
            .expect("scheduler thread lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        // pending jobs are canceled without executing
        self.inner
            .jobs
            .lock()
            .expect("scheduler lock poisoned")
            .clear();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.inner.running.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mio::{Poll, Token};

    fn make_queue() -> (Poll, TaskQueue, Arc<ServerMetrics>) {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let metrics = Arc::new(ServerMetrics::default());
        let queue = TaskQueue::new(waker, Arc::clone(&metrics));
        (poll, queue, metrics)
    }

    #[test]
    fn promise_first_completion_wins() {
        let promise: Promise<u32> = Promise::new();
        promise.complete(Ok(7));
        promise.complete(Err(TaskError::TimedOut));
        assert_eq!(Some(Ok(7)), promise.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn promise_wait_times_out_while_pending() {
        let promise: Promise<u32> = Promise::new();
        assert_eq!(None, promise.wait_timeout(Duration::from_millis(20)));
        assert!(!promise.is_complete());
    }

    #[test]
    fn promise_callback_registered_first_gets_the_value() {
        let promise: Promise<&'static str> = Promise::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        promise.on_complete(move |result| tx.send(result).unwrap());
        promise.complete(Ok("done"));
        assert_eq!(Ok(Ok("done")), rx.recv_timeout(Duration::from_millis(100)));
    }

    #[test]
    fn promise_callback_after_completion_runs_immediately() {
        let promise = Promise::resolved(Ok(5u32));
        let (tx, rx) = crossbeam_channel::bounded(1);
        promise.on_complete(move |result| tx.send(result).unwrap());
        assert_eq!(Ok(Ok(5)), rx.try_recv());
    }

    #[test]
    fn promise_completion_unblocks_a_waiting_thread() {
        let promise: Promise<u32> = Promise::new();
        let completer = promise.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(Ok(9));
        });
        assert_eq!(Some(Ok(9)), promise.wait_timeout(Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn inline_execute_skips_the_queue() {
        let (_poll, queue, metrics) = make_queue();
        queue.mark_loop_thread();
        assert!(queue.in_event_loop());

        let (tx, rx) = crossbeam_channel::bounded(1);
        queue.execute(move || tx.send(()).unwrap());

        assert_eq!(Ok(()), rx.try_recv(), "task should run before execute returns");
        assert_eq!(0, queue.queued_len());
        let snapshot = metrics.snapshot();
        assert_eq!(1, snapshot.total_tasks);
        assert_eq!(0, snapshot.queued_tasks);
    }

    #[test]
    fn foreign_execute_enqueues_and_counts() {
        let (_poll, queue, metrics) = make_queue();
        // loop thread never marked, so this caller is foreign
        queue.execute(|| {});
        assert_eq!(1, queue.queued_len());
        assert_eq!(1, metrics.snapshot().queued_tasks);
        assert_eq!(0, metrics.snapshot().total_tasks);
    }

    #[test]
    fn submit_async_inline_delivers_the_result() {
        let (_poll, queue, _metrics) = make_queue();
        queue.mark_loop_thread();
        let promise = queue.submit_async(|| Ok(21 * 2));
        assert_eq!(Some(Ok(42)), promise.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn submit_async_propagates_supplier_failure() {
        let (_poll, queue, _metrics) = make_queue();
        queue.mark_loop_thread();
        let promise: Promise<u32> =
            queue.submit_async(|| Err(TaskError::Failed("boom".into())));
        assert_eq!(
            Some(Err(TaskError::Failed("boom".into()))),
            promise.wait_timeout(Duration::from_millis(10))
        );
    }

    #[test]
    fn schedule_lands_on_the_queue_after_the_delay() {
        let (_poll, queue, _metrics) = make_queue();
        queue.schedule(|| {}, Duration::from_millis(30));
        assert_eq!(0, queue.queued_len());

        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.queued_len() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(1, queue.queued_len());
    }

    #[test]
    fn fixed_rate_keeps_firing() {
        let (_poll, queue, _metrics) = make_queue();
        queue.schedule_at_fixed_rate(
            || {},
            Duration::from_millis(10),
            Duration::from_millis(10),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.queued_len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(queue.queued_len() >= 3);
    }

    #[test]
    fn timeout_wins_when_the_work_never_runs() {
        let (_poll, queue, _metrics) = make_queue();
        // never drained: the supplier sits in the queue while the timeout fires
        let promise = queue.execute_with_timeout(|| Ok(1u32), Duration::from_millis(30));
        assert_eq!(
            Some(Err(TaskError::TimedOut)),
            promise.wait_timeout(Duration::from_secs(2))
        );
    }

    #[test]
    fn completed_work_beats_a_later_timeout() {
        let (_poll, queue, _metrics) = make_queue();
        queue.mark_loop_thread();
        let promise = queue.execute_with_timeout(|| Ok(1u32), Duration::from_millis(30));
        // inline execution completed before the timeout could fire
        assert_eq!(Some(Ok(1)), promise.wait_timeout(Duration::from_millis(10)));
        thread::sleep(Duration::from_millis(50));
        assert!(promise.is_complete());
    }

    #[test]
    fn retry_succeeds_inline_on_first_attempt() {
        let (_poll, queue, _metrics) = make_queue();
        queue.mark_loop_thread();
        let promise = queue.retry(|| Ok(5u32), 3, Duration::from_millis(5));
        assert_eq!(Some(Ok(5)), promise.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn retry_with_no_budget_propagates_the_failure() {
        let (_poll, queue, _metrics) = make_queue();
        queue.mark_loop_thread();
        let promise: Promise<u32> =
            queue.retry(|| Err(TaskError::Failed("nope".into())), 0, Duration::from_millis(5));
        assert_eq!(
            Some(Err(TaskError::Failed("nope".into()))),
            promise.wait_timeout(Duration::from_millis(10))
        );
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let (_poll, queue, metrics) = make_queue();
        queue.shutdown();

        queue.execute(|| {});
        assert_eq!(0, queue.queued_len());
        assert_eq!(0, metrics.snapshot().queued_tasks);

        let promise: Promise<u32> = queue.submit_async(|| Ok(1));
        assert_eq!(
            Some(Err(TaskError::Stopped)),
            promise.wait_timeout(Duration::from_millis(10))
        );

        let scheduled: Promise<u32> = queue.schedule_async(|| Ok(1), Duration::from_millis(1));
        assert_eq!(
            Some(Err(TaskError::Stopped)),
            scheduled.wait_timeout(Duration::from_millis(100))
        );
    }
}
