//! # Operation Queue
//!
//! Bounded worker pool feeding operation ids to one driver. One queue exists per
//! operation kind so a backlog of one kind cannot starve another; the worker count
//! is the only admission control.
//!
//! ## Deduplication
//!
//! An id is held in at most one of two places: the pending list or a worker.
//! - `add` of an id that is already pending is a no-op
//! - `add` of an id a worker is processing marks it dirty; it is pushed back when
//!   that worker finishes, never handed to a second worker concurrently
//!
//! ## Delays
//!
//! A requeue with a delay releases the worker immediately and schedules a future
//! `add` on a timer task. Workers never sleep on behalf of an operation.
//!
//! Each id has at most one live deadline. Scheduling again keeps the earlier
//! one, and handing the id to a worker invalidates it, so superseded timers fire
//! as no-ops. A requeue returned by the driver absorbs an `add` made while the
//! id was in flight: the id comes back after the requested delay, not at once.

use crate::error::{EngineError, EngineResult};
use crate::models::OperationId;
use crate::orchestration::types::{OperationProcessor, SpeedFactor};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Snapshot of a queue's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatistics {
    /// Driver invocations completed
    pub processed: u64,
    /// Invocations that asked to be requeued
    pub requeued: u64,
    /// Invocations that finished the operation (success or permanent failure)
    pub finished: u64,
    /// `add` calls absorbed because the id was already pending or in flight
    pub deduplicated: u64,
    /// Invocations that panicked
    pub panicked: u64,
}

#[derive(Debug, Default)]
struct QueueCounters {
    processed: AtomicU64,
    requeued: AtomicU64,
    finished: AtomicU64,
    deduplicated: AtomicU64,
    panicked: AtomicU64,
}

impl QueueCounters {
    fn snapshot(&self) -> QueueStatistics {
        QueueStatistics {
            processed: self.processed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<OperationId>,
    /// Ids waiting in `pending` or waiting for their worker to finish
    dirty: HashSet<OperationId>,
    /// Ids currently held by a worker
    processing: HashSet<OperationId>,
    /// Live re-add deadline per id
    scheduled: HashMap<OperationId, Instant>,
}

impl QueueState {
    /// Returns false if the add was absorbed
    fn add(&mut self, id: OperationId) -> bool {
        if self.dirty.contains(&id) {
            return false;
        }
        self.dirty.insert(id.clone());
        if !self.processing.contains(&id) {
            self.pending.push_back(id);
        }
        true
    }

    fn pop(&mut self) -> Option<OperationId> {
        let id = self.pending.pop_front()?;
        self.dirty.remove(&id);
        self.scheduled.remove(&id);
        self.processing.insert(id.clone());
        Some(id)
    }

    /// Release the id after a worker ran it.
    ///
    /// With `requeue` the driver's own requeue replaces an add made while the id
    /// was in flight. Returns true if the id is pending again.
    fn done(&mut self, id: &OperationId, requeue: bool) -> bool {
        self.processing.remove(id);
        if requeue {
            self.dirty.remove(id);
            return false;
        }
        if self.dirty.contains(id) {
            self.pending.push_back(id.clone());
            return true;
        }
        false
    }

    /// Record a re-add deadline. Returns false if an earlier one is already live.
    fn schedule(&mut self, id: OperationId, deadline: Instant) -> bool {
        match self.scheduled.get(&id) {
            Some(existing) if *existing <= deadline => false,
            _ => {
                self.scheduled.insert(id, deadline);
                true
            }
        }
    }

    /// Claim a fired deadline; false if it was superseded or invalidated
    fn take_due(&mut self, id: &OperationId, deadline: Instant) -> bool {
        if self.scheduled.get(id) == Some(&deadline) {
            self.scheduled.remove(id);
            return true;
        }
        false
    }
}

struct QueueInner {
    name: String,
    processor: Arc<dyn OperationProcessor>,
    state: Mutex<QueueState>,
    available: Notify,
    running: AtomicBool,
    shutdown: Notify,
    speed_factor: SpeedFactor,
    counters: QueueCounters,
}

impl QueueInner {
    fn add(&self, id: OperationId) {
        let added = self.state.lock().add(id.clone());
        if added {
            debug!(queue = %self.name, operation_id = %id, "Operation queued");
            self.available.notify_one();
        } else {
            self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
            debug!(queue = %self.name, operation_id = %id, "Operation already queued");
        }
    }

    /// Next id to process, or `None` once the queue is stopping
    async fn next(&self) -> Option<OperationId> {
        loop {
            let shutdown = self.shutdown.notified();
            let available = self.available.notified();
            tokio::pin!(shutdown);
            tokio::pin!(available);
            // Register before checking so a stop or push in between is not missed
            shutdown.as_mut().enable();
            available.as_mut().enable();

            if !self.running.load(Ordering::Acquire) {
                return None;
            }
            if let Some(id) = self.state.lock().pop() {
                return Some(id);
            }

            tokio::select! {
                _ = &mut shutdown => return None,
                _ = &mut available => {}
            }
        }
    }

}

/// Releases the id even if the worker unwinds or is aborted
struct InFlight<'a> {
    inner: &'a Arc<QueueInner>,
    id: &'a OperationId,
    requeue: Option<Duration>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let requeue = self.requeue.take();
        if self.inner.state.lock().done(self.id, requeue.is_some()) {
            self.inner.available.notify_one();
        }
        if let Some(delay) = requeue {
            schedule(self.inner, self.id.clone(), delay);
        }
    }
}

pub struct OperationQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl OperationQueue {
    pub fn new(name: impl Into<String>, processor: Arc<dyn OperationProcessor>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                processor,
                state: Mutex::new(QueueState::default()),
                available: Notify::new(),
                running: AtomicBool::new(false),
                shutdown: Notify::new(),
                speed_factor: SpeedFactor::default(),
                counters: QueueCounters::default(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue `id` for processing. Ids may be added before `run`; they wait until
    /// workers start.
    pub fn add(&self, id: OperationId) {
        self.inner.add(id);
    }

    /// Queue `id` after `delay` (divided by the speed factor) without holding a worker
    pub fn add_after(&self, id: OperationId, delay: Duration) {
        schedule(&self.inner, id, delay);
    }

    /// Start `worker_count` workers
    pub fn run(&self, worker_count: usize) -> EngineResult<()> {
        if worker_count == 0 {
            return Err(EngineError::InvalidState(format!(
                "queue '{}' needs at least one worker",
                self.inner.name
            )));
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::InvalidState(format!(
                "queue '{}' is already running",
                self.inner.name
            )));
        }

        let mut workers = self.workers.lock();
        for worker_id in 0..worker_count {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(worker_loop(inner, worker_id)));
        }
        info!(queue = %self.inner.name, worker_count, "🏊 QUEUE: Workers started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Stop taking new work and wait for in-flight invocations to finish.
    ///
    /// Workers still busy after `timeout` are aborted and an error is returned.
    /// Pending ids and scheduled re-adds are discarded; they are recovered from
    /// the store on the next start.
    pub async fn shutdown(&self, timeout: Duration) -> EngineResult<()> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        info!(queue = %self.inner.name, "🏊 QUEUE: Shutting down");
        self.inner.shutdown.notify_waiters();
        self.inner.state.lock().scheduled.clear();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        if e.is_panic() {
                            error!(queue = %self.inner.name, "Queue worker panicked");
                        }
                    }
                }
                info!(queue = %self.inner.name, "🏊 QUEUE: Shutdown complete");
                Ok(())
            }
            Err(_) => {
                warn!(
                    queue = %self.inner.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Workers did not stop in time, aborting them"
                );
                for abort in aborts {
                    abort.abort();
                }
                Err(EngineError::Timeout(format!(
                    "queue '{}' did not shut down within {timeout:?}",
                    self.inner.name
                )))
            }
        }
    }

    /// Divide every requeue delay by `factor`
    pub fn speed_up(&self, factor: u32) {
        info!(queue = %self.inner.name, factor, "Queue speed factor changed");
        self.inner.speed_factor.set(factor);
    }

    /// Ids waiting for a worker
    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids currently held by a worker
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().processing.len()
    }

    pub fn statistics(&self) -> QueueStatistics {
        self.inner.counters.snapshot()
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .field("statistics", &self.statistics())
            .finish()
    }
}

fn schedule(inner: &Arc<QueueInner>, id: OperationId, delay: Duration) {
    let delay = inner.speed_factor.scale(delay);
    if delay.is_zero() {
        inner.add(id);
        return;
    }

    let deadline = Instant::now() + delay;
    if !inner.state.lock().schedule(id.clone(), deadline) {
        debug!(queue = %inner.name, operation_id = %id, "Earlier requeue already scheduled");
        return;
    }

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                let due = inner.state.lock().take_due(&id, deadline);
                if due {
                    inner.add(id);
                }
            }
            _ = inner.shutdown.notified() => {
                debug!(queue = %inner.name, operation_id = %id, "Dropping scheduled requeue on shutdown");
            }
        }
    });
}

async fn worker_loop(inner: Arc<QueueInner>, worker_id: usize) {
    debug!(queue = %inner.name, worker_id, "Queue worker started");

    while let Some(id) = inner.next().await {
        let mut in_flight = InFlight {
            inner: &inner,
            id: &id,
            requeue: None,
        };

        let outcome = AssertUnwindSafe(inner.processor.process(&id))
            .catch_unwind()
            .await;
        inner.counters.processed.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(result) if result.requeue => {
                inner.counters.requeued.fetch_add(1, Ordering::Relaxed);
                in_flight.requeue = Some(result.delay);
            }
            Ok(_) => {
                inner.counters.finished.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %inner.name, operation_id = %id, "Operation finished");
            }
            Err(_) => {
                // Left for the next startup recovery scan
                inner.counters.panicked.fetch_add(1, Ordering::Relaxed);
                error!(queue = %inner.name, operation_id = %id, "Operation processing panicked");
            }
        }
    }

    debug!(queue = %inner.name, worker_id, "Queue worker stopped");
}
