//! In-process queue engine.
//!
//! Behaves like the production engine from the processor's point of view:
//! delayed delivery, bounded retries with exponential backoff, a dead-letter
//! list and a concurrent consumer with graceful drain. State does not survive
//! the process.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Delivery, DeliveryHandler, EnqueueOptions, QueueDepth, RetryPolicy, TaskQueue};
use crate::error::QueueError;

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    task_type: String,
    payload: Vec<u8>,
    delay: Duration,
    attempts_made: u32,
    max_attempts: u32,
}

/// Inspection view of a task still waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub id: String,
    pub task_type: String,
    pub payload: Vec<u8>,
    /// Delay requested when the task was last scheduled
    pub delay: Duration,
    pub attempts_made: u32,
    pub max_attempts: u32,
}

impl From<&Entry> for QueuedTask {
    fn from(e: &Entry) -> Self {
        Self {
            id: e.id.clone(),
            task_type: e.task_type.clone(),
            payload: e.payload.clone(),
            delay: e.delay,
            attempts_made: e.attempts_made,
            max_attempts: e.max_attempts,
        }
    }
}

/// A task removed from active processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub id: String,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub reason: String,
}

#[derive(Default)]
struct Inner {
    ready: VecDeque<Entry>,
    scheduled: BTreeMap<(Instant, u64), Entry>,
    dead: Vec<DeadLetter>,
    seq: u64,
}

impl Inner {
    fn push(&mut self, entry: Entry, now: Instant) {
        if entry.delay.is_zero() {
            self.ready.push_back(entry);
        } else {
            self.seq += 1;
            self.scheduled.insert((now + entry.delay, self.seq), entry);
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.scheduled.first_entry() {
            if entry.key().0 > now {
                break;
            }
            self.ready.push_back(entry.remove());
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.scheduled.keys().next().map(|(at, _)| *at)
    }

    /// Pop the first ready entry of `task_type`, leaving other types queued.
    fn pop_ready(&mut self, task_type: &str) -> Option<Entry> {
        let idx = self.ready.iter().position(|e| e.task_type == task_type)?;
        self.ready.remove(idx)
    }
}

/// [`TaskQueue`] held entirely in memory.
pub struct MemoryQueue {
    name: String,
    retry: RetryPolicy,
    inner: Mutex<Inner>,
    notify: Notify,
    active: AtomicUsize,
    consumers: AtomicUsize,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            retry,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            active: AtomicUsize::new(0),
            consumers: AtomicUsize::new(0),
        }
    }

    /// Tasks waiting for delivery, ready ones first, then by due time.
    pub fn queued(&self) -> Vec<QueuedTask> {
        let inner = self.inner.lock();
        inner
            .ready
            .iter()
            .chain(inner.scheduled.values())
            .map(QueuedTask::from)
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().dead.clone()
    }

    /// Number of `consume` calls currently running.
    pub fn consumer_count(&self) -> usize {
        self.consumers.load(Ordering::SeqCst)
    }

    fn schedule(&self, entry: Entry) {
        self.inner.lock().push(entry, Instant::now());
        self.notify.notify_one();
    }

    fn bury(&self, entry: Entry, reason: String) {
        warn!(
            queue = %self.name,
            task_id = %entry.id,
            attempts = entry.attempts_made,
            reason = %reason,
            "task_dead_lettered"
        );
        self.inner.lock().dead.push(DeadLetter {
            id: entry.id,
            task_type: entry.task_type,
            payload: entry.payload,
            reason,
        });
    }

    /// Wait for the next deliverable entry, or `None` on shutdown.
    async fn next_entry(
        &self,
        task_type: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Entry> {
        loop {
            if *shutdown.borrow() {
                return None;
            }

            // Register interest before inspecting state so a concurrent
            // enqueue cannot slip between the check and the wait.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut inner = self.inner.lock();
                inner.promote_due(Instant::now());
                if let Some(entry) = inner.pop_ready(task_type) {
                    self.active.fetch_add(1, Ordering::SeqCst);
                    return Some(entry);
                }
                inner.next_due()
            };

            let wake_at = next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(wake_at) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        task_type: &str,
        handler: Arc<dyn DeliveryHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        while let Some(entry) = self.next_entry(task_type, &mut shutdown).await {
            let delivery = Delivery {
                id: entry.id.clone(),
                task_type: entry.task_type.clone(),
                payload: entry.payload.clone(),
                attempt: entry.attempts_made + 1,
                max_attempts: entry.max_attempts,
            };

            let in_flight = InFlight {
                queue: self,
                entry: Some(entry),
            };
            let result = handler.handle(&delivery).await;
            let Some(mut entry) = in_flight.finish() else {
                continue;
            };

            let Err(err) = result else {
                debug!(worker_id, task_id = %entry.id, "task_completed");
                continue;
            };

            entry.attempts_made += 1;
            if entry.attempts_made >= entry.max_attempts {
                self.bury(entry, err.to_string());
                continue;
            }

            entry.delay = self.retry.delay_for(entry.attempts_made - 1);
            warn!(
                worker_id,
                task_id = %entry.id,
                attempt = entry.attempts_made,
                max_attempts = entry.max_attempts,
                retry_in_ms = entry.delay.as_millis() as u64,
                error = %err,
                "task_retry_scheduled"
            );
            self.schedule(entry);
        }
    }
}

/// An entry popped for delivery. Counts toward `active` until dropped.
///
/// If the worker is cancelled mid-delivery the entry goes back to the front
/// of the ready queue with its attempt count unchanged.
struct InFlight<'a> {
    queue: &'a MemoryQueue,
    entry: Option<Entry>,
}

impl InFlight<'_> {
    /// The handler returned; hand the entry back for settling.
    fn finish(mut self) -> Option<Entry> {
        self.entry.take()
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(entry) = self.entry.take() {
            warn!(queue = %self.queue.name, task_id = %entry.id, "in_flight_task_returned");
            self.queue.inner.lock().ready.push_front(entry);
            self.queue.notify.notify_one();
        }
    }
}

/// Keeps `consumers` accurate even when a consumer is aborted.
struct ConsumerCount<'a>(&'a AtomicUsize);

impl<'a> ConsumerCount<'a> {
    fn register(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ConsumerCount<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(
        &self,
        task_type: &str,
        payload: Vec<u8>,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        self.schedule(Entry {
            id: id.clone(),
            task_type: task_type.to_string(),
            payload,
            delay: opts.delay,
            attempts_made: 0,
            max_attempts: opts.max_attempts.max(1),
        });
        Ok(id)
    }

    async fn dead_letter(
        &self,
        task_type: &str,
        payload: Vec<u8>,
        reason: &str,
    ) -> Result<(), QueueError> {
        self.bury(
            Entry {
                id: Uuid::new_v4().to_string(),
                task_type: task_type.to_string(),
                payload,
                delay: Duration::ZERO,
                attempts_made: 0,
                max_attempts: 1,
            },
            reason.to_string(),
        );
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let inner = self.inner.lock();
        Ok(QueueDepth {
            queue: self.name.clone(),
            pending: inner.ready.len() as u64,
            scheduled: inner.scheduled.len() as u64,
            active: self.active.load(Ordering::SeqCst) as u64,
            dead: inner.dead.len() as u64,
        })
    }

    async fn consume(
        &self,
        task_type: &str,
        concurrency: usize,
        handler: Arc<dyn DeliveryHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        let concurrency = concurrency.max(1);
        let _registered = ConsumerCount::register(&self.consumers);
        info!(queue = %self.name, task_type, concurrency, "memory_consumer_started");

        let workers = (0..concurrency).map(|worker_id| {
            self.worker_loop(worker_id, task_type, Arc::clone(&handler), shutdown.clone())
        });
        join_all(workers).await;

        info!(queue = %self.name, "memory_consumer_stopped");
        Ok(())
    }
}
