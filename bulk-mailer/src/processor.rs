//! Per-delivery send policy.
//!
//! For every delivered task the processor either sends it or defers it.
//! Deferral never blocks a worker: the task is re-enqueued with a delay and
//! the current delivery reports success.
//!
//! ```text
//! decode ─► paused? ──yes──► requeue (pause delay)
//!             │no
//!             ▼
//!        rate allows? ─no──► requeue (rate delay)
//!             │yes
//!             ▼
//!          transport ──err─► failed += 1, Err (engine retries)
//!             │ok
//!             ▼
//!          sent += 1
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::TaskError;
use crate::limiter::{SlidingWindowLimiter, GLOBAL_RATE_KEY};
use crate::pause::PauseControl;
use crate::queue::{
    enqueue_email, Delivery, DeliveryHandler, EmailTask, EnqueueOptions, RetryPolicy, TaskQueue,
    EMAIL_TASK_TYPE,
};
use crate::stats::Stats;
use crate::transport::Transport;

/// Why a task was deferred instead of sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    Paused,
    RateLimited,
}

impl Deferral {
    pub fn as_str(&self) -> &'static str {
        match self {
            Deferral::Paused => "paused",
            Deferral::RateLimited => "rate_limited",
        }
    }
}

/// What happened to one delivery that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Requeued { reason: Deferral, delay: Duration },
    DeadLettered { reason: Deferral },
}

/// Delays and optional cap for cooperative deferrals.
///
/// The default requeues at a fixed 5s (paused) or 10s (rate limited) with no
/// cap, so a task waits out a pause indefinitely. Growth and a dead-letter
/// cap are opt-in.
#[derive(Debug, Clone, Copy)]
pub struct RequeuePolicy {
    pub paused: RetryPolicy,
    pub rate_limited: RetryPolicy,
    /// Deferrals allowed before a task is dead-lettered; `None` never gives up
    pub max_requeues: Option<u32>,
}

impl RequeuePolicy {
    /// Delay for a task that has already been deferred `requeues` times.
    pub fn delay_for(&self, reason: Deferral, requeues: u32) -> Duration {
        match reason {
            Deferral::Paused => self.paused.delay_for(requeues),
            Deferral::RateLimited => self.rate_limited.delay_for(requeues),
        }
    }

    /// Whether a task deferred `requeues` times has run out of deferrals.
    pub fn exhausted(&self, requeues: u32) -> bool {
        self.max_requeues.is_some_and(|max| requeues >= max)
    }
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self {
            paused: RetryPolicy::fixed(Duration::from_secs(5)),
            rate_limited: RetryPolicy::fixed(Duration::from_secs(10)),
            max_requeues: None,
        }
    }
}

/// Decides send vs. requeue for each delivered email task.
pub struct TaskProcessor {
    queue: Arc<dyn TaskQueue>,
    pause: Arc<dyn PauseControl>,
    limiter: Arc<SlidingWindowLimiter>,
    transport: Arc<dyn Transport>,
    stats: Arc<Stats>,
    policy: RequeuePolicy,
    max_attempts: u32,
}

impl TaskProcessor {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        pause: Arc<dyn PauseControl>,
        limiter: Arc<SlidingWindowLimiter>,
        transport: Arc<dyn Transport>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            queue,
            pause,
            limiter,
            transport,
            stats,
            policy: RequeuePolicy::default(),
            max_attempts: 3,
        }
    }

    pub fn with_policy(mut self, policy: RequeuePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Attempt allowance given to requeued tasks.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Run the send policy for one raw payload.
    ///
    /// A decode failure is returned as an error and therefore retried by the
    /// engine like any other failure, even though it cannot succeed later.
    pub async fn process(&self, payload: &[u8]) -> Result<Outcome, TaskError> {
        let task = EmailTask::decode(payload).map_err(|e| {
            error!(
                error = %e,
                payload_preview = %String::from_utf8_lossy(&payload[..payload.len().min(200)]),
                "task_payload_decode_failed"
            );
            TaskError::Decode(e)
        })?;

        if self.pause.is_paused().await {
            return self.defer(&task, Deferral::Paused).await;
        }

        if !self.limiter.allow(GLOBAL_RATE_KEY) {
            warn!(key = GLOBAL_RATE_KEY, to = %task.to, "rate_limit_exceeded");
            return self.defer(&task, Deferral::RateLimited).await;
        }

        if let Err(e) = self.transport.send(&task.to, &task.subject, &task.body).await {
            self.stats.record_failed();
            error!(to = %task.to, error = %e, "email_send_failed");
            return Err(TaskError::Transport(e));
        }

        self.stats.record_sent();
        info!(
            to = %task.to,
            requeues = task.requeues,
            queued_for_ms = (chrono::Utc::now() - task.first_enqueued_at).num_milliseconds(),
            "email_sent"
        );
        Ok(Outcome::Sent)
    }

    /// Re-enqueue a fresh copy of `task` after the policy's delay, or
    /// dead-letter it once a configured requeue cap is reached.
    async fn defer(&self, task: &EmailTask, reason: Deferral) -> Result<Outcome, TaskError> {
        if self.policy.exhausted(task.requeues) {
            let payload = task.encode().map_err(|e| TaskError::Requeue(e.into()))?;
            let why = format!(
                "deferred {} times ({}) without being sent",
                task.requeues,
                reason.as_str()
            );
            self.queue
                .dead_letter(EMAIL_TASK_TYPE, payload, &why)
                .await
                .map_err(TaskError::Requeue)?;
            self.stats.record_dead_lettered();
            warn!(
                to = %task.to,
                requeues = task.requeues,
                reason = reason.as_str(),
                "task_requeue_limit_reached"
            );
            return Ok(Outcome::DeadLettered { reason });
        }

        let delay = self.policy.delay_for(reason, task.requeues);
        let next = task.requeued();
        let opts = EnqueueOptions::new(self.max_attempts).with_delay(delay);

        enqueue_email(self.queue.as_ref(), &next, opts)
            .await
            .map_err(TaskError::Requeue)?;

        info!(
            to = %task.to,
            reason = reason.as_str(),
            requeues = next.requeues,
            delay_ms = delay.as_millis() as u64,
            "task_requeued"
        );
        Ok(Outcome::Requeued { reason, delay })
    }
}

#[async_trait]
impl DeliveryHandler for TaskProcessor {
    async fn handle(&self, delivery: &Delivery) -> Result<(), TaskError> {
        self.process(&delivery.payload).await.map(|_| ())
    }
}
