//! Task payloads and queue-engine data types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task type under which email sends are enqueued and routed.
pub const EMAIL_TASK_TYPE: &str = "email:send";

/// Queue name for email send tasks.
pub const EMAIL_QUEUE: &str = "email_send";

// =============================================================================
// Email Task (email_send queue)
// =============================================================================

/// One email to deliver.
///
/// The address, subject and body never change once built. `requeues` and
/// `first_enqueued_at` follow the task across cooperative deferrals so the
/// processor can back off and eventually give up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailTask {
    /// Recipient email address
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Times this task was deferred because of pause or rate pressure
    #[serde(default)]
    pub requeues: u32,
    /// When the producer first enqueued this email
    #[serde(default = "Utc::now")]
    pub first_enqueued_at: DateTime<Utc>,
}

impl EmailTask {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            requeues: 0,
            first_enqueued_at: Utc::now(),
        }
    }

    /// Fresh copy for the next deferral, same content and origin time.
    pub fn requeued(&self) -> Self {
        Self {
            requeues: self.requeues.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

// =============================================================================
// Queue engine types
// =============================================================================

/// Per-task scheduling options handed to the queue engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Delay before the task becomes deliverable
    pub delay: Duration,
    /// Total delivery attempts the engine allows before dead-lettering
    pub max_attempts: u32,
}

impl EnqueueOptions {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            delay: Duration::ZERO,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// One delivery of a task to a handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub task_type: String,
    pub payload: Vec<u8>,
    /// 1 on the first delivery, incremented by each engine retry
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Queue depth as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub queue: String,
    /// Ready for delivery now
    pub pending: u64,
    /// Waiting on a delay (requeues and retries)
    pub scheduled: u64,
    /// Currently being handled by this process
    pub active: u64,
    /// Dead-lettered
    pub dead: u64,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.pending + self.scheduled + self.active
    }
}
