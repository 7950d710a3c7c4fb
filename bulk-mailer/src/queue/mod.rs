//! Queue engine port and implementations.
//!
//! ```text
//! BulkProducer ─┐                        ┌─ MemoryQueue (tests, single node)
//!               ├─► TaskQueue (engine) ──┤
//! TaskProcessor ┘     │ consume          └─ AmqpQueue  (RabbitMQ)
//!                     ▼
//!              DeliveryHandler (TaskProcessor)
//! ```
//!
//! The engine owns scheduling: delayed delivery, retry with backoff after a
//! handler error, and dead-lettering once a task's attempts run out.

pub mod amqp;
pub mod memory;
pub mod retry;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{QueueError, TaskError};

pub use amqp::AmqpQueue;
pub use memory::{DeadLetter, MemoryQueue, QueuedTask};
pub use retry::RetryPolicy;
pub use types::{Delivery, EmailTask, EnqueueOptions, QueueDepth, EMAIL_QUEUE, EMAIL_TASK_TYPE};

/// Per-delivery callback run by a queue consumer.
///
/// `Err` marks the attempt as failed; the engine decides whether to retry.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), TaskError>;
}

/// Client and consumer surface of the external queue engine.
///
/// Implementations must be safe to call from many tasks at once.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Name of the queue this engine feeds.
    fn name(&self) -> &str;

    /// Enqueue a payload; returns the engine's task id.
    async fn enqueue(
        &self,
        task_type: &str,
        payload: Vec<u8>,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError>;

    /// Move a payload straight to the dead-letter path.
    async fn dead_letter(
        &self,
        task_type: &str,
        payload: Vec<u8>,
        reason: &str,
    ) -> Result<(), QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    /// Deliver tasks of `task_type` to `handler` with up to `concurrency`
    /// deliveries in flight, until `shutdown` flips to `true`.
    ///
    /// Returns once in-flight deliveries have finished.
    async fn consume(
        &self,
        task_type: &str,
        concurrency: usize,
        handler: Arc<dyn DeliveryHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError>;
}

/// Encode and enqueue an [`EmailTask`].
pub async fn enqueue_email(
    queue: &dyn TaskQueue,
    task: &EmailTask,
    opts: EnqueueOptions,
) -> Result<String, QueueError> {
    let payload = task.encode()?;
    queue.enqueue(EMAIL_TASK_TYPE, payload, opts).await
}
