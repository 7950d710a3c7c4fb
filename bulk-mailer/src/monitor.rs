//! Read-only operational view.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::pause::PauseControl;
use crate::queue::{QueueDepth, TaskQueue};
use crate::stats::Stats;

/// Counters, pause state and queue depth read moments apart.
///
/// Counters cover this process only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    pub queue: String,
    /// `None` when the queue engine could not be inspected
    pub queue_info: Option<QueueDepth>,
    pub sent: u64,
    pub failed: u64,
    pub enqueued: u64,
    pub dead_lettered: u64,
    pub paused: bool,
}

pub struct Monitor {
    queue: Arc<dyn TaskQueue>,
    stats: Arc<Stats>,
    pause: Arc<dyn PauseControl>,
}

impl Monitor {
    pub fn new(queue: Arc<dyn TaskQueue>, stats: Arc<Stats>, pause: Arc<dyn PauseControl>) -> Self {
        Self {
            queue,
            stats,
            pause,
        }
    }

    pub async fn snapshot(&self) -> MonitorSnapshot {
        let queue_info = match self.queue.depth().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                warn!(queue = %self.queue.name(), error = %e, "queue_inspect_failed");
                None
            }
        };

        let counters = self.stats.snapshot();

        MonitorSnapshot {
            queue: self.queue.name().to_string(),
            queue_info,
            sent: counters.sent,
            failed: counters.failed,
            enqueued: counters.enqueued,
            dead_lettered: counters.dead_lettered,
            paused: self.pause.is_paused().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pause::PauseCoordinator;
    use crate::queue::{enqueue_email, EmailTask, EnqueueOptions, MemoryQueue, RetryPolicy};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_snapshot_combines_sources() {
        let queue = Arc::new(MemoryQueue::new("emails", RetryPolicy::default()));
        let stats = Arc::new(Stats::new());
        let pause = Arc::new(PauseCoordinator::new(Arc::new(MemoryStore::new())));
        let monitor = Monitor::new(queue.clone(), stats.clone(), pause.clone());

        enqueue_email(
            queue.as_ref(),
            &EmailTask::new("a@x.com", "S", "B"),
            EnqueueOptions::new(3),
        )
        .await
        .unwrap();
        stats.record_enqueued(1);
        stats.record_sent();
        pause.pause().await.unwrap();

        let snap = monitor.snapshot().await;
        assert_eq!(snap.queue, "emails");
        assert_eq!(snap.enqueued, 1);
        assert_eq!(snap.sent, 1);
        assert_eq!(snap.failed, 0);
        assert!(snap.paused);
        assert_eq!(snap.queue_info.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_snapshot_serializes_flat_counters() {
        let queue = Arc::new(MemoryQueue::new("emails", RetryPolicy::default()));
        let pause = Arc::new(PauseCoordinator::new(Arc::new(MemoryStore::new())));
        let monitor = Monitor::new(queue, Arc::new(Stats::new()), pause);

        let json = serde_json::to_value(monitor.snapshot().await).unwrap();
        assert_eq!(json["sent"], 0);
        assert_eq!(json["paused"], false);
        assert_eq!(json["queue_info"]["queue"], "emails");
    }
}
