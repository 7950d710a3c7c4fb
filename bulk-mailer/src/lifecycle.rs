//! Start/stop of the background consumer.
//!
//! The consumer is either `Stopped` or `Running` with its shutdown signal
//! and join handle; there is no half-started state. Both transitions happen
//! under one lock and are idempotent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{LifecycleError, QueueError};
use crate::queue::{DeliveryHandler, TaskQueue};

/// Settings handed to the queue engine's consumer.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub task_type: String,
    pub concurrency: usize,
    /// How long `stop` waits for in-flight deliveries before aborting them
    pub shutdown_timeout: Duration,
}

struct RunningConsumer {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<Result<(), QueueError>>,
}

enum ConsumerState {
    Stopped,
    Running(RunningConsumer),
}

/// Owns the consumer that feeds deliveries to the task processor.
pub struct Lifecycle {
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn DeliveryHandler>,
    settings: ConsumerSettings,
    state: Mutex<ConsumerState>,
}

impl Lifecycle {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn DeliveryHandler>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            queue,
            handler,
            settings,
            state: Mutex::new(ConsumerState::Stopped),
        }
    }

    pub async fn is_running(&self) -> bool {
        match &*self.state.lock().await {
            ConsumerState::Running(running) => !running.join.is_finished(),
            ConsumerState::Stopped => false,
        }
    }

    /// Start consuming. A no-op while a consumer is already running.
    ///
    /// A consumer that exited on its own (e.g. lost its broker connection)
    /// counts as stopped and is replaced.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock().await;

        if let ConsumerState::Running(running) = &*state {
            if !running.join.is_finished() {
                info!("consumer_already_running");
                return Ok(());
            }
            warn!("consumer_exited_restarting");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = Arc::clone(&self.queue);
        let handler = Arc::clone(&self.handler);
        let task_type = self.settings.task_type.clone();
        let concurrency = self.settings.concurrency;

        let join = tokio::spawn(async move {
            let result = queue
                .consume(&task_type, concurrency, handler, shutdown_rx)
                .await;
            if let Err(e) = &result {
                error!(error = %e, "consumer_failed");
            }
            result
        });

        *state = ConsumerState::Running(RunningConsumer { shutdown_tx, join });
        info!(
            queue = %self.queue.name(),
            task_type = %self.settings.task_type,
            concurrency,
            "consumer_started"
        );
        Ok(())
    }

    /// Stop consuming. A no-op when not running.
    ///
    /// In-flight deliveries get up to the shutdown timeout to finish; after
    /// that the consumer is aborted, its cancellation awaited, and the timeout
    /// reported. The state is `Stopped` either way.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock().await;

        let running = match std::mem::replace(&mut *state, ConsumerState::Stopped) {
            ConsumerState::Stopped => {
                info!("consumer_not_running");
                return Ok(());
            }
            ConsumerState::Running(running) => running,
        };

        info!("consumer_stopping");
        // Receiver may already be gone if the consumer exited.
        let _ = running.shutdown_tx.send(true);

        let timeout = self.settings.shutdown_timeout;
        let mut join = running.join;
        match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(Ok(()))) => info!("consumer_stopped"),
            Ok(Ok(Err(e))) => warn!(error = %e, "consumer_stopped_with_error"),
            Ok(Err(e)) => warn!(error = %e, "consumer_task_join_failed"),
            Err(_) => {
                join.abort();
                // Wait for cancellation so the engine has released in-flight work.
                let _ = join.await;
                error!(timeout_ms = timeout.as_millis() as u64, "consumer_stop_timed_out");
                return Err(LifecycleError::ShutdownTimeout(timeout));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::queue::{Delivery, EnqueueOptions, MemoryQueue, RetryPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct SlowHandler {
        calls: AtomicU32,
        delay: Duration,
    }

    #[async_trait]
    impl DeliveryHandler for SlowHandler {
        async fn handle(&self, _delivery: &Delivery) -> Result<(), TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn lifecycle(delay: Duration, shutdown_timeout: Duration) -> (Arc<MemoryQueue>, Arc<SlowHandler>, Lifecycle) {
        let queue = Arc::new(MemoryQueue::new("q", RetryPolicy::default()));
        let handler = Arc::new(SlowHandler {
            calls: AtomicU32::new(0),
            delay,
        });
        let lifecycle = Lifecycle::new(
            queue.clone(),
            handler.clone(),
            ConsumerSettings {
                task_type: "t".to_string(),
                concurrency: 4,
                shutdown_timeout,
            },
        );
        (queue, handler, lifecycle)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_start_twice_runs_one_consumer() {
        let (queue, _, lifecycle) = lifecycle(Duration::ZERO, Duration::from_secs(1));

        lifecycle.start().await.unwrap();
        lifecycle.start().await.unwrap();
        wait_for(|| queue.consumer_count() == 1).await;

        // Give a duplicate consumer time to show up if one were spawned.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.consumer_count(), 1);
        assert!(lifecycle.is_running().await);

        lifecycle.stop().await.unwrap();
        assert_eq!(queue.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let (_, _, lifecycle) = lifecycle(Duration::ZERO, Duration::from_secs(1));
        lifecycle.stop().await.unwrap();
        lifecycle.stop().await.unwrap();
        assert!(!lifecycle.is_running().await);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (queue, handler, lifecycle) = lifecycle(Duration::ZERO, Duration::from_secs(1));

        lifecycle.start().await.unwrap();
        lifecycle.stop().await.unwrap();
        lifecycle.start().await.unwrap();

        queue.enqueue("t", b"x".to_vec(), EnqueueOptions::new(1)).await.unwrap();
        wait_for(|| handler.calls.load(Ordering::SeqCst) == 1).await;
        lifecycle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_delivery() {
        let (queue, handler, lifecycle) =
            lifecycle(Duration::from_millis(200), Duration::from_secs(2));

        lifecycle.start().await.unwrap();
        queue.enqueue("t", b"x".to_vec(), EnqueueOptions::new(1)).await.unwrap();
        wait_for(|| handler.calls.load(Ordering::SeqCst) == 1).await;

        lifecycle.stop().await.unwrap();
        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.active, 0);
        assert_eq!(depth.total(), 0);
    }

    #[tokio::test]
    async fn test_stop_times_out_on_stuck_delivery() {
        let (queue, handler, lifecycle) =
            lifecycle(Duration::from_secs(30), Duration::from_millis(50));

        lifecycle.start().await.unwrap();
        queue.enqueue("t", b"x".to_vec(), EnqueueOptions::new(1)).await.unwrap();
        wait_for(|| handler.calls.load(Ordering::SeqCst) == 1).await;

        let err = lifecycle.stop().await.unwrap_err();
        assert!(matches!(err, LifecycleError::ShutdownTimeout(_)));
        assert!(!lifecycle.is_running().await);

        // The aborted delivery is released and put back, not lost.
        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.active, 0);
        assert_eq!(depth.pending, 1);
        assert_eq!(depth.dead, 0);
        assert_eq!(queue.consumer_count(), 0);
        let queued = queue.queued();
        assert_eq!(queued[0].payload, b"x".to_vec());
        assert_eq!(queued[0].attempts_made, 0);

        // Stopped is stopped, even after a forced shutdown.
        lifecycle.stop().await.unwrap();
    }
}
