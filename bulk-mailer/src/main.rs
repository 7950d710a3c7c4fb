//! Bulk mailer control server.
//!
//! Wires the coordination store, queue engine and transport into the
//! dispatch core and serves the HTTP control API until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bulkmail::config::{QueueBackend, StoreBackend, TransportKind};
use bulkmail::lifecycle::{ConsumerSettings, Lifecycle};
use bulkmail::limiter::{SlidingWindowLimiter, GLOBAL_RATE_KEY};
use bulkmail::pause::{PauseControl, PauseCoordinator};
use bulkmail::queue::{AmqpQueue, MemoryQueue, TaskQueue, EMAIL_QUEUE, EMAIL_TASK_TYPE};
use bulkmail::store::{CoordinationStore, MemoryStore, RedisStore};
use bulkmail::transport::{HttpTransport, SimulatedTransport, Transport};
use bulkmail::web::{router, AppState};
use bulkmail::{BulkProducer, Config, Monitor, Stats, TaskProcessor};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("server_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        csv_path = %config.csv_path.display(),
        queue_backend = ?config.queue_backend,
        store_backend = ?config.store_backend,
        transport = ?config.transport,
        concurrency = config.worker_concurrency,
        max_attempts = config.max_attempts,
        global_rate_limit = config.global_rate_limit,
        max_requeues = config.max_requeues,
        "config_loaded"
    );

    let store: Arc<dyn CoordinationStore> = match config.store_backend {
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&config.redis_url)
                .await
                .context("Failed to connect to coordination store")?,
        ),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };

    // Keep the AMQP handle around so its connection can be closed on exit.
    let amqp = match config.queue_backend {
        QueueBackend::Amqp => Some(AmqpQueue::new(
            config.amqp_url.clone(),
            EMAIL_QUEUE,
            config.retry_policy(),
        )),
        QueueBackend::Memory => None,
    };
    let queue: Arc<dyn TaskQueue> = match &amqp {
        Some(amqp) => Arc::new(amqp.clone()),
        None => Arc::new(MemoryQueue::new(EMAIL_QUEUE, config.retry_policy())),
    };

    let transport = build_transport(&config)?;

    let limiter = Arc::new(SlidingWindowLimiter::new(config.rate_window()));
    limiter.set_limit(GLOBAL_RATE_KEY, config.global_rate_limit);

    let pause: Arc<dyn PauseControl> = Arc::new(PauseCoordinator::new(store));
    let stats = Arc::new(Stats::new());

    let processor = Arc::new(
        TaskProcessor::new(
            queue.clone(),
            pause.clone(),
            limiter.clone(),
            transport,
            stats.clone(),
        )
        .with_policy(config.requeue_policy())
        .with_max_attempts(config.max_attempts),
    );

    let lifecycle = Arc::new(Lifecycle::new(
        queue.clone(),
        processor,
        ConsumerSettings {
            task_type: EMAIL_TASK_TYPE.to_string(),
            concurrency: config.worker_concurrency,
            shutdown_timeout: config.shutdown_timeout(),
        },
    ));

    let state = AppState {
        config: Arc::new(config.clone()),
        lifecycle: lifecycle.clone(),
        producer: Arc::new(BulkProducer::new(
            queue.clone(),
            stats.clone(),
            config.max_attempts,
        )),
        pause: pause.clone(),
        monitor: Arc::new(Monitor::new(queue.clone(), stats, pause)),
        limiter,
    };

    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "control_api_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Err(e) = lifecycle.stop().await {
        error!(error = %e, "consumer_stop_failed");
    }

    if let Some(amqp) = amqp {
        amqp.close().await;
    }

    info!("server_shutdown_complete");

    Ok(())
}

fn build_transport(config: &Config) -> Result<Arc<dyn Transport>> {
    match config.transport {
        TransportKind::Simulated => Ok(Arc::new(SimulatedTransport::new(
            Duration::from_millis(config.simulated_send_latency_ms),
            config.simulated_failure_probability,
        ))),
        TransportKind::Http => {
            let (Some(url), Some(key), Some(from)) = (
                config.mail_api_url.as_ref(),
                config.mail_api_key.as_ref(),
                config.mail_from.as_ref(),
            ) else {
                bail!("TRANSPORT=http requires MAIL_API_URL, MAIL_API_KEY and MAIL_FROM");
            };

            let transport = HttpTransport::new(url, key, from, Duration::from_secs(10))
                .context("Failed to create HTTP transport")?;
            Ok(Arc::new(transport))
        }
    }
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("server_shutting_down");
}
