//! RabbitMQ queue engine built on lapin.
//!
//! ## Topology
//!
//! ```text
//! publish ──► <queue>                      (work queue, durable)
//! delayed ──► <queue>.delay.<ms> ──TTL──►  <queue>   (dead-letter back)
//! exhausted ► <queue>.dead                 (dead-letter queue)
//! ```
//!
//! Delays use one wait queue per distinct delay with a per-queue message TTL
//! whose expired messages dead-letter back into the work queue. Attempt
//! bookkeeping travels in message headers.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Delivery, DeliveryHandler, EnqueueOptions, QueueDepth, RetryPolicy, TaskQueue};
use crate::error::QueueError;

const ATTEMPTS_HEADER: &str = "x-attempts-made";
const MAX_ATTEMPTS_HEADER: &str = "x-max-attempts";
const REASON_HEADER: &str = "x-dead-letter-reason";

/// [`TaskQueue`] backed by RabbitMQ.
///
/// Cheap to clone; all clones share one connection and publishing channel,
/// re-established on demand after failures.
#[derive(Clone)]
pub struct AmqpQueue {
    inner: Arc<AmqpInner>,
}

struct AmqpInner {
    url: String,
    queue: String,
    retry: RetryPolicy,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    /// Delay queues declared by this process, in milliseconds
    delay_queues: parking_lot::Mutex<BTreeSet<u64>>,
    active: AtomicUsize,
}

/// Headers and routing for one publish.
struct Outgoing<'a> {
    id: &'a str,
    task_type: &'a str,
    payload: &'a [u8],
    attempts_made: u32,
    max_attempts: u32,
    delay: Duration,
}

impl AmqpQueue {
    pub fn new(url: impl Into<String>, queue: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(AmqpInner {
                url: url.into(),
                queue: queue.into(),
                retry,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
                delay_queues: parking_lot::Mutex::new(BTreeSet::new()),
                active: AtomicUsize::new(0),
            }),
        }
    }

    fn dead_queue(&self) -> String {
        format!("{}.dead", self.inner.queue)
    }

    fn delay_queue(&self, delay_ms: u64) -> String {
        format!("{}.delay.{}", self.inner.queue, delay_ms)
    }

    /// Ensure we have a live connection and publishing channel.
    async fn ensure_connected(&self) -> Result<Channel, QueueError> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!(queue = %self.inner.queue, "rabbitmq_connecting");

        let conn = match connection.take() {
            Some(conn) if conn.status().connected() => conn,
            _ => Connection::connect(&self.inner.url, ConnectionProperties::default())
                .await
                .map_err(|e| QueueError::Connection(format!("Failed to connect to RabbitMQ: {e}")))?,
        };

        let ch = conn
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to create channel: {e}")))?;

        declare_durable(&ch, &self.inner.queue, FieldTable::default()).await?;
        declare_durable(&ch, &self.dead_queue(), FieldTable::default()).await?;

        info!(
            queue = %self.inner.queue,
            dead_queue = %self.dead_queue(),
            "rabbitmq_queues_declared"
        );

        *connection = Some(conn);
        *channel = Some(ch.clone());

        // Wait queues must be declared again on a fresh connection.
        self.inner.delay_queues.lock().clear();

        Ok(ch)
    }

    /// Declare the wait queue for `delay_ms` once per connection.
    async fn ensure_delay_queue(&self, ch: &Channel, delay_ms: u64) -> Result<String, QueueError> {
        let name = self.delay_queue(delay_ms);
        if self.inner.delay_queues.lock().contains(&delay_ms) {
            return Ok(name);
        }

        declare_durable(ch, &name, self.delay_queue_args(delay_ms)).await?;
        self.inner.delay_queues.lock().insert(delay_ms);
        info!(delay_queue = %name, delay_ms, "rabbitmq_delay_queue_declared");
        Ok(name)
    }

    fn delay_queue_args(&self, delay_ms: u64) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(delay_ms.min(i64::MAX as u64) as i64),
        );
        args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(self.inner.queue.as_str().into()),
        );
        args
    }

    async fn publish(&self, msg: Outgoing<'_>) -> Result<(), QueueError> {
        let ch = self.ensure_connected().await?;

        let delay_ms = msg.delay.as_millis().min(u64::MAX as u128) as u64;
        let routing_key = if delay_ms == 0 {
            self.inner.queue.clone()
        } else {
            self.ensure_delay_queue(&ch, delay_ms).await?
        };

        let mut headers = FieldTable::default();
        headers.insert(ATTEMPTS_HEADER.into(), AMQPValue::LongUInt(msg.attempts_made));
        headers.insert(MAX_ATTEMPTS_HEADER.into(), AMQPValue::LongUInt(msg.max_attempts));

        publish_persistent(&ch, &routing_key, msg.id, msg.task_type, msg.payload, headers).await?;

        info!(
            queue = %routing_key,
            task_id = %msg.id,
            attempts_made = msg.attempts_made,
            delay_ms,
            "rabbitmq_task_published"
        );
        Ok(())
    }

    async fn publish_dead(
        &self,
        id: &str,
        task_type: &str,
        payload: &[u8],
        reason: &str,
    ) -> Result<(), QueueError> {
        let ch = self.ensure_connected().await?;

        let mut headers = FieldTable::default();
        headers.insert(REASON_HEADER.into(), AMQPValue::LongString(reason.into()));

        publish_persistent(&ch, &self.dead_queue(), id, task_type, payload, headers).await?;

        warn!(task_id = %id, reason = %reason, "task_dead_lettered");
        Ok(())
    }

    /// Handle one delivery and settle it with the broker.
    async fn process_delivery(
        &self,
        channel: &Channel,
        handler: &dyn DeliveryHandler,
        task_type: &str,
        delivery: lapin::message::Delivery,
    ) {
        let delivery_tag = delivery.delivery_tag;
        let headers = delivery.properties.headers().as_ref();
        let attempts_made = header_u32(headers, ATTEMPTS_HEADER).unwrap_or(0);
        let max_attempts = header_u32(headers, MAX_ATTEMPTS_HEADER).unwrap_or(1).max(1);
        let id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let kind = delivery
            .properties
            .kind()
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_default();

        let settled = if kind != task_type {
            // No handler is registered for this type on this queue.
            let reason = format!("no handler for task type {kind:?}");
            self.publish_dead(&id, &kind, &delivery.data, &reason).await
        } else {
            let job = Delivery {
                id: id.clone(),
                task_type: kind.clone(),
                payload: delivery.data.clone(),
                attempt: attempts_made + 1,
                max_attempts,
            };

            match handler.handle(&job).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    let attempts_made = attempts_made + 1;
                    if attempts_made >= max_attempts {
                        self.publish_dead(&id, &kind, &delivery.data, &err.to_string())
                            .await
                    } else {
                        let delay = self.inner.retry.delay_for(attempts_made - 1);
                        warn!(
                            task_id = %id,
                            attempt = attempts_made,
                            max_attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %err,
                            "task_retry_scheduled"
                        );
                        self.publish(Outgoing {
                            id: &id,
                            task_type: &kind,
                            payload: &delivery.data,
                            attempts_made,
                            max_attempts,
                            delay,
                        })
                        .await
                    }
                }
            }
        };

        match settled {
            Ok(()) => {
                if let Err(e) = channel
                    .basic_ack(delivery_tag, BasicAckOptions::default())
                    .await
                {
                    error!(delivery_tag, error = %e, "rabbitmq_ack_failed");
                }
            }
            Err(e) => {
                // Could not record the outcome; let the broker redeliver.
                error!(task_id = %id, error = %e, "rabbitmq_settle_failed");
                if let Err(nack_err) = channel
                    .basic_nack(
                        delivery_tag,
                        BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        },
                    )
                    .await
                {
                    error!(delivery_tag, error = %nack_err, "rabbitmq_nack_failed");
                }
            }
        }
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_queue_closed");
    }
}

#[async_trait]
impl TaskQueue for AmqpQueue {
    fn name(&self) -> &str {
        &self.inner.queue
    }

    async fn enqueue(
        &self,
        task_type: &str,
        payload: Vec<u8>,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        self.publish(Outgoing {
            id: &id,
            task_type,
            payload: &payload,
            attempts_made: 0,
            max_attempts: opts.max_attempts,
            delay: opts.delay,
        })
        .await?;
        Ok(id)
    }

    async fn dead_letter(
        &self,
        task_type: &str,
        payload: Vec<u8>,
        reason: &str,
    ) -> Result<(), QueueError> {
        let id = Uuid::new_v4().to_string();
        self.publish_dead(&id, task_type, &payload, reason).await
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let ch = self.ensure_connected().await?;

        // Re-declaring with identical arguments is idempotent and reports counts.
        let work = declare_durable(&ch, &self.inner.queue, FieldTable::default()).await?;
        let dead = declare_durable(&ch, &self.dead_queue(), FieldTable::default()).await?;

        let delays: Vec<u64> = self.inner.delay_queues.lock().iter().copied().collect();
        let mut scheduled = 0u64;
        for delay_ms in delays {
            let q = declare_durable(&ch, &self.delay_queue(delay_ms), self.delay_queue_args(delay_ms))
                .await?;
            scheduled += u64::from(q.message_count());
        }

        Ok(QueueDepth {
            queue: self.inner.queue.clone(),
            pending: u64::from(work.message_count()),
            scheduled,
            active: self.inner.active.load(Ordering::SeqCst) as u64,
            dead: u64::from(dead.message_count()),
        })
    }

    async fn consume(
        &self,
        task_type: &str,
        concurrency: usize,
        handler: Arc<dyn DeliveryHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        // Make sure the topology exists before consuming from it.
        self.ensure_connected().await?;

        let channel = {
            let connection = self.inner.connection.read().await;
            let conn = connection
                .as_ref()
                .ok_or_else(|| QueueError::Connection("connection dropped".to_string()))?;
            conn.create_channel()
                .await
                .map_err(|e| QueueError::Consume(format!("Failed to create channel: {e}")))?
        };

        let prefetch_count = concurrency.clamp(1, u16::MAX as usize) as u16;
        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Consume(format!("Failed to set QoS: {e}")))?;

        info!(prefetch_count, "rabbitmq_qos_set");

        let consumer_tag = format!("bulk-mailer-{}", Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                &self.inner.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Consume(format!("Failed to start consumer: {e}")))?;

        info!(queue = %self.inner.queue, task_type, "rabbitmq_consumer_started");

        let task_type: Arc<str> = Arc::from(task_type);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("rabbitmq_consumer_stopping");
                        break;
                    }
                }
                // Reap finished deliveries so the set does not grow unbounded.
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            let this = self.clone();
                            let channel = channel.clone();
                            let handler = Arc::clone(&handler);
                            let task_type = Arc::clone(&task_type);

                            this.inner.active.fetch_add(1, Ordering::SeqCst);
                            in_flight.spawn(async move {
                                this.process_delivery(&channel, handler.as_ref(), &task_type, delivery)
                                    .await;
                                this.inner.active.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "rabbitmq_delivery_error");
                        }
                        None => {
                            warn!("rabbitmq_consumer_closed");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = channel
            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(error = %e, "rabbitmq_cancel_failed");
        }

        // Let in-flight deliveries settle before closing their channel.
        while in_flight.join_next().await.is_some() {}

        if let Err(e) = channel.close(200, "Consumer stopped").await {
            warn!(error = %e, "rabbitmq_channel_close_error");
        }

        info!(queue = %self.inner.queue, "rabbitmq_consumer_stopped");
        Ok(())
    }
}

async fn declare_durable(
    ch: &Channel,
    name: &str,
    args: FieldTable,
) -> Result<lapin::Queue, QueueError> {
    ch.queue_declare(
        name,
        QueueDeclareOptions {
            durable: true,
            ..Default::default()
        },
        args,
    )
    .await
    .map_err(|e| QueueError::Connection(format!("Failed to declare queue {name}: {e}")))
}

async fn publish_persistent(
    ch: &Channel,
    routing_key: &str,
    id: &str,
    task_type: &str,
    payload: &[u8],
    headers: FieldTable,
) -> Result<(), QueueError> {
    ch.basic_publish(
        "",
        routing_key,
        BasicPublishOptions::default(),
        payload,
        BasicProperties::default()
            .with_delivery_mode(2) // Persistent
            .with_content_type("application/json".into())
            .with_message_id(id.into())
            .with_kind(task_type.into())
            .with_headers(headers),
    )
    .await
    .map_err(|e| QueueError::Enqueue(format!("Failed to publish to {routing_key}: {e}")))?
    .await
    .map_err(|e| QueueError::Enqueue(format!("Failed to confirm publish: {e}")))?;
    Ok(())
}

fn header_u32(headers: Option<&FieldTable>, name: &str) -> Option<u32> {
    let key = ShortString::from(name);
    match headers?.inner().get(&key)? {
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        _ => None,
    }
}
