//! Bulk producer: turns a recipient CSV into one queued task per recipient.
//!
//! Source format: a header row (ignored) followed by rows of
//! `address[,subject[,body]]`. Bad rows and failed enqueues are logged and
//! skipped; only an unreadable source or header aborts the batch.
//!
//! Rows are parsed on a blocking thread and streamed to the enqueue loop
//! through a bounded channel, so a source is never held in memory whole.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::error::ProducerError;
use crate::queue::{enqueue_email, EmailTask, EnqueueOptions, TaskQueue};
use crate::stats::Stats;

pub const DEFAULT_SUBJECT: &str = "Hello";
pub const DEFAULT_BODY: &str = "Default body";

/// Parsed rows buffered ahead of the enqueue loop.
const ROW_BUFFER: usize = 256;

/// A data row and its 1-based line number in the source.
type Row = (usize, Result<csv::StringRecord, csv::Error>);

/// Enqueues email tasks from recipient sources.
pub struct BulkProducer {
    queue: Arc<dyn TaskQueue>,
    stats: Arc<Stats>,
    max_attempts: u32,
}

impl BulkProducer {
    pub fn new(queue: Arc<dyn TaskQueue>, stats: Arc<Stats>, max_attempts: u32) -> Self {
        Self {
            queue,
            stats,
            max_attempts,
        }
    }

    /// Read the CSV at `path` and enqueue one task per valid row.
    pub async fn enqueue_path(&self, path: impl AsRef<Path>) -> Result<usize, ProducerError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| ProducerError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let count = self.enqueue_reader(file.into_std().await).await?;
        info!(count, source = %path.display(), "bulk_enqueue_complete");
        Ok(count)
    }

    /// Enqueue one task per valid data row in `reader`.
    ///
    /// `enqueued` is counted row by row, so a batch cut short by
    /// cancellation still accounts for every task it queued.
    pub async fn enqueue_reader<R>(&self, reader: R) -> Result<usize, ProducerError>
    where
        R: Read + Send + 'static,
    {
        let (header_tx, header_rx) = oneshot::channel();
        let (row_tx, mut row_rx) = mpsc::channel(ROW_BUFFER);
        let parser = tokio::task::spawn_blocking(move || read_rows(reader, header_tx, row_tx));

        match header_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ProducerError::Reader(
                    "parser stopped before reading the header".to_string(),
                ))
            }
        }

        let opts = EnqueueOptions::new(self.max_attempts);
        let mut count = 0usize;

        while let Some((line, result)) = row_rx.recv().await {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    warn!(line, error = %e, "csv_row_parse_failed");
                    continue;
                }
            };

            let Some(task) = task_from_record(&record) else {
                warn!(line, "csv_row_missing_address");
                continue;
            };

            match enqueue_email(self.queue.as_ref(), &task, opts).await {
                Ok(task_id) => {
                    count += 1;
                    self.stats.record_enqueued(1);
                    info!(line, to = %task.to, task_id = %task_id, "email_task_enqueued");
                }
                Err(e) => {
                    warn!(line, to = %task.to, error = %e, "email_task_enqueue_failed");
                }
            }
        }

        if let Err(e) = parser.await {
            error!(error = %e, "csv_parser_task_failed");
        }

        Ok(count)
    }
}

/// Parse `reader` on the calling (blocking) thread.
///
/// The header outcome goes to `header_tx`; data rows follow on `row_tx`
/// until the source ends or the receiver is dropped.
fn read_rows<R: Read>(
    reader: R,
    header_tx: oneshot::Sender<Result<(), ProducerError>>,
    row_tx: mpsc::Sender<Row>,
) {
    let mut records = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader)
        .into_records();

    let header = match records.next() {
        Some(Ok(_header)) => Ok(()),
        Some(Err(e)) => Err(ProducerError::Header(e)),
        None => Err(ProducerError::MissingHeader),
    };
    let header_ok = header.is_ok();
    if header_tx.send(header).is_err() || !header_ok {
        return;
    }

    // Data rows start on line 2. An I/O error ends the source.
    for (idx, result) in records.enumerate() {
        let io_failed = matches!(&result, Err(e) if e.is_io_error());
        if row_tx.blocking_send((idx + 2, result)).is_err() || io_failed {
            break;
        }
    }
}

/// Build a task from `address[,subject[,body]]`, applying defaults for
/// empty or missing optional fields. `None` when the address is blank.
///
/// Fields are used as written; whitespace only matters for the blank check.
fn task_from_record(record: &csv::StringRecord) -> Option<EmailTask> {
    let to = record.get(0).filter(|s| !s.trim().is_empty())?;

    Some(EmailTask::new(
        to,
        field_or(record, 1, DEFAULT_SUBJECT),
        field_or(record, 2, DEFAULT_BODY),
    ))
}

fn field_or(record: &csv::StringRecord, idx: usize, default: &str) -> String {
    match record.get(idx) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::queue::{DeliveryHandler, MemoryQueue, QueueDepth, RetryPolicy};
    use async_trait::async_trait;
    use std::io::{Cursor, Write};
    use std::time::Duration;
    use tokio::sync::watch;

    fn producer() -> (Arc<MemoryQueue>, Arc<Stats>, BulkProducer) {
        let queue = Arc::new(MemoryQueue::new("q", RetryPolicy::default()));
        let stats = Arc::new(Stats::new());
        let producer = BulkProducer::new(queue.clone(), stats.clone(), 3);
        (queue, stats, producer)
    }

    fn queued_tasks(queue: &MemoryQueue) -> Vec<EmailTask> {
        queue
            .queued()
            .iter()
            .map(|t| EmailTask::decode(&t.payload).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_skips_rows_without_address() {
        let (queue, stats, producer) = producer();
        let csv = "email,subject,body\na@x.com,,\n,S,B\nc@x.com,Sub,Body\n";

        let count = producer.enqueue_reader(csv.as_bytes()).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(stats.snapshot().enqueued, 2);

        let tasks = queued_tasks(&queue);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].to, "a@x.com");
        assert_eq!(tasks[0].subject, DEFAULT_SUBJECT);
        assert_eq!(tasks[0].body, DEFAULT_BODY);
        assert_eq!(tasks[1].to, "c@x.com");
        assert_eq!(tasks[1].subject, "Sub");
        assert_eq!(tasks[1].body, "Body");
    }

    #[tokio::test]
    async fn test_short_rows_get_defaults() {
        let (queue, _, producer) = producer();
        let csv = "email\nonly@x.com\nsubj@x.com,Hi\n";

        assert_eq!(producer.enqueue_reader(csv.as_bytes()).await.unwrap(), 2);

        let tasks = queued_tasks(&queue);
        assert_eq!(tasks[0].subject, DEFAULT_SUBJECT);
        assert_eq!(tasks[1].subject, "Hi");
        assert_eq!(tasks[1].body, DEFAULT_BODY);
    }

    #[tokio::test]
    async fn test_tasks_carry_attempt_allowance() {
        let (queue, _, producer) = producer();
        producer
            .enqueue_reader("email\na@x.com\n".as_bytes())
            .await
            .unwrap();

        let queued = queue.queued();
        assert_eq!(queued[0].max_attempts, 3);
        assert!(queued[0].delay.is_zero());
    }

    #[tokio::test]
    async fn test_malformed_row_does_not_stop_batch() {
        let (queue, _, producer) = producer();
        let mut data = b"email,subject\na@x.com,ok\n".to_vec();
        data.extend_from_slice(b"bad@x.com,\xff\xfe\n");
        data.extend_from_slice(b"c@x.com,ok\n");

        let count = producer.enqueue_reader(Cursor::new(data)).await.unwrap();
        assert_eq!(count, 2);

        let tos: Vec<String> = queued_tasks(&queue).into_iter().map(|t| t.to).collect();
        assert_eq!(tos, vec!["a@x.com", "c@x.com"]);
    }

    #[tokio::test]
    async fn test_header_only_source_enqueues_nothing() {
        let (queue, stats, producer) = producer();
        assert_eq!(producer.enqueue_reader("email\n".as_bytes()).await.unwrap(), 0);
        assert!(queue.queued().is_empty());
        assert_eq!(stats.snapshot().enqueued, 0);
    }

    #[tokio::test]
    async fn test_empty_source_is_fatal() {
        let (_, _, producer) = producer();
        let err = producer.enqueue_reader("".as_bytes()).await.unwrap_err();
        assert!(matches!(err, ProducerError::MissingHeader));
    }

    #[tokio::test]
    async fn test_invalid_header_is_fatal() {
        let (queue, _, producer) = producer();
        let err = producer
            .enqueue_reader(b"em\xffail\na@x.com\n".as_slice())
            .await
            .unwrap_err();
        assert!(matches!(err, ProducerError::Header(_)));
        assert!(queue.queued().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_fatal() {
        let (queue, stats, producer) = producer();
        let dir = tempfile::tempdir().unwrap();

        let err = producer
            .enqueue_path(dir.path().join("missing.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProducerError::Open { .. }));
        assert!(queue.queued().is_empty());
        assert_eq!(stats.snapshot().enqueued, 0);
    }

    #[tokio::test]
    async fn test_enqueue_from_file() {
        let (queue, _, producer) = producer();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "email,subject,body").unwrap();
        writeln!(file, "a@x.com,\"Hello, there\",Body").unwrap();
        writeln!(file, "b@x.com").unwrap();

        assert_eq!(producer.enqueue_path(file.path()).await.unwrap(), 2);
        assert_eq!(queued_tasks(&queue)[0].subject, "Hello, there");
    }

    /// Rejects enqueues for one recipient and forwards the rest.
    struct FlakyQueue {
        inner: MemoryQueue,
        reject: &'static str,
    }

    #[async_trait]
    impl TaskQueue for FlakyQueue {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn enqueue(
            &self,
            task_type: &str,
            payload: Vec<u8>,
            opts: EnqueueOptions,
        ) -> Result<String, QueueError> {
            let task = EmailTask::decode(&payload)?;
            if task.to == self.reject {
                return Err(QueueError::Enqueue("broker unavailable".into()));
            }
            self.inner.enqueue(task_type, payload, opts).await
        }

        async fn dead_letter(&self, t: &str, p: Vec<u8>, r: &str) -> Result<(), QueueError> {
            self.inner.dead_letter(t, p, r).await
        }

        async fn depth(&self) -> Result<QueueDepth, QueueError> {
            self.inner.depth().await
        }

        async fn consume(
            &self,
            t: &str,
            c: usize,
            h: Arc<dyn DeliveryHandler>,
            s: watch::Receiver<bool>,
        ) -> Result<(), QueueError> {
            self.inner.consume(t, c, h, s).await
        }
    }

    #[tokio::test]
    async fn test_enqueue_failure_skips_row() {
        let queue = Arc::new(FlakyQueue {
            inner: MemoryQueue::new("q", RetryPolicy::default()),
            reject: "b@x.com",
        });
        let stats = Arc::new(Stats::new());
        let producer = BulkProducer::new(queue.clone(), stats.clone(), 3);

        let csv = "email\na@x.com\nb@x.com\nc@x.com\n";
        assert_eq!(producer.enqueue_reader(csv.as_bytes()).await.unwrap(), 2);
        assert_eq!(stats.snapshot().enqueued, 2);
        assert_eq!(queue.inner.queued().len(), 2);
    }

    #[tokio::test]
    async fn test_address_kept_verbatim() {
        let (queue, _, producer) = producer();
        let csv = "email,subject\n a@x.com ,Hi\n   ,S\n";

        assert_eq!(producer.enqueue_reader(csv.as_bytes()).await.unwrap(), 1);
        assert_eq!(queued_tasks(&queue)[0].to, " a@x.com ");
    }

    /// Fails every read; chained after good data to cut a source short.
    struct BrokenReader;

    impl Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "device gone"))
        }
    }

    #[tokio::test]
    async fn test_read_error_ends_source_after_streamed_rows() {
        let (queue, stats, producer) = producer();
        let reader = Cursor::new(b"email\na@x.com\nb@x.com\n".to_vec()).chain(BrokenReader);

        assert_eq!(producer.enqueue_reader(reader).await.unwrap(), 2);
        assert_eq!(queue.queued().len(), 2);
        assert_eq!(stats.snapshot().enqueued, 2);
    }

    #[tokio::test]
    async fn test_large_file_enqueues_every_row() {
        let (queue, stats, producer) = producer();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "email").unwrap();
        for i in 0..5000 {
            writeln!(file, "user{i}@x.com").unwrap();
        }

        assert_eq!(producer.enqueue_path(file.path()).await.unwrap(), 5000);
        assert_eq!(queue.queued().len(), 5000);
        assert_eq!(stats.snapshot().enqueued, 5000);
    }

    /// Yields before every enqueue so a batch can be cancelled part way.
    struct SlowQueue {
        inner: MemoryQueue,
    }

    #[async_trait]
    impl TaskQueue for SlowQueue {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn enqueue(
            &self,
            task_type: &str,
            payload: Vec<u8>,
            opts: EnqueueOptions,
        ) -> Result<String, QueueError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.inner.enqueue(task_type, payload, opts).await
        }

        async fn dead_letter(&self, t: &str, p: Vec<u8>, r: &str) -> Result<(), QueueError> {
            self.inner.dead_letter(t, p, r).await
        }

        async fn depth(&self) -> Result<QueueDepth, QueueError> {
            self.inner.depth().await
        }

        async fn consume(
            &self,
            t: &str,
            c: usize,
            h: Arc<dyn DeliveryHandler>,
            s: watch::Receiver<bool>,
        ) -> Result<(), QueueError> {
            self.inner.consume(t, c, h, s).await
        }
    }

    #[tokio::test]
    async fn test_cancelled_batch_counts_enqueued_rows() {
        let queue = Arc::new(SlowQueue {
            inner: MemoryQueue::new("q", RetryPolicy::default()),
        });
        let stats = Arc::new(Stats::new());
        let producer = BulkProducer::new(queue.clone(), stats.clone(), 3);

        let mut csv = String::from("email\n");
        for i in 0..1000 {
            csv.push_str(&format!("user{i}@x.com\n"));
        }

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            producer.enqueue_reader(Cursor::new(csv.into_bytes())),
        )
        .await;
        assert!(result.is_err(), "batch should still be running at the deadline");

        let queued = queue.inner.queued().len() as u64;
        assert!(queued > 0);
        assert!(queued < 1000);
        assert_eq!(stats.snapshot().enqueued, queued);
    }
}
