//! Error types shared across the control plane.
//!
//! Each external boundary gets its own enum so callers can tell a broken
//! coordination store apart from a broken queue engine. The HTTP layer
//! flattens all of them into a single message string.

use std::path::PathBuf;

use thiserror::Error;

/// Failure reported by the coordination store (Redis or in-memory).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordination store unreachable: {0}")]
    Unavailable(String),

    #[error("coordination store command failed: {0}")]
    Command(String),
}

/// Failure reported by the queue engine.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection failed: {0}")]
    Connection(String),

    #[error("enqueue failed: {0}")]
    Enqueue(String),

    #[error("queue inspection failed: {0}")]
    Inspect(String),

    #[error("consumer failed: {0}")]
    Consume(String),

    #[error("failed to encode task payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure reported by the message transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send to {to} rejected: {reason}")]
    Rejected { to: String, reason: String },

    #[error("transport request failed: {0}")]
    Request(String),
}

/// Outcome of a single delivery that the queue engine should treat as a
/// failed attempt.
///
/// Every variant is retried by the engine up to the task's attempt limit.
/// That includes [`TaskError::Decode`], even though a malformed payload
/// can never decode on a later attempt.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("malformed task payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("requeue failed: {0}")]
    Requeue(#[source] QueueError),
}

/// Fatal errors from the bulk producer. Per-row problems never surface here.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("open recipient source {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read header: {0}")]
    Header(#[source] csv::Error),

    #[error("read header: recipient source is empty")]
    MissingHeader,

    #[error("recipient reader stopped: {0}")]
    Reader(String),
}

/// Errors from the consumer lifecycle.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("consumer did not stop within {0:?}; aborted")]
    ShutdownTimeout(std::time::Duration),
}
