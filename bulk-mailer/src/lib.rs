//! Bulk mailer - control plane for rate-limited, pausable email dispatch.
//!
//! ## Architecture
//!
//! ```text
//! POST /start → BulkProducer → queue engine → TaskProcessor → Transport
//!                                   ▲               │
//!                                   └── requeue ────┘ (paused / rate limited)
//! ```
//!
//! The queue engine owns delivery, retry and dead-lettering. This crate
//! decides, per delivery, whether to send now or defer, and exposes
//! start/stop/pause/resume/monitor over HTTP.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod limiter;
pub mod monitor;
pub mod pause;
pub mod processor;
pub mod producer;
pub mod queue;
pub mod stats;
pub mod store;
pub mod transport;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use lifecycle::Lifecycle;
pub use limiter::{SlidingWindowLimiter, DEFAULT_RATE_LIMIT, GLOBAL_RATE_KEY};
pub use monitor::{Monitor, MonitorSnapshot};
pub use pause::{PauseControl, PauseCoordinator};
pub use processor::{Outcome, RequeuePolicy, TaskProcessor};
pub use producer::BulkProducer;
pub use queue::{EmailTask, TaskQueue, EMAIL_QUEUE, EMAIL_TASK_TYPE};
pub use stats::{Stats, StatsSnapshot};
pub use web::AppState;
