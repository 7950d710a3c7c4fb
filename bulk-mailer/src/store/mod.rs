//! Coordination store: the shared key-value service every instance reads
//! control-plane state from.
//!
//! ```text
//! PauseCoordinator → CoordinationStore → Redis (prod) | MemoryStore (tests, single node)
//! ```

pub mod memory;
pub mod redis;

use async_trait::async_trait;

use crate::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Minimal key-value surface needed by the control plane.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Fetch a value; `Ok(None)` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store a value with no expiry.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
