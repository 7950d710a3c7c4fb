//! Pause coordination shared by every instance of the service.
//!
//! The flag lives in the coordination store under [`PAUSE_KEY`]. A present
//! key holding [`PAUSED_VALUE`] means paused; an absent key means running.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::store::CoordinationStore;

/// Coordination-store key holding the pause flag.
pub const PAUSE_KEY: &str = "email:paused";

/// Value written while paused.
pub const PAUSED_VALUE: &str = "1";

/// Capability to read and toggle the pause flag.
#[async_trait]
pub trait PauseControl: Send + Sync {
    /// Whether processing is paused. Never fails; see [`PauseCoordinator`].
    async fn is_paused(&self) -> bool;

    async fn pause(&self) -> Result<(), StoreError>;

    async fn resume(&self) -> Result<(), StoreError>;
}

/// [`PauseControl`] backed by a [`CoordinationStore`].
///
/// `is_paused` fails open: if the store cannot be read, processing carries
/// on as if not paused.
pub struct PauseCoordinator {
    store: Arc<dyn CoordinationStore>,
}

impl PauseCoordinator {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PauseControl for PauseCoordinator {
    async fn is_paused(&self) -> bool {
        match self.store.get(PAUSE_KEY).await {
            Ok(value) => value.as_deref() == Some(PAUSED_VALUE),
            Err(e) => {
                warn!(key = PAUSE_KEY, error = %e, "pause_check_failed_open");
                false
            }
        }
    }

    async fn pause(&self) -> Result<(), StoreError> {
        self.store.set(PAUSE_KEY, PAUSED_VALUE).await?;
        info!("processing_paused");
        Ok(())
    }

    async fn resume(&self) -> Result<(), StoreError> {
        self.store.delete(PAUSE_KEY).await?;
        info!("processing_resumed");
        Ok(())
    }
}
