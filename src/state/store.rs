//! Drift store trait.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

use super::lock::LockInfo;
use super::types::{DriftRecord, DriftState};

/// Storage backend for [`DriftState`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the drift state.
    ///
    /// Returns `None` if nothing was recorded yet.
    async fn load(&self) -> Result<Option<DriftState>>;

    /// Saves the drift state.
    async fn save(&self, state: &DriftState) -> Result<()>;

    /// Deletes the drift state.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the state lock; an empty `holder` generates one.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the state lock if `lock_id` still holds it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Replaces the status of one configuration key under the state lock.
    async fn record(&self, record: DriftRecord) -> Result<()> {
        let lock = self.acquire_lock("").await?;
        debug!("Recording {} as {}", record.slot(), record.status);

        let result = match self.load().await {
            Ok(state) => {
                let mut state = state.unwrap_or_default();
                state.upsert(record);
                self.save(&state).await
            }
            Err(e) => Err(e),
        };

        self.release_lock(&lock.lock_id).await?;
        result
    }
}
