//! Operator unlock of a stuck batch.

use crate::error::{Result, StoreError};
use crate::model::{now_epoch_secs, BatchId, BatchKey, BatchStatus, BatchTransition};
use crate::store::{StateStore, WriteOutcome};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of an unlock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// Batch moved back to open
    Unlocked,
    /// The batch is the prefix's current batch; appends may still target
    /// it, so it must go through the reprocessing path instead
    RefusedCurrentBatch,
    /// Batch is neither locked nor in error (or does not exist)
    NotUnlockable(Option<BatchStatus>),
}

/// Reopens locked or failed batches that are no longer current.
pub struct Unlocker {
    store: Arc<dyn StateStore>,
}

impl Unlocker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn unlock(&self, prefix: &str, batch_id: &BatchId) -> Result<UnlockOutcome> {
        let config = self
            .store
            .get_config(prefix)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("configuration for {prefix}")))?;

        if &config.current_batch == batch_id {
            warn!(prefix = %prefix, batch_id = %batch_id, "Refusing to unlock the current batch");
            return Ok(UnlockOutcome::RefusedCurrentBatch);
        }

        let key = BatchKey::new(batch_id.clone(), prefix);
        match self
            .store
            .transition_batch(&key, &BatchTransition::Reopen, now_epoch_secs())
            .await?
        {
            WriteOutcome::Applied => {
                info!(batch = %key, "Batch unlocked");
                Ok(UnlockOutcome::Unlocked)
            }
            WriteOutcome::PreconditionFailed => {
                let status = self.store.get_batch(&key).await?.map(|b| b.status);
                warn!(batch = %key, status = ?status, "Batch is not in 'locked' or 'error' status");
                Ok(UnlockOutcome::NotUnlockable(status))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LoadConfiguration;
    use crate::store::MemoryStateStore;

    async fn store_with_current(current: &str) -> Arc<MemoryStateStore> {
        let store = Arc::new(MemoryStateStore::new());
        store
            .put_config(&LoadConfiguration {
                prefix: "bucket/input".into(),
                current_batch: BatchId::from(current),
                batch_size: 10,
                batch_timeout_secs: None,
                filename_filter_regex: None,
                load_clusters: vec![],
                success_topic: None,
                failure_topic: None,
                mount_dir: String::new(),
                copy_options: None,
                last_batch_rotation: None,
            })
            .await
            .unwrap();
        store
    }

    async fn seed(store: &MemoryStateStore, id: &str, transitions: &[BatchTransition]) {
        let key = BatchKey::new(BatchId::from(id), "bucket/input");
        let _ = store.append_to_open_batch(&key, "bucket/input/a.csv", 1).await.unwrap();
        for t in transitions {
            let _ = store.transition_batch(&key, t, 2).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_refuses_current_batch() {
        let store = store_with_current("b1").await;
        seed(&store, "b1", &[BatchTransition::Lock]).await;

        let outcome = Unlocker::new(store.clone())
            .unlock("bucket/input", &BatchId::from("b1"))
            .await
            .unwrap();
        assert_eq!(outcome, UnlockOutcome::RefusedCurrentBatch);

        let batch = store
            .get_batch(&BatchKey::new(BatchId::from("b1"), "bucket/input"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Locked);
    }

    #[tokio::test]
    async fn test_reopens_failed_batch() {
        let store = store_with_current("b2").await;
        seed(
            &store,
            "b1",
            &[
                BatchTransition::Lock,
                BatchTransition::Fail {
                    error: "down".into(),
                },
            ],
        )
        .await;

        let outcome = Unlocker::new(store.clone())
            .unlock("bucket/input", &BatchId::from("b1"))
            .await
            .unwrap();
        assert_eq!(outcome, UnlockOutcome::Unlocked);
    }

    #[tokio::test]
    async fn test_complete_batch_is_not_unlockable() {
        let store = store_with_current("b2").await;
        seed(&store, "b1", &[BatchTransition::Lock, BatchTransition::Complete]).await;

        let outcome = Unlocker::new(store)
            .unlock("bucket/input", &BatchId::from("b1"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UnlockOutcome::NotUnlockable(Some(BatchStatus::Complete))
        );
    }

    #[tokio::test]
    async fn test_unknown_prefix_is_error() {
        let store = Arc::new(MemoryStateStore::new());
        assert!(Unlocker::new(store)
            .unlock("bucket/missing", &BatchId::from("b1"))
            .await
            .is_err());
    }
}
