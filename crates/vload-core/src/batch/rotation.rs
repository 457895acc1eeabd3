//! Flush decision and batch rotation.
//!
//! Rotation seals the batch with a conditional open→locked write, so exactly
//! one invocation wins. The winner then re-reads the batch: because appends
//! are conditional on status, the snapshot taken after the lock is exactly
//! the set of entries that landed. Finally the prefix's current-batch
//! pointer is moved to a fresh id so later appends land in a new batch.

use crate::error::{Result, StoreError};
use crate::metrics::LoaderMetrics;
use crate::model::{
    now_epoch_secs, Batch, BatchId, BatchKey, BatchStatus, BatchTransition, LoadConfiguration,
};
use crate::store::{StateStore, WriteOutcome};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Size and age thresholds of a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub batch_size: u32,
    pub timeout_secs: Option<u64>,
}

impl FlushPolicy {
    pub fn from_config(config: &LoadConfiguration) -> Self {
        Self {
            batch_size: config.batch_size,
            timeout_secs: config.batch_timeout_secs,
        }
    }

    /// Full, or idle past the timeout with at least one entry.
    pub fn should_flush(&self, batch: &Batch, now: i64) -> bool {
        let count = batch.entry_count() as u64;
        if count >= u64::from(self.batch_size) {
            return true;
        }
        match self.timeout_secs {
            Some(timeout) => count > 0 && now.saturating_sub(batch.last_update) > timeout as i64,
            None => false,
        }
    }
}

/// What a rotation check did.
#[derive(Debug, Clone, PartialEq)]
pub enum RotationOutcome {
    /// No batch exists under that id yet
    NoBatch,
    /// Thresholds not reached
    NotRequired,
    /// Another invocation sealed the batch first
    LostRace,
    /// This invocation sealed the batch and owns loading it
    Rotated {
        /// Entries as of the lock
        sealed: Batch,
        /// New current batch, `None` when the pointer had already moved on
        successor: Option<BatchId>,
    },
}

/// Decides flushes and seals batches.
pub struct Rotator {
    store: Arc<dyn StateStore>,
    metrics: Arc<LoaderMetrics>,
}

impl Rotator {
    pub fn new(store: Arc<dyn StateStore>, metrics: Arc<LoaderMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Evaluate `batch_id` against the prefix thresholds and rotate it if due.
    pub async fn check(&self, config: &LoadConfiguration, batch_id: &BatchId) -> Result<RotationOutcome> {
        let key = BatchKey::new(batch_id.clone(), config.prefix.clone());
        let Some(batch) = self.store.get_batch(&key).await? else {
            info!(batch_id = %batch_id, prefix = %config.prefix, "No pending batch");
            return Ok(RotationOutcome::NoBatch);
        };

        let now = now_epoch_secs();
        let policy = FlushPolicy::from_config(config);
        if !policy.should_flush(&batch, now) {
            debug!(
                batch_id = %batch_id,
                entries = batch.entry_count(),
                batch_size = policy.batch_size,
                age_secs = now - batch.last_update,
                "Batch not due for flush"
            );
            return Ok(RotationOutcome::NotRequired);
        }

        self.rotate(config, key, now).await
    }

    /// Reprocessing entry point for an operator-named batch.
    ///
    /// Open batches go through the regular check. A batch that is locked and
    /// still the prefix's current batch was sealed by an invocation that
    /// never advanced the pointer; once it has been idle longer than
    /// `stale_after_secs` it is taken over by moving the pointer with the
    /// same conditional write a rotation uses. Only the invocation whose
    /// pointer write applies loads it.
    pub async fn take_over(
        &self,
        config: &LoadConfiguration,
        batch_id: &BatchId,
        stale_after_secs: u64,
    ) -> Result<RotationOutcome> {
        let key = BatchKey::new(batch_id.clone(), config.prefix.clone());
        let Some(batch) = self.store.get_batch(&key).await? else {
            info!(batch_id = %batch_id, prefix = %config.prefix, "No pending batch");
            return Ok(RotationOutcome::NoBatch);
        };

        if batch.status == BatchStatus::Open {
            return self.check(config, batch_id).await;
        }

        if batch.status != BatchStatus::Locked || &config.current_batch != batch_id {
            info!(batch = %key, status = %batch.status, "Batch is not a stuck current batch");
            return Ok(RotationOutcome::LostRace);
        }

        let now = now_epoch_secs();
        let idle = now.saturating_sub(batch.last_update);
        if idle <= stale_after_secs as i64 {
            warn!(
                batch = %key,
                idle_secs = idle,
                stale_after_secs,
                "Locked current batch may still be rotating, not taking it over yet"
            );
            return Ok(RotationOutcome::LostRace);
        }

        let next = BatchId::generate();
        match self
            .store
            .advance_current_batch(&config.prefix, batch_id, &next, now)
            .await?
        {
            WriteOutcome::Applied => {
                warn!(
                    prefix = %config.prefix,
                    sealed = %batch_id,
                    current = %next,
                    "Took over stuck locked batch and advanced current batch"
                );
                self.metrics.record_rotation(batch.entry_count());
                Ok(RotationOutcome::Rotated {
                    sealed: batch,
                    successor: Some(next),
                })
            }
            WriteOutcome::PreconditionFailed => {
                self.metrics.record_lock_race_lost();
                Ok(RotationOutcome::LostRace)
            }
        }
    }

    async fn rotate(&self, config: &LoadConfiguration, key: BatchKey, now: i64) -> Result<RotationOutcome> {
        if self
            .store
            .transition_batch(&key, &BatchTransition::Lock, now)
            .await?
            == WriteOutcome::PreconditionFailed
        {
            info!(batch = %key, "Batch already locked by another invocation");
            self.metrics.record_lock_race_lost();
            return Ok(RotationOutcome::LostRace);
        }

        let sealed = self
            .store
            .get_batch(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("batch {key}")))?;

        let next = BatchId::generate();
        let successor = match self
            .store
            .advance_current_batch(&config.prefix, &key.batch_id, &next, now)
            .await?
        {
            WriteOutcome::Applied => {
                info!(prefix = %config.prefix, sealed = %key.batch_id, current = %next, "Rotated current batch");
                Some(next)
            }
            WriteOutcome::PreconditionFailed => {
                warn!(
                    prefix = %config.prefix,
                    sealed = %key.batch_id,
                    "Sealed batch is not the current batch, loading without allocating a successor"
                );
                None
            }
        };

        self.metrics.record_rotation(sealed.entry_count());
        Ok(RotationOutcome::Rotated { sealed, successor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    fn batch(entries: usize, last_update: i64) -> Batch {
        Batch {
            batch_id: BatchId::from("b1"),
            prefix: "bucket/input".into(),
            status: BatchStatus::Open,
            entries: (0..entries).map(|i| format!("bucket/input/{i}.csv")).collect(),
            last_update,
            load_state: None,
            error_message: None,
        }
    }

    fn config(batch_size: u32, timeout: Option<u64>) -> LoadConfiguration {
        LoadConfiguration {
            prefix: "bucket/input".into(),
            current_batch: BatchId::from("b1"),
            batch_size,
            batch_timeout_secs: timeout,
            filename_filter_regex: None,
            load_clusters: vec![],
            success_topic: None,
            failure_topic: None,
            mount_dir: String::new(),
            copy_options: None,
            last_batch_rotation: None,
        }
    }

    #[test]
    fn test_size_trigger() {
        let policy = FlushPolicy {
            batch_size: 3,
            timeout_secs: None,
        };
        assert!(policy.should_flush(&batch(3, 0), 0));
        assert!(!policy.should_flush(&batch(2, 0), 10_000));
    }

    #[test]
    fn test_age_trigger() {
        let policy = FlushPolicy {
            batch_size: 100,
            timeout_secs: Some(60),
        };
        let now = 1_000;
        assert!(policy.should_flush(&batch(1, now - 61), now));
        assert!(!policy.should_flush(&batch(0, now - 61), now));
        assert!(!policy.should_flush(&batch(1, now - 60), now));
    }

    #[tokio::test]
    async fn test_missing_batch_is_noop() {
        let store = Arc::new(MemoryStateStore::new());
        let rotator = Rotator::new(store, Arc::new(LoaderMetrics::new()));
        let outcome = rotator.check(&config(1, None), &BatchId::from("b1")).await.unwrap();
        assert_eq!(outcome, RotationOutcome::NoBatch);
    }

    #[tokio::test]
    async fn test_rotation_seals_and_advances_pointer() {
        let store = Arc::new(MemoryStateStore::new());
        let cfg = config(2, None);
        store.put_config(&cfg).await.unwrap();
        let key = BatchKey::new(BatchId::from("b1"), "bucket/input");
        let _ = store.append_to_open_batch(&key, "bucket/input/a.csv", 1).await.unwrap();

        let rotator = Rotator::new(store.clone(), Arc::new(LoaderMetrics::new()));
        assert_eq!(
            rotator.check(&cfg, &BatchId::from("b1")).await.unwrap(),
            RotationOutcome::NotRequired
        );

        let _ = store.append_to_open_batch(&key, "bucket/input/b.csv", 2).await.unwrap();
        let RotationOutcome::Rotated { sealed, successor } =
            rotator.check(&cfg, &BatchId::from("b1")).await.unwrap()
        else {
            panic!("expected rotation");
        };

        assert_eq!(sealed.status, BatchStatus::Locked);
        assert_eq!(sealed.entry_count(), 2);
        let successor = successor.unwrap();
        let current = store.get_config("bucket/input").await.unwrap().unwrap();
        assert_eq!(current.current_batch, successor);
        assert!(current.last_batch_rotation.is_some());

        // A second check on the sealed batch loses the race.
        assert_eq!(
            rotator.check(&cfg, &BatchId::from("b1")).await.unwrap(),
            RotationOutcome::LostRace
        );
    }

    #[tokio::test]
    async fn test_rotating_non_current_batch_keeps_pointer() {
        let store = Arc::new(MemoryStateStore::new());
        let mut cfg = config(1, None);
        cfg.current_batch = BatchId::from("b9");
        store.put_config(&cfg).await.unwrap();
        let key = BatchKey::new(BatchId::from("b1"), "bucket/input");
        let _ = store.append_to_open_batch(&key, "bucket/input/a.csv", 1).await.unwrap();

        let rotator = Rotator::new(store.clone(), Arc::new(LoaderMetrics::new()));
        let outcome = rotator.check(&cfg, &BatchId::from("b1")).await.unwrap();
        assert!(matches!(
            outcome,
            RotationOutcome::Rotated {
                successor: None,
                ..
            }
        ));
        let current = store.get_config("bucket/input").await.unwrap().unwrap();
        assert_eq!(current.current_batch, BatchId::from("b9"));
    }

    #[tokio::test]
    async fn test_take_over_stuck_current_batch() {
        let store = Arc::new(MemoryStateStore::new());
        let cfg = config(10, None);
        store.put_config(&cfg).await.unwrap();
        let key = BatchKey::new(BatchId::from("b1"), "bucket/input");
        let _ = store.append_to_open_batch(&key, "bucket/input/a.csv", 1).await.unwrap();
        let _ = store.transition_batch(&key, &BatchTransition::Lock, 2).await.unwrap();

        let rotator = Rotator::new(store.clone(), Arc::new(LoaderMetrics::new()));
        assert_eq!(
            rotator.check(&cfg, &BatchId::from("b1")).await.unwrap(),
            RotationOutcome::LostRace
        );

        let RotationOutcome::Rotated { sealed, successor } = rotator
            .take_over(&cfg, &BatchId::from("b1"), 60)
            .await
            .unwrap()
        else {
            panic!("expected take-over");
        };
        assert_eq!(sealed.entry_count(), 1);
        let current = store.get_config("bucket/input").await.unwrap().unwrap();
        assert_eq!(Some(current.current_batch), successor);

        // The pointer has moved on, so a second take-over finds nothing to own.
        assert_eq!(
            rotator.take_over(&cfg, &BatchId::from("b1"), 60).await.unwrap(),
            RotationOutcome::LostRace
        );
    }

    #[tokio::test]
    async fn test_take_over_waits_for_recent_lock() {
        let store = Arc::new(MemoryStateStore::new());
        let cfg = config(10, None);
        store.put_config(&cfg).await.unwrap();
        let key = BatchKey::new(BatchId::from("b1"), "bucket/input");
        let now = now_epoch_secs();
        let _ = store.append_to_open_batch(&key, "bucket/input/a.csv", now).await.unwrap();
        let _ = store.transition_batch(&key, &BatchTransition::Lock, now).await.unwrap();

        let rotator = Rotator::new(store.clone(), Arc::new(LoaderMetrics::new()));
        assert_eq!(
            rotator.take_over(&cfg, &BatchId::from("b1"), 300).await.unwrap(),
            RotationOutcome::LostRace
        );
        let current = store.get_config("bucket/input").await.unwrap().unwrap();
        assert_eq!(current.current_batch, BatchId::from("b1"));
    }
}
