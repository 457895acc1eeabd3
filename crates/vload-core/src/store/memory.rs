//! In-memory state store.
//!
//! Thread-safe via a single mutex, which makes every conditional write
//! linearizable. Used by tests and by `vload serve` with the memory backend;
//! state does not survive the process.

use super::{StateStore, StoreResult, WriteOutcome};
use crate::error::StoreError;
use crate::model::{
    Batch, BatchId, BatchKey, BatchTransition, LoadConfiguration, LoadState, ProcessedFile,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Inner {
    configs: HashMap<String, LoadConfiguration>,
    batches: HashMap<(String, String), Batch>,
    processed: HashMap<String, ProcessedFile>,
}

/// Store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

fn batch_slot(key: &BatchKey) -> (String, String) {
    (key.batch_id.as_str().to_string(), key.prefix.clone())
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every batch stored for a prefix, in no particular order.
    pub fn batches_for(&self, prefix: &str) -> Vec<Batch> {
        self.inner
            .lock()
            .batches
            .values()
            .filter(|b| b.prefix == prefix)
            .cloned()
            .collect()
    }

    /// Number of processed-file markers.
    pub fn processed_count(&self) -> usize {
        self.inner.lock().processed.len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_config(&self, prefix: &str) -> StoreResult<Option<LoadConfiguration>> {
        Ok(self.inner.lock().configs.get(prefix).cloned())
    }

    async fn put_config(&self, config: &LoadConfiguration) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let mut stored = config.clone();
        if let Some(existing) = inner.configs.get(&config.prefix) {
            stored.current_batch = existing.current_batch.clone();
            stored.last_batch_rotation = existing.last_batch_rotation;
        }
        inner.configs.insert(config.prefix.clone(), stored);
        Ok(())
    }

    async fn advance_current_batch(
        &self,
        prefix: &str,
        expected: &BatchId,
        next: &BatchId,
        rotated_at: i64,
    ) -> StoreResult<WriteOutcome> {
        let mut inner = self.inner.lock();
        let config = inner
            .configs
            .get_mut(prefix)
            .ok_or_else(|| StoreError::NotFound(format!("configuration for {prefix}")))?;

        if &config.current_batch != expected {
            return Ok(WriteOutcome::PreconditionFailed);
        }

        config.current_batch = next.clone();
        config.last_batch_rotation = Some(rotated_at);
        Ok(WriteOutcome::Applied)
    }

    async fn insert_processed_file(&self, item: &str) -> StoreResult<WriteOutcome> {
        let mut inner = self.inner.lock();
        if inner.processed.contains_key(item) {
            return Ok(WriteOutcome::PreconditionFailed);
        }
        inner.processed.insert(
            item.to_string(),
            ProcessedFile {
                item: item.to_string(),
                batch_id: None,
            },
        );
        Ok(WriteOutcome::Applied)
    }

    async fn link_processed_file(&self, item: &str, batch_id: &BatchId) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let marker = inner
            .processed
            .get_mut(item)
            .ok_or_else(|| StoreError::NotFound(format!("processed file {item}")))?;
        marker.batch_id = Some(batch_id.clone());
        Ok(())
    }

    async fn get_processed_file(&self, item: &str) -> StoreResult<Option<ProcessedFile>> {
        Ok(self.inner.lock().processed.get(item).cloned())
    }

    async fn append_to_open_batch(
        &self,
        key: &BatchKey,
        entry: &str,
        at: i64,
    ) -> StoreResult<WriteOutcome> {
        let mut inner = self.inner.lock();
        match inner.batches.get_mut(&batch_slot(key)) {
            Some(batch) if batch.status == crate::model::BatchStatus::Open => {
                batch.entries.push(entry.to_string());
                batch.last_update = at;
                Ok(WriteOutcome::Applied)
            }
            Some(_) => Ok(WriteOutcome::PreconditionFailed),
            None => {
                inner
                    .batches
                    .insert(batch_slot(key), Batch::open_with(key, entry, at));
                Ok(WriteOutcome::Applied)
            }
        }
    }

    async fn transition_batch(
        &self,
        key: &BatchKey,
        transition: &BatchTransition,
        at: i64,
    ) -> StoreResult<WriteOutcome> {
        let mut inner = self.inner.lock();
        let Some(batch) = inner.batches.get_mut(&batch_slot(key)) else {
            return Ok(WriteOutcome::PreconditionFailed);
        };

        if !transition.allowed_from().contains(&batch.status) {
            return Ok(WriteOutcome::PreconditionFailed);
        }

        batch.status = transition.target();
        batch.last_update = at;
        if let Some(error) = transition.error_message() {
            batch.error_message = Some(error.to_string());
        }
        Ok(WriteOutcome::Applied)
    }

    async fn get_batch(&self, key: &BatchKey) -> StoreResult<Option<Batch>> {
        Ok(self.inner.lock().batches.get(&batch_slot(key)).cloned())
    }

    async fn record_load_state(
        &self,
        key: &BatchKey,
        state: &LoadState,
        at: i64,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let batch = inner
            .batches
            .get_mut(&batch_slot(key))
            .ok_or_else(|| StoreError::NotFound(format!("batch {key}")))?;
        batch.load_state = Some(state.clone());
        batch.last_update = at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BatchStatus;

    fn key(id: &str) -> BatchKey {
        BatchKey::new(BatchId::from(id), "bucket/input")
    }

    #[tokio::test]
    async fn test_processed_file_insert_is_once_only() {
        let store = MemoryStateStore::new();
        assert_eq!(
            store.insert_processed_file("bucket/a.csv").await.unwrap(),
            WriteOutcome::Applied
        );
        assert_eq!(
            store.insert_processed_file("bucket/a.csv").await.unwrap(),
            WriteOutcome::PreconditionFailed
        );

        store
            .link_processed_file("bucket/a.csv", &BatchId::from("b1"))
            .await
            .unwrap();
        let marker = store.get_processed_file("bucket/a.csv").await.unwrap().unwrap();
        assert_eq!(marker.batch_id, Some(BatchId::from("b1")));
    }

    #[tokio::test]
    async fn test_append_creates_then_extends_open_batch() {
        let store = MemoryStateStore::new();
        let k = key("b1");

        assert!(store.append_to_open_batch(&k, "e1", 10).await.unwrap().is_applied());
        assert!(store.append_to_open_batch(&k, "e2", 20).await.unwrap().is_applied());

        let batch = store.get_batch(&k).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Open);
        assert_eq!(batch.entries, vec!["e1", "e2"]);
        assert_eq!(batch.last_update, 20);
    }

    #[tokio::test]
    async fn test_append_rejected_once_locked() {
        let store = MemoryStateStore::new();
        let k = key("b1");
        let _ = store.append_to_open_batch(&k, "e1", 10).await.unwrap();

        assert!(store
            .transition_batch(&k, &BatchTransition::Lock, 11)
            .await
            .unwrap()
            .is_applied());
        assert_eq!(
            store.append_to_open_batch(&k, "e2", 12).await.unwrap(),
            WriteOutcome::PreconditionFailed
        );
        assert_eq!(store.get_batch(&k).await.unwrap().unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_applies_once() {
        let store = MemoryStateStore::new();
        let k = key("b1");
        let _ = store.append_to_open_batch(&k, "e1", 10).await.unwrap();

        let first = store.transition_batch(&k, &BatchTransition::Lock, 11).await.unwrap();
        let second = store.transition_batch(&k, &BatchTransition::Lock, 12).await.unwrap();
        assert_eq!(first, WriteOutcome::Applied);
        assert_eq!(second, WriteOutcome::PreconditionFailed);
    }

    #[tokio::test]
    async fn test_fail_transition_stores_error() {
        let store = MemoryStateStore::new();
        let k = key("b1");
        let _ = store.append_to_open_batch(&k, "e1", 10).await.unwrap();
        let _ = store.transition_batch(&k, &BatchTransition::Lock, 11).await.unwrap();

        let fail = BatchTransition::Fail {
            error: "{\"db1\":\"down\"}".into(),
        };
        assert!(store.transition_batch(&k, &fail, 12).await.unwrap().is_applied());

        let batch = store.get_batch(&k).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Error);
        assert_eq!(batch.error_message.as_deref(), Some("{\"db1\":\"down\"}"));

        // Terminal states cannot be closed twice
        assert_eq!(
            store
                .transition_batch(&k, &BatchTransition::Complete, 13)
                .await
                .unwrap(),
            WriteOutcome::PreconditionFailed
        );
    }

    #[tokio::test]
    async fn test_advance_pointer_requires_expected_value() {
        let store = MemoryStateStore::new();
        store
            .put_config(&LoadConfiguration {
                prefix: "bucket/input".into(),
                current_batch: BatchId::from("b1"),
                batch_size: 3,
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

        let b2 = BatchId::from("b2");
        assert!(store
            .advance_current_batch("bucket/input", &BatchId::from("b1"), &b2, 100)
            .await
            .unwrap()
            .is_applied());
        assert_eq!(
            store
                .advance_current_batch("bucket/input", &BatchId::from("b1"), &BatchId::from("b3"), 101)
                .await
                .unwrap(),
            WriteOutcome::PreconditionFailed
        );

        let config = store.get_config("bucket/input").await.unwrap().unwrap();
        assert_eq!(config.current_batch, b2);
        assert_eq!(config.last_batch_rotation, Some(100));
    }

    #[tokio::test]
    async fn test_reapplied_configuration_keeps_rotated_pointer() {
        let store = MemoryStateStore::new();
        let mut applied = LoadConfiguration {
            prefix: "bucket/input".into(),
            current_batch: BatchId::from("b1"),
            batch_size: 3,
            batch_timeout_secs: None,
            filename_filter_regex: None,
            load_clusters: vec![],
            success_topic: None,
            failure_topic: None,
            mount_dir: String::new(),
            copy_options: None,
            last_batch_rotation: None,
        };
        store.put_config(&applied).await.unwrap();

        // An operator read the configuration, then a rotation moved the pointer.
        let read = store.get_config("bucket/input").await.unwrap().unwrap();
        assert!(store
            .advance_current_batch("bucket/input", &BatchId::from("b1"), &BatchId::from("b2"), 50)
            .await
            .unwrap()
            .is_applied());

        applied.current_batch = read.current_batch;
        applied.batch_size = 7;
        store.put_config(&applied).await.unwrap();

        let stored = store.get_config("bucket/input").await.unwrap().unwrap();
        assert_eq!(stored.current_batch, BatchId::from("b2"));
        assert_eq!(stored.last_batch_rotation, Some(50));
        assert_eq!(stored.batch_size, 7);
    }
}
