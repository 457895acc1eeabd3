//! Appending admitted files to the open batch of a prefix.
//!
//! Many invocations append to the same batch concurrently. The append is
//! conditional on the batch still being open; a rejected append means the
//! batch was sealed in the meantime, so the accumulator re-reads the prefix's
//! current-batch pointer, waits a random delay and tries the new batch.

use crate::config::AccumulatorConfig;
use crate::error::{Error, Result, StoreError};
use crate::metrics::LoaderMetrics;
use crate::model::{now_epoch_secs, BatchId, BatchKey};
use crate::store::{StateStore, WriteOutcome};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bounded retry with uniform random backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, max_jitter: Duration) -> Self {
        Self {
            max_attempts,
            max_jitter,
        }
    }

    pub fn from_config(config: &AccumulatorConfig) -> Self {
        Self::new(
            config.max_append_attempts,
            Duration::from_millis(config.max_jitter_ms),
        )
    }

    /// Delay drawn uniformly from `[0, max_jitter]`.
    pub fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AccumulatorConfig::default())
    }
}

/// Lands entries in the open batch.
pub struct Accumulator {
    store: Arc<dyn StateStore>,
    policy: RetryPolicy,
    metrics: Arc<LoaderMetrics>,
}

impl Accumulator {
    pub fn new(store: Arc<dyn StateStore>, policy: RetryPolicy, metrics: Arc<LoaderMetrics>) -> Self {
        Self {
            store,
            policy,
            metrics,
        }
    }

    /// Append `entry` starting from `batch_id`, following the prefix's
    /// current-batch pointer on contention. Returns the batch the entry
    /// finally landed in.
    pub async fn append(&self, prefix: &str, batch_id: BatchId, entry: &str) -> Result<BatchId> {
        let mut batch_id = batch_id;

        for attempt in 1..=self.policy.max_attempts {
            let key = BatchKey::new(batch_id.clone(), prefix);
            match self
                .store
                .append_to_open_batch(&key, entry, now_epoch_secs())
                .await?
            {
                WriteOutcome::Applied => {
                    debug!(entry = %entry, batch_id = %batch_id, attempt, "Entry appended");
                    self.link(entry, &batch_id).await;
                    return Ok(batch_id);
                }
                WriteOutcome::PreconditionFailed => {
                    self.metrics.record_append_conflict();
                    info!(
                        entry = %entry,
                        batch_id = %batch_id,
                        attempt,
                        "Batch no longer open, refreshing current batch"
                    );

                    let config = self.store.get_config(prefix).await?.ok_or_else(|| {
                        StoreError::NotFound(format!("configuration for {prefix}"))
                    })?;
                    batch_id = config.current_batch;

                    if attempt < self.policy.max_attempts {
                        let delay = self.policy.jitter();
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.metrics.record_retry_ceiling();
        Err(Error::RetryCeilingExceeded {
            entry: entry.to_string(),
            prefix: prefix.to_string(),
            batch_id: batch_id.to_string(),
            attempts: self.policy.max_attempts,
        })
    }

    /// Best effort: the marker already blocks re-admission without it.
    async fn link(&self, entry: &str, batch_id: &BatchId) {
        if let Err(e) = self.store.link_processed_file(entry, batch_id).await {
            warn!(entry = %entry, batch_id = %batch_id, error = %e, "Unable to link processed file to batch");
        }
    }
}
