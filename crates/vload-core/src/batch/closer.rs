//! Persisting load outcomes, closing the batch and notifying.

use crate::error::{Error, Result, StoreError};
use crate::metrics::LoaderMetrics;
use crate::model::{
    now_epoch_secs, Batch, BatchStatus, BatchTransition, LoadConfiguration, LoadState,
    TargetLoadResult,
};
use crate::notify::{NotificationBody, Notifier};
use crate::store::{StateStore, WriteOutcome};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// How a batch was closed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseReport {
    pub status: BatchStatus,
    /// Serialized failure summary stored on the batch, if it closed in error
    pub error: Option<String>,
    /// Whether a notification was published
    pub notified: bool,
    pub load_state: LoadState,
}

/// Closes loaded batches.
pub struct BatchCloser {
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<LoaderMetrics>,
}

impl BatchCloser {
    pub fn new(
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<LoaderMetrics>,
    ) -> Self {
        Self {
            store,
            notifier,
            metrics,
        }
    }

    /// Record per-target outcomes on the batch, move it to complete or
    /// error and send the one notification for it.
    ///
    /// A failure to close is terminal and sends nothing. A publish failure
    /// is returned after the batch is already durably closed.
    pub async fn close(
        &self,
        config: &LoadConfiguration,
        batch: &Batch,
        results: &BTreeMap<String, TargetLoadResult>,
        load_started: Instant,
    ) -> Result<CloseReport> {
        let key = batch.key();
        let load_state = LoadState::from_results(results);

        let batch_error = match self
            .store
            .record_load_state(&key, &load_state, now_epoch_secs())
            .await
        {
            Err(e) => {
                error!(batch = %key, error = %e, "Unable to attach per-target load state");
                Some(serde_json::to_string(&e.to_string())?)
            }
            Ok(()) if load_state.all_ok() => None,
            Ok(()) => Some(serde_json::to_string(&load_state.failures())?),
        };

        let transition = match &batch_error {
            None => BatchTransition::Complete,
            Some(error) => BatchTransition::Fail {
                error: error.clone(),
            },
        };
        let status = transition.target();

        if self
            .store
            .transition_batch(&key, &transition, now_epoch_secs())
            .await?
            == WriteOutcome::PreconditionFailed
        {
            return Err(Error::Store(StoreError::UnexpectedStatus {
                batch_id: key.batch_id.to_string(),
                expected: BatchStatus::Locked.to_string(),
            }));
        }

        self.metrics.record_batch_closed(
            batch_error.is_none(),
            load_state.failures().len(),
            load_started.elapsed(),
        );
        match &batch_error {
            None => info!(batch = %key, "Batch load complete"),
            Some(e) => error!(batch = %key, error = %e, "Batch load failed"),
        }

        let body = match &batch_error {
            None => NotificationBody::ok(&key.batch_id, &key.prefix, load_state.statements.clone()),
            Some(e) => NotificationBody::error(
                &key.batch_id,
                &key.prefix,
                e.clone(),
                Some(load_state.statements.clone()),
            ),
        };
        let channel = if body.is_error() {
            config.failure_topic.as_deref()
        } else {
            config.success_topic.as_deref()
        };
        let notified = self.notify(channel, &body).await?;

        Ok(CloseReport {
            status,
            error: batch_error,
            notified,
            load_state,
        })
    }

    /// Publish `body` to `channel` if one is configured.
    pub async fn notify(&self, channel: Option<&str>, body: &NotificationBody) -> Result<bool> {
        let Some(channel) = channel.filter(|c| !c.is_empty()) else {
            debug!(batch_id = %body.batchid, "No notification channel configured");
            return Ok(false);
        };
        let message = serde_json::to_string(body)?;
        self.notifier
            .publish(channel, &body.subject(), &message)
            .await?;
        self.metrics.record_notification();
        Ok(true)
    }
}
