//! Exactly-once admission of file references.

use crate::error::Result;
use crate::metrics::LoaderMetrics;
use crate::store::{StateStore, WriteOutcome};
use std::sync::Arc;
use tracing::info;

/// Result of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; the caller owns appending the file to a batch
    Admitted,
    /// A marker already exists; the file was seen before
    Duplicate,
}

/// Inserts processed-file markers.
pub struct Registrar {
    store: Arc<dyn StateStore>,
    metrics: Arc<LoaderMetrics>,
}

impl Registrar {
    pub fn new(store: Arc<dyn StateStore>, metrics: Arc<LoaderMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Admit `item` (`bucket/key`) at most once across all invocations.
    ///
    /// The marker is created unlinked; the accumulator links it once the
    /// append lands. An unlinked marker left behind by a crash still blocks
    /// re-admission.
    pub async fn admit(&self, item: &str) -> Result<Admission> {
        match self.store.insert_processed_file(item).await? {
            WriteOutcome::Applied => {
                self.metrics.record_file_admitted();
                Ok(Admission::Admitted)
            }
            WriteOutcome::PreconditionFailed => {
                info!(item = %item, "File already processed");
                self.metrics.record_file_duplicate();
                Ok(Admission::Duplicate)
            }
        }
    }
}
