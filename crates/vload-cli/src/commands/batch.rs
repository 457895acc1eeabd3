//! Batch command implementations: flush sweep, unlock and inspection.

use super::{print_json, BatchFailed, Refused};
use anyhow::Result;
use tracing::info;
use vload_core::batch::{UnlockOutcome, Unlocker};
use vload_core::model::{BatchId, BatchKey};
use vload_core::{Config, FlushOutcome, Pipeline, Services, StoreError};

/// Run the flush check against the prefix's current batch, or against
/// `batch_id` to reprocess an unlocked batch.
pub async fn flush(config: Config, prefix: &str, batch_id: Option<String>) -> Result<()> {
    let services = Services::from_config(&config).await?;
    let pipeline = Pipeline::new(&services, &config);

    let batch_id = batch_id.map(BatchId::from);
    info!(prefix = %prefix, batch_id = ?batch_id, "Running flush check");

    let outcome = pipeline.check_pending_batch(prefix, batch_id).await?;
    print_json(&outcome)?;

    if let FlushOutcome::Closed {
        batch_id, report, ..
    } = &outcome
    {
        info!(batch_id = %batch_id, status = %report.status, "Flush check closed batch");
    }

    match BatchFailed::from_flush(&outcome) {
        Some(failed) => Err(failed.into()),
        None => Ok(()),
    }
}

/// Move a locked or failed batch back to open.
pub async fn unlock(config: Config, prefix: &str, batch_id: &str) -> Result<()> {
    let services = Services::from_config(&config).await?;
    let unlocker = Unlocker::new(services.store.clone());

    match unlocker.unlock(prefix, &BatchId::from(batch_id)).await? {
        UnlockOutcome::Unlocked => {
            println!("Batch {batch_id} for {prefix} is open again.");
            println!("Reprocess it with: vload flush --prefix {prefix} --batch-id {batch_id}");
            Ok(())
        }
        UnlockOutcome::RefusedCurrentBatch => Err(Refused(format!(
            "Batch {batch_id} is the current batch for {prefix} and may still receive files. \
             Use the reprocessing path instead: vload flush --prefix {prefix} --batch-id {batch_id}"
        ))
        .into()),
        UnlockOutcome::NotUnlockable(status) => {
            let status = status.map_or_else(|| "missing".to_string(), |s| s.to_string());
            Err(Refused(format!(
                "Batch {batch_id} for {prefix} is {status}; only locked or error batches can be unlocked"
            ))
            .into())
        }
    }
}

/// Print a batch record.
pub async fn show(config: Config, prefix: &str, batch_id: &str) -> Result<()> {
    let services = Services::from_config(&config).await?;
    let key = BatchKey::new(BatchId::from(batch_id), prefix);

    match services.store.get_batch(&key).await? {
        Some(batch) => print_json(&batch),
        None => Err(vload_core::Error::from(StoreError::NotFound(format!("batch {key}"))).into()),
    }
}
