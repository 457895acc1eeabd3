//! Process command implementation.

use super::{print_json, BatchFailed};
use anyhow::{Context, Result};
use std::io::Read;
use std::path::PathBuf;
use tracing::info;
use vload_core::{Config, Pipeline, ProcessOutcome, Services};

/// Run one invocation for an event read from `file` or stdin.
pub async fn run(config: Config, file: Option<PathBuf>) -> Result<()> {
    let payload = match &file {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("Failed to read event file {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read event from stdin")?;
            buf
        }
    };

    info!(bytes = payload.len(), "Processing event");

    let services = Services::from_config(&config).await?;
    let pipeline = Pipeline::new(&services, &config);
    let outcome = pipeline.process_payload(&payload).await?;

    print_json(&outcome)?;

    match &outcome {
        ProcessOutcome::Appended { flush, .. } | ProcessOutcome::Filtered { flush, .. } => {
            match BatchFailed::from_flush(flush) {
                Some(failed) => Err(failed.into()),
                None => Ok(()),
            }
        }
        _ => Ok(()),
    }
}
