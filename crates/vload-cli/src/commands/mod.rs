//! Command implementations.

pub mod batch;
pub mod prefix;
pub mod process;
pub mod serve;
pub mod status;

use thiserror::Error;
use vload_core::FlushOutcome;

/// An operator action the store state does not permit.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Refused(pub String);

/// An invocation closed its batch in error.
#[derive(Debug, Error)]
#[error("Batch {batch_id} closed in error: {error}")]
pub struct BatchFailed {
    pub batch_id: String,
    pub error: String,
}

impl BatchFailed {
    /// The failure carried by a flush that closed its batch in error.
    pub fn from_flush(flush: &FlushOutcome) -> Option<Self> {
        match flush {
            FlushOutcome::Closed {
                batch_id, report, ..
            } => report.error.as_ref().map(|error| BatchFailed {
                batch_id: batch_id.to_string(),
                error: error.clone(),
            }),
            _ => None,
        }
    }
}

/// Print a value as pretty JSON on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
