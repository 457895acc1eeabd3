//! Durable configuration and batch state store.
//!
//! Every mutation that other invocations can race is a conditional write.
//! A failed precondition is reported as [`WriteOutcome::PreconditionFailed`]
//! and never as an error: it is the normal signal that another invocation got
//! there first. Errors are reserved for the store being unreachable or
//! returning something undecodable.

mod memory;
mod postgres;

pub use memory::MemoryStateStore;
pub use postgres::{PostgresStateStore, SCHEMA_DDL};

use crate::error::StoreError;
use crate::model::{
    Batch, BatchId, BatchKey, BatchTransition, LoadConfiguration, LoadState, ProcessedFile,
};
use async_trait::async_trait;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of a conditional write.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Precondition held and the write was applied
    Applied,
    /// Precondition did not hold; nothing was written
    PreconditionFailed,
}

impl WriteOutcome {
    pub fn is_applied(self) -> bool {
        self == WriteOutcome::Applied
    }
}

/// Operations the coordinator needs from the durable store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the configuration for a prefix.
    async fn get_config(&self, prefix: &str) -> StoreResult<Option<LoadConfiguration>>;

    /// Create a prefix configuration, or replace the settings of an existing
    /// one (operator action).
    ///
    /// The current-batch pointer and last rotation of an existing prefix are
    /// left untouched: only [`StateStore::advance_current_batch`] moves them.
    async fn put_config(&self, config: &LoadConfiguration) -> StoreResult<()>;

    /// Move the prefix's current-batch pointer from `expected` to `next`.
    ///
    /// Applied only if the pointer still names `expected`.
    async fn advance_current_batch(
        &self,
        prefix: &str,
        expected: &BatchId,
        next: &BatchId,
        rotated_at: i64,
    ) -> StoreResult<WriteOutcome>;

    /// Insert a processed-file marker if none exists for `item`.
    async fn insert_processed_file(&self, item: &str) -> StoreResult<WriteOutcome>;

    /// Record the batch a processed file landed in.
    async fn link_processed_file(&self, item: &str, batch_id: &BatchId) -> StoreResult<()>;

    /// Read a processed-file marker.
    async fn get_processed_file(&self, item: &str) -> StoreResult<Option<ProcessedFile>>;

    /// Append `entry` to the batch if it is open, creating it open if absent.
    async fn append_to_open_batch(
        &self,
        key: &BatchKey,
        entry: &str,
        at: i64,
    ) -> StoreResult<WriteOutcome>;

    /// Apply a status transition if the batch is in one of its allowed source states.
    async fn transition_batch(
        &self,
        key: &BatchKey,
        transition: &BatchTransition,
        at: i64,
    ) -> StoreResult<WriteOutcome>;

    /// Read a batch.
    async fn get_batch(&self, key: &BatchKey) -> StoreResult<Option<Batch>>;

    /// Attach per-target load outcomes to a batch.
    async fn record_load_state(
        &self,
        key: &BatchKey,
        state: &LoadState,
        at: i64,
    ) -> StoreResult<()>;
}
