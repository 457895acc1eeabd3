//! PostgreSQL state store.
//!
//! Conditional writes are single statements whose `WHERE` clause carries the
//! precondition; the affected row count tells applied from rejected.

use super::{StateStore, StoreResult, WriteOutcome};
use crate::error::StoreError;
use crate::model::{
    Batch, BatchId, BatchKey, BatchStatus, BatchTransition, LoadConfiguration, LoadState,
    ProcessedFile,
};
use async_trait::async_trait;
use tokio_postgres::Row;
use tracing::{debug, info};

/// Tables used by the store. Applied by `vload init-schema`.
pub const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS load_configs (
    s3prefix          TEXT PRIMARY KEY,
    currentbatch      TEXT NOT NULL,
    lastbatchrotation BIGINT,
    config            JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS batches (
    batchid               TEXT NOT NULL,
    s3prefix              TEXT NOT NULL,
    status                TEXT NOT NULL,
    entries               TEXT[] NOT NULL DEFAULT '{}',
    lastupdate            BIGINT NOT NULL,
    clusterloadstatus     JSONB,
    clusterloadstatements JSONB,
    errormessage          TEXT,
    PRIMARY KEY (batchid, s3prefix)
);

CREATE TABLE IF NOT EXISTS processed_files (
    loadfile TEXT PRIMARY KEY,
    batchid  TEXT
);
"#;

const APPEND_SQL: &str = "\
INSERT INTO batches (batchid, s3prefix, status, entries, lastupdate)
VALUES ($1, $2, 'open', ARRAY[$3::TEXT], $4)
ON CONFLICT (batchid, s3prefix) DO UPDATE
    SET entries = array_append(batches.entries, $3::TEXT),
        lastupdate = EXCLUDED.lastupdate
    WHERE batches.status = 'open'";

const TRANSITION_SQL: &str = "\
UPDATE batches
   SET status = $3, lastupdate = $4, errormessage = COALESCE($5, errormessage)
 WHERE batchid = $1 AND s3prefix = $2 AND status = ANY($6)";

/// Store backed by PostgreSQL through a small connection pool.
pub struct PostgresStateStore {
    pool: deadpool_postgres::Pool,
}

impl PostgresStateStore {
    /// Create the pool. Connectivity is not checked until first use.
    pub fn connect(connection_string: &str, max_pool_size: usize) -> StoreResult<Self> {
        let pg_config: tokio_postgres::Config = connection_string
            .parse()
            .map_err(|e| StoreError::Connection(format!("invalid connection string: {e}")))?;

        let mgr_config = deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Fast,
        };
        let mgr =
            deadpool_postgres::Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);

        let pool = deadpool_postgres::Pool::builder(mgr)
            .max_size(max_pool_size)
            .build()
            .map_err(|e| StoreError::Connection(format!("pool creation failed: {e}")))?;

        Ok(Self { pool })
    }

    /// Create the tables if they do not exist.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA_DDL).await?;
        info!("State store schema ensured");
        Ok(())
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

fn decode_err(what: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Decode {
        what: what.to_string(),
        message: e.to_string(),
    }
}

fn config_from_row(row: &Row) -> StoreResult<LoadConfiguration> {
    let document: serde_json::Value = row.try_get("config")?;
    let mut config: LoadConfiguration =
        serde_json::from_value(document).map_err(|e| decode_err("load configuration", e))?;

    // The pointer columns are authoritative; the document copy is whatever
    // was applied by the operator.
    let current: String = row.try_get("currentbatch")?;
    config.current_batch = BatchId::from(current);
    config.last_batch_rotation = row.try_get("lastbatchrotation")?;
    Ok(config)
}

fn batch_from_row(row: &Row) -> StoreResult<Batch> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<BatchStatus>()
        .map_err(|e| decode_err("batch status", e))?;

    let statuses: Option<serde_json::Value> = row.try_get("clusterloadstatus")?;
    let statements: Option<serde_json::Value> = row.try_get("clusterloadstatements")?;
    let load_state = match (statuses, statements) {
        (Some(statuses), Some(statements)) => Some(LoadState {
            statuses: serde_json::from_value(statuses)
                .map_err(|e| decode_err("cluster load status", e))?,
            statements: serde_json::from_value(statements)
                .map_err(|e| decode_err("cluster load statements", e))?,
        }),
        _ => None,
    };

    let batch_id: String = row.try_get("batchid")?;
    Ok(Batch {
        batch_id: BatchId::from(batch_id),
        prefix: row.try_get("s3prefix")?,
        status,
        entries: row.try_get("entries")?,
        last_update: row.try_get("lastupdate")?,
        load_state,
        error_message: row.try_get("errormessage")?,
    })
}

fn outcome(rows: u64) -> WriteOutcome {
    if rows > 0 {
        WriteOutcome::Applied
    } else {
        WriteOutcome::PreconditionFailed
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn get_config(&self, prefix: &str) -> StoreResult<Option<LoadConfiguration>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT currentbatch, lastbatchrotation, config FROM load_configs WHERE s3prefix = $1",
                &[&prefix],
            )
            .await?;
        row.as_ref().map(config_from_row).transpose()
    }

    async fn put_config(&self, config: &LoadConfiguration) -> StoreResult<()> {
        let document =
            serde_json::to_value(config).map_err(|e| decode_err("load configuration", e))?;
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO load_configs (s3prefix, currentbatch, lastbatchrotation, config)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (s3prefix) DO UPDATE
                     SET config = EXCLUDED.config",
                &[
                    &config.prefix,
                    &config.current_batch.as_str(),
                    &config.last_batch_rotation,
                    &document,
                ],
            )
            .await?;
        Ok(())
    }

    async fn advance_current_batch(
        &self,
        prefix: &str,
        expected: &BatchId,
        next: &BatchId,
        rotated_at: i64,
    ) -> StoreResult<WriteOutcome> {
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                "UPDATE load_configs SET currentbatch = $3, lastbatchrotation = $4
                 WHERE s3prefix = $1 AND currentbatch = $2",
                &[&prefix, &expected.as_str(), &next.as_str(), &rotated_at],
            )
            .await?;
        debug!(prefix = %prefix, next = %next, rows, "Advance current batch");
        Ok(outcome(rows))
    }

    async fn insert_processed_file(&self, item: &str) -> StoreResult<WriteOutcome> {
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                "INSERT INTO processed_files (loadfile) VALUES ($1) ON CONFLICT (loadfile) DO NOTHING",
                &[&item],
            )
            .await?;
        Ok(outcome(rows))
    }

    async fn link_processed_file(&self, item: &str, batch_id: &BatchId) -> StoreResult<()> {
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                "UPDATE processed_files SET batchid = $2 WHERE loadfile = $1",
                &[&item, &batch_id.as_str()],
            )
            .await?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("processed file {item}")));
        }
        Ok(())
    }

    async fn get_processed_file(&self, item: &str) -> StoreResult<Option<ProcessedFile>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT loadfile, batchid FROM processed_files WHERE loadfile = $1",
                &[&item],
            )
            .await?;
        row.map(|row| -> StoreResult<ProcessedFile> {
            let batch_id: Option<String> = row.try_get("batchid")?;
            Ok(ProcessedFile {
                item: row.try_get("loadfile")?,
                batch_id: batch_id.map(BatchId::from),
            })
        })
        .transpose()
    }

    async fn append_to_open_batch(
        &self,
        key: &BatchKey,
        entry: &str,
        at: i64,
    ) -> StoreResult<WriteOutcome> {
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                APPEND_SQL,
                &[&key.batch_id.as_str(), &key.prefix, &entry, &at],
            )
            .await?;
        Ok(outcome(rows))
    }

    async fn transition_batch(
        &self,
        key: &BatchKey,
        transition: &BatchTransition,
        at: i64,
    ) -> StoreResult<WriteOutcome> {
        let allowed: Vec<&str> = transition
            .allowed_from()
            .iter()
            .map(BatchStatus::as_str)
            .collect();
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                TRANSITION_SQL,
                &[
                    &key.batch_id.as_str(),
                    &key.prefix,
                    &transition.target().as_str(),
                    &at,
                    &transition.error_message(),
                    &allowed,
                ],
            )
            .await?;
        Ok(outcome(rows))
    }

    async fn get_batch(&self, key: &BatchKey) -> StoreResult<Option<Batch>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT batchid, s3prefix, status, entries, lastupdate, clusterloadstatus,
                        clusterloadstatements, errormessage
                   FROM batches WHERE batchid = $1 AND s3prefix = $2",
                &[&key.batch_id.as_str(), &key.prefix],
            )
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn record_load_state(
        &self,
        key: &BatchKey,
        state: &LoadState,
        at: i64,
    ) -> StoreResult<()> {
        let statuses = serde_json::to_value(&state.statuses)
            .map_err(|e| decode_err("cluster load status", e))?;
        let statements = serde_json::to_value(&state.statements)
            .map_err(|e| decode_err("cluster load statements", e))?;

        let client = self.pool.get().await?;
        let rows = client
            .execute(
                "UPDATE batches
                    SET clusterloadstatus = $3, clusterloadstatements = $4, lastupdate = $5
                  WHERE batchid = $1 AND s3prefix = $2",
                &[&key.batch_id.as_str(), &key.prefix, &statuses, &statements, &at],
            )
            .await?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("batch {key}")));
        }
        Ok(())
    }
}
