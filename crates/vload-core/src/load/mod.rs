//! Fan-out of a sealed batch to every configured target cluster.
//!
//! Targets are loaded concurrently and awaited together. Each target runs:
//!
//! ```text
//! unwrap credential → connect → [pre-load] → session statements + COPY
//!     → [post-load, only after a successful COPY] → disconnect
//! ```
//!
//! A failure on one target never affects another; every target yields a
//! [`TargetLoadResult`] and nothing is retried.

mod pgwire;
mod statements;
mod target;

pub use pgwire::PgWireConnector;
pub use statements::{copy_statement, file_list, mounted_path};
pub use target::{TargetConnector, TargetEndpoint, TargetSession};

use crate::error::LoadError;
use crate::model::{
    Batch, ClusterInfo, LoadConfiguration, StatementAudit, TargetLoadResult, TargetStatus,
};
use crate::secrets::SecretUnwrapper;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::iter;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Runs the load pass for a batch.
pub struct LoadOrchestrator {
    connector: Arc<dyn TargetConnector>,
    secrets: Arc<dyn SecretUnwrapper>,
    session_statements: Vec<String>,
}

impl LoadOrchestrator {
    pub fn new(
        connector: Arc<dyn TargetConnector>,
        secrets: Arc<dyn SecretUnwrapper>,
        session_statements: Vec<String>,
    ) -> Self {
        Self {
            connector,
            secrets,
            session_statements,
        }
    }

    /// Load the batch's entries into every cluster of `config`, keyed by
    /// [`ClusterInfo::target_id`].
    pub async fn load(
        &self,
        batch: &Batch,
        config: &LoadConfiguration,
    ) -> BTreeMap<String, TargetLoadResult> {
        info!(
            batch_id = %batch.batch_id,
            prefix = %batch.prefix,
            entries = batch.entry_count(),
            clusters = config.load_clusters.len(),
            "Loading batch"
        );

        if batch.entries.is_empty() {
            let reason = LoadError::EmptyBatch(batch.batch_id.to_string()).to_string();
            return config
                .load_clusters
                .iter()
                .map(|cluster| {
                    let target = cluster.target_id();
                    (
                        target.clone(),
                        failed(target, StatementAudit::default(), reason.clone()),
                    )
                })
                .collect();
        }

        let files = file_list(&config.mount_dir, &batch.entries);
        let copy_options = config.copy_options.as_deref();

        let results = join_all(
            config
                .load_clusters
                .iter()
                .map(|cluster| self.load_target(cluster, &files, copy_options)),
        )
        .await;

        results
            .into_iter()
            .map(|result| (result.target.clone(), result))
            .collect()
    }

    async fn load_target(
        &self,
        cluster: &ClusterInfo,
        files: &str,
        copy_options: Option<&str>,
    ) -> TargetLoadResult {
        let target = cluster.target_id();
        let mut audit = StatementAudit::default();

        let password = match self.secrets.unwrap_secret(&cluster.encrypted_password).await {
            Ok(password) => password,
            Err(e) => {
                error!(cluster = %target, error = %e, "Unable to unwrap target credential");
                return failed(target, audit, e.to_string());
            }
        };

        let endpoint = TargetEndpoint {
            host: cluster.endpoint.clone(),
            port: cluster.port,
            user: cluster.user.clone(),
            password,
        };
        let mut session = match self.connector.connect(&endpoint).await {
            Ok(session) => session,
            Err(e) => {
                error!(cluster = %target, error = %e, "Unable to connect to target");
                return failed(target, audit, e.to_string());
            }
        };
        drop(endpoint);

        if let Some(pre_load) = non_empty(cluster.pre_load_statement.as_deref()) {
            match session.execute(pre_load).await {
                Ok(()) => audit.pre_load = StatementAudit::success(pre_load),
                Err(e) => {
                    warn!(cluster = %target, error = %e, "Pre-load statement failed, continuing with load");
                    audit.pre_load = StatementAudit::failed(pre_load);
                }
            }
        }

        let load_statement = copy_statement(
            &cluster.target_table,
            cluster.copy_columns.as_deref(),
            files,
            copy_options,
        );

        let mut load_error = None;
        let statements = self
            .session_statements
            .iter()
            .map(String::as_str)
            .chain(iter::once(load_statement.as_str()));
        for statement in statements {
            if let Err(e) = session.execute(statement).await {
                load_error = Some(e);
                break;
            }
        }

        let mut error_detail = None;
        match load_error {
            None => {
                audit.load = StatementAudit::success(&load_statement);
                if let Some(post_load) = non_empty(cluster.post_load_statement.as_deref()) {
                    match session.execute(post_load).await {
                        Ok(()) => audit.post_load = StatementAudit::success(post_load),
                        Err(e) => {
                            error!(cluster = %target, error = %e, "Post-load statement failed");
                            audit.post_load = StatementAudit::failed(post_load);
                            error_detail = Some(e.to_string());
                        }
                    }
                }
            }
            Some(e) => {
                error!(cluster = %target, error = %e, "Load statement failed");
                audit.load = StatementAudit::failed(&load_statement);
                error_detail = Some(e.to_string());
            }
        }

        session.close().await;

        match error_detail {
            None => {
                info!(cluster = %target, "Target load complete");
                TargetLoadResult {
                    target,
                    status: TargetStatus::Ok,
                    error: None,
                    statements: audit,
                }
            }
            Some(detail) => failed(target, audit, detail),
        }
    }
}

fn non_empty(statement: Option<&str>) -> Option<&str> {
    statement.filter(|s| !s.trim().is_empty())
}

fn failed(target: String, statements: StatementAudit, error: String) -> TargetLoadResult {
    TargetLoadResult {
        target,
        status: TargetStatus::Error,
        error: Some(error),
        statements,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SecretError;
    use crate::model::{BatchId, BatchStatus};
    use crate::secrets::PlaintextUnwrapper;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records every statement and fails those containing a marker.
    #[derive(Default)]
    struct ScriptedConnector {
        executed: Arc<Mutex<Vec<(String, String)>>>,
        fail_containing: Vec<String>,
        refuse_hosts: Vec<String>,
    }

    struct ScriptedSession {
        host: String,
        executed: Arc<Mutex<Vec<(String, String)>>>,
        fail_containing: Vec<String>,
    }

    #[async_trait]
    impl TargetConnector for ScriptedConnector {
        async fn connect(
            &self,
            endpoint: &TargetEndpoint,
        ) -> Result<Box<dyn TargetSession>, LoadError> {
            if self.refuse_hosts.contains(&endpoint.host) {
                return Err(LoadError::ConnectionFailed {
                    endpoint: endpoint.address(),
                    message: "refused".into(),
                });
            }
            assert_eq!(endpoint.password, "secret");
            Ok(Box::new(ScriptedSession {
                host: endpoint.host.clone(),
                executed: self.executed.clone(),
                fail_containing: self.fail_containing.clone(),
            }))
        }
    }

    #[async_trait]
    impl TargetSession for ScriptedSession {
        async fn execute(&mut self, statement: &str) -> Result<(), LoadError> {
            self.executed
                .lock()
                .push((self.host.clone(), statement.to_string()));
            if self.fail_containing.iter().any(|m| statement.contains(m)) {
                return Err(LoadError::Statement(format!("rejected: {statement}")));
            }
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct FailingUnwrapper;

    #[async_trait]
    impl SecretUnwrapper for FailingUnwrapper {
        async fn unwrap_secret(&self, _: &str) -> Result<String, SecretError> {
            Err(SecretError::Decrypt("access denied".into()))
        }
    }

    fn cluster(host: &str) -> ClusterInfo {
        ClusterInfo {
            endpoint: host.into(),
            port: 5433,
            user: "loader".into(),
            encrypted_password: "c2VjcmV0".into(),
            target_table: "events".into(),
            copy_columns: None,
            pre_load_statement: None,
            post_load_statement: None,
        }
    }

    fn config(clusters: Vec<ClusterInfo>) -> LoadConfiguration {
        LoadConfiguration {
            prefix: "bucket/input".into(),
            current_batch: BatchId::from("b1"),
            batch_size: 2,
            batch_timeout_secs: None,
            filename_filter_regex: None,
            load_clusters: clusters,
            success_topic: None,
            failure_topic: None,
            mount_dir: "/mnt/".into(),
            copy_options: None,
            last_batch_rotation: None,
        }
    }

    fn batch(entries: &[&str]) -> Batch {
        Batch {
            batch_id: BatchId::from("b1"),
            prefix: "bucket/input".into(),
            status: BatchStatus::Locked,
            entries: entries.iter().map(|e| e.to_string()).collect(),
            last_update: 0,
            load_state: None,
            error_message: None,
        }
    }

    fn orchestrator(connector: ScriptedConnector, session: Vec<String>) -> LoadOrchestrator {
        LoadOrchestrator::new(Arc::new(connector), Arc::new(PlaintextUnwrapper), session)
    }

    #[tokio::test]
    async fn test_runs_statements_in_order() {
        let connector = ScriptedConnector::default();
        let executed = connector.executed.clone();
        let mut c = cluster("db1");
        c.pre_load_statement = Some("TRUNCATE staging".into());
        c.post_load_statement = Some("SELECT ANALYZE_STATISTICS('events')".into());

        let loader = orchestrator(connector, vec!["SET SESSION AUTOCOMMIT TO ON".into()]);
        let results = loader
            .load(&batch(&["bucket/a.csv", "bucket/b.csv"]), &config(vec![c]))
            .await;

        let result = &results["db1:5433/events"];
        assert!(result.is_ok());
        assert_eq!(result.statements.pre_load, "Success: TRUNCATE staging");
        assert_eq!(
            result.statements.load,
            "Success: COPY events SOURCE S3(url='/mnt/bucket/a.csv|/mnt/bucket/b.csv')"
        );

        let statements: Vec<String> = executed.lock().iter().map(|(_, s)| s.clone()).collect();
        assert_eq!(statements.len(), 4);
        assert_eq!(statements[0], "TRUNCATE staging");
        assert_eq!(statements[1], "SET SESSION AUTOCOMMIT TO ON");
        assert!(statements[2].starts_with("COPY events"));
        assert!(statements[3].starts_with("SELECT ANALYZE_STATISTICS"));
    }

    #[tokio::test]
    async fn test_pre_load_failure_does_not_block_load() {
        let connector = ScriptedConnector {
            fail_containing: vec!["TRUNCATE".into()],
            ..Default::default()
        };
        let mut c = cluster("db1");
        c.pre_load_statement = Some("TRUNCATE staging".into());

        let results = orchestrator(connector, vec![])
            .load(&batch(&["bucket/a.csv"]), &config(vec![c]))
            .await;

        let result = &results["db1:5433/events"];
        assert!(result.is_ok());
        assert_eq!(result.statements.pre_load, "Failed: TRUNCATE staging");
        assert!(result.statements.load.starts_with("Success: COPY"));
    }

    #[tokio::test]
    async fn test_load_failure_skips_post_load() {
        let connector = ScriptedConnector {
            fail_containing: vec!["COPY".into()],
            ..Default::default()
        };
        let executed = connector.executed.clone();
        let mut c = cluster("db1");
        c.post_load_statement = Some("COMMIT".into());

        let results = orchestrator(connector, vec![])
            .load(&batch(&["bucket/a.csv"]), &config(vec![c]))
            .await;

        let result = &results["db1:5433/events"];
        assert_eq!(result.status, TargetStatus::Error);
        assert!(result.statements.load.starts_with("Failed: COPY"));
        assert_eq!(result.statements.post_load, "");
        assert!(!executed.lock().iter().any(|(_, s)| s == "COMMIT"));
    }

    #[tokio::test]
    async fn test_post_load_failure_is_target_error() {
        let connector = ScriptedConnector {
            fail_containing: vec!["ANALYZE".into()],
            ..Default::default()
        };
        let mut c = cluster("db1");
        c.post_load_statement = Some("ANALYZE events".into());

        let results = orchestrator(connector, vec![])
            .load(&batch(&["bucket/a.csv"]), &config(vec![c]))
            .await;

        let result = &results["db1:5433/events"];
        assert_eq!(result.status, TargetStatus::Error);
        assert!(result.statements.load.starts_with("Success:"));
        assert_eq!(result.statements.post_load, "Failed: ANALYZE events");
    }

    #[tokio::test]
    async fn test_connect_failure_is_isolated_per_target() {
        let connector = ScriptedConnector {
            refuse_hosts: vec!["db2".into()],
            ..Default::default()
        };
        let results = orchestrator(connector, vec![])
            .load(
                &batch(&["bucket/a.csv"]),
                &config(vec![cluster("db1"), cluster("db2")]),
            )
            .await;

        assert_eq!(results.len(), 2);
        assert!(results["db1:5433/events"].is_ok());
        let failed = &results["db2:5433/events"];
        assert_eq!(failed.status, TargetStatus::Error);
        assert!(failed.error.as_deref().unwrap().contains("refused"));
        assert_eq!(failed.statements, StatementAudit::default());
    }

    #[tokio::test]
    async fn test_unwrap_failure_is_target_error() {
        let loader = LoadOrchestrator::new(
            Arc::new(ScriptedConnector::default()),
            Arc::new(FailingUnwrapper),
            vec![],
        );
        let results = loader
            .load(&batch(&["bucket/a.csv"]), &config(vec![cluster("db1")]))
            .await;
        let result = &results["db1:5433/events"];
        assert_eq!(result.status, TargetStatus::Error);
        assert!(result.error.as_deref().unwrap().contains("access denied"));
    }

    #[tokio::test]
    async fn test_empty_batch_fails_every_target() {
        let results = orchestrator(ScriptedConnector::default(), vec![])
            .load(&batch(&[]), &config(vec![cluster("db1")]))
            .await;
        assert_eq!(results["db1:5433/events"].status, TargetStatus::Error);
    }
}
