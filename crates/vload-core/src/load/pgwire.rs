//! Target connector speaking the PostgreSQL wire protocol.

use super::target::{TargetConnector, TargetEndpoint, TargetSession};
use crate::error::LoadError;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Connects with `tokio-postgres`, one connection per load.
#[derive(Debug, Clone)]
pub struct PgWireConnector {
    dbname: Option<String>,
}

impl PgWireConnector {
    pub fn new() -> Self {
        Self { dbname: None }
    }

    /// Connect to a named database instead of the user's default.
    pub fn with_dbname(mut self, dbname: impl Into<String>) -> Self {
        self.dbname = Some(dbname.into());
        self
    }
}

impl Default for PgWireConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetConnector for PgWireConnector {
    async fn connect(&self, endpoint: &TargetEndpoint) -> Result<Box<dyn TargetSession>, LoadError> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&endpoint.host)
            .port(endpoint.port)
            .user(&endpoint.user)
            .password(&endpoint.password)
            .application_name("vload");
        if let Some(dbname) = &self.dbname {
            pg_config.dbname(dbname);
        }

        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| LoadError::ConnectionFailed {
                endpoint: endpoint.address(),
                message: e.to_string(),
            })?;

        let address = endpoint.address();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(endpoint = %address, error = %e, "Target connection closed with error");
            }
        });

        debug!(endpoint = %endpoint.address(), "Connected to target");
        Ok(Box::new(PgWireSession {
            client: Some(client),
            driver: Some(driver),
        }))
    }
}

struct PgWireSession {
    client: Option<tokio_postgres::Client>,
    driver: Option<JoinHandle<()>>,
}

#[async_trait]
impl TargetSession for PgWireSession {
    async fn execute(&mut self, statement: &str) -> Result<(), LoadError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| LoadError::Statement("session is closed".into()))?;
        client
            .batch_execute(statement)
            .await
            .map_err(|e| LoadError::Statement(e.to_string()))
    }

    async fn close(&mut self) {
        // Dropping the client sends Terminate; the driver then finishes.
        drop(self.client.take());
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                warn!(error = %e, "Target connection task failed");
            }
        }
    }
}
