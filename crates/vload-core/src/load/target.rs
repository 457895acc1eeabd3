//! Seams to the bulk-load target clusters.

use crate::error::LoadError;
use async_trait::async_trait;

/// Where and as whom to connect. The password is the unwrapped plaintext and
/// is dropped with the value once the connection is made.
#[derive(Clone)]
pub struct TargetEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl TargetEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for TargetEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opens stateful sessions against a target cluster.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    async fn connect(&self, endpoint: &TargetEndpoint) -> Result<Box<dyn TargetSession>, LoadError>;
}

/// One connection that executes statements in order.
#[async_trait]
pub trait TargetSession: Send {
    async fn execute(&mut self, statement: &str) -> Result<(), LoadError>;

    /// Tear the connection down. Statements fail once closed.
    async fn close(&mut self);
}
