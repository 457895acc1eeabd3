//! Construction of the collaborators a pipeline runs against.

use crate::aws::load_sdk_config;
use crate::config::{Config, NotificationBackend, SecretsBackend, StoreBackend};
use crate::error::{Error, Result};
use crate::health::HealthCheck;
use crate::load::{PgWireConnector, TargetConnector};
use crate::metrics::LoaderMetrics;
use crate::notify::{LogNotifier, Notifier, SnsNotifier};
use crate::secrets::{KmsUnwrapper, PlaintextUnwrapper, SecretUnwrapper};
use crate::store::{MemoryStateStore, PostgresStateStore, StateStore};
use std::sync::Arc;
use tracing::{info, warn};

/// Every external collaborator, injected as a trait object.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn StateStore>,
    pub secrets: Arc<dyn SecretUnwrapper>,
    pub notifier: Arc<dyn Notifier>,
    pub connector: Arc<dyn TargetConnector>,
    pub metrics: Arc<LoaderMetrics>,
    pub health: Arc<HealthCheck>,
}

impl Services {
    pub fn new(
        store: Arc<dyn StateStore>,
        secrets: Arc<dyn SecretUnwrapper>,
        notifier: Arc<dyn Notifier>,
        connector: Arc<dyn TargetConnector>,
    ) -> Self {
        Self {
            store,
            secrets,
            notifier,
            connector,
            metrics: Arc::new(LoaderMetrics::new()),
            health: Arc::new(HealthCheck::new()),
        }
    }

    /// Build the adapters selected by the service configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store: Arc<dyn StateStore> = match config.store.backend {
            StoreBackend::Postgres => {
                let connection_string = config.store.connection_string.as_deref().ok_or_else(|| {
                    Error::Config("store.connection_string is required for the postgres backend".into())
                })?;
                Arc::new(PostgresStateStore::connect(
                    connection_string,
                    config.store.max_pool_size,
                )?)
            }
            StoreBackend::Memory => {
                warn!("Using in-memory state store, state is lost on exit");
                Arc::new(MemoryStateStore::new())
            }
        };

        let needs_aws = config.secrets.backend == SecretsBackend::Kms
            || config.notifications.backend == NotificationBackend::Sns;
        let sdk_config = if needs_aws {
            Some(load_sdk_config(&config.aws).await)
        } else {
            None
        };

        let secrets: Arc<dyn SecretUnwrapper> = match (&config.secrets.backend, &sdk_config) {
            (SecretsBackend::Kms, Some(sdk)) => Arc::new(KmsUnwrapper::new(sdk)),
            _ => Arc::new(PlaintextUnwrapper),
        };
        let notifier: Arc<dyn Notifier> = match (&config.notifications.backend, &sdk_config) {
            (NotificationBackend::Sns, Some(sdk)) => Arc::new(SnsNotifier::new(sdk)),
            _ => Arc::new(LogNotifier),
        };

        info!(
            store = ?config.store.backend,
            secrets = ?config.secrets.backend,
            notifications = ?config.notifications.backend,
            region = %config.aws.region,
            "Services initialized"
        );

        Ok(Self::new(store, secrets, notifier, Arc::new(PgWireConnector::new())))
    }
}
