//! One invocation per object-created event.
//!
//! ```text
//! parse → config lookup → [filename filter] → admit → append → flush check
//!     → [load → close → notify]
//! ```
//!
//! Each stage runs to completion before the next. Concurrent invocations
//! coordinate only through conditional writes in the state store.

use super::Services;
use crate::batch::{
    Accumulator, Admission, BatchCloser, CloseReport, Registrar, RetryPolicy, RotationOutcome,
    Rotator,
};
use crate::config::Config;
use crate::error::{Error, Result, StoreError};
use crate::event::{parse_event_bytes, ObjectCreated, ParsedEvent};
use crate::health::{Component, HealthCheck};
use crate::load::LoadOrchestrator;
use crate::metrics::LoaderMetrics;
use crate::model::{BatchId, LoadConfiguration};
use crate::notify::NotificationBody;
use crate::store::StateStore;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// What a flush check did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushOutcome {
    NoBatch,
    NotRequired,
    LostRace,
    /// This invocation sealed, loaded and closed the batch
    Closed {
        batch_id: BatchId,
        successor: Option<BatchId>,
        report: CloseReport,
    },
}

/// What an invocation did with its event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// Payload had no records
    Unsupported,
    /// No configuration for the derived prefix
    Unconfigured { prefix: String },
    /// File was admitted before
    Duplicate { item: String },
    /// File excluded by the prefix's filename filter
    Filtered { item: String, flush: FlushOutcome },
    /// File appended to a batch
    Appended {
        item: String,
        batch_id: BatchId,
        flush: FlushOutcome,
    },
}

impl ProcessOutcome {
    /// Whether this invocation closed a batch in error.
    pub fn batch_failed(&self) -> bool {
        let flush = match self {
            ProcessOutcome::Filtered { flush, .. } | ProcessOutcome::Appended { flush, .. } => flush,
            _ => return false,
        };
        matches!(flush, FlushOutcome::Closed { report, .. } if report.error.is_some())
    }
}

/// Wires the batch components together for one prefix event at a time.
pub struct Pipeline {
    store: Arc<dyn StateStore>,
    registrar: Registrar,
    accumulator: Accumulator,
    rotator: Rotator,
    loader: LoadOrchestrator,
    closer: BatchCloser,
    metrics: Arc<LoaderMetrics>,
    health: Arc<HealthCheck>,
    config_lookup_attempts: u32,
    takeover_after_secs: u64,
    filters: Mutex<HashMap<String, Regex>>,
}

impl Pipeline {
    pub fn new(services: &Services, config: &Config) -> Self {
        let store = services.store.clone();
        let metrics = services.metrics.clone();
        Self {
            registrar: Registrar::new(store.clone(), metrics.clone()),
            accumulator: Accumulator::new(
                store.clone(),
                RetryPolicy::from_config(&config.accumulator),
                metrics.clone(),
            ),
            rotator: Rotator::new(store.clone(), metrics.clone()),
            loader: LoadOrchestrator::new(
                services.connector.clone(),
                services.secrets.clone(),
                config.load.session_statements.clone(),
            ),
            closer: BatchCloser::new(store.clone(), services.notifier.clone(), metrics.clone()),
            store,
            metrics,
            health: services.health.clone(),
            config_lookup_attempts: config.accumulator.config_lookup_attempts,
            takeover_after_secs: config.accumulator.takeover_after_secs,
            filters: Mutex::new(HashMap::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<LoaderMetrics> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.health
    }

    /// Handle one raw event delivery.
    pub async fn process_payload(&self, payload: &[u8]) -> Result<ProcessOutcome> {
        self.metrics.record_event();
        let parsed = match parse_event_bytes(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Rejecting event");
                self.metrics.record_event_rejected();
                self.metrics.record_error();
                return Err(e.into());
            }
        };

        match parsed {
            ParsedEvent::Unsupported => Ok(ProcessOutcome::Unsupported),
            ParsedEvent::Object(object) => self.process_object(&object).await,
        }
    }

    /// Handle one object-created event.
    pub async fn process_object(&self, object: &ObjectCreated) -> Result<ProcessOutcome> {
        let config = match self.lookup_config(&object.prefix).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                warn!(prefix = %object.prefix, "No configuration found");
                return Ok(ProcessOutcome::Unconfigured {
                    prefix: object.prefix.clone(),
                });
            }
            Err(e) => return Err(self.observe_error(e)),
        };
        info!(prefix = %config.prefix, key = %object.key, "Found load configuration");

        let result = self.handle_object(&config, object).await;
        self.finish(&config, &config.current_batch, result).await
    }

    /// Run the flush check for the current batch of `prefix`, or reprocess
    /// `batch_id` when given: a reopened batch is flushed as usual, and a
    /// stale locked batch that is still current is taken over and loaded.
    pub async fn check_pending_batch(
        &self,
        prefix: &str,
        batch_id: Option<BatchId>,
    ) -> Result<FlushOutcome> {
        let config = match self.lookup_config(prefix).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                return Err(self.observe_error(
                    StoreError::NotFound(format!("configuration for {prefix}")).into(),
                ))
            }
            Err(e) => return Err(self.observe_error(e)),
        };
        let (batch_id, reprocess) = match batch_id {
            Some(id) => (id, true),
            None => (config.current_batch.clone(), false),
        };
        let result = if reprocess {
            self.rotator
                .take_over(&config, &batch_id, self.takeover_after_secs)
                .await
        } else {
            self.rotator.check(&config, &batch_id).await
        };
        let result = match result {
            Ok(rotation) => self.load_and_close(&config, rotation).await,
            Err(e) => Err(e),
        };
        self.finish(&config, &batch_id, result).await
    }

    async fn handle_object(
        &self,
        config: &LoadConfiguration,
        object: &ObjectCreated,
    ) -> Result<ProcessOutcome> {
        let item = object.item();

        if let Some(filter) = self.filename_filter(config)? {
            if !filter.is_match(&object.key) {
                let pattern = filter.as_str();
                info!(key = %object.key, filter = %pattern, "Object excluded by filename filter");
                self.metrics.record_file_filtered();
                let flush = self.flush(config, &config.current_batch).await?;
                return Ok(ProcessOutcome::Filtered { item, flush });
            }
        }

        if self.registrar.admit(&item).await? == Admission::Duplicate {
            return Ok(ProcessOutcome::Duplicate { item });
        }

        let batch_id = self
            .accumulator
            .append(&config.prefix, config.current_batch.clone(), &item)
            .await?;
        let flush = self.flush(config, &batch_id).await?;

        Ok(ProcessOutcome::Appended {
            item,
            batch_id,
            flush,
        })
    }

    async fn flush(&self, config: &LoadConfiguration, batch_id: &BatchId) -> Result<FlushOutcome> {
        let rotation = self.rotator.check(config, batch_id).await?;
        self.load_and_close(config, rotation).await
    }

    async fn load_and_close(
        &self,
        config: &LoadConfiguration,
        rotation: RotationOutcome,
    ) -> Result<FlushOutcome> {
        let (sealed, successor) = match rotation {
            RotationOutcome::NoBatch => return Ok(FlushOutcome::NoBatch),
            RotationOutcome::NotRequired => return Ok(FlushOutcome::NotRequired),
            RotationOutcome::LostRace => return Ok(FlushOutcome::LostRace),
            RotationOutcome::Rotated { sealed, successor } => (sealed, successor),
        };

        let started = Instant::now();
        let results = self.loader.load(&sealed, config).await;

        let failed: Vec<&str> = results
            .values()
            .filter(|r| !r.is_ok())
            .map(|r| r.target.as_str())
            .collect();
        if failed.is_empty() {
            self.health.mark_healthy(Component::Targets);
        } else {
            self.health
                .mark_unhealthy(Component::Targets, &format!("load failed on {}", failed.join(", ")));
        }

        let report = self.closer.close(config, &sealed, &results, started).await?;
        if report.notified {
            self.health.mark_healthy(Component::Notifications);
        }

        Ok(FlushOutcome::Closed {
            batch_id: sealed.batch_id,
            successor,
            report,
        })
    }

    /// Compiled filename filter of a prefix, compiled once per pattern.
    fn filename_filter(&self, config: &LoadConfiguration) -> Result<Option<Regex>> {
        let Some(pattern) = config.filename_filter_regex.as_deref() else {
            return Ok(None);
        };
        let mut filters = self.filters.lock();
        if let Some(filter) = filters.get(pattern) {
            return Ok(Some(filter.clone()));
        }
        let filter = Regex::new(pattern).map_err(|e| {
            Error::Config(format!("invalid filename filter '{pattern}' for {}: {e}", config.prefix))
        })?;
        filters.insert(pattern.to_string(), filter.clone());
        Ok(Some(filter))
    }

    async fn lookup_config(&self, prefix: &str) -> Result<Option<LoadConfiguration>> {
        let mut last_error = None;
        for attempt in 1..=self.config_lookup_attempts {
            match self.store.get_config(prefix).await {
                Ok(config) => {
                    self.health.mark_healthy(Component::Store);
                    return Ok(config);
                }
                Err(e) => {
                    warn!(prefix = %prefix, attempt, error = %e, "Configuration lookup failed");
                    last_error = Some(e);
                }
            }
        }
        Err(match last_error {
            Some(e) => e.into(),
            None => Error::Config("accumulator.config_lookup_attempts must be at least 1".into()),
        })
    }

    /// Record a fatal result and send the failure notification for it.
    async fn finish<T>(
        &self,
        config: &LoadConfiguration,
        batch_id: &BatchId,
        result: Result<T>,
    ) -> Result<T> {
        let e = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let e = self.observe_error(e);
        // An append that retargeted names the batch it last tried.
        let batch_id = match &e {
            Error::RetryCeilingExceeded { batch_id, .. } => BatchId::from(batch_id.as_str()),
            _ => batch_id.clone(),
        };
        error!(prefix = %config.prefix, batch_id = %batch_id, error = %e, "Invocation failed");

        // Close and publish failures are terminal on their own.
        let already_terminal = matches!(
            e,
            Error::Notify(_) | Error::Store(StoreError::UnexpectedStatus { .. })
        );
        if !already_terminal {
            let body = NotificationBody::error(&batch_id, &config.prefix, e.to_string(), None);
            if let Err(notify_err) = self
                .closer
                .notify(config.failure_topic.as_deref(), &body)
                .await
            {
                error!(error = %notify_err, "Unable to send failure notification");
            }
        }
        Err(e)
    }

    fn observe_error(&self, e: Error) -> Error {
        self.metrics.record_error();
        match &e {
            Error::Store(inner) => self.health.mark_unhealthy(Component::Store, &inner.to_string()),
            Error::Notify(inner) => self
                .health
                .mark_degraded(Component::Notifications, &inner.to_string()),
            _ => {}
        }
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::PgWireConnector;
    use crate::notify::LogNotifier;
    use crate::secrets::PlaintextUnwrapper;
    use crate::store::MemoryStateStore;

    fn pipeline() -> Pipeline {
        let services = Services::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(PlaintextUnwrapper),
            Arc::new(LogNotifier),
            Arc::new(PgWireConnector::new()),
        );
        Pipeline::new(&services, &Config::default())
    }

    fn config(filter: Option<&str>) -> LoadConfiguration {
        LoadConfiguration {
            prefix: "bucket/input".into(),
            current_batch: BatchId::from("b1"),
            batch_size: 10,
            batch_timeout_secs: None,
            filename_filter_regex: filter.map(str::to_string),
            load_clusters: vec![],
            success_topic: None,
            failure_topic: None,
            mount_dir: String::new(),
            copy_options: None,
            last_batch_rotation: None,
        }
    }

    #[test]
    fn test_filename_filter_compiled_once_per_pattern() {
        let pipeline = pipeline();
        assert!(pipeline.filename_filter(&config(None)).unwrap().is_none());

        let cfg = config(Some(r".*\.csv$"));
        let first = pipeline.filename_filter(&cfg).unwrap().unwrap();
        let second = pipeline.filename_filter(&cfg).unwrap().unwrap();
        assert!(first.is_match("input/a.csv"));
        assert_eq!(first.as_str(), second.as_str());
        assert_eq!(pipeline.filters.lock().len(), 1);
    }

    #[test]
    fn test_invalid_filename_filter_is_config_error() {
        let pipeline = pipeline();
        let err = pipeline.filename_filter(&config(Some("(["))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(pipeline.filters.lock().is_empty());
    }

    #[derive(Default)]
    struct Captured {
        bodies: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait::async_trait]
    impl crate::notify::Notifier for Captured {
        async fn publish(
            &self,
            _channel: &str,
            _subject: &str,
            body: &str,
        ) -> std::result::Result<(), crate::error::NotifyError> {
            self.bodies.lock().push(serde_json::from_str(body).unwrap());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failure_notification_names_retargeted_batch() {
        let notifier = Arc::new(Captured::default());
        let services = Services::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(PlaintextUnwrapper),
            notifier.clone(),
            Arc::new(PgWireConnector::new()),
        );
        let pipeline = Pipeline::new(&services, &Config::default());
        let mut cfg = config(None);
        cfg.failure_topic = Some("fail-topic".into());

        let err = Error::RetryCeilingExceeded {
            entry: "bucket/input/a.csv".into(),
            prefix: "bucket/input".into(),
            batch_id: "b2".into(),
            attempts: 3,
        };
        let result: Result<()> = pipeline.finish(&cfg, &BatchId::from("b1"), Err(err)).await;
        assert!(result.is_err());

        let bodies = notifier.bodies.lock();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["batchid"], "b2");
        assert!(bodies[0]["error"]
            .as_str()
            .unwrap()
            .contains("--batch-id b2"));
    }
}
