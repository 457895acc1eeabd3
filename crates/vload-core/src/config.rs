//! Configuration structures for vload.
//!
//! Service configuration is loaded from TOML files and can be overridden via
//! CLI flags. Per-prefix load configurations are not part of this file; they
//! live in the durable store (see [`crate::model::LoadConfiguration`]).

use serde::{Deserialize, Serialize};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Durable state store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// AWS client configuration
    #[serde(default)]
    pub aws: AwsConfig,

    /// Secret unwrapping configuration
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Notification channel configuration
    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Batch append retry configuration
    #[serde(default)]
    pub accumulator: AccumulatorConfig,

    /// Target load configuration
    #[serde(default)]
    pub load: LoadConfig,

    /// HTTP service configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// State store backend.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// PostgreSQL tables (default)
    #[default]
    Postgres,
    /// Process-local memory, for development only
    Memory,
}

/// Durable state store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// libpq-style connection string (`host=... user=... dbname=...`)
    #[serde(default)]
    pub connection_string: Option<String>,

    /// Maximum pooled connections per process
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            connection_string: None,
            max_pool_size: default_max_pool_size(),
        }
    }
}

/// AWS client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AwsConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Endpoint override (LocalStack and similar)
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
        }
    }
}

/// Secret unwrapping backend.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SecretsBackend {
    /// AWS KMS decrypt (default)
    #[default]
    Kms,
    /// Base64 plaintext, for development only
    Plaintext,
}

/// Secret unwrapping configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecretsConfig {
    #[serde(default)]
    pub backend: SecretsBackend,
}

/// Notification backend.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationBackend {
    /// AWS SNS topics (default)
    #[default]
    Sns,
    /// Write notifications to the log only
    Log,
}

/// Notification channel configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub backend: NotificationBackend,
}

/// Batch append retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccumulatorConfig {
    /// Attempts to land an entry in the open batch before failing loudly
    #[serde(default = "default_max_append_attempts")]
    pub max_append_attempts: u32,

    /// Upper bound of the uniform random delay between attempts
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,

    /// Attempts to read the prefix configuration on store errors
    #[serde(default = "default_config_lookup_attempts")]
    pub config_lookup_attempts: u32,

    /// Idle seconds after which a locked batch that is still current may be
    /// taken over by `vload flush --batch-id`
    #[serde(default = "default_takeover_after_secs")]
    pub takeover_after_secs: u64,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            max_append_attempts: default_max_append_attempts(),
            max_jitter_ms: default_max_jitter_ms(),
            config_lookup_attempts: default_config_lookup_attempts(),
            takeover_after_secs: default_takeover_after_secs(),
        }
    }
}

/// Target load configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoadConfig {
    /// Statements run on every target session right before the load statement
    #[serde(default)]
    pub session_statements: Vec<String>,
}

/// HTTP service configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Port serving `POST /events` and the health endpoints
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Metrics HTTP port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            metrics_port: default_metrics_port(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive usable with `EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_max_pool_size() -> usize {
    4
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_max_append_attempts() -> u32 {
    100
}
fn default_max_jitter_ms() -> u64 {
    300
}
fn default_config_lookup_attempts() -> u32 {
    10
}
fn default_takeover_after_secs() -> u64 {
    300
}
fn default_listen_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9090
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.store.backend == StoreBackend::Postgres
            && self
                .store
                .connection_string
                .as_deref()
                .map_or(true, str::is_empty)
        {
            return Err(crate::Error::Config(
                "store.connection_string is required for the postgres backend".into(),
            ));
        }

        if self.store.max_pool_size == 0 {
            return Err(crate::Error::Config(
                "store.max_pool_size must be at least 1".into(),
            ));
        }

        if self.accumulator.max_append_attempts == 0 {
            return Err(crate::Error::Config(
                "accumulator.max_append_attempts must be at least 1".into(),
            ));
        }

        if self.accumulator.config_lookup_attempts == 0 {
            return Err(crate::Error::Config(
                "accumulator.config_lookup_attempts must be at least 1".into(),
            ));
        }

        if self.aws.region.is_empty() {
            return Err(crate::Error::Config("aws.region is required".into()));
        }

        if self.store.backend == StoreBackend::Memory {
            tracing::warn!("Memory store configured: batch state is lost when the process exits");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_accumulator_config() {
        let config = AccumulatorConfig::default();
        assert_eq!(config.max_append_attempts, 100);
        assert_eq!(config.max_jitter_ms, 300);
        assert_eq!(config.config_lookup_attempts, 10);
        assert_eq!(config.takeover_after_secs, 300);
    }

    #[test]
    fn test_postgres_backend_requires_connection_string() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.store.connection_string = Some("host=localhost user=vload".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_memory_backend_validates_without_connection() {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Memory;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Memory;
        config.accumulator.max_append_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[store]
backend = "postgres"
connection_string = "host=db user=vload dbname=vload"

[aws]
region = "eu-west-1"

[secrets]
backend = "plaintext"

[notifications]
backend = "log"

[accumulator]
max_jitter_ms = 50

[load]
session_statements = ["SET search_path TO staging"]

[monitoring]
log_format = "text"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.aws.region, "eu-west-1");
        assert_eq!(config.secrets.backend, SecretsBackend::Plaintext);
        assert_eq!(config.notifications.backend, NotificationBackend::Log);
        assert_eq!(config.accumulator.max_jitter_ms, 50);
        assert_eq!(config.accumulator.max_append_attempts, 100);
        assert_eq!(config.load.session_statements.len(), 1);
        assert_eq!(config.monitoring.log_format, LogFormat::Text);
        assert_eq!(config.server.listen_port, 8080);
    }
}
