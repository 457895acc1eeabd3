//! Data model shared by the store, the batch coordinator and the loader.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Current time as epoch seconds, the resolution every stored timestamp uses.
pub fn now_epoch_secs() -> i64 {
    Utc::now().timestamp()
}

/// Identifier of a batch within a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Allocate a fresh, unique batch id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BatchId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for BatchId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store key of a batch: (batch id, prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub batch_id: BatchId,
    pub prefix: String,
}

impl BatchKey {
    pub fn new(batch_id: BatchId, prefix: impl Into<String>) -> Self {
        Self {
            batch_id,
            prefix: prefix.into(),
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.batch_id, self.prefix)
    }
}

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Accepting appends
    Open,
    /// Sealed by a rotation, load in progress
    Locked,
    /// Loaded into every target
    Complete,
    /// At least one target failed, or closing the batch failed
    Error,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Open => "open",
            BatchStatus::Locked => "locked",
            BatchStatus::Complete => "complete",
            BatchStatus::Error => "error",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(BatchStatus::Open),
            "locked" => Ok(BatchStatus::Locked),
            "complete" => Ok(BatchStatus::Complete),
            "error" => Ok(BatchStatus::Error),
            other => Err(format!("unknown batch status '{other}'")),
        }
    }
}

/// The closed set of status changes a batch may undergo.
///
/// Stores apply a transition only if the batch's current status is one of
/// [`BatchTransition::allowed_from`], so an illegal edge such as
/// complete→locked cannot be requested at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchTransition {
    /// open → locked, performed once by the rotating invocation
    Lock,
    /// locked → complete
    Complete,
    /// locked → error, carrying the serialized failure summary
    Fail { error: String },
    /// locked | error → open, operator unlock only
    Reopen,
}

impl BatchTransition {
    /// Statuses from which this transition may be applied.
    pub fn allowed_from(&self) -> &'static [BatchStatus] {
        match self {
            BatchTransition::Lock => &[BatchStatus::Open],
            BatchTransition::Complete | BatchTransition::Fail { .. } => &[BatchStatus::Locked],
            BatchTransition::Reopen => &[BatchStatus::Locked, BatchStatus::Error],
        }
    }

    /// Status after the transition.
    pub fn target(&self) -> BatchStatus {
        match self {
            BatchTransition::Lock => BatchStatus::Locked,
            BatchTransition::Complete => BatchStatus::Complete,
            BatchTransition::Fail { .. } => BatchStatus::Error,
            BatchTransition::Reopen => BatchStatus::Open,
        }
    }

    /// Error payload stored with the transition, if any.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            BatchTransition::Fail { error } => Some(error),
            _ => None,
        }
    }
}

/// A batch record as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: BatchId,
    pub prefix: String,
    pub status: BatchStatus,
    /// Entry references (`bucket/key`); order is not meaningful
    pub entries: Vec<String>,
    /// Epoch seconds of the last append or status change
    pub last_update: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_state: Option<LoadState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Batch {
    /// Create an open batch holding a single entry.
    pub fn open_with(key: &BatchKey, entry: &str, at: i64) -> Self {
        Self {
            batch_id: key.batch_id.clone(),
            prefix: key.prefix.clone(),
            status: BatchStatus::Open,
            entries: vec![entry.to_string()],
            last_update: at,
            load_state: None,
            error_message: None,
        }
    }

    pub fn key(&self) -> BatchKey {
        BatchKey::new(self.batch_id.clone(), self.prefix.clone())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Per-prefix load configuration, owned by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfiguration {
    /// Watched location, `bucket[/path]`
    pub prefix: String,

    /// Batch currently accepting appends; a fresh id when not supplied
    #[serde(default = "BatchId::generate")]
    pub current_batch: BatchId,

    /// Entry count at which a batch is flushed
    pub batch_size: u32,

    /// Idle age in seconds after which a non-empty batch is flushed
    #[serde(default)]
    pub batch_timeout_secs: Option<u64>,

    /// Only keys matching this regex are admitted
    #[serde(default)]
    pub filename_filter_regex: Option<String>,

    /// Clusters every batch is loaded into
    #[serde(default)]
    pub load_clusters: Vec<ClusterInfo>,

    #[serde(default)]
    pub success_topic: Option<String>,

    #[serde(default)]
    pub failure_topic: Option<String>,

    /// Directory the object store is mounted under on the cluster hosts
    #[serde(default)]
    pub mount_dir: String,

    /// Appended verbatim to the load statement
    #[serde(default)]
    pub copy_options: Option<String>,

    #[serde(default)]
    pub last_batch_rotation: Option<i64>,
}

impl LoadConfiguration {
    /// Check operator-supplied settings before they are stored.
    pub fn validate(&self) -> crate::Result<()> {
        if self.prefix.is_empty() || self.prefix.starts_with('/') || self.prefix.ends_with('/') {
            return Err(crate::Error::Config(format!(
                "prefix '{}' must be 'bucket' or 'bucket/path' without surrounding slashes",
                self.prefix
            )));
        }

        if self.batch_size == 0 {
            return Err(crate::Error::Config(format!(
                "batch_size for {} must be at least 1",
                self.prefix
            )));
        }

        if let Some(pattern) = self.filename_filter_regex.as_deref() {
            regex::Regex::new(pattern).map_err(|e| {
                crate::Error::Config(format!("invalid filename filter '{pattern}': {e}"))
            })?;
        }

        for cluster in &self.load_clusters {
            if cluster.endpoint.is_empty() || cluster.target_table.is_empty() {
                return Err(crate::Error::Config(format!(
                    "load cluster for {} needs an endpoint and a target table",
                    self.prefix
                )));
            }
        }

        if self.load_clusters.is_empty() {
            tracing::warn!(prefix = %self.prefix, "No load clusters configured, batches will close in error");
        }

        Ok(())
    }
}

/// Connection and load settings for one target cluster.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub endpoint: String,
    pub port: u16,
    pub user: String,
    /// Base64 ciphertext, unwrapped only immediately before connecting
    pub encrypted_password: String,
    pub target_table: String,
    #[serde(default)]
    pub copy_columns: Option<String>,
    #[serde(default)]
    pub pre_load_statement: Option<String>,
    #[serde(default)]
    pub post_load_statement: Option<String>,
}

impl ClusterInfo {
    /// Identity used as the key of per-target results.
    pub fn target_id(&self) -> String {
        format!("{}:{}/{}", self.endpoint, self.port, self.target_table)
    }
}

impl fmt::Debug for ClusterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterInfo")
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("encrypted_password", &"<redacted>")
            .field("target_table", &self.target_table)
            .field("copy_columns", &self.copy_columns)
            .field("pre_load_statement", &self.pre_load_statement)
            .field("post_load_statement", &self.post_load_statement)
            .finish()
    }
}

/// Dedup marker for one admitted file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedFile {
    /// `bucket/key`
    pub item: String,
    /// Batch the file finally landed in; `None` until linked
    pub batch_id: Option<BatchId>,
}

/// Outcome of loading one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Ok,
    Error,
}

/// Audit trail of the statements run against one target.
///
/// Each field is empty when the statement was not run, otherwise
/// `Success: <sql>` or `Failed: <sql>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementAudit {
    #[serde(rename = "preLoadStmt")]
    pub pre_load: String,
    #[serde(rename = "loadStmt")]
    pub load: String,
    #[serde(rename = "postLoadStmt")]
    pub post_load: String,
}

impl StatementAudit {
    pub fn success(statement: &str) -> String {
        format!("Success: {statement}")
    }

    pub fn failed(statement: &str) -> String {
        format!("Failed: {statement}")
    }
}

/// Result of loading a batch into one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetLoadResult {
    pub target: String,
    pub status: TargetStatus,
    pub error: Option<String>,
    pub statements: StatementAudit,
}

impl TargetLoadResult {
    pub fn is_ok(&self) -> bool {
        self.status == TargetStatus::Ok
    }
}

/// Status and error of one target as persisted on the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub status: TargetStatus,
    pub error: Option<String>,
}

/// Per-target outcomes persisted on a loaded batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadState {
    pub statuses: BTreeMap<String, TargetState>,
    pub statements: BTreeMap<String, StatementAudit>,
}

impl LoadState {
    pub fn from_results(results: &BTreeMap<String, TargetLoadResult>) -> Self {
        let mut state = LoadState::default();
        for (target, result) in results {
            state.statuses.insert(
                target.clone(),
                TargetState {
                    status: result.status,
                    error: result.error.clone(),
                },
            );
            state
                .statements
                .insert(target.clone(), result.statements.clone());
        }
        state
    }

    pub fn all_ok(&self) -> bool {
        self.statuses
            .values()
            .all(|s| s.status == TargetStatus::Ok)
    }

    /// Targets that reported an error, with their error detail.
    pub fn failures(&self) -> BTreeMap<String, TargetState> {
        self.statuses
            .iter()
            .filter(|(_, s)| s.status == TargetStatus::Error)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
