//! Error types for the vload core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! Conditional-write contention is deliberately absent here: stores report it
//! as [`WriteOutcome::PreconditionFailed`](crate::store::WriteOutcome), never
//! as an error.

use thiserror::Error;

/// Result type alias for vload operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for vload.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Event payload error
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    /// Load orchestration error
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    /// Secret unwrapping error
    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    /// Notification error
    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    /// The batch append could not land within the retry ceiling.
    #[error(
        "Unable to write {entry} in {attempts} attempts. Failing further processing to batch \
         {batch_id} which may be stuck in 'locked' state. If so, recover it with \
         `vload flush --prefix {prefix} --batch-id {batch_id}`, which loads the locked batch \
         and moves the prefix to a new one, then delete the processed file marker for {entry} \
         and re-store the file"
    )]
    RetryCeilingExceeded {
        entry: String,
        prefix: String,
        batch_id: String,
        attempts: u32,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Durable store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to obtain a connection
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Statement against the store failed
    #[error("Query failed: {0}")]
    Query(String),

    /// Stored row could not be decoded
    #[error("Decode failed for {what}: {message}")]
    Decode { what: String, message: String },

    /// A record required by the operation is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// A conditional write that must succeed observed another state
    #[error("Batch {batch_id} is not in '{expected}' status")]
    UnexpectedStatus { batch_id: String, expected: String },
}

/// Event payload errors.
#[derive(Error, Debug)]
pub enum EventError {
    /// Payload is not valid JSON of the expected shape
    #[error("Malformed event: {0}")]
    Malformed(String),

    /// More than one record in a single delivery
    #[error("Unable to process multi-record events ({0} records)")]
    MultiRecord(usize),

    /// Record rejected by source/name/schema checks
    #[error("{0}")]
    Rejected(String),
}

/// Load orchestration errors.
#[derive(Error, Debug)]
pub enum LoadError {
    /// Failed to connect to a target cluster
    #[error("Connection failed to {endpoint}: {message}")]
    ConnectionFailed { endpoint: String, message: String },

    /// Statement execution failed on a target
    #[error("Statement failed: {0}")]
    Statement(String),

    /// A sealed batch has no entries to load
    #[error("Batch {0} has no entries to load")]
    EmptyBatch(String),
}

/// Secret unwrapping errors.
#[derive(Error, Debug)]
pub enum SecretError {
    /// Ciphertext was not valid base64
    #[error("Invalid ciphertext encoding: {0}")]
    Encoding(String),

    /// Unwrapping service rejected or failed the request
    #[error("Decrypt failed: {0}")]
    Decrypt(String),

    /// Plaintext is not valid UTF-8
    #[error("Decrypted secret is not valid UTF-8")]
    InvalidUtf8,
}

/// Notification errors.
#[derive(Error, Debug)]
pub enum NotifyError {
    /// Publishing to the channel failed
    #[error("Publish to {channel} failed: {message}")]
    PublishFailed { channel: String, message: String },
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        StoreError::Connection(err.to_string())
    }
}

impl Error {
    /// Whether this error ends the invocation without any retry being useful
    /// at this layer. Every variant is fatal except event rejections, which
    /// describe the payload rather than the system.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Event(_))
    }
}
