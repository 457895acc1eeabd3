//! vload core - batch loading of object-store files into analytical databases
//!
//! Object-created events are admitted exactly once, accumulated into
//! size- and age-bounded batches shared by many concurrent invocations, and
//! each sealed batch is bulk-loaded into every configured target cluster:
//!
//! - Optimistic concurrency through conditional writes only
//! - Lock-then-snapshot rotation that never loses or duplicates entries
//! - Parallel per-target loads with an audited statement trail
//! - One notification per closed batch

pub mod aws;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod health;
pub mod load;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod secrets;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use engine::{FlushOutcome, Pipeline, ProcessOutcome, Services};
pub use error::{EventError, LoadError, NotifyError, SecretError, StoreError};
pub use error::{Error, Result};
