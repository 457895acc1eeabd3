//! Invocation pipeline and service wiring.

mod pipeline;
mod services;

pub use pipeline::{FlushOutcome, Pipeline, ProcessOutcome};
pub use services::Services;
