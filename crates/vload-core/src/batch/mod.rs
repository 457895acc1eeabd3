//! Batch lifecycle: admission, accumulation, rotation, closing and unlock.
//!
//! ```text
//! open ──lock──▶ locked ──▶ complete
//!   ▲              │  └───▶ error
//!   └──reopen──────┴─────────┘   (operator unlock, non-current batches only)
//! ```
//!
//! Every edge is a conditional write on the batch's current status.

mod accumulator;
mod closer;
mod registrar;
mod rotation;
mod unlock;

pub use accumulator::{Accumulator, RetryPolicy};
pub use closer::{BatchCloser, CloseReport};
pub use registrar::{Admission, Registrar};
pub use rotation::{FlushPolicy, RotationOutcome, Rotator};
pub use unlock::{UnlockOutcome, Unlocker};
