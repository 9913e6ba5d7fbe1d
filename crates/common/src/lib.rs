#![deny(missing_docs)]

//! Shared configuration, error types, and observability primitives for
//! furrow crates.
//!
//! Architecture role:
//! - defines session/combiner configuration passed across layers
//! - provides the common [`Error`] / [`Result`] contracts with the
//!   retryable-vs-fatal classification the evaluator depends on
//! - hosts the counter map backing worker statistics
//! - provides the keyed single-flight map used for idempotent compiles
//!   and combiner commits
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`stats`]
//! - [`sync`]

/// Session, combiner, and retry configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Named counters aggregated across tasks and machines.
pub mod stats;
/// Keyed single-flight execution.
pub mod sync;

pub use config::{BackoffPolicy, CombinerConfig, SessionConfig};
pub use error::{Error, Result};
pub use stats::{Counter, StatsMap};
pub use sync::{panic_error, OnceMap};
