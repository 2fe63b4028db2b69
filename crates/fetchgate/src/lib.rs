//! fetchgate: bounded-concurrency coordination for callback-driven requests.
//!
//! Built bottom-up:
//! - [`OutstandingTracker`]: multiset of in-flight labels, exactly-once arrival
//! - [`RateLimiter`]: caps how fast requests are submitted
//! - [`TimedPermitGate`]: caps how many are in flight and force-completes the
//!   ones that miss their deadline
//! - [`BatchRetryDriver`]: retries timed-out labels with shrinking concurrency

use std::fmt::Debug;
use std::hash::Hash;

mod sync;
mod timer;

pub mod config;
pub mod driver;
pub mod error;
pub mod gate;
pub mod permit;
pub mod rate_limit;
pub mod tracker;

pub use config::{CoordinatorConfig, RateLimitConfig};
pub use driver::{
    BatchReport, BatchRetryDriver, Completion, ConcurrencyPolicy, Dispatch, Interrupter,
    RoundSummary, dedup_labels,
};
pub use error::{ConfigError, GateError, Result};
pub use gate::{GateHandle, Interruptible, TimedPermitGate};
pub use permit::{PermitInUse, PermitPool};
pub use rate_limit::RateLimiter;
pub use tracker::OutstandingTracker;

/// Identifier of one unit of asynchronous work, e.g. an instrument plus a
/// time range. Equal labels registered twice are two occurrences.
pub trait Label: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Label for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
