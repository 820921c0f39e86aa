//! Resilience patterns for tally-runtime.
//!
//! Retries are explicit: a [`RetryPolicy`] is injected at the task boundary
//! instead of being buried inside individual tasks.

mod retry;

pub use retry::RetryPolicy;
