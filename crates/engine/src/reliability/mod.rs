//! Retry and backoff
//!
//! [`RetryPolicy`] drives both the retries of failed jobs and the re-runs of
//! commands that lost an optimistic locking race.

mod retry;

pub(crate) use retry::duration_millis;
pub use retry::{Backoff, RetryPolicy};
