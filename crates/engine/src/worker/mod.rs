//! Async job execution
//!
//! - [`AsyncExecutor`] acquires due jobs under a lease and executes them
//!   with bounded concurrency
//! - [`AcquisitionPoller`] polls for jobs with adaptive backoff and wakes
//!   early when a committed unit of work created jobs
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    AsyncExecutor                      │
//! │  ┌──────────────────┐                                 │
//! │  │ AcquisitionPoller│◄── job notifier (on commit)     │
//! │  └────────┬─────────┘                                 │
//! │           │ AcquireJobs (lease: owner + expiry)       │
//! │           ▼                                           │
//! │  ┌─────────────────────────────────────────────┐      │
//! │  │     ExecuteJob per job (Semaphore-limited)   │      │
//! │  │     failure -> HandleFailedJob               │      │
//! │  └─────────────────────────────────────────────┘      │
//! └──────────────────────────────────────────────────────┘
//! ```

mod poller;
mod pool;

pub use poller::{AcquisitionPoller, PollerConfig};
pub use pool::{AsyncExecutor, AsyncExecutorConfig, AsyncExecutorError, AsyncExecutorStatus};
