//! Job acquisition with adaptive polling
//!
//! Polls at the minimum interval while jobs keep turning up and backs off
//! towards the maximum interval while idle. A commit that created jobs wakes
//! the poller immediately.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{debug, instrument, trace};

use crate::command::{AcquireJobs, CommandExecutor};
use crate::error::EngineError;
use crate::persistence::Job;
use crate::reliability::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Pause between acquisitions while jobs keep turning up
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Longest pause after consecutive empty acquisitions
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth of the pause per empty acquisition
    pub backoff_multiplier: f64,

    /// Upper bound on jobs locked by one acquisition
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(self, min_interval: Duration) -> Self {
        Self { min_interval, ..self }
    }

    pub fn with_max_interval(self, max_interval: Duration) -> Self {
        Self { max_interval, ..self }
    }

    /// Values below 1.0 would shrink the pause and are raised to 1.0
    pub fn with_backoff_multiplier(self, multiplier: f64) -> Self {
        Self {
            backoff_multiplier: multiplier.max(1.0),
            ..self
        }
    }

    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            ..self
        }
    }

    fn pause_after(&self, empty_rounds: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(i32::try_from(empty_rounds).unwrap_or(i32::MAX));
        let pause = self.min_interval.as_secs_f64() * factor;
        Duration::from_secs_f64(pause.min(self.max_interval.as_secs_f64()))
    }
}

/// Acquires due jobs on behalf of one lock owner
pub struct AcquisitionPoller {
    executor: CommandExecutor,
    lock_owner: String,
    lock_duration: Duration,
    config: PollerConfig,
    /// Consecutive acquisitions that found nothing
    empty_rounds: u32,
    job_created: Arc<Notify>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AcquisitionPoller {
    pub fn new(
        executor: CommandExecutor,
        lock_owner: String,
        lock_duration: Duration,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let job_created = Arc::clone(executor.config().job_notifier());
        Self {
            executor,
            lock_owner,
            lock_duration,
            config,
            empty_rounds: 0,
            job_created,
            shutdown_rx,
        }
    }

    /// Lock up to `capacity` due jobs, never more than one batch
    #[instrument(skip(self), fields(lock_owner = %self.lock_owner))]
    pub async fn acquire(&mut self, capacity: usize) -> Result<Vec<Job>, EngineError> {
        if self.is_shutdown() {
            return Ok(Vec::new());
        }

        let acquired = self
            .executor
            .execute(AcquireJobs {
                lock_owner: self.lock_owner.clone(),
                lock_duration: self.lock_duration,
                max_jobs: capacity.min(self.config.batch_size),
            })
            .await?;

        self.empty_rounds = if acquired.is_empty() {
            self.empty_rounds.saturating_add(1)
        } else {
            0
        };
        trace!(
            acquired = acquired.len(),
            pause_ms = self.pause().as_millis() as u64,
            "acquisition round finished"
        );
        Ok(acquired)
    }

    /// Sleep until the pause elapses or a commit announces new jobs
    ///
    /// Returns `true` once shutdown was signalled.
    pub async fn idle(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let job_created = Arc::clone(&self.job_created);
        tokio::select! {
            _ = tokio::time::sleep(self.pause()) => false,
            _ = job_created.notified() => {
                trace!("new jobs announced");
                self.empty_rounds = 0;
                false
            }
            _ = shutdown_rx.changed() => {
                debug!("shutdown requested while idle");
                true
            }
        }
    }

    /// Current pause between acquisitions
    pub fn pause(&self) -> Duration {
        self.config.pause_after(self.empty_rounds)
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}
