//! Async job executor
//!
//! Acquires due jobs under a time-bounded lease and runs each one in its own
//! unit of work, bounded by a semaphore. Failures go through the job retry
//! bookkeeping; leases of jobs still held at shutdown are released.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{AcquisitionPoller, PollerConfig};
use crate::command::{AcquireJobs, CommandExecutor, UnacquireOwnedJobs, UnlockJob};
use crate::error::EngineError;
use crate::job::execute_acquired_job;
use crate::reliability::duration_millis;

/// Async executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncExecutorConfig {
    /// Lock owner recorded on acquired jobs (generated if not provided)
    pub lock_owner: String,

    /// Maximum concurrent job executions
    pub max_concurrency: usize,

    /// Lease duration of acquired jobs
    #[serde(with = "duration_millis")]
    pub lock_duration: Duration,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for AsyncExecutorConfig {
    fn default() -> Self {
        Self {
            lock_owner: format!("executor-{}", Uuid::now_v7()),
            max_concurrency: 10,
            lock_duration: Duration::from_secs(300),
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl AsyncExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from environment variables, falling back to defaults
    ///
    /// - `ASYNC_EXECUTOR_LOCK_OWNER`
    /// - `ASYNC_EXECUTOR_MAX_CONCURRENCY`
    /// - `ASYNC_EXECUTOR_BATCH_SIZE`
    /// - `ASYNC_EXECUTOR_LOCK_DURATION_MS`
    /// - `ASYNC_EXECUTOR_POLL_MIN_MS`
    /// - `ASYNC_EXECUTOR_POLL_MAX_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let poller = PollerConfig {
            min_interval: env_millis("ASYNC_EXECUTOR_POLL_MIN_MS")
                .unwrap_or(defaults.poller.min_interval),
            max_interval: env_millis("ASYNC_EXECUTOR_POLL_MAX_MS")
                .unwrap_or(defaults.poller.max_interval),
            ..defaults.poller.clone()
        }
        .with_batch_size(env_parse("ASYNC_EXECUTOR_BATCH_SIZE").unwrap_or(defaults.poller.batch_size));

        Self {
            lock_owner: std::env::var("ASYNC_EXECUTOR_LOCK_OWNER").unwrap_or(defaults.lock_owner),
            max_concurrency: env_parse::<usize>("ASYNC_EXECUTOR_MAX_CONCURRENCY")
                .unwrap_or(defaults.max_concurrency)
                .max(1),
            lock_duration: env_millis("ASYNC_EXECUTOR_LOCK_DURATION_MS")
                .unwrap_or(defaults.lock_duration),
            poller,
            shutdown_timeout: defaults.shutdown_timeout,
        }
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

/// Async executor status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncExecutorStatus {
    /// Acquiring and executing jobs
    Running,
    /// Finishing in-flight jobs, not acquiring new ones
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum AsyncExecutorError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("async executor is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Background executor for timer and async-continuation jobs
///
/// # Example
///
/// ```ignore
/// let executor = AsyncExecutor::new(
///     engine.executor().clone(),
///     AsyncExecutorConfig::from_env().with_max_concurrency(4),
/// );
/// executor.start()?;
///
/// // ... later, graceful shutdown
/// executor.shutdown().await?;
/// ```
pub struct AsyncExecutor {
    executor: CommandExecutor,
    config: AsyncExecutorConfig,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<AsyncExecutorStatus>,
    active_jobs: Arc<Semaphore>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncExecutor {
    pub fn new(executor: CommandExecutor, config: AsyncExecutorConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            executor,
            active_jobs: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            status: RwLock::new(AsyncExecutorStatus::Stopped),
            poll_handle: Mutex::new(None),
        }
    }

    /// Start the acquisition loop
    #[instrument(skip(self), fields(lock_owner = %self.config.lock_owner))]
    pub fn start(&self) -> Result<(), AsyncExecutorError> {
        {
            let mut status = self.status.write();
            if *status != AsyncExecutorStatus::Stopped {
                return Err(AsyncExecutorError::AlreadyRunning);
            }
            *status = AsyncExecutorStatus::Running;
        }

        info!(
            lock_owner = %self.config.lock_owner,
            max_concurrency = self.config.max_concurrency,
            "starting async executor"
        );

        self.shutdown_tx.send_replace(false);
        self.start_poll_loop();
        Ok(())
    }

    /// Stop acquiring, wait for in-flight jobs, then release held leases
    #[instrument(skip(self), fields(lock_owner = %self.config.lock_owner))]
    pub async fn shutdown(&self) -> Result<(), AsyncExecutorError> {
        if self.status() == AsyncExecutorStatus::Stopped {
            return Ok(());
        }

        info!(lock_owner = %self.config.lock_owner, "initiating graceful shutdown");
        *self.status.write() = AsyncExecutorStatus::Draining;
        self.shutdown_tx.send_replace(true);

        let poll_handle = self.poll_handle.lock().take();
        if let Some(handle) = poll_handle {
            if let Err(e) = handle.await {
                error!("poll loop panicked: {}", e);
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active_jobs.available_permits();
            if available == self.config.max_concurrency {
                debug!("all jobs completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_jobs = self.config.max_concurrency - available,
                    "shutdown timeout reached"
                );
                return Err(AsyncExecutorError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let released = self
            .executor
            .execute(UnacquireOwnedJobs {
                lock_owner: self.config.lock_owner.clone(),
            })
            .await?;
        if released > 0 {
            info!(released, "released job leases");
        }

        *self.status.write() = AsyncExecutorStatus::Stopped;
        info!(lock_owner = %self.config.lock_owner, "async executor stopped");
        Ok(())
    }

    pub fn status(&self) -> AsyncExecutorStatus {
        *self.status.read()
    }

    pub fn lock_owner(&self) -> &str {
        &self.config.lock_owner
    }

    pub fn config(&self) -> &AsyncExecutorConfig {
        &self.config
    }

    /// Jobs currently executing
    pub fn active_jobs(&self) -> usize {
        self.config.max_concurrency - self.active_jobs.available_permits()
    }

    /// Acquire one batch and execute it inline
    ///
    /// Drives the executor without the background loop. Returns the number
    /// of jobs whose handler ran; failed jobs are logged and counted out.
    pub async fn run_acquisition_cycle(&self) -> Result<usize, AsyncExecutorError> {
        let jobs = self
            .executor
            .execute(AcquireJobs {
                lock_owner: self.config.lock_owner.clone(),
                lock_duration: self.config.lock_duration,
                max_jobs: self.config.poller.batch_size,
            })
            .await?;

        let mut executed = 0;
        for job in jobs {
            match execute_acquired_job(&self.executor, job.id, &self.config.lock_owner).await {
                Ok(true) => executed += 1,
                Ok(false) => debug!(job_id = %job.id, "job skipped"),
                Err(e) => warn!(job_id = %job.id, error = %e, "job failed"),
            }
        }
        Ok(executed)
    }

    fn start_poll_loop(&self) {
        let mut poller = AcquisitionPoller::new(
            self.executor.clone(),
            self.config.lock_owner.clone(),
            self.config.lock_duration,
            self.config.poller.clone(),
            self.shutdown_tx.subscribe(),
        );
        let executor = self.executor.clone();
        let lock_owner = self.config.lock_owner.clone();
        let active_jobs = Arc::clone(&self.active_jobs);

        let handle = tokio::spawn(async move {
            poll_loop(&mut poller, &executor, &lock_owner, &active_jobs).await;
            debug!("poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }
}

async fn poll_loop(
    poller: &mut AcquisitionPoller,
    executor: &CommandExecutor,
    lock_owner: &str,
    active_jobs: &Arc<Semaphore>,
) {
    loop {
        if poller.is_shutdown() {
            break;
        }

        let available = active_jobs.available_permits();
        if available == 0 {
            if poller.idle().await {
                break;
            }
            continue;
        }

        match poller.acquire(available).await {
            Ok(jobs) => {
                for job in jobs {
                    let Ok(permit) = Arc::clone(active_jobs).try_acquire_owned() else {
                        // lease goes back so another owner can pick it up
                        if let Err(e) = executor.execute(UnlockJob { job_id: job.id }).await {
                            error!(job_id = %job.id, "failed to unlock job: {}", e);
                        }
                        continue;
                    };

                    let executor = executor.clone();
                    let lock_owner = lock_owner.to_string();
                    tokio::spawn(async move {
                        match execute_acquired_job(&executor, job.id, &lock_owner).await {
                            Ok(true) => debug!(job_id = %job.id, "job executed"),
                            Ok(false) => debug!(job_id = %job.id, "job skipped"),
                            Err(e) => warn!(job_id = %job.id, error = %e, "job failed"),
                        }
                        drop(permit);
                    });
                }
            }
            Err(e) => error!("acquisition failed: {}", e),
        }

        if poller.idle().await {
            break;
        }
    }
}
