//! Job commands: execution, failure bookkeeping, acquisition and administration

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::Command;
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::job;
use crate::persistence::{EntityKind, Execution, Job, JobQuery, JobState, JobType};

fn lease_until(now: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>, EngineError> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| {
            EngineError::Configuration(format!(
                "{}ms past {now} is outside the representable time range",
                duration.as_millis()
            ))
        })
}

async fn load_existing_job(ctx: &mut CommandContext, job_id: Uuid) -> Result<Job, EngineError> {
    ctx.entities()?
        .load_job(job_id)
        .await?
        .ok_or_else(|| EngineError::not_found(EntityKind::Job, job_id))
}

// =============================================================================
// Execution
// =============================================================================

/// Run one job through its handler
///
/// The job row is deleted in the same unit of work as the handler's changes.
/// Returns `false` if the job is gone or its execution no longer exists (the
/// latter deletes the orphaned job).
#[derive(Debug, Clone)]
pub struct ExecuteJob {
    pub job_id: Uuid,
    /// Owner whose lease the execution relies on
    pub lock_owner: Option<String>,
}

impl ExecuteJob {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            lock_owner: None,
        }
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = Some(owner.into());
        self
    }
}

#[async_trait]
impl Command for ExecuteJob {
    type Output = bool;

    fn name(&self) -> &'static str {
        "ExecuteJob"
    }

    #[instrument(skip_all, fields(job_id = %self.job_id))]
    async fn execute(&self, ctx: &mut CommandContext) -> Result<bool, EngineError> {
        let Some(job) = ctx.entities()?.load_job(self.job_id).await? else {
            debug!("job no longer exists");
            return Ok(false);
        };
        if job.state == JobState::DeadLetter {
            return Err(EngineError::illegal_state(format!(
                "job {} is dead-lettered",
                job.id
            )));
        }
        if let Some(owner) = &self.lock_owner {
            if job.lock_owner.as_ref() != Some(owner) {
                debug!(lock_owner = %owner, holder = ?job.lock_owner, "lease lost, skipping job");
                return Ok(false);
            }
        }
        let handler = ctx
            .config()
            .job_handlers()
            .get(&job.handler_type)
            .ok_or_else(|| EngineError::UnknownJobHandler(job.handler_type.clone()))?;

        if let Some(execution_id) = job.execution_id {
            if ctx.entities()?.load_execution(execution_id).await?.is_none() {
                debug!(%execution_id, "owning execution is gone, discarding job");
                ctx.entities()?.delete_job(job.id);
                return Ok(false);
            }
        }

        ctx.entities()?.delete_job(job.id);
        handler.execute(&job, ctx).await?;

        debug!(handler_type = %job.handler_type, "job executed");
        ctx.emit(EngineEvent::JobExecuted {
            job_id: job.id,
            handler_type: job.handler_type.clone(),
        });
        Ok(true)
    }
}

/// Record a failed job execution
///
/// Runs in its own unit of work after the job's unit of work rolled back.
/// A lost optimistic lock only releases the lease: the job is still intact
/// and another attempt may succeed without spending a retry.
#[derive(Debug, Clone)]
pub struct HandleFailedJob {
    pub job_id: Uuid,
    pub message: String,
    pub details: String,
    pub retryable: bool,
    pub optimistic_lock: bool,
}

impl HandleFailedJob {
    pub fn from_error(job_id: Uuid, err: &EngineError) -> Self {
        Self {
            job_id,
            message: err.to_string(),
            details: err.details(),
            retryable: err.is_retryable(),
            optimistic_lock: err.is_optimistic_lock(),
        }
    }
}

#[async_trait]
impl Command for HandleFailedJob {
    type Output = ();

    fn name(&self) -> &'static str {
        "HandleFailedJob"
    }

    #[instrument(skip_all, fields(job_id = %self.job_id))]
    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        match ctx.entities()?.load_job(self.job_id).await? {
            None => {
                debug!("failed job no longer exists");
                return Ok(());
            }
            Some(job) if job.state == JobState::DeadLetter => {
                debug!("job already dead-lettered");
                return Ok(());
            }
            Some(_) => {}
        }
        let policy = ctx.config().job_retry_policy().clone();
        let now = ctx.now();

        let job = ctx.entities()?.job_mut(self.job_id)?;
        job.unlock();
        if self.optimistic_lock {
            debug!("job lost an optimistic lock race, released for another attempt");
            return Ok(());
        }

        job.exception_message = Some(self.message.clone());
        job.exception_stacktrace = Some(self.details.clone());
        job.retries = if self.retryable {
            job.retries.saturating_sub(1)
        } else {
            0
        };

        let event = if job.retries > 0 {
            let delay = policy.backoff_for_remaining(job.retries);
            job.state = JobState::Timer;
            job.due_date = Some(lease_until(now, delay)?);
            warn!(
                retries = job.retries,
                delay_ms = delay.as_millis() as u64,
                error = %self.message,
                "job failed, rescheduled"
            );
            EngineEvent::JobFailed {
                job_id: job.id,
                retries: job.retries,
                message: self.message.clone(),
            }
        } else {
            job.state = JobState::DeadLetter;
            warn!(
                retryable = self.retryable,
                error = %self.message,
                "job moved to dead letter"
            );
            EngineEvent::JobDeadLettered {
                job_id: job.id,
                message: self.message.clone(),
            }
        };
        ctx.emit(event);
        Ok(())
    }
}

// =============================================================================
// Acquisition
// =============================================================================

/// Query-and-lock unit of work of the async executor
///
/// Selection and locking commit together; a competing acquirer that selected
/// the same rows loses the optimistic lock and, retried, no longer sees them.
#[derive(Debug, Clone)]
pub struct AcquireJobs {
    pub lock_owner: String,
    pub lock_duration: Duration,
    pub max_jobs: usize,
}

#[async_trait]
impl Command for AcquireJobs {
    type Output = Vec<Job>;

    fn name(&self) -> &'static str {
        "AcquireJobs"
    }

    #[instrument(skip_all, fields(lock_owner = %self.lock_owner, max_jobs = self.max_jobs))]
    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<Job>, EngineError> {
        let now = ctx.now();
        let expires = lease_until(now, self.lock_duration)?;
        let store = Arc::clone(ctx.entities()?.store());
        let due = store.find_acquirable_jobs(now, self.max_jobs).await?;

        let session = ctx.entities()?;
        session.attach_jobs(due.iter().cloned());
        let mut acquired = Vec::with_capacity(due.len());
        for candidate in due {
            let job = session.job_mut(candidate.id)?;
            job.lock(&self.lock_owner, expires);
            job.state = JobState::Executable;
            acquired.push(job.clone());
        }

        if !acquired.is_empty() {
            debug!(acquired = acquired.len(), "acquired jobs");
        }
        Ok(acquired)
    }
}

/// Release the lease on a job without executing it
#[derive(Debug, Clone, Copy)]
pub struct UnlockJob {
    pub job_id: Uuid,
}

#[async_trait]
impl Command for UnlockJob {
    type Output = ();

    fn name(&self) -> &'static str {
        "UnlockJob"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        load_existing_job(ctx, self.job_id).await?;
        ctx.entities()?.job_mut(self.job_id)?.unlock();
        Ok(())
    }
}

/// Release every lease held by a lock owner (executor shutdown)
#[derive(Debug, Clone)]
pub struct UnacquireOwnedJobs {
    pub lock_owner: String,
}

#[async_trait]
impl Command for UnacquireOwnedJobs {
    type Output = usize;

    fn name(&self) -> &'static str {
        "UnacquireOwnedJobs"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<usize, EngineError> {
        let store = Arc::clone(ctx.entities()?.store());
        let owned = store
            .find_jobs(&JobQuery::default().with_lock_owner(&self.lock_owner))
            .await?;

        let session = ctx.entities()?;
        session.attach_jobs(owned.iter().cloned());
        for job in &owned {
            session.job_mut(job.id)?.unlock();
        }
        if !owned.is_empty() {
            info!(lock_owner = %self.lock_owner, released = owned.len(), "released job leases");
        }
        Ok(owned.len())
    }
}

// =============================================================================
// Scheduling
// =============================================================================

/// Optional owner of a job scheduled from outside the runtime
async fn owning_execution(
    ctx: &mut CommandContext,
    execution_id: Option<Uuid>,
) -> Result<Option<Execution>, EngineError> {
    let Some(execution_id) = execution_id else {
        return Ok(None);
    };
    let session = ctx.entities()?;
    if session.load_execution(execution_id).await?.is_none() {
        return Err(EngineError::not_found(EntityKind::Execution, execution_id));
    }
    Ok(Some(session.execution(execution_id)?.clone()))
}

fn require_handler(ctx: &CommandContext, handler_type: &str) -> Result<(), EngineError> {
    if ctx.config().job_handlers().contains(handler_type) {
        Ok(())
    } else {
        Err(EngineError::UnknownJobHandler(handler_type.to_string()))
    }
}

/// Schedule a timer job for a registered handler
#[derive(Debug, Clone)]
pub struct ScheduleTimer {
    pub due_date: DateTime<Utc>,
    pub handler_type: String,
    pub configuration: Value,
    pub execution_id: Option<Uuid>,
    pub element_id: Option<String>,
}

#[async_trait]
impl Command for ScheduleTimer {
    type Output = Uuid;

    fn name(&self) -> &'static str {
        "ScheduleTimer"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Uuid, EngineError> {
        require_handler(ctx, &self.handler_type)?;
        let execution = owning_execution(ctx, self.execution_id).await?;
        let job = job::new_job(
            ctx,
            JobType::Timer,
            &self.handler_type,
            self.configuration.clone(),
            Some(self.due_date),
            execution.as_ref(),
            self.element_id.clone(),
        );
        job::schedule(ctx, job)
    }
}

/// Schedule an immediately executable job for a registered handler
#[derive(Debug, Clone)]
pub struct ScheduleAsync {
    pub handler_type: String,
    pub configuration: Value,
    pub execution_id: Option<Uuid>,
    pub element_id: Option<String>,
}

#[async_trait]
impl Command for ScheduleAsync {
    type Output = Uuid;

    fn name(&self) -> &'static str {
        "ScheduleAsync"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Uuid, EngineError> {
        require_handler(ctx, &self.handler_type)?;
        let execution = owning_execution(ctx, self.execution_id).await?;
        let job = job::new_job(
            ctx,
            JobType::Async,
            &self.handler_type,
            self.configuration.clone(),
            None,
            execution.as_ref(),
            self.element_id.clone(),
        );
        job::schedule(ctx, job)
    }
}

// =============================================================================
// Administration
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct DeleteJob {
    pub job_id: Uuid,
}

#[async_trait]
impl Command for DeleteJob {
    type Output = ();

    fn name(&self) -> &'static str {
        "DeleteJob"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        load_existing_job(ctx, self.job_id).await?;
        ctx.entities()?.delete_job(self.job_id);
        info!(job_id = %self.job_id, "deleted job");
        Ok(())
    }
}

/// Give a dead-lettered job fresh retries and make it executable now
#[derive(Debug, Clone, Copy)]
pub struct MoveDeadLetterJobToExecutable {
    pub job_id: Uuid,
    pub retries: u32,
}

#[async_trait]
impl Command for MoveDeadLetterJobToExecutable {
    type Output = Job;

    fn name(&self) -> &'static str {
        "MoveDeadLetterJobToExecutable"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Job, EngineError> {
        let existing = load_existing_job(ctx, self.job_id).await?;
        if existing.state != JobState::DeadLetter {
            return Err(EngineError::illegal_state(format!(
                "job {} is {}, not dead-lettered",
                self.job_id, existing.state
            )));
        }

        let job = ctx.entities()?.job_mut(self.job_id)?;
        job.state = JobState::Executable;
        job.retries = self.retries.max(1);
        job.due_date = None;
        job.unlock();
        info!(job_id = %self.job_id, retries = job.retries, "dead-letter job made executable");
        let job = job.clone();

        let notifier = Arc::clone(ctx.config().job_notifier());
        ctx.add_close_listener_once("job-added", move || {
            Box::new(crate::context::JobAddedNotification::new(notifier))
        });
        Ok(job)
    }
}

/// Overwrite the retries of a job
///
/// Positive retries on a dead-lettered job make it executable again.
#[derive(Debug, Clone, Copy)]
pub struct SetJobRetries {
    pub job_id: Uuid,
    pub retries: u32,
}

#[async_trait]
impl Command for SetJobRetries {
    type Output = ();

    fn name(&self) -> &'static str {
        "SetJobRetries"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        load_existing_job(ctx, self.job_id).await?;
        let job = ctx.entities()?.job_mut(self.job_id)?;
        job.retries = self.retries;
        if job.state == JobState::DeadLetter && self.retries > 0 {
            job.state = JobState::Executable;
            job.due_date = None;
        }
        Ok(())
    }
}
