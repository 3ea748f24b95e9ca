//! Async job subsystem
//!
//! Jobs are durable records of deferred work. Runtime code creates them
//! inside a unit of work through [`schedule`]; the async executor (or a
//! direct `execute_job` call) runs each one later in a fresh unit of work
//! through its registered [`JobHandler`].
//!
//! Failure pipeline: a failing job loses one retry and is rescheduled as a
//! timer with backoff; at zero retries, or on a non-retryable error, it moves
//! to the dead-letter state and is never acquired again.

mod handlers;

pub use handlers::{AsyncContinuationHandler, TriggerTimerHandler};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::command::{CommandExecutor, ExecuteJob, HandleFailedJob};
use crate::context::{CommandContext, JobAddedNotification};
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::persistence::{Execution, Job, JobState, JobType};

/// Handler type of the job resuming an `async_before` node
pub const ASYNC_CONTINUATION: &str = "async-continuation";

/// Handler type of the job firing a timer event
pub const TRIGGER_TIMER: &str = "trigger-timer";

/// Executes jobs of one handler type
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    fn handler_type(&self) -> &str;

    /// Run the job inside the unit of work that deletes it
    async fn execute(&self, job: &Job, ctx: &mut CommandContext) -> Result<(), EngineError>;
}

/// Build a job owned by `execution` (or a standalone job)
pub(crate) fn new_job(
    ctx: &CommandContext,
    job_type: JobType,
    handler_type: &str,
    configuration: Value,
    due_date: Option<DateTime<Utc>>,
    execution: Option<&Execution>,
    element_id: Option<String>,
) -> Job {
    let state = match job_type {
        JobType::Timer => JobState::Timer,
        JobType::Async => JobState::Executable,
    };
    Job {
        id: Uuid::now_v7(),
        job_type,
        state,
        process_instance_id: execution.map(|e| e.process_instance_id),
        execution_id: execution.map(|e| e.id),
        element_id,
        handler_type: handler_type.to_string(),
        handler_configuration: configuration,
        due_date,
        retries: ctx.config().job_retry_policy().max_retries,
        exception_message: None,
        exception_stacktrace: None,
        tenant_id: execution.and_then(|e| e.tenant_id.clone()),
        lock_owner: None,
        lock_expiration_time: None,
        create_time: ctx.now(),
        version: 0,
    }
}

/// Insert a job into the current unit of work
///
/// The async executor is woken once the unit of work commits.
pub(crate) fn schedule(ctx: &mut CommandContext, job: Job) -> Result<Uuid, EngineError> {
    let id = job.id;
    let event = EngineEvent::JobCreated {
        job_id: id,
        job_type: job.job_type,
        handler_type: job.handler_type.clone(),
    };
    debug!(job_id = %id, job_type = %job.job_type, handler_type = %job.handler_type, due_date = ?job.due_date, "scheduling job");

    ctx.entities()?.insert_job(job)?;
    ctx.emit(event);

    let notifier = std::sync::Arc::clone(ctx.config().job_notifier());
    ctx.add_close_listener_once("job-added", move || {
        Box::new(JobAddedNotification::new(notifier))
    });
    Ok(id)
}

/// Execute one job in its own unit of work
///
/// On failure the job's retry bookkeeping runs in a separate unit of work
/// and the original error is returned. Returns `false` when the job no
/// longer exists or its execution is gone.
pub async fn execute_job(executor: &CommandExecutor, job_id: Uuid) -> Result<bool, EngineError> {
    run_with_failure_handling(executor, ExecuteJob::new(job_id)).await
}

/// Execute a job this lock owner acquired
///
/// Returns `false` without running the handler if the lease was lost to
/// another owner in the meantime.
pub(crate) async fn execute_acquired_job(
    executor: &CommandExecutor,
    job_id: Uuid,
    lock_owner: &str,
) -> Result<bool, EngineError> {
    run_with_failure_handling(executor, ExecuteJob::new(job_id).with_lock_owner(lock_owner)).await
}

async fn run_with_failure_handling(
    executor: &CommandExecutor,
    command: ExecuteJob,
) -> Result<bool, EngineError> {
    let job_id = command.job_id;
    match executor.execute(command).await {
        Ok(executed) => Ok(executed),
        Err(err) => {
            let failure = HandleFailedJob::from_error(job_id, &err);
            if let Err(handling) = executor.execute(failure).await {
                warn!(job_id = %job_id, error = %handling, "failed to record job failure");
            }
            Err(err)
        }
    }
}
