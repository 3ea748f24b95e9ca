//! Built-in job handlers

use async_trait::async_trait;

use super::{JobHandler, ASYNC_CONTINUATION, TRIGGER_TIMER};
use crate::agenda::Operation;
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::persistence::Job;
use crate::runtime::propagation;

fn owning_execution(job: &Job) -> Result<uuid::Uuid, EngineError> {
    job.execution_id.ok_or_else(|| EngineError::JobHandler {
        handler: job.handler_type.clone(),
        message: format!("job {} has no execution", job.id),
    })
}

/// Enters the `async_before` node the job's execution waits at
#[derive(Debug, Default)]
pub struct AsyncContinuationHandler;

#[async_trait]
impl JobHandler for AsyncContinuationHandler {
    fn handler_type(&self) -> &str {
        ASYNC_CONTINUATION
    }

    async fn execute(&self, job: &Job, ctx: &mut CommandContext) -> Result<(), EngineError> {
        ctx.plan(Operation::ContinueProcess {
            execution_id: owning_execution(job)?,
            skip_async: true,
        });
        Ok(())
    }
}

/// Fires the timer catch event, boundary event or event sub-process start
#[derive(Debug, Default)]
pub struct TriggerTimerHandler;

#[async_trait]
impl JobHandler for TriggerTimerHandler {
    fn handler_type(&self) -> &str {
        TRIGGER_TIMER
    }

    async fn execute(&self, job: &Job, ctx: &mut CommandContext) -> Result<(), EngineError> {
        let execution_id = owning_execution(job)?;
        let activity_id = job
            .handler_configuration
            .get("activity_id")
            .and_then(|v| v.as_str())
            .or(job.element_id.as_deref())
            .ok_or_else(|| EngineError::JobHandler {
                handler: TRIGGER_TIMER.to_string(),
                message: format!("timer job {} names no activity", job.id),
            })?;

        propagation::fire_event(ctx, execution_id, activity_id, None)
    }
}
