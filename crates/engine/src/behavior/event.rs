//! Catch events, boundary events and event listeners
//!
//! Message and signal listeners are event subscriptions; timer listeners are
//! timer jobs. Both are owned by an execution and removed with it.

use async_trait::async_trait;
use serde_json::json;
use tracing::trace;
use uuid::Uuid;

use super::activity::resume;
use super::{ActivityBehavior, ActivityScope};
use crate::agenda::{FlowSelection, Operation};
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::job::{self, TRIGGER_TIMER};
use crate::model::{EventDefinition, NodeKind, ProcessDefinition};
use crate::persistence::{EventSubscription, EventType, ExecutionState, JobType, Variables};
use crate::runtime::variables;

pub(super) struct IntermediateCatchEventBehavior;

#[async_trait]
impl ActivityBehavior for IntermediateCatchEventBehavior {
    async fn execute(
        &self,
        ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
    ) -> Result<(), EngineError> {
        let NodeKind::IntermediateCatchEvent { event } = &scope.node.kind else {
            return Err(EngineError::illegal_state("catch event behavior on another node kind"));
        };
        ctx.entities()?
            .execution_mut(scope.execution_id)?
            .set_state(ExecutionState::Waiting)?;
        create_event_listener(ctx, scope.execution_id, &scope.node.id, event)
    }

    async fn trigger(
        &self,
        ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
        payload: Option<Variables>,
    ) -> Result<(), EngineError> {
        resume(ctx, scope, payload)
    }
}

/// Entered after its event fired; it only leaves
pub(super) struct BoundaryEventBehavior;

#[async_trait]
impl ActivityBehavior for BoundaryEventBehavior {
    async fn execute(
        &self,
        ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
    ) -> Result<(), EngineError> {
        ctx.plan(Operation::TakeOutgoingSequenceFlows {
            execution_id: scope.execution_id,
            selection: FlowSelection::Conditional,
        });
        Ok(())
    }
}

/// Create the listener for `event` at `activity_id`, owned by `execution_id`
///
/// Error definitions need no listener: errors are matched when thrown.
pub(crate) fn create_event_listener(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    activity_id: &str,
    event: &EventDefinition,
) -> Result<(), EngineError> {
    match event {
        EventDefinition::Message { name } => {
            subscribe(ctx, execution_id, activity_id, EventType::Message, name)
        }
        EventDefinition::Signal { name } => {
            subscribe(ctx, execution_id, activity_id, EventType::Signal, name)
        }
        EventDefinition::Timer { timer } => {
            let due_date = timer.due_date(ctx.now());
            let execution = ctx.entities()?.execution(execution_id)?.clone();
            let job = job::new_job(
                ctx,
                JobType::Timer,
                TRIGGER_TIMER,
                json!({ "activity_id": activity_id }),
                Some(due_date),
                Some(&execution),
                Some(activity_id.to_string()),
            );
            job::schedule(ctx, job)?;
            Ok(())
        }
        EventDefinition::Error { .. } => Ok(()),
    }
}

fn subscribe(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    activity_id: &str,
    event_type: EventType,
    name: &str,
) -> Result<(), EngineError> {
    let scope = variables::visible(ctx, execution_id)?;
    let event_name = ctx.config().expressions().resolve_name(name, &scope)?;
    let now = ctx.now();

    let session = ctx.entities()?;
    let execution = session.execution(execution_id)?;
    let subscription = EventSubscription {
        id: Uuid::now_v7(),
        event_type,
        event_name,
        execution_id,
        process_instance_id: execution.process_instance_id,
        activity_id: activity_id.to_string(),
        tenant_id: execution.tenant_id.clone(),
        created_at: now,
        version: 0,
    };
    trace!(
        %execution_id,
        %event_type,
        event_name = %subscription.event_name,
        activity_id,
        "subscribed"
    );
    session.insert_subscription(subscription)
}

/// Listeners of the non-error boundary events attached to `activity_id`
pub(crate) fn create_boundary_event_listeners(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    execution_id: Uuid,
    activity_id: &str,
) -> Result<(), EngineError> {
    for boundary in definition.boundary_events(activity_id) {
        if let NodeKind::BoundaryEvent { event, .. } = &boundary.kind {
            create_event_listener(ctx, execution_id, &boundary.id, event)?;
        }
    }
    Ok(())
}

/// Start listeners of the event sub-processes directly inside `scope`
///
/// `scope` is `None` for the process level.
pub(crate) fn create_scope_event_listeners(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    scope_execution_id: Uuid,
    scope: Option<&str>,
) -> Result<(), EngineError> {
    for event_sub_process in definition.event_sub_processes(scope) {
        let Some(start) = definition.event_start(&event_sub_process.id) else {
            continue;
        };
        if let NodeKind::StartEvent {
            event: Some(event), ..
        } = &start.kind
        {
            create_event_listener(ctx, scope_execution_id, &start.id, event)?;
        }
    }
    Ok(())
}
