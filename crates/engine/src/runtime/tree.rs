//! Execution tree manipulation
//!
//! Scope executions (the root, an entered sub-process, a started event
//! sub-process) own the executions running inside them as direct children.
//! Concurrent branches of one scope are siblings.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::agenda::{FlowSelection, Operation};
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::model::{FlowNode, NodeKind, ProcessDefinition};
use crate::persistence::{Execution, ExecutionState, ProcessInstanceState, Variables};

pub(crate) fn definition_of(
    ctx: &mut CommandContext,
    execution_id: Uuid,
) -> Result<Arc<ProcessDefinition>, EngineError> {
    let definition_id = ctx
        .entities()?
        .execution(execution_id)?
        .process_definition_id
        .clone();
    ctx.definition(&definition_id)
}

/// Flow node the execution sits on
pub(crate) fn activity_of(ctx: &mut CommandContext, execution_id: Uuid) -> Result<String, EngineError> {
    ctx.entities()?
        .execution(execution_id)?
        .activity_id
        .clone()
        .ok_or_else(|| {
            EngineError::illegal_state(format!(
                "execution {execution_id} is not positioned on a flow node"
            ))
        })
}

pub(crate) fn node<'a>(
    definition: &'a ProcessDefinition,
    activity_id: &str,
) -> Result<&'a FlowNode, EngineError> {
    definition.node(activity_id).ok_or_else(|| {
        EngineError::definition(format!(
            "flow node '{activity_id}' not found in '{}'",
            definition.id
        ))
    })
}

fn spawn(parent: &Execution, activity_id: &str, now: chrono::DateTime<chrono::Utc>) -> Execution {
    Execution {
        id: Uuid::now_v7(),
        process_instance_id: parent.process_instance_id,
        parent_id: Some(parent.id),
        process_definition_id: parent.process_definition_id.clone(),
        activity_id: Some(activity_id.to_string()),
        is_scope: false,
        is_concurrent: false,
        is_active: true,
        state: ExecutionState::Created,
        variables: Variables::new(),
        tenant_id: parent.tenant_id.clone(),
        created_at: now,
        version: 0,
    }
}

/// New child of `parent_id` positioned on `activity_id`
pub(crate) fn create_child(
    ctx: &mut CommandContext,
    parent_id: Uuid,
    activity_id: &str,
) -> Result<Uuid, EngineError> {
    let now = ctx.now();
    let session = ctx.entities()?;
    let child = spawn(session.execution(parent_id)?, activity_id, now);
    let id = child.id;
    session.insert_execution(child)?;
    Ok(id)
}

/// New concurrent branch next to `execution_id`, in the same scope
pub(crate) fn create_concurrent_sibling(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    activity_id: &str,
) -> Result<Uuid, EngineError> {
    let parent_id = ctx
        .entities()?
        .execution(execution_id)?
        .parent_id
        .ok_or_else(|| EngineError::illegal_state("the root execution has no siblings"))?;

    let id = create_child(ctx, parent_id, activity_id)?;
    let session = ctx.entities()?;
    session.execution_mut(execution_id)?.is_concurrent = true;
    session.execution_mut(id)?.is_concurrent = true;
    Ok(id)
}

/// Move an execution to another node of the same scope
pub(crate) fn move_to(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    activity_id: &str,
) -> Result<(), EngineError> {
    ctx.entities()?.execution_mut(execution_id)?.activity_id = Some(activity_id.to_string());
    Ok(())
}

/// Delete the subscriptions and jobs owned by an execution
pub(crate) fn remove_event_listeners(
    ctx: &mut CommandContext,
    execution_id: Uuid,
) -> Result<(), EngineError> {
    let session = ctx.entities()?;
    for subscription in session.subscriptions_of(execution_id) {
        session.delete_subscription(subscription.id);
    }
    for job_id in session.job_ids_of(execution_id) {
        session.delete_job(job_id);
    }
    Ok(())
}

/// Delete an execution with its descendants, subscriptions and jobs
///
/// Children go first. With `cancelled` every removed execution positioned on
/// a node reports an activity cancellation.
pub(crate) fn remove_tree(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    cancelled: bool,
) -> Result<(), EngineError> {
    for child in ctx.entities()?.child_ids(execution_id) {
        remove_tree(ctx, child, cancelled)?;
    }
    remove_event_listeners(ctx, execution_id)?;

    let session = ctx.entities()?;
    let execution = session.execution(execution_id)?;
    let cancellation = match (&execution.activity_id, cancelled) {
        (Some(activity_id), true) => Some(EngineEvent::ActivityCancelled {
            process_instance_id: execution.process_instance_id,
            execution_id,
            activity_id: activity_id.clone(),
        }),
        _ => None,
    };
    session.delete_execution(execution_id);

    if let Some(event) = cancellation {
        ctx.emit(event);
    }
    Ok(())
}

/// Cancel everything running inside a scope, keeping the scope itself
pub(crate) fn cancel_descendants(ctx: &mut CommandContext, scope_id: Uuid) -> Result<(), EngineError> {
    for child in ctx.entities()?.child_ids(scope_id) {
        remove_tree(ctx, child, true)?;
    }
    Ok(())
}

/// Interrupt the activity an execution sits on
///
/// Children, listeners and local variables are removed; the execution
/// itself survives so the caller can route it elsewhere.
pub(crate) fn interrupt_activity(ctx: &mut CommandContext, execution_id: Uuid) -> Result<(), EngineError> {
    cancel_descendants(ctx, execution_id)?;
    remove_event_listeners(ctx, execution_id)?;

    let execution = ctx.entities()?.execution_mut(execution_id)?;
    execution.is_scope = false;
    execution.variables.clear();
    let event = execution.activity_id.clone().map(|activity_id| EngineEvent::ActivityCancelled {
        process_instance_id: execution.process_instance_id,
        execution_id,
        activity_id,
    });

    if let Some(event) = event {
        debug!(%execution_id, "activity interrupted");
        ctx.emit(event);
    }
    Ok(())
}

/// Continue after the last child of a scope execution ended
pub(crate) fn complete_scope(ctx: &mut CommandContext, scope_id: Uuid) -> Result<(), EngineError> {
    let scope = ctx.entities()?.execution(scope_id)?.clone();
    let Some(activity_id) = scope.activity_id.as_deref() else {
        return finish_process_instance(
            ctx,
            scope.process_instance_id,
            ProcessInstanceState::Completed,
            None,
        );
    };

    let definition = ctx.definition(&scope.process_definition_id)?;
    match node(&definition, activity_id)?.kind {
        NodeKind::SubProcess => {
            let execution = ctx.entities()?.execution_mut(scope_id)?;
            execution.is_scope = false;
            execution.variables.clear();
            ctx.plan(Operation::TakeOutgoingSequenceFlows {
                execution_id: scope_id,
                selection: FlowSelection::Conditional,
            });
        }
        _ => ctx.plan(Operation::EndExecution {
            execution_id: scope_id,
        }),
    }
    Ok(())
}

/// End a process instance, removing its whole runtime tree
pub(crate) fn finish_process_instance(
    ctx: &mut CommandContext,
    process_instance_id: Uuid,
    state: ProcessInstanceState,
    reason: Option<String>,
) -> Result<(), EngineError> {
    let now = ctx.now();
    let session = ctx.entities()?;

    let execution_ids: Vec<Uuid> = session.executions(process_instance_id).map(|e| e.id).collect();
    for subscription in session.subscriptions_in(process_instance_id) {
        session.delete_subscription(subscription.id);
    }
    for id in execution_ids.iter().rev() {
        for job_id in session.job_ids_of(*id) {
            session.delete_job(job_id);
        }
        session.delete_execution(*id);
    }

    let instance = session.process_instance_mut(process_instance_id)?;
    instance.state = state;
    instance.end_time = Some(now);
    instance.end_reason = reason.clone();

    info!(%process_instance_id, %state, "process instance ended");
    ctx.emit(match state {
        ProcessInstanceState::Completed => EngineEvent::ProcessCompleted {
            process_instance_id,
        },
        _ => EngineEvent::ProcessTerminated {
            process_instance_id,
            reason,
        },
    });
    Ok(())
}
