//! Agenda operations
//!
//! Each function performs one step for one execution and plans its
//! successors; none of them recurse into another step directly.

use std::sync::Arc;

use tracing::{debug, trace};
use uuid::Uuid;

use super::{FlowSelection, Operation};
use crate::behavior::{self, behavior_for, ActivityScope};
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::job::{self, ASYNC_CONTINUATION};
use crate::model::SequenceFlow;
use crate::persistence::{ExecutionState, JobType, ProcessInstanceState, Variables};
use crate::runtime::{tree, variables};

pub(crate) async fn run_operation(
    ctx: &mut CommandContext,
    operation: Operation,
) -> Result<(), EngineError> {
    match operation {
        Operation::Command { command, slot } => {
            let output = command.execute_dyn(ctx).await?;
            ctx.set_result(slot, output);
            Ok(())
        }
        Operation::ContinueProcess {
            execution_id,
            skip_async,
        } => continue_process(ctx, execution_id, skip_async).await,
        Operation::TakeOutgoingSequenceFlows {
            execution_id,
            selection,
        } => take_outgoing_sequence_flows(ctx, execution_id, selection),
        Operation::TriggerExecution {
            execution_id,
            payload,
        } => trigger_execution(ctx, execution_id, payload).await,
        Operation::EndExecution { execution_id } => end_execution(ctx, execution_id),
        Operation::ExecuteInactiveBehaviors {
            process_instance_id,
        } => behavior::execute_inactive_behaviors(ctx, process_instance_id),
    }
}

/// Enter the node an execution sits on
async fn continue_process(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    skip_async: bool,
) -> Result<(), EngineError> {
    let definition = tree::definition_of(ctx, execution_id)?;
    let activity_id = tree::activity_of(ctx, execution_id)?;
    let node = tree::node(&definition, &activity_id)?;

    if node.async_before && !skip_async {
        let execution = ctx.entities()?.execution_mut(execution_id)?;
        execution.set_state(ExecutionState::Waiting)?;
        let execution = execution.clone();
        let job = job::new_job(
            ctx,
            JobType::Async,
            ASYNC_CONTINUATION,
            serde_json::Value::Null,
            None,
            Some(&execution),
            Some(node.id.clone()),
        );
        let job_id = job::schedule(ctx, job)?;
        debug!(%execution_id, activity_id = %node.id, %job_id, "entry deferred to async continuation");
        return Ok(());
    }

    let execution = ctx.entities()?.execution_mut(execution_id)?;
    execution.set_state(ExecutionState::Active)?;
    execution.is_active = true;
    let process_instance_id = execution.process_instance_id;

    ctx.emit(EngineEvent::ActivityStarted {
        process_instance_id,
        execution_id,
        activity_id: node.id.clone(),
        activity_type: node.kind.type_name().to_string(),
    });

    behavior::create_boundary_event_listeners(ctx, &definition, execution_id, &node.id)?;

    let scope = ActivityScope {
        definition: &definition,
        node,
        execution_id,
    };
    behavior_for(&node.kind).execute(ctx, &scope).await
}

/// Leave a node along the flows chosen by `selection`
///
/// The first taken flow reuses the execution; every further flow gets a new
/// concurrent sibling. Successors are planned in flow declaration order.
fn take_outgoing_sequence_flows(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    selection: FlowSelection,
) -> Result<(), EngineError> {
    let definition = tree::definition_of(ctx, execution_id)?;
    let activity_id = tree::activity_of(ctx, execution_id)?;

    tree::remove_event_listeners(ctx, execution_id)?;
    let process_instance_id = ctx.entities()?.execution(execution_id)?.process_instance_id;
    ctx.emit(EngineEvent::ActivityCompleted {
        process_instance_id,
        execution_id,
        activity_id: activity_id.clone(),
    });

    let outgoing = definition.outgoing(&activity_id);
    if outgoing.is_empty() {
        ctx.plan(Operation::EndExecution { execution_id });
        return Ok(());
    }

    let scope = variables::visible(ctx, execution_id)?;
    let evaluator = Arc::clone(ctx.config().expressions());
    let selected = select_flows(&outgoing, selection, |condition| {
        evaluator.evaluate_condition(condition, &scope)
    })?;
    if selected.is_empty() {
        return Err(EngineError::definition(format!(
            "no outgoing sequence flow of '{activity_id}' can be taken"
        )));
    }

    let targets: Vec<String> = selected.iter().map(|f| f.target.clone()).collect();
    trace!(%execution_id, from = %activity_id, ?targets, "taking sequence flows");

    let execution = ctx.entities()?.execution_mut(execution_id)?;
    execution.set_state(ExecutionState::Leaving)?;
    execution.activity_id = Some(targets[0].clone());
    if targets.len() > 1 {
        execution.is_concurrent = true;
    }

    let mut continued = vec![execution_id];
    for target in &targets[1..] {
        continued.push(tree::create_concurrent_sibling(ctx, execution_id, target)?);
    }
    for id in continued {
        ctx.plan(Operation::ContinueProcess {
            execution_id: id,
            skip_async: false,
        });
    }
    Ok(())
}

/// Choose the outgoing flows to take
///
/// Unguarded flows always qualify. The default flow is taken only when no
/// other flow qualifies. An empty result means nothing can be taken.
pub fn select_flows<'a, E>(
    flows: &[&'a SequenceFlow],
    selection: FlowSelection,
    mut guard: impl FnMut(&str) -> Result<bool, E>,
) -> Result<Vec<&'a SequenceFlow>, E> {
    if selection == FlowSelection::All {
        return Ok(flows.to_vec());
    }

    let mut selected = Vec::new();
    for flow in flows.iter().filter(|f| !f.is_default) {
        let takeable = match &flow.condition {
            Some(condition) => guard(condition)?,
            None => true,
        };
        if takeable {
            selected.push(*flow);
            if selection == FlowSelection::Exclusive {
                break;
            }
        }
    }

    if selected.is_empty() {
        selected.extend(flows.iter().find(|f| f.is_default).copied());
    }
    Ok(selected)
}

async fn trigger_execution(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    payload: Option<Variables>,
) -> Result<(), EngineError> {
    let definition = tree::definition_of(ctx, execution_id)?;
    let activity_id = tree::activity_of(ctx, execution_id)?;
    let node = tree::node(&definition, &activity_id)?;

    let scope = ActivityScope {
        definition: &definition,
        node,
        execution_id,
    };
    behavior_for(&node.kind).trigger(ctx, &scope, payload).await
}

fn end_execution(ctx: &mut CommandContext, execution_id: Uuid) -> Result<(), EngineError> {
    let execution = ctx.entities()?.execution(execution_id)?.clone();
    let Some(parent_id) = execution.parent_id else {
        return tree::finish_process_instance(
            ctx,
            execution.process_instance_id,
            ProcessInstanceState::Completed,
            None,
        );
    };

    // Siblings ending in concurrent units of work must not both miss being last
    ctx.entities()?.touch_execution(parent_id)?;
    tree::remove_tree(ctx, execution_id, false)?;
    if ctx.entities()?.child_ids(parent_id).is_empty() {
        tree::complete_scope(ctx, parent_id)?;
    }
    Ok(())
}
