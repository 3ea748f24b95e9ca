//! Gateways
//!
//! Joining gateways park arriving executions as inactive children of their
//! scope. The parallel join fires once as many executions wait as the gateway
//! has incoming flows; the inclusive join fires once no other execution of
//! the scope can still reach it.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, trace};
use uuid::Uuid;

use super::event::create_event_listener;
use super::{ActivityBehavior, ActivityScope};
use crate::agenda::{FlowSelection, Operation};
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::model::{NodeKind, ProcessDefinition};
use crate::persistence::{Execution, ExecutionState};
use crate::runtime::tree;

pub(super) struct ExclusiveGatewayBehavior;

#[async_trait]
impl ActivityBehavior for ExclusiveGatewayBehavior {
    async fn execute(
        &self,
        ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
    ) -> Result<(), EngineError> {
        ctx.plan(Operation::TakeOutgoingSequenceFlows {
            execution_id: scope.execution_id,
            selection: FlowSelection::Exclusive,
        });
        Ok(())
    }
}

pub(super) struct ParallelGatewayBehavior;

#[async_trait]
impl ActivityBehavior for ParallelGatewayBehavior {
    async fn execute(
        &self,
        ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
    ) -> Result<(), EngineError> {
        let execution_id = scope.execution_id;
        let gateway = scope.node.id.as_str();
        let required = scope.definition.incoming(gateway).len().max(1);

        let parent_id = park(ctx, execution_id)?;
        let others: Vec<Uuid> = waiting_at(ctx, parent_id, gateway)?
            .into_iter()
            .map(|e| e.id)
            .filter(|id| *id != execution_id)
            .collect();

        if others.len() + 1 < required {
            trace!(
                %execution_id,
                gateway,
                arrived = others.len() + 1,
                required,
                "parallel gateway waiting"
            );
            return Ok(());
        }

        for other in others.iter().take(required - 1) {
            tree::remove_tree(ctx, *other, false)?;
        }
        debug!(%execution_id, gateway, joined = required, "parallel gateway joined");
        activate(ctx, execution_id, parent_id)?;
        ctx.plan(Operation::TakeOutgoingSequenceFlows {
            execution_id,
            selection: FlowSelection::All,
        });
        Ok(())
    }
}

pub(super) struct InclusiveGatewayBehavior;

#[async_trait]
impl ActivityBehavior for InclusiveGatewayBehavior {
    async fn execute(
        &self,
        ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
    ) -> Result<(), EngineError> {
        park(ctx, scope.execution_id)?;
        try_inclusive_join(ctx, scope.definition, scope.execution_id, &scope.node.id)?;
        Ok(())
    }
}

pub(super) struct EventBasedGatewayBehavior;

#[async_trait]
impl ActivityBehavior for EventBasedGatewayBehavior {
    async fn execute(
        &self,
        ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
    ) -> Result<(), EngineError> {
        ctx.entities()?
            .execution_mut(scope.execution_id)?
            .set_state(ExecutionState::Waiting)?;

        for flow in scope.definition.outgoing(&scope.node.id) {
            let target = tree::node(scope.definition, &flow.target)?;
            let NodeKind::IntermediateCatchEvent { event } = &target.kind else {
                return Err(EngineError::definition(format!(
                    "event-based gateway '{}' leads to '{}', which is not a catch event",
                    scope.node.id, target.id
                )));
            };
            create_event_listener(ctx, scope.execution_id, &target.id, event)?;
        }
        Ok(())
    }
}

/// Deactivate an execution at a join; returns its parent scope
///
/// The scope is touched: arrivals on different branches committing
/// concurrently would otherwise each miss the other and never join.
fn park(ctx: &mut CommandContext, execution_id: Uuid) -> Result<Uuid, EngineError> {
    let session = ctx.entities()?;
    let execution = session.execution_mut(execution_id)?;
    execution.set_state(ExecutionState::Waiting)?;
    execution.is_active = false;
    let parent_id = execution.parent_id.ok_or_else(|| {
        EngineError::illegal_state("the root execution cannot wait at a gateway")
    })?;
    session.touch_execution(parent_id)?;
    Ok(parent_id)
}

/// Inactive children of `parent_id` parked at `gateway`, in arrival order
fn waiting_at(
    ctx: &mut CommandContext,
    parent_id: Uuid,
    gateway: &str,
) -> Result<Vec<Execution>, EngineError> {
    let session = ctx.entities()?;
    let mut waiting = Vec::new();
    for id in session.child_ids(parent_id) {
        let execution = session.execution(id)?;
        if !execution.is_active && execution.activity_id.as_deref() == Some(gateway) {
            waiting.push(execution.clone());
        }
    }
    Ok(waiting)
}

/// Reactivate the execution that continues past a join
fn activate(ctx: &mut CommandContext, execution_id: Uuid, parent_id: Uuid) -> Result<(), EngineError> {
    let concurrent = ctx.entities()?.child_ids(parent_id).len() > 1;
    let execution = ctx.entities()?.execution_mut(execution_id)?;
    execution.set_state(ExecutionState::Active)?;
    execution.is_active = true;
    execution.is_concurrent = concurrent;
    Ok(())
}

/// Join at an inclusive gateway unless another execution may still arrive
///
/// Returns whether the join fired.
fn try_inclusive_join(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    execution_id: Uuid,
    gateway: &str,
) -> Result<bool, EngineError> {
    let parent_id = ctx
        .entities()?
        .execution(execution_id)?
        .parent_id
        .ok_or_else(|| EngineError::illegal_state("the root execution cannot wait at a gateway"))?;

    let session = ctx.entities()?;
    let mut waiting = Vec::new();
    for id in session.child_ids(parent_id) {
        let sibling = session.execution(id)?;
        let parked = !sibling.is_active && sibling.activity_id.as_deref() == Some(gateway);
        if parked {
            waiting.push(id);
            continue;
        }
        let may_arrive = sibling
            .activity_id
            .as_deref()
            .is_some_and(|at| at == gateway || definition.is_reachable(at, gateway));
        if may_arrive {
            trace!(%execution_id, gateway, blocking = %id, "inclusive gateway waiting");
            return Ok(false);
        }
    }

    for other in waiting.iter().filter(|id| **id != execution_id) {
        tree::remove_tree(ctx, *other, false)?;
    }
    debug!(%execution_id, gateway, joined = waiting.len(), "inclusive gateway joined");
    activate(ctx, execution_id, parent_id)?;
    ctx.plan(Operation::TakeOutgoingSequenceFlows {
        execution_id,
        selection: FlowSelection::Conditional,
    });
    Ok(true)
}

/// Re-check every inclusive join of an instance
///
/// Runs after each agenda drain that touched the instance: an execution that
/// ended elsewhere may have been the last one able to reach a waiting join.
pub(crate) fn execute_inactive_behaviors(
    ctx: &mut CommandContext,
    process_instance_id: Uuid,
) -> Result<(), EngineError> {
    let parked: Vec<(Uuid, Uuid, String, String)> = ctx
        .entities()?
        .executions(process_instance_id)
        .filter(|e| !e.is_active)
        .filter_map(|e| {
            Some((
                e.id,
                e.parent_id?,
                e.activity_id.clone()?,
                e.process_definition_id.clone(),
            ))
        })
        .collect();

    let mut seen = HashSet::new();
    for (execution_id, parent_id, gateway, definition_id) in parked {
        if !seen.insert((parent_id, gateway.clone())) {
            continue;
        }
        if !ctx.entities()?.execution_exists(execution_id) {
            continue;
        }
        let definition = ctx.definition(&definition_id)?;
        let is_inclusive = matches!(
            definition.node(&gateway).map(|n| &n.kind),
            Some(NodeKind::InclusiveGateway)
        );
        if is_inclusive {
            try_inclusive_join(ctx, &definition, execution_id, &gateway)?;
        }
    }
    Ok(())
}
