//! Events, tasks and sub-processes

use async_trait::async_trait;
use tracing::debug;

use super::delegate::{DelegateError, DelegateExecution};
use super::event::create_scope_event_listeners;
use super::{ActivityBehavior, ActivityScope};
use crate::agenda::{FlowSelection, Operation};
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::model::{EndResult, NodeKind};
use crate::persistence::{ExecutionState, ProcessInstanceState, Variables};
use crate::runtime::{propagation, tree, variables};

fn leave(ctx: &mut CommandContext, scope: &ActivityScope<'_>) {
    ctx.plan(Operation::TakeOutgoingSequenceFlows {
        execution_id: scope.execution_id,
        selection: FlowSelection::Conditional,
    });
}

/// Set the payload and leave; shared by every wait state
pub(super) fn resume(
    ctx: &mut CommandContext,
    scope: &ActivityScope<'_>,
    payload: Option<Variables>,
) -> Result<(), EngineError> {
    if let Some(payload) = payload {
        variables::set_variables(ctx, scope.execution_id, payload)?;
    }
    leave(ctx, scope);
    Ok(())
}

pub(super) struct StartEventBehavior;

#[async_trait]
impl ActivityBehavior for StartEventBehavior {
    async fn execute(
        &self,
        ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
    ) -> Result<(), EngineError> {
        leave(ctx, scope);
        Ok(())
    }
}

pub(super) struct EndEventBehavior;

#[async_trait]
impl ActivityBehavior for EndEventBehavior {
    async fn execute(
        &self,
        ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
    ) -> Result<(), EngineError> {
        let NodeKind::EndEvent { result } = &scope.node.kind else {
            return Err(EngineError::illegal_state("end event behavior on another node kind"));
        };

        match result {
            // No outgoing flows: leaving ends the execution
            EndResult::None => {
                leave(ctx, scope);
                Ok(())
            }
            EndResult::Terminate => terminate(ctx, scope),
            EndResult::Error { code } => propagation::throw_error(ctx, scope.execution_id, code),
        }
    }
}

/// End every path of the enclosing scope
fn terminate(ctx: &mut CommandContext, scope: &ActivityScope<'_>) -> Result<(), EngineError> {
    let execution_id = scope.execution_id;
    let execution = ctx.entities()?.execution(execution_id)?.clone();
    let parent_id = execution.parent_id.ok_or_else(|| {
        EngineError::illegal_state("terminate end event reached by the root execution")
    })?;

    ctx.emit(EngineEvent::ActivityCompleted {
        process_instance_id: execution.process_instance_id,
        execution_id,
        activity_id: scope.node.id.clone(),
    });

    if ctx.entities()?.execution(parent_id)?.is_root() {
        return tree::finish_process_instance(
            ctx,
            execution.process_instance_id,
            ProcessInstanceState::Terminated,
            Some(format!("terminate end event '{}'", scope.node.id)),
        );
    }

    debug!(%execution_id, scope_id = %parent_id, "terminating enclosing scope");
    tree::remove_tree(ctx, execution_id, false)?;
    tree::cancel_descendants(ctx, parent_id)?;
    tree::complete_scope(ctx, parent_id)
}

pub(super) struct UserTaskBehavior;

#[async_trait]
impl ActivityBehavior for UserTaskBehavior {
    async fn execute(
        &self,
        ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
    ) -> Result<(), EngineError> {
        let execution = ctx.entities()?.execution_mut(scope.execution_id)?;
        execution.set_state(ExecutionState::Waiting)?;
        let process_instance_id = execution.process_instance_id;

        ctx.emit(EngineEvent::TaskCreated {
            process_instance_id,
            execution_id: scope.execution_id,
            activity_id: scope.node.id.clone(),
        });
        Ok(())
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

pub(super) struct ServiceTaskBehavior;

#[async_trait]
impl ActivityBehavior for ServiceTaskBehavior {
    async fn execute(
        &self,
        ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
    ) -> Result<(), EngineError> {
        let NodeKind::ServiceTask { delegate } = &scope.node.kind else {
            return Err(EngineError::illegal_state("service task behavior on another node kind"));
        };
        let service = ctx.config().delegates().get(delegate).ok_or_else(|| {
            EngineError::Configuration(format!(
                "no service delegate registered as '{delegate}'"
            ))
        })?;

        let execution_id = scope.execution_id;
        let process_instance_id = ctx.entities()?.execution(execution_id)?.process_instance_id;
        let visible = variables::visible(ctx, execution_id)?;
        let mut execution =
            DelegateExecution::new(execution_id, process_instance_id, &scope.node.id, visible);

        debug!(%execution_id, activity_id = %scope.node.id, delegate = %delegate, "calling service delegate");
        match service.execute(&mut execution).await {
            Ok(()) => {
                variables::set_variables(ctx, execution_id, execution.into_changes())?;
                leave(ctx, scope);
                Ok(())
            }
            Err(DelegateError::Bpmn { code, message }) => {
                debug!(%execution_id, error_code = %code, %message, "delegate raised business error");
                propagation::throw_error(ctx, execution_id, &code)
            }
            Err(DelegateError::Failure(message)) => Err(EngineError::Delegate {
                delegate: delegate.clone(),
                message,
            }),
        }
    }
}

pub(super) struct SubProcessBehavior;

#[async_trait]
impl ActivityBehavior for SubProcessBehavior {
    async fn execute(
        &self,
        ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
    ) -> Result<(), EngineError> {
        let sub_process = scope.node.id.as_str();
        let initial = scope
            .definition
            .initial_node(Some(sub_process))
            .ok_or_else(|| {
                EngineError::definition(format!("sub-process '{sub_process}' has no start event"))
            })?;

        ctx.entities()?.execution_mut(scope.execution_id)?.is_scope = true;
        create_scope_event_listeners(ctx, scope.definition, scope.execution_id, Some(sub_process))?;

        let child = tree::create_child(ctx, scope.execution_id, &initial.id)?;
        ctx.plan(Operation::ContinueProcess {
            execution_id: child,
            skip_async: false,
        });
        Ok(())
    }
}

pub(super) struct EventSubProcessBehavior;

#[async_trait]
impl ActivityBehavior for EventSubProcessBehavior {
    async fn execute(
        &self,
        _ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
    ) -> Result<(), EngineError> {
        Err(EngineError::definition(format!(
            "event sub-process '{}' cannot be entered by a sequence flow",
            scope.node.id
        )))
    }
}
