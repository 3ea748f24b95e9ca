//! Event propagation: thrown business errors and fired subscriptions
//!
//! Handlers are searched level by level from the throwing execution towards
//! the root. At each level the candidates are the boundary events of the
//! execution's activity and the event sub-processes of the scope containing
//! that activity. An event sub-process beats a boundary event on the same
//! level; among error handlers an explicit code beats a catch-all, then the
//! higher precedence value, then declaration order.

use tracing::info;
use uuid::Uuid;

use super::{tree, variables};
use crate::agenda::Operation;
use crate::behavior;
use crate::context::CommandContext;
use crate::error::{EngineError, UnhandledKind};
use crate::event::EngineEvent;
use crate::model::{EventDefinition, NodeKind, ProcessDefinition};
use crate::persistence::{EventSubscription, EventType, Execution, ExecutionState, Variables};

/// Handler selected for a thrown error
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ErrorHandler {
    EventSubProcess {
        scope_id: Uuid,
        event_sub_process: String,
        start: String,
    },
    Boundary {
        execution_id: Uuid,
        boundary: String,
    },
}

impl ErrorHandler {
    fn handler_id(&self) -> &str {
        match self {
            Self::EventSubProcess {
                event_sub_process, ..
            } => event_sub_process,
            Self::Boundary { boundary, .. } => boundary,
        }
    }
}

/// Specificity of an error catch: 0 for the exact code, 1 for catch-all
fn error_specificity(catch: Option<&str>, thrown: &str) -> Option<u8> {
    match catch {
        Some(code) if code == thrown => Some(0),
        Some(_) => None,
        None => Some(1),
    }
}

fn declaration_index(definition: &ProcessDefinition, node_id: &str) -> usize {
    definition
        .nodes
        .iter()
        .position(|n| n.id == node_id)
        .unwrap_or(usize::MAX)
}

/// Best error handler on the level of `execution`, if any
pub(crate) fn error_handler_at(
    definition: &ProcessDefinition,
    execution: &Execution,
    code: &str,
) -> Option<ErrorHandler> {
    let node = execution
        .activity_id
        .as_deref()
        .and_then(|id| definition.node(id))?;

    let mut candidates: Vec<((u8, u8, i32, usize), ErrorHandler)> = Vec::new();

    // An event sub-process never catches what is thrown from inside itself
    if let (Some(scope_id), false) = (
        execution.parent_id,
        matches!(node.kind, NodeKind::EventSubProcess),
    ) {
        for esp in definition.event_sub_processes(node.parent.as_deref()) {
            let Some(start) = definition.event_start(&esp.id) else {
                continue;
            };
            if let NodeKind::StartEvent {
                event: Some(EventDefinition::Error { code: catch, precedence }),
                ..
            } = &start.kind
            {
                if let Some(specificity) = error_specificity(catch.as_deref(), code) {
                    candidates.push((
                        (0, specificity, -precedence, declaration_index(definition, &esp.id)),
                        ErrorHandler::EventSubProcess {
                            scope_id,
                            event_sub_process: esp.id.clone(),
                            start: start.id.clone(),
                        },
                    ));
                }
            }
        }
    }

    for boundary in definition.boundary_events(&node.id) {
        if let NodeKind::BoundaryEvent {
            event: EventDefinition::Error { code: catch, precedence },
            ..
        } = &boundary.kind
        {
            if let Some(specificity) = error_specificity(catch.as_deref(), code) {
                candidates.push((
                    (1, specificity, -precedence, declaration_index(definition, &boundary.id)),
                    ErrorHandler::Boundary {
                        execution_id: execution.id,
                        boundary: boundary.id.clone(),
                    },
                ));
            }
        }
    }

    candidates
        .into_iter()
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, handler)| handler)
}

/// Throw a business error from an execution
pub(crate) fn throw_error(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    code: &str,
) -> Result<(), EngineError> {
    let mut current = execution_id;
    loop {
        let execution = ctx.entities()?.execution(current)?.clone();
        let definition = ctx.definition(&execution.process_definition_id)?;

        if let Some(handler) = error_handler_at(&definition, &execution, code) {
            info!(
                process_instance_id = %execution.process_instance_id,
                error_code = code,
                handler = handler.handler_id(),
                "business error caught"
            );
            ctx.emit(EngineEvent::ErrorCaught {
                process_instance_id: execution.process_instance_id,
                error_code: code.to_string(),
                handler_id: handler.handler_id().to_string(),
            });
            return match handler {
                ErrorHandler::EventSubProcess {
                    scope_id,
                    event_sub_process,
                    start,
                } => start_event_sub_process(
                    ctx,
                    &definition,
                    scope_id,
                    &event_sub_process,
                    &start,
                    true,
                    None,
                ),
                ErrorHandler::Boundary {
                    execution_id,
                    boundary,
                } => {
                    tree::interrupt_activity(ctx, execution_id)?;
                    tree::move_to(ctx, execution_id, &boundary)?;
                    ctx.plan(Operation::ContinueProcess {
                        execution_id,
                        skip_async: false,
                    });
                    Ok(())
                }
            };
        }

        match execution.parent_id {
            Some(parent_id) => current = parent_id,
            None => {
                return Err(EngineError::UnhandledEvent {
                    kind: UnhandledKind::BusinessError,
                    name: code.to_string(),
                    process_instance_id: execution.process_instance_id,
                })
            }
        }
    }
}

/// Start an event sub-process inside the scope execution `scope_id`
///
/// An interrupting start cancels everything running in the scope and the
/// scope's other event sub-process listeners first.
pub(crate) fn start_event_sub_process(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    scope_id: Uuid,
    event_sub_process: &str,
    start: &str,
    interrupting: bool,
    payload: Option<Variables>,
) -> Result<(), EngineError> {
    if interrupting {
        tree::cancel_descendants(ctx, scope_id)?;
        remove_event_start_listeners(ctx, definition, scope_id)?;
    }

    let esp_scope = tree::create_child(ctx, scope_id, event_sub_process)?;
    let concurrent = ctx.entities()?.child_ids(scope_id).len() > 1;
    let execution = ctx.entities()?.execution_mut(esp_scope)?;
    execution.is_scope = true;
    execution.is_concurrent = concurrent;
    execution.set_state(ExecutionState::Active)?;
    let process_instance_id = execution.process_instance_id;

    ctx.emit(EngineEvent::ActivityStarted {
        process_instance_id,
        execution_id: esp_scope,
        activity_id: event_sub_process.to_string(),
        activity_type: NodeKind::EventSubProcess.type_name().to_string(),
    });

    if let Some(payload) = payload {
        variables::set_variables(ctx, esp_scope, payload)?;
    }
    behavior::create_scope_event_listeners(ctx, definition, esp_scope, Some(event_sub_process))?;

    let start_execution = tree::create_child(ctx, esp_scope, start)?;
    ctx.plan(Operation::ContinueProcess {
        execution_id: start_execution,
        skip_async: false,
    });
    Ok(())
}

fn is_event_start(definition: &ProcessDefinition, activity_id: &str) -> bool {
    matches!(
        definition.node(activity_id).map(|n| &n.kind),
        Some(NodeKind::StartEvent { event: Some(_), .. })
    )
}

/// Delete the event sub-process start listeners owned by a scope execution
fn remove_event_start_listeners(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    scope_id: Uuid,
) -> Result<(), EngineError> {
    let session = ctx.entities()?;
    for subscription in session.subscriptions_of(scope_id) {
        if is_event_start(definition, &subscription.activity_id) {
            session.delete_subscription(subscription.id);
        }
    }
    for job_id in session.job_ids_of(scope_id) {
        let starts_event_sub_process = session
            .job(job_id)
            .and_then(|job| job.element_id.as_deref())
            .is_some_and(|element| is_event_start(definition, element));
        if starts_event_sub_process {
            session.delete_job(job_id);
        }
    }
    Ok(())
}

/// Rank of a catching node: event sub-process start, boundary event, catch event
pub(crate) fn catch_rank(definition: &ProcessDefinition, activity_id: &str) -> u8 {
    match definition.node(activity_id).map(|n| &n.kind) {
        Some(NodeKind::StartEvent { .. }) => 0,
        Some(NodeKind::BoundaryEvent { .. }) => 1,
        _ => 2,
    }
}

/// Fire the listener of `activity_id` owned by `execution_id`
pub(crate) fn fire_event(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    activity_id: &str,
    payload: Option<Variables>,
) -> Result<(), EngineError> {
    let definition = tree::definition_of(ctx, execution_id)?;
    let node = tree::node(&definition, activity_id)?;

    match &node.kind {
        NodeKind::IntermediateCatchEvent { .. } => {
            tree::remove_event_listeners(ctx, execution_id)?;
            let current = ctx.entities()?.execution(execution_id)?.activity_id.clone();
            if current.as_deref() != Some(activity_id) {
                // Waiting at an event-based gateway: this event decides the path
                tree::move_to(ctx, execution_id, activity_id)?;
            }
            ctx.plan(Operation::TriggerExecution {
                execution_id,
                payload,
            });
        }
        NodeKind::BoundaryEvent {
            cancel_activity: true,
            ..
        } => {
            tree::interrupt_activity(ctx, execution_id)?;
            tree::move_to(ctx, execution_id, activity_id)?;
            if let Some(payload) = payload {
                variables::set_variables(ctx, execution_id, payload)?;
            }
            ctx.plan(Operation::ContinueProcess {
                execution_id,
                skip_async: false,
            });
        }
        NodeKind::BoundaryEvent {
            cancel_activity: false,
            ..
        } => {
            let sibling = tree::create_concurrent_sibling(ctx, execution_id, activity_id)?;
            if let Some(payload) = payload {
                variables::set_variables(ctx, sibling, payload)?;
            }
            ctx.plan(Operation::ContinueProcess {
                execution_id: sibling,
                skip_async: false,
            });
        }
        NodeKind::StartEvent {
            event: Some(_),
            interrupting,
        } => {
            let event_sub_process = node.parent.as_deref().ok_or_else(|| {
                EngineError::definition(format!(
                    "triggered start event '{activity_id}' is not inside an event sub-process"
                ))
            })?;
            start_event_sub_process(
                ctx,
                &definition,
                execution_id,
                event_sub_process,
                activity_id,
                *interrupting,
                payload,
            )?;
        }
        other => {
            return Err(EngineError::definition(format!(
                "'{activity_id}' ({}) cannot catch events",
                other.type_name()
            )))
        }
    }
    Ok(())
}

/// Best subscription for a named event on the level of `execution`
fn subscription_at(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    execution: &Execution,
    event_name: &str,
) -> Result<Option<EventSubscription>, EngineError> {
    let session = ctx.entities()?;
    let mut candidates = session.subscriptions_of(execution.id);
    if let Some(parent_id) = execution.parent_id {
        candidates.extend(
            session
                .subscriptions_of(parent_id)
                .into_iter()
                .filter(|s| catch_rank(definition, &s.activity_id) == 0),
        );
    }

    Ok(candidates
        .into_iter()
        .filter(|s| s.event_name == event_name)
        .min_by_key(|s| (catch_rank(definition, &s.activity_id), s.id)))
}

/// Deliver a named event to an execution or the nearest enclosing listener
pub(crate) fn trigger_event(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    event_name: &str,
    payload: Option<Variables>,
) -> Result<(), EngineError> {
    let mut current = execution_id;
    loop {
        let execution = ctx.entities()?.execution(current)?.clone();
        let definition = ctx.definition(&execution.process_definition_id)?;

        if let Some(subscription) = subscription_at(ctx, &definition, &execution, event_name)? {
            return fire_event(
                ctx,
                subscription.execution_id,
                &subscription.activity_id,
                payload,
            );
        }

        match execution.parent_id {
            Some(parent_id) => current = parent_id,
            None => {
                return Err(EngineError::UnhandledEvent {
                    kind: unhandled_kind(ctx, execution.process_instance_id, event_name)?,
                    name: event_name.to_string(),
                    process_instance_id: execution.process_instance_id,
                })
            }
        }
    }
}

/// Kind of an undelivered event, taken from any same-named subscription of the
/// instance; an event nobody subscribes to is reported as a message
fn unhandled_kind(
    ctx: &mut CommandContext,
    process_instance_id: Uuid,
    event_name: &str,
) -> Result<UnhandledKind, EngineError> {
    Ok(ctx
        .entities()?
        .subscriptions_in(process_instance_id)
        .into_iter()
        .find(|s| s.event_name == event_name)
        .map_or(UnhandledKind::Message, |s| match s.event_type {
            EventType::Message => UnhandledKind::Message,
            EventType::Signal => UnhandledKind::Signal,
        }))
}
