//! Flow node behaviors
//!
//! Every [`NodeKind`] maps to one [`ActivityBehavior`]: `execute` runs when an
//! execution enters the node, `trigger` when a waiting execution is resumed.
//! Behaviors never advance the graph themselves; they plan operations.

mod activity;
mod delegate;
mod event;
mod gateway;

pub use delegate::{DelegateError, DelegateExecution, ServiceDelegate};
pub(crate) use event::{
    create_boundary_event_listeners, create_event_listener, create_scope_event_listeners,
};
pub(crate) use gateway::execute_inactive_behaviors;

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::model::{FlowNode, NodeKind, ProcessDefinition};
use crate::persistence::Variables;

/// Node an execution is entering or resumed at
#[derive(Debug, Clone, Copy)]
pub struct ActivityScope<'a> {
    pub definition: &'a ProcessDefinition,
    pub node: &'a FlowNode,
    pub execution_id: Uuid,
}

/// Semantics of one node kind
#[async_trait]
pub trait ActivityBehavior: Send + Sync {
    async fn execute(
        &self,
        ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
    ) -> Result<(), EngineError>;

    /// Resume a waiting execution; only wait states accept triggers
    async fn trigger(
        &self,
        _ctx: &mut CommandContext,
        scope: &ActivityScope<'_>,
        _payload: Option<Variables>,
    ) -> Result<(), EngineError> {
        Err(EngineError::illegal_state(format!(
            "{} '{}' cannot be triggered",
            scope.node.kind.type_name(),
            scope.node.id
        )))
    }
}

static START_EVENT: activity::StartEventBehavior = activity::StartEventBehavior;
static END_EVENT: activity::EndEventBehavior = activity::EndEventBehavior;
static USER_TASK: activity::UserTaskBehavior = activity::UserTaskBehavior;
static SERVICE_TASK: activity::ServiceTaskBehavior = activity::ServiceTaskBehavior;
static SUB_PROCESS: activity::SubProcessBehavior = activity::SubProcessBehavior;
static EVENT_SUB_PROCESS: activity::EventSubProcessBehavior = activity::EventSubProcessBehavior;
static CATCH_EVENT: event::IntermediateCatchEventBehavior = event::IntermediateCatchEventBehavior;
static BOUNDARY_EVENT: event::BoundaryEventBehavior = event::BoundaryEventBehavior;
static EXCLUSIVE_GATEWAY: gateway::ExclusiveGatewayBehavior = gateway::ExclusiveGatewayBehavior;
static PARALLEL_GATEWAY: gateway::ParallelGatewayBehavior = gateway::ParallelGatewayBehavior;
static INCLUSIVE_GATEWAY: gateway::InclusiveGatewayBehavior = gateway::InclusiveGatewayBehavior;
static EVENT_BASED_GATEWAY: gateway::EventBasedGatewayBehavior = gateway::EventBasedGatewayBehavior;

/// Behavior of a node kind
pub fn behavior_for(kind: &NodeKind) -> &'static dyn ActivityBehavior {
    match kind {
        NodeKind::StartEvent { .. } => &START_EVENT,
        NodeKind::EndEvent { .. } => &END_EVENT,
        NodeKind::UserTask => &USER_TASK,
        NodeKind::ServiceTask { .. } => &SERVICE_TASK,
        NodeKind::IntermediateCatchEvent { .. } => &CATCH_EVENT,
        NodeKind::ExclusiveGateway => &EXCLUSIVE_GATEWAY,
        NodeKind::ParallelGateway => &PARALLEL_GATEWAY,
        NodeKind::InclusiveGateway => &INCLUSIVE_GATEWAY,
        NodeKind::EventBasedGateway => &EVENT_BASED_GATEWAY,
        NodeKind::SubProcess => &SUB_PROCESS,
        NodeKind::EventSubProcess => &EVENT_SUB_PROCESS,
        NodeKind::BoundaryEvent { .. } => &BOUNDARY_EVENT,
    }
}
