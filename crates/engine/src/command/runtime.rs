//! Commands driving process instances

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::Command;
use crate::agenda::Operation;
use crate::behavior::create_scope_event_listeners;
use crate::context::CommandContext;
use crate::error::{EngineError, UnhandledKind};
use crate::event::EngineEvent;
use crate::model::{NodeKind, ProcessDefinition};
use crate::persistence::{
    EntityKind, EventSubscription, Execution, ExecutionState, ProcessInstance,
    ProcessInstanceState, SubscriptionQuery, Variables,
};
use crate::runtime::{propagation, tree, variables};

/// Load the instance owning `execution_id`, failing if the execution is gone
async fn load_execution(ctx: &mut CommandContext, execution_id: Uuid) -> Result<Uuid, EngineError> {
    ctx.entities()?
        .load_execution(execution_id)
        .await?
        .ok_or_else(|| EngineError::not_found(EntityKind::Execution, execution_id))
}

// =============================================================================
// Start
// =============================================================================

/// How to pick the definition of a new instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionRef {
    Id(String),
    /// Latest deployed version of the key
    Key(String),
}

/// Start a process instance at the initial node of its definition
#[derive(Debug, Clone)]
pub struct StartProcessInstance {
    definition: DefinitionRef,
    business_key: Option<String>,
    variables: Variables,
}

impl StartProcessInstance {
    pub fn by_key(key: impl Into<String>) -> Self {
        Self {
            definition: DefinitionRef::Key(key.into()),
            business_key: None,
            variables: Variables::new(),
        }
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            definition: DefinitionRef::Id(id.into()),
            business_key: None,
            variables: Variables::new(),
        }
    }

    pub fn with_business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    fn resolve(&self, ctx: &CommandContext) -> Result<Arc<ProcessDefinition>, EngineError> {
        match &self.definition {
            DefinitionRef::Id(id) => ctx.definition(id),
            DefinitionRef::Key(key) => ctx
                .config()
                .deployments()
                .latest(key)
                .ok_or_else(|| EngineError::DefinitionNotFound(key.clone())),
        }
    }
}

#[async_trait]
impl Command for StartProcessInstance {
    type Output = Uuid;

    fn name(&self) -> &'static str {
        "StartProcessInstance"
    }

    #[instrument(skip_all, fields(definition = ?self.definition))]
    async fn execute(&self, ctx: &mut CommandContext) -> Result<Uuid, EngineError> {
        let definition = self.resolve(ctx)?;
        let initial = definition
            .initial_node(None)
            .ok_or_else(|| {
                EngineError::definition(format!("'{}' has no start event", definition.id))
            })?
            .id
            .clone();

        let id = Uuid::now_v7();
        let now = ctx.now();
        let session = ctx.entities()?;
        session.insert_process_instance(ProcessInstance {
            id,
            process_definition_id: definition.id.clone(),
            business_key: self.business_key.clone(),
            tenant_id: definition.tenant_id.clone(),
            state: ProcessInstanceState::Active,
            start_time: now,
            end_time: None,
            end_reason: None,
            version: 0,
        })?;
        session.insert_execution(Execution {
            id,
            process_instance_id: id,
            parent_id: None,
            process_definition_id: definition.id.clone(),
            activity_id: None,
            is_scope: true,
            is_concurrent: false,
            is_active: true,
            state: ExecutionState::Active,
            variables: self.variables.clone(),
            tenant_id: definition.tenant_id.clone(),
            created_at: now,
            version: 0,
        })?;

        info!(
            process_instance_id = %id,
            definition_id = %definition.id,
            business_key = ?self.business_key,
            "starting process instance"
        );
        ctx.emit(EngineEvent::ProcessStarted {
            process_instance_id: id,
            process_definition_id: definition.id.clone(),
            business_key: self.business_key.clone(),
        });

        create_scope_event_listeners(ctx, &definition, id, None)?;
        let child = tree::create_child(ctx, id, &initial)?;
        ctx.plan(Operation::ContinueProcess {
            execution_id: child,
            skip_async: false,
        });
        Ok(id)
    }
}

// =============================================================================
// Events and tasks
// =============================================================================

/// Deliver a named event to an execution or its nearest enclosing listener
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub execution_id: Uuid,
    pub event_name: String,
    pub payload: Option<Variables>,
}

#[async_trait]
impl Command for TriggerEvent {
    type Output = ();

    fn name(&self) -> &'static str {
        "TriggerEvent"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        load_execution(ctx, self.execution_id).await?;
        propagation::trigger_event(ctx, self.execution_id, &self.event_name, self.payload.clone())
    }
}

/// Complete the user task an execution waits at
#[derive(Debug, Clone)]
pub struct CompleteTask {
    pub execution_id: Uuid,
    pub variables: Variables,
}

#[async_trait]
impl Command for CompleteTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "CompleteTask"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        load_execution(ctx, self.execution_id).await?;
        let definition = tree::definition_of(ctx, self.execution_id)?;
        let activity_id = tree::activity_of(ctx, self.execution_id)?;
        let node = tree::node(&definition, &activity_id)?;
        if !matches!(node.kind, NodeKind::UserTask) {
            return Err(EngineError::illegal_state(format!(
                "execution {} is at {} '{}', not a user task",
                self.execution_id,
                node.kind.type_name(),
                activity_id
            )));
        }

        debug!(execution_id = %self.execution_id, %activity_id, "completing user task");
        let payload = (!self.variables.is_empty()).then(|| self.variables.clone());
        ctx.plan(Operation::TriggerExecution {
            execution_id: self.execution_id,
            payload,
        });
        Ok(())
    }
}

/// Correlate a message to the one process instance waiting for it
///
/// Within that instance an event sub-process start wins over a boundary
/// event, which wins over a catch event; ties go to the oldest subscription.
#[derive(Debug, Clone)]
pub struct CorrelateMessage {
    pub message_name: String,
    pub business_key: Option<String>,
    pub process_instance_id: Option<Uuid>,
    pub payload: Option<Variables>,
}

impl CorrelateMessage {
    pub fn new(message_name: impl Into<String>) -> Self {
        Self {
            message_name: message_name.into(),
            business_key: None,
            process_instance_id: None,
            payload: None,
        }
    }

    pub fn with_business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    pub fn with_process_instance(mut self, process_instance_id: Uuid) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn with_payload(mut self, payload: Variables) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Live subscriptions matching a query, as seen by this unit of work
///
/// The store finds candidate instances; each is loaded so that changes made
/// earlier in the same unit of work are taken into account.
async fn matching_subscriptions(
    ctx: &mut CommandContext,
    query: SubscriptionQuery,
    business_key: Option<&str>,
) -> Result<Vec<EventSubscription>, EngineError> {
    let store = Arc::clone(ctx.entities()?.store());
    let mut instances: BTreeSet<Uuid> = store
        .find_subscriptions(&query)
        .await?
        .into_iter()
        .map(|s| s.process_instance_id)
        .collect();
    instances.extend(query.process_instance_id);

    let mut matches = Vec::new();
    for process_instance_id in instances {
        let session = ctx.entities()?;
        session.load_process_instance(process_instance_id).await?;
        if let Some(key) = business_key {
            let instance = session.process_instance(process_instance_id)?;
            if instance.business_key.as_deref() != Some(key) {
                continue;
            }
        }
        matches.extend(
            session
                .subscriptions_in(process_instance_id)
                .into_iter()
                .filter(|s| query.matches(s)),
        );
    }
    matches.sort_by_key(|s| s.id);
    Ok(matches)
}

#[async_trait]
impl Command for CorrelateMessage {
    type Output = Uuid;

    fn name(&self) -> &'static str {
        "CorrelateMessage"
    }

    #[instrument(skip_all, fields(message = %self.message_name))]
    async fn execute(&self, ctx: &mut CommandContext) -> Result<Uuid, EngineError> {
        let mut query = SubscriptionQuery::messages(&self.message_name);
        if let Some(process_instance_id) = self.process_instance_id {
            query = query.in_process_instance(process_instance_id);
        }
        let candidates =
            matching_subscriptions(ctx, query, self.business_key.as_deref()).await?;

        let instances: BTreeSet<Uuid> = candidates.iter().map(|s| s.process_instance_id).collect();
        match instances.len() {
            0 => {
                return Err(EngineError::UnhandledEvent {
                    kind: UnhandledKind::Message,
                    name: self.message_name.clone(),
                    process_instance_id: self.process_instance_id.unwrap_or_else(Uuid::nil),
                })
            }
            1 => {}
            n => {
                return Err(EngineError::illegal_state(format!(
                    "message '{}' correlates to {n} process instances",
                    self.message_name
                )))
            }
        }

        let mut ranked = Vec::with_capacity(candidates.len());
        for subscription in candidates {
            let definition = tree::definition_of(ctx, subscription.execution_id)?;
            let rank = propagation::catch_rank(&definition, &subscription.activity_id);
            ranked.push((rank, subscription));
        }
        let Some((_, chosen)) = ranked.into_iter().min_by_key(|(rank, s)| (*rank, s.id)) else {
            return Err(EngineError::illegal_state("no subscription left to correlate"));
        };

        debug!(
            subscription_id = %chosen.id,
            execution_id = %chosen.execution_id,
            activity_id = %chosen.activity_id,
            "message correlated"
        );
        propagation::fire_event(
            ctx,
            chosen.execution_id,
            &chosen.activity_id,
            self.payload.clone(),
        )?;
        Ok(chosen.process_instance_id)
    }
}

/// Broadcast a signal to every subscription of that name
///
/// Returns how many subscriptions fired. A broadcast nobody listens to is
/// not an error; a signal scoped to one instance that has no listener is.
#[derive(Debug, Clone)]
pub struct SignalEventReceived {
    pub signal_name: String,
    pub process_instance_id: Option<Uuid>,
    pub payload: Option<Variables>,
}

impl SignalEventReceived {
    pub fn new(signal_name: impl Into<String>) -> Self {
        Self {
            signal_name: signal_name.into(),
            process_instance_id: None,
            payload: None,
        }
    }

    pub fn with_process_instance(mut self, process_instance_id: Uuid) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn with_payload(mut self, payload: Variables) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[async_trait]
impl Command for SignalEventReceived {
    type Output = usize;

    fn name(&self) -> &'static str {
        "SignalEventReceived"
    }

    #[instrument(skip_all, fields(signal = %self.signal_name))]
    async fn execute(&self, ctx: &mut CommandContext) -> Result<usize, EngineError> {
        let mut query = SubscriptionQuery::signals(&self.signal_name);
        if let Some(process_instance_id) = self.process_instance_id {
            query = query.in_process_instance(process_instance_id);
        }
        let candidates = matching_subscriptions(ctx, query, None).await?;

        let mut fired = 0;
        for subscription in candidates {
            // An earlier delivery may have cancelled this listener's scope
            let session = ctx.entities()?;
            if session.subscription(subscription.id).is_none()
                || !session.execution_exists(subscription.execution_id)
            {
                continue;
            }
            propagation::fire_event(
                ctx,
                subscription.execution_id,
                &subscription.activity_id,
                self.payload.clone(),
            )?;
            fired += 1;
        }

        if fired == 0 {
            if let Some(process_instance_id) = self.process_instance_id {
                return Err(EngineError::UnhandledEvent {
                    kind: UnhandledKind::Signal,
                    name: self.signal_name.clone(),
                    process_instance_id,
                });
            }
        }
        debug!(fired, "signal delivered");
        Ok(fired)
    }
}

// =============================================================================
// Administration and variables
// =============================================================================

/// Terminate a running instance and remove its runtime tree
#[derive(Debug, Clone)]
pub struct DeleteProcessInstance {
    pub process_instance_id: Uuid,
    pub reason: Option<String>,
}

#[async_trait]
impl Command for DeleteProcessInstance {
    type Output = ();

    fn name(&self) -> &'static str {
        "DeleteProcessInstance"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        let session = ctx.entities()?;
        session.load_process_instance(self.process_instance_id).await?;
        let instance = session.process_instance(self.process_instance_id)?;
        if instance.is_ended() {
            return Err(EngineError::illegal_state(format!(
                "process instance {} already {}",
                self.process_instance_id, instance.state
            )));
        }

        tree::finish_process_instance(
            ctx,
            self.process_instance_id,
            ProcessInstanceState::Terminated,
            Some(
                self.reason
                    .clone()
                    .unwrap_or_else(|| "deleted".to_string()),
            ),
        )
    }
}

/// Write variables through an execution
///
/// Non-local writes update the scope that already defines each name,
/// otherwise the process instance; local writes land on the execution itself.
#[derive(Debug, Clone)]
pub struct SetVariables {
    pub execution_id: Uuid,
    pub variables: Variables,
    pub local: bool,
}

#[async_trait]
impl Command for SetVariables {
    type Output = ();

    fn name(&self) -> &'static str {
        "SetVariables"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        load_execution(ctx, self.execution_id).await?;
        if self.local {
            variables::set_local(ctx, self.execution_id, self.variables.clone())
        } else {
            variables::set_variables(ctx, self.execution_id, self.variables.clone())
        }
    }
}

/// Every variable visible from an execution
#[derive(Debug, Clone)]
pub struct GetVariables {
    pub execution_id: Uuid,
}

#[async_trait]
impl Command for GetVariables {
    type Output = Variables;

    fn name(&self) -> &'static str {
        "GetVariables"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Variables, EngineError> {
        load_execution(ctx, self.execution_id).await?;
        variables::visible(ctx, self.execution_id)
    }
}
