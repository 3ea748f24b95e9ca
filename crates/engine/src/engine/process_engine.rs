//! Process engine facade
//!
//! Every mutating operation is a command run through the interceptor chain
//! in its own unit of work. Queries read committed state from the store
//! directly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::command::{
    CommandExecutor, CompleteTask, CorrelateMessage, DeleteJob, DeleteProcessInstance,
    GetVariables, MoveDeadLetterJobToExecutable, ScheduleAsync, ScheduleTimer, SetJobRetries,
    SetVariables, SignalEventReceived, StartProcessInstance, TriggerEvent,
};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::job;
use crate::model::ProcessDefinition;
use crate::persistence::{
    EntityKind, EventSubscription, Execution, Job, JobQuery, ProcessInstance, Variables,
};
use crate::worker::{AsyncExecutor, AsyncExecutorConfig};

/// Entry point for embedding the runtime
///
/// # Example
///
/// ```ignore
/// let engine = ProcessEngine::new(
///     EngineConfig::builder(Arc::new(InMemoryStore::new()))
///         .with_delegate_fn("approve", |execution| {
///             execution.set_variable("approved", true);
///             Ok(())
///         })
///         .build(),
/// );
///
/// engine.deploy(definition)?;
/// let instance = engine
///     .start_process_instance(StartProcessInstance::by_key("approval"))
///     .await?;
/// ```
#[derive(Clone, Debug)]
pub struct ProcessEngine {
    config: Arc<EngineConfig>,
    executor: CommandExecutor,
}

impl ProcessEngine {
    pub fn new(config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let executor = CommandExecutor::new(Arc::clone(&config));
        Self { config, executor }
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Validate and deploy a definition
    pub fn deploy(&self, definition: ProcessDefinition) -> Result<Arc<ProcessDefinition>, EngineError> {
        Ok(self.config.deployments().deploy(definition)?)
    }

    // ===== Runtime =====

    /// Start an instance and run it until every path waits or ends
    #[instrument(skip(self, command))]
    pub async fn start_process_instance(
        &self,
        command: StartProcessInstance,
    ) -> Result<ProcessInstance, EngineError> {
        let id = self.executor.execute(command).await?;
        self.process_instance(id)
            .await?
            .ok_or_else(|| EngineError::not_found(EntityKind::ProcessInstance, id))
    }

    pub async fn trigger_event(
        &self,
        execution_id: Uuid,
        event_name: impl Into<String>,
        payload: Option<Variables>,
    ) -> Result<(), EngineError> {
        self.executor
            .execute(TriggerEvent {
                execution_id,
                event_name: event_name.into(),
                payload,
            })
            .await
    }

    /// Complete the user task the execution waits in
    pub async fn complete_task(
        &self,
        execution_id: Uuid,
        variables: Variables,
    ) -> Result<(), EngineError> {
        self.executor
            .execute(CompleteTask {
                execution_id,
                variables,
            })
            .await
    }

    /// Deliver a message to exactly one waiting subscription
    ///
    /// Returns the process instance that received it.
    pub async fn correlate_message(&self, command: CorrelateMessage) -> Result<Uuid, EngineError> {
        self.executor.execute(command).await
    }

    /// Broadcast a signal; returns the number of subscriptions fired
    pub async fn signal_event_received(
        &self,
        command: SignalEventReceived,
    ) -> Result<usize, EngineError> {
        self.executor.execute(command).await
    }

    pub async fn delete_process_instance(
        &self,
        process_instance_id: Uuid,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        self.executor
            .execute(DeleteProcessInstance {
                process_instance_id,
                reason,
            })
            .await
    }

    /// Set variables in the nearest scope that already defines them
    pub async fn set_variables(
        &self,
        execution_id: Uuid,
        variables: Variables,
    ) -> Result<(), EngineError> {
        self.executor
            .execute(SetVariables {
                execution_id,
                variables,
                local: false,
            })
            .await
    }

    pub async fn set_variables_local(
        &self,
        execution_id: Uuid,
        variables: Variables,
    ) -> Result<(), EngineError> {
        self.executor
            .execute(SetVariables {
                execution_id,
                variables,
                local: true,
            })
            .await
    }

    /// Variables visible from an execution, inner scopes shadowing outer ones
    pub async fn get_variables(&self, execution_id: Uuid) -> Result<Variables, EngineError> {
        self.executor.execute(GetVariables { execution_id }).await
    }

    // ===== Jobs =====

    /// Execute a job now, regardless of its due date
    pub async fn execute_job(&self, job_id: Uuid) -> Result<bool, EngineError> {
        job::execute_job(&self.executor, job_id).await
    }

    pub async fn schedule_timer(
        &self,
        due_date: DateTime<Utc>,
        handler_type: impl Into<String>,
        configuration: Value,
        execution_id: Option<Uuid>,
    ) -> Result<Uuid, EngineError> {
        self.executor
            .execute(ScheduleTimer {
                due_date,
                handler_type: handler_type.into(),
                configuration,
                execution_id,
                element_id: None,
            })
            .await
    }

    pub async fn schedule_async(
        &self,
        handler_type: impl Into<String>,
        configuration: Value,
        execution_id: Option<Uuid>,
    ) -> Result<Uuid, EngineError> {
        self.executor
            .execute(ScheduleAsync {
                handler_type: handler_type.into(),
                configuration,
                execution_id,
                element_id: None,
            })
            .await
    }

    pub async fn delete_job(&self, job_id: Uuid) -> Result<(), EngineError> {
        self.executor.execute(DeleteJob { job_id }).await
    }

    /// Set the remaining retries; a dead-letter job given retries becomes executable
    pub async fn set_job_retries(&self, job_id: Uuid, retries: u32) -> Result<(), EngineError> {
        self.executor.execute(SetJobRetries { job_id, retries }).await
    }

    pub async fn move_dead_letter_job_to_executable(
        &self,
        job_id: Uuid,
        retries: u32,
    ) -> Result<Job, EngineError> {
        self.executor
            .execute(MoveDeadLetterJobToExecutable { job_id, retries })
            .await
    }

    /// Background executor acquiring this engine's jobs
    pub fn async_executor(&self, config: AsyncExecutorConfig) -> AsyncExecutor {
        AsyncExecutor::new(self.executor.clone(), config)
    }

    // ===== Queries =====

    pub async fn process_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>, EngineError> {
        Ok(self.config.store().find_process_instance(id).await?)
    }

    /// Every execution of an instance, the root included
    pub async fn executions(&self, process_instance_id: Uuid) -> Result<Vec<Execution>, EngineError> {
        Ok(self
            .config
            .store()
            .executions_by_process_instance(process_instance_id)
            .await?)
    }

    /// Executions currently positioned at a flow node
    pub async fn executions_at(
        &self,
        process_instance_id: Uuid,
        activity_id: &str,
    ) -> Result<Vec<Execution>, EngineError> {
        let mut executions = self.executions(process_instance_id).await?;
        executions.retain(|e| e.activity_id.as_deref() == Some(activity_id));
        Ok(executions)
    }

    pub async fn subscriptions(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<EventSubscription>, EngineError> {
        Ok(self
            .config
            .store()
            .subscriptions_by_process_instance(process_instance_id)
            .await?)
    }

    pub async fn jobs(&self, query: &JobQuery) -> Result<Vec<Job>, EngineError> {
        Ok(self.config.store().find_jobs(query).await?)
    }

    pub async fn job(&self, id: Uuid) -> Result<Option<Job>, EngineError> {
        Ok(self.config.store().find_job(id).await?)
    }
}
