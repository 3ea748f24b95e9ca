//! Unit-of-work context
//!
//! A [`CommandContext`] owns one logical transaction: the lazily opened
//! sessions, the agenda, the close listeners, the stack of command results and
//! the first captured error. It is passed explicitly (`&mut`) to everything
//! that runs inside the unit of work; nested commands receive the same handle.

mod listener;
mod session;

pub use listener::CloseListener;
pub(crate) use listener::JobAddedNotification;
pub use session::{Session, SessionFactory};

use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::agenda::{self, Agenda, Operation};
use crate::command::{Command, CommandConfig, CommandExecutor, DynCommand, Propagation};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::{EngineEvent, EventSession};
use crate::model::ProcessDefinition;
use crate::persistence::EntitySession;

/// Output slot of a command run through the agenda
type CommandOutput = Box<dyn Any + Send>;

#[derive(Debug, Clone, Copy)]
enum ClosePhase {
    Closing,
    AfterSessionFlush,
    Closed,
    CloseFailure,
}

/// State of one unit of work
pub struct CommandContext {
    config: Arc<EngineConfig>,
    executor: CommandExecutor,
    command_name: &'static str,

    sessions: HashMap<TypeId, Box<dyn Session>>,
    /// Open order; flush and close follow it
    session_order: Vec<TypeId>,

    agenda: Agenda,
    close_listeners: Vec<Box<dyn CloseListener>>,
    listener_keys: HashSet<&'static str>,

    exception: Option<EngineError>,
    results: Vec<Option<CommandOutput>>,

    involved_executions: BTreeSet<Uuid>,
    /// Instances touched since inactive behaviors were last evaluated
    pending_instances: BTreeSet<Uuid>,

    nesting_depth: usize,
    rollback_only: bool,
}

impl CommandContext {
    pub(crate) fn new(executor: CommandExecutor, command_name: &'static str) -> Self {
        Self {
            config: Arc::clone(executor.config()),
            executor,
            command_name,
            sessions: HashMap::new(),
            session_order: Vec::new(),
            agenda: Agenda::default(),
            close_listeners: Vec::new(),
            listener_keys: HashSet::new(),
            exception: None,
            results: Vec::new(),
            involved_executions: BTreeSet::new(),
            pending_instances: BTreeSet::new(),
            nesting_depth: 0,
            rollback_only: false,
        }
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Name of the top-level command of this unit of work
    pub fn command_name(&self) -> &'static str {
        self.command_name
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.config.clock().now()
    }

    pub fn definition(&self, id: &str) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.config
            .deployments()
            .get(id)
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Session of type `S`, opened on first request
    pub fn session<S: Session>(&mut self) -> Result<&mut S, EngineError> {
        let type_id = TypeId::of::<S>();
        if !self.sessions.contains_key(&type_id) {
            let factory = self.config.session_factory(type_id).ok_or_else(|| {
                EngineError::Configuration(format!(
                    "no session factory registered for {}",
                    std::any::type_name::<S>()
                ))
            })?;
            trace!(session = std::any::type_name::<S>(), "opening session");
            let session = factory.open(&self.config);
            self.sessions.insert(type_id, session);
            self.session_order.push(type_id);
        }

        self.sessions
            .get_mut(&type_id)
            .and_then(|s| s.as_any_mut().downcast_mut::<S>())
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "session factory for {} opened a different session type",
                    std::any::type_name::<S>()
                ))
            })
    }

    pub fn entities(&mut self) -> Result<&mut EntitySession, EngineError> {
        self.session::<EntitySession>()
    }

    /// Record an event for dispatch after commit
    pub fn emit(&mut self, event: EngineEvent) {
        match self.session::<EventSession>() {
            Ok(session) => session.record(event),
            Err(err) => warn!(error = %err, "engine event dropped"),
        }
    }

    // =========================================================================
    // Agenda
    // =========================================================================

    pub fn plan(&mut self, operation: Operation) {
        trace!(operation = operation.name(), "planning operation");
        self.agenda.plan(operation);
    }

    pub fn agenda(&self) -> &Agenda {
        &self.agenda
    }

    /// Executions touched by the operations run so far
    pub fn involved_executions(&self) -> impl Iterator<Item = &Uuid> + '_ {
        self.involved_executions.iter()
    }

    /// Run the agenda until it is empty
    ///
    /// Operations bound to an execution that no longer exists are skipped. On
    /// the first failing operation the remaining agenda is discarded.
    pub(crate) fn drain(&mut self) -> BoxFuture<'_, Result<(), EngineError>> {
        async move {
            while let Some(operation) = self.agenda.next_operation() {
                if let Some(execution_id) = operation.execution_id() {
                    let process_instance_id = match self.entities()?.execution(execution_id) {
                        Ok(execution) => execution.process_instance_id,
                        Err(_) => {
                            trace!(
                                operation = operation.name(),
                                %execution_id,
                                "skipping operation for removed execution"
                            );
                            continue;
                        }
                    };
                    self.involved_executions.insert(execution_id);
                    self.pending_instances.insert(process_instance_id);
                }

                trace!(operation = operation.name(), "running operation");
                if let Err(err) = agenda::run_operation(self, operation).await {
                    self.agenda.clear();
                    return Err(err);
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Re-evaluate waiting joins of every touched instance until nothing moves
    async fn execute_inactive_behaviors(&mut self) -> Result<(), EngineError> {
        loop {
            let instances = std::mem::take(&mut self.pending_instances);
            if instances.is_empty() {
                return Ok(());
            }
            for process_instance_id in instances {
                self.agenda
                    .plan(Operation::ExecuteInactiveBehaviors { process_instance_id });
            }
            self.drain().await?;
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn push_result_slot(&mut self) -> usize {
        self.results.push(None);
        self.results.len() - 1
    }

    pub(crate) fn set_result(&mut self, slot: usize, output: CommandOutput) {
        if let Some(entry) = self.results.get_mut(slot) {
            *entry = Some(output);
        }
    }

    fn take_result(&mut self, slot: usize) -> Option<CommandOutput> {
        let output = self.results.get_mut(slot).and_then(Option::take);
        self.results.truncate(slot);
        output
    }

    /// Run a top-level command in this (fresh) context and close it
    pub(crate) async fn run(mut self, command: Arc<dyn DynCommand>) -> Result<CommandOutput, EngineError> {
        let slot = self.push_result_slot();
        self.agenda.plan(Operation::Command { command, slot });

        if let Err(err) = self.drain().await {
            self.exception(err);
        }
        if self.exception.is_none() {
            if let Err(err) = self.execute_inactive_behaviors().await {
                self.exception(err);
            }
        }

        self.close().await?;
        self.take_result(slot)
            .ok_or_else(|| EngineError::illegal_state("command produced no result"))
    }

    /// Execute a command from inside a running command
    ///
    /// `Required` runs it in this unit of work: when the agenda is idle the
    /// command is planned and drained here, otherwise it executes directly
    /// and its operations join the current agenda. A failure marks this unit
    /// of work rollback-only. `RequiresNew` runs it through the executor in an
    /// independent unit of work that commits on its own.
    pub fn execute_nested<C: Command>(
        &mut self,
        command: C,
        propagation: Propagation,
    ) -> BoxFuture<'_, Result<C::Output, EngineError>> {
        async move {
            match propagation {
                Propagation::RequiresNew => {
                    let executor = self.executor.clone();
                    executor
                        .execute_with(CommandConfig::requires_new(), command)
                        .await
                }
                Propagation::Required => {
                    debug!(
                        command = command.name(),
                        depth = self.nesting_depth + 1,
                        "executing nested command in current unit of work"
                    );
                    self.nesting_depth += 1;
                    let result = if self.agenda.is_empty() {
                        let slot = self.push_result_slot();
                        self.agenda.plan(Operation::Command {
                            command: Arc::new(command),
                            slot,
                        });
                        let drained = self.drain().await;
                        let output = self.take_result(slot);
                        drained.and_then(|_| downcast_output::<C::Output>(output))
                    } else {
                        command.execute(self).await
                    };
                    self.nesting_depth -= 1;

                    if result.is_err() {
                        self.rollback_only = true;
                    }
                    result
                }
            }
        }
        .boxed()
    }

    // =========================================================================
    // Errors and close
    // =========================================================================

    /// Capture an error; only the first one is kept and rethrown at close
    pub fn exception(&mut self, err: EngineError) {
        if self.exception.is_some() {
            warn!(
                command = self.command_name,
                error = %err,
                "error after the unit of work already failed; ignoring"
            );
            return;
        }
        if err.is_optimistic_lock() {
            debug!(command = self.command_name, error = %err, "optimistic lock conflict");
        } else {
            error!(command = self.command_name, error = %err, "error while executing command");
        }
        self.exception = Some(err);
    }

    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }

    pub fn add_close_listener(&mut self, listener: Box<dyn CloseListener>) {
        self.close_listeners.push(listener);
    }

    /// Register a listener unless one under the same key already is
    pub fn add_close_listener_once(
        &mut self,
        key: &'static str,
        listener: impl FnOnce() -> Box<dyn CloseListener>,
    ) {
        if self.listener_keys.insert(key) {
            self.close_listeners.push(listener());
        }
    }

    fn fire_close_listeners(&mut self, phase: ClosePhase) {
        let mut listeners = std::mem::take(&mut self.close_listeners);
        let mut failures = Vec::new();
        for listener in &mut listeners {
            let result = match phase {
                ClosePhase::Closing => listener.closing(self),
                ClosePhase::AfterSessionFlush => listener.after_session_flush(self),
                ClosePhase::Closed => listener.closed(self),
                ClosePhase::CloseFailure => {
                    listener.close_failure(self);
                    Ok(())
                }
            };
            if let Err(err) = result {
                failures.push(err);
            }
        }
        // Listeners registered while firing stay registered
        listeners.append(&mut self.close_listeners);
        self.close_listeners = listeners;

        for err in failures {
            self.exception(err);
        }
    }

    async fn flush_sessions(&mut self) -> Result<(), EngineError> {
        for type_id in self.session_order.clone() {
            if let Some(session) = self.sessions.get_mut(&type_id) {
                session.flush().await?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        if self.rollback_only && self.exception.is_none() {
            self.exception(EngineError::illegal_state(
                "unit of work marked rollback-only by a failed nested command",
            ));
        }

        self.fire_close_listeners(ClosePhase::Closing);
        if self.exception.is_none() {
            if let Err(err) = self.flush_sessions().await {
                self.exception(err);
            }
        }
        let committed = self.exception.is_none();

        if committed {
            self.fire_close_listeners(ClosePhase::AfterSessionFlush);
        }
        if self.exception.is_none() {
            self.fire_close_listeners(ClosePhase::Closed);
        } else {
            self.fire_close_listeners(ClosePhase::CloseFailure);
        }

        for type_id in std::mem::take(&mut self.session_order) {
            if let Some(mut session) = self.sessions.remove(&type_id) {
                session.close(committed).await;
            }
        }

        match self.exception.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn downcast_output<T: 'static>(output: Option<CommandOutput>) -> Result<T, EngineError> {
    output
        .and_then(|boxed| boxed.downcast::<T>().ok())
        .map(|boxed| *boxed)
        .ok_or_else(|| EngineError::illegal_state("nested command produced no result"))
}
