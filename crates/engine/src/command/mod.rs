//! Commands: the units of work callers submit to the engine
//!
//! A [`Command`] runs inside a [`CommandContext`] opened for it by the
//! [`CommandExecutor`]. Everything it changes commits together when the
//! context closes, or not at all.

mod executor;
mod job;
mod runtime;

pub use executor::{CommandExecutor, Invocation, Next};
pub use job::{
    AcquireJobs, DeleteJob, ExecuteJob, HandleFailedJob, MoveDeadLetterJobToExecutable,
    ScheduleAsync, ScheduleTimer, SetJobRetries, UnacquireOwnedJobs, UnlockJob,
};
pub use runtime::{
    CompleteTask, CorrelateMessage, DefinitionRef, DeleteProcessInstance, GetVariables,
    SetVariables, SignalEventReceived, StartProcessInstance, TriggerEvent,
};

use std::any::Any;

use async_trait::async_trait;

use crate::context::CommandContext;
use crate::error::EngineError;

/// Type-erased command output
pub type CommandOutput = Box<dyn Any + Send>;

/// One unit of work
#[async_trait]
pub trait Command: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Name used in logs
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output, EngineError>;
}

/// Object-safe form of [`Command`] used by the interceptor chain and agenda
#[async_trait]
pub trait DynCommand: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn execute_dyn(&self, ctx: &mut CommandContext) -> Result<CommandOutput, EngineError>;
}

#[async_trait]
impl<C: Command> DynCommand for C {
    fn name(&self) -> &'static str {
        Command::name(self)
    }

    async fn execute_dyn(&self, ctx: &mut CommandContext) -> Result<CommandOutput, EngineError> {
        let output = self.execute(ctx).await?;
        Ok(Box::new(output))
    }
}

/// Transaction propagation of a command call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Propagation {
    /// Join the caller's unit of work
    #[default]
    Required,

    /// Run in an independent unit of work that commits on its own
    RequiresNew,
}

/// Per-call command settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandConfig {
    pub propagation: Propagation,
}

impl CommandConfig {
    pub fn required() -> Self {
        Self {
            propagation: Propagation::Required,
        }
    }

    pub fn requires_new() -> Self {
        Self {
            propagation: Propagation::RequiresNew,
        }
    }
}
