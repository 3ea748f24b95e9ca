//! # BPMN-style process execution runtime
//!
//! Executes deployed process graphs: tokens move through an execution tree,
//! wait in subscriptions and jobs, and every external trigger runs as one
//! atomic unit of work.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ProcessEngine                          │
//! │  (deploy, start, correlate, signal, jobs, queries)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ Command
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          CommandExecutor + interceptor chain                 │
//! │  (log, optimistic-lock retry, user interceptors)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CommandContext                            │
//! │  (agenda drain, entity session, close listeners, events)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ one ChangeSet per unit of work
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │           RuntimeStore (in-memory or PostgreSQL)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ AcquireJobs / ExecuteJob
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      AsyncExecutor                           │
//! │  (timers, async continuations, retries, dead letters)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use bpmflow_engine::prelude::*;
//!
//! let engine = ProcessEngine::new(
//!     EngineConfig::builder(Arc::new(InMemoryStore::new())).build(),
//! );
//!
//! engine.deploy(
//!     ProcessDefinitionBuilder::new("approval")
//!         .start_event("start")
//!         .user_task("review")
//!         .end_event("end")
//!         .flow("start", "review")
//!         .flow("review", "end")
//!         .build()?,
//! )?;
//!
//! let instance = engine
//!     .start_process_instance(StartProcessInstance::by_key("approval"))
//!     .await?;
//! let review = engine.executions_at(instance.id, "review").await?;
//! engine.complete_task(review[0].id, Variables::new()).await?;
//! ```

pub mod agenda;
pub mod behavior;
pub mod clock;
pub mod command;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod expression;
pub mod interceptor;
pub mod job;
pub mod model;
pub mod persistence;
pub mod reliability;
mod runtime;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::behavior::{DelegateError, DelegateExecution, ServiceDelegate};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::command::{
        Command, CommandConfig, CommandExecutor, CorrelateMessage, Propagation,
        SignalEventReceived, StartProcessInstance,
    };
    pub use crate::config::{EngineConfig, EngineConfigBuilder};
    pub use crate::engine::ProcessEngine;
    pub use crate::error::{EngineError, UnhandledKind};
    pub use crate::event::{EngineEvent, EngineEventListener};
    pub use crate::interceptor::CommandInterceptor;
    pub use crate::job::JobHandler;
    pub use crate::model::{EventDefinition, ProcessDefinition, ProcessDefinitionBuilder, TimerDefinition};
    pub use crate::persistence::{
        ExecutionState, InMemoryStore, JobQuery, JobState, PostgresStore, ProcessInstanceState,
        RuntimeStore, Variables,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{AsyncExecutor, AsyncExecutorConfig};
}

// Re-export key types at crate root
pub use config::{EngineConfig, EngineConfigBuilder};
pub use engine::ProcessEngine;
pub use error::EngineError;
pub use persistence::{InMemoryStore, PostgresStore, RuntimeStore, StoreError};
pub use reliability::RetryPolicy;
pub use worker::{AsyncExecutor, AsyncExecutorConfig, AsyncExecutorError};
