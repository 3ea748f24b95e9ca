//! Engine error taxonomy

use std::error::Error as _;

use uuid::Uuid;

use crate::expression::ExpressionError;
use crate::persistence::{EntityKind, StoreError};

/// Kind of event that found no catching element on its way to the root scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhandledKind {
    BusinessError,
    Message,
    Signal,
}

impl std::fmt::Display for UnhandledKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BusinessError => write!(f, "business error"),
            Self::Message => write!(f, "message"),
            Self::Signal => write!(f, "signal"),
        }
    }
}

/// Errors raised while executing commands
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The process graph cannot route the current execution
    #[error("definition error: {0}")]
    Definition(String),

    /// A process definition failed validation at deploy time
    #[error("invalid process definition: {0}")]
    InvalidDefinition(#[from] crate::model::DefinitionError),

    #[error("process definition not found: {0}")]
    DefinitionNotFound(String),

    /// An event reached the top-level scope without a handler
    #[error("unhandled {kind} '{name}' in process instance {process_instance_id}")]
    UnhandledEvent {
        kind: UnhandledKind,
        name: String,
        process_instance_id: Uuid,
    },

    /// Another unit of work changed or removed the same row
    #[error("optimistic lock conflict on {kind} {id}")]
    OptimisticLock { kind: EntityKind, id: Uuid },

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: Uuid },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    /// A service-task delegate failed with a technical error
    #[error("delegate '{delegate}' failed: {message}")]
    Delegate { delegate: String, message: String },

    /// A job handler failed
    #[error("job handler '{handler}' failed: {message}")]
    JobHandler { handler: String, message: String },

    #[error("no job handler registered for type '{0}'")]
    UnknownJobHandler(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrencyConflict { kind, id, .. } => Self::OptimisticLock { kind, id },
            other => Self::Store(other),
        }
    }
}

impl EngineError {
    /// Whether this is a lost optimistic-locking race
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Self::OptimisticLock { .. })
    }

    /// Whether executing the same work again may succeed
    ///
    /// Definition defects and unhandled events fail the same way on every
    /// attempt; jobs failing with them go straight to the dead-letter state.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Definition(_)
                | Self::InvalidDefinition(_)
                | Self::DefinitionNotFound(_)
                | Self::UnhandledEvent { .. }
                | Self::UnknownJobHandler(_)
                | Self::Configuration(_)
        )
    }

    pub fn definition(message: impl Into<String>) -> Self {
        Self::Definition(message.into())
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    pub fn not_found(kind: EntityKind, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }

    /// Full rendering of the error and its source chain
    ///
    /// Stored as the "stacktrace" of failed jobs.
    pub fn details(&self) -> String {
        let mut details = format!("{self}\n{self:?}");
        let mut source = self.source();
        while let Some(err) = source {
            details.push_str(&format!("\ncaused by: {err}"));
            source = err.source();
        }
        details
    }
}
