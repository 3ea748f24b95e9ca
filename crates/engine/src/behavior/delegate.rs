//! Service task delegates
//!
//! A service task names a delegate registered on the engine configuration.
//! The delegate works on a [`DelegateExecution`]: a snapshot of the variables
//! visible at the task plus the changes it wants written back.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::persistence::Variables;

/// Outcome of a failed delegate call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DelegateError {
    /// Business error routed to error boundary events and event sub-processes
    #[error("business error {code}: {message}")]
    Bpmn { code: String, message: String },

    /// Technical failure; fails the unit of work (and the job, if any)
    #[error("{0}")]
    Failure(String),
}

impl DelegateError {
    pub fn bpmn(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bpmn {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }
}

/// Code called by a service task
#[async_trait]
pub trait ServiceDelegate: Send + Sync + 'static {
    async fn execute(&self, execution: &mut DelegateExecution) -> Result<(), DelegateError>;
}

/// View of the execution passed to a delegate
#[derive(Debug, Clone)]
pub struct DelegateExecution {
    execution_id: Uuid,
    process_instance_id: Uuid,
    activity_id: String,
    variables: Variables,
    changes: Variables,
}

impl DelegateExecution {
    pub(crate) fn new(
        execution_id: Uuid,
        process_instance_id: Uuid,
        activity_id: impl Into<String>,
        variables: Variables,
    ) -> Self {
        Self {
            execution_id,
            process_instance_id,
            activity_id: activity_id.into(),
            variables,
            changes: Variables::new(),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn process_instance_id(&self) -> Uuid {
        self.process_instance_id
    }

    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        self.variables.insert(name.clone(), value.clone());
        self.changes.insert(name, value);
    }

    pub(crate) fn into_changes(self) -> Variables {
        self.changes
    }
}
