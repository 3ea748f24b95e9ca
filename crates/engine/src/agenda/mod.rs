//! Agenda: the per-unit-of-work operation queue
//!
//! Every step that advances an execution is an [`Operation`] planned on the
//! agenda. The context drains the agenda in strict FIFO order; operations
//! planned while another runs are queued behind everything already waiting.

mod operations;

pub(crate) use operations::run_operation;
pub use operations::select_flows;

use std::collections::VecDeque;
use std::sync::Arc;

use uuid::Uuid;

use crate::command::DynCommand;
use crate::persistence::Variables;

/// Which outgoing sequence flows a node leaves through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSelection {
    /// Every outgoing flow, guards ignored (parallel gateway)
    All,

    /// Every flow whose guard holds; the default flow only if none does
    Conditional,

    /// The first flow whose guard holds; the default flow only if none does
    Exclusive,
}

/// One indivisible step of a unit of work
pub enum Operation {
    /// Execute a command and store its output in the context's result slot
    Command {
        command: Arc<dyn DynCommand>,
        slot: usize,
    },

    /// Enter the node the execution sits on
    ContinueProcess {
        execution_id: Uuid,
        /// Set when an async-continuation job resumes the entry
        skip_async: bool,
    },

    /// Leave the current node along its outgoing sequence flows
    TakeOutgoingSequenceFlows {
        execution_id: Uuid,
        selection: FlowSelection,
    },

    /// Resume a waiting node with an optional payload
    TriggerExecution {
        execution_id: Uuid,
        payload: Option<Variables>,
    },

    /// Remove the execution and complete its scope if it was the last child
    EndExecution { execution_id: Uuid },

    /// Re-evaluate inactive executions waiting at joins
    ExecuteInactiveBehaviors { process_instance_id: Uuid },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::ContinueProcess { .. } => "continue_process",
            Self::TakeOutgoingSequenceFlows { .. } => "take_outgoing_sequence_flows",
            Self::TriggerExecution { .. } => "trigger_execution",
            Self::EndExecution { .. } => "end_execution",
            Self::ExecuteInactiveBehaviors { .. } => "execute_inactive_behaviors",
        }
    }

    /// Execution the operation acts on; it is skipped once that execution is gone
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            Self::ContinueProcess { execution_id, .. }
            | Self::TakeOutgoingSequenceFlows { execution_id, .. }
            | Self::TriggerExecution { execution_id, .. }
            | Self::EndExecution { execution_id } => Some(*execution_id),
            Self::Command { .. } | Self::ExecuteInactiveBehaviors { .. } => None,
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command { command, slot } => f
                .debug_struct("Command")
                .field("command", &command.name())
                .field("slot", slot)
                .finish(),
            Self::ExecuteInactiveBehaviors {
                process_instance_id,
            } => f
                .debug_struct("ExecuteInactiveBehaviors")
                .field("process_instance_id", process_instance_id)
                .finish(),
            other => f
                .debug_struct("Operation")
                .field("name", &other.name())
                .field("execution_id", &other.execution_id())
                .finish(),
        }
    }
}

/// FIFO queue of planned operations
#[derive(Debug, Default)]
pub struct Agenda {
    operations: VecDeque<Operation>,
}

impl Agenda {
    pub fn plan(&mut self, operation: Operation) {
        self.operations.push_back(operation);
    }

    pub fn next_operation(&mut self) -> Option<Operation> {
        self.operations.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn clear(&mut self) {
        self.operations.clear();
    }
}
