//! Process model consumed by the runtime
//!
//! A [`ProcessDefinition`] is the already-compiled, validated graph: flow nodes
//! with a closed set of kinds, plus sequence flows with optional guards. Nodes
//! nested in a sub-process name it as their `parent`; boundary events name the
//! activity they are attached to.

mod builder;
mod deployment;
mod validate;

pub use builder::ProcessDefinitionBuilder;
pub use deployment::DeploymentCache;
pub use validate::DefinitionError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Compiled process graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Unique id of this deployed version (`key:version` when left empty)
    #[serde(default)]
    pub id: String,

    /// Stable key shared by every version
    pub key: String,

    #[serde(default = "default_version")]
    pub version: i32,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub tenant_id: Option<String>,

    pub nodes: Vec<FlowNode>,

    #[serde(default)]
    pub flows: Vec<SequenceFlow>,
}

fn default_version() -> i32 {
    1
}

/// One node of the process graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Enclosing sub-process or event sub-process (`None` at process level)
    #[serde(default)]
    pub parent: Option<String>,

    /// Entering the node goes through an async-continuation job
    #[serde(default)]
    pub async_before: bool,

    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Closed set of node kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Plain start at process or sub-process level; triggered start inside an
    /// event sub-process
    StartEvent {
        #[serde(default)]
        event: Option<EventDefinition>,
        #[serde(default = "default_true")]
        interrupting: bool,
    },
    EndEvent {
        #[serde(default)]
        result: EndResult,
    },
    /// Wait state completed from outside
    UserTask,
    /// Calls a registered delegate by name
    ServiceTask {
        delegate: String,
    },
    IntermediateCatchEvent {
        event: EventDefinition,
    },
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    SubProcess,
    EventSubProcess,
    BoundaryEvent {
        attached_to: String,
        event: EventDefinition,
        #[serde(default = "default_true")]
        cancel_activity: bool,
    },
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StartEvent { .. } => "start_event",
            Self::EndEvent { .. } => "end_event",
            Self::UserTask => "user_task",
            Self::ServiceTask { .. } => "service_task",
            Self::IntermediateCatchEvent { .. } => "intermediate_catch_event",
            Self::ExclusiveGateway => "exclusive_gateway",
            Self::ParallelGateway => "parallel_gateway",
            Self::InclusiveGateway => "inclusive_gateway",
            Self::EventBasedGateway => "event_based_gateway",
            Self::SubProcess => "sub_process",
            Self::EventSubProcess => "event_sub_process",
            Self::BoundaryEvent { .. } => "boundary_event",
        }
    }
}

/// How an end event finishes its path
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndResult {
    /// Ends only this path
    #[default]
    None,
    /// Ends every path of the enclosing scope
    Terminate,
    /// Throws a business error
    Error { code: String },
}

/// Trigger of a catch event, boundary event or event sub-process start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDefinition {
    /// Name may be an expression (`${...}`) resolved when the subscription is created
    Message { name: String },
    Signal { name: String },
    Timer { timer: TimerDefinition },
    /// `code: None` catches every business error
    Error {
        #[serde(default)]
        code: Option<String>,
        /// Higher value wins among handlers of equal specificity
        #[serde(default)]
        precedence: i32,
    },
}

/// When a timer fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerDefinition {
    /// Relative to the moment the timer is scheduled
    AfterMillis(u64),
    /// Absolute instant
    At(DateTime<Utc>),
}

impl TimerDefinition {
    pub fn due_date(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::AfterMillis(ms) => now + chrono::Duration::milliseconds(*ms as i64),
            Self::At(at) => *at,
        }
    }
}

/// Directed edge between two nodes of the same scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,

    /// Guard expression; unguarded flows are always takeable
    #[serde(default)]
    pub condition: Option<String>,

    /// Taken only when no other outgoing flow of the source is
    #[serde(default)]
    pub is_default: bool,
}

impl ProcessDefinition {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing flows of a node in declaration order
    pub fn outgoing(&self, node_id: &str) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| f.source == node_id).collect()
    }

    pub fn incoming(&self, node_id: &str) -> Vec<&SequenceFlow> {
        self.flows.iter().filter(|f| f.target == node_id).collect()
    }

    /// Nodes directly contained in `scope` (`None` is the process level)
    pub fn children(&self, scope: Option<&str>) -> impl Iterator<Item = &FlowNode> + '_ {
        let scope = scope.map(str::to_string);
        self.nodes
            .iter()
            .filter(move |n| n.parent.as_deref() == scope.as_deref())
    }

    /// The untriggered start event of a scope
    pub fn initial_node(&self, scope: Option<&str>) -> Option<&FlowNode> {
        self.children(scope).find(|n| {
            matches!(
                n.kind,
                NodeKind::StartEvent {
                    event: None,
                    ..
                }
            )
        })
    }

    /// Boundary events attached to an activity, in declaration order
    pub fn boundary_events(&self, activity_id: &str) -> Vec<&FlowNode> {
        self.nodes
            .iter()
            .filter(|n| {
                matches!(&n.kind, NodeKind::BoundaryEvent { attached_to, .. } if attached_to == activity_id)
            })
            .collect()
    }

    /// Event sub-processes directly inside `scope`, in declaration order
    pub fn event_sub_processes(&self, scope: Option<&str>) -> Vec<&FlowNode> {
        self.children(scope)
            .filter(|n| matches!(n.kind, NodeKind::EventSubProcess))
            .collect()
    }

    /// Triggered start event of an event sub-process
    pub fn event_start(&self, event_sub_process: &str) -> Option<&FlowNode> {
        self.children(Some(event_sub_process)).find(|n| {
            matches!(
                n.kind,
                NodeKind::StartEvent {
                    event: Some(_),
                    ..
                }
            )
        })
    }

    /// Whether `to` is reachable from `from` along sequence flows of the same scope
    pub fn is_reachable(&self, from: &str, to: &str) -> bool {
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            for flow in self.outgoing(current) {
                if flow.target == to {
                    return true;
                }
                stack.push(flow.target.as_str());
            }
        }
        false
    }
}
