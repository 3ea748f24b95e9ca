//! Fluent construction of process definitions

use super::{
    DefinitionError, EndResult, EventDefinition, FlowNode, NodeKind, ProcessDefinition,
    SequenceFlow, TimerDefinition,
};

/// Builder for [`ProcessDefinition`]
///
/// Nodes added inside a [`sub_process`](Self::sub_process) or
/// [`event_sub_process`](Self::event_sub_process) closure are nested in it.
///
/// ```
/// use bpmflow_engine::model::ProcessDefinitionBuilder;
///
/// let def = ProcessDefinitionBuilder::new("approval")
///     .start_event("start")
///     .user_task("review")
///     .end_event("end")
///     .flow("start", "review")
///     .flow("review", "end")
///     .build()
///     .unwrap();
///
/// assert_eq!(def.id, "approval:1");
/// ```
#[derive(Debug, Clone)]
pub struct ProcessDefinitionBuilder {
    definition: ProcessDefinition,
    parent: Option<String>,
}

impl ProcessDefinitionBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            definition: ProcessDefinition {
                id: String::new(),
                key: key.into(),
                version: 1,
                name: None,
                tenant_id: None,
                nodes: Vec::new(),
                flows: Vec::new(),
            },
            parent: None,
        }
    }

    pub fn version(mut self, version: i32) -> Self {
        self.definition.version = version;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.definition.name = Some(name.into());
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.definition.tenant_id = Some(tenant_id.into());
        self
    }

    /// Add a node of any kind in the current scope
    pub fn node(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        self.definition.nodes.push(FlowNode {
            id: id.into(),
            name: None,
            parent: self.parent.clone(),
            async_before: false,
            kind,
        });
        self
    }

    pub fn start_event(self, id: impl Into<String>) -> Self {
        self.node(
            id,
            NodeKind::StartEvent {
                event: None,
                interrupting: true,
            },
        )
    }

    /// Triggered start event (inside an event sub-process)
    pub fn event_start(
        self,
        id: impl Into<String>,
        event: EventDefinition,
        interrupting: bool,
    ) -> Self {
        self.node(
            id,
            NodeKind::StartEvent {
                event: Some(event),
                interrupting,
            },
        )
    }

    pub fn end_event(self, id: impl Into<String>) -> Self {
        self.node(
            id,
            NodeKind::EndEvent {
                result: EndResult::None,
            },
        )
    }

    pub fn terminate_end_event(self, id: impl Into<String>) -> Self {
        self.node(
            id,
            NodeKind::EndEvent {
                result: EndResult::Terminate,
            },
        )
    }

    pub fn error_end_event(self, id: impl Into<String>, code: impl Into<String>) -> Self {
        self.node(
            id,
            NodeKind::EndEvent {
                result: EndResult::Error { code: code.into() },
            },
        )
    }

    pub fn user_task(self, id: impl Into<String>) -> Self {
        self.node(id, NodeKind::UserTask)
    }

    pub fn service_task(self, id: impl Into<String>, delegate: impl Into<String>) -> Self {
        self.node(
            id,
            NodeKind::ServiceTask {
                delegate: delegate.into(),
            },
        )
    }

    pub fn message_catch(self, id: impl Into<String>, message: impl Into<String>) -> Self {
        self.node(
            id,
            NodeKind::IntermediateCatchEvent {
                event: EventDefinition::Message {
                    name: message.into(),
                },
            },
        )
    }

    pub fn signal_catch(self, id: impl Into<String>, signal: impl Into<String>) -> Self {
        self.node(
            id,
            NodeKind::IntermediateCatchEvent {
                event: EventDefinition::Signal {
                    name: signal.into(),
                },
            },
        )
    }

    pub fn timer_catch(self, id: impl Into<String>, timer: TimerDefinition) -> Self {
        self.node(
            id,
            NodeKind::IntermediateCatchEvent {
                event: EventDefinition::Timer { timer },
            },
        )
    }

    pub fn exclusive_gateway(self, id: impl Into<String>) -> Self {
        self.node(id, NodeKind::ExclusiveGateway)
    }

    pub fn parallel_gateway(self, id: impl Into<String>) -> Self {
        self.node(id, NodeKind::ParallelGateway)
    }

    pub fn inclusive_gateway(self, id: impl Into<String>) -> Self {
        self.node(id, NodeKind::InclusiveGateway)
    }

    pub fn event_based_gateway(self, id: impl Into<String>) -> Self {
        self.node(id, NodeKind::EventBasedGateway)
    }

    /// Embedded sub-process; nodes added by `body` are nested in it
    pub fn sub_process(self, id: impl Into<String>, body: impl FnOnce(Self) -> Self) -> Self {
        self.scope(id.into(), NodeKind::SubProcess, body)
    }

    /// Event sub-process; `body` must add exactly one triggered start event
    pub fn event_sub_process(self, id: impl Into<String>, body: impl FnOnce(Self) -> Self) -> Self {
        self.scope(id.into(), NodeKind::EventSubProcess, body)
    }

    fn scope(self, id: String, kind: NodeKind, body: impl FnOnce(Self) -> Self) -> Self {
        let mut builder = self.node(id.clone(), kind);
        let outer = builder.parent.replace(id);
        let mut builder = body(builder);
        builder.parent = outer;
        builder
    }

    pub fn boundary_event(
        self,
        id: impl Into<String>,
        attached_to: impl Into<String>,
        event: EventDefinition,
        cancel_activity: bool,
    ) -> Self {
        self.node(
            id,
            NodeKind::BoundaryEvent {
                attached_to: attached_to.into(),
                event,
                cancel_activity,
            },
        )
    }

    /// Interrupting error boundary; `code: None` catches every error
    pub fn error_boundary(
        self,
        id: impl Into<String>,
        attached_to: impl Into<String>,
        code: Option<&str>,
    ) -> Self {
        self.boundary_event(
            id,
            attached_to,
            EventDefinition::Error {
                code: code.map(str::to_string),
                precedence: 0,
            },
            true,
        )
    }

    /// Mark an already added node as asynchronous
    pub fn async_before(mut self, id: &str) -> Self {
        if let Some(node) = self.definition.nodes.iter_mut().find(|n| n.id == id) {
            node.async_before = true;
        }
        self
    }

    pub fn flow(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_flow(source.into(), target.into(), None, false)
    }

    pub fn conditional_flow(
        self,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        self.push_flow(source.into(), target.into(), Some(condition.into()), false)
    }

    pub fn default_flow(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_flow(source.into(), target.into(), None, true)
    }

    fn push_flow(
        mut self,
        source: String,
        target: String,
        condition: Option<String>,
        is_default: bool,
    ) -> Self {
        let id = format!("flow_{}", self.definition.flows.len() + 1);
        self.definition.flows.push(SequenceFlow {
            id,
            source,
            target,
            condition,
            is_default,
        });
        self
    }

    /// Finish and validate
    pub fn build(self) -> Result<ProcessDefinition, DefinitionError> {
        let definition = self.build_unchecked();
        definition.validate()?;
        Ok(definition)
    }

    /// Finish without validation
    pub fn build_unchecked(self) -> ProcessDefinition {
        let mut definition = self.definition;
        if definition.id.is_empty() {
            definition.id = format!("{}:{}", definition.key, definition.version);
        }
        definition
    }
}
