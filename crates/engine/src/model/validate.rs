//! Structural validation of compiled process definitions

use std::collections::HashSet;

use super::{EventDefinition, NodeKind, ProcessDefinition};

/// Structural defects found in a process definition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("process definition has no key")]
    EmptyKey,

    #[error("process definition has no nodes")]
    NoNodes,

    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("duplicate flow id: {0}")]
    DuplicateFlowId(String),

    #[error("flow '{flow}' references unknown node '{node}'")]
    UnknownFlowNode { flow: String, node: String },

    #[error("flow '{0}' connects nodes in different scopes")]
    FlowCrossesScope(String),

    #[error("node '{node}' names unknown parent '{parent}'")]
    UnknownParent { node: String, parent: String },

    #[error("node '{node}' is nested in '{parent}', which is not a sub-process")]
    ParentNotSubProcess { node: String, parent: String },

    #[error("scope '{0}' has no plain start event")]
    MissingStartEvent(String),

    #[error("event sub-process '{0}' needs exactly one triggered start event")]
    InvalidEventStart(String),

    #[error("node '{0}' declares more than one default flow")]
    MultipleDefaultFlows(String),

    #[error("default flow '{0}' has a condition")]
    ConditionalDefaultFlow(String),

    #[error("boundary event '{boundary}' is attached to unknown activity '{attached_to}'")]
    UnknownAttachment {
        boundary: String,
        attached_to: String,
    },

    #[error("error boundary event '{0}' must interrupt its activity")]
    NonInterruptingErrorBoundary(String),

    #[error("event-based gateway '{gateway}' leads to '{target}', which is not a catch event")]
    InvalidEventGatewayTarget { gateway: String, target: String },

    #[error("boundary event '{0}' has incoming flows")]
    BoundaryWithIncoming(String),
}

impl ProcessDefinition {
    /// Validate, stopping at the first defect
    pub fn validate(&self) -> Result<(), DefinitionError> {
        match self.validate_all().into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Validate, collecting every defect that can be found
    #[must_use]
    pub fn validate_all(&self) -> Vec<DefinitionError> {
        let mut errors = Vec::new();

        if self.key.is_empty() {
            errors.push(DefinitionError::EmptyKey);
        }
        if self.nodes.is_empty() {
            errors.push(DefinitionError::NoNodes);
            return errors;
        }

        // 1. Unique ids
        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(node.id.as_str()) {
                errors.push(DefinitionError::DuplicateNodeId(node.id.clone()));
            }
        }
        let mut flow_ids = HashSet::new();
        for flow in &self.flows {
            if !flow_ids.insert(flow.id.as_str()) {
                errors.push(DefinitionError::DuplicateFlowId(flow.id.clone()));
            }
        }

        // 2. Containment
        for node in &self.nodes {
            if let Some(parent) = &node.parent {
                match self.node(parent) {
                    None => errors.push(DefinitionError::UnknownParent {
                        node: node.id.clone(),
                        parent: parent.clone(),
                    }),
                    Some(p) if !matches!(p.kind, NodeKind::SubProcess | NodeKind::EventSubProcess) => {
                        errors.push(DefinitionError::ParentNotSubProcess {
                            node: node.id.clone(),
                            parent: parent.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
        }

        // 3. Flows
        for flow in &self.flows {
            let source = self.node(&flow.source);
            let target = self.node(&flow.target);
            for (endpoint, id) in [(source, &flow.source), (target, &flow.target)] {
                if endpoint.is_none() {
                    errors.push(DefinitionError::UnknownFlowNode {
                        flow: flow.id.clone(),
                        node: id.clone(),
                    });
                }
            }
            if let (Some(source), Some(target)) = (source, target) {
                if source.parent != target.parent {
                    errors.push(DefinitionError::FlowCrossesScope(flow.id.clone()));
                }
                if matches!(target.kind, NodeKind::BoundaryEvent { .. }) {
                    errors.push(DefinitionError::BoundaryWithIncoming(target.id.clone()));
                }
            }
            if flow.is_default && flow.condition.is_some() {
                errors.push(DefinitionError::ConditionalDefaultFlow(flow.id.clone()));
            }
        }

        // 4. Per-node rules
        for node in &self.nodes {
            if self.outgoing(&node.id).iter().filter(|f| f.is_default).count() > 1 {
                errors.push(DefinitionError::MultipleDefaultFlows(node.id.clone()));
            }

            match &node.kind {
                NodeKind::SubProcess => {
                    if self.initial_node(Some(&node.id)).is_none() {
                        errors.push(DefinitionError::MissingStartEvent(node.id.clone()));
                    }
                }
                NodeKind::EventSubProcess => {
                    let triggered = self
                        .children(Some(&node.id))
                        .filter(|n| matches!(n.kind, NodeKind::StartEvent { event: Some(_), .. }))
                        .count();
                    if triggered != 1 {
                        errors.push(DefinitionError::InvalidEventStart(node.id.clone()));
                    }
                }
                NodeKind::BoundaryEvent {
                    attached_to,
                    event,
                    cancel_activity,
                } => {
                    if self.node(attached_to).is_none() {
                        errors.push(DefinitionError::UnknownAttachment {
                            boundary: node.id.clone(),
                            attached_to: attached_to.clone(),
                        });
                    }
                    if matches!(event, EventDefinition::Error { .. }) && !cancel_activity {
                        errors.push(DefinitionError::NonInterruptingErrorBoundary(node.id.clone()));
                    }
                }
                NodeKind::EventBasedGateway => {
                    for flow in self.outgoing(&node.id) {
                        let is_catch = self.node(&flow.target).is_some_and(|t| {
                            matches!(t.kind, NodeKind::IntermediateCatchEvent { .. })
                        });
                        if !is_catch {
                            errors.push(DefinitionError::InvalidEventGatewayTarget {
                                gateway: node.id.clone(),
                                target: flow.target.clone(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        // 5. Process-level entry
        if self.initial_node(None).is_none() {
            errors.push(DefinitionError::MissingStartEvent(self.key.clone()));
        }

        errors
    }
}
