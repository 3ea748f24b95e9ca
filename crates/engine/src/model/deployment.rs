//! Registry of deployed process definitions

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::{DefinitionError, ProcessDefinition};

/// Deployed definitions, by id and by key
///
/// Shared by every unit of work through the engine configuration.
#[derive(Default)]
pub struct DeploymentCache {
    by_id: RwLock<HashMap<String, Arc<ProcessDefinition>>>,
}

impl DeploymentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a definition, replacing a previous deployment
    /// with the same id
    pub fn deploy(
        &self,
        mut definition: ProcessDefinition,
    ) -> Result<Arc<ProcessDefinition>, DefinitionError> {
        if definition.id.is_empty() {
            definition.id = format!("{}:{}", definition.key, definition.version);
        }
        definition.validate()?;

        let definition = Arc::new(definition);
        self.by_id
            .write()
            .insert(definition.id.clone(), Arc::clone(&definition));

        info!(
            definition_id = %definition.id,
            key = %definition.key,
            version = definition.version,
            "deployed process definition"
        );
        Ok(definition)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProcessDefinition>> {
        self.by_id.read().get(id).cloned()
    }

    /// Highest deployed version of a key
    pub fn latest(&self, key: &str) -> Option<Arc<ProcessDefinition>> {
        self.by_id
            .read()
            .values()
            .filter(|d| d.key == key)
            .max_by_key(|d| d.version)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.by_id.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.read().is_empty()
    }
}
