//! Registries of job handlers and service delegates
//!
//! Both are owned by the [`EngineConfig`](crate::config::EngineConfig) and
//! consulted by name from inside a unit of work.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::behavior::{DelegateError, DelegateExecution, ServiceDelegate};
use crate::job::JobHandler;

/// Job handlers by handler type
#[derive(Clone, Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own handler type, replacing any previous one
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers
            .insert(handler.handler_type().to_string(), handler);
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(handler_type).cloned()
    }

    pub fn contains(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn handler_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandlerRegistry")
            .field("handler_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Service-task delegates by name
#[derive(Clone, Default)]
pub struct DelegateRegistry {
    delegates: HashMap<String, Arc<dyn ServiceDelegate>>,
}

/// Adapts a synchronous closure to [`ServiceDelegate`]
struct FnDelegate<F>(F);

#[async_trait]
impl<F> ServiceDelegate for FnDelegate<F>
where
    F: Fn(&mut DelegateExecution) -> Result<(), DelegateError> + Send + Sync + 'static,
{
    async fn execute(&self, execution: &mut DelegateExecution) -> Result<(), DelegateError> {
        (self.0)(execution)
    }
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, delegate: Arc<dyn ServiceDelegate>) {
        self.delegates.insert(name.into(), delegate);
    }

    /// Register a closure as a delegate
    ///
    /// # Example
    ///
    /// ```ignore
    /// registry.register_fn("approve", |execution| {
    ///     execution.set_variable("approved", true);
    ///     Ok(())
    /// });
    /// ```
    pub fn register_fn<F>(&mut self, name: impl Into<String>, delegate: F)
    where
        F: Fn(&mut DelegateExecution) -> Result<(), DelegateError> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnDelegate(delegate)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceDelegate>> {
        self.delegates.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.delegates.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }
}

impl fmt::Debug for DelegateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateRegistry")
            .field("delegates", &self.delegates.keys().collect::<Vec<_>>())
            .finish()
    }
}
