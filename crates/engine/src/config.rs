//! Engine configuration
//!
//! The [`EngineConfig`] is the explicit home of everything engine-wide: the
//! store, the clock, the registries and the policies. It is built once,
//! shared behind an `Arc` and handed to every unit of work.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::behavior::{DelegateError, DelegateExecution, ServiceDelegate};
use crate::clock::{Clock, SystemClock};
use crate::context::SessionFactory;
use crate::engine::{DelegateRegistry, JobHandlerRegistry};
use crate::event::{EngineEventListener, EventSessionFactory};
use crate::expression::{ExpressionEvaluator, SimpleExpressionEvaluator};
use crate::interceptor::CommandInterceptor;
use crate::job::{AsyncContinuationHandler, JobHandler, TriggerTimerHandler};
use crate::model::DeploymentCache;
use crate::persistence::{EntitySessionFactory, RuntimeStore};
use crate::reliability::RetryPolicy;

/// Engine-wide configuration
pub struct EngineConfig {
    store: Arc<dyn RuntimeStore>,
    clock: Arc<dyn Clock>,
    expressions: Arc<dyn ExpressionEvaluator>,
    job_handlers: JobHandlerRegistry,
    delegates: DelegateRegistry,
    event_listeners: Vec<Arc<dyn EngineEventListener>>,
    session_factories: HashMap<TypeId, Arc<dyn SessionFactory>>,
    job_retry_policy: RetryPolicy,
    command_retry: RetryPolicy,
    deployments: DeploymentCache,
    job_notifier: Arc<Notify>,
    interceptors: Vec<Arc<dyn CommandInterceptor>>,
}

impl EngineConfig {
    pub fn builder(store: Arc<dyn RuntimeStore>) -> EngineConfigBuilder {
        EngineConfigBuilder::new(store)
    }

    pub fn store(&self) -> &Arc<dyn RuntimeStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn expressions(&self) -> &Arc<dyn ExpressionEvaluator> {
        &self.expressions
    }

    pub fn job_handlers(&self) -> &JobHandlerRegistry {
        &self.job_handlers
    }

    pub fn delegates(&self) -> &DelegateRegistry {
        &self.delegates
    }

    pub fn event_listeners(&self) -> &[Arc<dyn EngineEventListener>] {
        &self.event_listeners
    }

    pub fn session_factory(&self, session_type: TypeId) -> Option<&Arc<dyn SessionFactory>> {
        self.session_factories.get(&session_type)
    }

    /// Retries and backoff of failing jobs
    pub fn job_retry_policy(&self) -> &RetryPolicy {
        &self.job_retry_policy
    }

    /// Retries of commands that lost an optimistic lock race
    pub fn command_retry(&self) -> &RetryPolicy {
        &self.command_retry
    }

    pub fn deployments(&self) -> &DeploymentCache {
        &self.deployments
    }

    /// Notified after a unit of work that created jobs committed
    pub fn job_notifier(&self) -> &Arc<Notify> {
        &self.job_notifier
    }

    /// User interceptors, outermost first
    pub fn interceptors(&self) -> &[Arc<dyn CommandInterceptor>] {
        &self.interceptors
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("job_handlers", &self.job_handlers)
            .field("delegates", &self.delegates)
            .field("event_listeners", &self.event_listeners.len())
            .field("job_retry_policy", &self.job_retry_policy)
            .field("command_retry", &self.command_retry)
            .field("deployments", &self.deployments.len())
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

/// Builder for [`EngineConfig`]
pub struct EngineConfigBuilder {
    store: Arc<dyn RuntimeStore>,
    clock: Arc<dyn Clock>,
    expressions: Arc<dyn ExpressionEvaluator>,
    job_handlers: JobHandlerRegistry,
    delegates: DelegateRegistry,
    event_listeners: Vec<Arc<dyn EngineEventListener>>,
    session_factories: Vec<Arc<dyn SessionFactory>>,
    job_retry_policy: RetryPolicy,
    command_retry: RetryPolicy,
    interceptors: Vec<Arc<dyn CommandInterceptor>>,
}

impl EngineConfigBuilder {
    fn new(store: Arc<dyn RuntimeStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            expressions: Arc::new(SimpleExpressionEvaluator),
            job_handlers: JobHandlerRegistry::new(),
            delegates: DelegateRegistry::new(),
            event_listeners: Vec::new(),
            session_factories: Vec::new(),
            job_retry_policy: RetryPolicy::exponential(),
            command_retry: RetryPolicy::fixed(Duration::from_millis(10), 3),
            interceptors: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_expression_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.expressions = evaluator;
        self
    }

    pub fn with_job_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.job_handlers.register(handler);
        self
    }

    pub fn with_delegate(mut self, name: impl Into<String>, delegate: Arc<dyn ServiceDelegate>) -> Self {
        self.delegates.register(name, delegate);
        self
    }

    pub fn with_delegate_fn<F>(mut self, name: impl Into<String>, delegate: F) -> Self
    where
        F: Fn(&mut DelegateExecution) -> Result<(), DelegateError> + Send + Sync + 'static,
    {
        self.delegates.register_fn(name, delegate);
        self
    }

    pub fn with_event_listener(mut self, listener: Arc<dyn EngineEventListener>) -> Self {
        self.event_listeners.push(listener);
        self
    }

    /// Register a session factory; it replaces a built-in one for the same type
    pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.session_factories.push(factory);
        self
    }

    pub fn with_job_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.job_retry_policy = policy;
        self
    }

    pub fn with_command_retry(mut self, policy: RetryPolicy) -> Self {
        self.command_retry = policy;
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn CommandInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Override the job retry policy from the environment
    ///
    /// Reads `JOB_DEFAULT_RETRIES`, `JOB_RETRY_INITIAL_INTERVAL_MS` and
    /// `JOB_RETRY_BACKOFF_COEFFICIENT`; unset or unparsable values keep the
    /// current setting.
    pub fn apply_env(mut self) -> Self {
        let mut policy = self.job_retry_policy.clone();
        if let Some(retries) = env_parse("JOB_DEFAULT_RETRIES") {
            policy = policy.with_max_retries(retries);
        }
        if let Some(ms) = env_parse::<u64>("JOB_RETRY_INITIAL_INTERVAL_MS") {
            policy = policy.with_initial_interval(Duration::from_millis(ms));
        }
        if let Some(factor) = env_parse("JOB_RETRY_BACKOFF_COEFFICIENT") {
            policy = policy.with_backoff_coefficient(factor);
        }
        self.job_retry_policy = policy;
        self
    }

    pub fn build(self) -> EngineConfig {
        let mut job_handlers = JobHandlerRegistry::new();
        job_handlers.register(Arc::new(AsyncContinuationHandler));
        job_handlers.register(Arc::new(TriggerTimerHandler));
        for handler_type in self.job_handlers.handler_types() {
            if let Some(handler) = self.job_handlers.get(handler_type) {
                job_handlers.register(handler);
            }
        }

        let built_in: [Arc<dyn SessionFactory>; 2] =
            [Arc::new(EntitySessionFactory), Arc::new(EventSessionFactory)];
        let session_factories = built_in
            .into_iter()
            .chain(self.session_factories)
            .map(|factory| (factory.session_type(), factory))
            .collect();

        EngineConfig {
            store: self.store,
            clock: self.clock,
            expressions: self.expressions,
            job_handlers,
            delegates: self.delegates,
            event_listeners: self.event_listeners,
            session_factories,
            job_retry_policy: self.job_retry_policy,
            command_retry: self.command_retry,
            deployments: DeploymentCache::new(),
            job_notifier: Arc::new(Notify::new()),
            interceptors: self.interceptors,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ASYNC_CONTINUATION, TRIGGER_TIMER};
    use crate::persistence::{EntitySession, InMemoryStore};

    #[test]
    fn test_build_registers_built_ins() {
        let config = EngineConfig::builder(Arc::new(InMemoryStore::new())).build();

        assert!(config.job_handlers().contains(ASYNC_CONTINUATION));
        assert!(config.job_handlers().contains(TRIGGER_TIMER));
        assert!(config
            .session_factory(TypeId::of::<EntitySession>())
            .is_some());
        assert_eq!(config.job_retry_policy().max_retries, 3);
        assert_eq!(config.command_retry().max_retries, 3);
    }

    #[test]
    fn test_builder_overrides_policies() {
        let config = EngineConfig::builder(Arc::new(InMemoryStore::new()))
            .with_job_retry_policy(RetryPolicy::no_retry())
            .with_delegate_fn("noop", |_| Ok(()))
            .build();

        assert_eq!(config.job_retry_policy().max_retries, 0);
        assert!(config.delegates().contains("noop"));
    }
}
