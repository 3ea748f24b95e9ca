//! Shared harness for the engine integration tests

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use bpmflow_engine::prelude::*;

/// Records every event dispatched after a commit
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<EngineEvent>>,
}

impl EventRecorder {
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(EngineEvent::event_type).collect()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EngineEventListener for EventRecorder {
    fn on_event(&self, event: &EngineEvent) {
        self.events.lock().push(event.clone());
    }
}

/// An engine on an in-memory store with a manual clock
pub struct TestEngine {
    pub engine: ProcessEngine,
    pub store: Arc<InMemoryStore>,
    pub clock: ManualClock,
    pub events: Arc<EventRecorder>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    /// Customize the configuration before it is built
    pub fn with(customize: impl FnOnce(EngineConfigBuilder) -> EngineConfigBuilder) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::default();
        let events = Arc::new(EventRecorder::default());

        let builder = EngineConfig::builder(store.clone())
            .with_clock(Arc::new(clock.clone()))
            .with_event_listener(events.clone());
        let engine = ProcessEngine::new(customize(builder).build());

        Self {
            engine,
            store,
            clock,
            events,
        }
    }

    pub fn deploy(&self, builder: ProcessDefinitionBuilder) {
        let definition = builder.build().expect("definition should be valid");
        self.engine.deploy(definition).expect("deploy should succeed");
    }

    pub async fn start(&self, key: &str) -> Result<uuid::Uuid, EngineError> {
        self.start_with(StartProcessInstance::by_key(key)).await
    }

    pub async fn start_with(&self, command: StartProcessInstance) -> Result<uuid::Uuid, EngineError> {
        Ok(self.engine.start_process_instance(command).await?.id)
    }

    pub async fn state(&self, process_instance_id: uuid::Uuid) -> ProcessInstanceState {
        self.engine
            .process_instance(process_instance_id)
            .await
            .unwrap()
            .expect("process instance should exist")
            .state
    }

    /// The single execution waiting at `activity_id`
    pub async fn waiting_at(&self, process_instance_id: uuid::Uuid, activity_id: &str) -> uuid::Uuid {
        let executions = self
            .engine
            .executions_at(process_instance_id, activity_id)
            .await
            .unwrap();
        assert_eq!(
            executions.len(),
            1,
            "expected one execution at '{activity_id}', found {}",
            executions.len()
        );
        executions[0].id
    }

    pub async fn count_at(&self, process_instance_id: uuid::Uuid, activity_id: &str) -> usize {
        self.engine
            .executions_at(process_instance_id, activity_id)
            .await
            .unwrap()
            .len()
    }

    pub async fn complete(&self, process_instance_id: uuid::Uuid, activity_id: &str) {
        self.complete_with(process_instance_id, activity_id, Variables::new())
            .await;
    }

    pub async fn complete_with(
        &self,
        process_instance_id: uuid::Uuid,
        activity_id: &str,
        variables: Variables,
    ) {
        let execution_id = self.waiting_at(process_instance_id, activity_id).await;
        self.engine
            .complete_task(execution_id, variables)
            .await
            .expect("task completion should succeed");
    }
}

pub fn vars(value: Value) -> Variables {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}
