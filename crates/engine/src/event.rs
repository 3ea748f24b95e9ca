//! Engine events
//!
//! Runtime code records [`EngineEvent`]s into the unit of work's
//! [`EventSession`]. Listeners see them only after the unit of work committed;
//! events of a failed unit of work are dropped with it.

use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::{Session, SessionFactory};
use crate::error::EngineError;
use crate::persistence::JobType;

/// Observable runtime state changes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // =========================================================================
    // Process instance lifecycle
    // =========================================================================
    ProcessStarted {
        process_instance_id: Uuid,
        process_definition_id: String,
        business_key: Option<String>,
    },

    ProcessCompleted {
        process_instance_id: Uuid,
    },

    /// Ended by a terminate end event or deleted
    ProcessTerminated {
        process_instance_id: Uuid,
        reason: Option<String>,
    },

    // =========================================================================
    // Activities
    // =========================================================================
    ActivityStarted {
        process_instance_id: Uuid,
        execution_id: Uuid,
        activity_id: String,
        activity_type: String,
    },

    ActivityCompleted {
        process_instance_id: Uuid,
        execution_id: Uuid,
        activity_id: String,
    },

    /// Interrupted by a boundary event, event sub-process or terminate end event
    ActivityCancelled {
        process_instance_id: Uuid,
        execution_id: Uuid,
        activity_id: String,
    },

    /// A user task is waiting for completion
    TaskCreated {
        process_instance_id: Uuid,
        execution_id: Uuid,
        activity_id: String,
    },

    /// A business error was caught by a boundary event or event sub-process
    ErrorCaught {
        process_instance_id: Uuid,
        error_code: String,
        handler_id: String,
    },

    // =========================================================================
    // Jobs
    // =========================================================================
    JobCreated {
        job_id: Uuid,
        job_type: JobType,
        handler_type: String,
    },

    JobExecuted {
        job_id: Uuid,
        handler_type: String,
    },

    /// Failed with retries left; rescheduled as a timer
    JobFailed {
        job_id: Uuid,
        retries: u32,
        message: String,
    },

    JobDeadLettered {
        job_id: Uuid,
        message: String,
    },
}

impl EngineEvent {
    /// Stable name of the event variant
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ProcessStarted { .. } => "process_started",
            Self::ProcessCompleted { .. } => "process_completed",
            Self::ProcessTerminated { .. } => "process_terminated",
            Self::ActivityStarted { .. } => "activity_started",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityCancelled { .. } => "activity_cancelled",
            Self::TaskCreated { .. } => "task_created",
            Self::ErrorCaught { .. } => "error_caught",
            Self::JobCreated { .. } => "job_created",
            Self::JobExecuted { .. } => "job_executed",
            Self::JobFailed { .. } => "job_failed",
            Self::JobDeadLettered { .. } => "job_dead_lettered",
        }
    }

    pub fn process_instance_id(&self) -> Option<Uuid> {
        match self {
            Self::ProcessStarted {
                process_instance_id,
                ..
            }
            | Self::ProcessCompleted {
                process_instance_id,
            }
            | Self::ProcessTerminated {
                process_instance_id,
                ..
            }
            | Self::ActivityStarted {
                process_instance_id,
                ..
            }
            | Self::ActivityCompleted {
                process_instance_id,
                ..
            }
            | Self::ActivityCancelled {
                process_instance_id,
                ..
            }
            | Self::TaskCreated {
                process_instance_id,
                ..
            }
            | Self::ErrorCaught {
                process_instance_id,
                ..
            } => Some(*process_instance_id),
            _ => None,
        }
    }
}

/// Receives committed engine events
///
/// Called synchronously on the task that closed the unit of work; keep it short.
pub trait EngineEventListener: Send + Sync + 'static {
    fn on_event(&self, event: &EngineEvent);
}

/// Buffers the events of one unit of work until it commits
pub struct EventSession {
    listeners: Vec<Arc<dyn EngineEventListener>>,
    buffered: Vec<EngineEvent>,
}

impl EventSession {
    pub fn new(listeners: Vec<Arc<dyn EngineEventListener>>) -> Self {
        Self {
            listeners,
            buffered: Vec::new(),
        }
    }

    pub fn record(&mut self, event: EngineEvent) {
        if !self.listeners.is_empty() {
            self.buffered.push(event);
        }
    }

    pub fn pending(&self) -> &[EngineEvent] {
        &self.buffered
    }
}

#[async_trait]
impl Session for EventSession {
    async fn flush(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn close(&mut self, committed: bool) {
        let events = std::mem::take(&mut self.buffered);
        if !committed {
            trace!(dropped = events.len(), "discarding events of failed unit of work");
            return;
        }
        for event in &events {
            for listener in &self.listeners {
                listener.on_event(event);
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct EventSessionFactory;

impl SessionFactory for EventSessionFactory {
    fn session_type(&self) -> TypeId {
        TypeId::of::<EventSession>()
    }

    fn open(&self, config: &EngineConfig) -> Box<dyn Session> {
        Box::new(EventSession::new(config.event_listeners().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl EngineEventListener for Recorder {
        fn on_event(&self, event: &EngineEvent) {
            self.0.lock().push(event.event_type().to_string());
        }
    }

    fn completed() -> EngineEvent {
        EngineEvent::ProcessCompleted {
            process_instance_id: Uuid::now_v7(),
        }
    }

    #[tokio::test]
    async fn test_events_dispatched_only_on_commit() {
        let recorder = Arc::new(Recorder::default());

        let mut session = EventSession::new(vec![recorder.clone()]);
        session.record(completed());
        session.close(false).await;
        assert!(recorder.0.lock().is_empty());

        let mut session = EventSession::new(vec![recorder.clone()]);
        session.record(completed());
        assert_eq!(session.pending().len(), 1);
        session.close(true).await;
        assert_eq!(*recorder.0.lock(), vec!["process_completed"]);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = EngineEvent::JobDeadLettered {
            job_id: Uuid::nil(),
            message: "boom".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_dead_lettered");
        assert_eq!(event.process_instance_id(), None);
    }
}
