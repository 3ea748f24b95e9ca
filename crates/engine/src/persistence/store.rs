//! RuntimeStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::entity::{
    EntityKind, EventSubscription, EventType, Execution, Job, JobState, JobType, ProcessInstance,
    ProcessInstanceState,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Concurrency conflict (optimistic locking failed, or the row is gone)
    #[error("concurrency conflict on {kind} {id}: expected version {expected}")]
    ConcurrencyConflict {
        kind: EntityKind,
        id: Uuid,
        expected: i32,
    },

    /// Insert of an entity whose id already exists
    #[error("duplicate {kind}: {id}")]
    DuplicateKey { kind: EntityKind, id: Uuid },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One entity row inside a change set
#[derive(Debug, Clone)]
pub enum EntityRecord {
    ProcessInstance(ProcessInstance),
    Execution(Execution),
    Subscription(EventSubscription),
    Job(Job),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::ProcessInstance(_) => EntityKind::ProcessInstance,
            Self::Execution(_) => EntityKind::Execution,
            Self::Subscription(_) => EntityKind::EventSubscription,
            Self::Job(_) => EntityKind::Job,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::ProcessInstance(e) => e.id,
            Self::Execution(e) => e.id,
            Self::Subscription(e) => e.id,
            Self::Job(e) => e.id,
        }
    }

    pub fn version(&self) -> i32 {
        match self {
            Self::ProcessInstance(e) => e.version,
            Self::Execution(e) => e.version,
            Self::Subscription(e) => e.version,
            Self::Job(e) => e.version,
        }
    }
}

/// Reference to a row scheduled for deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,

    /// Version the unit of work loaded; the delete fails if it moved on
    pub version: i32,
}

/// All writes of one unit of work
///
/// Updates and deletes carry the version the unit of work read. The store
/// applies the whole set atomically or not at all; any version mismatch
/// aborts the commit with [`StoreError::ConcurrencyConflict`].
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub inserts: Vec<EntityRecord>,
    pub updates: Vec<EntityRecord>,
    pub deletes: Vec<EntityRef>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }
}

/// Filter for process instance queries
#[derive(Debug, Clone, Default)]
pub struct ProcessInstanceQuery {
    pub process_definition_id: Option<String>,
    pub business_key: Option<String>,
    pub state: Option<ProcessInstanceState>,
}

impl ProcessInstanceQuery {
    pub fn matches(&self, instance: &ProcessInstance) -> bool {
        self.process_definition_id
            .as_ref()
            .map_or(true, |id| *id == instance.process_definition_id)
            && self
                .business_key
                .as_ref()
                .map_or(true, |key| instance.business_key.as_ref() == Some(key))
            && self.state.map_or(true, |state| state == instance.state)
    }
}

/// Filter for event subscription queries
#[derive(Debug, Clone, Default)]
pub struct SubscriptionQuery {
    pub event_type: Option<EventType>,
    pub event_name: Option<String>,
    pub process_instance_id: Option<Uuid>,
    pub execution_id: Option<Uuid>,
}

impl SubscriptionQuery {
    pub fn messages(name: impl Into<String>) -> Self {
        Self {
            event_type: Some(EventType::Message),
            event_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn signals(name: impl Into<String>) -> Self {
        Self {
            event_type: Some(EventType::Signal),
            event_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn in_process_instance(mut self, process_instance_id: Uuid) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn matches(&self, sub: &EventSubscription) -> bool {
        self.event_type.map_or(true, |t| t == sub.event_type)
            && self
                .event_name
                .as_ref()
                .map_or(true, |name| *name == sub.event_name)
            && self
                .process_instance_id
                .map_or(true, |id| id == sub.process_instance_id)
            && self.execution_id.map_or(true, |id| id == sub.execution_id)
    }
}

/// Filter for job queries
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub process_instance_id: Option<Uuid>,
    pub execution_id: Option<Uuid>,
    pub job_type: Option<JobType>,
    pub state: Option<JobState>,
    pub handler_type: Option<String>,
    pub lock_owner: Option<String>,
}

impl JobQuery {
    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_process_instance(mut self, process_instance_id: Uuid) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = Some(owner.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.process_instance_id
            .map_or(true, |id| job.process_instance_id == Some(id))
            && self
                .execution_id
                .map_or(true, |id| job.execution_id == Some(id))
            && self.job_type.map_or(true, |t| t == job.job_type)
            && self.state.map_or(true, |s| s == job.state)
            && self
                .handler_type
                .as_ref()
                .map_or(true, |h| *h == job.handler_type)
            && self
                .lock_owner
                .as_ref()
                .map_or(true, |owner| job.lock_owner.as_ref() == Some(owner))
    }
}

/// Store for runtime state: process instances, executions, subscriptions and jobs
///
/// Reads are plain lookups. All writes go through [`RuntimeStore::commit`],
/// which applies one unit of work's change set atomically with optimistic
/// version checks on every updated or deleted row.
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait RuntimeStore: Send + Sync + 'static {
    // =========================================================================
    // Process instances
    // =========================================================================

    async fn find_process_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>, StoreError>;

    async fn find_process_instances(
        &self,
        query: &ProcessInstanceQuery,
    ) -> Result<Vec<ProcessInstance>, StoreError>;

    // =========================================================================
    // Executions
    // =========================================================================

    async fn find_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError>;

    /// All executions of an instance, including the root
    async fn executions_by_process_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<Execution>, StoreError>;

    // =========================================================================
    // Event subscriptions
    // =========================================================================

    async fn subscriptions_by_process_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<EventSubscription>, StoreError>;

    async fn find_subscriptions(
        &self,
        query: &SubscriptionQuery,
    ) -> Result<Vec<EventSubscription>, StoreError>;

    // =========================================================================
    // Jobs
    // =========================================================================

    async fn jobs_by_process_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<Job>, StoreError>;

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, StoreError>;

    /// Jobs eligible for acquisition at `now`, oldest due date first
    ///
    /// Eligible: due timers and executable jobs with no live lease. Dead-letter
    /// jobs are never returned.
    async fn find_acquirable_jobs(
        &self,
        now: DateTime<Utc>,
        max_jobs: usize,
    ) -> Result<Vec<Job>, StoreError>;

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a unit of work's change set atomically
    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError>;
}
