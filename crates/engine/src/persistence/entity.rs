//! Persisted runtime entities
//!
//! Every entity carries an optimistic-lock `version` that the store compares
//! and increments on update. Entities reference each other by id only; the
//! execution tree is reconstructed from `parent_id` links.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Variable map attached to a scope
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Kind of persisted entity (used in conflict and lookup errors)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    ProcessInstance,
    Execution,
    EventSubscription,
    Job,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProcessInstance => write!(f, "process instance"),
            Self::Execution => write!(f, "execution"),
            Self::EventSubscription => write!(f, "event subscription"),
            Self::Job => write!(f, "job"),
        }
    }
}

/// Common accessors used by the entity session and the stores
pub trait Entity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> Uuid;

    fn version(&self) -> i32;

    fn set_version(&mut self, version: i32);
}

macro_rules! impl_entity {
    ($ty:ty, $kind:expr) => {
        impl Entity for $ty {
            const KIND: EntityKind = $kind;

            fn id(&self) -> Uuid {
                self.id
            }

            fn version(&self) -> i32 {
                self.version
            }

            fn set_version(&mut self, version: i32) {
                self.version = version;
            }
        }
    };
}

// =============================================================================
// Process instance
// =============================================================================

/// Process instance lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessInstanceState {
    /// At least one execution is still alive
    Active,

    /// Every path reached an end event
    Completed,

    /// Ended by a terminate end event or an administrative delete
    Terminated,
}

impl std::fmt::Display for ProcessInstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

impl std::str::FromStr for ProcessInstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown process instance state: {other}")),
        }
    }
}

/// A running (or finished) instance of a process definition
///
/// The root execution of the instance shares the instance id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub process_definition_id: String,
    pub business_key: Option<String>,
    pub tenant_id: Option<String>,
    pub state: ProcessInstanceState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    pub version: i32,
}

impl_entity!(ProcessInstance, EntityKind::ProcessInstance);

impl ProcessInstance {
    pub fn is_ended(&self) -> bool {
        self.state != ProcessInstanceState::Active
    }
}

// =============================================================================
// Execution
// =============================================================================

/// Lifecycle of one execution tree node
///
/// An execution that ends is removed from the tree, so there is no ended
/// state: a missing row is an ended execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Created,
    Active,
    Waiting,
    Leaving,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Active => write!(f, "active"),
            Self::Waiting => write!(f, "waiting"),
            Self::Leaving => write!(f, "leaving"),
        }
    }
}

impl std::str::FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "active" => Ok(Self::Active),
            "waiting" => Ok(Self::Waiting),
            "leaving" => Ok(Self::Leaving),
            other => Err(format!("unknown execution state: {other}")),
        }
    }
}

/// Returns `true` if an execution may move from `from` to `to`.
#[must_use]
pub fn can_transition_execution(from: ExecutionState, to: ExecutionState) -> bool {
    use ExecutionState::*;

    from == to
        || matches!(
            (from, to),
            (Created, Active)
                | (Created, Waiting)
                | (Active, Waiting)
                | (Active, Leaving)
                | (Waiting, Active)
                | (Waiting, Leaving)
                | (Leaving, Active)
                | (Leaving, Waiting)
        )
}

/// One point of control inside a process instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub process_definition_id: String,

    /// Flow node the execution currently sits on (`None` for the root)
    pub activity_id: Option<String>,

    /// Owns local variables and scope-level subscriptions (root, sub-process)
    pub is_scope: bool,

    /// One of several sibling branches running in parallel
    pub is_concurrent: bool,

    /// Inactive executions wait at a joining gateway
    pub is_active: bool,

    pub state: ExecutionState,
    pub variables: Variables,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub version: i32,
}

impl_entity!(Execution, EntityKind::Execution);

impl Execution {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Move to a new lifecycle state, rejecting illegal transitions
    pub fn set_state(&mut self, to: ExecutionState) -> Result<(), EngineError> {
        if can_transition_execution(self.state, to) {
            self.state = to;
            Ok(())
        } else {
            Err(EngineError::IllegalState(format!(
                "execution {} cannot move from {} to {}",
                self.id, self.state, to
            )))
        }
    }
}

// =============================================================================
// Event subscription
// =============================================================================

/// Kind of external trigger a subscription waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    Signal,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message => write!(f, "message"),
            Self::Signal => write!(f, "signal"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "signal" => Ok(Self::Signal),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// A pending wait for a named message or signal, scoped to an execution
///
/// Timers are not subscriptions: they are timer jobs owned by the same
/// execution and are cancelled together with its subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: Uuid,
    pub event_type: EventType,
    pub event_name: String,
    pub execution_id: Uuid,
    pub process_instance_id: Uuid,

    /// The catching flow node (catch event, boundary event or event sub-process start)
    pub activity_id: String,

    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub version: i32,
}

impl_entity!(EventSubscription, EntityKind::EventSubscription);

// =============================================================================
// Job
// =============================================================================

/// Job type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Becomes executable at its due date
    Timer,

    /// Executable as soon as it is committed
    Async,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timer => write!(f, "timer"),
            Self::Async => write!(f, "async"),
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timer" => Ok(Self::Timer),
            "async" => Ok(Self::Async),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Durable job state
///
/// `Locked` is not a separate state: an `Executable` job with a live lease
/// (`lock_owner` set and `lock_expiration_time` in the future) is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Timer,
    Executable,
    DeadLetter,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timer => write!(f, "timer"),
            Self::Executable => write!(f, "executable"),
            Self::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timer" => Ok(Self::Timer),
            "executable" => Ok(Self::Executable),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Durable record of deferred work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub state: JobState,
    pub process_instance_id: Option<Uuid>,
    pub execution_id: Option<Uuid>,

    /// Flow node the job belongs to (timer catch event, boundary event, async node)
    pub element_id: Option<String>,

    pub handler_type: String,
    pub handler_configuration: serde_json::Value,

    /// `None` means immediately executable
    pub due_date: Option<DateTime<Utc>>,

    pub retries: u32,
    pub exception_message: Option<String>,
    pub exception_stacktrace: Option<String>,
    pub tenant_id: Option<String>,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
    pub version: i32,
}

impl_entity!(Job, EntityKind::Job);

impl Job {
    /// Whether another executor currently holds a live lease on this job
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expiration_time) {
            (Some(_), Some(expires)) => expires > now,
            _ => false,
        }
    }

    /// Whether the acquisition query may pick this job up at `now`
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        if self.is_locked(now) {
            return false;
        }
        match self.state {
            JobState::Timer => self.due_date.is_some_and(|due| due <= now),
            JobState::Executable => self.due_date.map_or(true, |due| due <= now),
            JobState::DeadLetter => false,
        }
    }

    /// Ordering key for acquisition: oldest due date first, then primary key
    pub fn acquisition_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.due_date.unwrap_or(self.create_time), self.id)
    }

    pub fn lock(&mut self, owner: &str, expires: DateTime<Utc>) {
        self.lock_owner = Some(owner.to_string());
        self.lock_expiration_time = Some(expires);
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }
}
