//! Persistence layer for runtime state
//!
//! This module provides:
//! - [`RuntimeStore`] trait: the optimistic-locking store collaborator
//! - [`InMemoryStore`] for tests and embedding
//! - [`PostgresStore`] for production
//! - [`EntitySession`]: the per-unit-of-work entity cache flushed as one [`ChangeSet`]

mod entity;
mod memory;
mod postgres;
mod session;
mod store;

pub use entity::{
    can_transition_execution, Entity, EntityKind, EventSubscription, EventType, Execution,
    ExecutionState, Job, JobState, JobType, ProcessInstance, ProcessInstanceState, Variables,
};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use session::{EntitySession, EntitySessionFactory};
pub use store::{
    ChangeSet, EntityRecord, EntityRef, JobQuery, ProcessInstanceQuery, RuntimeStore,
    StoreError, SubscriptionQuery,
};
