//! In-memory implementation of RuntimeStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::entity::{Entity, EntityKind, EventSubscription, Execution, Job, JobState, ProcessInstance};
use super::store::*;

#[derive(Default)]
struct Tables {
    process_instances: HashMap<Uuid, ProcessInstance>,
    executions: HashMap<Uuid, Execution>,
    subscriptions: HashMap<Uuid, EventSubscription>,
    jobs: HashMap<Uuid, Job>,
}

impl Tables {
    fn current_version(&self, kind: EntityKind, id: Uuid) -> Option<i32> {
        match kind {
            EntityKind::ProcessInstance => self.process_instances.get(&id).map(Entity::version),
            EntityKind::Execution => self.executions.get(&id).map(Entity::version),
            EntityKind::EventSubscription => self.subscriptions.get(&id).map(Entity::version),
            EntityKind::Job => self.jobs.get(&id).map(Entity::version),
        }
    }

    fn check_version(&self, kind: EntityKind, id: Uuid, expected: i32) -> Result<(), StoreError> {
        match self.current_version(kind, id) {
            Some(actual) if actual == expected => Ok(()),
            _ => Err(StoreError::ConcurrencyConflict { kind, id, expected }),
        }
    }

    fn put(&mut self, record: EntityRecord) {
        match record {
            EntityRecord::ProcessInstance(e) => {
                self.process_instances.insert(e.id, e);
            }
            EntityRecord::Execution(e) => {
                self.executions.insert(e.id, e);
            }
            EntityRecord::Subscription(e) => {
                self.subscriptions.insert(e.id, e);
            }
            EntityRecord::Job(e) => {
                self.jobs.insert(e.id, e);
            }
        }
    }

    fn remove(&mut self, kind: EntityKind, id: Uuid) {
        match kind {
            EntityKind::ProcessInstance => {
                self.process_instances.remove(&id);
            }
            EntityKind::Execution => {
                self.executions.remove(&id);
            }
            EntityKind::EventSubscription => {
                self.subscriptions.remove(&id);
            }
            EntityKind::Job => {
                self.jobs.remove(&id);
            }
        }
    }
}

fn bump_version(record: EntityRecord) -> EntityRecord {
    match record {
        EntityRecord::ProcessInstance(mut e) => {
            e.set_version(e.version + 1);
            EntityRecord::ProcessInstance(e)
        }
        EntityRecord::Execution(mut e) => {
            e.set_version(e.version + 1);
            EntityRecord::Execution(e)
        }
        EntityRecord::Subscription(mut e) => {
            e.set_version(e.version + 1);
            EntityRecord::Subscription(e)
        }
        EntityRecord::Job(mut e) => {
            e.set_version(e.version + 1);
            EntityRecord::Job(e)
        }
    }
}

/// In-memory implementation of RuntimeStore
///
/// This is primarily for testing. All tables sit behind one lock so a
/// change set is validated and applied atomically, which gives the same
/// optimistic-locking semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use bpmflow_engine::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// assert_eq!(store.job_count(), 0);
/// ```
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Number of stored process instances
    pub fn process_instance_count(&self) -> usize {
        self.tables.read().process_instances.len()
    }

    /// Number of live executions across all instances
    pub fn execution_count(&self) -> usize {
        self.tables.read().executions.len()
    }

    /// Number of stored jobs in every state
    pub fn job_count(&self) -> usize {
        self.tables.read().jobs.len()
    }

    /// Number of dead-letter jobs
    pub fn dead_letter_count(&self) -> usize {
        self.tables
            .read()
            .jobs
            .values()
            .filter(|j| j.state == JobState::DeadLetter)
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.tables.write() = Tables::default();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeStore for InMemoryStore {
    async fn find_process_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>, StoreError> {
        Ok(self.tables.read().process_instances.get(&id).cloned())
    }

    async fn find_process_instances(
        &self,
        query: &ProcessInstanceQuery,
    ) -> Result<Vec<ProcessInstance>, StoreError> {
        let tables = self.tables.read();
        let mut instances: Vec<_> = tables
            .process_instances
            .values()
            .filter(|pi| query.matches(pi))
            .cloned()
            .collect();
        instances.sort_by_key(|pi| (pi.start_time, pi.id));
        Ok(instances)
    }

    async fn find_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        Ok(self.tables.read().executions.get(&id).cloned())
    }

    async fn executions_by_process_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<Execution>, StoreError> {
        let tables = self.tables.read();
        let mut executions: Vec<_> = tables
            .executions
            .values()
            .filter(|e| e.process_instance_id == process_instance_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| (e.created_at, e.id));
        Ok(executions)
    }

    async fn subscriptions_by_process_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<EventSubscription>, StoreError> {
        let tables = self.tables.read();
        let mut subs: Vec<_> = tables
            .subscriptions
            .values()
            .filter(|s| s.process_instance_id == process_instance_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| (s.created_at, s.id));
        Ok(subs)
    }

    async fn find_subscriptions(
        &self,
        query: &SubscriptionQuery,
    ) -> Result<Vec<EventSubscription>, StoreError> {
        let tables = self.tables.read();
        let mut subs: Vec<_> = tables
            .subscriptions
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        subs.sort_by_key(|s| (s.created_at, s.id));
        Ok(subs)
    }

    async fn jobs_by_process_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<Job>, StoreError> {
        let tables = self.tables.read();
        let mut jobs: Vec<_> = tables
            .jobs
            .values()
            .filter(|j| j.process_instance_id == Some(process_instance_id))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.create_time, j.id));
        Ok(jobs)
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.tables.read().jobs.get(&id).cloned())
    }

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, StoreError> {
        let tables = self.tables.read();
        let mut jobs: Vec<_> = tables
            .jobs
            .values()
            .filter(|j| query.matches(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.create_time, j.id));
        Ok(jobs)
    }

    async fn find_acquirable_jobs(
        &self,
        now: DateTime<Utc>,
        max_jobs: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let tables = self.tables.read();
        let mut jobs: Vec<_> = tables
            .jobs
            .values()
            .filter(|j| j.is_acquirable(now))
            .cloned()
            .collect();
        jobs.sort_by_key(Job::acquisition_key);
        jobs.truncate(max_jobs);
        Ok(jobs)
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        let mut tables = self.tables.write();

        // Validate everything before touching a single row
        for record in &changes.inserts {
            if tables.current_version(record.kind(), record.id()).is_some() {
                return Err(StoreError::DuplicateKey {
                    kind: record.kind(),
                    id: record.id(),
                });
            }
        }
        for record in &changes.updates {
            tables.check_version(record.kind(), record.id(), record.version())?;
        }
        for delete in &changes.deletes {
            tables.check_version(delete.kind, delete.id, delete.version)?;
        }

        for record in changes.inserts {
            tables.put(record);
        }
        for record in changes.updates {
            tables.put(bump_version(record));
        }
        for delete in changes.deletes {
            tables.remove(delete.kind, delete.id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::entity::JobType;
    use chrono::Duration;

    fn new_job(due: Option<DateTime<Utc>>) -> Job {
        Job {
            id: Uuid::now_v7(),
            job_type: if due.is_some() {
                JobType::Timer
            } else {
                JobType::Async
            },
            state: if due.is_some() {
                JobState::Timer
            } else {
                JobState::Executable
            },
            process_instance_id: None,
            execution_id: None,
            element_id: None,
            handler_type: "test".to_string(),
            handler_configuration: serde_json::json!({}),
            due_date: due,
            retries: 3,
            exception_message: None,
            exception_stacktrace: None,
            tenant_id: None,
            lock_owner: None,
            lock_expiration_time: None,
            create_time: Utc::now(),
            version: 1,
        }
    }

    fn insert(record: EntityRecord) -> ChangeSet {
        ChangeSet {
            inserts: vec![record],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_job() {
        let store = InMemoryStore::new();
        let job = new_job(None);

        store.commit(insert(EntityRecord::Job(job.clone()))).await.unwrap();

        let found = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(found, job);
        assert_eq!(store.job_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = InMemoryStore::new();
        let job = new_job(None);

        store.commit(insert(EntityRecord::Job(job.clone()))).await.unwrap();
        let err = store.commit(insert(EntityRecord::Job(job))).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn test_update_bumps_version() {
        let store = InMemoryStore::new();
        let mut job = new_job(None);
        store.commit(insert(EntityRecord::Job(job.clone()))).await.unwrap();

        job.retries = 2;
        store
            .commit(ChangeSet {
                updates: vec![EntityRecord::Job(job.clone())],
                ..Default::default()
            })
            .await
            .unwrap();

        let found = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(found.version, 2);
        assert_eq!(found.retries, 2);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = InMemoryStore::new();
        let job = new_job(None);
        store.commit(insert(EntityRecord::Job(job.clone()))).await.unwrap();

        let update = ChangeSet {
            updates: vec![EntityRecord::Job(job.clone())],
            ..Default::default()
        };
        store.commit(update.clone()).await.unwrap();

        // Same expected version again: someone else already moved it on
        let err = store.commit(update).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict {
                kind: EntityKind::Job,
                expected: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_commit_applies_nothing() {
        let store = InMemoryStore::new();
        let existing = new_job(None);
        store
            .commit(insert(EntityRecord::Job(existing.clone())))
            .await
            .unwrap();

        let fresh = new_job(None);
        let mut stale = existing.clone();
        stale.version = 7;

        let err = store
            .commit(ChangeSet {
                inserts: vec![EntityRecord::Job(fresh.clone())],
                updates: vec![EntityRecord::Job(stale)],
                deletes: vec![],
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
        assert!(store.find_job(fresh.id).await.unwrap().is_none());
        assert_eq!(store.job_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_row_conflicts() {
        let store = InMemoryStore::new();
        let err = store
            .commit(ChangeSet {
                deletes: vec![EntityRef {
                    kind: EntityKind::Job,
                    id: Uuid::now_v7(),
                    version: 1,
                }],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn test_acquirable_jobs_ordered_by_due_date() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let later = new_job(Some(now - Duration::seconds(1)));
        let earlier = new_job(Some(now - Duration::seconds(60)));
        let future = new_job(Some(now + Duration::seconds(60)));
        let mut dead = new_job(None);
        dead.state = JobState::DeadLetter;

        store
            .commit(ChangeSet {
                inserts: vec![
                    EntityRecord::Job(later.clone()),
                    EntityRecord::Job(earlier.clone()),
                    EntityRecord::Job(future),
                    EntityRecord::Job(dead),
                ],
                ..Default::default()
            })
            .await
            .unwrap();

        let jobs = store.find_acquirable_jobs(now, 10).await.unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![earlier.id, later.id]);

        let limited = store.find_acquirable_jobs(now, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
