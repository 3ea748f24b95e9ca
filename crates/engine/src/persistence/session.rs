//! Unit-of-work entity cache
//!
//! The [`EntitySession`] is the only way runtime code reads and writes
//! entities while a command runs. The first access to a process instance
//! loads the whole instance (row, execution tree, subscriptions, jobs); every
//! later read and write is served from the cache. At unit-of-work close the
//! session diffs the cache against what was loaded and commits the result as a
//! single [`ChangeSet`].

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};
use uuid::Uuid;

use super::entity::{Entity, EntityKind, EventSubscription, Execution, Job, ProcessInstance};
use super::store::{ChangeSet, EntityRecord, EntityRef, RuntimeStore};
use crate::config::EngineConfig;
use crate::context::{Session, SessionFactory};
use crate::error::EngineError;

struct Cached<T> {
    current: T,
    /// Snapshot as loaded; `None` for entities created in this unit of work
    original: Option<T>,
    deleted: bool,
    /// Write a version-checked update even without changes
    touched: bool,
}

/// Cache of one entity type, ordered by id (v7 ids sort by creation)
struct EntityCache<T> {
    entries: BTreeMap<Uuid, Cached<T>>,
}

impl<T> Default for EntityCache<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: Entity + PartialEq> EntityCache<T> {
    fn get(&self, id: Uuid) -> Option<&T> {
        self.entries
            .get(&id)
            .filter(|c| !c.deleted)
            .map(|c| &c.current)
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut T> {
        self.entries
            .get_mut(&id)
            .filter(|c| !c.deleted)
            .map(|c| &mut c.current)
    }

    /// Known to this session, deleted or not
    fn is_known(&self, id: Uuid) -> bool {
        self.entries.contains_key(&id)
    }

    fn attach(&mut self, entity: T) {
        self.entries.entry(entity.id()).or_insert_with(|| Cached {
            original: Some(entity.clone()),
            current: entity,
            deleted: false,
            touched: false,
        });
    }

    fn insert(&mut self, entity: T) -> Result<(), EngineError> {
        let id = entity.id();
        if self.entries.contains_key(&id) {
            return Err(EngineError::illegal_state(format!(
                "{} {id} is already part of this unit of work",
                T::KIND
            )));
        }
        self.entries.insert(
            id,
            Cached {
                current: entity,
                original: None,
                deleted: false,
                touched: false,
            },
        );
        Ok(())
    }

    fn touch(&mut self, id: Uuid) -> bool {
        match self.entries.get_mut(&id) {
            Some(cached) if !cached.deleted => {
                cached.touched = true;
                true
            }
            _ => false,
        }
    }

    fn delete(&mut self, id: Uuid) -> bool {
        match self.entries.get_mut(&id) {
            Some(cached) if !cached.deleted => {
                cached.deleted = true;
                true
            }
            _ => false,
        }
    }

    fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.entries
            .values()
            .filter(|c| !c.deleted)
            .map(|c| &c.current)
    }

    fn collect_writes(&self, changes: &mut ChangeSet, record: fn(T) -> EntityRecord) {
        for cached in self.entries.values() {
            match (&cached.original, cached.deleted) {
                (None, false) => changes.inserts.push(record(cached.current.clone())),
                (Some(original), false) if cached.touched || *original != cached.current => {
                    let mut updated = cached.current.clone();
                    updated.set_version(original.version());
                    changes.updates.push(record(updated));
                }
                _ => {}
            }
        }
    }

    fn collect_deletes(&self, changes: &mut ChangeSet) {
        // Reverse creation order: children before parents
        for cached in self.entries.values().rev() {
            if let (Some(original), true) = (&cached.original, cached.deleted) {
                changes.deletes.push(EntityRef {
                    kind: T::KIND,
                    id: original.id(),
                    version: original.version(),
                });
            }
        }
    }
}

/// Entity cache of one unit of work
pub struct EntitySession {
    store: Arc<dyn RuntimeStore>,
    process_instances: EntityCache<ProcessInstance>,
    executions: EntityCache<Execution>,
    subscriptions: EntityCache<EventSubscription>,
    jobs: EntityCache<Job>,
    loaded_instances: HashSet<Uuid>,
}

impl EntitySession {
    pub fn new(store: Arc<dyn RuntimeStore>) -> Self {
        Self {
            store,
            process_instances: EntityCache::default(),
            executions: EntityCache::default(),
            subscriptions: EntityCache::default(),
            jobs: EntityCache::default(),
            loaded_instances: HashSet::new(),
        }
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Load a process instance with its execution tree, subscriptions and jobs
    pub async fn load_process_instance(&mut self, id: Uuid) -> Result<(), EngineError> {
        if self.loaded_instances.contains(&id) || self.process_instances.is_known(id) {
            return Ok(());
        }

        let instance = self
            .store
            .find_process_instance(id)
            .await?
            .ok_or_else(|| EngineError::not_found(EntityKind::ProcessInstance, id))?;
        let executions = self.store.executions_by_process_instance(id).await?;
        let subscriptions = self.store.subscriptions_by_process_instance(id).await?;
        let jobs = self.store.jobs_by_process_instance(id).await?;

        trace!(
            process_instance_id = %id,
            executions = executions.len(),
            subscriptions = subscriptions.len(),
            jobs = jobs.len(),
            "loaded process instance"
        );

        self.process_instances.attach(instance);
        executions.into_iter().for_each(|e| self.executions.attach(e));
        subscriptions
            .into_iter()
            .for_each(|s| self.subscriptions.attach(s));
        jobs.into_iter().for_each(|j| self.jobs.attach(j));
        self.loaded_instances.insert(id);
        Ok(())
    }

    /// Load the instance owning an execution
    ///
    /// Returns the process instance id, or `None` if the execution no longer
    /// exists.
    pub async fn load_execution(&mut self, id: Uuid) -> Result<Option<Uuid>, EngineError> {
        if self.executions.is_known(id) {
            return Ok(self.executions.get(id).map(|e| e.process_instance_id));
        }
        match self.store.find_execution(id).await? {
            Some(execution) => {
                let process_instance_id = execution.process_instance_id;
                self.load_process_instance(process_instance_id).await?;
                Ok(self
                    .executions
                    .get(id)
                    .map(|e| e.process_instance_id))
            }
            None => Ok(None),
        }
    }

    /// Load a single job row (without its process instance)
    pub async fn load_job(&mut self, id: Uuid) -> Result<Option<Job>, EngineError> {
        if !self.jobs.is_known(id) {
            match self.store.find_job(id).await? {
                Some(job) => self.jobs.attach(job),
                None => return Ok(None),
            }
        }
        Ok(self.jobs.get(id).cloned())
    }

    /// Attach job rows read by a query
    pub fn attach_jobs(&mut self, jobs: impl IntoIterator<Item = Job>) {
        jobs.into_iter().for_each(|j| self.jobs.attach(j));
    }

    pub fn store(&self) -> &Arc<dyn RuntimeStore> {
        &self.store
    }

    // =========================================================================
    // Process instances
    // =========================================================================

    pub fn process_instance(&self, id: Uuid) -> Result<&ProcessInstance, EngineError> {
        self.process_instances
            .get(id)
            .ok_or_else(|| EngineError::not_found(EntityKind::ProcessInstance, id))
    }

    pub fn process_instance_mut(&mut self, id: Uuid) -> Result<&mut ProcessInstance, EngineError> {
        self.process_instances
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(EntityKind::ProcessInstance, id))
    }

    pub fn insert_process_instance(&mut self, instance: ProcessInstance) -> Result<(), EngineError> {
        self.loaded_instances.insert(instance.id);
        self.process_instances.insert(instance)
    }

    pub fn delete_process_instance(&mut self, id: Uuid) -> bool {
        self.process_instances.delete(id)
    }

    // =========================================================================
    // Executions
    // =========================================================================

    pub fn execution(&self, id: Uuid) -> Result<&Execution, EngineError> {
        self.executions
            .get(id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Execution, id))
    }

    pub fn execution_mut(&mut self, id: Uuid) -> Result<&mut Execution, EngineError> {
        self.executions
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Execution, id))
    }

    pub fn execution_exists(&self, id: Uuid) -> bool {
        self.executions.get(id).is_some()
    }

    pub fn insert_execution(&mut self, execution: Execution) -> Result<(), EngineError> {
        self.executions.insert(execution)
    }

    /// Force a version-checked write of an execution at flush
    ///
    /// Units of work that decide on the state of a scope's children (joins,
    /// the last child ending) touch the scope so that two of them deciding
    /// concurrently cannot both commit.
    pub fn touch_execution(&mut self, id: Uuid) -> Result<(), EngineError> {
        if self.executions.touch(id) {
            Ok(())
        } else {
            Err(EngineError::not_found(EntityKind::Execution, id))
        }
    }

    /// Remove one execution row; subscriptions and jobs are left alone
    pub fn delete_execution(&mut self, id: Uuid) -> bool {
        self.executions.delete(id)
    }

    /// Live executions of an instance in creation order
    pub fn executions(&self, process_instance_id: Uuid) -> impl Iterator<Item = &Execution> + '_ {
        self.executions
            .values()
            .filter(move |e| e.process_instance_id == process_instance_id)
    }

    /// Direct children of an execution in creation order
    pub fn child_ids(&self, parent_id: Uuid) -> Vec<Uuid> {
        self.executions
            .values()
            .filter(|e| e.parent_id == Some(parent_id))
            .map(|e| e.id)
            .collect()
    }

    // =========================================================================
    // Event subscriptions
    // =========================================================================

    pub fn subscription(&self, id: Uuid) -> Option<&EventSubscription> {
        self.subscriptions.get(id)
    }

    pub fn insert_subscription(&mut self, subscription: EventSubscription) -> Result<(), EngineError> {
        self.subscriptions.insert(subscription)
    }

    pub fn delete_subscription(&mut self, id: Uuid) -> bool {
        self.subscriptions.delete(id)
    }

    /// Subscriptions owned by an execution in creation order
    pub fn subscriptions_of(&self, execution_id: Uuid) -> Vec<EventSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect()
    }

    pub fn subscriptions_in(&self, process_instance_id: Uuid) -> Vec<EventSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.process_instance_id == process_instance_id)
            .cloned()
            .collect()
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    pub fn job(&self, id: Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn job_mut(&mut self, id: Uuid) -> Result<&mut Job, EngineError> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Job, id))
    }

    pub fn insert_job(&mut self, job: Job) -> Result<(), EngineError> {
        self.jobs.insert(job)
    }

    pub fn delete_job(&mut self, id: Uuid) -> bool {
        self.jobs.delete(id)
    }

    /// Ids of jobs owned by an execution
    pub fn job_ids_of(&self, execution_id: Uuid) -> Vec<Uuid> {
        self.jobs
            .values()
            .filter(|j| j.execution_id == Some(execution_id))
            .map(|j| j.id)
            .collect()
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Writes this session would commit right now
    pub fn pending_changes(&self) -> ChangeSet {
        let mut changes = ChangeSet::default();

        self.process_instances
            .collect_writes(&mut changes, EntityRecord::ProcessInstance);
        self.executions
            .collect_writes(&mut changes, EntityRecord::Execution);
        self.subscriptions
            .collect_writes(&mut changes, EntityRecord::Subscription);
        self.jobs.collect_writes(&mut changes, EntityRecord::Job);

        self.jobs.collect_deletes(&mut changes);
        self.subscriptions.collect_deletes(&mut changes);
        self.executions.collect_deletes(&mut changes);
        self.process_instances.collect_deletes(&mut changes);

        changes
    }
}

#[async_trait]
impl Session for EntitySession {
    async fn flush(&mut self) -> Result<(), EngineError> {
        let changes = self.pending_changes();
        if changes.is_empty() {
            return Ok(());
        }
        debug!(
            inserts = changes.inserts.len(),
            updates = changes.updates.len(),
            deletes = changes.deletes.len(),
            "flushing entity session"
        );
        self.store.commit(changes).await?;
        Ok(())
    }

    async fn close(&mut self, _committed: bool) {}

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Opens an [`EntitySession`] over the configured store
#[derive(Debug, Default)]
pub struct EntitySessionFactory;

impl SessionFactory for EntitySessionFactory {
    fn session_type(&self) -> TypeId {
        TypeId::of::<EntitySession>()
    }

    fn open(&self, config: &EngineConfig) -> Box<dyn Session> {
        Box::new(EntitySession::new(Arc::clone(config.store())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{ExecutionState, InMemoryStore, ProcessInstanceState, Variables};
    use chrono::Utc;

    fn instance() -> ProcessInstance {
        ProcessInstance {
            id: Uuid::now_v7(),
            process_definition_id: "p:1".into(),
            business_key: None,
            tenant_id: None,
            state: ProcessInstanceState::Active,
            start_time: Utc::now(),
            end_time: None,
            end_reason: None,
            version: 0,
        }
    }

    fn execution(pi: Uuid, parent: Option<Uuid>) -> Execution {
        Execution {
            id: if parent.is_none() { pi } else { Uuid::now_v7() },
            process_instance_id: pi,
            parent_id: parent,
            process_definition_id: "p:1".into(),
            activity_id: parent.map(|_| "task".to_string()),
            is_scope: parent.is_none(),
            is_concurrent: false,
            is_active: true,
            state: ExecutionState::Active,
            variables: Variables::new(),
            tenant_id: None,
            created_at: Utc::now(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_insert_then_load_and_update() {
        let store = Arc::new(InMemoryStore::new());
        let pi = instance();
        let pi_id = pi.id;

        let mut session = EntitySession::new(store.clone());
        session.insert_process_instance(pi).unwrap();
        session.insert_execution(execution(pi_id, None)).unwrap();
        session.insert_execution(execution(pi_id, Some(pi_id))).unwrap();
        assert_eq!(session.pending_changes().inserts.len(), 3);
        session.flush().await.unwrap();

        let mut session = EntitySession::new(store.clone());
        session.load_process_instance(pi_id).await.unwrap();
        let child = session.child_ids(pi_id)[0];
        assert!(session.pending_changes().is_empty());

        session.execution_mut(child).unwrap().state = ExecutionState::Waiting;
        let changes = session.pending_changes();
        assert_eq!(changes.updates.len(), 1);
        assert_eq!(changes.updates[0].version(), 0);
        session.flush().await.unwrap();

        let stored = store.find_execution(child).await.unwrap().unwrap();
        assert_eq!(stored.state, ExecutionState::Waiting);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_touched_scope_conflicts_with_concurrent_touch() {
        let store = Arc::new(InMemoryStore::new());
        let pi = instance();
        let pi_id = pi.id;
        let mut session = EntitySession::new(store.clone());
        session.insert_process_instance(pi).unwrap();
        session.insert_execution(execution(pi_id, None)).unwrap();
        session.flush().await.unwrap();

        let mut first = EntitySession::new(store.clone());
        let mut second = EntitySession::new(store.clone());
        first.load_process_instance(pi_id).await.unwrap();
        second.load_process_instance(pi_id).await.unwrap();

        first.touch_execution(pi_id).unwrap();
        second.touch_execution(pi_id).unwrap();
        let changes = first.pending_changes();
        assert_eq!(changes.updates.len(), 1);
        assert_eq!(changes.updates[0].id(), pi_id);

        first.flush().await.unwrap();
        let err = second.flush().await.unwrap_err();
        assert!(err.is_optimistic_lock());
        assert_eq!(store.find_execution(pi_id).await.unwrap().unwrap().version, 1);
        assert!(first.touch_execution(Uuid::now_v7()).is_err());
    }

    #[tokio::test]
    async fn test_created_and_deleted_in_same_session_is_not_written() {
        let store = Arc::new(InMemoryStore::new());
        let pi = instance();
        let pi_id = pi.id;

        let mut session = EntitySession::new(store.clone());
        session.insert_process_instance(pi).unwrap();
        let root = execution(pi_id, None);
        session.insert_execution(root).unwrap();
        let child = execution(pi_id, Some(pi_id));
        let child_id = child.id;
        session.insert_execution(child).unwrap();
        assert!(session.delete_execution(child_id));
        assert!(!session.delete_execution(child_id));

        let changes = session.pending_changes();
        assert_eq!(changes.inserts.len(), 2);
        assert!(changes.deletes.is_empty());
        assert!(!session.execution_exists(child_id));
    }

    #[tokio::test]
    async fn test_deletes_children_before_parents() {
        let store = Arc::new(InMemoryStore::new());
        let pi = instance();
        let pi_id = pi.id;

        let mut session = EntitySession::new(store.clone());
        session.insert_process_instance(pi).unwrap();
        session.insert_execution(execution(pi_id, None)).unwrap();
        session.insert_execution(execution(pi_id, Some(pi_id))).unwrap();
        session.flush().await.unwrap();

        let mut session = EntitySession::new(store.clone());
        session.load_process_instance(pi_id).await.unwrap();
        let child = session.child_ids(pi_id)[0];
        session.delete_execution(pi_id);
        session.delete_execution(child);
        session.delete_process_instance(pi_id);

        let changes = session.pending_changes();
        let ids: Vec<_> = changes.deletes.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![child, pi_id, pi_id]);
        assert_eq!(changes.deletes[2].kind, EntityKind::ProcessInstance);

        session.flush().await.unwrap();
        assert_eq!(store.execution_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_instance_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let mut session = EntitySession::new(store);
        let err = session
            .load_process_instance(Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::NotFound {
                kind: EntityKind::ProcessInstance,
                ..
            }
        ));
        assert_eq!(session.load_execution(Uuid::now_v7()).await.unwrap(), None);
    }
}
