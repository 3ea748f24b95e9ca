//! PostgreSQL implementation of RuntimeStore
//!
//! Production persistence using PostgreSQL with:
//! - One transaction per unit-of-work change set
//! - Optimistic concurrency control via a `version` column on every table
//! - Acquisition query ordered by due date with the same eligibility rules as
//!   the in-memory store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::entity::*;
use super::store::*;

/// PostgreSQL implementation of RuntimeStore
///
/// # Example
///
/// ```ignore
/// use bpmflow_engine::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/bpmflow").await?;
/// let store = PostgresStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .is_some_and(|code| code == "23505")
}

fn parse<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T, StoreError> {
    value.parse().map_err(StoreError::Serialization)
}

fn variables_from_json(value: serde_json::Value) -> Result<Variables, StoreError> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Null => Ok(Variables::new()),
        other => Err(StoreError::Serialization(format!(
            "expected variables object, got {other}"
        ))),
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn process_instance_from_row(row: &PgRow) -> Result<ProcessInstance, StoreError> {
    let state: String = row.get("state");
    Ok(ProcessInstance {
        id: row.get("id"),
        process_definition_id: row.get("process_definition_id"),
        business_key: row.get("business_key"),
        tenant_id: row.get("tenant_id"),
        state: parse(&state)?,
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        end_reason: row.get("end_reason"),
        version: row.get("version"),
    })
}

fn execution_from_row(row: &PgRow) -> Result<Execution, StoreError> {
    let state: String = row.get("state");
    Ok(Execution {
        id: row.get("id"),
        process_instance_id: row.get("process_instance_id"),
        parent_id: row.get("parent_id"),
        process_definition_id: row.get("process_definition_id"),
        activity_id: row.get("activity_id"),
        is_scope: row.get("is_scope"),
        is_concurrent: row.get("is_concurrent"),
        is_active: row.get("is_active"),
        state: parse(&state)?,
        variables: variables_from_json(row.get("variables"))?,
        tenant_id: row.get("tenant_id"),
        created_at: row.get("created_at"),
        version: row.get("version"),
    })
}

fn subscription_from_row(row: &PgRow) -> Result<EventSubscription, StoreError> {
    let event_type: String = row.get("event_type");
    Ok(EventSubscription {
        id: row.get("id"),
        event_type: parse(&event_type)?,
        event_name: row.get("event_name"),
        execution_id: row.get("execution_id"),
        process_instance_id: row.get("process_instance_id"),
        activity_id: row.get("activity_id"),
        tenant_id: row.get("tenant_id"),
        created_at: row.get("created_at"),
        version: row.get("version"),
    })
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let job_type: String = row.get("job_type");
    let state: String = row.get("state");
    Ok(Job {
        id: row.get("id"),
        job_type: parse(&job_type)?,
        state: parse(&state)?,
        process_instance_id: row.get("process_instance_id"),
        execution_id: row.get("execution_id"),
        element_id: row.get("element_id"),
        handler_type: row.get("handler_type"),
        handler_configuration: row.get("handler_configuration"),
        due_date: row.get("due_date"),
        retries: row.get::<i32, _>("retries").max(0) as u32,
        exception_message: row.get("exception_message"),
        exception_stacktrace: row.get("exception_stacktrace"),
        tenant_id: row.get("tenant_id"),
        lock_owner: row.get("lock_owner"),
        lock_expiration_time: row.get("lock_expiration_time"),
        create_time: row.get("create_time"),
        version: row.get("version"),
    })
}

fn collect<T>(
    rows: Vec<PgRow>,
    map: fn(&PgRow) -> Result<T, StoreError>,
) -> Result<Vec<T>, StoreError> {
    rows.iter().map(map).collect()
}

// =============================================================================
// Writes
// =============================================================================

async fn insert_record(
    tx: &mut Transaction<'_, Postgres>,
    record: &EntityRecord,
) -> Result<(), sqlx::Error> {
    match record {
        EntityRecord::ProcessInstance(pi) => {
            sqlx::query(
                r#"
                INSERT INTO bpm_process_instances
                    (id, process_definition_id, business_key, tenant_id, state,
                     start_time, end_time, end_reason, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(pi.id)
            .bind(&pi.process_definition_id)
            .bind(&pi.business_key)
            .bind(&pi.tenant_id)
            .bind(pi.state.to_string())
            .bind(pi.start_time)
            .bind(pi.end_time)
            .bind(&pi.end_reason)
            .bind(pi.version)
            .execute(&mut **tx)
            .await?;
        }
        EntityRecord::Execution(ex) => {
            sqlx::query(
                r#"
                INSERT INTO bpm_executions
                    (id, process_instance_id, parent_id, process_definition_id, activity_id,
                     is_scope, is_concurrent, is_active, state, variables, tenant_id,
                     created_at, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(ex.id)
            .bind(ex.process_instance_id)
            .bind(ex.parent_id)
            .bind(&ex.process_definition_id)
            .bind(&ex.activity_id)
            .bind(ex.is_scope)
            .bind(ex.is_concurrent)
            .bind(ex.is_active)
            .bind(ex.state.to_string())
            .bind(serde_json::Value::Object(ex.variables.clone()))
            .bind(&ex.tenant_id)
            .bind(ex.created_at)
            .bind(ex.version)
            .execute(&mut **tx)
            .await?;
        }
        EntityRecord::Subscription(sub) => {
            sqlx::query(
                r#"
                INSERT INTO bpm_event_subscriptions
                    (id, event_type, event_name, execution_id, process_instance_id,
                     activity_id, tenant_id, created_at, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(sub.id)
            .bind(sub.event_type.to_string())
            .bind(&sub.event_name)
            .bind(sub.execution_id)
            .bind(sub.process_instance_id)
            .bind(&sub.activity_id)
            .bind(&sub.tenant_id)
            .bind(sub.created_at)
            .bind(sub.version)
            .execute(&mut **tx)
            .await?;
        }
        EntityRecord::Job(job) => {
            sqlx::query(
                r#"
                INSERT INTO bpm_jobs
                    (id, job_type, state, process_instance_id, execution_id, element_id,
                     handler_type, handler_configuration, due_date, retries,
                     exception_message, exception_stacktrace, tenant_id, lock_owner,
                     lock_expiration_time, create_time, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                "#,
            )
            .bind(job.id)
            .bind(job.job_type.to_string())
            .bind(job.state.to_string())
            .bind(job.process_instance_id)
            .bind(job.execution_id)
            .bind(&job.element_id)
            .bind(&job.handler_type)
            .bind(&job.handler_configuration)
            .bind(job.due_date)
            .bind(job.retries as i32)
            .bind(&job.exception_message)
            .bind(&job.exception_stacktrace)
            .bind(&job.tenant_id)
            .bind(&job.lock_owner)
            .bind(job.lock_expiration_time)
            .bind(job.create_time)
            .bind(job.version)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

/// Returns the number of rows the version-checked update touched
async fn update_record(
    tx: &mut Transaction<'_, Postgres>,
    record: &EntityRecord,
) -> Result<u64, sqlx::Error> {
    let result = match record {
        EntityRecord::ProcessInstance(pi) => {
            sqlx::query(
                r#"
                UPDATE bpm_process_instances
                SET business_key = $3, state = $4, end_time = $5, end_reason = $6,
                    version = version + 1
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(pi.id)
            .bind(pi.version)
            .bind(&pi.business_key)
            .bind(pi.state.to_string())
            .bind(pi.end_time)
            .bind(&pi.end_reason)
            .execute(&mut **tx)
            .await?
        }
        EntityRecord::Execution(ex) => {
            sqlx::query(
                r#"
                UPDATE bpm_executions
                SET parent_id = $3, activity_id = $4, is_scope = $5, is_concurrent = $6,
                    is_active = $7, state = $8, variables = $9, version = version + 1
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(ex.id)
            .bind(ex.version)
            .bind(ex.parent_id)
            .bind(&ex.activity_id)
            .bind(ex.is_scope)
            .bind(ex.is_concurrent)
            .bind(ex.is_active)
            .bind(ex.state.to_string())
            .bind(serde_json::Value::Object(ex.variables.clone()))
            .execute(&mut **tx)
            .await?
        }
        EntityRecord::Subscription(sub) => {
            sqlx::query(
                r#"
                UPDATE bpm_event_subscriptions
                SET execution_id = $3, activity_id = $4, version = version + 1
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(sub.id)
            .bind(sub.version)
            .bind(sub.execution_id)
            .bind(&sub.activity_id)
            .execute(&mut **tx)
            .await?
        }
        EntityRecord::Job(job) => {
            sqlx::query(
                r#"
                UPDATE bpm_jobs
                SET state = $3, execution_id = $4, handler_configuration = $5, due_date = $6,
                    retries = $7, exception_message = $8, exception_stacktrace = $9,
                    lock_owner = $10, lock_expiration_time = $11, version = version + 1
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(job.id)
            .bind(job.version)
            .bind(job.state.to_string())
            .bind(job.execution_id)
            .bind(&job.handler_configuration)
            .bind(job.due_date)
            .bind(job.retries as i32)
            .bind(&job.exception_message)
            .bind(&job.exception_stacktrace)
            .bind(&job.lock_owner)
            .bind(job.lock_expiration_time)
            .execute(&mut **tx)
            .await?
        }
    };
    Ok(result.rows_affected())
}

async fn delete_record(
    tx: &mut Transaction<'_, Postgres>,
    target: &EntityRef,
) -> Result<u64, sqlx::Error> {
    let table = match target.kind {
        EntityKind::ProcessInstance => "bpm_process_instances",
        EntityKind::Execution => "bpm_executions",
        EntityKind::EventSubscription => "bpm_event_subscriptions",
        EntityKind::Job => "bpm_jobs",
    };
    let sql = format!("DELETE FROM {table} WHERE id = $1 AND version = $2");
    let result = sqlx::query(&sql)
        .bind(target.id)
        .bind(target.version)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl RuntimeStore for PostgresStore {
    #[instrument(skip(self))]
    async fn find_process_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>, StoreError> {
        let row = sqlx::query("SELECT * FROM bpm_process_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(process_instance_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_process_instances(
        &self,
        query: &ProcessInstanceQuery,
    ) -> Result<Vec<ProcessInstance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM bpm_process_instances
            WHERE ($1::text IS NULL OR process_definition_id = $1)
              AND ($2::text IS NULL OR business_key = $2)
              AND ($3::text IS NULL OR state = $3)
            ORDER BY start_time, id
            "#,
        )
        .bind(&query.process_definition_id)
        .bind(&query.business_key)
        .bind(query.state.map(|s| s.to_string()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows, process_instance_from_row)
    }

    #[instrument(skip(self))]
    async fn find_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query("SELECT * FROM bpm_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn executions_by_process_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM bpm_executions WHERE process_instance_id = $1 ORDER BY created_at, id",
        )
        .bind(process_instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows, execution_from_row)
    }

    #[instrument(skip(self))]
    async fn subscriptions_by_process_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<EventSubscription>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM bpm_event_subscriptions
            WHERE process_instance_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(process_instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows, subscription_from_row)
    }

    #[instrument(skip(self))]
    async fn find_subscriptions(
        &self,
        query: &SubscriptionQuery,
    ) -> Result<Vec<EventSubscription>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM bpm_event_subscriptions
            WHERE ($1::text IS NULL OR event_type = $1)
              AND ($2::text IS NULL OR event_name = $2)
              AND ($3::uuid IS NULL OR process_instance_id = $3)
              AND ($4::uuid IS NULL OR execution_id = $4)
            ORDER BY created_at, id
            "#,
        )
        .bind(query.event_type.map(|t| t.to_string()))
        .bind(&query.event_name)
        .bind(query.process_instance_id)
        .bind(query.execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows, subscription_from_row)
    }

    #[instrument(skip(self))]
    async fn jobs_by_process_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM bpm_jobs WHERE process_instance_id = $1 ORDER BY create_time, id",
        )
        .bind(process_instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows, job_from_row)
    }

    #[instrument(skip(self))]
    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM bpm_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM bpm_jobs
            WHERE ($1::uuid IS NULL OR process_instance_id = $1)
              AND ($2::uuid IS NULL OR execution_id = $2)
              AND ($3::text IS NULL OR job_type = $3)
              AND ($4::text IS NULL OR state = $4)
              AND ($5::text IS NULL OR handler_type = $5)
              AND ($6::text IS NULL OR lock_owner = $6)
            ORDER BY create_time, id
            "#,
        )
        .bind(query.process_instance_id)
        .bind(query.execution_id)
        .bind(query.job_type.map(|t| t.to_string()))
        .bind(query.state.map(|s| s.to_string()))
        .bind(&query.handler_type)
        .bind(&query.lock_owner)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        collect(rows, job_from_row)
    }

    #[instrument(skip(self))]
    async fn find_acquirable_jobs(
        &self,
        now: DateTime<Utc>,
        max_jobs: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM bpm_jobs
            WHERE ((state = 'timer' AND due_date <= $1)
                   OR (state = 'executable' AND (due_date IS NULL OR due_date <= $1)))
              AND (lock_owner IS NULL OR lock_expiration_time IS NULL
                   OR lock_expiration_time <= $1)
            ORDER BY COALESCE(due_date, create_time), id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(max_jobs as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to query acquirable jobs: {}", e);
            db_err(e)
        })?;
        collect(rows, job_from_row)
    }

    #[instrument(skip(self, changes), fields(changes = changes.len()))]
    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for record in &changes.inserts {
            insert_record(&mut tx, record).await.map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateKey {
                        kind: record.kind(),
                        id: record.id(),
                    }
                } else {
                    error!("Failed to insert {}: {}", record.kind(), e);
                    db_err(e)
                }
            })?;
        }

        for record in &changes.updates {
            let affected = update_record(&mut tx, record).await.map_err(db_err)?;
            if affected == 0 {
                // Dropping the transaction rolls back
                return Err(StoreError::ConcurrencyConflict {
                    kind: record.kind(),
                    id: record.id(),
                    expected: record.version(),
                });
            }
        }

        for target in &changes.deletes {
            let affected = delete_record(&mut tx, target).await.map_err(db_err)?;
            if affected == 0 {
                return Err(StoreError::ConcurrencyConflict {
                    kind: target.kind,
                    id: target.id,
                    expected: target.version,
                });
            }
        }

        tx.commit().await.map_err(db_err)?;

        debug!(
            inserts = changes.inserts.len(),
            updates = changes.updates.len(),
            deletes = changes.deletes.len(),
            "committed change set"
        );
        Ok(())
    }
}
