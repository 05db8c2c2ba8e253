//! PostgreSQL store implementation.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Entity, Store, UnitOfWork, WorkflowQueryStore, new_etag};
use crate::error::{Error, Result};
use crate::ids::{TransactionId, WorkflowId};
use crate::model::{JsonMap, Narration, WorkflowRecord, WorkflowSnapshot};
use crate::mutation::MutationEnvelope;

/// PostgreSQL-backed store for production use.
///
/// Every record is a JSONB document in one table keyed by `(entity, record_key)`.
/// The etag check takes a row-level lock on the workflow record via
/// `SELECT ... FOR UPDATE`, held until the unit of work commits or is dropped.
///
/// # Database Schema
///
/// Requires tables in the `stageflow` schema (see `migrations/`):
///
/// | Table        | Purpose                                            |
/// |--------------|----------------------------------------------------|
/// | `records`    | Workflow, stage, step, memory, output, participant and trigger records |
/// | `mutations`  | Append-only log of persisted mutation envelopes    |
/// | `narrations` | Append-only log of narrations                      |
///
/// # Concurrency
///
/// Batches for different workflows run concurrently. Two batches checking
/// the same workflow's etag are serialized by the row lock; the second one
/// then sees the first one's etag and fails with
/// [`ConcurrencyConflict`](crate::Error::ConcurrencyConflict).
///
/// # Example
///
/// ```ignore
/// use sqlx::PgPool;
/// use stageflow::{PgStore, WorkflowManager};
///
/// let pool = PgPool::connect("postgres://...").await?;
/// let manager = WorkflowManager::builder(PgStore::new(pool))
///     .register(loan_definition())
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct NarrationRow {
    workflow_id: Uuid,
    transaction_id: Uuid,
    source: String,
    content: String,
    recorded_at: time::OffsetDateTime,
}

impl From<NarrationRow> for Narration {
    fn from(row: NarrationRow) -> Self {
        Narration {
            workflow_id: WorkflowId::from_uuid(row.workflow_id),
            transaction_id: TransactionId::from_uuid(row.transaction_id),
            source: row.source,
            content: row.content,
            timestamp: row.recorded_at,
        }
    }
}

impl PgStore {
    /// Create a new PostgreSQL store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowQueryStore for PgStore {
    async fn list_workflows(
        &self,
        definition_key: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<WorkflowRecord>> {
        let mut builder = sqlx::QueryBuilder::new(
            r#"
            SELECT data
            FROM stageflow.records
            WHERE entity = 'workflow'
            "#,
        );

        if let Some(definition_key) = definition_key {
            builder.push(" AND data->>'definition_key' = ");
            builder.push_bind(definition_key);
        }

        builder.push(" ORDER BY created_at DESC, record_key");
        builder.push(" LIMIT ");
        builder.push_bind(limit as i64);
        builder.push(" OFFSET ");
        builder.push_bind(offset as i64);

        let rows = builder
            .build_query_as::<(Value,)>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|(data,)| serde_json::from_value(data).map_err(Error::from))
            .collect()
    }

    async fn fetch_mutations(&self, workflow_id: WorkflowId) -> Result<Vec<MutationEnvelope>> {
        let rows: Vec<Value> = sqlx::query_scalar(
            r#"
            SELECT envelope
            FROM stageflow.mutations
            WHERE workflow_id = $1
            ORDER BY global_sequence ASC
            "#,
        )
        .bind(workflow_id.into_inner())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MutationEnvelope::from_json).collect()
    }

    async fn fetch_narrations(&self, workflow_id: WorkflowId) -> Result<Vec<Narration>> {
        let rows: Vec<NarrationRow> = sqlx::query_as(
            r#"
            SELECT workflow_id, transaction_id, source, content, recorded_at
            FROM stageflow.narrations
            WHERE workflow_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(workflow_id.into_inner())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Narration::from).collect())
    }
}

impl Store for PgStore {
    type UnitOfWork<'a> = PgUnitOfWork<'a>;

    async fn begin(&self) -> Result<PgUnitOfWork<'_>> {
        let tx = self.pool.begin().await?;
        Ok(PgUnitOfWork { tx })
    }

    async fn load_workflow(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowSnapshot>> {
        let rows: Vec<(String, Value)> = sqlx::query_as(
            r#"
            SELECT entity, data
            FROM stageflow.records
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id.into_inner())
        .fetch_all(&self.pool)
        .await?;

        let mut workflow = None;
        let mut related = Vec::with_capacity(rows.len());
        for (entity, data) in &rows {
            match Entity::parse(entity) {
                Some(Entity::Workflow) => workflow = Some(data.clone()),
                Some(entity) => related.push((entity, data)),
                None => {
                    warn!(%workflow_id, entity = entity.as_str(), "skipping unknown record kind");
                }
            }
        }

        match workflow {
            Some(workflow) => WorkflowSnapshot::assemble(workflow, related).map(Some),
            None => Ok(None),
        }
    }
}

/// PostgreSQL unit of work.
///
/// Wraps a transaction; the workflow row lock taken by
/// [`check_etag`](UnitOfWork::check_etag) is held until commit.
pub struct PgUnitOfWork<'a> {
    tx: Transaction<'a, Postgres>,
}

impl UnitOfWork for PgUnitOfWork<'_> {
    async fn insert(
        &mut self,
        entity: Entity,
        key: String,
        workflow_id: WorkflowId,
        record: Value,
    ) -> Result<()> {
        // ON CONFLICT keeps the transaction usable so the caller sees RecordExists.
        let result = sqlx::query(
            r#"INSERT INTO stageflow.records (entity, record_key, workflow_id, data)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (entity, record_key) DO NOTHING"#,
        )
        .bind(entity.as_str())
        .bind(&key)
        .bind(workflow_id.into_inner())
        .bind(record)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::RecordExists {
                entity: entity.as_str(),
                key,
            });
        }
        Ok(())
    }

    async fn update(&mut self, entity: Entity, key: String, changes: JsonMap) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE stageflow.records
               SET data = data || $3, updated_at = now()
               WHERE entity = $1 AND record_key = $2"#,
        )
        .bind(entity.as_str())
        .bind(&key)
        .bind(Value::Object(changes))
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::RecordNotFound {
                entity: entity.as_str(),
                key,
            });
        }
        Ok(())
    }

    async fn upsert(
        &mut self,
        entity: Entity,
        key: String,
        workflow_id: WorkflowId,
        record: Value,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO stageflow.records (entity, record_key, workflow_id, data)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (entity, record_key)
               DO UPDATE SET data = EXCLUDED.data, updated_at = now()"#,
        )
        .bind(entity.as_str())
        .bind(&key)
        .bind(workflow_id.into_inner())
        .bind(record)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete(&mut self, entity: Entity, key: String) -> Result<()> {
        let result = sqlx::query(
            r#"DELETE FROM stageflow.records
               WHERE entity = $1 AND record_key = $2"#,
        )
        .bind(entity.as_str())
        .bind(&key)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::RecordNotFound {
                entity: entity.as_str(),
                key,
            });
        }
        Ok(())
    }

    async fn check_etag(&mut self, workflow_id: WorkflowId, expected: Option<String>) -> Result<()> {
        let stored: Option<Option<String>> = sqlx::query_scalar(
            r#"SELECT data->>'etag'
               FROM stageflow.records
               WHERE entity = 'workflow' AND record_key = $1
               FOR UPDATE"#,
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some(stored) = stored else {
            return Err(Error::UnknownWorkflow(workflow_id));
        };
        if stored != expected {
            debug!(%workflow_id, ?stored, ?expected, "etag mismatch");
            return Err(Error::ConcurrencyConflict { workflow_id });
        }
        Ok(())
    }

    async fn issue_etag(&mut self, workflow_id: WorkflowId) -> Result<String> {
        let etag = new_etag();
        let result = sqlx::query(
            r#"UPDATE stageflow.records
               SET data = jsonb_set(data, '{etag}', to_jsonb($2::text)), updated_at = now()
               WHERE entity = 'workflow' AND record_key = $1"#,
        )
        .bind(workflow_id.to_string())
        .bind(&etag)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::UnknownWorkflow(workflow_id));
        }
        Ok(etag)
    }

    async fn append_mutations(&mut self, envelopes: &[MutationEnvelope]) -> Result<()> {
        for envelope in envelopes {
            let payload = serde_json::to_value(envelope)?;

            sqlx::query(
                r#"INSERT INTO stageflow.mutations
                   (workflow_id, transaction_id, position, name, envelope)
                   VALUES ($1, $2, $3, $4, $5)"#,
            )
            .bind(envelope.workflow_id.into_inner())
            .bind(envelope.transaction_id.into_inner())
            .bind(envelope.order as i32)
            .bind(&envelope.name)
            .bind(payload)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn append_narrations(&mut self, narrations: &[Narration]) -> Result<()> {
        for narration in narrations {
            sqlx::query(
                r#"INSERT INTO stageflow.narrations
                   (workflow_id, transaction_id, source, content, recorded_at)
                   VALUES ($1, $2, $3, $4, $5)"#,
            )
            .bind(narration.workflow_id.into_inner())
            .bind(narration.transaction_id.into_inner())
            .bind(&narration.source)
            .bind(&narration.content)
            .bind(narration.timestamp)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
