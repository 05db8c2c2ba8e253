//! Storage abstraction for workflow records and mutation batches.
//!
//! This module provides the [`Store`] and [`UnitOfWork`] traits that abstract
//! over different storage backends. Two implementations are provided:
//!
//! - [`MemoryStore`]: in-process tables, for tests and embedded use
//! - [`PgStore`]: PostgreSQL storage for production (requires `postgres` feature)
//!
//! Records are addressed by `(entity, key)` where the key is the record's
//! primary id. Each mutation maps onto exactly one [`WriteOp`]; see
//! [`MutationEnvelope::write_op`].

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use crate::error::Result;
use crate::ids::WorkflowId;
use crate::model::{JsonMap, Narration, WorkflowRecord, WorkflowSnapshot};
use crate::mutation::MutationEnvelope;

/// Kind of durable record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Entity {
    Workflow,
    Stage,
    Step,
    Memory,
    Output,
    Participant,
    Trigger,
}

impl Entity {
    pub const ALL: [Entity; 7] = [
        Entity::Workflow,
        Entity::Stage,
        Entity::Step,
        Entity::Memory,
        Entity::Output,
        Entity::Participant,
        Entity::Trigger,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Entity::Workflow => "workflow",
            Entity::Stage => "stage",
            Entity::Step => "step",
            Entity::Memory => "memory",
            Entity::Output => "output",
            Entity::Participant => "participant",
            Entity::Trigger => "trigger",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|entity| entity.as_str() == name)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single storage write derived from one mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create a record; fails if the key is taken.
    Insert {
        entity: Entity,
        key: String,
        workflow_id: WorkflowId,
        record: Value,
    },
    /// Merge `changes` into an existing record; fails if it is missing.
    Update {
        entity: Entity,
        key: String,
        changes: JsonMap,
    },
    /// Create or replace a record.
    Upsert {
        entity: Entity,
        key: String,
        workflow_id: WorkflowId,
        record: Value,
    },
    /// Remove an existing record; fails if it is missing.
    Delete { entity: Entity, key: String },
}

/// Storage backend for workflow records.
///
/// Users typically don't interact with this trait directly; use
/// [`WorkflowManager`](crate::WorkflowManager), which loads snapshots and
/// persists mutation batches through it.
///
/// # Implementations
///
/// - [`MemoryStore`]: in-process, one unit of work at a time
/// - [`PgStore`]: PostgreSQL with row-level locking (requires `postgres` feature)
pub trait Store: Send + Sync + Clone + 'static {
    /// The unit of work type returned by this store.
    type UnitOfWork<'a>: UnitOfWork + Send
    where
        Self: 'a;

    /// Begin a storage transaction.
    fn begin(&self) -> impl Future<Output = Result<Self::UnitOfWork<'_>>> + Send;

    /// Load every record of one workflow instance, or `None` if it does not exist.
    fn load_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> impl Future<Output = Result<Option<WorkflowSnapshot>>> + Send;
}

/// One storage transaction.
///
/// Changes are only persisted when [`commit`](Self::commit) is called;
/// dropping the unit of work without committing rolls back all changes.
pub trait UnitOfWork: Send {
    fn insert(
        &mut self,
        entity: Entity,
        key: String,
        workflow_id: WorkflowId,
        record: Value,
    ) -> impl Future<Output = Result<()>> + Send;

    fn update(
        &mut self,
        entity: Entity,
        key: String,
        changes: JsonMap,
    ) -> impl Future<Output = Result<()>> + Send;

    fn upsert(
        &mut self,
        entity: Entity,
        key: String,
        workflow_id: WorkflowId,
        record: Value,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete(&mut self, entity: Entity, key: String) -> impl Future<Output = Result<()>> + Send;

    /// Execute one planned write.
    fn apply(&mut self, op: WriteOp) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized,
    {
        async move {
            match op {
                WriteOp::Insert {
                    entity,
                    key,
                    workflow_id,
                    record,
                } => self.insert(entity, key, workflow_id, record).await,
                WriteOp::Update {
                    entity,
                    key,
                    changes,
                } => self.update(entity, key, changes).await,
                WriteOp::Upsert {
                    entity,
                    key,
                    workflow_id,
                    record,
                } => self.upsert(entity, key, workflow_id, record).await,
                WriteOp::Delete { entity, key } => self.delete(entity, key).await,
            }
        }
    }

    /// Fail with [`ConcurrencyConflict`](crate::Error::ConcurrencyConflict)
    /// unless the stored etag equals `expected`.
    ///
    /// Locks the workflow record until commit where the backend supports it.
    fn check_etag(
        &mut self,
        workflow_id: WorkflowId,
        expected: Option<String>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Store and return a fresh etag for the workflow.
    fn issue_etag(&mut self, workflow_id: WorkflowId)
    -> impl Future<Output = Result<String>> + Send;

    /// Append envelopes to the mutation log.
    fn append_mutations(
        &mut self,
        envelopes: &[MutationEnvelope],
    ) -> impl Future<Output = Result<()>> + Send;

    fn append_narrations(
        &mut self,
        narrations: &[Narration],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Commit the unit of work, persisting all changes.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}

/// Read-only queries over stored workflows.
#[async_trait]
pub trait WorkflowQueryStore: Send + Sync {
    /// List workflow records, most recently created first.
    async fn list_workflows(
        &self,
        definition_key: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<WorkflowRecord>>;

    /// Every logged mutation of a workflow, in commit order.
    async fn fetch_mutations(&self, workflow_id: WorkflowId) -> Result<Vec<MutationEnvelope>>;

    /// Every logged narration of a workflow, in commit order.
    async fn fetch_narrations(&self, workflow_id: WorkflowId) -> Result<Vec<Narration>>;
}

pub(crate) fn new_etag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
