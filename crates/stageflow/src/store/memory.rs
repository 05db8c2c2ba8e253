//! In-process store.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use super::{Entity, Store, UnitOfWork, WorkflowQueryStore, new_etag};
use crate::error::{Error, Result};
use crate::ids::WorkflowId;
use crate::model::{JsonMap, Narration, WorkflowRecord, WorkflowSnapshot};
use crate::mutation::MutationEnvelope;

/// In-memory store backed by a map of JSON records.
///
/// A unit of work holds the store lock for its whole lifetime, so units of
/// work and queries run one at a time. Writes go straight to the tables while
/// the unit of work journals the prior value of every record it touches and
/// the length of both logs. Dropping it uncommitted replays the journal, so a
/// failed batch leaves no trace. The undo cost is proportional to the batch,
/// not to the store.
///
/// Clones share the same tables.
///
/// ```
/// use stageflow::MemoryStore;
///
/// let store = MemoryStore::new();
/// let shared = store.clone();
/// # drop(shared);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

type Slot = (Entity, String);

#[derive(Debug, Default)]
struct Tables {
    records: BTreeMap<Slot, StoredRecord>,
    mutations: Vec<MutationEnvelope>,
    narrations: Vec<Narration>,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    workflow_id: WorkflowId,
    data: Value,
}

impl Tables {
    fn workflow_mut(&mut self, workflow_id: WorkflowId) -> Result<&mut Value> {
        self.records
            .get_mut(&(Entity::Workflow, workflow_id.to_string()))
            .map(|stored| &mut stored.data)
            .ok_or(Error::UnknownWorkflow(workflow_id))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records of one entity kind.
    pub async fn count(&self, entity: Entity) -> usize {
        let tables = self.tables.lock().await;
        tables
            .records
            .keys()
            .filter(|(stored, _)| *stored == entity)
            .count()
    }
}

impl Store for MemoryStore {
    type UnitOfWork<'a> = MemoryUnitOfWork<'a>;

    async fn begin(&self) -> Result<MemoryUnitOfWork<'_>> {
        let guard = self.tables.lock().await;
        let logged = (guard.mutations.len(), guard.narrations.len());
        Ok(MemoryUnitOfWork {
            guard,
            undo: BTreeMap::new(),
            logged,
            committed: false,
        })
    }

    async fn load_workflow(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowSnapshot>> {
        let tables = self.tables.lock().await;
        let Some(workflow) = tables
            .records
            .get(&(Entity::Workflow, workflow_id.to_string()))
        else {
            return Ok(None);
        };

        let related = tables
            .records
            .iter()
            .filter(|((entity, _), stored)| {
                *entity != Entity::Workflow && stored.workflow_id == workflow_id
            })
            .map(|((entity, _), stored)| (*entity, &stored.data));

        WorkflowSnapshot::assemble(workflow.data.clone(), related).map(Some)
    }
}

/// Unit of work for [`MemoryStore`].
pub struct MemoryUnitOfWork<'a> {
    guard: MutexGuard<'a, Tables>,
    /// Value of each touched record before its first write; `None` if absent.
    undo: BTreeMap<Slot, Option<StoredRecord>>,
    /// Log lengths when the unit of work began.
    logged: (usize, usize),
    committed: bool,
}

impl MemoryUnitOfWork<'_> {
    fn journal(&mut self, slot: &Slot) {
        if let Entry::Vacant(entry) = self.undo.entry(slot.clone()) {
            entry.insert(self.guard.records.get(slot).cloned());
        }
    }
}

impl Drop for MemoryUnitOfWork<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for (slot, original) in std::mem::take(&mut self.undo) {
            match original {
                Some(record) => self.guard.records.insert(slot, record),
                None => self.guard.records.remove(&slot),
            };
        }
        let (mutations, narrations) = self.logged;
        self.guard.mutations.truncate(mutations);
        self.guard.narrations.truncate(narrations);
    }
}

impl UnitOfWork for MemoryUnitOfWork<'_> {
    async fn insert(
        &mut self,
        entity: Entity,
        key: String,
        workflow_id: WorkflowId,
        record: Value,
    ) -> Result<()> {
        let slot = (entity, key);
        if self.guard.records.contains_key(&slot) {
            return Err(Error::RecordExists {
                entity: entity.as_str(),
                key: slot.1,
            });
        }
        self.journal(&slot);
        self.guard.records.insert(
            slot,
            StoredRecord {
                workflow_id,
                data: record,
            },
        );
        Ok(())
    }

    async fn update(&mut self, entity: Entity, key: String, changes: JsonMap) -> Result<()> {
        let slot = (entity, key);
        if !self.guard.records.contains_key(&slot) {
            return Err(Error::RecordNotFound {
                entity: entity.as_str(),
                key: slot.1,
            });
        }
        self.journal(&slot);
        if let Some(Value::Object(fields)) =
            self.guard.records.get_mut(&slot).map(|stored| &mut stored.data)
        {
            fields.extend(changes);
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
        let slot = (entity, key);
        self.journal(&slot);
        self.guard.records.insert(
            slot,
            StoredRecord {
                workflow_id,
                data: record,
            },
        );
        Ok(())
    }

    async fn delete(&mut self, entity: Entity, key: String) -> Result<()> {
        let slot = (entity, key);
        if !self.guard.records.contains_key(&slot) {
            return Err(Error::RecordNotFound {
                entity: entity.as_str(),
                key: slot.1,
            });
        }
        self.journal(&slot);
        self.guard.records.remove(&slot);
        Ok(())
    }

    async fn check_etag(&mut self, workflow_id: WorkflowId, expected: Option<String>) -> Result<()> {
        let workflow = self.guard.workflow_mut(workflow_id)?;
        let stored = workflow.get("etag").and_then(Value::as_str);
        if stored != expected.as_deref() {
            return Err(Error::ConcurrencyConflict { workflow_id });
        }
        Ok(())
    }

    async fn issue_etag(&mut self, workflow_id: WorkflowId) -> Result<String> {
        let etag = new_etag();
        self.journal(&(Entity::Workflow, workflow_id.to_string()));
        let workflow = self.guard.workflow_mut(workflow_id)?;
        if let Value::Object(fields) = workflow {
            fields.insert("etag".into(), Value::String(etag.clone()));
        }
        Ok(etag)
    }

    async fn append_mutations(&mut self, envelopes: &[MutationEnvelope]) -> Result<()> {
        self.guard.mutations.extend_from_slice(envelopes);
        Ok(())
    }

    async fn append_narrations(&mut self, narrations: &[Narration]) -> Result<()> {
        self.guard.narrations.extend_from_slice(narrations);
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        self.committed = true;
        Ok(())
    }
}

#[async_trait]
impl WorkflowQueryStore for MemoryStore {
    async fn list_workflows(
        &self,
        definition_key: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<WorkflowRecord>> {
        let tables = self.tables.lock().await;
        let mut workflows = tables
            .records
            .iter()
            .filter(|((entity, _), _)| *entity == Entity::Workflow)
            .map(|(_, stored)| serde_json::from_value::<WorkflowRecord>(stored.data.clone()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if let Some(key) = definition_key {
            workflows.retain(|workflow| workflow.definition_key == key);
        }
        workflows.sort_by(|a, b| b.ts_created.cmp(&a.ts_created));

        Ok(workflows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn fetch_mutations(&self, workflow_id: WorkflowId) -> Result<Vec<MutationEnvelope>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .mutations
            .iter()
            .filter(|envelope| envelope.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn fetch_narrations(&self, workflow_id: WorkflowId) -> Result<Vec<Narration>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .narrations
            .iter()
            .filter(|narration| narration.workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}
