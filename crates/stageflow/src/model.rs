//! Durable records and the in-memory snapshot they assemble into.
//!
//! Every record here is written only through its mutation type; see
//! [`crate::mutation`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Result;
use crate::ids::{StepId, TransactionId, WorkflowId};
use crate::mutation::{UpdateStep, UpdateWorkflow};
use crate::status::{StepStatus, WorkflowStatus};

/// A JSON object, used for params, memory and output maps.
pub type JsonMap = Map<String, Value>;

/// The workflow instance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub definition_key: String,
    pub revision: u32,
    pub title: String,
    pub namespace: Option<String>,
    pub resource_name: String,
    pub resource_id: Uuid,
    pub status: WorkflowStatus,
    pub progress: f64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub params: JsonMap,
    #[serde(with = "time::serde::rfc3339")]
    pub ts_created: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ts_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ts_expire: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ts_finish: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ts_transit: Option<OffsetDateTime>,
    /// Issued by the store on every committed batch.
    #[serde(default)]
    pub etag: Option<String>,
}

impl WorkflowRecord {
    pub(crate) fn apply(&mut self, update: &UpdateWorkflow) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(progress) = update.progress {
            self.progress = progress;
        }
        if let Some(message) = &update.message {
            self.message = Some(message.clone());
        }
        if update.ts_start.is_some() {
            self.ts_start = update.ts_start;
        }
        if update.ts_expire.is_some() {
            self.ts_expire = update.ts_expire;
        }
        if update.ts_finish.is_some() {
            self.ts_finish = update.ts_finish;
        }
        if update.ts_transit.is_some() {
            self.ts_transit = update.ts_transit;
        }
    }
}

/// A stage of a workflow instance, copied from its definition at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub workflow_id: WorkflowId,
    pub key: String,
    pub title: String,
    pub order: i32,
    #[serde(default)]
    pub description: Option<String>,
}

/// A step instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: StepId,
    pub workflow_id: WorkflowId,
    /// Addressing key for routing; defaults to the step id.
    pub selector: String,
    pub step_key: String,
    pub stage_key: String,
    pub title: String,
    pub state: String,
    pub status: StepStatus,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub index: u32,
    #[serde(default)]
    pub src_step: Option<StepId>,
    #[serde(with = "time::serde::rfc3339")]
    pub ts_start: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ts_transit: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ts_finish: Option<OffsetDateTime>,
}

impl StepRecord {
    pub(crate) fn apply(&mut self, update: &UpdateStep) {
        if let Some(title) = &update.title {
            self.title = title.clone();
        }
        if let Some(state) = &update.state {
            self.state = state.clone();
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(label) = &update.label {
            self.label = Some(label.clone());
        }
        if let Some(message) = &update.message {
            self.message = Some(message.clone());
        }
        if update.ts_transit.is_some() {
            self.ts_transit = update.ts_transit;
        }
        if update.ts_finish.is_some() {
            self.ts_finish = update.ts_finish;
        }
    }
}

/// A (user, role) membership of a workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub workflow_id: WorkflowId,
    pub user_id: Uuid,
    pub role: String,
}

/// Memory scoped to a workflow, or to one of its steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub step_id: Option<StepId>,
    pub memory: JsonMap,
}

/// Output references of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub workflow_id: WorkflowId,
    pub output: JsonMap,
}

/// An external event as it was applied to a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub id: Uuid,
    pub workflow_id: WorkflowId,
    pub event_name: String,
    #[serde(default)]
    pub step_id: Option<StepId>,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub ts_received: OffsetDateTime,
}

/// A human-readable message recorded by a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narration {
    pub workflow_id: WorkflowId,
    pub transaction_id: TransactionId,
    /// Who produced the message, e.g. `workflow` or `StepKey:STATE`.
    pub source: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Everything known about one workflow instance, as loaded from a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow: WorkflowRecord,
    pub stages: Vec<StageRecord>,
    /// Ordered by step index.
    pub steps: Vec<StepRecord>,
    pub participants: Vec<ParticipantRecord>,
    pub memory: JsonMap,
    pub step_memory: BTreeMap<StepId, JsonMap>,
    pub output: JsonMap,
}

impl WorkflowSnapshot {
    /// A snapshot holding only the workflow record.
    pub fn new(workflow: WorkflowRecord) -> Self {
        Self {
            workflow,
            stages: Vec::new(),
            steps: Vec::new(),
            participants: Vec::new(),
            memory: JsonMap::new(),
            step_memory: BTreeMap::new(),
            output: JsonMap::new(),
        }
    }

    /// Build a snapshot from raw store records of one workflow.
    ///
    /// `related` yields `(entity, record)` pairs; trigger records and
    /// unrelated entities are skipped.
    pub fn assemble<'a, I>(workflow: Value, related: I) -> Result<Self>
    where
        I: IntoIterator<Item = (crate::store::Entity, &'a Value)>,
    {
        use crate::store::Entity;

        let mut snapshot = Self::new(serde_json::from_value(workflow)?);
        for (entity, record) in related {
            match entity {
                Entity::Stage => snapshot
                    .stages
                    .push(serde_json::from_value(record.clone())?),
                Entity::Step => snapshot.steps.push(serde_json::from_value(record.clone())?),
                Entity::Participant => snapshot
                    .participants
                    .push(serde_json::from_value(record.clone())?),
                Entity::Memory => {
                    let memory: MemoryRecord = serde_json::from_value(record.clone())?;
                    match memory.step_id {
                        Some(step_id) => {
                            snapshot.step_memory.insert(step_id, memory.memory);
                        }
                        None => snapshot.memory = memory.memory,
                    }
                }
                Entity::Output => {
                    let output: OutputRecord = serde_json::from_value(record.clone())?;
                    snapshot.output = output.output;
                }
                Entity::Workflow | Entity::Trigger => {}
            }
        }

        snapshot.stages.sort_by_key(|stage| stage.order);
        snapshot.steps.sort_by_key(|step| step.index);
        Ok(snapshot)
    }
}
