//! Named mutation records.
//!
//! A [`Mutation`] is the only way a durable attribute changes. Mutations are
//! emitted by the workflow state while a transaction is open, wrapped in a
//! [`MutationEnvelope`] carrying their position in the transaction, and
//! persisted by the manager as a single batch.
//!
//! The registry is generated at compile time by
//! [`MutationRegistry`](stageflow_macros::MutationRegistry): each variant is
//! registered under its kebab-cased name, and [`Mutation::decode`] rebuilds a
//! mutation from its name and JSON payload.
//!
//! ```
//! use stageflow::Mutation;
//!
//! assert!(Mutation::NAMES.contains(&"update-step"));
//! assert!(Mutation::decode("explode-workflow", serde_json::json!({})).is_err());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stageflow_macros::MutationRegistry;
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::ids::{StepId, TransactionId, WorkflowId};
use crate::model::{
    JsonMap, MemoryRecord, OutputRecord, ParticipantRecord, StageRecord, StepRecord,
    TriggerRecord, WorkflowRecord,
};
use crate::status::{StepStatus, WorkflowStatus};
use crate::store::{Entity, WriteOp};

/// Every change the engine can make to durable state.
///
/// Serializes as its payload alone; the name travels in the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, MutationRegistry)]
#[serde(untagged)]
pub enum Mutation {
    CreateWorkflow(WorkflowRecord),
    UpdateWorkflow(UpdateWorkflow),
    AddStage(StageRecord),
    AddStep(StepRecord),
    UpdateStep(UpdateStep),
    SetMemory(MemoryRecord),
    SetOutput(OutputRecord),
    AddParticipant(ParticipantRecord),
    DelParticipant(ParticipantRecord),
    AddTrigger(TriggerRecord),
}

/// Partial update of the workflow record. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateWorkflow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub ts_start: Option<OffsetDateTime>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub ts_expire: Option<OffsetDateTime>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub ts_finish: Option<OffsetDateTime>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub ts_transit: Option<OffsetDateTime>,
}

impl UpdateWorkflow {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Partial update of one step record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStep {
    pub step_id: StepId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub ts_transit: Option<OffsetDateTime>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub ts_finish: Option<OffsetDateTime>,
}

impl UpdateStep {
    pub fn new(step_id: StepId) -> Self {
        Self {
            step_id,
            title: None,
            state: None,
            status: None,
            label: None,
            message: None,
            ts_transit: None,
            ts_finish: None,
        }
    }
}

/// A mutation positioned within its transaction.
///
/// The envelope is the unit that is persisted and replayed. `order` is the
/// 1-based position of the mutation in the transaction's buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct MutationEnvelope {
    pub name: String,
    pub workflow_id: WorkflowId,
    pub step_id: Option<StepId>,
    pub transaction_id: TransactionId,
    /// The state operation that emitted the mutation, e.g. `transit`.
    pub action: String,
    pub order: u32,
    pub mutation: Mutation,
}

/// Wire form of an envelope, with the payload still undecoded.
#[derive(Deserialize)]
struct RawEnvelope {
    name: String,
    workflow_id: WorkflowId,
    #[serde(default)]
    step_id: Option<StepId>,
    transaction_id: TransactionId,
    action: String,
    order: u32,
    mutation: Value,
}

impl TryFrom<RawEnvelope> for MutationEnvelope {
    type Error = Error;

    fn try_from(raw: RawEnvelope) -> Result<Self> {
        let mutation = Mutation::decode(&raw.name, raw.mutation)?;
        Ok(Self {
            name: raw.name,
            workflow_id: raw.workflow_id,
            step_id: raw.step_id,
            transaction_id: raw.transaction_id,
            action: raw.action,
            order: raw.order,
            mutation,
        })
    }
}

impl MutationEnvelope {
    /// Decode an envelope from its JSON wire form.
    ///
    /// Unknown mutation names surface as [`Error::UnrecognizedMutation`]
    /// rather than as a generic serialization error.
    pub fn from_json(value: Value) -> Result<Self> {
        let raw: RawEnvelope = serde_json::from_value(value)?;
        Self::try_from(raw)
    }

    /// Identifier of the record this mutation writes.
    pub fn target_id(&self) -> String {
        self.storage_key()
    }

    fn storage_key(&self) -> String {
        match &self.mutation {
            Mutation::CreateWorkflow(record) => record.id.to_string(),
            Mutation::UpdateWorkflow(_) => self.workflow_id.to_string(),
            Mutation::AddStage(stage) => format!("{}:{}", stage.workflow_id, stage.key),
            Mutation::AddStep(step) => step.id.to_string(),
            Mutation::UpdateStep(update) => update.step_id.to_string(),
            Mutation::SetMemory(memory) => match memory.step_id {
                Some(step_id) => format!("{}:{}", memory.workflow_id, step_id),
                None => memory.workflow_id.to_string(),
            },
            Mutation::SetOutput(output) => output.workflow_id.to_string(),
            Mutation::AddParticipant(p) | Mutation::DelParticipant(p) => {
                format!("{}:{}:{}", p.workflow_id, p.user_id, p.role)
            }
            Mutation::AddTrigger(trigger) => trigger.id.to_string(),
        }
    }

    /// Map this mutation onto the storage write that persists it.
    ///
    /// Creations and additions insert, updates merge into an existing record,
    /// `Set*` mutations upsert and participant removal deletes.
    pub fn write_op(&self) -> Result<WriteOp> {
        let key = self.storage_key();
        let workflow_id = self.workflow_id;

        let op = match &self.mutation {
            Mutation::CreateWorkflow(record) => WriteOp::Insert {
                entity: Entity::Workflow,
                key,
                workflow_id,
                record: serde_json::to_value(record)?,
            },
            Mutation::UpdateWorkflow(update) => WriteOp::Update {
                entity: Entity::Workflow,
                key,
                changes: into_object(serde_json::to_value(update)?),
            },
            Mutation::AddStage(stage) => WriteOp::Insert {
                entity: Entity::Stage,
                key,
                workflow_id,
                record: serde_json::to_value(stage)?,
            },
            Mutation::AddStep(step) => WriteOp::Insert {
                entity: Entity::Step,
                key,
                workflow_id,
                record: serde_json::to_value(step)?,
            },
            Mutation::UpdateStep(update) => {
                let mut changes = into_object(serde_json::to_value(update)?);
                changes.remove("step_id");
                WriteOp::Update {
                    entity: Entity::Step,
                    key,
                    changes,
                }
            }
            Mutation::SetMemory(memory) => WriteOp::Upsert {
                entity: Entity::Memory,
                key,
                workflow_id,
                record: serde_json::to_value(memory)?,
            },
            Mutation::SetOutput(output) => WriteOp::Upsert {
                entity: Entity::Output,
                key,
                workflow_id,
                record: serde_json::to_value(output)?,
            },
            Mutation::AddParticipant(participant) => WriteOp::Insert {
                entity: Entity::Participant,
                key,
                workflow_id,
                record: serde_json::to_value(participant)?,
            },
            Mutation::DelParticipant(_) => WriteOp::Delete {
                entity: Entity::Participant,
                key,
            },
            Mutation::AddTrigger(trigger) => WriteOp::Insert {
                entity: Entity::Trigger,
                key,
                workflow_id,
                record: serde_json::to_value(trigger)?,
            },
        };
        Ok(op)
    }
}

fn into_object(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    }
}
