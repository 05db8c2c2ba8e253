//! In-memory workflow state and its mutators.
//!
//! [`WorkflowState`] wraps a [`WorkflowSnapshot`] together with the definition
//! it was created from. Every mutator validates its preconditions, applies the
//! change to the snapshot and emits the matching [`Mutation`] into the open
//! transaction. Nothing else writes durable attributes.
//!
//! Step actions (`create_step`, `transit`, `ignore_step`, `cancel_step`) end
//! with reconciliation: progress becomes the share of settled steps, and a
//! workflow whose steps are all settled moves from ACTIVE to COMPLETED.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::definition::{Hook, Hooks, WorkflowDefinition};
use crate::error::{Error, Result};
use crate::ids::{StepId, WorkflowId};
use crate::model::{
    JsonMap, MemoryRecord, OutputRecord, ParticipantRecord, StageRecord, StepRecord,
    TriggerRecord, WorkflowRecord, WorkflowSnapshot,
};
use crate::mutation::{Mutation, UpdateStep, UpdateWorkflow};
use crate::router::{DispatchOutcome, EventData, StepTarget};
use crate::status::{StepStatus, WorkflowStatus};
use crate::step::{
    BEGIN_LABEL, FINISH_LABEL, NewStep, StepRequest, TransitionContext, TransitionOutcome,
};
use crate::transaction::{OpenTransaction, TransactionLocks};

const MUTABLE: &[WorkflowStatus] = &[WorkflowStatus::New, WorkflowStatus::Active];
const ACTIVE: &[WorkflowStatus] = &[WorkflowStatus::Active];

/// A workflow instance loaded in memory.
pub struct WorkflowState {
    pub(crate) definition: Arc<WorkflowDefinition>,
    pub(crate) data: WorkflowSnapshot,
    pub(crate) locks: TransactionLocks,
    pub(crate) tx: Option<OpenTransaction>,
    /// Depth of transition requests being applied; reconciliation waits for zero.
    pub(crate) nesting: u32,
}

impl WorkflowState {
    /// Fresh NEW instance with no steps. Nothing is emitted until
    /// [`initialize`](Self::initialize) runs in a transaction.
    pub(crate) fn create(
        definition: Arc<WorkflowDefinition>,
        resource_name: impl Into<String>,
        resource_id: Uuid,
        params: JsonMap,
        locks: TransactionLocks,
    ) -> Self {
        let workflow = WorkflowRecord {
            id: WorkflowId::new(),
            definition_key: definition.key().to_owned(),
            revision: definition.revision(),
            title: definition.title().to_owned(),
            namespace: definition.namespace().map(str::to_owned),
            resource_name: resource_name.into(),
            resource_id,
            status: WorkflowStatus::New,
            progress: 0.0,
            message: None,
            params,
            ts_created: OffsetDateTime::now_utc(),
            ts_start: None,
            ts_expire: None,
            ts_finish: None,
            ts_transit: None,
            etag: None,
        };
        Self::from_snapshot(definition, WorkflowSnapshot::new(workflow), locks)
    }

    /// Wrap a loaded snapshot.
    pub fn from_snapshot(
        definition: Arc<WorkflowDefinition>,
        data: WorkflowSnapshot,
        locks: TransactionLocks,
    ) -> Self {
        Self {
            definition,
            data,
            locks,
            tx: None,
            nesting: 0,
        }
    }

    /// Emit `CreateWorkflow` and one `AddStage` per declared stage.
    pub(crate) fn initialize(&mut self) -> Result<()> {
        self.require_transaction("initialize")?;
        self.emit(
            "initialize",
            None,
            Mutation::CreateWorkflow(self.data.workflow.clone()),
        )?;

        let definition = Arc::clone(&self.definition);
        for stage in definition.stages() {
            let record = StageRecord {
                workflow_id: self.id(),
                key: stage.key.clone(),
                title: stage.title.clone(),
                order: stage.order,
                description: stage.description.clone(),
            };
            self.data.stages.push(record.clone());
            self.emit("initialize", None, Mutation::AddStage(record))?;
        }
        Ok(())
    }

    // =========================================================================
    // Read access
    // =========================================================================

    pub fn id(&self) -> WorkflowId {
        self.data.workflow.id
    }

    pub fn status(&self) -> WorkflowStatus {
        self.data.workflow.status
    }

    pub fn progress(&self) -> f64 {
        self.data.workflow.progress
    }

    pub fn etag(&self) -> Option<&str> {
        self.data.workflow.etag.as_deref()
    }

    pub(crate) fn set_etag(&mut self, etag: Option<String>) {
        self.data.workflow.etag = etag;
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    pub fn workflow(&self) -> &WorkflowRecord {
        &self.data.workflow
    }

    pub fn params(&self) -> &JsonMap {
        &self.data.workflow.params
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.data.stages
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.data.steps
    }

    pub fn step(&self, step_id: StepId) -> Option<&StepRecord> {
        self.data.steps.iter().find(|step| step.id == step_id)
    }

    /// The ACTIVE step holding `selector`, else the latest step that held it.
    pub fn step_by_selector(&self, selector: &str) -> Option<&StepRecord> {
        let mut latest = None;
        for step in self.data.steps.iter().filter(|step| step.selector == selector) {
            if step.status == StepStatus::Active {
                return Some(step);
            }
            latest = Some(step);
        }
        latest
    }

    pub fn find_step(&self, target: &StepTarget) -> Option<&StepRecord> {
        match target {
            StepTarget::Id(id) => self.step(*id),
            StepTarget::Selector(selector) => self.step_by_selector(selector),
        }
    }

    pub fn participants(&self) -> &[ParticipantRecord] {
        &self.data.participants
    }

    pub fn memory(&self) -> &JsonMap {
        &self.data.memory
    }

    pub fn step_memory(&self, step_id: StepId) -> Option<&JsonMap> {
        self.data.step_memory.get(&step_id)
    }

    pub fn output(&self) -> &JsonMap {
        &self.data.output
    }

    /// The full in-memory snapshot.
    pub fn snapshot(&self) -> &WorkflowSnapshot {
        &self.data
    }

    /// Merged read view: params, then workflow memory, then step memory.
    pub fn recall(&self, step_id: Option<StepId>) -> JsonMap {
        let mut view = self.data.workflow.params.clone();
        view.extend(self.data.memory.clone());
        if let Some(memory) = step_id.and_then(|id| self.data.step_memory.get(&id)) {
            view.extend(memory.clone());
        }
        view
    }

    // =========================================================================
    // Guards
    // =========================================================================

    pub(crate) fn require_status(
        &self,
        action: &'static str,
        allowed: &[WorkflowStatus],
    ) -> Result<()> {
        let status = self.status();
        if allowed.contains(&status) {
            Ok(())
        } else {
            Err(Error::WorkflowStatusNotAllowed { action, status })
        }
    }

    fn step_index(&self, step_id: StepId) -> Result<usize> {
        self.data
            .steps
            .iter()
            .position(|step| step.id == step_id)
            .ok_or_else(|| Error::UnknownStep(step_id.to_string()))
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Instantiate a step definition in its begin state.
    pub fn create_step(&mut self, new: NewStep) -> Result<StepId> {
        self.guarded(|wf| wf.insert_step(new))
    }

    fn insert_step(&mut self, new: NewStep) -> Result<StepId> {
        self.require_transaction("create_step")?;
        self.require_status("create_step", MUTABLE)?;

        let definition = Arc::clone(&self.definition);
        let Some(step_def) = definition.step(&new.step_key) else {
            return Err(Error::UnknownStep(new.step_key));
        };

        let instances = self
            .data
            .steps
            .iter()
            .filter(|step| step.step_key == new.step_key)
            .count();
        let id = if step_def.is_multiple() {
            StepId::derive(&self.id(), &new.step_key, Some(instances))
        } else if instances > 0 {
            return Err(Error::StepAlreadyExists(new.step_key));
        } else {
            StepId::derive(&self.id(), &new.step_key, None)
        };

        let selector = new.selector.unwrap_or_else(|| id.to_string());
        let occupied = self
            .data
            .steps
            .iter()
            .any(|step| step.status == StepStatus::Active && step.selector == selector);
        if occupied || self.step(id).is_some() {
            return Err(Error::StepAlreadyExists(selector));
        }

        let record = StepRecord {
            id,
            workflow_id: self.id(),
            selector,
            step_key: step_def.key().to_owned(),
            stage_key: step_def.stage().to_owned(),
            title: new.title.unwrap_or_else(|| step_def.title().to_owned()),
            state: step_def.begin_state().to_owned(),
            status: StepStatus::Active,
            label: Some(BEGIN_LABEL.to_owned()),
            message: None,
            index: self.data.steps.len() as u32,
            src_step: new.src_step,
            ts_start: OffsetDateTime::now_utc(),
            ts_transit: None,
            ts_finish: None,
        };
        debug!(workflow_id = %self.id(), step_id = %id, step = %record.step_key, "step created");
        self.data.steps.push(record.clone());
        self.emit("create_step", Some(id), Mutation::AddStep(record))?;
        self.reconcile(None)?;
        Ok(id)
    }

    /// Move a step's state machine to `target`.
    ///
    /// Runs the transition handler, records the new state and then applies the
    /// handler's requests in order. A transit to the step's current state is
    /// refused.
    pub fn transit(&mut self, step_id: StepId, target: &str) -> Result<TransitionOutcome> {
        self.guarded(|wf| wf.run_transit(step_id, target))
    }

    fn run_transit(&mut self, step_id: StepId, target: &str) -> Result<TransitionOutcome> {
        self.require_transaction("transit")?;
        self.require_status("transit", ACTIVE)?;

        let index = self.step_index(step_id)?;
        let definition = Arc::clone(&self.definition);
        let step_key = self.data.steps[index].step_key.clone();
        let Some(step_def) = definition.step(&step_key) else {
            return Err(Error::UnknownStep(step_key));
        };
        let from_state = self.data.steps[index].state.clone();

        let rule = step_def.plan_transit(&self.data.steps[index], target)?;

        let memory = self.recall(Some(step_id));
        let transition = (rule.handler)(&TransitionContext {
            workflow: &self.data.workflow,
            step: &self.data.steps[index],
            from_state: &from_state,
            to_state: target,
            memory: &memory,
        });
        let (narration, requests) = transition.into_parts();

        let now = OffsetDateTime::now_utc();
        let finished = target == step_def.finish_state();
        let mut update = UpdateStep {
            state: Some(target.to_owned()),
            ts_transit: Some(now),
            ..UpdateStep::new(step_id)
        };
        if finished {
            update.status = Some(StepStatus::Finished);
            update.label = Some(FINISH_LABEL.to_owned());
            update.ts_finish = Some(now);
        }
        self.data.steps[index].apply(&update);
        self.emit("transit", Some(step_id), Mutation::UpdateStep(update))?;
        debug!(
            workflow_id = %self.id(),
            step_id = %step_id,
            from = %from_state,
            to = target,
            "step transited"
        );

        let source = format!("{step_key}:{target}");
        for message in &narration {
            self.narrate(source.clone(), message.clone())?;
        }

        self.nesting += 1;
        let applied = self.apply_requests(step_id, requests);
        self.nesting -= 1;
        applied?;

        self.reconcile(Some(now))?;

        Ok(TransitionOutcome {
            step_id,
            from_state,
            new_state: target.to_owned(),
            narration,
            finished,
        })
    }

    /// [`transit`](Self::transit) addressing the step by selector.
    pub fn transit_selector(&mut self, selector: &str, target: &str) -> Result<TransitionOutcome> {
        let step_id = self
            .step_by_selector(selector)
            .map(|step| step.id)
            .ok_or_else(|| Error::UnknownStep(selector.to_owned()))?;
        self.transit(step_id, target)
    }

    fn apply_requests(&mut self, step_id: StepId, requests: Vec<StepRequest>) -> Result<()> {
        for request in requests {
            match request {
                StepRequest::MemorizeStep(pairs) => self.memorize(pairs, Some(step_id))?,
                StepRequest::MemorizeWorkflow(pairs) => self.memorize(pairs, None)?,
                StepRequest::Output(pairs) => self.set_output(pairs)?,
                StepRequest::AddStep(mut new) => {
                    new.src_step = Some(step_id);
                    self.create_step(new)?;
                }
                StepRequest::Transit { selector, state } => {
                    self.transit_selector(&selector, &state)?;
                }
            }
        }
        Ok(())
    }

    /// Force an ACTIVE step to IGNORED without running a transition handler.
    pub fn ignore_step(&mut self, step_id: StepId, reason: impl Into<String>) -> Result<()> {
        self.settle_step("ignore_step", step_id, StepStatus::Ignored, reason.into())
    }

    /// Force an ACTIVE step to CANCELLED without running a transition handler.
    pub fn cancel_step(&mut self, step_id: StepId, reason: impl Into<String>) -> Result<()> {
        self.settle_step("cancel_step", step_id, StepStatus::Cancelled, reason.into())
    }

    fn settle_step(
        &mut self,
        action: &'static str,
        step_id: StepId,
        status: StepStatus,
        reason: String,
    ) -> Result<()> {
        self.guarded(|wf| wf.settle_step_inner(action, step_id, status, reason))
    }

    fn settle_step_inner(
        &mut self,
        action: &'static str,
        step_id: StepId,
        status: StepStatus,
        reason: String,
    ) -> Result<()> {
        self.require_transaction(action)?;
        self.require_status(action, ACTIVE)?;

        let index = self.step_index(step_id)?;
        let current = self.data.steps[index].status;
        if current != StepStatus::Active {
            return Err(Error::StepNotActive {
                step_id,
                status: current,
            });
        }

        let now = OffsetDateTime::now_utc();
        let update = UpdateStep {
            status: Some(status),
            label: Some(status.as_str().to_owned()),
            message: Some(reason),
            ts_finish: Some(now),
            ..UpdateStep::new(step_id)
        };
        self.data.steps[index].apply(&update);
        self.emit(action, Some(step_id), Mutation::UpdateStep(update))?;
        self.reconcile(Some(now))
    }

    // =========================================================================
    // Memory, output, participants
    // =========================================================================

    /// Upsert key/value pairs into workflow memory, or into one step's memory.
    ///
    /// Emits `SetMemory` carrying the full merged map, so repeating a call
    /// stores the same result.
    pub fn memorize<I, K, V>(&mut self, pairs: I, step_id: Option<StepId>) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.require_transaction("memorize")?;
        self.require_status("memorize", MUTABLE)?;

        let pairs: JsonMap = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if pairs.is_empty() {
            return Ok(());
        }

        let memory = match step_id {
            Some(id) => {
                self.step_index(id)?;
                let memory = self.data.step_memory.entry(id).or_default();
                memory.extend(pairs);
                memory.clone()
            }
            None => {
                self.data.memory.extend(pairs);
                self.data.memory.clone()
            }
        };
        let record = MemoryRecord {
            workflow_id: self.id(),
            step_id,
            memory,
        };
        self.emit("memorize", step_id, Mutation::SetMemory(record))
    }

    /// Upsert output references, such as generated document ids.
    pub fn set_output<I, K, V>(&mut self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.require_transaction("output")?;
        self.require_status("output", MUTABLE)?;

        let mut changed = false;
        for (key, value) in pairs {
            self.data.output.insert(key.into(), value.into());
            changed = true;
        }
        if !changed {
            return Ok(());
        }
        let record = OutputRecord {
            workflow_id: self.id(),
            output: self.data.output.clone(),
        };
        self.emit("output", None, Mutation::SetOutput(record))
    }

    /// Add a participant. Returns `false` if the user already holds the role.
    pub fn add_participant(&mut self, user_id: Uuid, role: &str) -> Result<bool> {
        self.require_transaction("add_participant")?;
        self.require_status("add_participant", MUTABLE)?;
        if !self.definition.has_role(role) {
            return Err(Error::RoleNotRegistered(role.to_owned()));
        }

        let exists = self
            .data
            .participants
            .iter()
            .any(|p| p.user_id == user_id && p.role == role);
        if exists {
            return Ok(false);
        }

        let record = ParticipantRecord {
            workflow_id: self.id(),
            user_id,
            role: role.to_owned(),
        };
        self.data.participants.push(record.clone());
        self.emit("add_participant", None, Mutation::AddParticipant(record))?;
        Ok(true)
    }

    /// Remove a user's role, or every role of the user when `role` is `None`.
    ///
    /// Returns the number of memberships removed.
    pub fn remove_participant(&mut self, user_id: Uuid, role: Option<&str>) -> Result<usize> {
        self.require_transaction("remove_participant")?;
        self.require_status("remove_participant", MUTABLE)?;
        if let Some(role) = role {
            if !self.definition.has_role(role) {
                return Err(Error::RoleNotRegistered(role.to_owned()));
            }
        }

        let (removed, kept): (Vec<_>, Vec<_>) =
            self.data.participants.drain(..).partition(|p| {
                p.user_id == user_id && role.is_none_or(|role| p.role == role)
            });
        self.data.participants = kept;

        let count = removed.len();
        for record in removed {
            self.emit("remove_participant", None, Mutation::DelParticipant(record))?;
        }
        Ok(count)
    }

    pub(crate) fn record_trigger(&mut self, trigger: TriggerRecord) -> Result<()> {
        let step_id = trigger.step_id;
        self.emit("dispatch", step_id, Mutation::AddTrigger(trigger))
    }

    /// Route a named event to its handler inside the open transaction.
    pub fn dispatch(&mut self, event_name: &str, data: EventData) -> Result<DispatchOutcome> {
        let definition = Arc::clone(&self.definition);
        self.guarded(|wf| definition.router().dispatch(wf, event_name, data))
    }

    // =========================================================================
    // Workflow lifecycle
    // =========================================================================

    /// NEW → ACTIVE, then run the `on_start` hook. The workflow must own at
    /// least one step once the hook has run.
    pub fn start(&mut self) -> Result<()> {
        self.guarded(Self::run_start)
    }

    fn run_start(&mut self) -> Result<()> {
        self.require_transaction("start")?;
        self.require_status("start", &[WorkflowStatus::New])?;

        let now = OffsetDateTime::now_utc();
        self.update_workflow(
            "start",
            UpdateWorkflow {
                status: Some(WorkflowStatus::Active),
                ts_start: Some(now),
                ..Default::default()
            },
        )?;
        self.run_hook(|hooks| hooks.on_start.as_ref())?;

        if self.data.steps.is_empty() {
            return Err(Error::WorkflowHasNoSteps(self.id()));
        }
        info!(workflow_id = %self.id(), steps = self.data.steps.len(), "workflow started");
        self.reconcile(None)
    }

    /// ACTIVE → CANCELLED, then run the `on_cancel` hook.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.guarded(|wf| {
            wf.finish_as("cancel", WorkflowStatus::Cancelled, reason)?;
            wf.run_hook(|hooks| hooks.on_cancel.as_ref())
        })
    }

    /// ACTIVE → ABORTED, then run the `on_abort` hook.
    pub fn abort(&mut self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.guarded(|wf| {
            wf.finish_as("abort", WorkflowStatus::Aborted, reason)?;
            wf.run_hook(|hooks| hooks.on_abort.as_ref())
        })
    }

    /// Any non-terminal status → ERROR.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.require_transaction("fail")?;
        self.require_status("fail", MUTABLE)?;
        self.update_workflow(
            "fail",
            UpdateWorkflow {
                status: Some(WorkflowStatus::Error),
                message: Some(reason.into()),
                ts_finish: Some(OffsetDateTime::now_utc()),
                ..Default::default()
            },
        )
    }

    fn finish_as(
        &mut self,
        action: &'static str,
        status: WorkflowStatus,
        reason: String,
    ) -> Result<()> {
        self.require_transaction(action)?;
        self.require_status(action, ACTIVE)?;
        info!(workflow_id = %self.id(), %status, %reason, "workflow finishing");
        self.update_workflow(
            action,
            UpdateWorkflow {
                status: Some(status),
                message: Some(reason),
                ts_finish: Some(OffsetDateTime::now_utc()),
                ..Default::default()
            },
        )
    }

    fn update_workflow(&mut self, action: &'static str, update: UpdateWorkflow) -> Result<()> {
        self.data.workflow.apply(&update);
        self.emit(action, None, Mutation::UpdateWorkflow(update))
    }

    fn run_hook(&mut self, pick: impl FnOnce(&Hooks) -> Option<&Hook>) -> Result<()> {
        let hook = pick(&self.definition.hooks).cloned();
        match hook {
            Some(hook) => hook(self),
            None => Ok(()),
        }
    }

    /// Recompute progress and complete the workflow once no step is ACTIVE.
    fn reconcile(&mut self, ts_transit: Option<OffsetDateTime>) -> Result<()> {
        if self.nesting > 0 || self.status() != WorkflowStatus::Active {
            return Ok(());
        }

        let total = self.data.steps.len();
        let settled = self
            .data
            .steps
            .iter()
            .filter(|step| step.status.is_settled())
            .count();
        let progress = if total == 0 {
            0.0
        } else {
            settled as f64 / total as f64
        };

        let mut update = UpdateWorkflow {
            ts_transit,
            ..Default::default()
        };
        if progress != self.data.workflow.progress {
            update.progress = Some(progress);
        }
        let completed = total > 0 && settled == total;
        if completed {
            update.status = Some(WorkflowStatus::Completed);
            update.ts_finish = Some(ts_transit.unwrap_or_else(OffsetDateTime::now_utc));
        }
        if update.is_empty() {
            return Ok(());
        }

        self.update_workflow("reconcile", update)?;
        if completed {
            info!(workflow_id = %self.id(), "workflow completed");
            self.run_hook(|hooks| hooks.on_complete.as_ref())?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn clone_detached(&self) -> Self {
        Self::from_snapshot(
            Arc::clone(&self.definition),
            self.data.clone(),
            self.locks.clone(),
        )
    }
}

impl fmt::Debug for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowState")
            .field("id", &self.id())
            .field("definition", &self.definition.key())
            .field("status", &self.status())
            .field("steps", &self.data.steps.len())
            .field("in_transaction", &self.tx.is_some())
            .finish()
    }
}
