//! Workflow manager: the entrypoint for the command and query layer.
//!
//! The manager owns the registered definitions, the shared transaction guard
//! and a [`Store`]. It turns host commands into transactions on a loaded
//! [`WorkflowState`] and persists the resulting mutation batch atomically.
//!
//! ```text
//! command ──► load_workflow ──► state.transaction(f) ──► TransactionLog
//!                                                            │
//!              store.begin ◄── plan write ops ◄──────────────┘
//!                 │
//!                 ├─ check etag
//!                 ├─ insert / update / upsert / delete per envelope
//!                 ├─ append mutation log + narrations
//!                 └─ issue etag ──► commit
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::definition::{DefinitionSummary, WorkflowDefinition};
use crate::error::{Error, Result};
use crate::ids::{StepId, TransactionId, WorkflowId};
use crate::model::{JsonMap, Narration, WorkflowRecord};
use crate::mutation::{Mutation, MutationEnvelope};
use crate::router::{DispatchOutcome, EventData};
use crate::state::WorkflowState;
use crate::step::TransitionOutcome;
use crate::store::{Store, UnitOfWork, WorkflowQueryStore, WriteOp};
use crate::transaction::{TransactionLocks, TransactionLog};

/// Result of persisting one mutation batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistSummary {
    /// Shared transaction id, when every envelope came from one transaction.
    pub transaction_id: Option<TransactionId>,
    /// Envelopes written before the batch committed or failed.
    pub processed: usize,
    pub failures: Vec<MutationFailure>,
    /// Fresh etag, when the batch touched exactly one workflow.
    pub etag: Option<String>,
}

/// One envelope the store refused.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationFailure {
    pub name: String,
    pub target_id: String,
    pub order: u32,
    pub error: String,
}

impl fmt::Display for PersistSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} mutation(s) applied", self.processed)?;
        for failure in &self.failures {
            write!(
                f,
                "; `{}` #{} on `{}` failed: {}",
                failure.name, failure.order, failure.target_id, failure.error
            )?;
        }
        Ok(())
    }
}

/// Coordinates workflow definitions, in-memory state and storage.
///
/// # Example
///
/// ```
/// # async fn demo(definition: stageflow::WorkflowDefinition) -> stageflow::Result<()> {
/// use stageflow::{MemoryStore, WorkflowManager};
///
/// let manager = WorkflowManager::builder(MemoryStore::new())
///     .register(definition)
///     .build()?;
/// # let _ = manager;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WorkflowManager<S: Store> {
    store: S,
    definitions: Arc<HashMap<String, Arc<WorkflowDefinition>>>,
    locks: TransactionLocks,
    config: ManagerConfig,
}

/// Builder for [`WorkflowManager`].
pub struct ManagerBuilder<S: Store> {
    store: S,
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
    duplicate_definition: Option<String>,
    config: ManagerConfig,
}

impl<S: Store> ManagerBuilder<S> {
    /// Register a definition under its key.
    ///
    /// Defers duplicate key checks until build time.
    pub fn register(mut self, definition: WorkflowDefinition) -> Self {
        let key = definition.key().to_owned();
        if self.definitions.contains_key(&key) {
            if self.duplicate_definition.is_none() {
                self.duplicate_definition = Some(key);
            }
            return self;
        }
        self.definitions.insert(key, Arc::new(definition));
        self
    }

    /// If not called, uses [`ManagerConfig::default()`].
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<WorkflowManager<S>> {
        if let Some(key) = self.duplicate_definition {
            return Err(Error::DuplicateDefinition(key));
        }
        Ok(WorkflowManager {
            store: self.store,
            definitions: Arc::new(self.definitions),
            locks: TransactionLocks::new(),
            config: self.config,
        })
    }
}

impl<S: Store> WorkflowManager<S> {
    pub fn builder(store: S) -> ManagerBuilder<S> {
        ManagerBuilder {
            store,
            definitions: HashMap::new(),
            duplicate_definition: None,
            config: ManagerConfig::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn definition(&self, key: &str) -> Option<&Arc<WorkflowDefinition>> {
        self.definitions.get(key)
    }

    /// Catalog of every registered definition, sorted by key.
    pub fn definitions(&self) -> Vec<DefinitionSummary> {
        let mut summaries: Vec<_> = self
            .definitions
            .values()
            .map(|definition| definition.summary())
            .collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    fn resolve(&self, key: &str) -> Result<Arc<WorkflowDefinition>> {
        self.definitions
            .get(key)
            .cloned()
            .ok_or_else(|| Error::UnknownDefinition(key.to_owned()))
    }

    // =========================================================================
    // Creation and loading
    // =========================================================================

    /// Build a NEW workflow in memory.
    ///
    /// The returned log holds `CreateWorkflow` followed by one `AddStage` per
    /// stage; nothing is stored until it is passed to [`commit`](Self::commit).
    pub fn create_workflow(
        &self,
        definition_key: &str,
        resource_name: &str,
        resource_id: Uuid,
        params: JsonMap,
    ) -> Result<(WorkflowState, TransactionLog)> {
        let definition = self.resolve(definition_key)?;
        let mut state = WorkflowState::create(
            definition,
            resource_name,
            resource_id,
            params,
            self.locks.clone(),
        );
        let ((), log) = state.transaction(|wf| wf.initialize())?;
        info!(
            workflow_id = %state.id(),
            definition = definition_key,
            resource = resource_name,
            "workflow created"
        );
        Ok((state, log))
    }

    /// [`create_workflow`](Self::create_workflow) and persist it.
    pub async fn launch_workflow(
        &self,
        definition_key: &str,
        resource_name: &str,
        resource_id: Uuid,
        params: JsonMap,
    ) -> Result<WorkflowState> {
        let (mut state, log) =
            self.create_workflow(definition_key, resource_name, resource_id, params)?;
        self.commit(&mut state, log).await?;
        Ok(state)
    }

    /// Load a stored workflow with the definition it was created from.
    pub async fn load_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowState> {
        let snapshot = self
            .store
            .load_workflow(workflow_id)
            .await?
            .ok_or(Error::UnknownWorkflow(workflow_id))?;
        let definition = self.resolve(&snapshot.workflow.definition_key)?;
        Ok(WorkflowState::from_snapshot(
            definition,
            snapshot,
            self.locks.clone(),
        ))
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Persist a committed transaction of `state`.
    ///
    /// Unless the batch creates the workflow, it is checked against the etag
    /// the state was loaded with. On success the state carries the new etag.
    pub async fn commit(
        &self,
        state: &mut WorkflowState,
        mut log: TransactionLog,
    ) -> Result<PersistSummary> {
        let mutations = log.consume_mutations();
        let narrations = log.take_narrations();
        let creating = mutations
            .iter()
            .any(|envelope| matches!(envelope.mutation, Mutation::CreateWorkflow(_)));
        let expected = (self.config.check_etag && !creating)
            .then(|| (state.id(), state.etag().map(str::to_owned)));

        let summary = self.write_batch(&mutations, &narrations, expected).await?;
        state.set_etag(summary.etag.clone());
        Ok(summary)
    }

    /// Persist a batch of envelopes in one storage transaction.
    ///
    /// Any failed write rolls back the whole batch and is reported as
    /// [`Error::BatchRejected`] carrying the summary.
    pub async fn persist_mutations(&self, mutations: &[MutationEnvelope]) -> Result<PersistSummary> {
        self.write_batch(mutations, &[], None).await
    }

    /// Decode encoded envelopes and persist them.
    ///
    /// Every envelope is decoded before anything is written, so an unknown
    /// mutation name leaves the store untouched.
    pub async fn persist_encoded(&self, encoded: Vec<Value>) -> Result<PersistSummary> {
        let mutations = encoded
            .into_iter()
            .map(MutationEnvelope::from_json)
            .collect::<Result<Vec<_>>>()?;
        self.persist_mutations(&mutations).await
    }

    async fn write_batch(
        &self,
        mutations: &[MutationEnvelope],
        narrations: &[Narration],
        expected: Option<(WorkflowId, Option<String>)>,
    ) -> Result<PersistSummary> {
        let mut planned: Vec<(&MutationEnvelope, WriteOp)> = Vec::with_capacity(mutations.len());
        for envelope in mutations {
            if envelope.name != envelope.mutation.name() {
                return Err(Error::UnrecognizedMutation(envelope.name.clone()));
            }
            planned.push((envelope, envelope.write_op()?));
        }

        let transaction_id = match mutations.split_first() {
            Some((first, rest))
                if rest
                    .iter()
                    .all(|envelope| envelope.transaction_id == first.transaction_id) =>
            {
                Some(first.transaction_id)
            }
            _ => None,
        };
        let touched: BTreeSet<WorkflowId> = mutations
            .iter()
            .map(|envelope| envelope.workflow_id)
            .collect();

        let mut uow = self.store.begin().await?;

        if let Some((workflow_id, etag)) = expected {
            uow.check_etag(workflow_id, etag).await?;
        }

        let mut summary = PersistSummary {
            transaction_id,
            processed: 0,
            failures: Vec::new(),
            etag: None,
        };
        for (envelope, op) in planned {
            debug!(
                workflow_id = %envelope.workflow_id,
                mutation = %envelope.name,
                order = envelope.order,
                "applying mutation"
            );
            if let Err(err) = uow.apply(op).await {
                summary.failures.push(MutationFailure {
                    name: envelope.name.clone(),
                    target_id: envelope.target_id(),
                    order: envelope.order,
                    error: err.to_string(),
                });
                warn!(
                    workflow_id = %envelope.workflow_id,
                    mutation = %envelope.name,
                    processed = summary.processed,
                    error = %err,
                    "mutation batch rejected"
                );
                return Err(Error::BatchRejected(Box::new(summary)));
            }
            summary.processed += 1;
        }

        if self.config.record_mutation_log {
            uow.append_mutations(mutations).await?;
        }
        if self.config.record_narrations && !narrations.is_empty() {
            uow.append_narrations(narrations).await?;
        }

        let mut etag = None;
        for workflow_id in &touched {
            etag = Some(uow.issue_etag(*workflow_id).await?);
        }
        if touched.len() == 1 {
            summary.etag = etag;
        }

        uow.commit().await?;
        info!(
            workflows = touched.len(),
            mutations = summary.processed,
            narrations = narrations.len(),
            "mutation batch committed"
        );
        Ok(summary)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Load a workflow, run `f` in a transaction and persist the result.
    ///
    /// `action` names the command in logs. A transaction that emitted nothing
    /// is not written.
    pub async fn execute<T, F>(&self, workflow_id: WorkflowId, action: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut WorkflowState) -> Result<T>,
    {
        let mut state = self.load_workflow(workflow_id).await?;
        let (value, log) = state.transaction(f)?;
        if log.is_empty() {
            debug!(workflow_id = %workflow_id, action, "nothing to persist");
            return Ok(value);
        }
        let summary = self.commit(&mut state, log).await?;
        debug!(
            workflow_id = %workflow_id,
            action,
            mutations = summary.processed,
            "command executed"
        );
        Ok(value)
    }

    pub async fn start_workflow(&self, workflow_id: WorkflowId) -> Result<()> {
        self.execute(workflow_id, "start", |wf| wf.start()).await
    }

    pub async fn cancel_workflow(&self, workflow_id: WorkflowId, reason: &str) -> Result<()> {
        self.execute(workflow_id, "cancel", |wf| wf.cancel(reason))
            .await
    }

    pub async fn abort_workflow(&self, workflow_id: WorkflowId, reason: &str) -> Result<()> {
        self.execute(workflow_id, "abort", |wf| wf.abort(reason)).await
    }

    /// Mark a NEW or ACTIVE workflow as ERROR, recording `reason` as its message.
    pub async fn fail_workflow(&self, workflow_id: WorkflowId, reason: &str) -> Result<()> {
        self.execute(workflow_id, "fail", |wf| wf.fail(reason)).await
    }

    /// Returns `false` if the user already held the role.
    pub async fn add_participant(
        &self,
        workflow_id: WorkflowId,
        user_id: Uuid,
        role: &str,
    ) -> Result<bool> {
        self.execute(workflow_id, "add_participant", |wf| {
            wf.add_participant(user_id, role)
        })
        .await
    }

    pub async fn remove_participant(
        &self,
        workflow_id: WorkflowId,
        user_id: Uuid,
        role: Option<&str>,
    ) -> Result<usize> {
        self.execute(workflow_id, "remove_participant", |wf| {
            wf.remove_participant(user_id, role)
        })
        .await
    }

    pub async fn ignore_step(
        &self,
        workflow_id: WorkflowId,
        step_id: StepId,
        reason: &str,
    ) -> Result<()> {
        self.execute(workflow_id, "ignore_step", |wf| {
            wf.ignore_step(step_id, reason)
        })
        .await
    }

    pub async fn cancel_step(
        &self,
        workflow_id: WorkflowId,
        step_id: StepId,
        reason: &str,
    ) -> Result<()> {
        self.execute(workflow_id, "cancel_step", |wf| {
            wf.cancel_step(step_id, reason)
        })
        .await
    }

    pub async fn transit_step(
        &self,
        workflow_id: WorkflowId,
        step_id: StepId,
        target: &str,
    ) -> Result<TransitionOutcome> {
        self.execute(workflow_id, "transit", |wf| wf.transit(step_id, target))
            .await
    }

    /// Load, dispatch the event in a transaction and persist the batch.
    pub async fn inject_event(
        &self,
        workflow_id: WorkflowId,
        event_name: &str,
        data: EventData,
    ) -> Result<DispatchOutcome> {
        self.execute(workflow_id, event_name, |wf| wf.dispatch(event_name, data))
            .await
    }
}

impl<S: Store + WorkflowQueryStore> WorkflowManager<S> {
    /// Stored workflows, most recently created first.
    pub async fn list_workflows(
        &self,
        definition_key: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<WorkflowRecord>> {
        self.store
            .list_workflows(definition_key, limit, offset)
            .await
    }

    pub async fn fetch_mutations(&self, workflow_id: WorkflowId) -> Result<Vec<MutationEnvelope>> {
        self.store.fetch_mutations(workflow_id).await
    }

    pub async fn fetch_narrations(&self, workflow_id: WorkflowId) -> Result<Vec<Narration>> {
        self.store.fetch_narrations(workflow_id).await
    }
}
