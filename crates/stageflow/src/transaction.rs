//! Transaction context for workflow state mutations.
//!
//! Every mutator of [`WorkflowState`] requires an open transaction. While it
//! is open, emitted mutations and narrations accumulate in a buffer. A clean
//! [`commit`](WorkflowState::commit) closes the buffer into a
//! [`TransactionLog`]; [`rollback`](WorkflowState::rollback) discards it and
//! restores the state as it was when the transaction began.
//!
//! A mutator that fails after emitting part of its work marks the
//! transaction failed. Committing a failed transaction restores the snapshot
//! and returns [`Error::TransactionAborted`], so a half-applied change never
//! reaches the log.
//!
//! At most one transaction may be open per workflow id. The id is held in a
//! [`TransactionLocks`] set shared by every state the manager hands out, so a
//! second attempt on the same workflow fails immediately instead of waiting.
//!
//! ```text
//!   begin() ──► mutators emit ──► commit() ──► TransactionLog ──► manager persists
//!                    │
//!                    ├── error ──► rollback() ──► snapshot restored, buffer dropped
//!                    └── partial error ──► commit() ──► TransactionAborted, snapshot restored
//! ```

use std::collections::HashSet;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ids::{StepId, TransactionId, WorkflowId};
use crate::model::{Narration, WorkflowSnapshot};
use crate::mutation::{Mutation, MutationEnvelope};
use crate::state::WorkflowState;

/// Set of workflow ids with an open transaction.
///
/// Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct TransactionLocks {
    open: Arc<Mutex<HashSet<WorkflowId>>>,
}

impl TransactionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `workflow_id`, failing if it is already claimed.
    pub fn try_acquire(&self, workflow_id: WorkflowId) -> Result<TransactionGuard> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if !open.insert(workflow_id) {
            return Err(Error::TransactionAlreadyStarted(workflow_id));
        }
        Ok(TransactionGuard {
            locks: self.clone(),
            workflow_id,
        })
    }

    pub fn is_open(&self, workflow_id: WorkflowId) -> bool {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&workflow_id)
    }
}

/// Releases its workflow id when dropped.
#[derive(Debug)]
pub struct TransactionGuard {
    locks: TransactionLocks,
    workflow_id: WorkflowId,
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.locks
            .open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.workflow_id);
    }
}

/// Buffer of an open transaction.
#[derive(Debug)]
pub(crate) struct OpenTransaction {
    id: TransactionId,
    mutations: Vec<MutationEnvelope>,
    narrations: Vec<Narration>,
    snapshot: WorkflowSnapshot,
    failed: bool,
    _guard: TransactionGuard,
}

impl OpenTransaction {
    fn mark(&self) -> (usize, usize) {
        (self.mutations.len(), self.narrations.len())
    }
}

/// The closed buffer of a committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionLog {
    transaction_id: TransactionId,
    workflow_id: WorkflowId,
    mutations: Vec<MutationEnvelope>,
    narrations: Vec<Narration>,
}

impl TransactionLog {
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    /// Mutations not yet consumed, in emission order.
    pub fn mutations(&self) -> &[MutationEnvelope] {
        &self.mutations
    }

    pub fn narrations(&self) -> &[Narration] {
        &self.narrations
    }

    /// Take the ordered mutation list. Later calls return an empty list.
    pub fn consume_mutations(&mut self) -> Vec<MutationEnvelope> {
        mem::take(&mut self.mutations)
    }

    pub(crate) fn take_narrations(&mut self) -> Vec<Narration> {
        mem::take(&mut self.narrations)
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty() && self.narrations.is_empty()
    }
}

impl WorkflowState {
    /// Open a transaction on this workflow.
    pub fn begin(&mut self) -> Result<TransactionId> {
        let workflow_id = self.id();
        if self.tx.is_some() {
            return Err(Error::TransactionAlreadyStarted(workflow_id));
        }
        let guard = self.locks.try_acquire(workflow_id)?;
        let id = TransactionId::new();
        self.tx = Some(OpenTransaction {
            id,
            mutations: Vec::new(),
            narrations: Vec::new(),
            snapshot: self.data.clone(),
            failed: false,
            _guard: guard,
        });
        debug!(workflow_id = %workflow_id, transaction_id = %id, "transaction opened");
        Ok(id)
    }

    /// Close the open transaction and hand out its buffer.
    ///
    /// A transaction marked failed is rolled back instead.
    pub fn commit(&mut self) -> Result<TransactionLog> {
        let Some(tx) = self.tx.take() else {
            return Err(Error::TransactionNotStarted(self.id()));
        };
        self.nesting = 0;
        if tx.failed {
            warn!(
                workflow_id = %self.id(),
                transaction_id = %tx.id,
                discarded = tx.mutations.len(),
                "failed transaction rolled back on commit"
            );
            self.data = tx.snapshot;
            return Err(Error::TransactionAborted(self.id()));
        }
        debug!(
            workflow_id = %self.id(),
            transaction_id = %tx.id,
            mutations = tx.mutations.len(),
            "transaction closed"
        );
        Ok(TransactionLog {
            transaction_id: tx.id,
            workflow_id: self.id(),
            mutations: tx.mutations,
            narrations: tx.narrations,
        })
    }

    /// Discard the open transaction, restoring the pre-transaction state.
    pub fn rollback(&mut self) {
        if let Some(tx) = self.tx.take() {
            debug!(
                workflow_id = %self.id(),
                transaction_id = %tx.id,
                discarded = tx.mutations.len(),
                "transaction rolled back"
            );
            self.data = tx.snapshot;
        }
        self.nesting = 0;
    }

    /// Run `f` in a transaction: commit if it succeeds, roll back if it fails.
    pub fn transaction<T, F>(&mut self, f: F) -> Result<(T, TransactionLog)>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.begin()?;
        match f(self) {
            Ok(value) => Ok((value, self.commit()?)),
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Run a mutator body, marking the open transaction failed when `f`
    /// errors after emitting a mutation or narration.
    pub(crate) fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let before = self.tx.as_ref().map(OpenTransaction::mark);
        let result = f(self);
        if result.is_err() {
            if let (Some(tx), Some(before)) = (self.tx.as_mut(), before) {
                if tx.mark() != before {
                    tx.failed = true;
                }
            }
        }
        result
    }

    /// Record a human-readable message in the open transaction.
    pub fn narrate(&mut self, source: impl Into<String>, content: impl Into<String>) -> Result<()> {
        let workflow_id = self.id();
        let Some(tx) = self.tx.as_mut() else {
            return Err(Error::MutationOutsideTransaction { action: "narrate" });
        };
        tx.narrations.push(Narration {
            workflow_id,
            transaction_id: tx.id,
            source: source.into(),
            content: content.into(),
            timestamp: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    pub(crate) fn require_transaction(&self, action: &'static str) -> Result<()> {
        match self.tx {
            Some(_) => Ok(()),
            None => Err(Error::MutationOutsideTransaction { action }),
        }
    }

    /// Append a mutation to the open transaction's buffer.
    pub(crate) fn emit(
        &mut self,
        action: &'static str,
        step_id: Option<StepId>,
        mutation: Mutation,
    ) -> Result<()> {
        let workflow_id = self.id();
        let Some(tx) = self.tx.as_mut() else {
            return Err(Error::MutationOutsideTransaction { action });
        };
        let order = tx.mutations.len() as u32 + 1;
        tx.mutations.push(MutationEnvelope {
            name: mutation.name().to_owned(),
            workflow_id,
            step_id,
            transaction_id: tx.id,
            action: action.to_owned(),
            order,
            mutation,
        });
        Ok(())
    }
}
