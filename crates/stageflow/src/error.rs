//! Error types for stageflow.

use thiserror::Error;

use crate::ids::{StepId, WorkflowId};
use crate::manager::PersistSummary;
use crate::status::{StepStatus, WorkflowStatus};

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`enum@Error`].
///
/// Configuration errors surface while definitions are built and are never
/// worth retrying. Execution and not-found errors abort the enclosing
/// transaction and are reported to the caller. Storage errors come from the
/// backend or from (de)serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Execution,
    NotFound,
    Storage,
}

/// Errors that can occur in stageflow operations.
#[derive(Debug, Error)]
pub enum Error {
    // ----- configuration -----
    /// A stage key was declared twice in one definition.
    #[error("stage `{0}` is declared more than once")]
    DuplicateStage(String),

    /// A step key was declared twice in one definition.
    #[error("step `{0}` is declared more than once")]
    DuplicateStep(String),

    /// A role key was declared twice in one definition.
    #[error("role `{0}` is declared more than once")]
    DuplicateRole(String),

    /// A step references a stage its definition does not declare.
    #[error("step `{step}` references unknown stage `{stage}`")]
    UnknownStage { step: String, stage: String },

    /// A state name is malformed or repeated in a step's state set.
    #[error("step `{step}` declares invalid state `{state}`: {reason}")]
    InvalidStateName {
        step: String,
        state: String,
        reason: &'static str,
    },

    /// A transition handler targets or admits a state that is not declared.
    #[error("step `{step}` has a transition involving undeclared state `{state}`")]
    UndeclaredTransitionState { step: String, state: String },

    /// Two handlers were registered for one target state.
    #[error("step `{step}` registers more than one transition handler for `{state}`")]
    DuplicatedTransitionHandler { step: String, state: String },

    /// One event name was registered at both workflow and step scope.
    #[error("event `{0}` is registered at both workflow and step scope")]
    EventHandlerScopeConflict(String),

    /// One event name was registered twice within a single scope.
    #[error("event `{event}` is registered twice in scope `{scope}`")]
    DuplicatedEventHandler { event: String, scope: String },

    /// A definition key was registered more than once with the manager.
    #[error("duplicate workflow definition registration: {0}")]
    DuplicateDefinition(String),

    // ----- execution -----
    /// The target state is not declared by the step definition.
    #[error("step `{step}` has no state `{state}`")]
    InvalidTransition { step: String, state: String },

    /// The transition is declared but not permitted from the current condition.
    #[error("step `{step}` cannot transit to `{state}`: {reason}")]
    TransitionNotAllowed {
        step: String,
        state: String,
        reason: String,
    },

    /// A step action was attempted on a step that is no longer active.
    #[error("step {step_id} is {status}, expected ACTIVE")]
    StepNotActive { step_id: StepId, status: StepStatus },

    /// A mutator was called while no transaction is open.
    #[error("`{action}` called outside an open transaction")]
    MutationOutsideTransaction { action: &'static str },

    /// A transaction is already open for this workflow instance.
    #[error("a transaction is already open for workflow {0}")]
    TransactionAlreadyStarted(WorkflowId),

    /// Commit or rollback was requested with no open transaction.
    #[error("no transaction is open for workflow {0}")]
    TransactionNotStarted(WorkflowId),

    /// Commit of a transaction in which a mutator failed part-way; the
    /// transaction was rolled back.
    #[error("transaction on workflow {0} failed part-way and was rolled back")]
    TransactionAborted(WorkflowId),

    /// The workflow status does not permit the requested action.
    #[error("workflow is {status}; `{action}` is not permitted")]
    WorkflowStatusNotAllowed {
        action: &'static str,
        status: WorkflowStatus,
    },

    /// A step selector is already occupied, or a single-instance step exists.
    #[error("step `{0}` already exists")]
    StepAlreadyExists(String),

    /// The role is not declared by the workflow definition.
    #[error("role `{0}` is not registered for this workflow")]
    RoleNotRegistered(String),

    /// `start()` completed without any step having been created.
    #[error("workflow {0} has no steps and cannot be started")]
    WorkflowHasNoSteps(WorkflowId),

    /// A mutation batch failed and was rolled back.
    #[error("mutation batch rejected: {0}")]
    BatchRejected(Box<PersistSummary>),

    /// The stored etag no longer matches the loaded one.
    #[error("workflow {workflow_id} was modified concurrently")]
    ConcurrencyConflict { workflow_id: WorkflowId },

    /// The mutation name is not in the registry.
    #[error("unrecognized mutation: {0}")]
    UnrecognizedMutation(String),

    // ----- not found -----
    /// No handler is registered for the event in the resolved scope.
    #[error("no handler registered for event `{0}`")]
    EventHandlerNotFound(String),

    /// The event is step-scoped and no step could be resolved from its data.
    #[error("event `{0}` must be routed to a step")]
    StepRoutingRequired(String),

    /// No step matches the given id or selector.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// No workflow with this id exists in the store.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(WorkflowId),

    /// No definition is registered under this key.
    #[error("unknown workflow definition: {0}")]
    UnknownDefinition(String),

    /// A store record a mutation targets does not exist.
    #[error("no {entity} record with key `{key}`")]
    RecordNotFound { entity: &'static str, key: String },

    // ----- storage -----
    /// Failed to serialize or deserialize a payload or record.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A store write conflicted with an existing record.
    #[error("{entity} record with key `{key}` already exists")]
    RecordExists { entity: &'static str, key: String },

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific database
    /// error conditions (connection timeout, constraint violation, etc.).
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateStage(_)
            | Error::DuplicateStep(_)
            | Error::DuplicateRole(_)
            | Error::UnknownStage { .. }
            | Error::InvalidStateName { .. }
            | Error::UndeclaredTransitionState { .. }
            | Error::DuplicatedTransitionHandler { .. }
            | Error::EventHandlerScopeConflict(_)
            | Error::DuplicatedEventHandler { .. }
            | Error::DuplicateDefinition(_) => ErrorKind::Configuration,

            Error::InvalidTransition { .. }
            | Error::TransitionNotAllowed { .. }
            | Error::StepNotActive { .. }
            | Error::MutationOutsideTransaction { .. }
            | Error::TransactionAlreadyStarted(_)
            | Error::TransactionNotStarted(_)
            | Error::TransactionAborted(_)
            | Error::WorkflowStatusNotAllowed { .. }
            | Error::StepAlreadyExists(_)
            | Error::RoleNotRegistered(_)
            | Error::WorkflowHasNoSteps(_)
            | Error::BatchRejected(_)
            | Error::ConcurrencyConflict { .. }
            | Error::UnrecognizedMutation(_) => ErrorKind::Execution,

            Error::EventHandlerNotFound(_)
            | Error::StepRoutingRequired(_)
            | Error::UnknownStep(_)
            | Error::UnknownWorkflow(_)
            | Error::UnknownDefinition(_)
            | Error::RecordNotFound { .. } => ErrorKind::NotFound,

            Error::Serialization(_) | Error::RecordExists { .. } => ErrorKind::Storage,
            #[cfg(feature = "postgres")]
            Error::Postgres(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn transition_not_allowed(
        step: impl Into<String>,
        state: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::TransitionNotAllowed {
            step: step.into(),
            state: state.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_state(
        step: impl Into<String>,
        state: impl Into<String>,
        reason: &'static str,
    ) -> Self {
        Error::InvalidStateName {
            step: step.into(),
            state: state.into(),
            reason,
        }
    }
}
