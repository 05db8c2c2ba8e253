//! Workflow and step lifecycle statuses.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a workflow instance.
///
/// ```text
/// NEW --start()--> ACTIVE --(no step active)--> COMPLETED
///                  ACTIVE --cancel()----------> CANCELLED
///                  ACTIVE --abort()-----------> ABORTED
/// any non-terminal --fail()-------------------> ERROR
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    New,
    Active,
    Completed,
    Cancelled,
    Aborted,
    Error,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::New => "NEW",
            WorkflowStatus::Active => "ACTIVE",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Cancelled => "CANCELLED",
            WorkflowStatus::Aborted => "ABORTED",
            WorkflowStatus::Error => "ERROR",
        }
    }

    /// No further status change is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed
                | WorkflowStatus::Cancelled
                | WorkflowStatus::Aborted
                | WorkflowStatus::Error
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Active,
    Ignored,
    Cancelled,
    Finished,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Active => "ACTIVE",
            StepStatus::Ignored => "IGNORED",
            StepStatus::Cancelled => "CANCELLED",
            StepStatus::Finished => "FINISHED",
        }
    }

    /// The step no longer blocks workflow completion.
    pub fn is_settled(self) -> bool {
        self != StepStatus::Active
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
