//! Identifier newtypes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Wrap an existing UUID.
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Borrow the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Consume and return the underlying UUID.
            pub fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id! {
    /// Unique identifier of a workflow instance.
    ///
    /// ```
    /// use stageflow::WorkflowId;
    ///
    /// let id = WorkflowId::new();
    /// assert_ne!(id, WorkflowId::new());
    /// ```
    WorkflowId
}

uuid_id! {
    /// Identifier of a step instance, derived from its step key and workflow.
    StepId
}

uuid_id! {
    /// Identifier shared by every mutation emitted in one transaction.
    TransactionId
}

impl WorkflowId {
    /// Generate a fresh random workflow id.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl TransactionId {
    /// Generate a fresh random transaction id.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl StepId {
    /// Deterministic id for a step within a workflow.
    ///
    /// Single-instance steps hash only their key, so re-creating them always
    /// yields the same id. Multi-instance steps add their position.
    pub fn derive(workflow_id: &WorkflowId, step_key: &str, index: Option<usize>) -> Self {
        let name = match index {
            Some(index) => format!("{step_key}#{index}"),
            None => step_key.to_owned(),
        };
        Self(Uuid::new_v5(workflow_id.as_uuid(), name.as_bytes()))
    }
}
