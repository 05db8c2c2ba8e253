//! Transactional stage/step workflow engine with a named mutation log.
//!
//! Stageflow models multi-stage business processes where:
//!
//! - **Definitions are data**: stages, roles, steps with their state machines,
//!   event handlers and lifecycle hooks are declared once with a builder and
//!   validated up front
//! - **Every change is a named mutation**: state mutators emit typed
//!   [`Mutation`] records into the open transaction; nothing else writes
//! - **Batches are atomic**: a closed transaction is persisted as one storage
//!   transaction, or not at all
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        WorkflowManager<S>                               │
//! │                                                                         │
//! │   1. Load snapshot → WorkflowState                                      │
//! │   2. Open transaction (per-workflow guard)                              │
//! │   3. Dispatch event / call mutators → mutation envelopes                │
//! │   4. Close transaction → TransactionLog                                 │
//! │   5. Begin unit of work, check etag                                     │
//! │   6. Map envelopes onto insert / update / upsert / delete               │
//! │   7. Append mutation log + narrations, issue etag, commit               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use stageflow::{
//!     EventData, MemoryStore, NewStep, Stage, StepDefinition, Transition, WorkflowDefinition,
//!     WorkflowManager, WorkflowStatus,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> stageflow::Result<()> {
//! let definition = WorkflowDefinition::builder("document-review")
//!     .stage(Stage::new("REVIEW", "Review", 1))
//!     .step(
//!         StepDefinition::builder("ReadDocument", "REVIEW")
//!             .transition("_FINISHED", |_| Transition::new().narrate("document read")),
//!     )
//!     .on_event("document-read", |wf, _trigger| {
//!         let step = wf.step_by_selector("reader").map(|s| s.id);
//!         match step {
//!             Some(id) => wf.transit(id, "_FINISHED").map(|_| ()),
//!             None => Ok(()),
//!         }
//!     })
//!     .on_start(|wf| wf.create_step(NewStep::new("ReadDocument").selector("reader")).map(|_| ()))
//!     .build()?;
//!
//! let manager = WorkflowManager::builder(MemoryStore::new())
//!     .register(definition)
//!     .build()?;
//!
//! let state = manager
//!     .launch_workflow("document-review", "document", uuid::Uuid::new_v4(), Default::default())
//!     .await?;
//! manager.start_workflow(state.id()).await?;
//! manager
//!     .inject_event(state.id(), "document-read", EventData::new(json!({})))
//!     .await?;
//!
//! let done = manager.load_workflow(state.id()).await?;
//! assert_eq!(done.status(), WorkflowStatus::Completed);
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - `postgres`: Enables [`PgStore`] for production use with PostgreSQL
//!
//! # Design Documentation
//!
//! See `DESIGN.md` for architectural decisions.

// Allow the crate to reference itself as `stageflow` for macro-generated code
extern crate self as stageflow;

mod config;
pub mod definition;
mod error;
mod ids;
pub mod manager;
pub mod model;
pub mod mutation;
pub mod router;
pub mod state;
mod status;
pub mod step;
pub mod store;
pub mod transaction;
pub mod visualization;

pub use config::ManagerConfig;
pub use definition::{DefinitionBuilder, DefinitionSummary, Role, Stage, WorkflowDefinition};
pub use error::{Error, ErrorKind, Result};
pub use ids::{StepId, TransactionId, WorkflowId};
pub use manager::{ManagerBuilder, MutationFailure, PersistSummary, WorkflowManager};
pub use model::{
    JsonMap, MemoryRecord, Narration, OutputRecord, ParticipantRecord, StageRecord, StepRecord,
    TriggerRecord, WorkflowRecord, WorkflowSnapshot,
};
pub use mutation::{Mutation, MutationEnvelope, UpdateStep, UpdateWorkflow};
pub use router::{DispatchOutcome, EventData, StepTarget, Trigger};
pub use state::WorkflowState;
pub use status::{StepStatus, WorkflowStatus};
pub use step::{NewStep, StepDefinition, Transition, TransitionContext, TransitionOutcome};
#[cfg(feature = "postgres")]
pub use store::PgStore;
pub use store::{Entity, MemoryStore, Store, UnitOfWork, WorkflowQueryStore};
pub use transaction::{TransactionLocks, TransactionLog};

// Re-export derive macros
pub use stageflow_macros::MutationRegistry;
