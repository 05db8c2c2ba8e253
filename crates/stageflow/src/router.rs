//! Routing of named external events to their handlers.
//!
//! An event name is registered either once at workflow scope or per step
//! definition at step scope, never both. Step-scoped events must say which
//! step they are for, by id or by selector; the handler of that step's
//! definition runs.
//!
//! Dispatch happens inside the transaction the caller already opened. The
//! router records an `AddTrigger` mutation before invoking the handler, so
//! the trigger and everything the handler does commit or roll back together.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ids::StepId;
use crate::model::TriggerRecord;
use crate::state::WorkflowState;
use crate::status::WorkflowStatus;

/// The trigger passed to event handlers.
pub type Trigger = TriggerRecord;

/// Event handler: applies an event to the workflow through its mutators.
pub type EventHandler = Arc<dyn Fn(&mut WorkflowState, &Trigger) -> Result<()> + Send + Sync>;

/// How an event addresses a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepTarget {
    Id(StepId),
    Selector(String),
}

/// Payload of an external event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventData {
    pub step: Option<StepTarget>,
    pub payload: Value,
}

impl EventData {
    pub fn new(payload: Value) -> Self {
        Self {
            step: None,
            payload,
        }
    }

    /// Address the event to a step by id.
    pub fn for_step(mut self, step_id: StepId) -> Self {
        self.step = Some(StepTarget::Id(step_id));
        self
    }

    /// Address the event to the active step holding `selector`.
    pub fn for_selector(mut self, selector: impl Into<String>) -> Self {
        self.step = Some(StepTarget::Selector(selector.into()));
        self
    }
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub trigger_id: Uuid,
    pub step_id: Option<StepId>,
}

/// Where an event name is handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum EventScope {
    Workflow,
    Step { steps: Vec<String> },
}

/// Catalog entry for one event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    pub name: String,
    #[serde(flatten)]
    pub scope: EventScope,
}

/// Event handlers of one workflow definition.
#[derive(Clone, Default)]
pub struct EventRouter {
    workflow: BTreeMap<String, EventHandler>,
    /// event name -> step key -> handler
    steps: BTreeMap<String, BTreeMap<String, EventHandler>>,
}

impl EventRouter {
    pub(crate) fn register_workflow(&mut self, event: String, handler: EventHandler) -> Result<()> {
        if self.steps.contains_key(&event) {
            return Err(Error::EventHandlerScopeConflict(event));
        }
        if self.workflow.contains_key(&event) {
            return Err(Error::DuplicatedEventHandler {
                event,
                scope: "workflow".into(),
            });
        }
        self.workflow.insert(event, handler);
        Ok(())
    }

    pub(crate) fn register_step(
        &mut self,
        step_key: &str,
        event: String,
        handler: EventHandler,
    ) -> Result<()> {
        if self.workflow.contains_key(&event) {
            return Err(Error::EventHandlerScopeConflict(event));
        }
        let handlers = self.steps.entry(event.clone()).or_default();
        if handlers.contains_key(step_key) {
            return Err(Error::DuplicatedEventHandler {
                event,
                scope: step_key.to_owned(),
            });
        }
        handlers.insert(step_key.to_owned(), handler);
        Ok(())
    }

    /// Every registered event with its scope, sorted by name.
    pub fn events(&self) -> Vec<EventSummary> {
        let mut events: Vec<_> = self
            .workflow
            .keys()
            .map(|name| EventSummary {
                name: name.clone(),
                scope: EventScope::Workflow,
            })
            .chain(self.steps.iter().map(|(name, handlers)| EventSummary {
                name: name.clone(),
                scope: EventScope::Step {
                    steps: handlers.keys().cloned().collect(),
                },
            }))
            .collect();
        events.sort_by(|a, b| a.name.cmp(&b.name));
        events
    }

    /// Apply an event to `state`, which must have an open transaction.
    ///
    /// Checks run in a fixed order:
    ///
    /// 1. the event name is looked up first, so a name with no handler in
    ///    either scope fails with [`Error::EventHandlerNotFound`] before the
    ///    event data's step target is looked at;
    /// 2. a step-scoped name then needs a step target that resolves
    ///    ([`Error::StepRoutingRequired`] otherwise) to a step whose kind has
    ///    a handler ([`Error::EventHandlerNotFound`] otherwise);
    /// 3. only then is the workflow required to be ACTIVE.
    pub fn dispatch(
        &self,
        state: &mut WorkflowState,
        event_name: &str,
        data: EventData,
    ) -> Result<DispatchOutcome> {
        state.require_transaction("dispatch")?;

        let (handler, step_id) = if let Some(handler) = self.workflow.get(event_name) {
            let step_id = match &data.step {
                Some(target) => Some(resolve(state, event_name, target)?),
                None => None,
            };
            (Arc::clone(handler), step_id)
        } else if let Some(handlers) = self.steps.get(event_name) {
            let Some(target) = &data.step else {
                return Err(Error::StepRoutingRequired(event_name.to_owned()));
            };
            let step_id = resolve(state, event_name, target)?;
            let step_key = state
                .step(step_id)
                .map(|step| step.step_key.as_str())
                .unwrap_or_default();
            let Some(handler) = handlers.get(step_key) else {
                return Err(Error::EventHandlerNotFound(event_name.to_owned()));
            };
            (Arc::clone(handler), Some(step_id))
        } else {
            return Err(Error::EventHandlerNotFound(event_name.to_owned()));
        };

        state.require_status("dispatch", &[WorkflowStatus::Active])?;

        let trigger = TriggerRecord {
            id: Uuid::new_v4(),
            workflow_id: state.id(),
            event_name: event_name.to_owned(),
            step_id,
            payload: data.payload,
            ts_received: OffsetDateTime::now_utc(),
        };
        debug!(
            workflow_id = %trigger.workflow_id,
            event = event_name,
            step_id = ?step_id,
            "dispatching event"
        );
        state.record_trigger(trigger.clone())?;
        handler(state, &trigger)?;

        Ok(DispatchOutcome {
            trigger_id: trigger.id,
            step_id,
        })
    }
}

fn resolve(state: &WorkflowState, event_name: &str, target: &StepTarget) -> Result<StepId> {
    state
        .find_step(target)
        .map(|step| step.id)
        .ok_or_else(|| Error::StepRoutingRequired(event_name.to_owned()))
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter")
            .field("workflow", &self.workflow.keys().collect::<Vec<_>>())
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}
