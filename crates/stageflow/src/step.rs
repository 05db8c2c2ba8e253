//! Step definitions and their finite state machines.
//!
//! Each step declares a set of upper-case state names with exactly one begin
//! and one finish state, plus one transition handler per reachable target
//! state. A handler is a pure function: it inspects a [`TransitionContext`]
//! and returns a [`Transition`] describing narration and follow-up requests.
//! The workflow state applies the transition and then the requests, all inside
//! the transaction that asked for it.
//!
//! ```
//! use stageflow::step::{StepDefinition, Transition};
//!
//! let step = StepDefinition::builder("RequestSoftPull", "PRE-QUALIFICATION")
//!     .title("Request soft credit pull")
//!     .states(["PENDING", "REQUESTED", "COMPLETED"])
//!     .begin("PENDING")
//!     .finish("COMPLETED")
//!     .transition("REQUESTED", |_| Transition::new().narrate("soft pull requested"))
//!     .transition_from("COMPLETED", ["REQUESTED"], |_| Transition::new());
//! # drop(step);
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::ids::StepId;
use crate::model::{JsonMap, StepRecord, WorkflowRecord};
use crate::router::{EventHandler, Trigger};
use crate::state::WorkflowState;

/// Begin state added when a step does not name its own.
pub const BEGIN_STATE: &str = "_CREATED";
/// Finish state added when a step does not name its own.
pub const FINISH_STATE: &str = "_FINISHED";
/// Label of a freshly created step.
pub const BEGIN_LABEL: &str = "NEW";
/// Label of a step that reached its finish state.
pub const FINISH_LABEL: &str = "DONE";

/// Transition handler: maps the transition being made to its consequences.
pub type TransitionHandler = Arc<dyn Fn(&TransitionContext<'_>) -> Transition + Send + Sync>;

/// `true` if `name` matches `^[A-Z][A-Z0-9_]*$`.
pub fn is_valid_state_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {
            chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    }
}

// =============================================================================
// Transition results
// =============================================================================

/// What a transition handler sees.
pub struct TransitionContext<'a> {
    pub workflow: &'a WorkflowRecord,
    pub step: &'a StepRecord,
    pub from_state: &'a str,
    pub to_state: &'a str,
    /// Merged params, workflow memory and step memory.
    pub memory: &'a JsonMap,
}

/// The result of a transition handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    narration: Vec<String>,
    requests: Vec<StepRequest>,
}

/// A follow-up change requested by a transition handler.
#[derive(Debug, Clone, PartialEq)]
pub enum StepRequest {
    /// Upsert into the transiting step's memory.
    MemorizeStep(JsonMap),
    /// Upsert into the workflow memory.
    MemorizeWorkflow(JsonMap),
    /// Upsert output references.
    Output(JsonMap),
    /// Create another step; its source step is the transiting one.
    AddStep(NewStep),
    /// Transit another step, addressed by selector.
    Transit { selector: String, state: String },
}

impl Transition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn narrate(mut self, message: impl Into<String>) -> Self {
        self.narration.push(message.into());
        self
    }

    pub fn memorize(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut pairs = JsonMap::new();
        pairs.insert(key.into(), value.into());
        self.requests.push(StepRequest::MemorizeStep(pairs));
        self
    }

    pub fn memorize_workflow(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut pairs = JsonMap::new();
        pairs.insert(key.into(), value.into());
        self.requests.push(StepRequest::MemorizeWorkflow(pairs));
        self
    }

    pub fn output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut pairs = JsonMap::new();
        pairs.insert(key.into(), value.into());
        self.requests.push(StepRequest::Output(pairs));
        self
    }

    pub fn add_step(mut self, step: NewStep) -> Self {
        self.requests.push(StepRequest::AddStep(step));
        self
    }

    pub fn transit(mut self, selector: impl Into<String>, state: impl Into<String>) -> Self {
        self.requests.push(StepRequest::Transit {
            selector: selector.into(),
            state: state.into(),
        });
        self
    }

    pub fn narration(&self) -> &[String] {
        &self.narration
    }

    pub fn requests(&self) -> &[StepRequest] {
        &self.requests
    }

    pub(crate) fn into_parts(self) -> (Vec<String>, Vec<StepRequest>) {
        (self.narration, self.requests)
    }
}

/// Request to instantiate a step definition.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStep {
    pub step_key: String,
    /// Routing key; defaults to the generated step id.
    pub selector: Option<String>,
    /// Overrides the definition title.
    pub title: Option<String>,
    pub(crate) src_step: Option<StepId>,
}

impl NewStep {
    pub fn new(step_key: impl Into<String>) -> Self {
        Self {
            step_key: step_key.into(),
            selector: None,
            title: None,
            src_step: None,
        }
    }

    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Outcome of a [`WorkflowState::transit`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub step_id: StepId,
    pub from_state: String,
    pub new_state: String,
    pub narration: Vec<String>,
    /// The step reached its finish state.
    pub finished: bool,
}

// =============================================================================
// Step definitions
// =============================================================================

/// Declared handler for one target state.
#[derive(Clone)]
pub struct TransitionRule {
    /// Only these origins may transit here; `None` admits every origin.
    pub allowed_origins: Option<Vec<String>>,
    /// These origins may never transit here.
    pub forbidden_origins: Vec<String>,
    pub(crate) handler: TransitionHandler,
}

impl TransitionRule {
    pub fn admits(&self, origin: &str) -> bool {
        let allowed = match &self.allowed_origins {
            Some(origins) => origins.iter().any(|o| o == origin),
            None => true,
        };
        allowed && !self.forbidden_origins.iter().any(|o| o == origin)
    }
}

impl fmt::Debug for TransitionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionRule")
            .field("allowed_origins", &self.allowed_origins)
            .field("forbidden_origins", &self.forbidden_origins)
            .finish_non_exhaustive()
    }
}

/// A validated step definition.
#[derive(Clone)]
pub struct StepDefinition {
    key: String,
    title: String,
    stage: String,
    description: Option<String>,
    multiple: bool,
    states: Vec<String>,
    begin: String,
    finish: String,
    transitions: BTreeMap<String, TransitionRule>,
}

impl StepDefinition {
    /// Start declaring a step in the given stage.
    pub fn builder(key: impl Into<String>, stage: impl Into<String>) -> StepBuilder {
        let key = key.into();
        StepBuilder {
            title: key.clone(),
            key,
            stage: stage.into(),
            description: None,
            multiple: false,
            states: Vec::new(),
            begin: None,
            finish: None,
            transitions: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Several instances may exist at once.
    pub fn is_multiple(&self) -> bool {
        self.multiple
    }

    /// Declared states, begin state first and finish state last.
    pub fn states(&self) -> &[String] {
        &self.states
    }

    pub fn begin_state(&self) -> &str {
        &self.begin
    }

    pub fn finish_state(&self) -> &str {
        &self.finish
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    pub fn rule(&self, target: &str) -> Option<&TransitionRule> {
        self.transitions.get(target)
    }

    pub fn transitions(&self) -> impl Iterator<Item = (&str, &TransitionRule)> {
        self.transitions
            .iter()
            .map(|(target, rule)| (target.as_str(), rule))
    }

    /// Validate a transit request against this definition.
    ///
    /// A transit to the step's current state is refused like any other
    /// disallowed transit.
    pub(crate) fn plan_transit(&self, step: &StepRecord, target: &str) -> Result<&TransitionRule> {
        if !self.has_state(target) {
            return Err(Error::InvalidTransition {
                step: self.key.clone(),
                state: target.to_owned(),
            });
        }
        if step.status.is_settled() {
            return Err(Error::transition_not_allowed(
                &self.key,
                target,
                format!("step is {}", step.status),
            ));
        }
        if step.state == target {
            return Err(Error::transition_not_allowed(
                &self.key,
                target,
                "step is already in this state",
            ));
        }

        let Some(rule) = self.transitions.get(target) else {
            return Err(Error::transition_not_allowed(
                &self.key,
                target,
                "no transition handler registered",
            ));
        };
        if !rule.admits(&step.state) {
            return Err(Error::transition_not_allowed(
                &self.key,
                target,
                format!("not reachable from {}", step.state),
            ));
        }
        Ok(rule)
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("key", &self.key)
            .field("stage", &self.stage)
            .field("states", &self.states)
            .field("transitions", &self.transitions)
            .finish_non_exhaustive()
    }
}

/// Builder for [`StepDefinition`].
///
/// Validation happens when the enclosing workflow definition is built.
pub struct StepBuilder {
    key: String,
    title: String,
    stage: String,
    description: Option<String>,
    multiple: bool,
    states: Vec<String>,
    begin: Option<String>,
    finish: Option<String>,
    transitions: Vec<(String, TransitionRule)>,
    events: Vec<(String, EventHandler)>,
}

impl StepBuilder {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Allow several instances of this step, each with its own selector.
    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states.extend(states.into_iter().map(Into::into));
        self
    }

    /// Use a declared state as the begin state instead of `_CREATED`.
    pub fn begin(mut self, state: impl Into<String>) -> Self {
        self.begin = Some(state.into());
        self
    }

    /// Use a declared state as the finish state instead of `_FINISHED`.
    pub fn finish(mut self, state: impl Into<String>) -> Self {
        self.finish = Some(state.into());
        self
    }

    /// Register the handler for transits into `target` from any origin.
    pub fn transition<F>(self, target: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&TransitionContext<'_>) -> Transition + Send + Sync + 'static,
    {
        self.rule(target.into(), None, Vec::new(), Arc::new(handler))
    }

    /// Register the handler for transits into `target` from the given origins only.
    pub fn transition_from<I, S, F>(self, target: impl Into<String>, origins: I, handler: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&TransitionContext<'_>) -> Transition + Send + Sync + 'static,
    {
        let origins = origins.into_iter().map(Into::into).collect();
        self.rule(target.into(), Some(origins), Vec::new(), Arc::new(handler))
    }

    /// Register the handler for transits into `target` from any origin but the given ones.
    pub fn transition_unless<I, S, F>(
        self,
        target: impl Into<String>,
        origins: I,
        handler: F,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&TransitionContext<'_>) -> Transition + Send + Sync + 'static,
    {
        let origins = origins.into_iter().map(Into::into).collect();
        self.rule(target.into(), None, origins, Arc::new(handler))
    }

    /// Handle a named event addressed to an instance of this step.
    pub fn on_event<F>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut WorkflowState, &Trigger) -> Result<()> + Send + Sync + 'static,
    {
        self.events.push((event.into(), Arc::new(handler)));
        self
    }

    fn rule(
        mut self,
        target: String,
        allowed_origins: Option<Vec<String>>,
        forbidden_origins: Vec<String>,
        handler: TransitionHandler,
    ) -> Self {
        self.transitions.push((
            target,
            TransitionRule {
                allowed_origins,
                forbidden_origins,
                handler,
            },
        ));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Validate and split into the definition and its step-scoped event handlers.
    pub(crate) fn build(self) -> Result<(StepDefinition, Vec<(String, EventHandler)>)> {
        let key = self.key;
        let mut seen = HashSet::new();
        for state in &self.states {
            if !is_valid_state_name(state) {
                return Err(Error::invalid_state(
                    &key,
                    state,
                    "state names must match ^[A-Z][A-Z0-9_]*$",
                ));
            }
            if !seen.insert(state.as_str()) {
                return Err(Error::invalid_state(&key, state, "declared twice"));
            }
        }

        let mut states = self.states;
        let begin = match self.begin {
            Some(begin) if states.contains(&begin) => begin,
            Some(begin) => {
                return Err(Error::invalid_state(&key, begin, "begin state is not declared"));
            }
            None => {
                states.insert(0, BEGIN_STATE.to_owned());
                BEGIN_STATE.to_owned()
            }
        };
        let finish = match self.finish {
            Some(finish) if states.contains(&finish) => finish,
            Some(finish) => {
                return Err(Error::invalid_state(&key, finish, "finish state is not declared"));
            }
            None => {
                states.push(FINISH_STATE.to_owned());
                FINISH_STATE.to_owned()
            }
        };
        if begin == finish {
            return Err(Error::invalid_state(
                &key,
                begin,
                "begin and finish states must differ",
            ));
        }

        // Keep begin first and finish last for diagrams and catalogs.
        states.retain(|s| *s != begin && *s != finish);
        states.insert(0, begin.clone());
        states.push(finish.clone());

        let mut transitions = BTreeMap::new();
        for (target, rule) in self.transitions {
            let referenced = std::iter::once(&target)
                .chain(rule.allowed_origins.iter().flatten())
                .chain(rule.forbidden_origins.iter());
            for state in referenced {
                if !states.contains(state) {
                    return Err(Error::UndeclaredTransitionState {
                        step: key.clone(),
                        state: state.clone(),
                    });
                }
            }
            if transitions.contains_key(&target) {
                return Err(Error::DuplicatedTransitionHandler {
                    step: key.clone(),
                    state: target,
                });
            }
            transitions.insert(target, rule);
        }

        let definition = StepDefinition {
            key,
            title: self.title,
            stage: self.stage,
            description: self.description,
            multiple: self.multiple,
            states,
            begin,
            finish,
            transitions,
        };
        Ok((definition, self.events))
    }
}
