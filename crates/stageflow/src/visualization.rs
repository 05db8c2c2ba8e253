//! State machine visualization.
//!
//! Step definitions and the workflow lifecycle can be exported as a
//! [`StateMachineDefinition`] and rendered as Mermaid or Graphviz diagrams
//! for documentation, dashboards and debugging. [`StateInfo`] and
//! [`TransitionInfo`] describe a single step instance at runtime.
//!
//! # Example
//!
//! ```
//! use stageflow::visualization::StateMachineDefinition;
//! use stageflow::{Stage, StepDefinition, Transition, WorkflowDefinition};
//!
//! let definition = WorkflowDefinition::builder("loan")
//!     .stage(Stage::new("UNDERWRITING", "Underwriting", 1))
//!     .step(
//!         StepDefinition::builder("Review", "UNDERWRITING")
//!             .states(["REVIEWING"])
//!             .transition("REVIEWING", |_| Transition::new())
//!             .transition_from("_FINISHED", ["REVIEWING"], |_| Transition::new()),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let step = definition.step("Review").unwrap();
//! let diagram = StateMachineDefinition::from_step(step).to_mermaid();
//! assert!(diagram.contains("REVIEWING --> _FINISHED"));
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::model::StepRecord;
use crate::status::WorkflowStatus;
use crate::step::StepDefinition;

/// Runtime view of one step instance.
#[derive(Debug, Clone)]
pub struct StateInfo {
    /// The current FSM state.
    pub state: String,

    /// Key-value pairs for display.
    pub fields: HashMap<String, FieldValue>,

    /// The step is settled and accepts no more transits.
    pub is_terminal: bool,
}

impl StateInfo {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            fields: HashMap::new(),
            is_terminal: false,
        }
    }

    /// Describe a stored step.
    pub fn of_step(step: &StepRecord) -> Self {
        let info = Self::new(step.state.clone())
            .with_field("selector", &step.selector)
            .with_field("status", &step.status)
            .with_numeric_field("index", f64::from(step.index))
            .terminal(step.status.is_settled());
        match &step.label {
            Some(label) => info.with_field("label", label),
            None => info,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: &impl fmt::Display) -> Self {
        self.fields
            .insert(name.into(), FieldValue::String(value.to_string()));
        self
    }

    pub fn with_numeric_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), FieldValue::Number(value));
        self
    }

    pub fn with_bool_field(mut self, name: impl Into<String>, value: bool) -> Self {
        self.fields.insert(name.into(), FieldValue::Bool(value));
        self
    }

    pub fn terminal(mut self, is_terminal: bool) -> Self {
        self.is_terminal = is_terminal;
        self
    }
}

/// A field value for display.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Number(f64),
    Bool(bool),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::String(s) => write!(f, "{s}"),
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// A transit the step instance may make from its current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionInfo {
    pub target: String,
    /// Transiting here finishes the step.
    pub finishes: bool,
}

impl TransitionInfo {
    /// Every transit `step` could make right now. Settled steps have none.
    pub fn available(definition: &StepDefinition, step: &StepRecord) -> Vec<Self> {
        if step.status.is_settled() {
            return Vec::new();
        }
        definition
            .transitions()
            .filter(|(target, rule)| *target != step.state && rule.admits(&step.state))
            .map(|(target, _)| Self {
                target: target.to_owned(),
                finishes: target == definition.finish_state(),
            })
            .collect()
    }
}

/// Static state machine graph for visualization tools.
#[derive(Debug, Clone)]
pub struct StateMachineDefinition {
    pub states: Vec<StateDefinition>,
    pub transitions: Vec<TransitionDefinition>,
    pub initial_state: String,
}

/// A state in the graph.
#[derive(Debug, Clone)]
pub struct StateDefinition {
    pub name: String,
    pub is_terminal: bool,
    pub description: Option<String>,
}

impl StateDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_terminal: false,
            description: None,
        }
    }

    pub fn terminal(mut self) -> Self {
        self.is_terminal = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// An edge in the graph.
#[derive(Debug, Clone)]
pub struct TransitionDefinition {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
}

impl TransitionDefinition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl StateMachineDefinition {
    pub fn new(initial_state: impl Into<String>) -> Self {
        Self {
            states: vec![],
            transitions: vec![],
            initial_state: initial_state.into(),
        }
    }

    pub fn with_state(mut self, state: StateDefinition) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_transition(mut self, transition: TransitionDefinition) -> Self {
        self.transitions.push(transition);
        self
    }

    /// Graph of a step's state machine.
    ///
    /// A handler without declared origins is drawn from every state except
    /// the finish state and its own target.
    pub fn from_step(step: &StepDefinition) -> Self {
        let finish = step.finish_state();
        let mut graph = Self::new(step.begin_state());
        for state in step.states() {
            let node = StateDefinition::new(state.clone());
            graph = graph.with_state(if state == finish { node.terminal() } else { node });
        }

        for (target, rule) in step.transitions() {
            let origins: Vec<&str> = match &rule.allowed_origins {
                Some(origins) => origins.iter().map(String::as_str).collect(),
                None => step
                    .states()
                    .iter()
                    .map(String::as_str)
                    .filter(|state| *state != finish && *state != target)
                    .collect(),
            };
            for origin in origins {
                if rule.forbidden_origins.iter().any(|o| o == origin) {
                    continue;
                }
                graph = graph.with_transition(TransitionDefinition::new(origin, target));
            }
        }
        graph
    }

    /// Graph of the workflow status lifecycle.
    pub fn workflow_lifecycle() -> Self {
        use WorkflowStatus::*;

        let mut graph = Self::new(New.as_str());
        for status in [New, Active, Completed, Cancelled, Aborted, Error] {
            let node = StateDefinition::new(status.as_str());
            graph = graph.with_state(if status.is_terminal() { node.terminal() } else { node });
        }
        let edges = [
            (New, Active, "start"),
            (Active, Completed, "all steps settled"),
            (Active, Cancelled, "cancel"),
            (Active, Aborted, "abort"),
            (New, Error, "fail"),
            (Active, Error, "fail"),
        ];
        for (from, to, label) in edges {
            graph = graph.with_transition(
                TransitionDefinition::new(from.as_str(), to.as_str()).with_label(label),
            );
        }
        graph
    }

    /// Render a Mermaid state diagram.
    ///
    /// # Example Output
    ///
    /// ```text
    /// stateDiagram-v2
    ///     [*] --> _CREATED
    ///     _CREATED --> REVIEWING
    ///     REVIEWING --> _FINISHED
    ///     _FINISHED --> [*]
    /// ```
    pub fn to_mermaid(&self) -> String {
        let mut lines = vec!["stateDiagram-v2".to_string()];
        lines.push(format!("    [*] --> {}", self.initial_state));

        for t in &self.transitions {
            match &t.label {
                Some(label) => lines.push(format!("    {} --> {} : {}", t.from, t.to, label)),
                None => lines.push(format!("    {} --> {}", t.from, t.to)),
            }
        }

        for s in &self.states {
            if s.is_terminal {
                lines.push(format!("    {} --> [*]", s.name));
            }
        }

        lines.join("\n")
    }

    /// Render a Graphviz DOT graph.
    pub fn to_dot(&self) -> String {
        let mut lines = vec![
            "digraph workflow {".to_string(),
            "    rankdir=LR;".to_string(),
            "    node [shape=box];".to_string(),
            "".to_string(),
        ];

        for t in &self.transitions {
            match &t.label {
                Some(label) => {
                    lines.push(format!("    {} -> {} [label=\"{}\"];", t.from, t.to, label))
                }
                None => lines.push(format!("    {} -> {};", t.from, t.to)),
            }
        }

        lines.push("".to_string());
        for s in &self.states {
            if s.is_terminal {
                lines.push(format!("    {} [shape=doublecircle];", s.name));
            }
        }

        lines.push("}".to_string());
        lines.join("\n")
    }
}
