//! Workflow definitions.
//!
//! A [`WorkflowDefinition`] is built once, validated, and then shared
//! immutably by every instance of the workflow. It declares:
//!
//! - ordered stages, which group steps for display and progress
//! - the roles participants may hold
//! - step definitions with their state machines
//! - event handlers, scoped to the workflow or to a step definition
//! - lifecycle hooks that run inside the transaction of the status change
//!
//! All configuration errors are reported by [`DefinitionBuilder::build`].
//!
//! ```
//! use stageflow::{NewStep, Role, Stage, StepDefinition, Transition, WorkflowDefinition};
//!
//! let definition = WorkflowDefinition::builder("document-review")
//!     .title("Document review")
//!     .stage(Stage::new("REVIEW", "Review", 1))
//!     .role(Role::new("Reviewer", "Reviewer"))
//!     .step(
//!         StepDefinition::builder("ReadDocument", "REVIEW")
//!             .states(["READING"])
//!             .transition("READING", |_| Transition::new())
//!             .transition_from("_FINISHED", ["READING"], |_| Transition::new()),
//!     )
//!     .on_start(|wf| wf.create_step(NewStep::new("ReadDocument")).map(|_| ()))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(definition.steps().len(), 1);
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::router::{EventHandler, EventRouter, EventSummary, Trigger};
use crate::state::WorkflowState;
use crate::step::{StepBuilder, StepDefinition};

/// Lifecycle hook, run inside the transaction that changes the workflow status.
pub type Hook = Arc<dyn Fn(&mut WorkflowState) -> Result<()> + Send + Sync>;

/// A stage of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub key: String,
    pub title: String,
    pub order: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Stage {
    pub fn new(key: impl Into<String>, title: impl Into<String>, order: i32) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            order,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A role participants may hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Role {
    pub key: String,
    pub title: String,
}

impl Role {
    pub fn new(key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub(crate) on_start: Option<Hook>,
    pub(crate) on_complete: Option<Hook>,
    pub(crate) on_cancel: Option<Hook>,
    pub(crate) on_abort: Option<Hook>,
}

/// A validated, immutable workflow definition.
pub struct WorkflowDefinition {
    key: String,
    title: String,
    revision: u32,
    namespace: Option<String>,
    description: Option<String>,
    stages: Vec<Stage>,
    roles: Vec<Role>,
    steps: Vec<StepDefinition>,
    router: EventRouter,
    pub(crate) hooks: Hooks,
}

impl WorkflowDefinition {
    pub fn builder(key: impl Into<String>) -> DefinitionBuilder {
        let key = key.into();
        DefinitionBuilder {
            title: key.clone(),
            key,
            revision: 1,
            namespace: None,
            description: None,
            stages: Vec::new(),
            roles: Vec::new(),
            steps: Vec::new(),
            events: Vec::new(),
            hooks: Hooks::default(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Stages in ascending order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.key == role)
    }

    /// Step definitions in declaration order.
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, key: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.key() == key)
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Serializable description for catalogs and UIs.
    pub fn summary(&self) -> DefinitionSummary {
        DefinitionSummary {
            key: self.key.clone(),
            title: self.title.clone(),
            revision: self.revision,
            namespace: self.namespace.clone(),
            description: self.description.clone(),
            stages: self.stages.clone(),
            roles: self.roles.clone(),
            steps: self
                .steps
                .iter()
                .map(|step| StepSummary {
                    key: step.key().to_owned(),
                    title: step.title().to_owned(),
                    stage: step.stage().to_owned(),
                    multiple: step.is_multiple(),
                    states: step.states().to_vec(),
                    begin_state: step.begin_state().to_owned(),
                    finish_state: step.finish_state().to_owned(),
                })
                .collect(),
            events: self.router.events(),
        }
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("key", &self.key)
            .field("revision", &self.revision)
            .field("stages", &self.stages)
            .field("roles", &self.roles)
            .field("steps", &self.steps)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

/// Catalog view of a [`WorkflowDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefinitionSummary {
    pub key: String,
    pub title: String,
    pub revision: u32,
    pub namespace: Option<String>,
    pub description: Option<String>,
    pub stages: Vec<Stage>,
    pub roles: Vec<Role>,
    pub steps: Vec<StepSummary>,
    pub events: Vec<EventSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
    pub key: String,
    pub title: String,
    pub stage: String,
    pub multiple: bool,
    pub states: Vec<String>,
    pub begin_state: String,
    pub finish_state: String,
}

/// Builder for [`WorkflowDefinition`].
///
/// Declarations are collected as given; every check runs in
/// [`build`](Self::build), so the first configuration error is reported
/// there.
pub struct DefinitionBuilder {
    key: String,
    title: String,
    revision: u32,
    namespace: Option<String>,
    description: Option<String>,
    stages: Vec<Stage>,
    roles: Vec<Role>,
    steps: Vec<StepBuilder>,
    events: Vec<(String, EventHandler)>,
    hooks: Hooks,
}

impl DefinitionBuilder {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.roles.push(role);
        self
    }

    pub fn step(mut self, step: StepBuilder) -> Self {
        self.steps.push(step);
        self
    }

    /// Handle a named event at workflow scope.
    pub fn on_event<F>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut WorkflowState, &Trigger) -> Result<()> + Send + Sync + 'static,
    {
        self.events.push((event.into(), Arc::new(handler)));
        self
    }

    /// Runs after the workflow becomes ACTIVE; typically creates the first steps.
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut WorkflowState) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_start = Some(Arc::new(hook));
        self
    }

    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut WorkflowState) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_complete = Some(Arc::new(hook));
        self
    }

    pub fn on_cancel<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut WorkflowState) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_cancel = Some(Arc::new(hook));
        self
    }

    pub fn on_abort<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut WorkflowState) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_abort = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition> {
        let mut stage_keys = HashSet::new();
        for stage in &self.stages {
            if !stage_keys.insert(stage.key.as_str()) {
                return Err(Error::DuplicateStage(stage.key.clone()));
            }
        }

        let mut role_keys = HashSet::new();
        for role in &self.roles {
            if !role_keys.insert(role.key.as_str()) {
                return Err(Error::DuplicateRole(role.key.clone()));
            }
        }

        let mut router = EventRouter::default();
        for (event, handler) in self.events {
            router.register_workflow(event, handler)?;
        }

        let mut steps: Vec<StepDefinition> = Vec::with_capacity(self.steps.len());
        for builder in self.steps {
            if steps.iter().any(|step| step.key() == builder.key()) {
                return Err(Error::DuplicateStep(builder.key().to_owned()));
            }
            let (step, events) = builder.build()?;
            if !stage_keys.contains(step.stage()) {
                return Err(Error::UnknownStage {
                    step: step.key().to_owned(),
                    stage: step.stage().to_owned(),
                });
            }
            for (event, handler) in events {
                router.register_step(step.key(), event, handler)?;
            }
            steps.push(step);
        }

        let mut stages = self.stages;
        stages.sort_by_key(|stage| stage.order);

        Ok(WorkflowDefinition {
            key: self.key,
            title: self.title,
            revision: self.revision,
            namespace: self.namespace,
            description: self.description,
            stages,
            roles: self.roles,
            steps,
            router,
            hooks: self.hooks,
        })
    }
}
