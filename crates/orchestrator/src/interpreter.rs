//! The workflow interpreter.
//!
//! Walks a definition one step at a time. Every step's effect is persisted
//! together with the advanced step index, so a crash re-executes at most the
//! step that was in flight. Decisions the autopilot is unsure about, and
//! failures it cannot fix alone, suspend the run on an escalation.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use autopilot_core::{
    ActionStep, ArtifactStep, DecisionStep, DelegateStep, Escalation, EscalationKind,
    PendingEscalation, Priority, RunStatus, Step, StepKind, UnitProgress, UnitStatus, WorkUnit,
    WorkerActivity, WorkflowDefinition, WorkflowState,
};
use events::{Event, EventBus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vcs::{VcsError, VersionControl, Workspace, WorkspaceStatus};

use crate::decision::{Decision, DecisionPolicy, DecisionRequest};
use crate::error::{io_error, ClassifiedError, ErrorCode, Result};
use crate::escalation::{EscalationQueue, ResumeTarget};
use crate::retry::{
    execute_recoverable, execute_with_retry, RetryPolicy, RetryReporter, TracingReporter,
};
use crate::services::{Renderer, WorkerContext, WorkerOutput, WorkerPool};
use crate::state_machine::RunStateMachine;
use crate::state_store::StateStore;
use crate::template::{evaluate_guard, lookup, resolve, resolve_value};

/// Responses that approve a confirmation escalation.
const AFFIRMATIVE: &[&str] = &["approve", "approved", "yes", "y", "ok", "confirm"];

/// Longest task excerpt kept in an activity record.
const ACTION_EXCERPT: usize = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Skip confirmation gates.
    pub unattended: bool,
    /// Minimum confidence for a decision to be applied without a human.
    pub confidence_threshold: f64,
    /// Steps executed by one `run` call before it is treated as a runaway loop.
    pub max_steps: usize,
    pub retry_policy: RetryPolicy,
    pub artifacts_dir: PathBuf,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            unattended: false,
            confidence_threshold: 0.75,
            max_steps: 10_000,
            retry_policy: RetryPolicy::default(),
            artifacts_dir: PathBuf::from("artifacts"),
        }
    }
}

impl InterpreterConfig {
    pub fn with_unattended(mut self, unattended: bool) -> Self {
        self.unattended = unattended;
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = dir.into();
        self
    }
}

/// How a `run` call ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Waiting on a human.
    Suspended { escalation_id: Uuid },
    /// Stopped at a step boundary by a [`PauseHandle`].
    Paused,
    /// A failure escalation was answered with neither retry nor skip.
    Aborted,
}

/// Cooperative pause switch, checked before every step.
#[derive(Debug, Clone, Default)]
pub struct PauseHandle(Arc<AtomicBool>);

impl PauseHandle {
    pub fn pause(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum StepFlow {
    Next,
    Jump(usize),
    Suspend(Uuid),
}

pub struct Interpreter {
    config: InterpreterConfig,
    store: Arc<StateStore>,
    workers: Arc<dyn WorkerPool>,
    policy: Arc<dyn DecisionPolicy>,
    escalations: Arc<EscalationQueue>,
    renderer: Option<Arc<dyn Renderer>>,
    vcs: Option<Arc<dyn VersionControl>>,
    event_bus: Option<EventBus>,
    reporter: Arc<dyn RetryReporter>,
    pause: PauseHandle,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl Interpreter {
    pub fn new(
        config: InterpreterConfig,
        store: Arc<StateStore>,
        workers: Arc<dyn WorkerPool>,
        policy: Arc<dyn DecisionPolicy>,
        escalations: Arc<EscalationQueue>,
    ) -> Self {
        Self {
            config,
            store,
            workers,
            policy,
            escalations,
            renderer: None,
            vcs: None,
            event_bus: None,
            reporter: Arc::new(TracingReporter::new("worker")),
            pause: PauseHandle::default(),
            definitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_vcs(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn RetryReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn escalations(&self) -> &Arc<EscalationQueue> {
        &self.escalations
    }

    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event);
        }
    }

    /// Make a definition known so escalation responses can find it later.
    pub async fn register(&self, workflow: impl Into<String>, definition: WorkflowDefinition) {
        self.definitions
            .write()
            .await
            .insert(workflow.into(), Arc::new(definition));
    }

    async fn definition_for(&self, workflow: &str) -> Result<Arc<WorkflowDefinition>> {
        if let Some(definition) = self.definitions.read().await.get(workflow) {
            return Ok(definition.clone());
        }

        let path = Path::new(workflow);
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_error("read workflow", path, e))?;
        let definition = Arc::new(
            WorkflowDefinition::from_yaml(&yaml)
                .map_err(|e| e.with_context("path", workflow))?,
        );
        self.definitions
            .write()
            .await
            .insert(workflow.to_string(), definition.clone());
        Ok(definition)
    }

    /// Create and persist a fresh state for a project.
    ///
    /// Variables left by earlier, archived runs of the project override the
    /// definition's defaults. A project with an unfinished run is rejected.
    pub async fn start(
        &self,
        project_id: &str,
        workflow: &str,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowState> {
        definition.validate()?;

        if let Some(existing) = self.store.current(project_id).await? {
            if existing.status != RunStatus::Completed {
                return Err(ClassifiedError::fatal(
                    ErrorCode::InvalidState,
                    format!(
                        "project '{}' already has a {} run of '{}'",
                        project_id,
                        existing.status.as_str(),
                        existing.workflow
                    ),
                )
                .with_context("project_id", project_id));
            }
        }

        let mut state = WorkflowState::new(project_id, workflow, definition);
        let archived = self.store.archived_variables(project_id).await?;
        state.variables.extend(archived);
        self.store.save(&state).await?;

        self.register(workflow, definition.clone()).await;
        info!(
            project_id = %project_id,
            workflow = %workflow,
            steps = definition.len(),
            "Run created"
        );
        Ok(state)
    }

    /// Execute steps from `state.current_step` until the workflow completes,
    /// suspends on an escalation, pauses, or fails.
    ///
    /// Fatal failures are persisted on the state (status `error`) before
    /// they are returned.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        mut state: WorkflowState,
    ) -> Result<RunOutcome> {
        match state.status {
            RunStatus::Completed => return Ok(RunOutcome::Completed),
            RunStatus::Error => {
                return Err(ClassifiedError::fatal(
                    ErrorCode::InvalidState,
                    "run is in error; recover it or answer its failure escalation",
                )
                .at_step(&state.project_id, state.current_step));
            }
            RunStatus::Paused => {
                if let Some(pending) = &state.pending_escalation {
                    return Ok(RunOutcome::Suspended {
                        escalation_id: pending.escalation_id,
                    });
                }
                self.transition(&mut state, RunStatus::Running)?;
                state.touch();
                self.store.save(&state).await?;
            }
            RunStatus::Running => {}
        }

        if let Err(err) = definition.validate() {
            return Err(self.fail_run(&mut state, err).await);
        }
        if state.total_steps != definition.len() || state.current_step > definition.len() {
            let err = ClassifiedError::fatal(
                ErrorCode::InvalidResume,
                format!(
                    "state expects {} steps at step {}, definition has {}",
                    state.total_steps,
                    state.current_step,
                    definition.len()
                ),
            );
            return Err(self.fail_run(&mut state, err).await);
        }

        if !self.definitions.read().await.contains_key(&state.workflow) {
            self.register(state.workflow.clone(), definition.clone()).await;
        }

        info!(
            project_id = %state.project_id,
            workflow = %state.workflow,
            step = state.current_step,
            "Run started"
        );
        self.emit(Event::RunStarted {
            project_id: state.project_id.clone(),
            workflow: state.workflow.clone(),
            step: state.current_step,
        });

        let mut executed = 0usize;
        while !state.is_finished() {
            if self.pause.is_paused() {
                return self.pause_run(&mut state).await;
            }
            if executed >= self.config.max_steps {
                let err = ClassifiedError::fatal(
                    ErrorCode::StepLimitExceeded,
                    format!(
                        "executed {} steps without finishing; the workflow probably loops",
                        executed
                    ),
                )
                .with_context("max_steps", self.config.max_steps);
                return Err(self.fail_run(&mut state, err).await);
            }
            executed += 1;

            let index = state.current_step;
            let step = &definition.steps[index];
            let next = match self.execute_step(definition, &mut state, index, step).await {
                Ok(StepFlow::Next) => index + 1,
                Ok(StepFlow::Jump(target)) => target,
                Ok(StepFlow::Suspend(escalation_id)) => {
                    return Ok(RunOutcome::Suspended { escalation_id });
                }
                Err(err) => return Err(self.fail_run(&mut state, err).await),
            };

            state.current_step = next;
            state.confirmed_steps.remove(&index);
            state.touch();
            if let Err(err) = self.store.save(&state).await {
                return Err(self.fail_run(&mut state, err).await);
            }

            debug!(
                project_id = %state.project_id,
                step = index,
                next_step = next,
                kind = step.kind.as_str(),
                "Step completed"
            );
            self.emit(Event::StepCompleted {
                project_id: state.project_id.clone(),
                step: index,
                kind: step.kind.as_str().to_string(),
                next_step: next,
            });
        }

        self.complete(&mut state).await
    }

    /// Inject a human's answer for `step` and continue the loop.
    ///
    /// The answer goes through the escalation queue like any other response,
    /// so the escalation the run waits on ends up resolved.
    pub async fn resume(
        &self,
        definition: &WorkflowDefinition,
        state: WorkflowState,
        step: usize,
        response: &str,
    ) -> Result<RunOutcome> {
        let escalation_id = state
            .pending_escalation
            .as_ref()
            .filter(|pending| pending.step_index == step)
            .map(|pending| pending.escalation_id)
            .ok_or_else(|| {
                ClassifiedError::fatal(
                    ErrorCode::InvalidResume,
                    format!("run is not waiting on an escalation at step {}", step),
                )
                .at_step(&state.project_id, state.current_step)
            })?;

        self.register(state.workflow.clone(), definition.clone()).await;
        self.escalations.respond(escalation_id, response, self).await
    }

    /// Pick up an errored run at the step that failed.
    pub async fn recover(&self, definition: &WorkflowDefinition, project_id: &str) -> Result<RunOutcome> {
        let mut state = self.require_state(project_id).await?;
        if state.status != RunStatus::Error {
            return Err(ClassifiedError::fatal(
                ErrorCode::InvalidState,
                format!("run is {}, not in error", state.status.as_str()),
            )
            .with_context("project_id", project_id));
        }
        if let Some(pending) = &state.pending_escalation {
            return Err(ClassifiedError::fatal(
                ErrorCode::InvalidState,
                format!("answer escalation {} to continue this run", pending.escalation_id),
            )
            .with_context("escalation_id", pending.escalation_id));
        }

        self.transition(&mut state, RunStatus::Running)?;
        state.last_error = None;
        state.touch();
        self.store.save(&state).await?;
        info!(project_id = %project_id, step = state.current_step, "Recovering run");
        self.run(definition, state).await
    }

    /// Answer an escalation through the queue and continue its run.
    pub async fn respond(&self, escalation_id: Uuid, response: &str) -> Result<RunOutcome> {
        self.escalations.respond(escalation_id, response, self).await
    }

    async fn require_state(&self, project_id: &str) -> Result<WorkflowState> {
        self.store.current(project_id).await?.ok_or_else(|| {
            ClassifiedError::fatal(
                ErrorCode::InvalidState,
                format!("no workflow state for project '{}'", project_id),
            )
        })
    }

    async fn continue_state(
        &self,
        definition: &WorkflowDefinition,
        state: WorkflowState,
    ) -> Result<RunOutcome> {
        match state.status {
            RunStatus::Running => self.run(definition, state).await,
            RunStatus::Completed => Ok(RunOutcome::Completed),
            RunStatus::Paused => match &state.pending_escalation {
                Some(pending) => Ok(RunOutcome::Suspended {
                    escalation_id: pending.escalation_id,
                }),
                None => Ok(RunOutcome::Paused),
            },
            RunStatus::Error => Ok(RunOutcome::Aborted),
        }
    }

    /// Fold a response into the state and persist it, advancing at most one step.
    async fn apply(
        &self,
        definition: &WorkflowDefinition,
        mut state: WorkflowState,
        step: usize,
        response: &str,
    ) -> Result<WorkflowState> {
        let pending = state.pending_escalation.clone().ok_or_else(|| {
            ClassifiedError::fatal(ErrorCode::InvalidResume, "run is not waiting on an escalation")
                .at_step(&state.project_id, state.current_step)
        })?;
        if pending.step_index != step || state.current_step != step {
            return Err(ClassifiedError::fatal(
                ErrorCode::InvalidResume,
                format!(
                    "response targets step {} but the run waits at step {}",
                    step, state.current_step
                ),
            )
            .at_step(&state.project_id, state.current_step));
        }
        let step_def = definition.steps.get(step).ok_or_else(|| {
            ClassifiedError::fatal(
                ErrorCode::InvalidResume,
                format!("step {} does not exist in '{}'", step, definition.name),
            )
        })?;

        let answer = response.trim();
        match pending.kind {
            EscalationKind::Decision => {
                let StepKind::Decision(decision) = &step_def.kind else {
                    return Err(ClassifiedError::fatal(
                        ErrorCode::InvalidResume,
                        format!("step {} is a {} step, not a decision", step, step_def.kind.as_str()),
                    ));
                };
                state
                    .variables
                    .insert(decision.variable.clone(), Value::String(answer.to_string()));
                state.current_step = step + 1;
                self.transition(&mut state, RunStatus::Running)?;
            }
            EscalationKind::Confirmation => {
                if is_affirmative(answer) {
                    state.confirmed_steps.insert(step);
                } else {
                    info!(project_id = %state.project_id, step = step, "Step skipped by response");
                    state.current_step = step + 1;
                }
                self.transition(&mut state, RunStatus::Running)?;
            }
            EscalationKind::Failure => match answer.to_ascii_lowercase().as_str() {
                "retry" => {
                    self.transition(&mut state, RunStatus::Running)?;
                    state.last_error = None;
                }
                "skip" => {
                    self.transition(&mut state, RunStatus::Running)?;
                    state.last_error = None;
                    state.current_step = step + 1;
                }
                _ => {
                    info!(project_id = %state.project_id, step = step, "Run aborted by response");
                }
            },
        }

        state.pending_escalation = None;
        state.touch();
        self.store.save(&state).await?;
        Ok(state)
    }

    fn transition(&self, state: &mut WorkflowState, to: RunStatus) -> Result<()> {
        RunStateMachine::validate_transition(&state.status, &to)
            .map_err(|e| e.at_step(&state.project_id, state.current_step))?;
        state.status = to;
        Ok(())
    }

    async fn execute_step(
        &self,
        definition: &WorkflowDefinition,
        state: &mut WorkflowState,
        index: usize,
        step: &Step,
    ) -> Result<StepFlow> {
        if let Some(guard) = &step.guard {
            if !evaluate_guard(guard, &state.variables)? {
                debug!(step = index, guard = %guard, "Guard false, skipping step");
                return Ok(StepFlow::Next);
            }
        }

        if step.confirm && !self.config.unattended && !state.confirmed_steps.contains(&index) {
            let escalation = Escalation::new(
                &state.project_id,
                &state.workflow,
                index,
                EscalationKind::Confirmation,
                format!("Run step {} ({})?", index, step.label()),
            )
            .with_options(vec!["approve".to_string(), "skip".to_string()]);
            return self.suspend(state, escalation).await;
        }

        match &step.kind {
            StepKind::Action(action) => {
                apply_action(action, state)?;
                Ok(StepFlow::Next)
            }
            StepKind::Decision(decision) => self.run_decision(decision, state, index).await,
            StepKind::Delegate(delegate) => {
                self.run_delegate(delegate, state, index).await?;
                Ok(StepFlow::Next)
            }
            StepKind::EmitArtifact(artifact) => {
                self.run_artifact(artifact, state).await?;
                Ok(StepFlow::Next)
            }
            StepKind::Jump(jump) => definition
                .resolve_target(&jump.target)
                .map(StepFlow::Jump)
                .ok_or_else(|| {
                    ClassifiedError::fatal(
                        ErrorCode::InvalidDefinition,
                        format!("jump target {:?} does not resolve", jump.target),
                    )
                }),
        }
    }

    /// Queue an escalation and park the run on it.
    async fn suspend(&self, state: &mut WorkflowState, escalation: Escalation) -> Result<StepFlow> {
        let id = escalation.id;
        self.escalations.add(&escalation).await?;

        state.pending_escalation = Some(PendingEscalation {
            escalation_id: id,
            step_index: escalation.step_index,
            kind: escalation.kind,
        });
        self.transition(state, RunStatus::Paused)?;
        state.touch();
        self.store.save(state).await?;

        info!(
            project_id = %state.project_id,
            step = escalation.step_index,
            escalation_id = %id,
            "Run suspended on escalation"
        );
        self.emit(Event::RunSuspended {
            project_id: state.project_id.clone(),
            step: escalation.step_index,
            escalation_id: id,
        });
        Ok(StepFlow::Suspend(id))
    }

    async fn pause_run(&self, state: &mut WorkflowState) -> Result<RunOutcome> {
        self.transition(state, RunStatus::Paused)?;
        state.touch();
        self.store.save(state).await?;
        info!(project_id = %state.project_id, step = state.current_step, "Run paused");
        self.emit(Event::RunPaused {
            project_id: state.project_id.clone(),
            step: state.current_step,
        });
        Ok(RunOutcome::Paused)
    }

    async fn complete(&self, state: &mut WorkflowState) -> Result<RunOutcome> {
        if let Err(err) = self.transition(state, RunStatus::Completed) {
            return Err(self.fail_run(state, err).await);
        }
        state.completed_at = Some(chrono::Utc::now());
        state.pending_escalation = None;
        state.touch();

        if let Err(err) = self.store.archive(state).await {
            return Err(self.fail_run(state, err).await);
        }
        self.store.save(state).await?;

        info!(project_id = %state.project_id, workflow = %state.workflow, "Run completed");
        self.emit(Event::RunCompleted {
            project_id: state.project_id.clone(),
            workflow: state.workflow.clone(),
        });
        Ok(RunOutcome::Completed)
    }

    /// Persist a failure on the state and hand the error back.
    ///
    /// Anything that reaches here unfixed becomes fatal.
    async fn fail_run(&self, state: &mut WorkflowState, err: ClassifiedError) -> ClassifiedError {
        let err = if err.is_fatal() {
            err
        } else {
            let attempts = err.retry_count + 1;
            let message = format!("{} (gave up after {} attempts)", err.message, attempts);
            err.into_fatal(ErrorCode::RetriesExhausted, message)
        };
        let err = err.at_step(&state.project_id, state.current_step);

        if let Err(invalid) = RunStateMachine::validate_transition(&state.status, &RunStatus::Error) {
            warn!("{}", invalid.message);
        }
        state.status = RunStatus::Error;
        state.last_error = Some(err.record());
        state.touch();
        if let Err(save_err) = self.store.save(state).await {
            error!(
                project_id = %state.project_id,
                "Failed to persist run failure: {}",
                save_err.message
            );
        }

        error!(
            project_id = %state.project_id,
            step = state.current_step,
            code = %err.code,
            "Run failed: {}",
            err.message
        );
        self.emit(Event::RunFailed {
            project_id: state.project_id.clone(),
            step: state.current_step,
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
        });
        err
    }

    async fn run_decision(
        &self,
        step: &DecisionStep,
        state: &mut WorkflowState,
        index: usize,
    ) -> Result<StepFlow> {
        let request = DecisionRequest {
            project_id: state.project_id.clone(),
            workflow: state.workflow.clone(),
            step_index: index,
            question: resolve(&step.question, &state.variables)?,
            options: step.options.clone(),
        };

        let decision = match self.policy.decide(&request).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(step = index, code = %err.code, "Decision policy failed: {}", err.message);
                Decision::unresolved(format!("decision policy failed: {}", err.message))
            }
        };

        if decision.is_confident(self.config.confidence_threshold) {
            if let Some(answer) = decision.answer {
                info!(
                    project_id = %state.project_id,
                    step = index,
                    variable = %step.variable,
                    confidence = decision.confidence,
                    "Decision made autonomously: {}",
                    answer
                );
                state.variables.insert(step.variable.clone(), Value::String(answer));
                return Ok(StepFlow::Next);
            }
        }

        let reasoning = match &decision.answer {
            Some(answer) if decision.reasoning.is_empty() => format!("suggested '{}'", answer),
            Some(answer) => format!("suggested '{}': {}", answer, decision.reasoning),
            None => decision.reasoning.clone(),
        };
        let escalation = Escalation::new(
            &state.project_id,
            &state.workflow,
            index,
            EscalationKind::Decision,
            request.question,
        )
        .with_reasoning(reasoning, decision.confidence)
        .with_options(request.options)
        .with_priority(step.priority);
        self.suspend(state, escalation).await
    }

    async fn run_artifact(&self, step: &ArtifactStep, state: &mut WorkflowState) -> Result<()> {
        let renderer = self.renderer.as_deref().ok_or_else(|| {
            ClassifiedError::fatal(
                ErrorCode::MissingCollaborator,
                "emit-artifact step needs a renderer",
            )
        })?;

        let output = resolve(&step.output, &state.variables)?;
        let relative = Path::new(&output);
        if relative.is_absolute() || relative.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(ClassifiedError::fatal(
                ErrorCode::InvalidDefinition,
                format!("artifact output '{}' escapes the artifacts directory", output),
            ));
        }
        let path = self.config.artifacts_dir.join(relative);

        let template = step.template.as_str();
        let variables = &state.variables;
        let reporter = self.reporter.as_ref();
        let content =
            execute_recoverable(move |_| renderer.render(template, variables), reporter).await?;
        let target = path.as_path();
        let body = content.as_str();
        execute_recoverable(move |_| write_artifact(target, body), reporter).await?;

        info!(project_id = %state.project_id, path = %path.display(), "Artifact written");
        if let Some(variable) = &step.variable {
            state
                .variables
                .insert(variable.clone(), Value::String(path.display().to_string()));
        }
        Ok(())
    }

    async fn run_delegate(
        &self,
        step: &DelegateStep,
        state: &mut WorkflowState,
        index: usize,
    ) -> Result<()> {
        let task = resolve(&step.task, &state.variables)?;
        let mut params = std::collections::BTreeMap::new();
        for (name, value) in &step.params {
            params.insert(name.clone(), resolve_value(value, &state.variables)?);
        }
        let context = WorkerContext::new(&state.project_id, &state.workflow, index)
            .with_inputs(&step.inputs, &state.variables)?
            .with_params(params);

        match &step.units {
            None => {
                let output = self
                    .delegate(state, index, &step.worker, &task, &context, None)
                    .await?;
                state.variables.extend(output.variables);
                Ok(())
            }
            Some(variable) => {
                self.run_units(step, variable, state, index, &task, context)
                    .await
            }
        }
    }

    /// Delegate once per unit of work, each in its own workspace, in dependency order.
    ///
    /// Progress is checkpointed after every unit, so an interrupted step
    /// skips units already integrated.
    async fn run_units(
        &self,
        step: &DelegateStep,
        variable: &str,
        state: &mut WorkflowState,
        index: usize,
        task: &str,
        context: WorkerContext,
    ) -> Result<()> {
        let vcs = self.vcs.as_deref().ok_or_else(|| {
            ClassifiedError::fatal(
                ErrorCode::MissingCollaborator,
                "delegating units of work needs version control",
            )
        })?;

        let value = lookup(&state.variables, variable).cloned().ok_or_else(|| {
            ClassifiedError::fatal(
                ErrorCode::UndefinedVariable,
                format!("units variable '{}' is not defined", variable),
            )
        })?;
        let units: Vec<WorkUnit> = serde_json::from_value(value).map_err(|e| {
            ClassifiedError::fatal(
                ErrorCode::InvalidDefinition,
                format!("variable '{}' is not a list of units: {}", variable, e),
            )
        })?;
        let ordered = vcs.determine_order(&units)?;
        info!(step = index, units = ordered.len(), "Delegating units of work");

        for unit in ordered {
            let mut progress = match state.units.get(&unit.id) {
                Some(existing) if existing.step_index == index => {
                    if existing.status == UnitStatus::Integrated {
                        debug!(unit = %unit.id, "Unit already integrated");
                        continue;
                    }
                    existing.clone()
                }
                _ => UnitProgress::new(&unit.id, index),
            };

            let unit_id = unit.id.as_str();
            let workspace = execute_with_retry(
                move |_| self.acquire_workspace(vcs, unit_id),
                |e: &ClassifiedError| !e.is_fatal(),
                &self.config.retry_policy,
                self.reporter.as_ref(),
            )
            .await?;

            progress.set_status(UnitStatus::InProgress);
            progress.workspace = Some(workspace.path.display().to_string());
            state.units.insert(unit.id.clone(), progress.clone());
            state.touch();
            self.store.save(state).await?;

            let unit_context = context
                .clone()
                .with_workspace(workspace.path.clone())
                .with_unit(unit.clone());
            let output = match self
                .delegate(state, index, &step.worker, task, &unit_context, Some(unit_id))
                .await
            {
                Ok(output) => output,
                Err(err) => {
                    progress.set_status(UnitStatus::Failed);
                    state.units.insert(unit.id.clone(), progress);
                    return Err(err.with_context("unit", unit_id));
                }
            };
            state.variables.extend(output.variables);

            let message = format!("{}: {}", unit.id, unit.title.as_deref().unwrap_or(&step.worker));
            let ws = &workspace;
            let msg = message.as_str();
            let integration = execute_with_retry(
                move |_| async move { vcs.propose_integration(ws, msg).await.map_err(ClassifiedError::from) },
                |e: &ClassifiedError| !e.is_fatal(),
                &self.config.retry_policy,
                self.reporter.as_ref(),
            )
            .await?;

            progress.integration = Some(integration.reference());
            progress.set_status(UnitStatus::Integrated);
            progress.workspace = None;
            state.units.insert(unit.id.clone(), progress);
            state.touch();
            self.store.save(state).await?;
            info!(unit = %unit.id, integration = %integration.reference(), "Unit integrated");

            // The proposed branch outlives its working copy.
            let mut proposed = workspace;
            proposed.status = WorkspaceStatus::Proposed;
            if let Err(err) = vcs.cleanup_workspace(&proposed).await {
                warn!(unit = %unit.id, "Failed to clean up workspace: {}", err);
            }
        }
        Ok(())
    }

    async fn acquire_workspace(&self, vcs: &dyn VersionControl, unit_id: &str) -> Result<Workspace> {
        match vcs.create_workspace(unit_id).await {
            Ok(workspace) => Ok(workspace),
            Err(VcsError::WorkspaceAlreadyExists(_)) => vcs
                .list_workspaces()
                .await?
                .into_iter()
                .find(|w| w.unit_id == unit_id)
                .ok_or_else(|| {
                    ClassifiedError::fatal(
                        ErrorCode::SourceControl,
                        format!("workspace for unit '{}' exists but cannot be listed", unit_id),
                    )
                }),
            Err(err) => Err(err.into()),
        }
    }

    /// Invoke a worker under the retry policy, recording every attempt.
    ///
    /// Exhausting the retries raises a failure escalation before the error
    /// is returned.
    async fn delegate(
        &self,
        state: &mut WorkflowState,
        index: usize,
        role: &str,
        task: &str,
        context: &WorkerContext,
        unit_id: Option<&str>,
    ) -> Result<WorkerOutput> {
        let project_id = state.project_id.clone();
        let log: Mutex<Vec<WorkerActivity>> = Mutex::new(Vec::new());

        let result = {
            let log = &log;
            let project = project_id.as_str();
            execute_with_retry(
                move |attempt| async move {
                    let mut activity =
                        WorkerActivity::started(role, excerpt(task), index, attempt);
                    if let Some(unit) = unit_id {
                        activity = activity.for_unit(unit);
                    }
                    let result = self.workers.invoke(role, task, context).await;
                    let activity = match &result {
                        Ok(output) => activity.complete(output.output_ref.clone()),
                        Err(err) => activity.fail(err.message.clone()),
                    };
                    log.lock().await.push(activity);
                    self.emit(Event::WorkerAttempt {
                        project_id: project.to_string(),
                        step: index,
                        worker: role.to_string(),
                        attempt,
                        success: result.is_ok(),
                    });
                    result
                },
                |e: &ClassifiedError| !e.is_fatal(),
                &self.config.retry_policy,
                self.reporter.as_ref(),
            )
            .await
        };

        for activity in log.into_inner() {
            state.record_activity(activity);
        }

        let err = match result {
            Ok(output) => return Ok(output),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => err,
        };

        let attempts = err.retry_count + 1;
        let escalation = Escalation::new(
            &state.project_id,
            &state.workflow,
            index,
            EscalationKind::Failure,
            format!(
                "Worker '{}' failed {} times on step {}. Reply 'retry' to run the step again, \
                 'skip' to continue without it, or anything else to abort.",
                role, attempts, index
            ),
        )
        .with_reasoning(err.message.clone(), 0.0)
        .with_options(vec!["retry".to_string(), "skip".to_string(), "abort".to_string()])
        .with_priority(Priority::High);
        self.escalations.add(&escalation).await?;
        state.pending_escalation = Some(PendingEscalation {
            escalation_id: escalation.id,
            step_index: index,
            kind: EscalationKind::Failure,
        });

        let message = format!("worker '{}' still failing after {} attempts", role, attempts);
        Err(err
            .into_fatal(ErrorCode::RetriesExhausted, message)
            .with_context("escalation_id", escalation.id))
    }
}

#[async_trait]
impl ResumeTarget for Interpreter {
    async fn awaits(&self, escalation: &Escalation) -> Result<bool> {
        let waiting_on = self
            .store
            .current(&escalation.project_id)
            .await?
            .and_then(|state| state.pending_escalation)
            .map(|pending| pending.escalation_id);
        Ok(waiting_on == Some(escalation.id))
    }

    async fn apply_response(&self, escalation: &Escalation, response: &str) -> Result<()> {
        let definition = self.definition_for(&escalation.workflow).await?;
        let state = self.require_state(&escalation.project_id).await?;

        match &state.pending_escalation {
            Some(pending) if pending.escalation_id == escalation.id => {
                self.apply(&definition, state, escalation.step_index, response)
                    .await?;
                Ok(())
            }
            _ => Err(ClassifiedError::fatal(
                ErrorCode::EscalationNotPending,
                format!("run is not waiting on escalation {}", escalation.id),
            )
            .with_context("escalation_id", escalation.id)
            .at_step(&state.project_id, state.current_step)),
        }
    }

    async fn continue_run(&self, escalation: &Escalation) -> Result<RunOutcome> {
        let definition = self.definition_for(&escalation.workflow).await?;
        let state = self.require_state(&escalation.project_id).await?;
        self.continue_state(&definition, state).await
    }
}

fn apply_action(action: &ActionStep, state: &mut WorkflowState) -> Result<()> {
    for (name, value) in &action.set {
        let resolved = resolve_value(value, &state.variables)?;
        state.variables.insert(name.clone(), resolved);
    }

    for name in &action.increment {
        let current = match state.variables.get(name) {
            None => 0,
            Some(value) => value.as_i64().ok_or_else(|| {
                ClassifiedError::fatal(
                    ErrorCode::InvalidState,
                    format!("cannot increment '{}': {} is not an integer", name, value),
                )
            })?,
        };
        state.variables.insert(name.clone(), Value::from(current + 1));
    }
    Ok(())
}

async fn write_artifact(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error("create", parent, e))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| io_error("write", path, e))
}

fn is_affirmative(response: &str) -> bool {
    let response = response.to_ascii_lowercase();
    AFFIRMATIVE.contains(&response.as_str())
}

fn excerpt(task: &str) -> String {
    let line = task.lines().next().unwrap_or_default();
    if line.chars().count() <= ACTION_EXCERPT {
        return line.to_string();
    }
    let cut: String = line.chars().take(ACTION_EXCERPT - 3).collect();
    format!("{}...", cut)
}
