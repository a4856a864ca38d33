use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::escalation::EscalationKind;
use crate::domain::workflow::{Phase, WorkflowDefinition};
use crate::error::ErrorRecord;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Paused,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ActivityOutcome {
    Started,
    Completed,
    Failed,
}

/// One worker invocation attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct WorkerActivity {
    pub worker: String,
    pub action: String,
    pub step_index: usize,
    /// 1-based attempt number within the step.
    pub attempt: u32,
    #[serde(default)]
    pub unit_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: ActivityOutcome,
    #[serde(default)]
    pub output_ref: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkerActivity {
    pub fn started(
        worker: impl Into<String>,
        action: impl Into<String>,
        step_index: usize,
        attempt: u32,
    ) -> Self {
        Self {
            worker: worker.into(),
            action: action.into(),
            step_index,
            attempt,
            unit_id: None,
            started_at: Utc::now(),
            ended_at: None,
            outcome: ActivityOutcome::Started,
            output_ref: None,
            error: None,
        }
    }

    pub fn for_unit(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = Some(unit_id.into());
        self
    }

    pub fn complete(mut self, output_ref: Option<String>) -> Self {
        self.outcome = ActivityOutcome::Completed;
        self.ended_at = Some(Utc::now());
        self.output_ref = output_ref;
        self
    }

    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.outcome = ActivityOutcome::Failed;
        self.ended_at = Some(Utc::now());
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    #[default]
    Pending,
    InProgress,
    Integrated,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Integrated => "integrated",
            Self::Failed => "failed",
        }
    }
}

/// Progress of one unit of work inside an implementation-phase delegate step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct UnitProgress {
    pub unit_id: String,
    pub step_index: usize,
    pub status: UnitStatus,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub integration: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl UnitProgress {
    pub fn new(unit_id: impl Into<String>, step_index: usize) -> Self {
        Self {
            unit_id: unit_id.into(),
            step_index,
            status: UnitStatus::Pending,
            workspace: None,
            integration: None,
            updated_at: Utc::now(),
        }
    }

    pub fn set_status(&mut self, status: UnitStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// The escalation a paused or failed run is waiting on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingEscalation {
    pub escalation_id: Uuid,
    pub step_index: usize,
    pub kind: EscalationKind,
}

/// Durable progress of one workflow run.
///
/// `current_step` is the resumption point: it only moves after the step's
/// effects have been checkpointed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    pub project_id: String,
    /// Path or identity of the active definition.
    pub workflow: String,
    pub workflow_name: String,
    #[serde(default)]
    pub phase: Phase,
    pub current_step: usize,
    pub total_steps: usize,
    pub status: RunStatus,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub activity: Vec<WorkerActivity>,
    #[serde(default)]
    pub units: BTreeMap<String, UnitProgress>,
    #[serde(default)]
    pub pending_escalation: Option<PendingEscalation>,
    /// Steps a human confirmed that have not executed yet.
    #[serde(default)]
    pub confirmed_steps: BTreeSet<usize>,
    #[serde(default)]
    pub last_error: Option<ErrorRecord>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    /// Fresh state positioned at the first step, seeded with the definition's defaults.
    pub fn new(
        project_id: impl Into<String>,
        workflow: impl Into<String>,
        definition: &WorkflowDefinition,
    ) -> Self {
        let now = Utc::now();
        Self {
            project_id: project_id.into(),
            workflow: workflow.into(),
            workflow_name: definition.name.clone(),
            phase: definition.phase,
            current_step: 0,
            total_steps: definition.len(),
            status: RunStatus::Running,
            variables: definition.variables.clone(),
            activity: Vec::new(),
            units: BTreeMap::new(),
            pending_escalation: None,
            confirmed_steps: BTreeSet::new(),
            last_error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_finished(&self) -> bool {
        self.current_step >= self.total_steps
    }

    pub fn record_activity(&mut self, activity: WorkerActivity) {
        self.activity.push(activity);
    }

    /// Most recent activity records, newest last.
    pub fn recent_activity(&self, limit: usize) -> &[WorkerActivity] {
        let start = self.activity.len().saturating_sub(limit);
        &self.activity[start..]
    }

    pub fn activity_for_step(&self, step_index: usize) -> Vec<&WorkerActivity> {
        self.activity
            .iter()
            .filter(|a| a.step_index == step_index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::workflow::{ActionStep, Step, StepKind};

    fn definition() -> WorkflowDefinition {
        let mut wf = WorkflowDefinition::new(
            "plan",
            vec![
                Step::new(StepKind::Action(ActionStep::default())),
                Step::new(StepKind::Action(ActionStep::default())),
            ],
        )
        .with_phase(Phase::Planning);
        wf.variables.insert("team".into(), Value::from("core"));
        wf
    }

    #[test]
    fn test_new_state_is_seeded() {
        let state = WorkflowState::new("proj", "plan.yaml", &definition());
        assert_eq!(state.current_step, 0);
        assert_eq!(state.total_steps, 2);
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.phase, Phase::Planning);
        assert_eq!(state.variables["team"], "core");
        assert!(!state.is_finished());
    }

    #[test]
    fn test_recent_activity_window() {
        let mut state = WorkflowState::new("proj", "plan.yaml", &definition());
        for attempt in 1..=5 {
            state.record_activity(WorkerActivity::started("dev", "build", 0, attempt).complete(None));
        }
        let recent = state.recent_activity(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].attempt, 5);
        assert_eq!(state.recent_activity(50).len(), 5);
    }

    #[test]
    fn test_activity_outcomes() {
        let failed = WorkerActivity::started("dev", "build", 1, 1).fail("boom");
        assert_eq!(failed.outcome, ActivityOutcome::Failed);
        assert!(failed.ended_at.is_some());

        let done = WorkerActivity::started("dev", "build", 1, 2)
            .for_unit("story-1")
            .complete(Some("out.md".into()));
        assert_eq!(done.outcome, ActivityOutcome::Completed);
        assert_eq!(done.unit_id.as_deref(), Some("story-1"));
    }

    #[test]
    fn test_state_json_roundtrip() {
        let mut state = WorkflowState::new("proj", "plan.yaml", &definition());
        state.confirmed_steps.insert(1);
        state
            .units
            .insert("s1".into(), UnitProgress::new("s1", 0));
        let json = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
