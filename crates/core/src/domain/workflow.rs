//! Workflow definitions: an ordered list of typed steps.
//!
//! Definitions are authored in YAML:
//!
//! ```yaml
//! name: "Solutioning"
//! phase: solutioning
//! variables:
//!   reviewer: "architect"
//! steps:
//!   - id: pick-db
//!     kind: decision
//!     question: "Which database should the service use?"
//!     variable: database
//!   - kind: delegate
//!     worker: architect
//!     task: "Write the architecture using ${database}"
//!     inputs: [database]
//!   - kind: emit-artifact
//!     template: architecture.md
//!     output: docs/architecture.md
//!     if: "${database} != ''"
//! ```
//!
//! Step indices are the resumption points of a run, so a definition is
//! never reordered once a run against it has begun.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::escalation::Priority;
use crate::error::{ClassifiedError, ErrorCode, Result};

/// Delivery phase a workflow belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Analysis,
    Planning,
    Solutioning,
    Implementation,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Planning => "planning",
            Self::Solutioning => "solutioning",
            Self::Implementation => "implementation",
        }
    }
}

/// Top-level workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub phase: Phase,

    /// Initial variable values, overridden by archived and run-time values.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,

    pub steps: Vec<Step>,
}

/// One step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Optional label, usable as a jump target.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    /// Guard expression; the step is skipped when it evaluates to false.
    #[serde(default, rename = "if")]
    pub guard: Option<String>,

    /// Ask a human before executing unless running unattended.
    #[serde(default)]
    pub confirm: bool,

    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            id: None,
            name: None,
            guard: None,
            confirm: false,
            kind,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Human label for logs and status documents.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.id.clone())
            .unwrap_or_else(|| self.kind.as_str().to_string())
    }
}

/// Closed set of step kinds. New kinds extend this enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepKind {
    Action(ActionStep),
    Decision(DecisionStep),
    Delegate(DelegateStep),
    EmitArtifact(ArtifactStep),
    Jump(JumpStep),
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Action(_) => "action",
            Self::Decision(_) => "decision",
            Self::Delegate(_) => "delegate",
            Self::EmitArtifact(_) => "emit-artifact",
            Self::Jump(_) => "jump",
        }
    }
}

/// Local effect on variables. Never calls out and is never retried.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionStep {
    /// Variables to assign; string values are resolved as templates.
    #[serde(default)]
    pub set: BTreeMap<String, Value>,

    /// Numeric variables to increment by one (missing counts as zero).
    #[serde(default)]
    pub increment: Vec<String>,
}

/// A question resolved autonomously or escalated to a human.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionStep {
    pub question: String,

    /// Variable receiving the answer.
    pub variable: String,

    #[serde(default)]
    pub options: Vec<String>,

    #[serde(default)]
    pub priority: Priority,
}

/// Work handed to an external worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateStep {
    /// Worker role to invoke.
    pub worker: String,

    /// Task template.
    pub task: String,

    /// Variables copied into the worker's fresh context.
    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub params: BTreeMap<String, Value>,

    /// Variable holding a list of units of work, each delegated in its own workspace.
    #[serde(default)]
    pub units: Option<String>,
}

/// Rendered output written to the artifacts directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactStep {
    pub template: String,

    /// Output path relative to the artifacts directory (template allowed).
    pub output: String,

    /// Variable receiving the written path.
    #[serde(default)]
    pub variable: Option<String>,
}

/// Unconditional jump; combine with a guard for branches and loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JumpStep {
    pub target: StepRef,
}

/// A step addressed by index or by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepRef {
    Index(usize),
    Label(String),
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: None,
            phase: Phase::default(),
            variables: BTreeMap::new(),
            steps,
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Parse and validate a definition from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definition: Self = serde_yaml::from_str(yaml).map_err(|e| {
            ClassifiedError::fatal(
                ErrorCode::InvalidDefinition,
                format!("failed to parse workflow YAML: {}", e),
            )
        })?;
        definition.validate()?;
        Ok(definition)
    }

    /// Load a definition from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClassifiedError::fatal(
                ErrorCode::InvalidDefinition,
                format!("failed to read workflow file: {}", e),
            )
            .with_context("path", path.display().to_string())
        })?;
        Self::from_yaml(&content)
            .map_err(|e| e.with_context("path", path.display().to_string()))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Resolve a jump target to an index. `len()` is a valid target meaning "finish".
    pub fn resolve_target(&self, target: &StepRef) -> Option<usize> {
        match target {
            StepRef::Index(index) if *index <= self.steps.len() => Some(*index),
            StepRef::Index(_) => None,
            StepRef::Label(label) => self
                .steps
                .iter()
                .position(|s| s.id.as_deref() == Some(label.as_str())),
        }
    }

    /// Structural checks run before every run.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(invalid(format!("workflow '{}' has no steps", self.name)));
        }

        let mut seen = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if let Some(id) = &step.id {
                if !seen.insert(id.as_str()) {
                    return Err(invalid(format!("duplicate step id '{}'", id))
                        .with_context("step_index", index));
                }
            }

            match &step.kind {
                StepKind::Jump(jump) => {
                    if self.resolve_target(&jump.target).is_none() {
                        return Err(invalid(format!(
                            "jump target {:?} does not resolve to a step",
                            jump.target
                        ))
                        .with_context("step_index", index));
                    }
                }
                StepKind::Decision(decision) if decision.variable.trim().is_empty() => {
                    return Err(invalid("decision step needs a target variable")
                        .with_context("step_index", index));
                }
                StepKind::Delegate(delegate) if delegate.worker.trim().is_empty() => {
                    return Err(invalid("delegate step needs a worker role")
                        .with_context("step_index", index));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ClassifiedError {
    ClassifiedError::fatal(ErrorCode::InvalidDefinition, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name: "Solutioning"
phase: solutioning
variables:
  reviewer: architect
steps:
  - id: pick-db
    kind: decision
    question: "Which database?"
    variable: database
    options: [postgres, sqlite]
  - kind: delegate
    worker: architect
    task: "Design with ${database}"
    inputs: [database]
    confirm: true
  - kind: emit-artifact
    template: architecture.md
    output: docs/architecture.md
    if: "${database} != ''"
  - kind: action
    set:
      done: true
    increment: [rounds]
  - kind: jump
    target: pick-db
    if: "${rounds} == 0"
"#;

    #[test]
    fn test_parse_all_step_kinds() {
        let wf = WorkflowDefinition::from_yaml(SAMPLE).unwrap();
        assert_eq!(wf.name, "Solutioning");
        assert_eq!(wf.phase, Phase::Solutioning);
        assert_eq!(wf.len(), 5);

        let kinds: Vec<&str> = wf.steps.iter().map(|s| s.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["decision", "delegate", "emit-artifact", "action", "jump"]
        );
        assert!(wf.steps[1].confirm);
        assert_eq!(wf.steps[2].guard.as_deref(), Some("${database} != ''"));

        match &wf.steps[0].kind {
            StepKind::Decision(d) => {
                assert_eq!(d.variable, "database");
                assert_eq!(d.options.len(), 2);
                assert_eq!(d.priority, Priority::Normal);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_resolve_targets() {
        let wf = WorkflowDefinition::from_yaml(SAMPLE).unwrap();
        assert_eq!(wf.resolve_target(&StepRef::Label("pick-db".into())), Some(0));
        assert_eq!(wf.resolve_target(&StepRef::Index(5)), Some(5));
        assert_eq!(wf.resolve_target(&StepRef::Index(6)), None);
        assert_eq!(wf.resolve_target(&StepRef::Label("nope".into())), None);
    }

    #[test]
    fn test_rejects_unknown_jump_target() {
        let yaml = r#"
name: broken
steps:
  - kind: jump
    target: missing
"#;
        let err = WorkflowDefinition::from_yaml(yaml).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidDefinition);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let wf = WorkflowDefinition::new(
            "dup",
            vec![
                Step::new(StepKind::Action(ActionStep::default())).with_id("a"),
                Step::new(StepKind::Action(ActionStep::default())).with_id("a"),
            ],
        );
        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_workflow() {
        let wf = WorkflowDefinition::new("empty", Vec::new());
        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_unknown_kind_is_parse_error() {
        let yaml = r#"
name: odd
steps:
  - kind: teleport
"#;
        assert!(WorkflowDefinition::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::Planning.as_str(), "planning");
        assert_eq!(
            serde_json::to_string(&Phase::Implementation).unwrap(),
            "\"implementation\""
        );
    }
}
