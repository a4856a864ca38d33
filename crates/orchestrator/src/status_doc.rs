//! Human-readable status document kept in lockstep with `state.json`.

use std::fmt::Write;

use autopilot_core::{ActivityOutcome, WorkflowState};

use crate::template::display_value;

const RECENT_ACTIVITY: usize = 10;
const MAX_VALUE_WIDTH: usize = 80;

/// Render the markdown status document for a state.
pub fn render_status(state: &WorkflowState) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# {}\n", state.workflow_name);
    let _ = writeln!(out, "- **Project:** {}", state.project_id);
    let _ = writeln!(out, "- **Workflow:** `{}`", state.workflow);
    let _ = writeln!(out, "- **Phase:** {}", state.phase.as_str());
    let _ = writeln!(out, "- **Status:** {}", state.status.as_str());
    let _ = writeln!(
        out,
        "- **Step:** {}/{}",
        state.current_step, state.total_steps
    );
    let _ = writeln!(out, "- **Started:** {}", state.started_at.to_rfc3339());
    let _ = writeln!(out, "- **Updated:** {}", state.updated_at.to_rfc3339());
    if let Some(done) = state.completed_at {
        let _ = writeln!(out, "- **Completed:** {}", done.to_rfc3339());
    }

    if let Some(pending) = &state.pending_escalation {
        let _ = writeln!(out, "\n## Waiting on a human\n");
        let _ = writeln!(
            out,
            "{} escalation `{}` at step {}. Answer it to resume.",
            pending.kind.as_str(),
            pending.escalation_id,
            pending.step_index
        );
    }

    if let Some(error) = &state.last_error {
        let _ = writeln!(out, "\n## Last error\n");
        let _ = writeln!(
            out,
            "`{}` ({}): {}",
            error.code.as_str(),
            error.kind.as_str(),
            error.message
        );
    }

    if !state.units.is_empty() {
        let _ = writeln!(out, "\n## Units of work\n");
        let _ = writeln!(out, "| Unit | Status | Integration |");
        let _ = writeln!(out, "|------|--------|-------------|");
        for unit in state.units.values() {
            let _ = writeln!(
                out,
                "| {} | {} | {} |",
                unit.unit_id,
                unit.status.as_str(),
                unit.integration.as_deref().unwrap_or("-")
            );
        }
    }

    let recent = state.recent_activity(RECENT_ACTIVITY);
    if !recent.is_empty() {
        let _ = writeln!(out, "\n## Recent activity\n");
        let _ = writeln!(out, "| Step | Worker | Attempt | Outcome | Action |");
        let _ = writeln!(out, "|------|--------|---------|---------|--------|");
        for activity in recent {
            let outcome = match activity.outcome {
                ActivityOutcome::Started => "started",
                ActivityOutcome::Completed => "completed",
                ActivityOutcome::Failed => "failed",
            };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} |",
                activity.step_index,
                activity.worker,
                activity.attempt,
                outcome,
                shorten(&activity.action.replace('\n', " "))
            );
        }
    }

    if !state.variables.is_empty() {
        let _ = writeln!(out, "\n## Variables\n");
        for (name, value) in &state.variables {
            let _ = writeln!(out, "- `{}`: {}", name, shorten(&display_value(value)));
        }
    }

    out
}

fn shorten(text: &str) -> String {
    if text.chars().count() <= MAX_VALUE_WIDTH {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_VALUE_WIDTH - 3).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopilot_core::{
        ActionStep, RunStatus, Step, StepKind, UnitProgress, WorkerActivity, WorkflowDefinition,
    };
    use serde_json::json;

    fn state() -> WorkflowState {
        let def = WorkflowDefinition::new(
            "Planning",
            vec![Step::new(StepKind::Action(ActionStep::default()))],
        );
        WorkflowState::new("acme", "planning.yaml", &def)
    }

    #[test]
    fn test_renders_header() {
        let doc = render_status(&state());
        assert!(doc.starts_with("# Planning"));
        assert!(doc.contains("- **Status:** running"));
        assert!(doc.contains("- **Step:** 0/1"));
        assert!(!doc.contains("## Recent activity"));
    }

    #[test]
    fn test_renders_sections() {
        let mut state = state();
        state.status = RunStatus::Completed;
        state.variables.insert("database".into(), json!("postgres"));
        state.variables.insert("notes".into(), json!("x".repeat(200)));
        state.record_activity(WorkerActivity::started("dev", "build api", 0, 1).complete(None));
        state
            .units
            .insert("a".into(), UnitProgress::new("a", 0));

        let doc = render_status(&state);
        assert!(doc.contains("## Units of work"));
        assert!(doc.contains("| 0 | dev | 1 | completed | build api |"));
        assert!(doc.contains("- `database`: postgres"));
        assert!(doc.contains("..."));
    }
}
