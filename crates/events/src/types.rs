//! Event types published by the execution core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// Position in the publishing bus's stream (assigned on publish)
    #[serde(default)]
    pub sequence: u64,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All events emitted by interpreters and escalation queues
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Run lifecycle
    #[serde(rename = "run.started")]
    RunStarted {
        project_id: String,
        workflow: String,
        step: usize,
    },

    #[serde(rename = "run.step_completed")]
    StepCompleted {
        project_id: String,
        step: usize,
        kind: String,
        next_step: usize,
    },

    /// Suspended on an escalation
    #[serde(rename = "run.suspended")]
    RunSuspended {
        project_id: String,
        step: usize,
        escalation_id: Uuid,
    },

    /// Cooperative pause at a step boundary
    #[serde(rename = "run.paused")]
    RunPaused { project_id: String, step: usize },

    #[serde(rename = "run.completed")]
    RunCompleted {
        project_id: String,
        workflow: String,
    },

    #[serde(rename = "run.failed")]
    RunFailed {
        project_id: String,
        step: usize,
        code: String,
        message: String,
    },

    // Workers
    #[serde(rename = "worker.attempt")]
    WorkerAttempt {
        project_id: String,
        step: usize,
        worker: String,
        attempt: u32,
        success: bool,
    },

    // Escalations
    #[serde(rename = "escalation.created")]
    EscalationCreated {
        project_id: String,
        escalation_id: Uuid,
        step: usize,
        question: String,
        priority: String,
    },

    #[serde(rename = "escalation.resolved")]
    EscalationResolved {
        project_id: String,
        escalation_id: Uuid,
        response: String,
    },
}

impl Event {
    /// Get the project this event belongs to
    pub fn project_id(&self) -> &str {
        match self {
            Event::RunStarted { project_id, .. }
            | Event::StepCompleted { project_id, .. }
            | Event::RunSuspended { project_id, .. }
            | Event::RunPaused { project_id, .. }
            | Event::RunCompleted { project_id, .. }
            | Event::RunFailed { project_id, .. }
            | Event::WorkerAttempt { project_id, .. }
            | Event::EscalationCreated { project_id, .. }
            | Event::EscalationResolved { project_id, .. } => project_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_creation() {
        let envelope = EventEnvelope::new(Event::RunPaused {
            project_id: "proj".to_string(),
            step: 3,
        });

        assert!(!envelope.id.is_nil());
        assert_eq!(envelope.sequence, 0);
        assert!(envelope.timestamp <= Utc::now());
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::StepCompleted {
            project_id: "proj".to_string(),
            step: 1,
            kind: "delegate".to_string(),
            next_step: 2,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("run.step_completed"));
        assert!(json.contains("next_step"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"escalation.resolved","project_id":"p","escalation_id":"550e8400-e29b-41d4-a716-446655440000","response":"approve"}"#;
        let event: Event = serde_json::from_str(json).unwrap();

        match event {
            Event::EscalationResolved { response, .. } => assert_eq!(response, "approve"),
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_project_id() {
        let event = Event::RunCompleted {
            project_id: "alpha".to_string(),
            workflow: "plan.yaml".to_string(),
        };
        assert_eq!(event.project_id(), "alpha");
    }
}
